//! secuml-core: configuration, transactional sessions and the experiment
//! lifecycle for SecuML.
//!
//! The central contract: an experiment runs inside exactly one [`Session`].
//! The [`Controller`] commits it when the run succeeds and rolls it back on
//! any failure, so the store never holds a partially written experiment.

pub mod classification;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod session;
pub mod storage;

pub use config::{Configuration, ConnectionDescriptor, ExperimentDefaults};
pub use error::{CoreError, Error, ExperimentError};
pub use lifecycle::{Controller, Experiment, Phase, RunReport, DOMAIN_EXIT_CODE};
pub use models::{ExperimentRecord, UserAction};
pub use session::{Record, Session, SessionState, SessionStats, Store};
