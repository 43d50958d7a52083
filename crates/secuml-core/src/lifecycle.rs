//! Experiment lifecycle controller.
//!
//! ```text
//! Created ──load conf, open session──▶ Configured ──prepare──▶ Running ──run, commit──▶ Succeeded
//!    │                                     │                     │
//!    └─────────────────────────────────────┴─────────────────────┴──────────────────────▶ Failed
//! ```
//!
//! The controller owns the session for the whole run. Every failure after
//! the session is opened rolls it back before the error leaves the
//! controller, whatever the error class. Panics in the experiment body roll
//! back too and then keep unwinding with their original payload.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::{Duration, Instant};

use colored::Colorize;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::error::{CoreError, Error, Result};
use crate::session::{self, Session, SessionStats};

/// Exit status of a process that stopped on a domain error.
pub const DOMAIN_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Configured,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Created => "CREATED",
            Phase::Configured => "CONFIGURED",
            Phase::Running => "RUNNING",
            Phase::Succeeded => "SUCCEEDED",
            Phase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// An experiment the controller can drive.
pub trait Experiment {
    fn kind(&self) -> &str;

    /// Validate and bind the run parameters. Errors here are reported as
    /// configuration errors of the experiment.
    fn prepare(&mut self, conf: &Configuration) -> Result<()>;

    /// Run the experiment, staging its results in `session`. The controller
    /// commits on success; the experiment never commits or rolls back itself.
    fn run(&mut self, conf: &Configuration, session: &mut Session) -> Result<()>;
}

type Opener = Box<dyn Fn(&Configuration) -> std::result::Result<Session, CoreError>>;

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub kind: String,
    pub session: SessionStats,
    pub elapsed: Duration,
}

pub struct Controller<E> {
    experiment: E,
    phase: Phase,
    opener: Opener,
}

impl<E: Experiment> Controller<E> {
    pub fn new(experiment: E) -> Self {
        Self {
            experiment,
            phase: Phase::Created,
            opener: Box::new(session::open),
        }
    }

    /// Replace how the session is opened from the configuration.
    pub fn with_opener(
        mut self,
        opener: impl Fn(&Configuration) -> std::result::Result<Session, CoreError> + 'static,
    ) -> Self {
        self.opener = Box::new(opener);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn experiment(&self) -> &E {
        &self.experiment
    }

    pub fn into_experiment(self) -> E {
        self.experiment
    }

    /// Load the configuration from `source` (or the default source) and run.
    pub fn execute(&mut self, source: Option<&Path>) -> Result<RunReport> {
        self.ensure_fresh()?;
        match Configuration::load(source) {
            Ok(conf) => self.execute_with(&conf),
            Err(e) => Err(self.fail_unopened(e.into())),
        }
    }

    /// Run with an already loaded configuration.
    pub fn execute_with(&mut self, conf: &Configuration) -> Result<RunReport> {
        self.ensure_fresh()?;
        let started = Instant::now();
        let mut session = match (self.opener)(conf) {
            Ok(session) => session,
            Err(e) => return Err(self.fail_unopened(e.into())),
        };
        self.transition(Phase::Configured);

        let outcome = self
            .drive(conf, &mut session)
            .and_then(|()| session.commit().map_err(Error::from));
        if let Err(err) = outcome {
            return Err(self.fail(session, err));
        }

        match session.close() {
            Ok(stats) => {
                self.transition(Phase::Succeeded);
                let report = RunReport {
                    kind: self.experiment.kind().to_string(),
                    session: stats,
                    elapsed: started.elapsed(),
                };
                info!(
                    kind = %report.kind,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "experiment succeeded"
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(Phase::Failed);
                Err(e.into())
            }
        }
    }

    fn drive(&mut self, conf: &Configuration, session: &mut Session) -> Result<()> {
        self.guarded(session, |experiment, _| experiment.prepare(conf))?;
        self.transition(Phase::Running);
        self.guarded(session, |experiment, session| experiment.run(conf, session))
    }

    fn guarded(
        &mut self,
        session: &mut Session,
        body: impl FnOnce(&mut E, &mut Session) -> Result<()>,
    ) -> Result<()> {
        let experiment = &mut self.experiment;
        match panic::catch_unwind(AssertUnwindSafe(|| body(experiment, &mut *session))) {
            Ok(result) => result,
            Err(payload) => {
                session.rollback();
                self.transition(Phase::Failed);
                error!(session = %session.id(), "experiment panicked, session rolled back");
                panic::resume_unwind(payload)
            }
        }
    }

    fn fail(&mut self, mut session: Session, err: Error) -> Error {
        session.rollback();
        if let Err(e) = session.close() {
            warn!(error = %e, "failed to release session after rollback");
        }
        self.fail_unopened(err)
    }

    fn fail_unopened(&mut self, err: Error) -> Error {
        self.transition(Phase::Failed);
        if err.is_domain() {
            warn!(kind = %self.experiment.kind(), error = %err, "experiment failed");
        } else {
            error!(kind = %self.experiment.kind(), error = ?err, "experiment failed unexpectedly");
        }
        err
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.phase == Phase::Created {
            Ok(())
        } else {
            Err(Error::unexpected(anyhow::anyhow!(
                "experiment controller already executed (phase {})",
                self.phase
            )))
        }
    }

    fn transition(&mut self, next: Phase) {
        debug!(from = %self.phase, to = %next, "lifecycle transition");
        self.phase = next;
    }
}

/// One-line, attention-drawing rendering of a domain error.
pub fn diagnostic(err: &Error) -> String {
    let line = err.to_string().lines().collect::<Vec<_>>().join(" ");
    line.red().bold().to_string()
}
