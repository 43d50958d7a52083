//! Process-wide state for the web server.
//!
//! Startup fills a [`Bootstrap`] slot by slot, in a fixed order:
//! configuration, user-action logging, application, session factory. Once
//! every slot is set it is frozen into an [`AppContext`] that request
//! handlers share read-only.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use secuml_core::{Configuration, Session, Store};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("{0} is not set")]
    NotSet(Slot),

    #[error("{0} is already set")]
    AlreadySet(Slot),

    #[error("cannot set {slot} before {missing}")]
    OutOfOrder { slot: Slot, missing: Slot },
}

/// Bootstrap slots, in assignment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Configuration,
    UserActionLogging,
    Application,
    Session,
}

impl Slot {
    const ORDER: [Slot; 4] = [
        Slot::Configuration,
        Slot::UserActionLogging,
        Slot::Application,
        Slot::Session,
    ];
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Slot::Configuration => "configuration",
            Slot::UserActionLogging => "user action logging",
            Slot::Application => "application",
            Slot::Session => "session",
        })
    }
}

/// Identity of the running web application.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Application {
    pub name: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl Application {
    pub fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        }
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Bootstrap {
    configuration: Option<Configuration>,
    user_action_logging: Option<bool>,
    application: Option<Application>,
    store: Option<Store>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_set(&self, slot: Slot) -> bool {
        match slot {
            Slot::Configuration => self.configuration.is_some(),
            Slot::UserActionLogging => self.user_action_logging.is_some(),
            Slot::Application => self.application.is_some(),
            Slot::Session => self.store.is_some(),
        }
    }

    fn check_assignable(&self, slot: Slot) -> Result<(), BootstrapError> {
        if self.is_set(slot) {
            return Err(BootstrapError::AlreadySet(slot));
        }
        let missing = Slot::ORDER
            .into_iter()
            .take_while(|s| *s != slot)
            .find(|s| !self.is_set(*s));
        match missing {
            Some(missing) => Err(BootstrapError::OutOfOrder { slot, missing }),
            None => Ok(()),
        }
    }

    pub fn set_configuration(&mut self, conf: Configuration) -> Result<(), BootstrapError> {
        self.check_assignable(Slot::Configuration)?;
        self.configuration = Some(conf);
        Ok(())
    }

    pub fn set_user_action_logging(&mut self, enabled: bool) -> Result<(), BootstrapError> {
        self.check_assignable(Slot::UserActionLogging)?;
        self.user_action_logging = Some(enabled);
        Ok(())
    }

    pub fn set_application(&mut self, app: Application) -> Result<(), BootstrapError> {
        self.check_assignable(Slot::Application)?;
        self.application = Some(app);
        Ok(())
    }

    /// Set the store every request session is opened on.
    pub fn set_session(&mut self, store: Store) -> Result<(), BootstrapError> {
        self.check_assignable(Slot::Session)?;
        self.store = Some(store);
        Ok(())
    }

    pub fn configuration(&self) -> Result<&Configuration, BootstrapError> {
        self.configuration
            .as_ref()
            .ok_or(BootstrapError::NotSet(Slot::Configuration))
    }

    pub fn user_action_logging(&self) -> Result<bool, BootstrapError> {
        self.user_action_logging
            .ok_or(BootstrapError::NotSet(Slot::UserActionLogging))
    }

    pub fn application(&self) -> Result<&Application, BootstrapError> {
        self.application
            .as_ref()
            .ok_or(BootstrapError::NotSet(Slot::Application))
    }

    /// A fresh session on the configured store.
    pub fn session(&self) -> Result<Session, BootstrapError> {
        self.store
            .as_ref()
            .map(Store::session)
            .ok_or(BootstrapError::NotSet(Slot::Session))
    }

    pub fn finish(self) -> Result<AppContext, BootstrapError> {
        let Self {
            configuration,
            user_action_logging,
            application,
            store,
        } = self;
        Ok(AppContext {
            inner: Arc::new(Inner {
                configuration: configuration.ok_or(BootstrapError::NotSet(Slot::Configuration))?,
                user_action_logging: user_action_logging
                    .ok_or(BootstrapError::NotSet(Slot::UserActionLogging))?,
                application: application.ok_or(BootstrapError::NotSet(Slot::Application))?,
                store: store.ok_or(BootstrapError::NotSet(Slot::Session))?,
            }),
        })
    }
}

#[derive(Debug)]
struct Inner {
    configuration: Configuration,
    user_action_logging: bool,
    application: Application,
    store: Store,
}

/// Immutable server state, cloned into every handler.
#[derive(Debug, Clone)]
pub struct AppContext {
    inner: Arc<Inner>,
}

impl AppContext {
    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    pub fn user_action_logging(&self) -> bool {
        self.inner.user_action_logging
    }

    pub fn application(&self) -> &Application {
        &self.inner.application
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Start a unit of work for one request.
    pub fn session(&self) -> Session {
        self.inner.store.session()
    }
}

/// Load the configuration, connect to the store and freeze the context.
pub fn bootstrap(conf_path: Option<&Path>, user_exp: bool) -> anyhow::Result<AppContext> {
    let conf = Configuration::load(conf_path).context("loading SecuML configuration")?;
    let store = Store::connect(&conf).context("connecting to the store")?;

    let mut boot = Bootstrap::new();
    boot.set_configuration(conf)?;
    boot.set_user_action_logging(user_exp)?;
    boot.set_application(Application::new())?;
    boot.set_session(store)?;
    let ctx = boot.finish()?;

    info!(
        db = %ctx.store().descriptor(),
        user_exp = ctx.user_action_logging(),
        "server context ready"
    );
    Ok(ctx)
}

/// Configuration for the web server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}
