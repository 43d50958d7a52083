//! Lifecycle tests: commit on success, rollback on every failure path.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use secuml_core::error::Result;
use secuml_core::session::MemoryBackend;
use secuml_core::{
    Configuration, ConnectionDescriptor, Controller, CoreError, Error, Experiment,
    ExperimentError, Phase, Session, SessionStats, Store,
};
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Outcome {
    Succeed,
    RejectParams,
    DomainError,
    UnexpectedError,
    Panic,
}

struct Scripted {
    outcome: Outcome,
    ran: bool,
}

impl Scripted {
    fn new(outcome: Outcome) -> Self {
        Self { outcome, ran: false }
    }
}

impl Experiment for Scripted {
    fn kind(&self) -> &str {
        "Scripted"
    }

    fn prepare(&mut self, _conf: &Configuration) -> Result<()> {
        match self.outcome {
            Outcome::RejectParams => {
                Err(ExperimentError::Config("num_folds must be at least 2".to_string()).into())
            }
            _ => Ok(()),
        }
    }

    fn run(&mut self, _conf: &Configuration, session: &mut Session) -> Result<()> {
        self.ran = true;
        session.put_document("experiments/1/experiment.yaml", &"partial")?;
        session.put_document("experiments/1/training/metrics.yaml", &0.5)?;
        match self.outcome {
            Outcome::Succeed | Outcome::RejectParams => Ok(()),
            Outcome::DomainError => Err(CoreError::AtLeastTwoClasses.into()),
            Outcome::UnexpectedError => Err(Error::unexpected(
                anyhow::anyhow!("feature matrix corrupted").context("while training"),
            )),
            Outcome::Panic => panic!("model exploded"),
        }
    }
}

fn memory_conf() -> Configuration {
    Configuration::new(ConnectionDescriptor::Memory, "input")
}

fn controller(outcome: Outcome) -> (Controller<Scripted>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let store = Store::from_backend(ConnectionDescriptor::Memory, backend.clone());
    let controller = Controller::new(Scripted::new(outcome)).with_opener(move |_| Ok(store.session()));
    (controller, backend)
}

#[test]
fn test_success_commits_once_then_closes() {
    let (mut controller, backend) = controller(Outcome::Succeed);
    let report = controller.execute_with(&memory_conf()).unwrap();

    assert_eq!(controller.phase(), Phase::Succeeded);
    assert_eq!(
        report.session,
        SessionStats {
            commits: 1,
            rollbacks: 0,
            closes: 1
        }
    );
    assert_eq!(report.kind, "Scripted");
    assert_eq!(backend.applied(), 1);
    assert_eq!(backend.len(), 2);
}

#[test]
fn test_domain_error_rolls_back() {
    let (mut controller, backend) = controller(Outcome::DomainError);
    let err = controller.execute_with(&memory_conf()).unwrap_err();

    assert!(err.is_domain());
    assert!(matches!(err, Error::Core(CoreError::AtLeastTwoClasses)));
    assert_eq!(controller.phase(), Phase::Failed);
    assert_eq!(backend.applied(), 0);
    assert!(backend.is_empty());
}

#[test]
fn test_invalid_params_fail_before_running() {
    let (mut controller, backend) = controller(Outcome::RejectParams);
    let err = controller.execute_with(&memory_conf()).unwrap_err();

    assert!(matches!(err, Error::Experiment(ExperimentError::Config(_))));
    assert_eq!(controller.phase(), Phase::Failed);
    assert!(!controller.experiment().ran);
    assert!(backend.is_empty());
}

#[test]
fn test_unexpected_error_rolls_back_and_keeps_cause() {
    let (mut controller, backend) = controller(Outcome::UnexpectedError);
    let err = controller.execute_with(&memory_conf()).unwrap_err();

    assert!(!err.is_domain());
    assert!(backend.is_empty());
    let Error::Unexpected(cause) = err else {
        panic!("expected an unexpected error");
    };
    let detail = format!("{cause:#}");
    assert!(detail.contains("while training"), "{detail}");
    assert!(detail.contains("feature matrix corrupted"), "{detail}");
}

#[test]
fn test_panic_rolls_back_and_resumes_unwinding() {
    let (mut controller, backend) = controller(Outcome::Panic);
    let conf = memory_conf();
    let payload = panic::catch_unwind(AssertUnwindSafe(|| controller.execute_with(&conf)))
        .expect_err("the panic should reach the caller");

    assert_eq!(payload.downcast_ref::<&str>(), Some(&"model exploded"));
    assert_eq!(controller.phase(), Phase::Failed);
    assert!(backend.is_empty());
}

#[test]
fn test_commit_failure_rolls_back() {
    let (mut controller, backend) = controller(Outcome::Succeed);
    backend.fail_next_apply("disk full");
    let err = controller.execute_with(&memory_conf()).unwrap_err();

    assert!(matches!(err, Error::Core(CoreError::Persistence(_))));
    assert_eq!(controller.phase(), Phase::Failed);
    assert!(backend.is_empty());
}

#[test]
fn test_unreachable_store_is_connection_error() {
    let tmp = TempDir::new().unwrap();
    let conf = Configuration::new(
        ConnectionDescriptor::File(tmp.path().join("no-such-store")),
        tmp.path(),
    );
    let mut controller = Controller::new(Scripted::new(Outcome::Succeed));
    let err = controller.execute_with(&conf).unwrap_err();

    assert!(matches!(err, Error::Core(CoreError::Connection { .. })));
    assert!(err.is_domain());
    assert_eq!(controller.phase(), Phase::Failed);
    assert!(!controller.experiment().ran);
}

#[test]
fn test_missing_configuration_source() {
    let tmp = TempDir::new().unwrap();
    let mut controller = Controller::new(Scripted::new(Outcome::Succeed));
    let err = controller
        .execute(Some(&tmp.path().join("absent.yaml")))
        .unwrap_err();

    assert!(matches!(err, Error::Core(CoreError::Configuration(_))));
    assert_eq!(controller.phase(), Phase::Failed);
}

#[test]
fn test_controller_runs_once() {
    let (mut controller, backend) = controller(Outcome::Succeed);
    controller.execute_with(&memory_conf()).unwrap();
    let err = controller.execute_with(&memory_conf()).unwrap_err();

    assert!(!err.is_domain());
    assert_eq!(controller.phase(), Phase::Succeeded);
    assert_eq!(backend.applied(), 1);
}

#[test]
fn test_diagnostic_is_single_line() {
    let err: Error = CoreError::Configuration("line one\nline two".to_string()).into();
    let line = secuml_core::lifecycle::diagnostic(&err);
    assert_eq!(line.lines().count(), 1);
    assert!(line.contains("line one line two"));
}
