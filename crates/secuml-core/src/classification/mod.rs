//! Classification experiment.
//!
//! Trains a binary classifier on the annotated part of a dataset, monitors
//! it with stratified cross-validation, then scores the held-out test
//! instances (and an optional validation dataset) and raises alerts on the
//! most suspicious ones. Every result is staged in the session; the
//! lifecycle controller decides whether it is committed.

pub mod dataset;
pub mod model;
pub mod monitoring;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Configuration, ExperimentDefaults};
use crate::error::{Error, ExperimentError, Result};
use crate::lifecycle::Experiment;
use crate::models::{keys, ExperimentRecord};
use crate::session::Session;

pub use dataset::{Instances, Label};
pub use model::{Classifier, ModelKind};
pub use monitoring::{Alerts, PerformanceMetrics, Predictions};

pub const KIND: &str = "Classification";
pub const DEFAULT_MODEL: ModelKind = ModelKind::GaussianNb;
pub const DEFAULT_NUM_FOLDS: usize = 4;
pub const DEFAULT_TEST_SIZE: f64 = 0.25;

/// Run parameters as given on the command line. Unset values fall back to
/// the configuration defaults, then to the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationParams {
    pub project: String,
    pub dataset: String,
    pub model: Option<String>,
    pub num_folds: Option<usize>,
    pub test_size: Option<f64>,
    pub validation_dataset: Option<String>,
    pub alerts_threshold: Option<f64>,
}

/// Validated parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationConf {
    pub model: ModelKind,
    pub num_folds: usize,
    pub test_size: f64,
    pub validation_dataset: Option<String>,
    pub alerts_threshold: Option<f64>,
}

fn check_name(what: &str, name: &str) -> std::result::Result<(), ExperimentError> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ExperimentError::Config(format!("invalid {what} name '{name}'")));
    }
    Ok(())
}

impl ClassificationConf {
    pub fn resolve(
        params: &ClassificationParams,
        defaults: &ExperimentDefaults,
    ) -> std::result::Result<Self, ExperimentError> {
        check_name("project", &params.project)?;
        check_name("dataset", &params.dataset)?;
        if let Some(validation) = &params.validation_dataset {
            check_name("validation dataset", validation)?;
        }

        let model = match params.model.as_deref().or(defaults.model.as_deref()) {
            Some(name) => name.parse::<ModelKind>()?,
            None => DEFAULT_MODEL,
        };
        let num_folds = params
            .num_folds
            .or(defaults.num_folds)
            .unwrap_or(DEFAULT_NUM_FOLDS);
        if num_folds < 2 {
            return Err(ExperimentError::Config(format!(
                "num_folds must be at least 2, got {num_folds}"
            )));
        }
        let test_size = params
            .test_size
            .or(defaults.test_size)
            .unwrap_or(DEFAULT_TEST_SIZE);
        if !(test_size > 0.0 && test_size < 1.0) {
            return Err(ExperimentError::Config(format!(
                "test_size must lie in (0, 1), got {test_size}"
            )));
        }
        if let Some(threshold) = params.alerts_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ExperimentError::Config(format!(
                    "alerts_threshold must lie in [0, 1], got {threshold}"
                )));
            }
        }
        Ok(Self {
            model,
            num_folds,
            test_size,
            validation_dataset: params.validation_dataset.clone(),
            alerts_threshold: params.alerts_threshold,
        })
    }
}

/// What the classification run produced, for reporting.
#[derive(Debug, Clone)]
pub struct ClassificationSummary {
    pub experiment_id: u64,
    pub phases: Vec<(String, PerformanceMetrics)>,
    pub alerts: Option<usize>,
    pub training_time: Duration,
}

struct Bound {
    conf: ClassificationConf,
    train: Instances,
    test: Instances,
    validation: Option<Instances>,
}

pub struct ClassificationExperiment {
    params: ClassificationParams,
    bound: Option<Bound>,
    summary: Option<ClassificationSummary>,
}

impl ClassificationExperiment {
    pub fn new(params: ClassificationParams) -> Self {
        Self {
            params,
            bound: None,
            summary: None,
        }
    }

    pub fn params(&self) -> &ClassificationParams {
        &self.params
    }

    /// Set once the run has staged its results.
    pub fn summary(&self) -> Option<&ClassificationSummary> {
        self.summary.as_ref()
    }
}

fn next_experiment_id(session: &mut Session) -> Result<u64> {
    let id = session
        .get_document::<u64>(keys::NEXT_EXPERIMENT_ID)?
        .unwrap_or(1);
    session.put_document(keys::NEXT_EXPERIMENT_ID, &(id + 1))?;
    Ok(id)
}

fn stage_predictions(
    session: &mut Session,
    id: u64,
    phase: &str,
    predictions: &Predictions,
) -> Result<PerformanceMetrics> {
    let metrics = PerformanceMetrics::compute(predictions);
    session.put_table(
        keys::phase(id, phase, "predictions.parquet"),
        predictions.to_record_batch()?,
    )?;
    session.put_document(keys::phase(id, phase, "metrics.yaml"), &metrics)?;
    debug!(experiment = id, phase, instances = predictions.len(), "predictions staged");
    Ok(metrics)
}

#[derive(Debug, Serialize)]
struct CvMonitoring {
    num_folds: usize,
    folds: Vec<PerformanceMetrics>,
    mean: PerformanceMetrics,
}

fn cross_validation(train: &Instances, conf: &ClassificationConf) -> Result<CvMonitoring> {
    let mut folds = vec![];
    for (fold_train, fold_test) in train.stratified_folds(conf.num_folds) {
        let (features, labels) = fold_train.supervision()?;
        let mut model = conf.model.build();
        model.fit(&features, &labels)?;
        folds.push(PerformanceMetrics::compute(&Predictions::apply(
            model.as_ref(),
            &fold_test,
        )));
    }
    let mean = PerformanceMetrics::mean(&folds);
    Ok(CvMonitoring {
        num_folds: conf.num_folds,
        folds,
        mean,
    })
}

impl Experiment for ClassificationExperiment {
    fn kind(&self) -> &str {
        KIND
    }

    fn prepare(&mut self, conf: &Configuration) -> Result<()> {
        let resolved = ClassificationConf::resolve(&self.params, conf.defaults())?;
        let path = dataset::dataset_path(
            conf.input_data_dir(),
            &self.params.project,
            &self.params.dataset,
        );
        let instances = Instances::load(&path)?;
        let (train, test) = instances.split(resolved.test_size);
        // A missing class is reported by the supervision check instead.
        let smallest = match train.class_counts() {
            (0, _) | (_, 0) => None,
            (malicious, benign) => Some(malicious.min(benign)),
        };
        if let Some(smallest) = smallest.filter(|&n| resolved.num_folds > n) {
            return Err(ExperimentError::Config(format!(
                "num_folds ({}) exceeds the {smallest} training instances of the smallest class",
                resolved.num_folds
            ))
            .into());
        }
        let validation = match &resolved.validation_dataset {
            Some(name) => {
                let path =
                    dataset::dataset_path(conf.input_data_dir(), &self.params.project, name);
                let validation = Instances::load(&path)?;
                if validation.features != instances.features {
                    return Err(ExperimentError::Dataset(format!(
                        "validation dataset '{name}' does not share the features of '{}'",
                        self.params.dataset
                    ))
                    .into());
                }
                Some(validation)
            }
            None => None,
        };
        info!(
            project = %self.params.project,
            dataset = %self.params.dataset,
            model = %resolved.model,
            train = train.len(),
            test = test.len(),
            "classification prepared"
        );
        self.bound = Some(Bound {
            conf: resolved,
            train,
            test,
            validation,
        });
        Ok(())
    }

    fn run(&mut self, _conf: &Configuration, session: &mut Session) -> Result<()> {
        let bound = self.bound.as_ref().ok_or_else(|| {
            Error::unexpected(anyhow::anyhow!("classification run before prepare"))
        })?;
        let id = next_experiment_id(session)?;
        let started_at = Utc::now();
        let mut phases = vec![];

        // Training
        let (features, labels) = bound.train.supervision()?;
        let mut model = bound.conf.model.build();
        let start = Instant::now();
        model.fit(&features, &labels)?;
        let training_time = start.elapsed();

        let training = Predictions::apply(model.as_ref(), &bound.train);
        phases.push((
            "training".to_string(),
            stage_predictions(session, id, "training", &training)?,
        ));
        let coefficients: BTreeMap<&str, f64> = bound
            .train
            .features
            .iter()
            .map(String::as_str)
            .zip(model.coefficients())
            .collect();
        session.put_document(keys::phase(id, "training", "coefficients.yaml"), &coefficients)?;
        session.put_document(keys::phase(id, "training", "model.yaml"), &model.snapshot())?;

        // Cross-validation monitoring
        let cv = cross_validation(&bound.train, &bound.conf)?;
        session.put_document(keys::phase(id, "cross_validation", "metrics.yaml"), &cv)?;
        phases.push(("cross_validation".to_string(), cv.mean.clone()));

        // Testing
        let testing = Predictions::apply(model.as_ref(), &bound.test);
        phases.push((
            "testing".to_string(),
            stage_predictions(session, id, "testing", &testing)?,
        ));

        // Validation
        if let Some(validation) = &bound.validation {
            let predictions = Predictions::apply(model.as_ref(), validation);
            phases.push((
                "validation".to_string(),
                stage_predictions(session, id, "validation", &predictions)?,
            ));
        }

        // Alerts
        let alerts = match bound.conf.alerts_threshold {
            Some(threshold) => {
                let alerts = Alerts::generate(&testing, threshold);
                session.put_document(keys::phase(id, "testing", "alerts.yaml"), &alerts)?;
                Some(alerts.alerts.len())
            }
            None => None,
        };

        let params = serde_yaml::to_value(&bound.conf)
            .and_then(serde_yaml::from_value::<BTreeMap<String, serde_yaml::Value>>)
            .map_err(Error::unexpected)?;
        let record = ExperimentRecord {
            id,
            kind: KIND.to_string(),
            project: self.params.project.clone(),
            dataset: self.params.dataset.clone(),
            params,
            started_at,
            finished_at: Some(Utc::now()),
            training_time_secs: Some(training_time.as_secs_f64()),
        };
        session.put_document(keys::experiment(id), &record)?;

        info!(experiment = id, staged = session.pending(), "classification finished");
        self.summary = Some(ClassificationSummary {
            experiment_id: id,
            phases,
            alerts,
            training_time,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ClassificationParams {
        ClassificationParams {
            project: "proj".to_string(),
            dataset: "data".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_falls_back_to_configuration_defaults() {
        let defaults = ExperimentDefaults {
            model: Some("centroid".to_string()),
            num_folds: Some(3),
            test_size: None,
        };
        let conf = ClassificationConf::resolve(&params(), &defaults).unwrap();
        assert_eq!(conf.model, ModelKind::Centroid);
        assert_eq!(conf.num_folds, 3);
        assert_eq!(conf.test_size, DEFAULT_TEST_SIZE);

        let overridden = ClassificationParams {
            model: Some("gaussian-nb".to_string()),
            ..params()
        };
        let conf = ClassificationConf::resolve(&overridden, &defaults).unwrap();
        assert_eq!(conf.model, ModelKind::GaussianNb);
    }

    #[test]
    fn test_resolve_rejects_invalid_parameters() {
        let defaults = ExperimentDefaults::default();
        let cases = [
            ClassificationParams {
                num_folds: Some(1),
                ..params()
            },
            ClassificationParams {
                test_size: Some(1.0),
                ..params()
            },
            ClassificationParams {
                alerts_threshold: Some(1.5),
                ..params()
            },
            ClassificationParams {
                model: Some("svm".to_string()),
                ..params()
            },
            ClassificationParams {
                project: "../etc".to_string(),
                ..params()
            },
        ];
        for case in cases {
            assert!(
                matches!(
                    ClassificationConf::resolve(&case, &defaults),
                    Err(ExperimentError::Config(_))
                ),
                "{case:?} should be rejected"
            );
        }
    }
}
