//! Data models persisted in the store, and the keys they live under.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata stored for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentRecord {
    pub id: u64,
    pub kind: String,
    pub project: String,
    pub dataset: String,
    /// Parameters the experiment was bound with.
    #[serde(default)]
    pub params: BTreeMap<String, serde_yaml::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub training_time_secs: Option<f64>,
}

/// A user interaction with the web UI, recorded when user-action logging is on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserAction {
    pub id: Uuid,
    pub experiment_id: Option<u64>,
    pub action: String,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl UserAction {
    pub fn new(action: impl Into<String>, experiment_id: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            experiment_id,
            action: action.into(),
            detail: None,
            at: Utc::now(),
        }
    }
}

/// Store layout.
pub mod keys {
    use super::UserAction;

    pub const EXPERIMENTS: &str = "experiments/";
    pub const NEXT_EXPERIMENT_ID: &str = "experiments/next_id.yaml";
    pub const USER_ACTIONS: &str = "user_actions/";

    pub fn experiment(id: u64) -> String {
        format!("experiments/{id}/experiment.yaml")
    }

    /// A file produced by one phase (training, testing, ...) of an experiment.
    pub fn phase(id: u64, phase: &str, file: &str) -> String {
        format!("experiments/{id}/{phase}/{file}")
    }

    pub fn user_action(action: &UserAction) -> String {
        format!(
            "user_actions/{}-{}.yaml",
            action.at.format("%Y%m%dT%H%M%S%.6f"),
            action.id
        )
    }

    /// Experiment id from an `experiments/<id>/experiment.yaml` key.
    pub fn parse_experiment(key: &str) -> Option<u64> {
        key.strip_prefix(EXPERIMENTS)?
            .strip_suffix("/experiment.yaml")?
            .parse()
            .ok()
    }
}
