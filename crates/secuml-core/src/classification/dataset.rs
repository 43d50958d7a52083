//! Datasets: instances, labels, supervision and deterministic splits.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ExperimentError};

pub const INSTANCES_FILE: &str = "instances.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Malicious,
    Benign,
}

impl Label {
    pub fn is_malicious(self) -> bool {
        self == Label::Malicious
    }
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    id: u64,
    values: Vec<f64>,
    #[serde(default)]
    label: Option<Label>,
}

#[derive(Debug, Deserialize)]
struct RawDataset {
    features: Vec<String>,
    instances: Vec<RawInstance>,
}

/// `<input_data_dir>/<project>/<dataset>/instances.json`
pub fn dataset_path(input_data_dir: &Path, project: &str, dataset: &str) -> PathBuf {
    input_data_dir.join(project).join(dataset).join(INSTANCES_FILE)
}

/// A set of instances with their feature values and (optional) labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instances {
    pub features: Vec<String>,
    pub ids: Vec<u64>,
    pub values: Vec<Vec<f64>>,
    pub labels: Vec<Option<Label>>,
}

impl Instances {
    pub fn load(path: &Path) -> Result<Self, ExperimentError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ExperimentError::Dataset(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&content)
            .map_err(|e| ExperimentError::Dataset(format!("{}: {e}", path.display())))
    }

    pub fn from_json_str(content: &str) -> Result<Self, String> {
        let raw: RawDataset = serde_json::from_str(content).map_err(|e| e.to_string())?;
        if raw.features.is_empty() {
            return Err("dataset declares no features".to_string());
        }
        if raw.instances.is_empty() {
            return Err("dataset contains no instances".to_string());
        }
        let mut seen = HashSet::with_capacity(raw.instances.len());
        let mut instances = Instances {
            features: raw.features,
            ..Default::default()
        };
        for inst in raw.instances {
            if !seen.insert(inst.id) {
                return Err(format!("duplicate instance id {}", inst.id));
            }
            if inst.values.len() != instances.features.len() {
                return Err(format!(
                    "instance {} has {} values for {} features",
                    inst.id,
                    inst.values.len(),
                    instances.features.len()
                ));
            }
            instances.ids.push(inst.id);
            instances.values.push(inst.values);
            instances.labels.push(inst.label);
        }
        Ok(instances)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn select(&self, indices: &[usize]) -> Instances {
        Instances {
            features: self.features.clone(),
            ids: indices.iter().map(|&i| self.ids[i]).collect(),
            values: indices.iter().map(|&i| self.values[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    pub fn ground_truth(&self) -> Vec<Option<bool>> {
        self.labels.iter().map(|l| l.map(Label::is_malicious)).collect()
    }

    /// Labeled feature rows and their binary supervision.
    ///
    /// Fails unless both classes are represented.
    pub fn supervision(&self) -> Result<(Vec<Vec<f64>>, Vec<bool>), CoreError> {
        let (values, labels): (Vec<_>, Vec<_>) = self
            .values
            .iter()
            .zip(&self.labels)
            .filter_map(|(v, l)| l.map(|l| (v.clone(), l.is_malicious())))
            .unzip();
        let malicious = labels.iter().filter(|&&l| l).count();
        if malicious == 0 || malicious == labels.len() {
            return Err(CoreError::AtLeastTwoClasses);
        }
        Ok((values, labels))
    }

    /// Number of malicious and benign instances.
    pub fn class_counts(&self) -> (usize, usize) {
        let malicious = self.labels.iter().filter(|l| **l == Some(Label::Malicious)).count();
        let benign = self.labels.iter().filter(|l| **l == Some(Label::Benign)).count();
        (malicious, benign)
    }

    fn groups(&self) -> [Vec<usize>; 3] {
        let mut groups: [Vec<usize>; 3] = Default::default();
        for (i, label) in self.labels.iter().enumerate() {
            let g = match label {
                Some(Label::Malicious) => 0,
                Some(Label::Benign) => 1,
                None => 2,
            };
            groups[g].push(i);
        }
        groups
    }

    /// Deterministic stratified train/test split.
    ///
    /// The last `round(n * test_size)` instances of each label go to the
    /// test set; unlabeled instances always do.
    pub fn split(&self, test_size: f64) -> (Instances, Instances) {
        let [malicious, benign, unlabeled] = self.groups();
        let mut train = vec![];
        let mut test = unlabeled;
        for group in [malicious, benign] {
            let n_test = ((group.len() as f64 * test_size).round() as usize).min(group.len());
            let (tr, te) = group.split_at(group.len() - n_test);
            train.extend_from_slice(tr);
            test.extend_from_slice(te);
        }
        train.sort_unstable();
        test.sort_unstable();
        (self.select(&train), self.select(&test))
    }

    /// Stratified folds over the labeled instances: an instance of rank `r`
    /// within its label lands in fold `r % num_folds`.
    pub fn stratified_folds(&self, num_folds: usize) -> Vec<(Instances, Instances)> {
        let [malicious, benign, _] = self.groups();
        let mut fold_of = vec![None; self.len()];
        for group in [malicious, benign] {
            for (rank, &i) in group.iter().enumerate() {
                fold_of[i] = Some(rank % num_folds);
            }
        }
        (0..num_folds)
            .map(|fold| {
                let (test, train): (Vec<usize>, Vec<usize>) = (0..self.len())
                    .filter(|&i| fold_of[i].is_some())
                    .partition(|&i| fold_of[i] == Some(fold));
                (self.select(&train), self.select(&test))
            })
            .collect()
    }
}
