//! Binary classifiers. `true` stands for the malicious class.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExperimentError;

pub trait Classifier: Send {
    fn fit(&mut self, features: &[Vec<f64>], labels: &[bool]) -> Result<(), ExperimentError>;

    /// Probability that `values` belongs to the malicious class.
    fn predict_proba(&self, values: &[f64]) -> f64;

    /// One weight per feature, larger meaning more indicative of maliciousness.
    fn coefficients(&self) -> Vec<f64>;

    /// Serializable dump of the fitted model.
    fn snapshot(&self) -> serde_yaml::Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Centroid,
    GaussianNb,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Centroid, ModelKind::GaussianNb];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Centroid => "centroid",
            ModelKind::GaussianNb => "gaussian-nb",
        }
    }

    pub fn build(self) -> Box<dyn Classifier> {
        match self {
            ModelKind::Centroid => Box::new(NearestCentroid::default()),
            ModelKind::GaussianNb => Box::new(GaussianNb::default()),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = ModelKind::ALL.iter().map(|k| k.name()).collect();
                ExperimentError::Config(format!(
                    "unknown model '{s}' (expected one of: {})",
                    known.join(", ")
                ))
            })
    }
}

fn check_training_set(features: &[Vec<f64>], labels: &[bool]) -> Result<usize, ExperimentError> {
    if features.len() != labels.len() {
        return Err(ExperimentError::Algorithm(format!(
            "{} feature rows for {} labels",
            features.len(),
            labels.len()
        )));
    }
    let dim = features.first().map_or(0, Vec::len);
    if dim == 0 {
        return Err(ExperimentError::Algorithm("empty training set".to_string()));
    }
    for row in features {
        if row.len() != dim {
            return Err(ExperimentError::Algorithm("ragged feature matrix".to_string()));
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(ExperimentError::Algorithm("non-finite feature value".to_string()));
        }
    }
    Ok(dim)
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Column means of the rows whose label equals `class`.
fn class_mean(features: &[Vec<f64>], labels: &[bool], class: bool, dim: usize) -> (Vec<f64>, usize) {
    let mut sum = vec![0.0; dim];
    let mut n = 0;
    for (row, _) in features.iter().zip(labels).filter(|&(_, &l)| l == class) {
        for (s, v) in sum.iter_mut().zip(row) {
            *s += v;
        }
        n += 1;
    }
    if n > 0 {
        sum.iter_mut().for_each(|s| *s /= n as f64);
    }
    (sum, n)
}

// ─── Nearest centroid ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct NearestCentroid {
    malicious: Vec<f64>,
    benign: Vec<f64>,
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

impl Classifier for NearestCentroid {
    fn fit(&mut self, features: &[Vec<f64>], labels: &[bool]) -> Result<(), ExperimentError> {
        let dim = check_training_set(features, labels)?;
        self.malicious = class_mean(features, labels, true, dim).0;
        self.benign = class_mean(features, labels, false, dim).0;
        Ok(())
    }

    fn predict_proba(&self, values: &[f64]) -> f64 {
        sigmoid(squared_distance(values, &self.benign) - squared_distance(values, &self.malicious))
    }

    fn coefficients(&self) -> Vec<f64> {
        self.malicious.iter().zip(&self.benign).map(|(m, b)| m - b).collect()
    }

    fn snapshot(&self) -> serde_yaml::Value {
        serde_yaml::to_value(self).unwrap_or(serde_yaml::Value::Null)
    }
}

// ─── Gaussian naive Bayes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
struct ClassStats {
    prior: f64,
    mean: Vec<f64>,
    var: Vec<f64>,
}

impl ClassStats {
    fn log_likelihood(&self, values: &[f64]) -> f64 {
        let ll: f64 = values
            .iter()
            .zip(self.mean.iter().zip(&self.var))
            .map(|(x, (m, v))| (2.0 * std::f64::consts::PI * v).ln() + (x - m) * (x - m) / v)
            .sum();
        self.prior.ln() - 0.5 * ll
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GaussianNb {
    malicious: ClassStats,
    benign: ClassStats,
}

impl GaussianNb {
    const VAR_SMOOTHING: f64 = 1e-9;

    fn class_stats(
        features: &[Vec<f64>],
        labels: &[bool],
        class: bool,
        dim: usize,
    ) -> ClassStats {
        let (mean, n) = class_mean(features, labels, class, dim);
        let mut var = vec![0.0; dim];
        for (row, _) in features.iter().zip(labels).filter(|&(_, &l)| l == class) {
            for ((acc, x), m) in var.iter_mut().zip(row).zip(&mean) {
                *acc += (x - m) * (x - m);
            }
        }
        if n > 0 {
            var.iter_mut().for_each(|v| *v /= n as f64);
        }
        ClassStats {
            prior: n as f64 / labels.len() as f64,
            mean,
            var,
        }
    }
}

impl Classifier for GaussianNb {
    fn fit(&mut self, features: &[Vec<f64>], labels: &[bool]) -> Result<(), ExperimentError> {
        let dim = check_training_set(features, labels)?;
        let mut malicious = Self::class_stats(features, labels, true, dim);
        let mut benign = Self::class_stats(features, labels, false, dim);
        if malicious.prior == 0.0 || benign.prior == 0.0 {
            return Err(ExperimentError::Algorithm(
                "naive Bayes needs both classes in the training set".to_string(),
            ));
        }
        let max_var = malicious
            .var
            .iter()
            .chain(&benign.var)
            .fold(0.0_f64, |acc, v| acc.max(*v));
        let epsilon = (Self::VAR_SMOOTHING * max_var).max(f64::MIN_POSITIVE.sqrt());
        for v in malicious.var.iter_mut().chain(benign.var.iter_mut()) {
            *v += epsilon;
        }
        self.malicious = malicious;
        self.benign = benign;
        Ok(())
    }

    fn predict_proba(&self, values: &[f64]) -> f64 {
        sigmoid(self.malicious.log_likelihood(values) - self.benign.log_likelihood(values))
    }

    fn coefficients(&self) -> Vec<f64> {
        self.malicious
            .mean
            .iter()
            .zip(&self.benign.mean)
            .zip(self.malicious.var.iter().zip(&self.benign.var))
            .map(|((m, b), (vm, vb))| (m - b) / ((vm + vb) / 2.0).sqrt())
            .collect()
    }

    fn snapshot(&self) -> serde_yaml::Value {
        serde_yaml::to_value(self).unwrap_or(serde_yaml::Value::Null)
    }
}
