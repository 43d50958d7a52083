//! Predictions, performance metrics and alerts.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use super::dataset::Instances;
use super::model::Classifier;
use crate::error::CoreError;

/// Decision threshold on the predicted probability.
pub const DECISION_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predictions {
    pub ids: Vec<u64>,
    pub proba: Vec<f64>,
    pub ground_truth: Vec<Option<bool>>,
}

impl Predictions {
    pub fn apply(model: &dyn Classifier, instances: &Instances) -> Self {
        Self {
            ids: instances.ids.clone(),
            proba: instances
                .values
                .iter()
                .map(|v| model.predict_proba(v))
                .collect(),
            ground_truth: instances.ground_truth(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn predicted(&self) -> impl Iterator<Item = bool> + '_ {
        self.proba.iter().map(|p| *p >= DECISION_THRESHOLD)
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch, CoreError> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("predicted_proba", DataType::Float64, false),
            Field::new("predicted_label", DataType::Boolean, false),
            Field::new("ground_truth", DataType::Boolean, true),
        ]));
        let columns: Vec<ArrayRef> = vec![
            Arc::new(UInt64Array::from(self.ids.clone())),
            Arc::new(Float64Array::from(self.proba.clone())),
            Arc::new(BooleanArray::from(self.predicted().collect::<Vec<_>>())),
            Arc::new(BooleanArray::from(self.ground_truth.clone())),
        ];
        RecordBatch::try_new(schema, columns).map_err(CoreError::persistence)
    }
}

/// Binary classification metrics. The malicious class is positive.
/// Metrics that are undefined for the given predictions are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub num_instances: usize,
    pub num_labeled: usize,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub false_positive_rate: Option<f64>,
    pub auc: Option<f64>,
}

fn ratio(num: usize, den: usize) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

impl PerformanceMetrics {
    pub fn compute(predictions: &Predictions) -> Self {
        let (mut tp, mut fp, mut tn, mut fn_) = (0, 0, 0, 0);
        let mut scored = vec![];
        for ((predicted, truth), proba) in predictions
            .predicted()
            .zip(&predictions.ground_truth)
            .zip(&predictions.proba)
        {
            let Some(truth) = *truth else { continue };
            scored.push((*proba, truth));
            match (predicted, truth) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = f1_score(precision, recall);
        Self {
            num_instances: predictions.len(),
            num_labeled: scored.len(),
            accuracy: ratio(tp + tn, scored.len()),
            precision,
            recall,
            f1,
            false_positive_rate: ratio(fp, fp + tn),
            auc: roc_auc(&scored),
        }
    }

    /// Average of each metric over the folds where it is defined.
    ///
    /// F1 is not averaged: it is the harmonic mean of the averaged precision
    /// and recall, so it always lies between them.
    pub fn mean(folds: &[PerformanceMetrics]) -> Self {
        fn avg(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
            let defined: Vec<f64> = values.flatten().collect();
            (!defined.is_empty()).then(|| defined.iter().sum::<f64>() / defined.len() as f64)
        }
        let precision = avg(folds.iter().map(|m| m.precision));
        let recall = avg(folds.iter().map(|m| m.recall));
        Self {
            num_instances: folds.iter().map(|m| m.num_instances).sum(),
            num_labeled: folds.iter().map(|m| m.num_labeled).sum(),
            accuracy: avg(folds.iter().map(|m| m.accuracy)),
            precision,
            recall,
            f1: f1_score(precision, recall),
            false_positive_rate: avg(folds.iter().map(|m| m.false_positive_rate)),
            auc: avg(folds.iter().map(|m| m.auc)),
        }
    }
}

fn f1_score(precision: Option<f64>, recall: Option<f64>) -> Option<f64> {
    match (precision, recall) {
        (Some(p), Some(r)) if p + r > 0.0 => Some(2.0 * p * r / (p + r)),
        (Some(_), Some(_)) => Some(0.0),
        _ => None,
    }
}

/// Area under the ROC curve, as the probability that a random positive is
/// scored above a random negative (ties count half).
pub fn roc_auc(scored: &[(f64, bool)]) -> Option<f64> {
    let positives = scored.iter().filter(|(_, l)| *l).count();
    let negatives = scored.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }
    let mut sorted: Vec<(f64, bool)> = scored.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Average ranks over runs of tied scores.
    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1].0 == sorted[i].0 {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        positive_rank_sum += rank * sorted[i..=j].iter().filter(|(_, l)| *l).count() as f64;
        i = j + 1;
    }
    let p = positives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub proba: f64,
}

/// Test instances whose predicted probability reaches the alert threshold,
/// most suspicious first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alerts {
    pub threshold: f64,
    pub alerts: Vec<Alert>,
}

impl Alerts {
    pub fn generate(predictions: &Predictions, threshold: f64) -> Self {
        let mut alerts: Vec<Alert> = predictions
            .ids
            .iter()
            .zip(&predictions.proba)
            .filter(|(_, p)| **p >= threshold)
            .map(|(&id, &proba)| Alert { id, proba })
            .collect();
        alerts.sort_by(|a, b| b.proba.total_cmp(&a.proba).then(a.id.cmp(&b.id)));
        Self { threshold, alerts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictions(proba: &[f64], truth: &[Option<bool>]) -> Predictions {
        Predictions {
            ids: (0..proba.len() as u64).collect(),
            proba: proba.to_vec(),
            ground_truth: truth.to_vec(),
        }
    }

    #[test]
    fn test_metrics_on_partial_ground_truth() {
        let p = predictions(
            &[0.9, 0.8, 0.3, 0.1, 0.7],
            &[Some(true), Some(false), Some(true), Some(false), None],
        );
        let m = PerformanceMetrics::compute(&p);
        assert_eq!(m.num_instances, 5);
        assert_eq!(m.num_labeled, 4);
        assert_eq!(m.accuracy, Some(0.5));
        assert_eq!(m.precision, Some(0.5));
        assert_eq!(m.recall, Some(0.5));
        assert_eq!(m.false_positive_rate, Some(0.5));
        assert_eq!(m.auc, Some(0.75));
    }

    #[test]
    fn test_auc_undefined_for_single_class() {
        assert_eq!(roc_auc(&[(0.1, true), (0.4, true)]), None);
        assert_eq!(roc_auc(&[(0.5, true), (0.5, false)]), Some(0.5));
        assert_eq!(roc_auc(&[(0.9, true), (0.1, false)]), Some(1.0));
    }

    #[test]
    fn test_mean_skips_undefined_folds() {
        let folds = [
            PerformanceMetrics {
                auc: Some(1.0),
                ..Default::default()
            },
            PerformanceMetrics::default(),
            PerformanceMetrics {
                auc: Some(0.5),
                ..Default::default()
            },
        ];
        assert_eq!(PerformanceMetrics::mean(&folds).auc, Some(0.75));
        assert_eq!(PerformanceMetrics::mean(&folds).accuracy, None);
    }

    #[test]
    fn test_mean_f1_lies_between_mean_precision_and_recall() {
        let folds = [
            PerformanceMetrics {
                precision: Some(1.0),
                recall: Some(1.0),
                f1: Some(1.0),
                ..Default::default()
            },
            PerformanceMetrics {
                precision: Some(0.5),
                recall: None,
                f1: None,
                ..Default::default()
            },
            PerformanceMetrics {
                precision: None,
                recall: Some(1.0 / 3.0),
                f1: None,
                ..Default::default()
            },
        ];
        let mean = PerformanceMetrics::mean(&folds);
        let (p, r) = (mean.precision.unwrap(), mean.recall.unwrap());
        assert!((p - 0.75).abs() < 1e-9);
        assert!((r - 2.0 / 3.0).abs() < 1e-9);
        let f1 = mean.f1.unwrap();
        assert!((f1 - 2.0 * p * r / (p + r)).abs() < 1e-9);
        assert!(f1 <= p.max(r) && f1 >= p.min(r));

        let undefined = [PerformanceMetrics {
            precision: Some(0.5),
            ..Default::default()
        }];
        assert_eq!(PerformanceMetrics::mean(&undefined).f1, None);
    }

    #[test]
    fn test_alerts_sorted_by_probability() {
        let p = predictions(&[0.2, 0.95, 0.7, 0.95], &[None; 4]);
        let alerts = Alerts::generate(&p, 0.7);
        let ids: Vec<u64> = alerts.alerts.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn test_predictions_table_schema() {
        let p = predictions(&[0.2, 0.8], &[Some(false), None]);
        let batch = p.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 4);
        assert_eq!(batch.schema().field(3).name(), "ground_truth");
    }
}
