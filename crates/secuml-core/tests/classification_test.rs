//! End-to-end classification runs against a file store.

use std::fs;
use std::path::Path;

use secuml_core::classification::{ClassificationExperiment, ClassificationParams, ModelKind};
use secuml_core::models::keys;
use secuml_core::{
    storage, Configuration, Controller, CoreError, Error, ExperimentError, ExperimentRecord, Phase,
    Store,
};
use serde_json::json;
use tempfile::TempDir;

const PROJECT: &str = "malware";

fn write_dataset(input: &Path, name: &str, features: &[&str], instances: serde_json::Value) {
    let dir = input.join(PROJECT).join(name);
    fs::create_dir_all(&dir).unwrap();
    let dataset = json!({ "features": features, "instances": instances });
    fs::write(dir.join("instances.json"), dataset.to_string()).unwrap();
}

/// Two well separated classes plus a couple of unlabeled instances.
fn separable_instances() -> serde_json::Value {
    let mut instances = vec![];
    for i in 0..24u64 {
        let jitter = (i % 5) as f64 * 0.1;
        let (values, label) = if i % 2 == 0 {
            (vec![5.0 + jitter, 4.8 + (i % 3) as f64 * 0.1], "malicious")
        } else {
            (vec![jitter, 0.2 - (i % 3) as f64 * 0.1], "benign")
        };
        instances.push(json!({ "id": i, "values": values, "label": label }));
    }
    instances.push(json!({ "id": 100, "values": [5.1, 5.0] }));
    instances.push(json!({ "id": 101, "values": [0.1, 0.1] }));
    serde_json::Value::Array(instances)
}

/// Temporary project layout: `secuml.yaml`, `store/` and `input/`.
fn setup() -> (TempDir, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("store")).unwrap();
    let input = tmp.path().join("input");
    write_dataset(&input, "train", &["num_calls", "entropy"], separable_instances());
    write_dataset(
        &input,
        "benign_only",
        &["num_calls", "entropy"],
        json!([
            { "id": 1, "values": [0.0, 0.1], "label": "benign" },
            { "id": 2, "values": [0.2, 0.0], "label": "benign" },
            { "id": 3, "values": [0.1, 0.3], "label": "benign" },
        ]),
    );
    write_dataset(
        &input,
        "other_features",
        &["size"],
        json!([{ "id": 1, "values": [3.0], "label": "benign" }]),
    );
    let conf_path = tmp.path().join("secuml.yaml");
    fs::write(
        &conf_path,
        "db_uri: file://store\ninput_data_dir: input\ndefaults:\n  num_folds: 3\n",
    )
    .unwrap();
    (tmp, conf_path)
}

fn params(dataset: &str) -> ClassificationParams {
    ClassificationParams {
        project: PROJECT.to_string(),
        dataset: dataset.to_string(),
        ..Default::default()
    }
}

fn store_files(tmp: &TempDir) -> Vec<String> {
    let root = tmp.path().join("store");
    let mut files = vec![];
    storage::list_files(&root, &root, &mut files).unwrap();
    files.sort();
    files
}

#[test]
fn test_classification_commits_all_results() {
    let (tmp, conf_path) = setup();
    let mut controller = Controller::new(ClassificationExperiment::new(ClassificationParams {
        alerts_threshold: Some(0.9),
        ..params("train")
    }));
    let report = controller.execute(Some(&conf_path)).unwrap();
    assert_eq!(controller.phase(), Phase::Succeeded);
    assert_eq!(report.kind, "Classification");
    assert_eq!(report.session.commits, 1);

    let summary = controller.experiment().summary().unwrap();
    assert_eq!(summary.experiment_id, 1);
    let phases: Vec<&str> = summary.phases.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(phases, vec!["training", "cross_validation", "testing"]);
    let (_, testing) = &summary.phases[2];
    assert_eq!(testing.accuracy, Some(1.0));
    // Both unlabeled instances are scored but not counted.
    assert_eq!(testing.num_instances, testing.num_labeled + 2);
    assert!(summary.alerts.unwrap() >= 1);

    let files = store_files(&tmp);
    for expected in [
        "experiments/next_id.yaml",
        "experiments/1/experiment.yaml",
        "experiments/1/training/predictions.parquet",
        "experiments/1/training/metrics.yaml",
        "experiments/1/training/coefficients.yaml",
        "experiments/1/training/model.yaml",
        "experiments/1/cross_validation/metrics.yaml",
        "experiments/1/testing/predictions.parquet",
        "experiments/1/testing/metrics.yaml",
        "experiments/1/testing/alerts.yaml",
    ] {
        assert!(files.iter().any(|f| f == expected), "missing {expected} in {files:?}");
    }
    assert!(files.iter().all(|f| !f.contains(".~")), "{files:?}");

    let predictions =
        storage::read_parquet(&tmp.path().join("store/experiments/1/testing/predictions.parquet"))
            .unwrap();
    assert_eq!(predictions.num_rows(), testing.num_instances);

    let conf = Configuration::load(Some(&conf_path)).unwrap();
    let session = Store::connect(&conf).unwrap().session();
    let record: ExperimentRecord = session.get_document(&keys::experiment(1)).unwrap().unwrap();
    assert_eq!(record.dataset, "train");
    assert_eq!(record.params["model"].as_str(), Some("gaussian-nb"));
    assert_eq!(record.params["num_folds"].as_u64(), Some(3));
    assert!(record.finished_at.is_some());
}

#[test]
fn test_experiment_ids_increase_across_runs() {
    let (_tmp, conf_path) = setup();
    for (expected, model) in [(1, ModelKind::GaussianNb), (2, ModelKind::Centroid)] {
        let mut controller = Controller::new(ClassificationExperiment::new(ClassificationParams {
            model: Some(model.to_string()),
            ..params("train")
        }));
        controller.execute(Some(&conf_path)).unwrap();
        let experiment = controller.into_experiment();
        assert_eq!(experiment.summary().unwrap().experiment_id, expected);
    }
}

#[test]
fn test_single_class_training_leaves_store_untouched() {
    let (tmp, conf_path) = setup();
    Controller::new(ClassificationExperiment::new(params("train")))
        .execute(Some(&conf_path))
        .unwrap();
    let before = store_files(&tmp);
    let next_id = fs::read_to_string(tmp.path().join("store/experiments/next_id.yaml")).unwrap();

    let mut controller = Controller::new(ClassificationExperiment::new(params("benign_only")));
    let err = controller.execute(Some(&conf_path)).unwrap_err();

    assert!(matches!(err, Error::Core(CoreError::AtLeastTwoClasses)));
    assert_eq!(controller.phase(), Phase::Failed);
    assert!(controller.experiment().summary().is_none());
    assert_eq!(store_files(&tmp), before);
    assert_eq!(
        fs::read_to_string(tmp.path().join("store/experiments/next_id.yaml")).unwrap(),
        next_id
    );
}

#[test]
fn test_validation_dataset_must_share_features() {
    let (tmp, conf_path) = setup();
    let mut controller = Controller::new(ClassificationExperiment::new(ClassificationParams {
        validation_dataset: Some("other_features".to_string()),
        ..params("train")
    }));
    let err = controller.execute(Some(&conf_path)).unwrap_err();

    assert!(matches!(err, Error::Experiment(ExperimentError::Dataset(_))));
    assert!(store_files(&tmp).is_empty());
}

#[test]
fn test_validation_phase_is_scored() {
    let (_tmp, conf_path) = setup();
    let mut controller = Controller::new(ClassificationExperiment::new(ClassificationParams {
        validation_dataset: Some("benign_only".to_string()),
        ..params("train")
    }));
    controller.execute(Some(&conf_path)).unwrap();

    let summary = controller.experiment().summary().unwrap();
    let (name, validation) = summary.phases.last().unwrap();
    assert_eq!(name, "validation");
    assert_eq!(validation.num_labeled, 3);
    assert_eq!(validation.auc, None);
}

#[test]
fn test_missing_dataset_is_dataset_error() {
    let (tmp, conf_path) = setup();
    let mut controller = Controller::new(ClassificationExperiment::new(params("nope")));
    let err = controller.execute(Some(&conf_path)).unwrap_err();

    assert!(matches!(err, Error::Experiment(ExperimentError::Dataset(_))));
    assert!(err.is_domain());
    assert!(store_files(&tmp).is_empty());
}

#[test]
fn test_num_folds_beyond_smallest_class_is_config_error() {
    // Nine training instances per class once a quarter is held out.
    for num_folds in [10, usize::MAX] {
        let (tmp, conf_path) = setup();
        let mut controller = Controller::new(ClassificationExperiment::new(ClassificationParams {
            num_folds: Some(num_folds),
            ..params("train")
        }));
        let err = controller.execute(Some(&conf_path)).unwrap_err();

        assert!(matches!(err, Error::Experiment(ExperimentError::Config(_))));
        assert!(err.to_string().contains("num_folds"));
        assert_eq!(controller.phase(), Phase::Failed);
        assert!(store_files(&tmp).is_empty());
    }

    let (tmp, conf_path) = setup();
    Controller::new(ClassificationExperiment::new(ClassificationParams {
        num_folds: Some(9),
        ..params("train")
    }))
    .execute(Some(&conf_path))
    .unwrap();
    assert!(tmp.path().join("store/experiments/1/experiment.yaml").is_file());
}
