//! secuml-classification: train, monitor and apply a classifier as one
//! transactional experiment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use secuml::classification::{
    ClassificationExperiment, ClassificationParams, ClassificationSummary, ModelKind,
    PerformanceMetrics,
};
use secuml::lifecycle::diagnostic;
use secuml::{Controller, Error, RunReport, DOMAIN_EXIT_CODE};

#[derive(Parser)]
#[command(
    name = "secuml-classification",
    about = "Run a SecuML classification experiment",
    version
)]
struct Cli {
    /// Path to the SecuML configuration file (defaults to $SECUMLCONF, then ./secuml.yaml)
    #[arg(long = "secuml-conf")]
    secuml_conf: Option<PathBuf>,
    /// Project the dataset belongs to
    project: String,
    /// Dataset to train and test on
    dataset: String,
    /// Classification model
    #[arg(long, value_parser = model_names())]
    model: Option<String>,
    /// Number of cross-validation folds
    #[arg(long)]
    num_folds: Option<usize>,
    /// Fraction of each class held out for testing
    #[arg(long)]
    test_size: Option<f64>,
    /// Dataset of the same project to validate the model on
    #[arg(long)]
    validation_dataset: Option<String>,
    /// Raise alerts on test instances scored at least this high
    #[arg(long)]
    alerts_threshold: Option<f64>,
}

fn model_names() -> Vec<&'static str> {
    ModelKind::ALL.iter().map(|k| k.name()).collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let params = ClassificationParams {
        project: cli.project,
        dataset: cli.dataset,
        model: cli.model,
        num_folds: cli.num_folds,
        test_size: cli.test_size,
        validation_dataset: cli.validation_dataset,
        alerts_threshold: cli.alerts_threshold,
    };
    debug!(?params, "classification parameters");

    let mut controller = Controller::new(ClassificationExperiment::new(params));
    match controller.execute(cli.secuml_conf.as_deref()) {
        Ok(report) => {
            if let Some(summary) = controller.experiment().summary() {
                print_summary(&report, summary);
            }
            Ok(())
        }
        Err(Error::Unexpected(cause)) => Err(cause),
        Err(err) => {
            eprintln!("{}", diagnostic(&err));
            std::process::exit(DOMAIN_EXIT_CODE);
        }
    }
}

// ─── Reporting ────────────────────────────────────────────────────────────────

fn print_summary(report: &RunReport, summary: &ClassificationSummary) {
    println!("Experiment {} ({})", summary.experiment_id, report.kind);
    println!("Training time: {}", format_duration(summary.training_time));

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header([
        "Phase", "Instances", "Labeled", "Accuracy", "Precision", "Recall", "F1", "FPR", "AUC",
    ]);
    for (phase, m) in &summary.phases {
        table.add_row(metrics_row(phase, m));
    }
    println!("{}", table);

    if let Some(alerts) = summary.alerts {
        println!("Alerts: {}", alerts);
    }
    println!("Done in {}.", format_duration(report.elapsed));
}

fn metrics_row(phase: &str, m: &PerformanceMetrics) -> Vec<String> {
    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.3}", v));
    vec![
        phase.to_string(),
        m.num_instances.to_string(),
        m.num_labeled.to_string(),
        fmt(m.accuracy),
        fmt(m.precision),
        fmt(m.recall),
        fmt(m.f1),
        fmt(m.false_positive_rate),
        fmt(m.auc),
    ]
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let m = secs / 60;
    let s = secs % 60;
    if m > 0 {
        format!("{}m {}s", m, s)
    } else if secs > 0 {
        format!("{}s", s)
    } else {
        format!("{}ms", d.as_millis())
    }
}
