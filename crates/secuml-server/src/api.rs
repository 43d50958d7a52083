//! REST API handlers for secuml-server.
//!
//! Every request works on its own session opened from the shared store.

use std::fmt::Display;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{debug, warn};

use secuml_core::models::keys;
use secuml_core::session::Record;
use secuml_core::{storage, ExperimentRecord, UserAction};

use crate::state::AppContext;

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn router() -> Router<AppContext> {
    Router::new()
        .route("/config", get(get_config))
        .route("/experiments", get(list_experiments))
        .route("/experiments/{id}", get(get_experiment))
        .route("/experiments/{id}/{phase}/metrics", get(get_phase_metrics))
        .route("/experiments/{id}/{phase}/predictions", get(get_phase_predictions))
        .route("/user-actions", post(log_user_action))
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn internal(e: impl Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn not_found(what: String) -> Response {
    (StatusCode::NOT_FOUND, format!("{what} not found")).into_response()
}

/// Phase names never contain dots, so `.`, `..` and scratch files stay unreachable.
fn phase_key(id: u64, phase: &str, file: &str) -> Option<String> {
    (!phase.is_empty() && !phase.contains('.')).then(|| keys::phase(id, phase, file))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn get_config(State(ctx): State<AppContext>) -> impl IntoResponse {
    let conf = ctx.configuration();
    Json(serde_json::json!({
        "db": conf.db().to_string(),
        "input_data_dir": conf.input_data_dir(),
        "output_data_dir": conf.output_data_dir(),
        "user_exp": ctx.user_action_logging(),
        "application": ctx.application(),
    }))
}

async fn list_experiments(State(ctx): State<AppContext>) -> Response {
    let session = ctx.session();
    let found = match session.list(keys::EXPERIMENTS) {
        Ok(found) => found,
        Err(e) => return internal(e),
    };
    let mut records = vec![];
    for key in found.iter().filter(|k| keys::parse_experiment(k).is_some()) {
        match session.get_document::<ExperimentRecord>(key) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => return internal(e),
        }
    }
    records.sort_by_key(|r| r.id);
    Json(records).into_response()
}

async fn get_experiment(State(ctx): State<AppContext>, Path(id): Path<u64>) -> Response {
    match ctx.session().get_document::<ExperimentRecord>(&keys::experiment(id)) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => not_found(format!("experiment {id}")),
        Err(e) => internal(e),
    }
}

async fn get_phase_metrics(
    State(ctx): State<AppContext>,
    Path((id, phase)): Path<(u64, String)>,
) -> Response {
    let Some(key) = phase_key(id, &phase, "metrics.yaml") else {
        return not_found(format!("phase '{phase}'"));
    };
    match ctx.session().get_document::<serde_json::Value>(&key) {
        Ok(Some(metrics)) => Json(metrics).into_response(),
        Ok(None) => not_found(format!("{phase} metrics of experiment {id}")),
        Err(e) => internal(e),
    }
}

async fn get_phase_predictions(
    State(ctx): State<AppContext>,
    Path((id, phase)): Path<(u64, String)>,
) -> Response {
    let Some(key) = phase_key(id, &phase, "predictions.parquet") else {
        return not_found(format!("phase '{phase}'"));
    };
    match ctx.session().get(&key) {
        Ok(Some(Record::Table(batch))) => {
            Json(storage::record_batch_to_rows(&batch)).into_response()
        }
        Ok(Some(Record::Document(_))) => internal(format!("record '{key}' is not a table")),
        Ok(None) => not_found(format!("{phase} predictions of experiment {id}")),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
struct UserActionRequest {
    action: String,
    experiment_id: Option<u64>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

/// Record a UI interaction when user-action logging is enabled.
async fn log_user_action(
    State(ctx): State<AppContext>,
    Json(req): Json<UserActionRequest>,
) -> Response {
    if !ctx.user_action_logging() {
        return StatusCode::NO_CONTENT.into_response();
    }
    let action = UserAction {
        detail: req.detail,
        ..UserAction::new(req.action, req.experiment_id)
    };

    let mut session = ctx.session();
    let staged = session
        .put_document(keys::user_action(&action), &action)
        .and_then(|()| session.commit());
    if let Err(e) = staged {
        session.rollback();
        warn!(error = %e, action = %action.action, "user action not recorded");
        return internal(e);
    }
    if let Err(e) = session.close() {
        return internal(e);
    }
    debug!(action = %action.action, experiment = ?action.experiment_id, "user action recorded");
    (StatusCode::CREATED, Json(action)).into_response()
}
