//! HTTP request handlers: metrics exposition, probes, index page and snapshot JSON.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use tracing::error;

use walg_exporter_core::{VERSION, metrics};

use crate::state::AppState;

// ============================================================
// Metrics
// ============================================================

pub(crate) async fn handle_metrics(State(state): State<AppState>) -> Response {
    match metrics::encode(&state.registry) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================
// Probes
// ============================================================

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

/// Ready once the first collection cycle has published a snapshot.
pub(crate) async fn handle_ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.snapshots.latest().is_some() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

// ============================================================
// Index
// ============================================================

pub(crate) async fn handle_index(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        r#"<html>
<head><title>WAL-G Exporter</title></head>
<body>
<h1>WAL-G Prometheus Exporter</h1>
<p><a href="{path}">Metrics</a></p>
<p><a href="/health">Health</a></p>
<p><a href="/ready">Ready</a></p>
<p><a href="/api/v1/snapshot">Snapshot</a></p>
<p>Version: {VERSION}</p>
</body>
</html>
"#,
        path = state.metrics_path,
    ))
}

// ============================================================
// Snapshot
// ============================================================

pub(crate) async fn handle_snapshot(State(state): State<AppState>) -> Response {
    match state.snapshots.latest() {
        Some(snapshot) => Json(&*snapshot).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no snapshot collected yet").into_response(),
    }
}
