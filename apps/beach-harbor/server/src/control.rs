use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use beach_harbor_core::{
    DesiredHandle, Intent, IntentSubmitter, MembershipOp, RoomName, SubmitError,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

/// Ready once the upstream handshake has been sent.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    ready: Arc<AtomicBool>,
}

impl Readiness {
    pub fn set_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!(from = "not_ready", to = "ready", "readiness transition");
        }
    }

    pub fn set_not_ready(&self) {
        if self.ready.swap(false, Ordering::SeqCst) {
            info!(from = "ready", to = "not_ready", "readiness transition");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

pub struct ControlState {
    pub submit: IntentSubmitter,
    pub desired: DesiredHandle,
    pub readiness: Readiness,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    channel: Option<String>,
}

pub fn build_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/join", get(join_handler).post(join_handler))
        .route("/part", get(part_handler).post(part_handler))
        .route("/channels", get(channels_handler))
        .route("/healthz", get(health_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn join_handler(
    State(state): State<Arc<ControlState>>,
    Query(query): Query<ChannelQuery>,
) -> Response {
    submit_intent(&state, MembershipOp::Join, query.channel)
}

async fn part_handler(
    State(state): State<Arc<ControlState>>,
    Query(query): Query<ChannelQuery>,
) -> Response {
    submit_intent(&state, MembershipOp::Part, query.channel)
}

fn submit_intent(state: &ControlState, op: MembershipOp, channel: Option<String>) -> Response {
    let Some(room) = channel.as_deref().and_then(RoomName::parse) else {
        counter!("beach_harbor_control_requests_total", 1, "op" => op.metric_label(), "outcome" => "bad_request");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing or invalid channel parameter" })),
        )
            .into_response();
    };

    let intent = Intent {
        op,
        channel: room.to_string(),
    };
    match state.submit.submit(intent) {
        Ok(()) => {
            counter!("beach_harbor_control_requests_total", 1, "op" => op.metric_label(), "outcome" => "queued");
            info!(%op, %room, "queued intent");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "queued", "op": op, "channel": room })),
            )
                .into_response()
        }
        Err(err) => {
            let outcome = match err {
                SubmitError::Full => "queue_full",
                SubmitError::Closed => "store_stopped",
            };
            counter!("beach_harbor_control_requests_total", 1, "op" => op.metric_label(), "outcome" => outcome);
            warn!(%op, %room, error = %err, "rejecting intent");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn channels_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    Json(state.desired.snapshot().as_ref().clone())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ready_handler(State(state): State<Arc<ControlState>>) -> Response {
    if state.readiness.is_ready() {
        Json(json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
            .into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
