use std::future::ready;
use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::{ProcessResponse, ProcessResponseCode, ProcessorError};
use crate::event::TrackedEvent;
use crate::processor::{ProcessorState, PubsubProcessor};
use crate::prometheus::{setup_metrics_recorder, track_metrics};

#[derive(Clone)]
pub struct State {
    pub processor: Arc<PubsubProcessor>,
}

async fn index() -> &'static str {
    "capture-pubsub"
}

async fn readiness(state: AxumState<State>) -> impl IntoResponse {
    match state.processor.state() {
        ProcessorState::Ready => (StatusCode::OK, "ready"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

#[instrument(skip_all)]
async fn track(
    state: AxumState<State>,
    Json(event): Json<TrackedEvent>,
) -> Result<Json<ProcessResponse>, ProcessorError> {
    let receipt = state.processor.process(&event).await?;

    Ok(Json(ProcessResponse {
        status: ProcessResponseCode::Ok,
        message_ids: receipt.message_ids().to_vec(),
    }))
}

async fn service(state: AxumState<State>) -> StatusCode {
    state.processor.service();
    StatusCode::OK
}

pub fn router(processor: Arc<PubsubProcessor>, metrics: bool) -> Router {
    let state = State { processor };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/track", post(track))
        .route("/_service", get(service).post(service))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Installing a global recorder more than once per process fails, so tests
    // build the router without it.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
