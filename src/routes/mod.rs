//! Router assembly: HTTP endpoints, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;

/// Build the application router:
/// - REST API under `/api/v1/...` mapping the engine operations
/// - CORS (allow any origin/method/headers) – adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::http_health))
        // Students + intake assessment
        .route("/api/v1/students", post(http::http_create_student))
        .route("/api/v1/assessments", post(http::http_assessment_start))
        .route(
            "/api/v1/assessments/:id/placement",
            post(http::http_assessment_placement),
        )
        .route(
            "/api/v1/assessments/:id/diagnostic",
            post(http::http_assessment_diagnostic),
        )
        // Session lifecycle
        .route("/api/v1/sessions", post(http::http_session_request))
        .route("/api/v1/sessions/:id/confirm", post(http::http_session_confirm))
        .route("/api/v1/sessions/:id/cancel", post(http::http_session_cancel))
        .route("/api/v1/sessions/:id/complete", post(http::http_session_complete))
        // Quizzes
        .route("/api/v1/quizzes/:id/submit", post(http::http_quiz_submit))
        // Spaced repetition
        .route(
            "/api/v1/spaced-items/:id/review",
            post(http::http_spaced_item_review),
        )
        .route(
            "/api/v1/students/:id/quizzes/pending",
            get(http::http_pending_quizzes),
        )
        // Reads
        .route("/api/v1/students/:id/plan", get(http::http_latest_plan))
        .route("/api/v1/students/:id/dna", get(http::http_latest_dna))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
