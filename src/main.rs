//! Backend entry point.
//!
//! Important env variables:
//!   PORT                : u16 (default 3000)
//!   DATABASE_PATH       : SQLite file (default "fluentloop.db")
//!   OPENAI_API_KEY      : enables the generator if present
//!   OPENAI_BASE_URL     : default "https://api.openai.com/v1"
//!   MODEL_NAME          : default "gpt-4o-mini"
//!   LESSON_MODEL / ASSESSMENT_MODEL / CHEAP_MODEL : per-use-case overrides
//!   AGENT_CONFIG_PATH   : path to TOML config (prompt overrides)
//!   LOG_LEVEL           : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT          : "pretty" (default) or "json"

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use fluentloop::routes::build_router;
use fluentloop::state::AppState;
use fluentloop::telemetry;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
  telemetry::init_tracing();

  // Build shared application state (store, generator, prompts, dispatcher).
  let state = Arc::new(AppState::new().await?);

  // Build the HTTP router with routes, CORS and tracing layers.
  let app = build_router(state);

  // Read port from env or default to 3000.
  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "fluentloop", %addr, "HTTP server listening");
  axum::serve(listener, app).await?;
  Ok(())
}
