//! Application state: store, generator, prompts, settings, dispatcher.
//!
//! Components hold no global state of their own; everything a request
//! needs hangs off this struct, built once at startup.

use std::sync::Arc;
use tracing::{info, instrument};

use crate::config::{load_agent_config_from_env, Prompts, Settings};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::generator::{Generator, OpenAiBackend};
use crate::store::Store;

pub struct AppState {
  pub store: Store,
  pub generator: Option<Generator>,
  pub prompts: Prompts,
  pub settings: Settings,
  pub dispatcher: Dispatcher,
}

impl AppState {
  /// Build state from env: settings, prompt config, database, generator.
  #[instrument(level = "info", skip_all)]
  pub async fn new() -> Result<Self> {
    let settings = Settings::from_env();
    let prompts = load_agent_config_from_env()
      .map(|cfg| cfg.prompts)
      .unwrap_or_default();

    let store = Store::connect(&settings.database_path).await?;
    info!(target: "fluentloop", path = %settings.database_path, "store connected");

    let generator = match OpenAiBackend::from_env() {
      Some(backend) => {
        info!(target: "fluentloop", "generator enabled");
        Some(Generator::new(Arc::new(backend), &settings))
      }
      None => {
        info!(target: "fluentloop", "generator disabled (no OPENAI_API_KEY); generation steps will fail soft");
        None
      }
    };

    let dispatcher = Dispatcher::new(&settings);

    Ok(Self { store, generator, prompts, settings, dispatcher })
  }
}
