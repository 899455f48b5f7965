//! Generator client: the only gateway to the external structured generator.
//!
//! We only call chat.completions in strict JSON mode. Calls are instrumented
//! and log use case, model, latencies and token usage (never contents).
//! The `ChatBackend` trait is the seam tests script against; `Generator`
//! wraps any backend with the timeout/retry budget and typed parsing.
//!
//! NOTE: We never log the API key and we keep payload truncations short.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{EngineError, Result};

/// What the call is for. Routes to the configured model and tags the logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UseCase {
  Lesson,
  Quiz,
  Assessment,
  Grading,
  Cheap,
}

impl UseCase {
  pub fn as_str(self) -> &'static str {
    match self {
      UseCase::Lesson => "lesson",
      UseCase::Quiz => "quiz",
      UseCase::Assessment => "assessment",
      UseCase::Grading => "grading",
      UseCase::Cheap => "cheap",
    }
  }
}

/// One JSON-mode chat completion against whatever sits behind the seam.
#[async_trait]
pub trait ChatBackend: Send + Sync {
  async fn chat_json(
    &self,
    use_case: UseCase,
    system: &str,
    user: &str,
    temperature: f32,
  ) -> Result<String>;
}

/// OpenAI-compatible backend.
pub struct OpenAiBackend {
  client: reqwest::Client,
  api_key: String,
  base_url: String,
  model_name: String,
  lesson_model: Option<String>,
  assessment_model: Option<String>,
  cheap_model: Option<String>,
}

impl OpenAiBackend {
  /// Construct the backend if we find OPENAI_API_KEY; otherwise None and
  /// the engine runs without generation (every call fails soft upstream).
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let model_name = std::env::var("MODEL_NAME").unwrap_or_else(|_| "gpt-4o-mini".into());

    // No connect timeout here: per-attempt deadlines live in `Generator`.
    let client = reqwest::Client::builder().build().ok()?;

    Some(Self {
      client,
      api_key,
      base_url,
      model_name,
      lesson_model: std::env::var("LESSON_MODEL").ok(),
      assessment_model: std::env::var("ASSESSMENT_MODEL").ok(),
      cheap_model: std::env::var("CHEAP_MODEL").ok(),
    })
  }

  fn resolve_model(&self, use_case: UseCase) -> &str {
    let configured = match use_case {
      UseCase::Lesson | UseCase::Quiz => self.lesson_model.as_deref(),
      UseCase::Assessment | UseCase::Grading => self.assessment_model.as_deref(),
      UseCase::Cheap => self.cheap_model.as_deref(),
    };
    configured.unwrap_or(&self.model_name)
  }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
  #[instrument(level = "info", skip(self, system, user), fields(use_case = use_case.as_str()))]
  async fn chat_json(
    &self,
    use_case: UseCase,
    system: &str,
    user: &str,
    temperature: f32,
  ) -> Result<String> {
    let model = self.resolve_model(use_case);
    let url = format!("{}/chat/completions", self.base_url);
    let req = ChatCompletionRequest {
      model: model.to_string(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
    };

    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, "fluentloop-backend/0.3")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req)
      .send()
      .await
      .map_err(|e| {
        if e.is_timeout() {
          EngineError::Timeout { secs: 0 }
        } else {
          EngineError::Transient(e.to_string())
        }
      })?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_api_error(&body).unwrap_or(body);
      return Err(EngineError::Transient(format!("generator HTTP {status}: {msg}")));
    }

    let body: ChatCompletionResponse = res
      .json()
      .await
      .map_err(|e| EngineError::Transient(e.to_string()))?;
    if let Some(usage) = &body.usage {
      info!(
        %model,
        prompt_tokens = ?usage.prompt_tokens,
        completion_tokens = ?usage.completion_tokens,
        total_tokens = ?usage.total_tokens,
        "generator usage"
      );
    }
    let text = body
      .choices
      .first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default();
    Ok(text)
  }
}

/// Retry/timeout wrapper over a backend, with typed result parsing.
#[derive(Clone)]
pub struct Generator {
  backend: Arc<dyn ChatBackend>,
  timeout_initial: Duration,
  timeout_retry: Duration,
  retries: u32,
}

impl Generator {
  pub fn new(backend: Arc<dyn ChatBackend>, settings: &Settings) -> Self {
    Self {
      backend,
      timeout_initial: Duration::from_secs(settings.generator_timeout_initial_secs),
      timeout_retry: Duration::from_secs(settings.generator_timeout_retry_secs),
      retries: settings.generator_retries,
    }
  }

  /// One structured generation: up to `1 + retries` attempts, first with
  /// the generous deadline, retries with the shorter one. Retriable only
  /// on timeout/transient failures; a schema mismatch is final and never
  /// coerced. `T` is the schema the returned object must parse against.
  #[instrument(
    level = "info",
    skip(self, system, user),
    fields(use_case = use_case.as_str(), call_id = %Uuid::new_v4())
  )]
  pub async fn generate<T: DeserializeOwned>(
    &self,
    use_case: UseCase,
    system: &str,
    user: &str,
    temperature: f32,
  ) -> Result<T> {
    let mut last_err = EngineError::Transient("no generation attempt made".into());

    for attempt in 0..=self.retries {
      let budget = if attempt == 0 { self.timeout_initial } else { self.timeout_retry };
      let started = std::time::Instant::now();

      let outcome = tokio::time::timeout(
        budget,
        self.backend.chat_json(use_case, system, user, temperature),
      )
      .await;

      let elapsed = started.elapsed();
      match outcome {
        Err(_) => {
          warn!(?elapsed, attempt, "generator call hit its deadline");
          last_err = EngineError::Timeout { secs: budget.as_secs() };
        }
        Ok(Err(e)) if e.is_retriable() => {
          warn!(?elapsed, attempt, error = %e, "generator call failed, may retry");
          last_err = e;
        }
        Ok(Err(e)) => {
          error!(?elapsed, attempt, error = %e, "generator call failed fatally");
          return Err(e);
        }
        Ok(Ok(text)) => {
          info!(?elapsed, attempt, "generator call succeeded");
          return serde_json::from_str::<T>(&text).map_err(|e| {
            error!(error = %e, "generator output failed schema validation");
            EngineError::GenerationInvalid(e.to_string())
          });
        }
      }
    }

    Err(last_err)
  }
}

// ── Chat DTOs ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
}
#[derive(Serialize)]
struct ChatMessageReq {
  role: String,
  content: String,
}
#[derive(Serialize)]
struct ResponseFormat {
  #[serde(rename = "type")]
  r#type: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)]
  usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice {
  message: ChatMessageResp,
}
#[derive(Deserialize)]
struct ChatMessageResp {
  content: Option<String>,
}
#[derive(Deserialize)]
struct Usage {
  #[serde(default)]
  prompt_tokens: Option<u32>,
  #[serde(default)]
  completion_tokens: Option<u32>,
  #[serde(default)]
  total_tokens: Option<u32>,
}

/// Try to extract a clean error message from an API error body.
fn extract_api_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap {
    error: EObj,
  }
  #[derive(Deserialize)]
  struct EObj {
    message: String,
  }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}

#[cfg(test)]
pub mod testing {
  //! Scripted backend for tests: pops one canned outcome per call.

  use super::*;
  use std::collections::VecDeque;
  use tokio::sync::Mutex;

  pub enum Scripted {
    Json(String),
    Fail(fn() -> EngineError),
  }

  pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Scripted>>,
  }

  impl ScriptedBackend {
    pub fn new(responses: Vec<Scripted>) -> Self {
      Self { responses: Mutex::new(responses.into()) }
    }

    pub async fn remaining(&self) -> usize {
      self.responses.lock().await.len()
    }
  }

  #[async_trait]
  impl ChatBackend for ScriptedBackend {
    async fn chat_json(
      &self,
      _use_case: UseCase,
      _system: &str,
      _user: &str,
      _temperature: f32,
    ) -> Result<String> {
      match self.responses.lock().await.pop_front() {
        Some(Scripted::Json(s)) => Ok(s),
        Some(Scripted::Fail(make)) => Err(make()),
        None => Err(EngineError::Transient("scripted backend exhausted".into())),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::testing::{Scripted, ScriptedBackend};
  use super::*;
  use serde::Deserialize;

  #[derive(Deserialize)]
  struct Toy {
    value: i32,
  }

  fn generator(responses: Vec<Scripted>) -> Generator {
    Generator::new(Arc::new(ScriptedBackend::new(responses)), &Settings::default())
  }

  #[tokio::test]
  async fn retries_once_on_timeout_then_succeeds() {
    let g = generator(vec![
      Scripted::Fail(|| EngineError::Timeout { secs: 60 }),
      Scripted::Json(r#"{"value": 7}"#.into()),
    ]);
    let toy: Toy = g.generate(UseCase::Lesson, "s", "u", 0.7).await.unwrap();
    assert_eq!(toy.value, 7);
  }

  #[tokio::test]
  async fn exhausts_budget_after_two_timeouts() {
    let g = generator(vec![
      Scripted::Fail(|| EngineError::Timeout { secs: 60 }),
      Scripted::Fail(|| EngineError::Timeout { secs: 45 }),
    ]);
    let res: Result<Toy> = g.generate(UseCase::Lesson, "s", "u", 0.7).await;
    assert!(matches!(res, Err(EngineError::Timeout { .. })));
  }

  #[tokio::test]
  async fn schema_mismatch_is_final_and_not_retried() {
    let backend = Arc::new(ScriptedBackend::new(vec![
      Scripted::Json(r#"{"wrong": true}"#.into()),
      Scripted::Json(r#"{"value": 1}"#.into()),
    ]));
    let g = Generator::new(backend.clone(), &Settings::default());
    let res: Result<Toy> = g.generate(UseCase::Quiz, "s", "u", 0.2).await;
    assert!(matches!(res, Err(EngineError::GenerationInvalid(_))));
    // The second canned response was never consumed.
    assert_eq!(backend.remaining().await, 1);
  }
}
