//! Public request/response DTOs for the HTTP adapter (serde ready).
//! Keep this small and stable so the engine and any gateway can evolve
//! independently.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineError;
use crate::intake::{DiagnosticQuestionOut, PlacementQuestionOut};
use crate::orchestrator::{ConfirmEnvelope, SubmitOutcome};

// ── Students ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct StudentIn {
  pub name: String,
  #[serde(default)]
  pub native_language: Option<String>,
  #[serde(default)]
  pub current_level: Option<String>,
  #[serde(default)]
  pub goals: Vec<String>,
  #[serde(default)]
  pub problem_areas: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StudentOut {
  pub id: i64,
  pub name: String,
  pub current_level: String,
  pub native_language: String,
}

// ── Assessment ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AssessmentStartIn {
  #[serde(rename = "studentId")]
  pub student_id: i64,
}

#[derive(Debug, Serialize)]
pub struct AssessmentStartOut {
  pub assessment_id: i64,
  pub placement_questions: Vec<PlacementQuestionOut>,
}

#[derive(Debug, Deserialize)]
pub struct AnswersIn {
  pub answers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct PlacementOut {
  pub bracket: String,
  pub placement_score: f64,
  pub diagnostic_questions: Vec<DiagnosticQuestionOut>,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticOut {
  pub level: String,
  pub confidence: f64,
  pub weak_areas: Vec<String>,
}

// ── Sessions ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SessionRequestIn {
  #[serde(rename = "studentId")]
  pub student_id: i64,
  #[serde(rename = "teacherId")]
  pub teacher_id: i64,
  pub scheduled_at: String,
  #[serde(default = "default_duration")]
  pub duration_min: i64,
}

fn default_duration() -> i64 {
  60
}

#[derive(Debug, Serialize)]
pub struct SessionOut {
  pub id: i64,
  pub student_id: i64,
  pub teacher_id: i64,
  pub scheduled_at: String,
  pub duration_min: i64,
  pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ObservationIn {
  pub skill: String,
  pub score: f64,
  #[serde(default)]
  pub cefr_level: Option<String>,
  #[serde(default)]
  pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionCompleteIn {
  #[serde(default)]
  pub teacher_notes: Option<String>,
  #[serde(default)]
  pub homework: Option<String>,
  #[serde(default)]
  pub session_summary: Option<String>,
  #[serde(default)]
  pub observations: Vec<ObservationIn>,
}

#[derive(Debug, Serialize)]
pub struct SessionCompleteOut {
  pub id: i64,
  pub status: String,
  pub learning_points_extracted: usize,
  pub plan_updated: bool,
}

/// The fail-soft confirm envelope goes out as-is.
pub type SessionConfirmOut = ConfirmEnvelope;

// ── Quizzes ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct QuizSubmitIn {
  #[serde(rename = "studentId")]
  pub student_id: i64,
  pub answers: HashMap<String, String>,
}

pub type QuizSubmitOut = SubmitOutcome;

#[derive(Debug, Serialize)]
pub struct PendingQuizOut {
  pub id: i64,
  pub session_id: i64,
  pub title: String,
  pub question_count: usize,
  pub created_at: String,
}

// ── Spaced repetition ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ReviewIn {
  /// Recall score 0-100.
  pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct ReviewOut {
  pub ease_factor: f64,
  pub interval_days: f64,
  pub repetitions: i64,
  pub next_review: String,
}

// ── Reads ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PlanOut {
  pub version: i64,
  pub summary: Option<String>,
  pub plan: serde_json::Value,
  pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct DnaOut {
  pub version: i64,
  pub dna: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
  pub ok: bool,
}

// ── Error envelope ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorOut {
  pub error: String,
}

/// Map engine failures onto HTTP statuses at the adapter boundary.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
  fn from(e: EngineError) -> Self {
    ApiError(e)
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self.0 {
      EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
      EngineError::InvalidTransition { .. } | EngineError::StoreConflict(_) => {
        StatusCode::CONFLICT
      }
      EngineError::NotFound(_, _) => StatusCode::NOT_FOUND,
      EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
      EngineError::GenerationInvalid(_) => StatusCode::BAD_GATEWAY,
      EngineError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
      EngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorOut { error: self.0.to_string() })).into_response()
  }
}
