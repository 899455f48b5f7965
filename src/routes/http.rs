//! HTTP endpoint handlers. Thin wrappers that forward to the engine;
//! student-affecting pipelines go through the dispatcher so per-student
//! ordering and the pipeline deadline hold regardless of transport.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use tracing::{info, instrument};

use crate::domain::QuizDraft;
use crate::error::EngineError;
use crate::intake;
use crate::orchestrator::{self, ObservationInput};
use crate::protocol::*;
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

#[instrument(level = "info")]
pub async fn http_health() -> Json<HealthOut> {
  Json(HealthOut { ok: true })
}

#[instrument(level = "info", skip(state, body), fields(name = %body.name))]
pub async fn http_create_student(
  State(state): State<Arc<AppState>>,
  Json(body): Json<StudentIn>,
) -> ApiResult<StudentOut> {
  if body.name.trim().is_empty() {
    return Err(EngineError::Validation("name is required".into()).into());
  }
  let goals = serde_json::to_string(&body.goals).ok();
  let problem_areas = serde_json::to_string(&body.problem_areas).ok();
  let id = state
    .store
    .create_student(
      body.name.trim(),
      body.native_language.as_deref().unwrap_or("polish"),
      body.current_level.as_deref().unwrap_or("pending"),
      goals.as_deref(),
      problem_areas.as_deref(),
    )
    .await?;
  let row = state.store.get_student(id).await?;
  info!(target: "learning_loop", student_id = id, "student created");
  Ok(Json(StudentOut {
    id: row.id,
    name: row.name,
    current_level: row.current_level,
    native_language: row.native_language,
  }))
}

#[instrument(level = "info", skip(state), fields(student_id = body.student_id))]
pub async fn http_assessment_start(
  State(state): State<Arc<AppState>>,
  Json(body): Json<AssessmentStartIn>,
) -> ApiResult<AssessmentStartOut> {
  let out = intake::start_assessment(&state.store, body.student_id).await?;
  Ok(Json(AssessmentStartOut {
    assessment_id: out.assessment_id,
    placement_questions: out.placement_questions,
  }))
}

#[instrument(level = "info", skip(state, body), fields(assessment_id = id))]
pub async fn http_assessment_placement(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
  Json(body): Json<AnswersIn>,
) -> ApiResult<PlacementOut> {
  let out = intake::submit_placement(&state.store, id, &body.answers).await?;
  Ok(Json(PlacementOut {
    bracket: out.bracket,
    placement_score: out.placement_score,
    diagnostic_questions: out.diagnostic_questions,
  }))
}

#[instrument(level = "info", skip(state, body), fields(assessment_id = id))]
pub async fn http_assessment_diagnostic(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
  Json(body): Json<AnswersIn>,
) -> ApiResult<DiagnosticOut> {
  let assessment = state.store.get_assessment(id).await?;
  let student_id = assessment.student_id;
  let out = state
    .dispatcher
    .run(student_id, "assessment.diagnostic", async {
      intake::submit_diagnostic(
        &state.store,
        state.generator.as_ref(),
        &state.prompts,
        id,
        &body.answers,
      )
      .await
    })
    .await?;
  Ok(Json(DiagnosticOut {
    level: out.level.to_string(),
    confidence: out.confidence,
    weak_areas: out.weak_areas,
  }))
}

#[instrument(level = "info", skip(state, body), fields(student_id = body.student_id))]
pub async fn http_session_request(
  State(state): State<Arc<AppState>>,
  Json(body): Json<SessionRequestIn>,
) -> ApiResult<SessionOut> {
  let row = orchestrator::request_session(
    &state.store,
    body.student_id,
    body.teacher_id,
    &body.scheduled_at,
    body.duration_min,
  )
  .await?;
  Ok(Json(SessionOut {
    id: row.id,
    student_id: row.student_id,
    teacher_id: row.teacher_id,
    scheduled_at: row.scheduled_at,
    duration_min: row.duration_min,
    status: row.status,
  }))
}

#[instrument(level = "info", skip(state), fields(session_id = id))]
pub async fn http_session_confirm(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
) -> ApiResult<SessionConfirmOut> {
  let session = state.store.get_session(id).await?;
  let envelope = state
    .dispatcher
    .run(session.student_id, "session.confirm", async {
      orchestrator::confirm_session(
        &state.store,
        state.generator.as_ref(),
        &state.prompts,
        &state.settings,
        id,
      )
      .await
    })
    .await?;
  Ok(Json(envelope))
}

#[instrument(level = "info", skip(state), fields(session_id = id))]
pub async fn http_session_cancel(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
) -> ApiResult<SessionOut> {
  let row = orchestrator::cancel_session(&state.store, id).await?;
  Ok(Json(SessionOut {
    id: row.id,
    student_id: row.student_id,
    teacher_id: row.teacher_id,
    scheduled_at: row.scheduled_at,
    duration_min: row.duration_min,
    status: row.status,
  }))
}

#[instrument(level = "info", skip(state, body), fields(session_id = id))]
pub async fn http_session_complete(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
  Json(body): Json<SessionCompleteIn>,
) -> ApiResult<SessionCompleteOut> {
  let session = state.store.get_session(id).await?;
  let observations: Vec<ObservationInput> = body
    .observations
    .into_iter()
    .map(|o| ObservationInput {
      skill: o.skill,
      score: o.score,
      cefr_level: o.cefr_level,
      notes: o.notes,
    })
    .collect();

  let envelope = state
    .dispatcher
    .run(session.student_id, "session.complete", async {
      orchestrator::complete_session(
        &state.store,
        state.generator.as_ref(),
        &state.prompts,
        &state.settings,
        id,
        body.teacher_notes.as_deref(),
        body.homework.as_deref(),
        body.session_summary.as_deref(),
        &observations,
      )
      .await
    })
    .await?;

  Ok(Json(SessionCompleteOut {
    id: envelope.session_id,
    status: envelope.status.to_string(),
    learning_points_extracted: envelope.learning_points_extracted,
    plan_updated: envelope.plan_updated,
  }))
}

#[instrument(level = "info", skip(state, body), fields(quiz_id = id, student_id = body.student_id))]
pub async fn http_quiz_submit(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
  Json(body): Json<QuizSubmitIn>,
) -> ApiResult<QuizSubmitOut> {
  let outcome = state
    .dispatcher
    .run(body.student_id, "quiz.submit", async {
      orchestrator::submit_quiz(
        &state.store,
        state.generator.as_ref(),
        &state.prompts,
        &state.settings,
        id,
        body.student_id,
        &body.answers,
      )
      .await
    })
    .await?;
  Ok(Json(outcome))
}

#[instrument(level = "info", skip(state), fields(item_id = id))]
pub async fn http_spaced_item_review(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
  Json(body): Json<ReviewIn>,
) -> ApiResult<ReviewOut> {
  if !(0.0..=100.0).contains(&body.score) {
    return Err(EngineError::Validation("score must be 0-100".into()).into());
  }
  let updated = crate::srs::record_review(&state.store, id, body.score).await?;
  Ok(Json(ReviewOut {
    ease_factor: updated.ease_factor,
    interval_days: updated.interval_days,
    repetitions: updated.repetitions,
    next_review: updated.next_review,
  }))
}

#[instrument(level = "info", skip(state), fields(student_id = id))]
pub async fn http_pending_quizzes(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
) -> ApiResult<Vec<PendingQuizOut>> {
  let rows = state.store.pending_quizzes(id).await?;
  let out = rows
    .into_iter()
    .map(|row| {
      let draft: Option<QuizDraft> = serde_json::from_str(&row.quiz_json).ok();
      PendingQuizOut {
        id: row.id,
        session_id: row.session_id,
        title: draft
          .as_ref()
          .map(|d| d.title.clone())
          .unwrap_or_else(|| "Pre-class quiz".into()),
        question_count: draft.map(|d| d.questions.len()).unwrap_or(0),
        created_at: row.created_at,
      }
    })
    .collect();
  Ok(Json(out))
}

#[instrument(level = "info", skip(state), fields(student_id = id))]
pub async fn http_latest_plan(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
) -> ApiResult<PlanOut> {
  let row = state
    .store
    .latest_plan(id)
    .await?
    .ok_or(EngineError::NotFound("learning plan for student", id))?;
  let plan = serde_json::from_str(&row.plan_json)
    .map_err(|e| EngineError::Validation(format!("corrupt plan: {e}")))?;
  Ok(Json(PlanOut {
    version: row.version,
    summary: row.summary,
    plan,
    created_at: row.created_at,
  }))
}

#[instrument(level = "info", skip(state), fields(student_id = id))]
pub async fn http_latest_dna(
  State(state): State<Arc<AppState>>,
  Path(id): Path<i64>,
) -> ApiResult<DnaOut> {
  let (snapshot, version) = state
    .store
    .latest_dna(id)
    .await?
    .ok_or(EngineError::NotFound("DNA snapshot for student", id))?;
  let dna =
    serde_json::to_value(&snapshot).map_err(|e| EngineError::Validation(e.to_string()))?;
  Ok(Json(DnaOut { version, dna }))
}
