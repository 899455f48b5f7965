//! Session orchestrator: the session state machine and the pipelines its
//! transitions fire.
//!
//! Transitions: requested → confirmed → completed, with cancellation from
//! either non-terminal state. Terminal states reject every event. The
//! post-confirmation pipeline (lesson, then quiz) is fail-soft: generation
//! failures are reported in the envelope but never block or revert the
//! transition.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info, instrument, warn};

use crate::config::{Prompts, Settings};
use crate::dna;
use crate::domain::{CefrLevel, LessonDraft, QuizDraft, SessionStatus, StepStatus};
use crate::error::{EngineError, Result};
use crate::generator::Generator;
use crate::interference;
use crate::lesson;
use crate::planner;
use crate::reassess;
use crate::scorer::{self, ScoredItem, WeakArea};
use crate::srs;
use crate::store::{SessionRow, Store};

/// Per-step outcome in the fail-soft confirmation envelope.
#[derive(Clone, Debug, Serialize)]
pub struct StepReport {
  pub status: StepStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub id: Option<i64>,
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub already_existed: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl StepReport {
  fn pending() -> Self {
    Self { status: StepStatus::Pending, id: None, already_existed: false, error: None }
  }

  fn completed(id: i64, already_existed: bool) -> Self {
    Self { status: StepStatus::Completed, id: Some(id), already_existed, error: None }
  }

  fn failed(error: String) -> Self {
    Self { status: StepStatus::Failed, id: None, already_existed: false, error: Some(error) }
  }
}

#[derive(Clone, Debug, Serialize)]
pub struct ConfirmEnvelope {
  pub session_id: i64,
  pub status: SessionStatus,
  pub lesson: StepReport,
  pub quiz: StepReport,
}

#[derive(Clone, Debug, Serialize)]
pub struct CompleteEnvelope {
  pub session_id: i64,
  pub status: SessionStatus,
  pub learning_points_extracted: usize,
  pub plan_updated: bool,
}

/// One teacher skill rating captured at completion.
#[derive(Clone, Debug)]
pub struct ObservationInput {
  pub skill: String,
  pub score: f64,
  pub cefr_level: Option<String>,
  pub notes: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SubmitOutcome {
  pub quiz_id: i64,
  pub attempt_id: i64,
  /// Percent, rounded.
  pub score: i64,
  pub correct_count: u32,
  pub total_questions: u32,
  pub items: Vec<ScoredItem>,
  pub weak_areas: Vec<WeakArea>,
  /// False when an earlier submission's stored result was returned.
  pub first_submission: bool,
}

/// Stored with the attempt row; the replay path reads it back.
#[derive(serde::Deserialize, Serialize)]
struct AttemptResults {
  score: i64,
  correct_count: u32,
  total_questions: u32,
  weak_areas: Vec<WeakArea>,
  skill_breakdown: std::collections::BTreeMap<String, scorer::SkillStats>,
}

// ── Session lifecycle ──────────────────────────────────────────────────

/// `create_request`: insert the session in `requested`.
#[instrument(level = "info", skip(store))]
pub async fn request_session(
  store: &Store,
  student_id: i64,
  teacher_id: i64,
  scheduled_at: &str,
  duration_min: i64,
) -> Result<SessionRow> {
  if scheduled_at.trim().is_empty() {
    return Err(EngineError::Validation("scheduled_at is required".into()));
  }
  if !(15..=180).contains(&duration_min) {
    return Err(EngineError::Validation("duration_min must be 15-180".into()));
  }
  store.get_student(student_id).await?;

  let session_id = store
    .create_session(student_id, teacher_id, scheduled_at, duration_min)
    .await?;
  info!(target: "learning_loop", session_id, student_id, "session requested");
  store.get_session(session_id).await
}

/// `confirm`: requested → confirmed, then the post-confirmation pipeline.
/// Re-confirming a confirmed session re-runs the (idempotent) pipeline
/// without recreating rows; terminal states reject the event.
#[instrument(level = "info", skip(store, generator, prompts, settings))]
pub async fn confirm_session(
  store: &Store,
  generator: Option<&Generator>,
  prompts: &Prompts,
  settings: &Settings,
  session_id: i64,
) -> Result<ConfirmEnvelope> {
  let session = store.get_session(session_id).await?;
  match session.status()? {
    SessionStatus::Requested => {
      store.set_session_status(session_id, SessionStatus::Confirmed).await?;
      info!(target: "learning_loop", session_id, "session confirmed");
    }
    SessionStatus::Confirmed => {
      info!(target: "learning_loop", session_id, "session already confirmed, re-running pipeline");
    }
    from @ (SessionStatus::Completed | SessionStatus::Cancelled) => {
      return Err(EngineError::InvalidTransition { from, event: "confirm" });
    }
  }

  let (lesson_report, quiz_report) =
    post_confirmation_pipeline(store, generator, prompts, settings, session_id).await;

  Ok(ConfirmEnvelope {
    session_id,
    status: SessionStatus::Confirmed,
    lesson: lesson_report,
    quiz: quiz_report,
  })
}

/// The fail-soft lesson → quiz sequence. Never returns an error: the
/// session stays confirmed whatever happens here.
async fn post_confirmation_pipeline(
  store: &Store,
  generator: Option<&Generator>,
  prompts: &Prompts,
  settings: &Settings,
  session_id: i64,
) -> (StepReport, StepReport) {
  let mut quiz_report = StepReport::pending();

  let lesson_report = match generator {
    None => StepReport::failed("generator unavailable".into()),
    Some(generator) => {
      match lesson::build_lesson_for_session(store, generator, prompts, settings, session_id).await
      {
        Ok(out) => StepReport::completed(out.artifact_id, out.already_existed),
        Err(e) => {
          warn!(target: "learning_loop", session_id, error = %e, "lesson generation failed");
          StepReport::failed(e.to_string())
        }
      }
    }
  };

  // Quiz derivation only makes sense with a lesson to derive from.
  if lesson_report.status == StepStatus::Completed {
    if let Some(generator) = generator {
      quiz_report = match lesson::build_quiz_from_lesson(store, generator, prompts, session_id).await
      {
        Ok(out) => StepReport::completed(out.quiz_id, out.already_existed),
        Err(e) => {
          warn!(target: "learning_loop", session_id, error = %e, "quiz generation failed");
          StepReport::failed(e.to_string())
        }
      };
    }
  }

  (lesson_report, quiz_report)
}

/// `cancel`: allowed from requested and confirmed only.
#[instrument(level = "info", skip(store))]
pub async fn cancel_session(store: &Store, session_id: i64) -> Result<SessionRow> {
  let session = store.get_session(session_id).await?;
  match session.status()? {
    SessionStatus::Requested | SessionStatus::Confirmed => {
      store.set_session_status(session_id, SessionStatus::Cancelled).await?;
      info!(target: "learning_loop", session_id, "session cancelled");
      store.get_session(session_id).await
    }
    from => Err(EngineError::InvalidTransition { from, event: "cancel" }),
  }
}

/// `complete` with notes: confirmed → completed, then the post-class
/// pipeline (best-effort learning-point extraction, observation ingestion,
/// plan update on substantive notes).
#[allow(clippy::too_many_arguments)]
#[instrument(level = "info", skip_all, fields(session_id = session_id))]
pub async fn complete_session(
  store: &Store,
  generator: Option<&Generator>,
  prompts: &Prompts,
  settings: &Settings,
  session_id: i64,
  teacher_notes: Option<&str>,
  homework: Option<&str>,
  session_summary: Option<&str>,
  observations: &[ObservationInput],
) -> Result<CompleteEnvelope> {
  let session = store.get_session(session_id).await?;
  match session.status()? {
    SessionStatus::Confirmed => {}
    from => return Err(EngineError::InvalidTransition { from, event: "complete" }),
  }

  store
    .complete_session(session_id, teacher_notes, homework, session_summary)
    .await?;
  info!(target: "learning_loop", session_id, "session completed");

  let student_id = session.student_id;
  for obs in observations {
    store
      .insert_observation(
        student_id,
        session_id,
        &obs.skill,
        obs.score,
        obs.cefr_level.as_deref(),
        obs.notes.as_deref(),
      )
      .await?;
  }

  // Post-class pipeline, all best-effort from here on.
  let mut learning_points_extracted = 0;
  if let Some(generator) = generator {
    if let Ok(Some(artifact)) = store.artifact_for_session(session_id).await {
      if let Ok(draft) = serde_json::from_str::<LessonDraft>(&artifact.lesson_json) {
        let level = store
          .get_student(student_id)
          .await
          .map(|s| s.current_level)
          .unwrap_or_else(|_| CefrLevel::A2.to_string());
        let points = srs::extract_learning_points(generator, prompts, &draft, &level).await;
        for point in &points {
          match store
            .insert_spaced_item(
              student_id,
              "learning_point",
              &point.point_type,
              &point.content,
              point.polish_explanation.as_deref(),
              point.example_sentence.as_deref(),
            )
            .await
          {
            Ok(_) => learning_points_extracted += 1,
            Err(e) => warn!(target: "learning_loop", error = %e, "failed to store learning point"),
          }
        }
      }
    }
  }

  let notes_len = teacher_notes.map(str::len).unwrap_or(0)
    + session_summary.map(str::len).unwrap_or(0);
  let has_teacher_input = notes_len > 0 || !observations.is_empty();

  if has_teacher_input {
    if let Err(e) = dna::recompute_and_store(store, settings, student_id, "teacher_notes").await {
      warn!(target: "learning_loop", student_id, error = %e, "DNA recompute on notes failed");
    }
  }

  let mut plan_updated = false;
  if notes_len >= settings.teacher_notes_substantive_chars {
    match planner::update_plan(store, generator, prompts, settings, student_id, "teacher_notes")
      .await
    {
      Ok(out) => {
        plan_updated = true;
        info!(target: "learning_loop", student_id, version = out.version, "plan updated from teacher notes");
      }
      Err(e) => {
        error!(target: "learning_loop", student_id, error = %e, "plan update from notes failed; previous plan stays");
      }
    }
  }

  Ok(CompleteEnvelope {
    session_id,
    status: SessionStatus::Completed,
    learning_points_extracted,
    plan_updated,
  })
}

// ── Quiz submission ────────────────────────────────────────────────────

/// Score a submitted quiz and run the post-attempt chain (DNA, plan,
/// reassessment) in order, so the plan-update effect is observable before
/// any later lesson build for this student.
#[instrument(level = "info", skip(store, generator, prompts, settings, answers))]
pub async fn submit_quiz(
  store: &Store,
  generator: Option<&Generator>,
  prompts: &Prompts,
  settings: &Settings,
  quiz_id: i64,
  student_id: i64,
  answers: &HashMap<String, String>,
) -> Result<SubmitOutcome> {
  let quiz_row = store.get_quiz(quiz_id).await?;
  if quiz_row.student_id != student_id {
    return Err(EngineError::Validation(format!(
      "quiz {quiz_id} does not belong to student {student_id}"
    )));
  }
  let draft: QuizDraft = serde_json::from_str(&quiz_row.quiz_json)
    .map_err(|e| EngineError::Validation(format!("corrupt quiz: {e}")))?;

  // Idempotency: the first attempt's result is the result. An attempt row
  // without submitted_at is a crash leftover; scoring resumes onto it.
  let mut resumed_attempt = None;
  if let Some(existing) = store.attempt_for_quiz(quiz_id, student_id).await? {
    if existing.submitted_at.is_some() {
      info!(target: "learning_loop", quiz_id, attempt_id = existing.id, "quiz already submitted, replaying result");
      return replay_attempt(store, &draft, quiz_id, student_id).await;
    }
    resumed_attempt = Some(existing.id);
  }

  let student = store.get_student(student_id).await?;
  let level: CefrLevel = student
    .current_level
    .parse()
    .unwrap_or(CefrLevel::A2);

  let outcome = scorer::score_quiz(&draft, answers, level, generator, prompts, settings).await;

  let attempt_id = match resumed_attempt {
    Some(id) => id,
    None => match store
      .insert_attempt(quiz_id, student_id, Some(quiz_row.session_id))
      .await
    {
      Ok(id) => id,
      // Lost a race with a concurrent submission of the same quiz: replay
      // the winner's result.
      Err(EngineError::StoreConflict(_)) => {
        return replay_attempt(store, &draft, quiz_id, student_id).await;
      }
      Err(e) => return Err(e),
    },
  };

  let item_rows: Vec<(String, bool, String, String, String)> = outcome
    .items
    .iter()
    .map(|item| {
      (
        item.question_id.clone(),
        item.is_correct,
        item.student_answer.clone(),
        item.expected_answer.clone(),
        item.skill_tag.clone(),
      )
    })
    .collect();
  store.insert_attempt_items(attempt_id, &item_rows).await?;

  let results = AttemptResults {
    score: (outcome.score * 100.0).round() as i64,
    correct_count: outcome.correct_count,
    total_questions: outcome.total_questions,
    weak_areas: outcome.weak_areas.clone(),
    skill_breakdown: outcome.skill_breakdown.clone(),
  };
  let results_json =
    serde_json::to_string(&results).map_err(|e| EngineError::Validation(e.to_string()))?;
  store.submit_attempt(attempt_id, outcome.score, &results_json).await?;

  info!(
    target: "learning_loop",
    quiz_id,
    attempt_id,
    student_id,
    score = results.score,
    "quiz attempt scored"
  );

  // Wrong open-ended answers are real learner prose: scan them for L1
  // interference and record what turns up (best-effort).
  if let Some(generator) = generator {
    let prose: Vec<&str> = outcome
      .items
      .iter()
      .filter(|i| i.needs_ai_grading && !i.is_correct && !i.student_answer.trim().is_empty())
      .map(|i| i.student_answer.as_str())
      .collect();
    if !prose.is_empty() {
      let detected = interference::analyze_text(
        generator,
        prompts,
        &prose.join("\n"),
        &student.current_level,
      )
      .await;
      for pattern in detected {
        if let Err(e) = store
          .upsert_interference(student_id, &pattern.category, &pattern.detail)
          .await
        {
          warn!(target: "learning_loop", student_id, error = %e, "failed to record L1 pattern");
        }
      }
    }
  }

  // Post-attempt chain. Each step is fail-soft; order matters.
  if let Err(e) = dna::recompute_and_store(store, settings, student_id, "quiz_submission").await {
    warn!(target: "learning_loop", student_id, error = %e, "DNA recompute failed");
  }
  if let Err(e) =
    planner::update_plan(store, generator, prompts, settings, student_id, "quiz_submission").await
  {
    error!(target: "learning_loop", student_id, error = %e, "plan update failed; previous plan stays current");
  }
  match reassess::maybe_reassess(store, generator, prompts, settings, student_id).await {
    Ok(Some(change)) => {
      info!(
        target: "learning_loop",
        student_id,
        from = %change.old_level,
        to = %change.new_level,
        "level changed by reassessment"
      );
    }
    Ok(None) => {}
    Err(e) => {
      error!(target: "learning_loop", student_id, error = %e, "reassessment failed; level unchanged");
    }
  }

  Ok(SubmitOutcome {
    quiz_id,
    attempt_id,
    score: results.score,
    correct_count: outcome.correct_count,
    total_questions: outcome.total_questions,
    items: outcome.items,
    weak_areas: outcome.weak_areas,
    first_submission: true,
  })
}

/// Rebuild a submit response from the stored attempt.
async fn replay_attempt(
  store: &Store,
  draft: &QuizDraft,
  quiz_id: i64,
  student_id: i64,
) -> Result<SubmitOutcome> {
  let attempt = store
    .attempt_for_quiz(quiz_id, student_id)
    .await?
    .ok_or(EngineError::NotFound("quiz attempt", quiz_id))?;
  let results: AttemptResults = attempt
    .results_json
    .as_deref()
    .and_then(|j| serde_json::from_str(j).ok())
    .ok_or_else(|| EngineError::Validation("attempt has no stored results".into()))?;

  let questions: HashMap<&str, &crate::domain::QuizQuestion> =
    draft.questions.iter().map(|q| (q.id.as_str(), q)).collect();

  let items = store
    .attempt_items(attempt.id)
    .await?
    .into_iter()
    .map(|row| {
      let question = questions.get(row.question_id.as_str());
      ScoredItem {
        question_id: row.question_id.clone(),
        question_text: question.map(|q| q.text.clone()).unwrap_or_default(),
        question_type: question
          .map(|q| q.kind)
          .unwrap_or(crate::domain::QuestionType::MultipleChoice),
        student_answer: row.student_answer.unwrap_or_default(),
        is_correct: row.is_correct != 0,
        expected_answer: row.expected_answer.unwrap_or_default(),
        needs_ai_grading: false,
        explanation: question
          .and_then(|q| q.explanation.clone())
          .unwrap_or_default(),
        skill_tag: row.skill_tag,
      }
    })
    .collect();

  Ok(SubmitOutcome {
    quiz_id,
    attempt_id: attempt.id,
    score: results.score,
    correct_count: results.correct_count,
    total_questions: results.total_questions,
    items,
    weak_areas: results.weak_areas,
    first_submission: false,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::generator::testing::{Scripted, ScriptedBackend};
  use crate::lesson::testing as fixtures;
  use std::sync::Arc;

  async fn seeded() -> (Store, i64, i64) {
    let store = Store::connect_in_memory().await.unwrap();
    let student = store
      .create_student("Kasia", "polish", "A1", None, None)
      .await
      .unwrap();
    let teacher = store
      .create_student("Teacher", "polish", "C2", None, None)
      .await
      .unwrap();
    (store, student, teacher)
  }

  fn gen(responses: Vec<Scripted>) -> Generator {
    Generator::new(Arc::new(ScriptedBackend::new(responses)), &Settings::default())
  }

  #[tokio::test]
  async fn lifecycle_follows_the_transition_table() {
    let (store, student, teacher) = seeded().await;
    let prompts = Prompts::default();
    let settings = Settings::default();

    let session = request_session(&store, student, teacher, "2026-08-10T10:00:00Z", 60)
      .await
      .unwrap();
    assert_eq!(session.status, "requested");

    // complete from requested is rejected.
    let res = complete_session(
      &store, None, &prompts, &settings, session.id, None, None, None, &[],
    )
    .await;
    assert!(matches!(res, Err(EngineError::InvalidTransition { .. })));

    let cancelled = cancel_session(&store, session.id).await.unwrap();
    assert_eq!(cancelled.status, "cancelled");

    // Terminal: every further event is rejected.
    assert!(matches!(
      cancel_session(&store, session.id).await,
      Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
      confirm_session(&store, None, &prompts, &settings, session.id).await,
      Err(EngineError::InvalidTransition { .. })
    ));
  }

  #[tokio::test]
  async fn duration_bounds_are_validated() {
    let (store, student, teacher) = seeded().await;
    let res = request_session(&store, student, teacher, "2026-08-10T10:00:00Z", 10).await;
    assert!(matches!(res, Err(EngineError::Validation(_))));
  }

  #[tokio::test]
  async fn confirm_is_fail_soft_when_the_generator_times_out() {
    let (store, student, teacher) = seeded().await;
    let session = request_session(&store, student, teacher, "2026-08-10T10:00:00Z", 60)
      .await
      .unwrap();

    // Both lesson attempts time out.
    let generator = gen(vec![
      Scripted::Fail(|| EngineError::Timeout { secs: 60 }),
      Scripted::Fail(|| EngineError::Timeout { secs: 45 }),
    ]);
    let envelope = confirm_session(
      &store,
      Some(&generator),
      &Prompts::default(),
      &Settings::default(),
      session.id,
    )
    .await
    .unwrap();

    // The transition held; the pipeline reported failure; nothing persisted.
    assert_eq!(envelope.status, SessionStatus::Confirmed);
    assert_eq!(envelope.lesson.status, StepStatus::Failed);
    assert_eq!(envelope.quiz.status, StepStatus::Pending);
    assert_eq!(store.get_session(session.id).await.unwrap().status, "confirmed");
    assert!(store.artifact_for_session(session.id).await.unwrap().is_none());
    assert!(store.quiz_for_session(session.id).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn reconfirm_does_not_recreate_lesson_or_quiz() {
    let (store, student, teacher) = seeded().await;
    let session = request_session(&store, student, teacher, "2026-08-10T10:00:00Z", 60)
      .await
      .unwrap();

    let generator = gen(vec![
      Scripted::Json(fixtures::lesson_json(
        "Articles",
        "Articles a/an",
        &[("grammar", "articles_indefinite")],
      )),
      Scripted::Json(fixtures::quiz_json()),
    ]);
    let prompts = Prompts::default();
    let settings = Settings::default();
    let first = confirm_session(&store, Some(&generator), &prompts, &settings, session.id)
      .await
      .unwrap();
    assert_eq!(first.lesson.status, StepStatus::Completed);
    assert_eq!(first.quiz.status, StepStatus::Completed);

    // Re-confirm with an exhausted generator: idempotency short-circuits
    // before any generation.
    let exhausted = gen(vec![]);
    let second = confirm_session(&store, Some(&exhausted), &prompts, &settings, session.id)
      .await
      .unwrap();
    assert_eq!(second.lesson.status, StepStatus::Completed);
    assert!(second.lesson.already_existed);
    assert!(second.quiz.already_existed);
    assert_eq!(first.lesson.id, second.lesson.id);
    assert_eq!(first.quiz.id, second.quiz.id);
  }

  #[tokio::test]
  async fn resubmission_returns_the_first_result_without_a_second_attempt() {
    let (store, student, teacher) = seeded().await;
    let session = request_session(&store, student, teacher, "2026-08-10T10:00:00Z", 60)
      .await
      .unwrap();
    let generator = gen(vec![
      Scripted::Json(fixtures::lesson_json(
        "Articles",
        "Articles a/an",
        &[("grammar", "articles_indefinite")],
      )),
      Scripted::Json(fixtures::quiz_json()),
    ]);
    let prompts = Prompts::default();
    let settings = Settings::default();
    confirm_session(&store, Some(&generator), &prompts, &settings, session.id)
      .await
      .unwrap();
    let quiz = store.quiz_for_session(session.id).await.unwrap().unwrap();

    let answers: HashMap<String, String> =
      [("q1", "a"), ("q2", "an"), ("q3", "I always drink tea"), ("q4", "tak")]
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();

    let first = submit_quiz(&store, None, &prompts, &settings, quiz.id, student, &answers)
      .await
      .unwrap();
    assert!(first.first_submission);
    assert_eq!(first.score, 100);

    // Second submission with different (wrong) answers replays the first.
    let wrong: HashMap<String, String> =
      [("q1", "x")].into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let second = submit_quiz(&store, None, &prompts, &settings, quiz.id, student, &wrong)
      .await
      .unwrap();
    assert!(!second.first_submission);
    assert_eq!(second.attempt_id, first.attempt_id);
    assert_eq!(second.score, 100);
  }
}
