//! Spaced repetition: SM-2 scheduling state for learning points and
//! vocabulary cards, plus extraction of new points from a finished lesson.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, instrument};

use crate::config::Prompts;
use crate::domain::{ExtractedPoint, ExtractedPoints, LessonDraft};
use crate::error::Result;
use crate::generator::{Generator, UseCase};
use crate::store::Store;
use crate::util::fill_template;

const EASE_MIN: f64 = 1.3;

#[derive(Clone, Copy, Debug)]
pub struct Sm2State {
  pub ease_factor: f64,
  pub interval_days: f64,
  pub repetitions: i64,
}

#[derive(Clone, Debug)]
pub struct Sm2Update {
  pub ease_factor: f64,
  pub interval_days: f64,
  pub repetitions: i64,
  pub next_review: String,
}

/// Map a 0-100 recall score onto SM-2 quality 0-5.
pub fn quality_from_score(score: f64) -> u8 {
  if score < 30.0 {
    0
  } else if score < 50.0 {
    1
  } else if score < 60.0 {
    2
  } else if score < 70.0 {
    3
  } else if score < 85.0 {
    4
  } else {
    5
  }
}

/// Standard SM-2 step. Quality below 3 resets repetitions and drops the
/// interval back to one day; the ease factor never goes below 1.3.
pub fn sm2_update(state: Sm2State, quality: u8, now: DateTime<Utc>) -> Sm2Update {
  let q = quality.min(5) as f64;

  let mut ease = state.ease_factor + (0.1 - (5.0 - q) * (0.08 + (5.0 - q) * 0.02));
  if ease < EASE_MIN {
    ease = EASE_MIN;
  }

  let (repetitions, interval_days) = if quality < 3 {
    (0, 1.0)
  } else {
    let reps = state.repetitions + 1;
    let interval = match reps {
      1 => 1.0,
      2 => 6.0,
      _ => (state.interval_days * ease).round(),
    };
    (reps, interval)
  };

  let next_review = (now + Duration::days(interval_days as i64)).to_rfc3339();
  Sm2Update { ease_factor: ease, interval_days, repetitions, next_review }
}

/// Apply one recall review to a spaced item: band the score into SM-2
/// quality, step the schedule, persist the new state.
#[instrument(level = "info", skip(store))]
pub async fn record_review(store: &Store, item_id: i64, score: f64) -> Result<Sm2Update> {
  let item = store.get_spaced_item(item_id).await?;
  let quality = quality_from_score(score);
  let updated = sm2_update(
    Sm2State {
      ease_factor: item.ease_factor,
      interval_days: item.interval_days,
      repetitions: item.repetitions,
    },
    quality,
    Utc::now(),
  );
  store
    .update_spaced_item_review(
      item_id,
      updated.ease_factor,
      updated.interval_days,
      updated.repetitions,
      score,
      &updated.next_review,
    )
    .await?;
  info!(
    target: "learning_loop",
    item_id,
    quality,
    interval_days = updated.interval_days,
    "spaced item reviewed"
  );
  Ok(updated)
}

/// Ask the generator for reviewable learning points in a finished lesson.
/// Best effort: any failure yields an empty list and a log line.
#[instrument(level = "info", skip_all, fields(objective_len = lesson.objective.len()))]
pub async fn extract_learning_points(
  generator: &Generator,
  prompts: &Prompts,
  lesson: &LessonDraft,
  student_level: &str,
) -> Vec<ExtractedPoint> {
  let presentation_text = format!(
    "Topic: {}\nExplanation: {}\nExamples: {}",
    lesson.presentation.topic,
    lesson.presentation.explanation,
    lesson.presentation.examples.join("; "),
  );

  let exercises_text = lesson
    .controlled_practice
    .exercises
    .iter()
    .enumerate()
    .map(|(i, ex)| {
      format!(
        "{}. [{}] {} — {} (Answer: {})",
        i + 1,
        ex.kind,
        ex.instruction,
        ex.content,
        ex.answer.as_deref().unwrap_or("-"),
      )
    })
    .collect::<Vec<_>>()
    .join("\n");

  let conversation_text = format!(
    "{}\nPrompts: {}",
    lesson.free_practice.description,
    lesson.free_practice.conversation_prompts.join("; "),
  );

  let user = fill_template(
    &prompts.extract_points_user_template,
    &[
      ("student_level", student_level),
      ("objective", &lesson.objective),
      ("presentation_text", &presentation_text),
      ("exercises_text", &exercises_text),
      ("conversation_text", &conversation_text),
    ],
  );

  match generator
    .generate::<ExtractedPoints>(UseCase::Cheap, &prompts.extract_points_system, &user, 0.3)
    .await
  {
    Ok(points) => points.learning_points,
    Err(e) => {
      error!(target: "learning_loop", error = %e, "learning point extraction failed");
      Vec::new()
    }
  }
}
