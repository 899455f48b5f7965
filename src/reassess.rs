//! Reassessment engine: trajectory-aware CEFR promotion and demotion.
//!
//! Event-driven: the orchestrator calls `maybe_reassess` after every
//! scored attempt; the engine self-gates on the minimum attempt count
//! since the last level change. Promotion needs an improving trajectory,
//! a recent-5 average above the floor, and assessor confidence; one
//! isolated high score never promotes. Demotion needs the level floor
//! broken with a declining trajectory in two consecutive windows.

use tracing::{info, instrument, warn};

use crate::config::{Prompts, Settings};
use crate::dna::{self, trajectory_of};
use crate::domain::{AssessorVerdict, CefrLevel, Trajectory};
use crate::error::Result;
use crate::generator::{Generator, UseCase};
use crate::store::Store;
use crate::util::{fill_template, mean, round2};

#[derive(Clone, Debug)]
pub struct ReassessOutcome {
  pub old_level: CefrLevel,
  pub new_level: CefrLevel,
  pub confidence: f64,
  pub trajectory: Trajectory,
  pub recent5: f64,
}

/// Check whether the student should change level; `None` when the gate is
/// closed or nothing changes. Errors leave the current level untouched.
#[instrument(level = "info", skip(store, generator, prompts, settings))]
pub async fn maybe_reassess(
  store: &Store,
  generator: Option<&Generator>,
  prompts: &Prompts,
  settings: &Settings,
  student_id: i64,
) -> Result<Option<ReassessOutcome>> {
  let since = store.last_level_change_at(student_id).await?;
  let scores: Vec<f64> = store
    .attempt_scores_since(student_id, since.as_deref())
    .await?
    .into_iter()
    .map(|s| s * 100.0)
    .collect();

  if scores.len() < settings.reassess_min_attempts {
    return Ok(None);
  }

  let student = store.get_student(student_id).await?;
  let current: CefrLevel = student
    .current_level
    .parse()
    .map_err(crate::error::EngineError::Validation)?;

  let trajectory = trajectory_of(&scores);
  let recent5_slice = &scores[scores.len().saturating_sub(5)..];
  let earlier_start = scores.len().saturating_sub(10);
  let earlier5_slice = &scores[earlier_start..scores.len().saturating_sub(5)];
  let recent5 = round2(mean(recent5_slice).unwrap_or(0.0));
  let earlier5 = round2(mean(earlier5_slice).unwrap_or(0.0));

  let confidence = match assessor_confidence(
    generator, prompts, store, student_id, current, &scores, trajectory, recent5, earlier5,
  )
  .await
  {
    Some(c) => c,
    None => deterministic_confidence(recent5 - earlier5, scores.len()),
  };

  // Promotion gate.
  if trajectory == Trajectory::Improving
    && recent5 >= settings.reassess_promote_floor
    && confidence >= settings.reassess_confidence_min
    && current != CefrLevel::C2
  {
    let new_level = current.next_up();
    apply_level_change(store, settings, student_id, new_level, confidence).await?;
    info!(
      target: "learning_loop",
      student_id,
      from = %current,
      to = %new_level,
      confidence,
      recent5,
      "student promoted"
    );
    return Ok(Some(ReassessOutcome {
      old_level: current,
      new_level,
      confidence,
      trajectory,
      recent5,
    }));
  }

  // Demotion gate: floor broken with the decline visible in this window
  // and in the previous one.
  let previous_window_declining =
    trajectory_of(&scores[..scores.len() - 1]) == Trajectory::Declining;
  if trajectory == Trajectory::Declining
    && previous_window_declining
    && recent5 < settings.demotion_floor(current)
  {
    let new_level = current.next_down();
    if new_level != current {
      apply_level_change(store, settings, student_id, new_level, confidence).await?;
      warn!(
        target: "learning_loop",
        student_id,
        from = %current,
        to = %new_level,
        recent5,
        "student demoted"
      );
      return Ok(Some(ReassessOutcome {
        old_level: current,
        new_level,
        confidence,
        trajectory,
        recent5,
      }));
    }
  }

  Ok(None)
}

async fn apply_level_change(
  store: &Store,
  settings: &Settings,
  student_id: i64,
  new_level: CefrLevel,
  confidence: f64,
) -> Result<()> {
  store
    .append_cefr(student_id, &new_level.to_string(), Some(confidence), "reassessment")
    .await?;
  store.set_student_level(student_id, &new_level.to_string()).await?;
  // The fresh CEFR entry resets the windowing scope, so this snapshot
  // re-enters cold start at the new level.
  dna::recompute_and_store(store, settings, student_id, "reassessment").await?;
  Ok(())
}

/// Ask the assessor for its confidence; None when unavailable or failing
/// (the caller then falls back to the deterministic substitute).
#[allow(clippy::too_many_arguments)]
async fn assessor_confidence(
  generator: Option<&Generator>,
  prompts: &Prompts,
  store: &Store,
  student_id: i64,
  current: CefrLevel,
  scores: &[f64],
  trajectory: Trajectory,
  recent5: f64,
  earlier5: f64,
) -> Option<f64> {
  let generator = generator?;

  let tags = store.recent_skill_tags(student_id, 20).await.ok()?;
  let tags_text = if tags.is_empty() {
    "No tagged lessons yet.".to_string()
  } else {
    tags
      .iter()
      .map(|(tag_type, value, level)| format!("- [{tag_type}] {value} ({level})"))
      .collect::<Vec<_>>()
      .join("\n")
  };

  let history = store.cefr_history(student_id, 3).await.ok()?;
  let history_text = if history.is_empty() {
    "No previous records.".to_string()
  } else {
    history
      .iter()
      .map(|h| format!("- {}: {} via {}", h.recorded_at, h.level, h.source))
      .collect::<Vec<_>>()
      .join("\n")
  };

  let scores_text = scores
    .iter()
    .map(|s| format!("{s:.0}"))
    .collect::<Vec<_>>()
    .join(", ");

  let user = fill_template(
    &prompts.reassessment_user_template,
    &[
      ("current_level", &current.to_string()),
      ("scores", &scores_text),
      ("recent5", &recent5.to_string()),
      ("earlier5", &earlier5.to_string()),
      ("trajectory", &trajectory.to_string()),
      ("skill_tags", &tags_text),
      ("history", &history_text),
    ],
  );

  match generator
    .generate::<AssessorVerdict>(UseCase::Assessment, &prompts.reassessment_system, &user, 0.3)
    .await
  {
    Ok(verdict) => Some(verdict.confidence_score),
    Err(e) => {
      warn!(target: "learning_loop", student_id, error = %e, "assessor unavailable, using deterministic confidence");
      None
    }
  }
}

/// Deterministic confidence substitute from trajectory strength and sample
/// size, capped below certainty.
fn deterministic_confidence(margin: f64, sample_size: usize) -> f64 {
  (0.5 + margin.max(0.0) / 100.0 + sample_size as f64 / 200.0).min(0.95)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::generator::testing::{Scripted, ScriptedBackend};
  use std::sync::Arc;

  async fn student_with_scores(store: &Store, scores: &[f64]) -> i64 {
    let sid = store
      .create_student("Kasia", "polish", "A1", None, None)
      .await
      .unwrap();
    let teacher = store
      .create_student("Teacher", "polish", "C2", None, None)
      .await
      .unwrap();
    // Initial level entry, as intake would write it.
    store.append_cefr(sid, "A1", Some(0.8), "intake_assessment").await.unwrap();

    for (i, score) in scores.iter().enumerate() {
      let session = store
        .create_session(sid, teacher, "2026-08-10T10:00:00Z", 60)
        .await
        .unwrap();
      let artifact = store
        .insert_artifact_with_tags(session, sid, teacher, "{}", "{}", "A1", "v1", &[])
        .await
        .unwrap();
      let quiz = store
        .insert_quiz(session, sid, "{}", artifact)
        .await
        .unwrap();
      let attempt = store.insert_attempt(quiz, sid, Some(session)).await.unwrap();
      store
        .submit_attempt(attempt, score / 100.0, &format!("{{\"cycle\": {i}}}"))
        .await
        .unwrap();
    }
    sid
  }

  fn assessor(confidence: f64) -> Generator {
    let backend = Arc::new(ScriptedBackend::new(vec![Scripted::Json(format!(
      r#"{{"determined_level": "A2", "confidence_score": {confidence},
           "weak_areas": [], "justification": "steady climb"}}"#
    ))]));
    Generator::new(backend, &Settings::default())
  }

  #[tokio::test]
  async fn improving_student_is_promoted_once_gates_open() {
    let store = Store::connect_in_memory().await.unwrap();
    let sid = student_with_scores(
      &store,
      &[20.0, 20.0, 33.0, 50.0, 60.0, 60.0, 60.0, 67.0, 80.0, 80.0],
    )
    .await;

    let generator = assessor(0.85);
    let out = maybe_reassess(
      &store,
      Some(&generator),
      &Prompts::default(),
      &Settings::default(),
      sid,
    )
    .await
    .unwrap()
    .expect("promotion expected");

    assert_eq!(out.old_level, CefrLevel::A1);
    assert_eq!(out.new_level, CefrLevel::A2);
    assert_eq!(out.trajectory, Trajectory::Improving);
    assert!((out.recent5 - 69.4).abs() < 1e-9);

    assert_eq!(store.get_student(sid).await.unwrap().current_level, "A2");
    // Intake entry plus exactly one promotion entry.
    assert_eq!(store.cefr_history(sid, 10).await.unwrap().len(), 2);
    // The post-promotion DNA snapshot re-enters cold start.
    let (snapshot, _) = store.latest_dna(sid).await.unwrap().unwrap();
    assert_eq!(snapshot.attempt_count, 0);
    assert!(snapshot.cold_start);
  }

  #[tokio::test]
  async fn gate_stays_closed_below_min_attempts() {
    let store = Store::connect_in_memory().await.unwrap();
    let sid = student_with_scores(&store, &[80.0, 85.0, 90.0, 95.0, 90.0]).await;
    let generator = assessor(0.95);
    let out = maybe_reassess(
      &store,
      Some(&generator),
      &Prompts::default(),
      &Settings::default(),
      sid,
    )
    .await
    .unwrap();
    assert!(out.is_none());
    assert_eq!(store.get_student(sid).await.unwrap().current_level, "A1");
  }

  #[tokio::test]
  async fn low_confidence_blocks_promotion() {
    let store = Store::connect_in_memory().await.unwrap();
    let sid = student_with_scores(
      &store,
      &[20.0, 20.0, 33.0, 50.0, 60.0, 60.0, 60.0, 67.0, 80.0, 80.0],
    )
    .await;
    let generator = assessor(0.4);
    let out = maybe_reassess(
      &store,
      Some(&generator),
      &Prompts::default(),
      &Settings::default(),
      sid,
    )
    .await
    .unwrap();
    assert!(out.is_none());
  }

  #[tokio::test]
  async fn deterministic_substitute_promotes_without_assessor() {
    let store = Store::connect_in_memory().await.unwrap();
    let sid = student_with_scores(
      &store,
      &[20.0, 20.0, 33.0, 50.0, 60.0, 60.0, 60.0, 67.0, 80.0, 80.0],
    )
    .await;
    let out = maybe_reassess(&store, None, &Prompts::default(), &Settings::default(), sid)
      .await
      .unwrap()
      .expect("deterministic confidence should clear the floor");
    // margin 32.8 and n=10 give 0.878.
    assert!((out.confidence - 0.878).abs() < 1e-9);
    assert_eq!(out.new_level, CefrLevel::A2);
  }

  #[tokio::test]
  async fn sustained_decline_below_floor_demotes() {
    let store = Store::connect_in_memory().await.unwrap();
    let sid = store
      .create_student("Marek", "polish", "A2", None, None)
      .await
      .unwrap();
    store.append_cefr(sid, "A2", Some(0.8), "intake_assessment").await.unwrap();
    let teacher = store
      .create_student("Teacher", "polish", "C2", None, None)
      .await
      .unwrap();
    for score in [70.0, 70.0, 68.0, 65.0, 60.0, 40.0, 30.0, 28.0, 25.0, 20.0, 22.0] {
      let session = store
        .create_session(sid, teacher, "2026-08-10T10:00:00Z", 60)
        .await
        .unwrap();
      let artifact = store
        .insert_artifact_with_tags(session, sid, teacher, "{}", "{}", "A2", "v1", &[])
        .await
        .unwrap();
      let quiz = store.insert_quiz(session, sid, "{}", artifact).await.unwrap();
      let attempt = store.insert_attempt(quiz, sid, Some(session)).await.unwrap();
      store.submit_attempt(attempt, score / 100.0, "{}").await.unwrap();
    }

    let out = maybe_reassess(&store, None, &Prompts::default(), &Settings::default(), sid)
      .await
      .unwrap()
      .expect("demotion expected");
    assert_eq!(out.old_level, CefrLevel::A2);
    assert_eq!(out.new_level, CefrLevel::A1);
    assert_eq!(store.get_student(sid).await.unwrap().current_level, "A1");
  }
}
