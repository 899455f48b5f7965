//! Plan updater: turns the latest attempt, teacher observations, DNA and
//! L1 profile into the next versioned learning plan.
//!
//! The generator writes the plan under the continuity rules carried in the
//! prompt; this module enforces the hard contract afterwards. A plan whose
//! difficulty recommendation disagrees with the DNA is rejected and the
//! previous plan stays current.

use tracing::{info, instrument, warn};

use crate::config::{Prompts, Settings};
use crate::dna;
use crate::domain::{DnaSnapshot, PlanDraft};
use crate::error::{EngineError, Result};
use crate::generator::{Generator, UseCase};
use crate::interference;
use crate::store::Store;
use crate::util::fill_template;

#[derive(Clone, Debug)]
pub struct PlanUpdateOutcome {
  pub plan_id: i64,
  pub version: i64,
  pub plan: PlanDraft,
}

/// Produce and persist the next plan version for the student.
/// `trigger` is one of quiz_submission / teacher_notes / session_completed.
#[instrument(level = "info", skip(store, generator, prompts, settings))]
pub async fn update_plan(
  store: &Store,
  generator: Option<&Generator>,
  prompts: &Prompts,
  settings: &Settings,
  student_id: i64,
  trigger: &str,
) -> Result<PlanUpdateOutcome> {
  let Some(generator) = generator else {
    return Err(EngineError::Transient("generator unavailable; plan not updated".into()));
  };

  let student = store.get_student(student_id).await?;

  // Latest DNA is the difficulty authority for this update; fall back to a
  // fresh computation when no snapshot exists yet.
  let snapshot: DnaSnapshot = match store.latest_dna(student_id).await? {
    Some((snapshot, _)) => snapshot,
    None => dna::compute_snapshot(store, settings, student_id).await?,
  };

  let previous = store.latest_plan(student_id).await?;
  let (previous_version, previous_plan_text) = match &previous {
    Some(row) => (row.version, row.plan_json.clone()),
    None => (0, "No previous plan exists.".to_string()),
  };

  let user = assemble_user_prompt(
    store,
    prompts,
    settings,
    student_id,
    &student.name,
    &student.current_level,
    &snapshot,
    previous_version,
    &previous_plan_text,
  )
  .await?;

  let system = fill_template(
    &prompts.plan_system,
    &[("plan_drop_max", &settings.plan_drop_max_per_update.to_string())],
  );

  let plan: PlanDraft = generator
    .generate(UseCase::Lesson, &system, &user, 0.5)
    .await?;

  // Hard contract: the plan's directive must agree with the DNA.
  if plan.difficulty_adjustment.recommendation != snapshot.global_recommendation {
    return Err(EngineError::GenerationInvalid(format!(
      "plan recommendation {} disagrees with DNA {}",
      plan.difficulty_adjustment.recommendation, snapshot.global_recommendation
    )));
  }

  let plan_json =
    serde_json::to_string(&plan).map_err(|e| EngineError::Validation(e.to_string()))?;

  // The uniqueness constraint on (student_id, version) guards concurrent
  // writers; one retry re-reads MAX(version).
  let (plan_id, version) = match store
    .insert_plan_next_version(student_id, &plan_json, &plan.summary)
    .await
  {
    Ok(ok) => ok,
    Err(EngineError::StoreConflict(msg)) => {
      warn!(target: "learning_loop", student_id, %msg, "plan version conflict, retrying once");
      store
        .insert_plan_next_version(student_id, &plan_json, &plan.summary)
        .await?
    }
    Err(e) => return Err(e),
  };

  info!(
    target: "learning_loop",
    student_id,
    version,
    trigger,
    recommendation = %plan.difficulty_adjustment.recommendation,
    "learning plan updated"
  );

  Ok(PlanUpdateOutcome { plan_id, version, plan })
}

#[allow(clippy::too_many_arguments)]
async fn assemble_user_prompt(
  store: &Store,
  prompts: &Prompts,
  settings: &Settings,
  student_id: i64,
  student_name: &str,
  current_level: &str,
  snapshot: &DnaSnapshot,
  previous_version: i64,
  previous_plan_text: &str,
) -> Result<String> {
  // Aggregate per-skill accuracy across the recent item window.
  let outcomes = store.recent_item_outcomes(student_id, None, 50).await?;
  let mut per_skill: std::collections::BTreeMap<String, (u32, u32)> = Default::default();
  for o in &outcomes {
    let entry = per_skill.entry(o.skill_tag.clone()).or_default();
    entry.1 += 1;
    if o.is_correct {
      entry.0 += 1;
    }
  }
  let skill_breakdown = if per_skill.is_empty() {
    "No skill data available yet.".to_string()
  } else {
    per_skill
      .iter()
      .map(|(skill, (correct, total))| {
        let accuracy = (*correct as f64 / *total as f64 * 100.0).round() as u32;
        let status = if accuracy < 60 {
          "weak"
        } else if accuracy < 80 {
          "ok"
        } else {
          "strong"
        };
        format!("- {skill}: {accuracy}% accuracy ({correct}/{total}) - {status}")
      })
      .collect::<Vec<_>>()
      .join("\n")
  };

  // Mistakes from the most recent attempt.
  let recent_mistakes = match store.latest_attempt(student_id).await? {
    Some(attempt) => {
      let items = store.attempt_items(attempt.id).await?;
      let lines: Vec<String> = items
        .iter()
        .filter(|i| i.is_correct == 0)
        .take(10)
        .map(|i| {
          format!(
            "- [{}] Expected: '{}', Got: '{}'",
            i.skill_tag,
            i.expected_answer.as_deref().unwrap_or(""),
            i.student_answer.as_deref().unwrap_or(""),
          )
        })
        .collect();
      if lines.is_empty() {
        "No mistakes recorded.".to_string()
      } else {
        lines.join("\n")
      }
    }
    None => "No attempts yet.".to_string(),
  };

  let scores = store.attempt_scores_since(student_id, None).await?;
  let quiz_count = scores.len();
  let average_score = if scores.is_empty() {
    0
  } else {
    (scores.iter().sum::<f64>() / scores.len() as f64 * 100.0).round() as i64
  };

  let observations = store
    .recent_observations(student_id, settings.observation_lookback as i64)
    .await?;
  let observations_text = if observations.is_empty() {
    "No teacher observations.".to_string()
  } else {
    observations
      .iter()
      .map(|o| {
        let mut line = format!("- {}: {:.0}/100", o.skill, o.score);
        if let Some(level) = &o.cefr_level {
          line.push_str(&format!(" ({level})"));
        }
        if let Some(notes) = &o.notes {
          line.push_str(&format!(" — {notes}"));
        }
        line
      })
      .collect::<Vec<_>>()
      .join("\n")
  };

  let l1 = interference::student_profile(store, student_id).await?;
  let l1_text = if l1.exhibited.is_empty() {
    "None recorded.".to_string()
  } else {
    l1.exhibited
      .iter()
      .take(8)
      .map(|p| format!("- {}/{} (seen {}x)", p.category, p.detail, p.occurrences))
      .collect::<Vec<_>>()
      .join("\n")
  };

  let history = store.cefr_history(student_id, 5).await?;
  let history_text = if history.is_empty() {
    "No previous level records.".to_string()
  } else {
    history
      .iter()
      .map(|h| format!("- {}: {} via {}", h.recorded_at, h.level, h.source))
      .collect::<Vec<_>>()
      .join("\n")
  };

  Ok(fill_template(
    &prompts.plan_user_template,
    &[
      ("student_name", student_name),
      ("current_level", current_level),
      ("dna_recommendation", &snapshot.global_recommendation.to_string()),
      ("trajectory", &snapshot.trajectory.to_string()),
      ("recent_avg", &snapshot.recent_avg.to_string()),
      ("lifetime_avg", &snapshot.lifetime_avg.to_string()),
      ("previous_version", &previous_version.to_string()),
      ("previous_plan", previous_plan_text),
      ("quiz_count", &quiz_count.to_string()),
      ("average_score", &average_score.to_string()),
      ("skill_breakdown", &skill_breakdown),
      ("recent_mistakes", &recent_mistakes),
      ("observations", &observations_text),
      ("l1_patterns", &l1_text),
      ("cefr_history", &history_text),
    ],
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{CefrLevel, DifficultyAdjustment, GlobalRecommendation};
  use crate::generator::testing::{Scripted, ScriptedBackend};
  use std::sync::Arc;

  fn plan_json(recommendation: &str) -> String {
    format!(
      r#"{{
        "summary": "Focus on articles",
        "goals_next_2_weeks": ["use a/an correctly"],
        "top_weaknesses": [
          {{"skill_area": "articles_indefinite", "accuracy_observed": 0, "priority": "high"}}
        ],
        "difficulty_adjustment": {{
          "current_level": "A1",
          "recommendation": "{recommendation}",
          "rationale": "scores are low"
        }},
        "grammar_focus": "articles",
        "vocabulary_focus": "daily life",
        "recommended_drills": ["article gap fill"],
        "teacher_guidance": {{}}
      }}"#
    )
  }

  async fn seeded_store() -> (Store, i64) {
    let store = Store::connect_in_memory().await.unwrap();
    let sid = store
      .create_student("Kasia", "polish", "A1", None, None)
      .await
      .unwrap();
    (store, sid)
  }

  #[tokio::test]
  async fn versions_increment_across_updates() {
    let (store, sid) = seeded_store().await;
    let settings = Settings::default();
    let prompts = Prompts::default();

    for expected_version in 1..=3i64 {
      let backend = Arc::new(ScriptedBackend::new(vec![Scripted::Json(plan_json(
        "decrease_difficulty",
      ))]));
      let generator = Generator::new(backend, &settings);
      let out = update_plan(&store, Some(&generator), &prompts, &settings, sid, "quiz_submission")
        .await
        .unwrap();
      assert_eq!(out.version, expected_version);
    }
    assert_eq!(store.plan_versions(sid).await.unwrap(), vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn recommendation_mismatch_aborts_and_keeps_previous_plan() {
    let (store, sid) = seeded_store().await;
    let settings = Settings::default();
    let prompts = Prompts::default();

    // Seed v1 with a valid update (cold start DNA says decrease).
    let backend = Arc::new(ScriptedBackend::new(vec![Scripted::Json(plan_json(
      "decrease_difficulty",
    ))]));
    let generator = Generator::new(backend, &settings);
    update_plan(&store, Some(&generator), &prompts, &settings, sid, "quiz_submission")
      .await
      .unwrap();

    // Next update disagrees with the DNA directive.
    let backend = Arc::new(ScriptedBackend::new(vec![Scripted::Json(plan_json(
      "increase_difficulty",
    ))]));
    let generator = Generator::new(backend, &settings);
    let res =
      update_plan(&store, Some(&generator), &prompts, &settings, sid, "quiz_submission").await;
    assert!(matches!(res, Err(EngineError::GenerationInvalid(_))));

    let latest = store.latest_plan(sid).await.unwrap().unwrap();
    assert_eq!(latest.version, 1);
    let plan: PlanDraft = serde_json::from_str(&latest.plan_json).unwrap();
    assert_eq!(
      plan.difficulty_adjustment,
      DifficultyAdjustment {
        current_level: CefrLevel::A1,
        recommendation: GlobalRecommendation::DecreaseDifficulty,
        rationale: "scores are low".into()
      }
    );
  }
}
