//! Difficulty engine: windowed performance profile and Learning DNA
//! snapshots.
//!
//! The window is scoped to attempts since the most recent CEFR level
//! change, so a freshly promoted student re-enters cold start and gets
//! easier content until the engine has data at the new level. Lifetime
//! average would punish early struggles; the recent window lets a
//! recovering learner be offered appropriate content.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::instrument;

use crate::config::Settings;
use crate::domain::{DnaSnapshot, GlobalRecommendation, SkillRecommendation, Trajectory};
use crate::error::Result;
use crate::store::{ItemOutcome, Store};
use crate::util::{mean, round2};

/// Attempts inspected for the trajectory split.
const TRAJECTORY_SPAN: usize = 10;
/// Minimum attempts before a trend is callable at all.
const TRAJECTORY_MIN: usize = 4;
/// Recent-half must beat the earlier half by this many points to count
/// as improving (and vice versa for declining).
const TRAJECTORY_MARGIN: f64 = 10.0;

/// Fewer scored points than this per skill means "insufficient data".
const SKILL_MIN_POINTS: usize = 2;

/// Classify the trend of chronological scores (percent, oldest first):
/// split the last ten into an earlier and a recent half and compare means.
pub fn trajectory_of(scores_pct: &[f64]) -> Trajectory {
  if scores_pct.len() < TRAJECTORY_MIN {
    return Trajectory::Stable;
  }
  let span = &scores_pct[scores_pct.len().saturating_sub(TRAJECTORY_SPAN)..];
  let mid = span.len() / 2;
  let earlier = mean(&span[..mid]).unwrap_or(0.0);
  let recent = mean(&span[mid..]).unwrap_or(0.0);

  let diff = recent - earlier;
  if diff >= TRAJECTORY_MARGIN {
    Trajectory::Improving
  } else if diff <= -TRAJECTORY_MARGIN {
    Trajectory::Declining
  } else {
    Trajectory::Stable
  }
}

/// Global recommendation from the recent average, with the two-point
/// cold-start minimum: below it the safe default is to decrease.
pub fn global_recommendation(
  recent_avg: f64,
  trajectory: Trajectory,
  attempt_count: usize,
) -> (GlobalRecommendation, bool) {
  if attempt_count < SKILL_MIN_POINTS {
    return (GlobalRecommendation::DecreaseDifficulty, true);
  }
  let rec = if recent_avg >= 70.0 {
    if trajectory == Trajectory::Improving {
      GlobalRecommendation::IncreaseDifficulty
    } else {
      GlobalRecommendation::Maintain
    }
  } else if recent_avg >= 40.0 {
    if trajectory == Trajectory::Declining {
      GlobalRecommendation::DecreaseDifficulty
    } else {
      GlobalRecommendation::Maintain
    }
  } else {
    GlobalRecommendation::DecreaseDifficulty
  };
  (rec, false)
}

/// Per-skill recommendations over the most recent `window` items of each
/// skill. `outcomes` arrive newest first.
pub fn skill_profile(
  outcomes: &[ItemOutcome],
  window: usize,
) -> BTreeMap<String, SkillRecommendation> {
  let mut per_skill: BTreeMap<String, Vec<bool>> = BTreeMap::new();
  for outcome in outcomes {
    let bucket = per_skill.entry(outcome.skill_tag.clone()).or_default();
    if bucket.len() < window {
      bucket.push(outcome.is_correct);
    }
  }

  per_skill
    .into_iter()
    .map(|(skill, results)| {
      let rec = if results.len() < SKILL_MIN_POINTS {
        SkillRecommendation::Insufficient
      } else {
        let correct = results.iter().filter(|c| **c).count();
        let pct = correct as f64 / results.len() as f64 * 100.0;
        if pct >= 70.0 {
          SkillRecommendation::Challenge
        } else if pct >= 40.0 {
          SkillRecommendation::Maintain
        } else {
          SkillRecommendation::Simplify
        }
      };
      (skill, rec)
    })
    .collect()
}

/// Assemble a snapshot from the store without persisting it.
#[instrument(level = "debug", skip(store, settings))]
pub async fn compute_snapshot(
  store: &Store,
  settings: &Settings,
  student_id: i64,
) -> Result<DnaSnapshot> {
  let since = store.last_level_change_at(student_id).await?;
  let scores: Vec<f64> = store
    .attempt_scores_since(student_id, since.as_deref())
    .await?
    .into_iter()
    .map(|s| s * 100.0)
    .collect();

  let window_start = scores.len().saturating_sub(settings.dna_window);
  let recent_avg = round2(mean(&scores[window_start..]).unwrap_or(0.0));
  let lifetime_avg = round2(mean(&scores).unwrap_or(0.0));
  let trajectory = trajectory_of(&scores);
  let (global, cold_start) = global_recommendation(recent_avg, trajectory, scores.len());

  let outcomes = store
    .recent_item_outcomes(student_id, since.as_deref(), 200)
    .await?;
  let per_skill = skill_profile(&outcomes, settings.dna_window);

  Ok(DnaSnapshot {
    computed_at: Utc::now().to_rfc3339(),
    attempt_count: scores.len(),
    recent_avg,
    lifetime_avg,
    per_skill,
    global_recommendation: global,
    trajectory,
    cold_start,
  })
}

/// Compute and append a new snapshot version for the student.
#[instrument(level = "info", skip(store, settings), fields(trigger_event))]
pub async fn recompute_and_store(
  store: &Store,
  settings: &Settings,
  student_id: i64,
  trigger_event: &str,
) -> Result<(DnaSnapshot, i64)> {
  let snapshot = compute_snapshot(store, settings, student_id).await?;
  let version = store.insert_dna(student_id, &snapshot, trigger_event).await?;
  tracing::info!(
    target: "learning_loop",
    student_id,
    version,
    recent_avg = snapshot.recent_avg,
    recommendation = %snapshot.global_recommendation,
    trajectory = %snapshot.trajectory,
    "DNA snapshot written"
  );
  Ok((snapshot, version))
}
