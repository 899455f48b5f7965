//! Intake assessment: embedded placement bank, deterministic bracket
//! scoring, and the AI diagnostic that seeds the learner profile, the
//! initial CEFR history entry, and the learning path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, instrument};

use crate::config::Prompts;
use crate::domain::{CefrLevel, DiagnosticGap, LearnerProfileData};
use crate::error::{EngineError, Result};
use crate::generator::{Generator, UseCase};
use crate::scorer::normalize_answer;
use crate::store::Store;
use crate::util::fill_template;

struct PlacementItem {
  id: &'static str,
  text: &'static str,
  options: &'static [&'static str],
  answer: &'static str,
}

/// Fixed placement bank, easiest first. Deliberately small: placement only
/// needs a coarse bracket; the diagnostic stage does the fine-grained work.
const PLACEMENT_BANK: &[PlacementItem] = &[
  PlacementItem {
    id: "p1",
    text: "She ___ a student.",
    options: &["is", "are", "am"],
    answer: "is",
  },
  PlacementItem {
    id: "p2",
    text: "I have ___ apple.",
    options: &["a", "an", "the"],
    answer: "an",
  },
  PlacementItem {
    id: "p3",
    text: "___ you like coffee?",
    options: &["Do", "Does", "Are"],
    answer: "do",
  },
  PlacementItem {
    id: "p4",
    text: "He ___ to work every day.",
    options: &["go", "goes", "going"],
    answer: "goes",
  },
  PlacementItem {
    id: "p5",
    text: "We met ___ Monday.",
    options: &["in", "on", "at"],
    answer: "on",
  },
  PlacementItem {
    id: "p6",
    text: "Yesterday I ___ to the cinema.",
    options: &["go", "went", "have gone"],
    answer: "went",
  },
  PlacementItem {
    id: "p7",
    text: "I ___ here since 2020.",
    options: &["live", "lived", "have lived"],
    answer: "have lived",
  },
  PlacementItem {
    id: "p8",
    text: "If it rains, we ___ at home.",
    options: &["stay", "will stay", "would stay"],
    answer: "will stay",
  },
  PlacementItem {
    id: "p9",
    text: "The report ___ by the team last week.",
    options: &["wrote", "was written", "has written"],
    answer: "was written",
  },
  PlacementItem {
    id: "p10",
    text: "I'd rather you ___ earlier next time.",
    options: &["come", "came", "had come"],
    answer: "came",
  },
];

/// Open-ended diagnostic prompts per bracket.
const DIAGNOSTIC_BEGINNER: &[&str] = &[
  "Write 3-4 sentences about your family.",
  "Describe what you do every morning.",
  "What did you do last weekend? Write a few sentences.",
];
const DIAGNOSTIC_INTERMEDIATE: &[&str] = &[
  "Describe a trip you have taken. What happened?",
  "What are the advantages and disadvantages of working from home?",
  "Write about a plan you have for next year and how you will achieve it.",
];
const DIAGNOSTIC_ADVANCED: &[&str] = &[
  "Argue for or against: social media does more harm than good.",
  "Describe a professional challenge you overcame and what it taught you.",
  "If you could change one thing about your country's education system, what would it be and why?",
];

#[derive(Clone, Debug, Serialize)]
pub struct PlacementQuestionOut {
  pub id: String,
  pub text: String,
  pub options: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticQuestionOut {
  pub id: String,
  pub text: String,
}

#[derive(Clone, Debug)]
pub struct AssessmentStart {
  pub assessment_id: i64,
  pub placement_questions: Vec<PlacementQuestionOut>,
}

#[derive(Clone, Debug)]
pub struct PlacementOutcome {
  pub bracket: String,
  pub placement_score: f64,
  pub diagnostic_questions: Vec<DiagnosticQuestionOut>,
}

#[derive(Clone, Debug)]
pub struct DiagnosticOutcome {
  pub level: CefrLevel,
  pub confidence: f64,
  pub weak_areas: Vec<String>,
}

fn placement_questions_out() -> Vec<PlacementQuestionOut> {
  PLACEMENT_BANK
    .iter()
    .map(|item| PlacementQuestionOut {
      id: item.id.into(),
      text: item.text.into(),
      options: item.options.iter().map(|o| o.to_string()).collect(),
    })
    .collect()
}

fn diagnostic_questions_for(bracket: &str) -> Vec<DiagnosticQuestionOut> {
  let bank = match bracket {
    "beginner" => DIAGNOSTIC_BEGINNER,
    "intermediate" => DIAGNOSTIC_INTERMEDIATE,
    _ => DIAGNOSTIC_ADVANCED,
  };
  bank
    .iter()
    .enumerate()
    .map(|(i, text)| DiagnosticQuestionOut { id: format!("d{}", i + 1), text: (*text).into() })
    .collect()
}

/// Begin intake for a student. A student with a completed assessment keeps
/// it; intake runs exactly once.
#[instrument(level = "info", skip(store))]
pub async fn start_assessment(store: &Store, student_id: i64) -> Result<AssessmentStart> {
  store.get_student(student_id).await?;
  if store.completed_assessment_exists(student_id).await? {
    return Err(EngineError::Validation(format!(
      "student {student_id} already has a completed assessment"
    )));
  }

  let assessment_id = store.create_assessment(student_id).await?;
  info!(target: "learning_loop", student_id, assessment_id, "assessment started");
  Ok(AssessmentStart { assessment_id, placement_questions: placement_questions_out() })
}

/// Score placement deterministically and hand out the diagnostic stage.
#[instrument(level = "info", skip(store, answers))]
pub async fn submit_placement(
  store: &Store,
  assessment_id: i64,
  answers: &HashMap<String, String>,
) -> Result<PlacementOutcome> {
  let assessment = store.get_assessment(assessment_id).await?;
  if assessment.status != "placement" {
    return Err(EngineError::Validation(format!(
      "assessment {assessment_id} is in '{}', not 'placement'",
      assessment.status
    )));
  }

  let correct = PLACEMENT_BANK
    .iter()
    .filter(|item| {
      answers
        .get(item.id)
        .map(|given| normalize_answer(given) == normalize_answer(item.answer))
        .unwrap_or(false)
    })
    .count();
  let placement_score = correct as f64 / PLACEMENT_BANK.len() as f64 * 100.0;

  let bracket = if placement_score < 40.0 {
    "beginner"
  } else if placement_score <= 70.0 {
    "intermediate"
  } else {
    "advanced"
  };

  let answers_json =
    serde_json::to_string(answers).map_err(|e| EngineError::Validation(e.to_string()))?;
  store
    .record_placement(assessment_id, bracket, placement_score, &answers_json)
    .await?;

  info!(target: "learning_loop", assessment_id, bracket, placement_score, "placement scored");
  Ok(PlacementOutcome {
    bracket: bracket.into(),
    placement_score,
    diagnostic_questions: diagnostic_questions_for(bracket),
  })
}

/// Full diagnostic report expected back from the assessor.
#[derive(Debug, Deserialize)]
struct DiagnosticReport {
  determined_level: CefrLevel,
  confidence_score: f64,
  #[serde(default)]
  weak_areas: Vec<String>,
  #[serde(default)]
  gaps: Vec<DiagnosticGap>,
  #[serde(default)]
  priorities: Vec<String>,
  #[serde(default)]
  profile_summary: String,
  recommended_start_level: CefrLevel,
}

/// Route diagnostic answers to the assessor, then persist the completed
/// assessment, learner profile, initial CEFR entry and learning path.
#[instrument(level = "info", skip(store, generator, prompts, answers))]
pub async fn submit_diagnostic(
  store: &Store,
  generator: Option<&Generator>,
  prompts: &Prompts,
  assessment_id: i64,
  answers: &HashMap<String, String>,
) -> Result<DiagnosticOutcome> {
  let assessment = store.get_assessment(assessment_id).await?;
  if assessment.status != "diagnostic" {
    return Err(EngineError::Validation(format!(
      "assessment {assessment_id} is in '{}', not 'diagnostic'",
      assessment.status
    )));
  }
  let Some(generator) = generator else {
    return Err(EngineError::Transient("generator unavailable; diagnostic cannot run".into()));
  };

  let student = store.get_student(assessment.student_id).await?;
  let bracket = assessment.bracket.as_deref().unwrap_or("beginner");
  let answers_text = answers
    .iter()
    .map(|(id, text)| format!("[{id}] {text}"))
    .collect::<Vec<_>>()
    .join("\n");

  let user = fill_template(
    &prompts.diagnostic_user_template,
    &[
      ("bracket", bracket),
      (
        "placement_score",
        &format!("{:.0}", assessment.placement_score.unwrap_or(0.0)),
      ),
      ("answers", &answers_text),
      ("goals", student.goals.as_deref().unwrap_or("not specified")),
      (
        "problem_areas",
        student.problem_areas.as_deref().unwrap_or("not specified"),
      ),
    ],
  );

  let report: DiagnosticReport = generator
    .generate(UseCase::Assessment, &prompts.diagnostic_system, &user, 0.3)
    .await?;

  let weak_areas_json = serde_json::to_string(&report.weak_areas)
    .map_err(|e| EngineError::Validation(e.to_string()))?;
  store
    .complete_assessment(
      assessment_id,
      &report.determined_level.to_string(),
      report.confidence_score,
      &weak_areas_json,
    )
    .await?;

  store
    .insert_learner_profile(
      assessment.student_id,
      &LearnerProfileData {
        gaps: report.gaps,
        priorities: report.priorities,
        profile_summary: report.profile_summary,
        recommended_start_level: report.recommended_start_level,
      },
    )
    .await?;

  store
    .set_student_level(assessment.student_id, &report.determined_level.to_string())
    .await?;
  store
    .append_cefr(
      assessment.student_id,
      &report.determined_level.to_string(),
      Some(report.confidence_score),
      "intake_assessment",
    )
    .await?;
  store
    .insert_learning_path(
      assessment.student_id,
      &report.determined_level.next_up().to_string(),
      &report.determined_level.to_string(),
      "{}",
    )
    .await?;

  info!(
    target: "learning_loop",
    student_id = assessment.student_id,
    level = %report.determined_level,
    confidence = report.confidence_score,
    "intake assessment completed"
  );

  Ok(DiagnosticOutcome {
    level: report.determined_level,
    confidence: report.confidence_score,
    weak_areas: report.weak_areas,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Settings;
  use crate::generator::testing::{Scripted, ScriptedBackend};
  use std::sync::Arc;

  fn all_correct() -> HashMap<String, String> {
    PLACEMENT_BANK
      .iter()
      .map(|i| (i.id.to_string(), i.answer.to_string()))
      .collect()
  }

  #[tokio::test]
  async fn placement_brackets_track_score() {
    let store = Store::connect_in_memory().await.unwrap();
    let sid = store.create_student("Ala", "polish", "pending", None, None).await.unwrap();

    let start = start_assessment(&store, sid).await.unwrap();
    assert_eq!(start.placement_questions.len(), PLACEMENT_BANK.len());

    let out = submit_placement(&store, start.assessment_id, &all_correct()).await.unwrap();
    assert_eq!(out.bracket, "advanced");
    assert_eq!(out.placement_score, 100.0);
    assert_eq!(out.diagnostic_questions.len(), 3);

    // Placement cannot be submitted twice.
    let again = submit_placement(&store, start.assessment_id, &all_correct()).await;
    assert!(matches!(again, Err(EngineError::Validation(_))));
  }

  #[tokio::test]
  async fn diagnostic_seeds_profile_level_history_and_path() {
    let store = Store::connect_in_memory().await.unwrap();
    let sid = store.create_student("Ala", "polish", "pending", None, None).await.unwrap();
    let start = start_assessment(&store, sid).await.unwrap();
    submit_placement(&store, start.assessment_id, &HashMap::new()).await.unwrap();

    let backend = Arc::new(ScriptedBackend::new(vec![Scripted::Json(
      r#"{
        "determined_level": "A1",
        "confidence_score": 0.8,
        "weak_areas": ["articles_indefinite", "word_order"],
        "gaps": [{"area": "articles", "severity": "high",
                  "description": "omits a/an", "l1_context": "Polish has no articles"}],
        "priorities": ["articles", "word order"],
        "profile_summary": "Beginner with Polish interference in articles.",
        "recommended_start_level": "A1"
      }"#
      .into(),
    )]));
    let generator = Generator::new(backend, &Settings::default());

    let out = submit_diagnostic(
      &store,
      Some(&generator),
      &Prompts::default(),
      start.assessment_id,
      &HashMap::new(),
    )
    .await
    .unwrap();

    assert_eq!(out.level, CefrLevel::A1);
    assert_eq!(store.get_student(sid).await.unwrap().current_level, "A1");
    assert_eq!(store.cefr_history(sid, 10).await.unwrap().len(), 1);
    let profile = store.latest_learner_profile(sid).await.unwrap().unwrap();
    assert_eq!(profile.gaps.len(), 1);

    // Intake runs exactly once per student.
    let again = start_assessment(&store, sid).await;
    assert!(matches!(again, Err(EngineError::Validation(_))));
  }
}
