//! Quiz scorer: normalizes answers, applies per-type fuzzy rules, routes
//! open-ended answers to AI grading, and aggregates per-skill accuracy.
//!
//! The scorer is order-independent per question and deterministic on
//! deterministic inputs; AI grading is confined to translate/reorder
//! questions that miss the exact fast path. An item-level failure (bad
//! answer shape, grading error) marks that item incorrect instead of
//! failing the attempt.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{error, instrument};

use crate::config::{Prompts, Settings};
use crate::domain::{CefrLevel, GradingVerdict, QuestionType, QuizDraft, QuizQuestion};
use crate::generator::{Generator, UseCase};
use crate::taxonomy;
use crate::util::fill_template;

/// Partial credit at or above this maps to a correct item.
const PARTIAL_CREDIT_PASS: f64 = 0.6;

/// Skills below this accuracy (percent) count as weak areas of the attempt.
const WEAK_AREA_PCT: f64 = 50.0;

const CONTRACTIONS: &[(&str, &str)] = &[
  ("don't", "do not"),
  ("doesn't", "does not"),
  ("didn't", "did not"),
  ("can't", "cannot"),
  ("couldn't", "could not"),
  ("won't", "will not"),
  ("wouldn't", "would not"),
  ("shouldn't", "should not"),
  ("isn't", "is not"),
  ("aren't", "are not"),
  ("wasn't", "was not"),
  ("weren't", "were not"),
  ("haven't", "have not"),
  ("hasn't", "has not"),
  ("hadn't", "had not"),
  ("i'm", "i am"),
  ("i've", "i have"),
  ("i'll", "i will"),
  ("you're", "you are"),
  ("you've", "you have"),
  ("we're", "we are"),
  ("they're", "they are"),
  ("it's", "it is"),
  ("he's", "he is"),
  ("she's", "she is"),
  ("that's", "that is"),
  ("there's", "there is"),
  ("let's", "let us"),
];

const TRUE_VARIANTS: &[&str] = &["true", "t", "yes", "y", "1", "prawda", "tak"];
const FALSE_VARIANTS: &[&str] = &["false", "f", "no", "n", "0", "fałsz", "falsz", "nie"];

/// Normalize an answer for comparison: trim, lowercase, collapse inner
/// whitespace, strip terminal punctuation, expand contractions.
pub fn normalize_answer(raw: &str) -> String {
  let lowered = raw.trim().to_lowercase();
  let stripped = lowered.trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ','));

  stripped
    .split_whitespace()
    .map(|word| {
      CONTRACTIONS
        .iter()
        .find(|(from, _)| *from == word)
        .map(|(_, to)| (*to).to_string())
        .unwrap_or_else(|| word.to_string())
    })
    .collect::<Vec<_>>()
    .join(" ")
}

/// Strip one leading article when the remaining core is longer than two
/// characters; None when no article applies.
fn strip_leading_article(s: &str) -> Option<&str> {
  for article in ["a ", "an ", "the "] {
    if let Some(rest) = s.strip_prefix(article) {
      if rest.chars().count() > 2 {
        return Some(rest);
      }
    }
  }
  None
}

#[derive(Clone, Debug, Serialize)]
pub struct ScoredItem {
  pub question_id: String,
  pub question_text: String,
  pub question_type: QuestionType,
  pub student_answer: String,
  pub is_correct: bool,
  pub expected_answer: String,
  pub needs_ai_grading: bool,
  pub explanation: String,
  pub skill_tag: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SkillStats {
  pub correct: u32,
  pub total: u32,
  pub accuracy: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeakArea {
  pub skill: String,
  pub accuracy: u32,
  pub correct: u32,
  pub total: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScoreOutcome {
  /// Overall fraction in [0, 1].
  pub score: f64,
  pub correct_count: u32,
  pub total_questions: u32,
  pub items: Vec<ScoredItem>,
  pub weak_areas: Vec<WeakArea>,
  pub skill_breakdown: BTreeMap<String, SkillStats>,
}

enum RuleOutcome {
  Decided(bool),
  NeedsAiGrading,
}

/// Deterministic per-type rules. Translate/reorder fall through to AI
/// grading when the exact fast path misses.
fn apply_rules(
  question: &QuizQuestion,
  student_norm: &str,
  correct_norm: &str,
  level: CefrLevel,
  settings: &Settings,
) -> RuleOutcome {
  match question.kind {
    QuestionType::MultipleChoice => RuleOutcome::Decided(student_norm == correct_norm),
    QuestionType::TrueFalse => {
      let student_true = TRUE_VARIANTS.contains(&student_norm);
      let student_false = FALSE_VARIANTS.contains(&student_norm);
      if !student_true && !student_false {
        return RuleOutcome::Decided(false);
      }
      let correct_true = TRUE_VARIANTS.contains(&correct_norm);
      RuleOutcome::Decided(student_true == correct_true)
    }
    QuestionType::FillBlank => {
      if student_norm == correct_norm {
        return RuleOutcome::Decided(true);
      }
      // Leading-article forgiveness only at low CEFR. If neither side
      // strips, the values already failed exact equality above.
      if level.rank() <= settings.article_forgiveness_max_level.rank() {
        let s = strip_leading_article(student_norm).unwrap_or(student_norm);
        let c = strip_leading_article(correct_norm).unwrap_or(correct_norm);
        return RuleOutcome::Decided(s == c);
      }
      RuleOutcome::Decided(false)
    }
    QuestionType::Translate | QuestionType::Reorder => {
      if student_norm == correct_norm {
        RuleOutcome::Decided(true)
      } else {
        RuleOutcome::NeedsAiGrading
      }
    }
  }
}

/// Score one submitted quiz. `answers` maps question id to the raw answer;
/// a missing entry scores as an empty (incorrect) answer.
#[instrument(level = "info", skip_all, fields(questions = quiz.questions.len(), %level))]
pub async fn score_quiz(
  quiz: &QuizDraft,
  answers: &HashMap<String, String>,
  level: CefrLevel,
  generator: Option<&Generator>,
  prompts: &Prompts,
  settings: &Settings,
) -> ScoreOutcome {
  let mut items = Vec::with_capacity(quiz.questions.len());
  let mut correct_count = 0u32;
  let mut skill_breakdown: BTreeMap<String, SkillStats> = BTreeMap::new();

  for question in &quiz.questions {
    let student_answer = answers.get(&question.id).cloned().unwrap_or_default();
    let student_norm = normalize_answer(&student_answer);
    let correct_norm = normalize_answer(&question.correct_answer);

    let (mut is_correct, mut needs_ai_grading, mut explanation) =
      match apply_rules(question, &student_norm, &correct_norm, level, settings) {
        RuleOutcome::Decided(ok) => (ok, false, question.explanation.clone().unwrap_or_default()),
        RuleOutcome::NeedsAiGrading => (false, true, String::new()),
      };

    if needs_ai_grading {
      match grade_open_answer(question, &student_answer, level, generator, prompts).await {
        Some(verdict) => {
          is_correct = verdict.is_correct || verdict.partial_credit >= PARTIAL_CREDIT_PASS;
          explanation = verdict.feedback;
        }
        // Grading unavailable or failed: the item stays incorrect, the
        // attempt goes on.
        None => {
          explanation = question.explanation.clone().unwrap_or_default();
        }
      }
      needs_ai_grading = true;
    }

    let skill_tag = taxonomy::normalize(&question.skill_tag);
    let stats = skill_breakdown.entry(skill_tag.clone()).or_default();
    stats.total += 1;
    if is_correct {
      stats.correct += 1;
      correct_count += 1;
    }

    items.push(ScoredItem {
      question_id: question.id.clone(),
      question_text: question.text.clone(),
      question_type: question.kind,
      student_answer,
      is_correct,
      expected_answer: question.correct_answer.clone(),
      needs_ai_grading,
      explanation,
      skill_tag,
    });
  }

  for stats in skill_breakdown.values_mut() {
    stats.accuracy = if stats.total > 0 {
      ((stats.correct as f64 / stats.total as f64) * 100.0).round() as u32
    } else {
      0
    };
  }

  let weak_areas = skill_breakdown
    .iter()
    .filter(|(_, s)| (s.accuracy as f64) < WEAK_AREA_PCT)
    .map(|(skill, s)| WeakArea {
      skill: skill.clone(),
      accuracy: s.accuracy,
      correct: s.correct,
      total: s.total,
    })
    .collect();

  let total_questions = quiz.questions.len() as u32;
  let score = if total_questions > 0 {
    correct_count as f64 / total_questions as f64
  } else {
    0.0
  };

  ScoreOutcome {
    score,
    correct_count,
    total_questions,
    items,
    weak_areas,
    skill_breakdown,
  }
}

async fn grade_open_answer(
  question: &QuizQuestion,
  student_answer: &str,
  level: CefrLevel,
  generator: Option<&Generator>,
  prompts: &Prompts,
) -> Option<GradingVerdict> {
  let generator = generator?;
  let kind = match question.kind {
    QuestionType::Translate => "translate",
    QuestionType::Reorder => "reorder",
    _ => "open",
  };
  let user = fill_template(
    &prompts.grading_user_template,
    &[
      ("question_type", kind),
      ("question_text", &question.text),
      ("expected", &question.correct_answer),
      ("answer", student_answer),
      ("level", &level.to_string()),
    ],
  );

  match generator
    .generate::<GradingVerdict>(UseCase::Grading, &prompts.grading_system, &user, 0.2)
    .await
  {
    Ok(verdict) => Some(verdict),
    Err(e) => {
      error!(target: "learning_loop", question_id = %question.id, error = %e, "AI grading failed; item scored incorrect");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::generator::testing::{Scripted, ScriptedBackend};
  use crate::error::EngineError;
  use std::sync::Arc;

  fn question(id: &str, kind: QuestionType, correct: &str, tag: &str) -> QuizQuestion {
    QuizQuestion {
      id: id.into(),
      kind,
      text: format!("question {id}"),
      options: None,
      correct_answer: correct.into(),
      explanation: None,
      skill_tag: tag.into(),
    }
  }

  fn quiz(questions: Vec<QuizQuestion>) -> QuizDraft {
    QuizDraft {
      title: "test".into(),
      title_pl: None,
      description: None,
      estimated_time_minutes: None,
      questions,
    }
  }

  fn answers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  #[test]
  fn normalization_pipeline() {
    assert_eq!(normalize_answer("  I  DON'T   know. "), "i do not know");
    assert_eq!(normalize_answer("She's a teacher!"), "she is a teacher");
    assert_eq!(normalize_answer("yes"), "yes");
  }

  #[tokio::test]
  async fn true_false_accepts_variants_including_polish() {
    let q = quiz(vec![
      question("q1", QuestionType::TrueFalse, "true", "present_simple"),
      question("q2", QuestionType::TrueFalse, "false", "present_simple"),
      question("q3", QuestionType::TrueFalse, "true", "present_simple"),
    ]);
    let out = score_quiz(
      &q,
      &answers(&[("q1", "TAK"), ("q2", "nie"), ("q3", "banana")]),
      CefrLevel::A2,
      None,
      &Prompts::default(),
      &Settings::default(),
    )
    .await;
    assert_eq!(out.correct_count, 2);
    assert!(!out.items[2].is_correct);
  }

  #[tokio::test]
  async fn fill_blank_forgives_leading_article_at_low_level_only() {
    let q = quiz(vec![question("q1", QuestionType::FillBlank, "the station", "articles_definite")]);
    let prompts = Prompts::default();
    let settings = Settings::default();

    let low = score_quiz(&q, &answers(&[("q1", "station")]), CefrLevel::A1, None, &prompts, &settings).await;
    assert!(low.items[0].is_correct);

    let high = score_quiz(&q, &answers(&[("q1", "station")]), CefrLevel::B2, None, &prompts, &settings).await;
    assert!(!high.items[0].is_correct);
  }

  #[tokio::test]
  async fn translate_exact_match_skips_ai() {
    let q = quiz(vec![question("q1", QuestionType::Translate, "I like coffee.", "food_vocabulary")]);
    let out = score_quiz(
      &q,
      &answers(&[("q1", "i like coffee")]),
      CefrLevel::A2,
      None,
      &Prompts::default(),
      &Settings::default(),
    )
    .await;
    assert!(out.items[0].is_correct);
    assert!(!out.items[0].needs_ai_grading);
  }

  #[tokio::test]
  async fn translate_partial_credit_maps_to_correct_at_point_six() {
    let backend = Arc::new(ScriptedBackend::new(vec![Scripted::Json(
      r#"{"is_correct": false, "partial_credit": 0.7, "feedback": "close enough"}"#.into(),
    )]));
    let generator = Generator::new(backend, &Settings::default());
    let q = quiz(vec![question("q1", QuestionType::Translate, "I went home", "past_simple")]);
    let out = score_quiz(
      &q,
      &answers(&[("q1", "i did go home")]),
      CefrLevel::A2,
      Some(&generator),
      &Prompts::default(),
      &Settings::default(),
    )
    .await;
    assert!(out.items[0].is_correct);
    assert!(out.items[0].needs_ai_grading);
    assert_eq!(out.items[0].explanation, "close enough");
  }

  #[tokio::test]
  async fn grading_failure_degrades_to_incorrect_without_failing_attempt() {
    let backend = Arc::new(ScriptedBackend::new(vec![
      Scripted::Fail(|| EngineError::Timeout { secs: 60 }),
      Scripted::Fail(|| EngineError::Timeout { secs: 45 }),
    ]));
    let generator = Generator::new(backend, &Settings::default());
    let q = quiz(vec![
      question("q1", QuestionType::Reorder, "I always drink tea", "word_order"),
      question("q2", QuestionType::MultipleChoice, "b", "word_order"),
    ]);
    let out = score_quiz(
      &q,
      &answers(&[("q1", "always I drink tea"), ("q2", "b")]),
      CefrLevel::A1,
      Some(&generator),
      &Prompts::default(),
      &Settings::default(),
    )
    .await;
    assert!(!out.items[0].is_correct);
    assert!(out.items[1].is_correct);
    assert_eq!(out.correct_count, 1);
  }

  #[tokio::test]
  async fn raw_tags_are_stored_canonical() {
    let q = quiz(vec![
      question("q1", QuestionType::MultipleChoice, "a", "grammar_articles_indefinite"),
      question("q2", QuestionType::MultipleChoice, "a", "articles_a_an_usage"),
      question("q3", QuestionType::MultipleChoice, "b", "grammar_articles_sentence_structure"),
    ]);
    let out = score_quiz(
      &q,
      &answers(&[("q1", "a"), ("q2", "a"), ("q3", "b")]),
      CefrLevel::A1,
      None,
      &Prompts::default(),
      &Settings::default(),
    )
    .await;
    let tags: Vec<&str> = out.items.iter().map(|i| i.skill_tag.as_str()).collect();
    assert_eq!(tags, vec!["articles_indefinite", "articles_indefinite", "word_order"]);
    assert!(out.skill_breakdown.contains_key("articles_indefinite"));
    assert_eq!(out.skill_breakdown["articles_indefinite"].total, 2);
  }

  #[tokio::test]
  async fn weak_areas_flag_sub_fifty_percent_skills() {
    let q = quiz(vec![
      question("q1", QuestionType::MultipleChoice, "a", "word_order"),
      question("q2", QuestionType::MultipleChoice, "a", "word_order"),
      question("q3", QuestionType::MultipleChoice, "a", "present_simple"),
    ]);
    let out = score_quiz(
      &q,
      &answers(&[("q1", "x"), ("q2", "x"), ("q3", "a")]),
      CefrLevel::A1,
      None,
      &Prompts::default(),
      &Settings::default(),
    )
    .await;
    assert_eq!(out.weak_areas.len(), 1);
    assert_eq!(out.weak_areas[0].skill, "word_order");
    assert_eq!(out.weak_areas[0].accuracy, 0);
  }
}
