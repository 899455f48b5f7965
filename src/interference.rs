//! Polish → English L1 interference patterns.
//!
//! An embedded knowledge base of interference patterns Polish native
//! speakers exhibit in English, per-student tracking of which patterns are
//! exhibited vs overcome, and AI-backed detection in free text.

use serde::Serialize;
use tracing::{error, instrument};

use crate::config::Prompts;
use crate::domain::{DetectedPattern, DetectedPatterns};
use crate::generator::{Generator, UseCase};
use crate::store::{InterferenceRow, Store};
use crate::error::Result;
use crate::util::fill_template;

pub struct L1SubPattern {
  pub detail: &'static str,
  pub description: &'static str,
}

pub struct L1Pattern {
  pub key: &'static str,
  pub category: &'static str,
  pub description: &'static str,
  pub cefr_range: &'static [&'static str],
  pub examples: &'static [&'static str],
  pub correction: &'static str,
  pub sub_patterns: &'static [L1SubPattern],
}

/// Knowledge base of Polish → English interference patterns.
pub const L1_PATTERNS: &[L1Pattern] = &[
  L1Pattern {
    key: "article_omission",
    category: "articles",
    description: "Omitting articles (a/an/the) — Polish has no articles",
    cefr_range: &["A1", "A2", "B1", "B2"],
    examples: &["I have dog", "She is teacher", "I saw moon"],
    correction: "Articles mark whether a noun is specific (the) or general (a/an)",
    sub_patterns: &[
      L1SubPattern {
        detail: "missing_indefinite_article",
        description: "Omitting a/an with singular countable nouns",
      },
      L1SubPattern {
        detail: "missing_definite_article",
        description: "Omitting 'the' with known/specific referents",
      },
      L1SubPattern {
        detail: "articles_in_complex_clauses",
        description: "Dropping articles in subordinate clauses while using them in main clauses",
      },
    ],
  },
  L1Pattern {
    key: "preposition_confusion",
    category: "prepositions",
    description: "Incorrect preposition choice from Polish na/w/do mapping",
    cefr_range: &["A1", "A2", "B1"],
    examples: &["on the university", "in Monday", "I go to home"],
    correction: "English prepositions must be learned as collocations",
    sub_patterns: &[
      L1SubPattern { detail: "time_prepositions", description: "in/on/at confusion with time expressions" },
      L1SubPattern { detail: "place_prepositions", description: "in/on/at confusion with places" },
      L1SubPattern { detail: "movement_prepositions", description: "to/into/onto confusion" },
    ],
  },
  L1Pattern {
    key: "word_order_errors",
    category: "word_order",
    description: "Non-English word order from Polish free word order",
    cefr_range: &["A1", "A2", "B1"],
    examples: &["Very much I like it", "Always I am going"],
    correction: "English requires Subject-Verb-Object order",
    sub_patterns: &[
      L1SubPattern { detail: "adverb_placement", description: "Adverbs placed before auxiliary verbs" },
      L1SubPattern { detail: "adjective_after_noun", description: "Adjective placed after noun (Polish order)" },
      L1SubPattern { detail: "question_formation", description: "Missing do/does in questions" },
    ],
  },
  L1Pattern {
    key: "tense_confusion",
    category: "tenses",
    description: "Tense errors from Polish 3-tense system vs English 12",
    cefr_range: &["A2", "B1", "B2"],
    examples: &["I live here for 5 years", "I am go every day"],
    correction: "Match tense to time reference and aspect",
    sub_patterns: &[
      L1SubPattern {
        detail: "present_perfect_avoidance",
        description: "Using past simple instead of present perfect",
      },
      L1SubPattern { detail: "continuous_overuse", description: "Using continuous forms with stative verbs" },
      L1SubPattern {
        detail: "simple_continuous_confusion",
        description: "Mixing present simple and continuous",
      },
      L1SubPattern {
        detail: "future_form_confusion",
        description: "Will vs going to vs present continuous for future",
      },
    ],
  },
  L1Pattern {
    key: "false_friends",
    category: "false_friends",
    description: "Using Polish-looking English words with wrong meanings",
    cefr_range: &["A2", "B1", "B2", "C1"],
    examples: &[
      "aktualnie→actually (should be 'currently')",
      "ewentualnie→eventually (should be 'possibly')",
    ],
    correction: "These words look similar but mean different things",
    sub_patterns: &[
      L1SubPattern { detail: "aktualnie_actually", description: "Using 'actually' to mean 'currently'" },
      L1SubPattern { detail: "ewentualnie_eventually", description: "Using 'eventually' to mean 'possibly'" },
      L1SubPattern { detail: "sympatyczny_sympathetic", description: "Using 'sympathetic' to mean 'nice/likeable'" },
    ],
  },
  L1Pattern {
    key: "pronunciation_transfer",
    category: "pronunciation",
    description: "Polish phonological interference in English",
    cefr_range: &["A1", "A2", "B1", "B2"],
    examples: &["th→f/t", "w→v", "vowel length errors"],
    correction: "Practice target sounds with minimal pairs",
    sub_patterns: &[
      L1SubPattern { detail: "th_substitution", description: "Replacing th sounds with f, t, or d" },
      L1SubPattern { detail: "w_v_confusion", description: "Pronouncing English w as v" },
      L1SubPattern { detail: "vowel_length", description: "Not distinguishing long/short vowels" },
    ],
  },
  L1Pattern {
    key: "phrasal_verb_avoidance",
    category: "phrasal_verbs",
    description: "Avoiding phrasal verbs (Polish has none), using formal alternatives",
    cefr_range: &["B1", "B2", "C1"],
    examples: &["Using 'investigate' instead of 'look into'"],
    correction: "Phrasal verbs are essential for natural English",
    sub_patterns: &[
      L1SubPattern { detail: "avoidance", description: "Using Latin-origin formal verbs instead of phrasal verbs" },
      L1SubPattern { detail: "particle_errors", description: "Using wrong particle with verb" },
      L1SubPattern { detail: "separability_errors", description: "Not separating separable phrasal verbs" },
    ],
  },
  L1Pattern {
    key: "formality_register",
    category: "register",
    description: "Inappropriate formality level from Polish Pan/Pani system",
    cefr_range: &["B1", "B2", "C1"],
    examples: &["Overly formal in casual contexts", "Too casual in business"],
    correction: "English register depends heavily on context",
    sub_patterns: &[
      L1SubPattern { detail: "overly_formal", description: "Using excessively formal language in casual settings" },
      L1SubPattern { detail: "too_casual", description: "Being too informal in professional contexts" },
    ],
  },
];

/// Concise textual rendering of the knowledge base for generator prompts.
pub fn pattern_summary() -> String {
  let mut lines = Vec::new();
  for pattern in L1_PATTERNS {
    lines.push(format!("## {} ({})", pattern.key, pattern.category));
    lines.push(format!("Description: {}", pattern.description));
    lines.push(format!("CEFR range: {}", pattern.cefr_range.join(", ")));
    lines.push(format!("Examples: {}", pattern.examples.join("; ")));
    for sp in pattern.sub_patterns {
      lines.push(format!("  - {}: {}", sp.detail, sp.description));
    }
    lines.push(String::new());
  }
  lines.join("\n")
}

/// Per-student interference profile split by status.
#[derive(Clone, Debug, Default, Serialize)]
pub struct InterferenceProfile {
  pub exhibited: Vec<InterferenceEntry>,
  pub overcome: Vec<InterferenceEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InterferenceEntry {
  pub category: String,
  pub detail: String,
  pub occurrences: i64,
  pub first_seen_at: String,
  pub last_seen_at: String,
}

pub async fn student_profile(store: &Store, student_id: i64) -> Result<InterferenceProfile> {
  let rows = store.interference_rows(student_id).await?;
  let mut profile = InterferenceProfile::default();
  for row in rows {
    let entry = entry_from(&row);
    if row.status == "overcome" {
      profile.overcome.push(entry);
    } else {
      profile.exhibited.push(entry);
    }
  }
  Ok(profile)
}

fn entry_from(row: &InterferenceRow) -> InterferenceEntry {
  InterferenceEntry {
    category: row.pattern_category.clone(),
    detail: row.pattern_detail.clone(),
    occurrences: row.occurrences,
    first_seen_at: row.first_seen_at.clone(),
    last_seen_at: row.last_seen_at.clone(),
  }
}

/// Scan student-written text for interference patterns via the generator.
/// Entries missing category/detail/evidence are dropped; severities outside
/// the closed set fall back to "low". Failures yield an empty list.
#[instrument(level = "info", skip_all, fields(text_len = text.len(), %student_level))]
pub async fn analyze_text(
  generator: &Generator,
  prompts: &Prompts,
  text: &str,
  student_level: &str,
) -> Vec<DetectedPattern> {
  let system = fill_template(
    &prompts.interference_system_template,
    &[("level", student_level), ("pattern_reference", &pattern_summary())],
  );

  let detected = match generator
    .generate::<DetectedPatterns>(UseCase::Cheap, &system, text, 0.3)
    .await
  {
    Ok(d) => d.patterns,
    Err(e) => {
      error!(target: "learning_loop", error = %e, "L1 interference analysis failed");
      return Vec::new();
    }
  };

  detected
    .into_iter()
    .filter(|p| !p.category.is_empty() && !p.detail.is_empty() && !p.evidence.is_empty())
    .map(|mut p| {
      if !matches!(p.severity.as_str(), "low" | "medium" | "high") {
        p.severity = "low".into();
      }
      p
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pattern_summary_covers_every_category() {
    let summary = pattern_summary();
    for pattern in L1_PATTERNS {
      assert!(summary.contains(pattern.key));
      for sp in pattern.sub_patterns {
        assert!(summary.contains(sp.detail));
      }
    }
  }

  #[tokio::test]
  async fn analysis_validates_and_defaults_severity() {
    use crate::config::{Prompts, Settings};
    use crate::generator::testing::{Scripted, ScriptedBackend};
    use crate::generator::Generator;
    use std::sync::Arc;

    let backend = Arc::new(ScriptedBackend::new(vec![Scripted::Json(
      r#"{"patterns": [
        {"category": "articles", "detail": "missing_indefinite_article",
         "evidence": "I have dog", "severity": "weird"},
        {"category": "", "detail": "x", "evidence": "y", "severity": "low"}
      ]}"#
        .into(),
    )]));
    let generator = Generator::new(backend, &Settings::default());
    let out = analyze_text(&generator, &Prompts::default(), "I have dog", "A1").await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].severity, "low");
  }
}
