//! Canonical skill taxonomy.
//!
//! A fixed hierarchy of skill tags per tag type, plus an explicit alias
//! table mapping historically observed free-form labels onto canonical
//! tags. Ships embedded; reviewing these tables is part of release.
//! All storage and aggregation downstream MUST use canonical tags.

use tracing::debug;

use crate::domain::TagType;

/// `topic → [canonical tags]` per tag type.
pub const GRAMMAR_TOPICS: &[(&str, &[&str])] = &[
  ("articles", &["articles_indefinite", "articles_definite"]),
  (
    "tenses",
    &[
      "present_simple",
      "present_continuous",
      "present_perfect",
      "past_simple",
      "future_forms",
      "conditionals_first",
    ],
  ),
  ("sentence_structure", &["word_order", "questions_do_does", "negation"]),
  ("prepositions", &["prepositions_time", "prepositions_place"]),
  (
    "forms",
    &["countable_uncountable", "comparatives", "modal_verbs", "phrasal_verbs"],
  ),
];

pub const VOCABULARY_TOPICS: &[(&str, &[&str])] = &[
  ("daily_life", &["food_vocabulary", "home_vocabulary", "family_vocabulary"]),
  ("work_study", &["work_vocabulary", "school_vocabulary"]),
  ("travel", &["travel_vocabulary", "directions_vocabulary"]),
  ("usage", &["false_friends", "collocations", "idioms"]),
];

pub const PRONUNCIATION_TOPICS: &[(&str, &[&str])] = &[
  ("consonants", &["th_sounds", "w_v_distinction", "final_devoicing"]),
  ("vowels", &["vowel_length", "schwa"]),
];

pub const CONVERSATION_TOPICS: &[(&str, &[&str])] = &[
  ("social", &["small_talk", "introductions"]),
  ("transactional", &["ordering_food", "phone_calls", "appointments"]),
  ("fluency", &["expressing_opinion", "storytelling"]),
];

/// Alias table: observed free-form label → canonical tag.
/// Targets must themselves be canonical so normalization is idempotent.
const ALIASES: &[(&str, &str)] = &[
  // articles
  ("grammar_articles_indefinite", "articles_indefinite"),
  ("articles_a_an_usage", "articles_indefinite"),
  ("article_omission", "articles_indefinite"),
  ("missing_indefinite_article", "articles_indefinite"),
  ("grammar_articles_definite", "articles_definite"),
  ("articles_the_usage", "articles_definite"),
  ("missing_definite_article", "articles_definite"),
  // word order / questions
  ("grammar_articles_sentence_structure", "word_order"),
  ("grammar_word_order", "word_order"),
  ("sentence_structure", "word_order"),
  ("svo_order", "word_order"),
  ("adverb_placement", "word_order"),
  ("question_formation", "questions_do_does"),
  ("do_does_questions", "questions_do_does"),
  // tenses
  ("grammar_present_simple", "present_simple"),
  ("present_simple_tense", "present_simple"),
  ("grammar_present_continuous", "present_continuous"),
  ("simple_continuous_confusion", "present_continuous"),
  ("grammar_present_perfect", "present_perfect"),
  ("present_perfect_tense", "present_perfect"),
  ("present_perfect_avoidance", "present_perfect"),
  ("grammar_past_simple", "past_simple"),
  ("past_simple_tense", "past_simple"),
  ("future_form_confusion", "future_forms"),
  ("will_going_to", "future_forms"),
  // prepositions
  ("time_prepositions", "prepositions_time"),
  ("prepositions_in_on_at_time", "prepositions_time"),
  ("place_prepositions", "prepositions_place"),
  ("movement_prepositions", "prepositions_place"),
  // vocabulary
  ("vocab_food", "food_vocabulary"),
  ("food_and_drink", "food_vocabulary"),
  ("vocab_travel", "travel_vocabulary"),
  ("vocabulary_work", "work_vocabulary"),
  ("aktualnie_actually", "false_friends"),
  ("ewentualnie_eventually", "false_friends"),
  ("sympatyczny_sympathetic", "false_friends"),
  ("particle_errors", "phrasal_verbs"),
  ("phrasal_verb_avoidance", "phrasal_verbs"),
  // pronunciation
  ("th_substitution", "th_sounds"),
  ("th_pronunciation", "th_sounds"),
  ("w_v_confusion", "w_v_distinction"),
  ("vowel_length_errors", "vowel_length"),
  // conversation
  ("smalltalk", "small_talk"),
  ("conversation_small_talk", "small_talk"),
  ("giving_opinions", "expressing_opinion"),
];

fn topics_for(tag_type: TagType) -> &'static [(&'static str, &'static [&'static str])] {
  match tag_type {
    TagType::Grammar => GRAMMAR_TOPICS,
    TagType::Vocabulary => VOCABULARY_TOPICS,
    TagType::Pronunciation => PRONUNCIATION_TOPICS,
    TagType::Conversation => CONVERSATION_TOPICS,
  }
}

/// All canonical tags for one tag type, in declaration order.
/// Used to constrain generator prompts.
pub fn canonical_tags_for(tag_type: TagType) -> Vec<&'static str> {
  topics_for(tag_type)
    .iter()
    .flat_map(|(_, tags)| tags.iter().copied())
    .collect()
}

/// True when `tag` belongs to the embedded hierarchy (any tag type).
pub fn is_canonical(tag: &str) -> bool {
  TagType::ALL
    .iter()
    .any(|t| canonical_tags_for(*t).contains(&tag))
}

/// Normalize a raw skill label to its canonical form.
///
/// Pure and deterministic: cheap lexical cleanup (trim, lowercase,
/// spaces/hyphens to underscores), then the alias table. Unmatched labels
/// pass through unchanged; unknown ones are logged so new aliases can be
/// added at the next release.
pub fn normalize(raw: &str) -> String {
  let cleaned: String = raw
    .trim()
    .chars()
    .map(|c| match c {
      ' ' | '-' => '_',
      other => other.to_ascii_lowercase(),
    })
    .collect();

  if let Some((_, canonical)) = ALIASES.iter().find(|(alias, _)| *alias == cleaned) {
    return (*canonical).to_string();
  }

  if !cleaned.is_empty() && !is_canonical(&cleaned) {
    debug!(target: "learning_loop", raw, normalized = %cleaned, "unknown skill tag passed through");
  }
  cleaned
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn historical_article_tags_collapse() {
    assert_eq!(normalize("grammar_articles_indefinite"), "articles_indefinite");
    assert_eq!(normalize("articles_a_an_usage"), "articles_indefinite");
    assert_eq!(normalize("grammar_articles_sentence_structure"), "word_order");
  }

  #[test]
  fn canonical_tags_are_fixed_points() {
    for tag_type in TagType::ALL {
      for tag in canonical_tags_for(tag_type) {
        assert_eq!(normalize(tag), tag, "canonical tag {tag} must not move");
      }
    }
  }

  #[test]
  fn normalize_is_idempotent() {
    for (alias, _) in ALIASES {
      let once = normalize(alias);
      assert_eq!(normalize(&once), once, "alias {alias} must settle in one step");
    }
  }

  #[test]
  fn alias_targets_are_canonical() {
    for (alias, target) in ALIASES {
      assert!(is_canonical(target), "alias {alias} points at non-canonical {target}");
    }
  }

  #[test]
  fn unknown_labels_pass_through_cleaned() {
    assert_eq!(normalize("  Some Odd Label "), "some_odd_label");
    assert_eq!(normalize("some_odd_label"), "some_odd_label");
  }
}
