//! Lesson builder: gathers the full learner context, asks the generator
//! for a five-phase lesson artifact, and derives the follow-up quiz.
//!
//! Artifacts are immutable; artifact plus skill-tag rows are stored in one
//! transaction. Both builders are idempotent per session, so re-confirming
//! a session never recreates rows.

use tracing::{info, instrument, warn};

use crate::config::{Prompts, Settings};
use crate::dna;
use crate::domain::{DnaSnapshot, LessonDraft, QuizDraft, SkillTagDraft, TagType};
use crate::error::{EngineError, Result};
use crate::generator::{Generator, UseCase};
use crate::interference;
use crate::store::Store;
use crate::taxonomy;
use crate::util::fill_template;

pub const PROMPT_VERSION: &str = "v1.2.0";

#[derive(Clone, Debug)]
pub struct LessonBuildOutcome {
  pub artifact_id: i64,
  pub already_existed: bool,
}

#[derive(Clone, Debug)]
pub struct QuizBuildOutcome {
  pub quiz_id: i64,
  pub already_existed: bool,
}

fn take_chars(s: &str, max: usize) -> String {
  s.chars().take(max).collect()
}

fn allowed_tags_text() -> String {
  TagType::ALL
    .iter()
    .map(|t| format!("{}: {}", t, taxonomy::canonical_tags_for(*t).join(", ")))
    .collect::<Vec<_>>()
    .join("\n")
}

/// Generate and persist the lesson artifact for a confirmed session.
#[instrument(level = "info", skip(store, generator, prompts, settings))]
pub async fn build_lesson_for_session(
  store: &Store,
  generator: &Generator,
  prompts: &Prompts,
  settings: &Settings,
  session_id: i64,
) -> Result<LessonBuildOutcome> {
  if let Some(existing) = store.artifact_for_session(session_id).await? {
    info!(target: "learning_loop", session_id, artifact_id = existing.id, "lesson artifact already exists");
    return Ok(LessonBuildOutcome { artifact_id: existing.id, already_existed: true });
  }

  let session = store.get_session(session_id).await?;
  let student = store.get_student(session.student_id).await?;
  let student_id = student.id;

  let session_number = store.session_count(student_id).await?.max(1);

  // 1-2. Profile and latest plan.
  let profile = store.latest_learner_profile(student_id).await?;
  let (profile_summary, priorities, gaps) = match &profile {
    Some(p) => (
      p.profile_summary.clone(),
      p.priorities.join(", "),
      serde_json::to_string(&p.gaps).unwrap_or_else(|_| "[]".into()),
    ),
    None => ("No profile on record.".into(), String::new(), "[]".into()),
  };
  let plan_text = match store.latest_plan(student_id).await? {
    Some(plan) => plan.plan_json,
    None => "No plan yet.".into(),
  };

  // 3. Previous lessons with their quiz outcomes.
  let artifacts = store
    .recent_artifacts(student_id, settings.lesson_lookback as i64)
    .await?;
  let mut lesson_lines = Vec::new();
  let mut previous_topic: Option<(String, Option<f64>)> = None;
  for (idx, artifact) in artifacts.iter().enumerate() {
    let draft: Option<LessonDraft> = serde_json::from_str(&artifact.lesson_json).ok();
    let objective = draft
      .as_ref()
      .map(|d| take_chars(&d.objective, 80))
      .unwrap_or_else(|| "Unknown".into());
    let score = store.quiz_score_for_artifact(artifact.id).await?;
    let score_text = match score {
      Some(s) => format!("{}%", (s * 100.0).round() as i64),
      None => "not yet tested".into(),
    };
    lesson_lines.push(format!("- {objective} → Quiz: {score_text}"));
    if idx == 0 {
      let topic = draft.map(|d| d.presentation.topic).unwrap_or(objective);
      previous_topic = Some((topic, score));
    }
  }
  let previous_lessons = if lesson_lines.is_empty() {
    "No previous lessons.".to_string()
  } else {
    lesson_lines.join("\n")
  };

  // 4-9. Remaining context sections, in the order the prompt presents them.
  let mut sections = Vec::new();

  if let Some((topic, score)) = &previous_topic {
    let score_text = match score {
      Some(s) => format!("{}%", (s * 100.0).round() as i64),
      None => "not yet tested".into(),
    };
    sections.push(format!("PREVIOUS PRIMARY TOPIC: {topic} (quiz: {score_text})"));
  }

  let observations = store
    .recent_observations(student_id, settings.observation_lookback as i64)
    .await?;
  if !observations.is_empty() {
    let lines: Vec<String> = observations
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
      .collect();
    sections.push(format!("TEACHER SKILL RATINGS (most recent):\n{}", lines.join("\n")));
  }

  let history = store.cefr_history(student_id, 5).await?;
  if !history.is_empty() {
    let lines: Vec<String> = history
      .iter()
      .map(|h| format!("- {}: {} via {}", h.recorded_at, h.level, h.source))
      .collect();
    sections.push(format!("CEFR PROGRESSION:\n{}", lines.join("\n")));
  }

  let snapshot: DnaSnapshot = match store.latest_dna(student_id).await? {
    Some((s, _)) => s,
    None => dna::compute_snapshot(store, settings, student_id).await?,
  };
  sections.push(format!(
    "LEARNING DNA:\n- Recent avg: {} | Lifetime avg: {}\n- Global directive: {}\n- Trajectory: {}",
    snapshot.recent_avg, snapshot.lifetime_avg, snapshot.global_recommendation, snapshot.trajectory,
  ));

  if !snapshot.per_skill.is_empty() {
    let lines: Vec<String> = snapshot
      .per_skill
      .iter()
      .map(|(skill, rec)| format!("- {skill}: {rec}"))
      .collect();
    sections.push(format!(
      "ADAPTIVE DIFFICULTY PER SKILL (adjust exercise difficulty accordingly):\n{}",
      lines.join("\n")
    ));
  }

  let l1 = interference::student_profile(store, student_id).await?;
  if !l1.exhibited.is_empty() {
    let lines: Vec<String> = l1
      .exhibited
      .iter()
      .take(8)
      .map(|p| format!("- {}/{} (seen {}x)", p.category, p.detail, p.occurrences))
      .collect();
    sections.push(format!(
      "ACTIVE POLISH L1 INTERFERENCE PATTERNS (target these in exercises):\n{}",
      lines.join("\n")
    ));
  }
  if !l1.overcome.is_empty() {
    let names: Vec<String> = l1
      .overcome
      .iter()
      .take(5)
      .map(|p| format!("{}/{}", p.category, p.detail))
      .collect();
    sections.push(format!("OVERCOME L1 PATTERNS (occasional reinforcement only): {}", names.join(", ")));
  }

  let due = store.due_spaced_items(student_id, 10).await?;
  if !due.is_empty() {
    let names: Vec<String> = due.iter().map(|i| i.content.clone()).collect();
    sections.push(format!(
      "DUE FOR REVIEW (incorporate naturally into exercises): {}",
      names.join(", ")
    ));
  }

  let user = fill_template(
    &prompts.lesson_user_template,
    &[
      ("session_number", &session_number.to_string()),
      ("current_level", &student.current_level),
      ("profile_summary", &profile_summary),
      ("priorities", &priorities),
      ("gaps", &gaps),
      ("plan", &plan_text),
      ("previous_lessons", &previous_lessons),
      ("context_sections", &sections.join("\n\n")),
      ("allowed_tags", &allowed_tags_text()),
    ],
  );

  let mut lesson: LessonDraft = generator
    .generate(UseCase::Lesson, &prompts.lesson_system, &user, 0.7)
    .await?;

  // Canonical tags only ever reach storage; anything the prompt constraint
  // failed to confine is normalized, and still-unknown values are dropped.
  let mut tags: Vec<SkillTagDraft> = Vec::new();
  for mut tag in std::mem::take(&mut lesson.skill_tags) {
    tag.value = taxonomy::normalize(&tag.value);
    if taxonomy::canonical_tags_for(tag.tag_type).contains(&tag.value.as_str()) {
      tags.push(tag);
    } else {
      warn!(target: "learning_loop", value = %tag.value, "dropping non-canonical lesson tag");
    }
  }
  lesson.skill_tags = tags.clone();

  let topics_json = serde_json::json!({
    "main_topic": [lesson.presentation.topic],
    "objective": [lesson.objective],
    "skill_tags": tags
      .iter()
      .map(|t| format!("{}→{} ({})", t.tag_type, t.value, t.cefr_level))
      .collect::<Vec<_>>(),
  });

  let lesson_json =
    serde_json::to_string(&lesson).map_err(|e| EngineError::Validation(e.to_string()))?;
  let artifact_id = store
    .insert_artifact_with_tags(
      session_id,
      student_id,
      session.teacher_id,
      &lesson_json,
      &topics_json.to_string(),
      &lesson.difficulty.to_string(),
      PROMPT_VERSION,
      &tags,
    )
    .await?;

  info!(target: "learning_loop", session_id, artifact_id, "lesson artifact created");
  Ok(LessonBuildOutcome { artifact_id, already_existed: false })
}

/// Derive the follow-up quiz from the session's lesson artifact.
#[instrument(level = "info", skip(store, generator, prompts))]
pub async fn build_quiz_from_lesson(
  store: &Store,
  generator: &Generator,
  prompts: &Prompts,
  session_id: i64,
) -> Result<QuizBuildOutcome> {
  if let Some(existing) = store.quiz_for_session(session_id).await? {
    info!(target: "learning_loop", session_id, quiz_id = existing.id, "quiz already exists");
    return Ok(QuizBuildOutcome { quiz_id: existing.id, already_existed: true });
  }

  let Some(artifact) = store.artifact_for_session(session_id).await? else {
    return Err(EngineError::Validation(format!(
      "no lesson artifact found for session {session_id}"
    )));
  };

  let lesson: LessonDraft = serde_json::from_str(&artifact.lesson_json)
    .map_err(|e| EngineError::Validation(format!("corrupt lesson artifact: {e}")))?;

  let mut key_concepts = take_chars(&lesson.presentation.explanation, 200);
  if let Some(pl) = &lesson.polish_explanation {
    key_concepts.push_str(&format!("\nPolish: {}", take_chars(pl, 100)));
  }

  let mut exercises_summary = lesson
    .controlled_practice
    .exercises
    .iter()
    .take(5)
    .enumerate()
    .map(|(i, ex)| format!("{}. [{}] {}", i + 1, ex.kind, take_chars(&ex.content, 50)))
    .collect::<Vec<_>>()
    .join("\n");
  if exercises_summary.is_empty() {
    exercises_summary = "General practice exercises".into();
  }

  let user = fill_template(
    &prompts.quiz_user_template,
    &[
      ("objective", &lesson.objective),
      ("difficulty", &artifact.difficulty),
      ("topic", &lesson.presentation.topic),
      ("key_concepts", &key_concepts),
      ("exercises_summary", &exercises_summary),
      ("allowed_tags", &allowed_tags_text()),
    ],
  );

  let mut quiz: QuizDraft = generator
    .generate(UseCase::Quiz, &prompts.quiz_system, &user, 0.7)
    .await?;

  if quiz.questions.is_empty() {
    return Err(EngineError::GenerationInvalid("quiz has no questions".into()));
  }
  for question in &mut quiz.questions {
    question.skill_tag = taxonomy::normalize(&question.skill_tag);
  }

  let quiz_json =
    serde_json::to_string(&quiz).map_err(|e| EngineError::Validation(e.to_string()))?;
  // Quiz and artifact reference the same student by construction.
  let quiz_id = store
    .insert_quiz(session_id, artifact.student_id, &quiz_json, artifact.id)
    .await?;

  info!(target: "learning_loop", session_id, quiz_id, derived_from = artifact.id, "quiz created");
  Ok(QuizBuildOutcome { quiz_id, already_existed: false })
}

#[cfg(test)]
pub mod testing {
  //! Generator fixtures shared by module and integration tests.

  /// A minimal but schema-complete lesson as the generator would emit it.
  pub fn lesson_json(objective: &str, topic: &str, tags: &[(&str, &str)]) -> String {
    let tag_objs: Vec<String> = tags
      .iter()
      .map(|(t, v)| format!(r#"{{"type": "{t}", "value": "{v}", "cefr_level": "A1"}}"#))
      .collect();
    format!(
      r#"{{
        "objective": "{objective}",
        "difficulty": "A1",
        "polish_explanation": "Przedimki a/an",
        "warm_up": {{"duration_minutes": 5, "description": "Picture chat", "materials": ["photo cards"]}},
        "presentation": {{
          "duration_minutes": 15,
          "topic": "{topic}",
          "explanation": "Use a/an before singular countable nouns.",
          "polish_explanation": "Po polsku nie ma przedimkow.",
          "examples": ["I have a dog.", "She is an engineer."]
        }},
        "controlled_practice": {{
          "duration_minutes": 15,
          "exercises": [
            {{"type": "fill_blank", "instruction": "Complete", "content": "I have ___ cat.", "answer": "a"}}
          ],
          "success_criteria": "4 of 5 correct"
        }},
        "free_practice": {{
          "duration_minutes": 15,
          "description": "Describe your home",
          "conversation_prompts": ["What is in your kitchen?"],
          "success_criteria": "Uses articles in free speech"
        }},
        "wrap_up": {{"duration_minutes": 10, "summary": "Articles recap", "homework": "Write 5 sentences"}},
        "skill_tags": [{tags}]
      }}"#,
      objective = objective,
      topic = topic,
      tags = tag_objs.join(", "),
    )
  }

  /// A small quiz over the article material with raw (alias) tags.
  pub fn quiz_json() -> String {
    r#"{
      "title": "Articles check",
      "title_pl": "Quiz z przedimkow",
      "estimated_time_minutes": 5,
      "questions": [
        {"id": "q1", "type": "fill_blank", "text": "I have ___ dog.",
         "correct_answer": "a", "skill_tag": "grammar_articles_indefinite"},
        {"id": "q2", "type": "multiple_choice", "text": "Pick the article for 'engineer'",
         "options": ["a", "an"], "correct_answer": "an", "skill_tag": "articles_a_an_usage"},
        {"id": "q3", "type": "reorder", "text": "always / I / tea / drink",
         "correct_answer": "I always drink tea", "skill_tag": "grammar_articles_sentence_structure"},
        {"id": "q4", "type": "true_false", "text": "'An' precedes vowel sounds.",
         "correct_answer": "true", "skill_tag": "articles_indefinite"}
      ]
    }"#
    .into()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::generator::testing::{Scripted, ScriptedBackend};
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
    let session = store
      .create_session(student, teacher, "2026-08-10T10:00:00Z", 60)
      .await
      .unwrap();
    (store, student, session)
  }

  fn gen(responses: Vec<Scripted>) -> Generator {
    Generator::new(Arc::new(ScriptedBackend::new(responses)), &Settings::default())
  }

  #[tokio::test]
  async fn builds_artifact_with_normalized_canonical_tags() {
    let (store, student, session) = seeded().await;
    let generator = gen(vec![Scripted::Json(testing::lesson_json(
      "Indefinite articles",
      "Articles a/an",
      &[("grammar", "grammar_articles_indefinite"), ("grammar", "made_up_tag")],
    ))]);

    let out = build_lesson_for_session(
      &store,
      &generator,
      &Prompts::default(),
      &Settings::default(),
      session,
    )
    .await
    .unwrap();
    assert!(!out.already_existed);

    // Alias normalized, junk dropped.
    let tags = store.recent_skill_tags(student, 10).await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].1, "articles_indefinite");
  }

  #[tokio::test]
  async fn second_build_is_idempotent() {
    let (store, _, session) = seeded().await;
    let generator = gen(vec![Scripted::Json(testing::lesson_json(
      "Articles",
      "Articles",
      &[("grammar", "articles_indefinite")],
    ))]);
    let first = build_lesson_for_session(
      &store,
      &generator,
      &Prompts::default(),
      &Settings::default(),
      session,
    )
    .await
    .unwrap();

    // No scripted response left; the idempotency check must short-circuit
    // before any generator call.
    let exhausted = gen(vec![]);
    let second = build_lesson_for_session(
      &store,
      &exhausted,
      &Prompts::default(),
      &Settings::default(),
      session,
    )
    .await
    .unwrap();
    assert!(second.already_existed);
    assert_eq!(first.artifact_id, second.artifact_id);
  }

  #[tokio::test]
  async fn quiz_derivation_links_artifact_and_student() {
    let (store, student, session) = seeded().await;
    let generator = gen(vec![
      Scripted::Json(testing::lesson_json("Articles", "Articles", &[("grammar", "articles_indefinite")])),
      Scripted::Json(testing::quiz_json()),
    ]);

    let lesson = build_lesson_for_session(
      &store,
      &generator,
      &Prompts::default(),
      &Settings::default(),
      session,
    )
    .await
    .unwrap();
    let quiz = build_quiz_from_lesson(&store, &generator, &Prompts::default(), session)
      .await
      .unwrap();

    let row = store.get_quiz(quiz.quiz_id).await.unwrap();
    assert_eq!(row.derived_from_lesson_artifact_id, lesson.artifact_id);
    assert_eq!(row.student_id, student);

    // Question tags were normalized at storage time.
    let draft: QuizDraft = serde_json::from_str(&row.quiz_json).unwrap();
    assert_eq!(draft.questions[0].skill_tag, "articles_indefinite");
    assert_eq!(draft.questions[2].skill_tag, "word_order");
  }

  #[tokio::test]
  async fn quiz_without_artifact_is_a_validation_error() {
    let (store, _, session) = seeded().await;
    let generator = gen(vec![]);
    let res = build_quiz_from_lesson(&store, &generator, &Prompts::default(), session).await;
    assert!(matches!(res, Err(EngineError::Validation(_))));
  }
}
