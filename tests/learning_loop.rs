//! End-to-end exercises of the learning loop against an in-memory store
//! and a scripted generator backend: first cycle at zero score, the
//! promotion ladder, and the post-promotion regression.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use fluentloop::config::{Prompts, Settings};
use fluentloop::domain::{GlobalRecommendation, PlanDraft, SessionStatus, StepStatus};
use fluentloop::error::{EngineError, Result};
use fluentloop::generator::{ChatBackend, Generator, UseCase};
use fluentloop::intake;
use fluentloop::orchestrator;
use fluentloop::store::Store;

// ── Scripted backend ───────────────────────────────────────────────────

enum Canned {
  Json(String),
  Timeout,
}

struct ScriptedBackend {
  responses: Mutex<VecDeque<Canned>>,
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
  async fn chat_json(
    &self,
    _use_case: UseCase,
    _system: &str,
    _user: &str,
    _temperature: f32,
  ) -> Result<String> {
    match self.responses.lock().await.pop_front() {
      Some(Canned::Json(s)) => Ok(s),
      Some(Canned::Timeout) => Err(EngineError::Timeout { secs: 60 }),
      None => Err(EngineError::Transient("scripted backend exhausted".into())),
    }
  }
}

fn gen(responses: Vec<Canned>) -> Generator {
  Generator::new(
    Arc::new(ScriptedBackend { responses: Mutex::new(responses.into()) }),
    &Settings::default(),
  )
}

// ── Fixtures ───────────────────────────────────────────────────────────

fn lesson_fixture(objective: &str, topic: &str) -> Canned {
  Canned::Json(format!(
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
      "wrap_up": {{"duration_minutes": 10, "summary": "Recap", "homework": "Write 5 sentences"}},
      "skill_tags": [
        {{"type": "grammar", "value": "articles_indefinite", "cefr_level": "A1"}},
        {{"type": "grammar", "value": "word_order", "cefr_level": "A1"}}
      ]
    }}"#
  ))
}

/// A quiz of `n` multiple-choice questions, all with correct answer "a",
/// cycling through a small set of canonical grammar tags.
fn quiz_fixture(n: usize) -> Canned {
  let tags = ["articles_indefinite", "word_order", "present_simple"];
  let questions: Vec<String> = (1..=n)
    .map(|i| {
      format!(
        r#"{{"id": "q{i}", "type": "multiple_choice", "text": "Pick a for item {i}",
            "options": ["a", "b"], "correct_answer": "a", "skill_tag": "{}"}}"#,
        tags[(i - 1) % tags.len()],
      )
    })
    .collect();
  Canned::Json(format!(
    r#"{{"title": "Cycle quiz", "estimated_time_minutes": 5, "questions": [{}]}}"#,
    questions.join(", "),
  ))
}

fn plan_fixture(recommendation: &str) -> Canned {
  Canned::Json(format!(
    r#"{{
      "summary": "Keep working on the weak areas",
      "goals_next_2_weeks": ["use a/an correctly in writing"],
      "top_weaknesses": [
        {{"skill_area": "articles_indefinite", "accuracy_observed": 0, "priority": "high"}}
      ],
      "difficulty_adjustment": {{
        "current_level": "A1",
        "recommendation": "{recommendation}",
        "rationale": "derived from the windowed performance profile"
      }},
      "grammar_focus": "articles",
      "vocabulary_focus": "daily routines",
      "recommended_drills": ["article gap fill"],
      "teacher_guidance": {{}}
    }}"#
  ))
}

fn assessor_fixture(level: &str, confidence: f64) -> Canned {
  Canned::Json(format!(
    r#"{{"determined_level": "{level}", "confidence_score": {confidence},
         "weak_areas": [], "justification": "sustained upward trend"}}"#
  ))
}

fn diagnostic_fixture() -> Canned {
  Canned::Json(
    r#"{
      "determined_level": "A1",
      "confidence_score": 0.8,
      "weak_areas": ["articles_indefinite", "word_order"],
      "gaps": [{"area": "articles", "severity": "high",
                "description": "omits a/an", "l1_context": "Polish has no articles"}],
      "priorities": ["articles", "word order"],
      "profile_summary": "Beginner with article omission from Polish.",
      "recommended_start_level": "A1"
    }"#
    .into(),
  )
}

// ── Driver ─────────────────────────────────────────────────────────────

struct Loop {
  store: Store,
  prompts: Prompts,
  settings: Settings,
  student: i64,
  teacher: i64,
}

impl Loop {
  /// One full cycle: request + confirm a session (lesson and quiz come
  /// from the scripted generator), then submit the quiz answering the
  /// first `correct` of `questions` questions right. Returns the quiz id.
  async fn cycle(&self, questions: usize, correct: usize, submit_gen: Generator) -> i64 {
    let session = orchestrator::request_session(
      &self.store,
      self.student,
      self.teacher,
      "2026-08-10T10:00:00Z",
      60,
    )
    .await
    .unwrap();

    let confirm_gen = gen(vec![lesson_fixture("Articles practice", "Articles a/an"), quiz_fixture(questions)]);
    let envelope = orchestrator::confirm_session(
      &self.store,
      Some(&confirm_gen),
      &self.prompts,
      &self.settings,
      session.id,
    )
    .await
    .unwrap();
    assert_eq!(envelope.lesson.status, StepStatus::Completed);
    assert_eq!(envelope.quiz.status, StepStatus::Completed);

    let quiz = self.store.quiz_for_session(session.id).await.unwrap().unwrap();
    let answers: HashMap<String, String> = (1..=questions)
      .map(|i| {
        let answer = if i <= correct { "a" } else { "b" };
        (format!("q{i}"), answer.to_string())
      })
      .collect();

    orchestrator::submit_quiz(
      &self.store,
      Some(&submit_gen),
      &self.prompts,
      &self.settings,
      quiz.id,
      self.student,
      &answers,
    )
    .await
    .unwrap();
    quiz.id
  }
}

async fn intake_student(store: &Store) -> i64 {
  let student = store
    .create_student("Kasia", "polish", "pending", None, None)
    .await
    .unwrap();
  let start = intake::start_assessment(store, student).await.unwrap();
  intake::submit_placement(store, start.assessment_id, &HashMap::new())
    .await
    .unwrap();
  let diagnostic_gen = gen(vec![diagnostic_fixture()]);
  let outcome = intake::submit_diagnostic(
    store,
    Some(&diagnostic_gen),
    &Prompts::default(),
    start.assessment_id,
    &HashMap::new(),
  )
  .await
  .unwrap();
  assert_eq!(outcome.level.to_string(), "A1");
  student
}

// ── Scenarios ──────────────────────────────────────────────────────────

#[tokio::test]
async fn first_cycle_zero_score_produces_plan_v1_with_decrease() {
  let store = Store::connect_in_memory().await.unwrap();
  let student = intake_student(&store).await;
  let teacher = store
    .create_student("Teacher", "polish", "C2", None, None)
    .await
    .unwrap();
  let harness = Loop {
    store,
    prompts: Prompts::default(),
    settings: Settings::default(),
    student,
    teacher,
  };

  // Quiz 1: every answer wrong.
  harness.cycle(4, 0, gen(vec![plan_fixture("decrease_difficulty")])).await;

  let plan_row = harness.store.latest_plan(student).await.unwrap().unwrap();
  assert_eq!(plan_row.version, 1);
  let plan: PlanDraft = serde_json::from_str(&plan_row.plan_json).unwrap();
  assert_eq!(
    plan.difficulty_adjustment.recommendation,
    GlobalRecommendation::DecreaseDifficulty
  );
  assert_eq!(plan.top_weaknesses[0].skill_area, "articles_indefinite");

  let (snapshot, _) = harness.store.latest_dna(student).await.unwrap().unwrap();
  assert_eq!(snapshot.recent_avg, 0.0);
  assert!(snapshot.cold_start);
  assert_eq!(
    snapshot.global_recommendation,
    GlobalRecommendation::DecreaseDifficulty
  );

  // The attempt items carry only canonical tags.
  let outcomes = harness
    .store
    .recent_item_outcomes(student, None, 50)
    .await
    .unwrap();
  assert!(outcomes
    .iter()
    .all(|o| ["articles_indefinite", "word_order", "present_simple"].contains(&o.skill_tag.as_str())));

  // The topic may repeat after a sub-50% quiz; the next lesson builds fine.
  let session2 = orchestrator::request_session(
    &harness.store,
    student,
    teacher,
    "2026-08-17T10:00:00Z",
    60,
  )
  .await
  .unwrap();
  let confirm_gen = gen(vec![lesson_fixture("Articles practice", "Articles a/an"), quiz_fixture(4)]);
  let envelope = orchestrator::confirm_session(
    &harness.store,
    Some(&confirm_gen),
    &harness.prompts,
    &harness.settings,
    session2.id,
  )
  .await
  .unwrap();
  assert_eq!(envelope.status, SessionStatus::Confirmed);
  assert_eq!(harness.store.recent_artifacts(student, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn promotion_ladder_then_regression_keeps_level_and_bumps_plan() {
  let store = Store::connect_in_memory().await.unwrap();
  let student = intake_student(&store).await;
  let teacher = store
    .create_student("Teacher", "polish", "C2", None, None)
    .await
    .unwrap();
  let harness = Loop {
    store,
    prompts: Prompts::default(),
    settings: Settings::default(),
    student,
    teacher,
  };

  // Score ladder 20, 20, 33, 50, 60, 60, 60, 67, 80, 80 (percent), with
  // the plan recommendation matching the DNA directive at each step.
  let ladder: [(usize, usize, &str); 10] = [
    (5, 1, "decrease_difficulty"),
    (5, 1, "decrease_difficulty"),
    (3, 1, "decrease_difficulty"),
    (4, 2, "decrease_difficulty"),
    (5, 3, "decrease_difficulty"),
    (5, 3, "maintain"),
    (5, 3, "maintain"),
    (3, 2, "maintain"),
    (5, 4, "maintain"),
    (5, 4, "maintain"),
  ];

  for (i, (questions, correct, rec)) in ladder.iter().enumerate() {
    let responses = if i == 9 {
      // The tenth attempt opens the reassessment gate; the assessor is
      // consulted after the plan update.
      vec![plan_fixture(rec), assessor_fixture("A2", 0.85)]
    } else {
      vec![plan_fixture(rec)]
    };
    harness.cycle(*questions, *correct, gen(responses)).await;
  }

  // Promotion happened: one intake entry plus one reassessment entry.
  let student_row = harness.store.get_student(student).await.unwrap();
  assert_eq!(student_row.current_level, "A2");
  let history = harness.store.cefr_history(student, 10).await.unwrap();
  assert_eq!(history.len(), 2);
  assert_eq!(history[0].level, "A2");
  assert_eq!(history[0].source, "reassessment");

  assert_eq!(
    harness.store.plan_versions(student).await.unwrap(),
    (1..=10).collect::<Vec<i64>>()
  );

  // The reassessment snapshot re-entered cold start at the new level.
  let (snapshot, _) = harness.store.latest_dna(student).await.unwrap().unwrap();
  assert_eq!(snapshot.attempt_count, 0);
  assert!(snapshot.cold_start);

  // Regression: the first post-promotion attempt scores 50%. The plan
  // moves to v11 with a decrease directive; the level stays A2.
  harness.cycle(4, 2, gen(vec![plan_fixture("decrease_difficulty")])).await;

  let plan_row = harness.store.latest_plan(student).await.unwrap().unwrap();
  assert_eq!(plan_row.version, 11);
  let plan: PlanDraft = serde_json::from_str(&plan_row.plan_json).unwrap();
  assert_eq!(
    plan.difficulty_adjustment.recommendation,
    GlobalRecommendation::DecreaseDifficulty
  );

  assert_eq!(harness.store.get_student(student).await.unwrap().current_level, "A2");
  assert_eq!(harness.store.cefr_history(student, 10).await.unwrap().len(), 2);

  let (snapshot, _) = harness.store.latest_dna(student).await.unwrap().unwrap();
  assert_eq!(snapshot.attempt_count, 1);
  assert_eq!(snapshot.recent_avg, 50.0);
}
