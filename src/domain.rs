//! Domain models: CEFR levels, session lifecycle, question/tag sums, and the
//! typed schemas the generator must satisfy (lesson, quiz, plan, grading).
//!
//! JSON blobs in the store are parsed into these types at every read/write
//! boundary; nothing downstream works on untyped maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// CEFR proficiency band. `Pending` exists only between intake and the
/// completed placement assessment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CefrLevel {
  A1,
  A2,
  B1,
  B2,
  C1,
  C2,
  #[serde(rename = "pending")]
  Pending,
}

impl CefrLevel {
  /// Ordering rank; `Pending` sits below A1.
  pub fn rank(self) -> u8 {
    match self {
      CefrLevel::Pending => 0,
      CefrLevel::A1 => 1,
      CefrLevel::A2 => 2,
      CefrLevel::B1 => 3,
      CefrLevel::B2 => 4,
      CefrLevel::C1 => 5,
      CefrLevel::C2 => 6,
    }
  }

  pub fn next_up(self) -> CefrLevel {
    match self {
      CefrLevel::Pending | CefrLevel::A1 => CefrLevel::A2,
      CefrLevel::A2 => CefrLevel::B1,
      CefrLevel::B1 => CefrLevel::B2,
      CefrLevel::B2 => CefrLevel::C1,
      CefrLevel::C1 | CefrLevel::C2 => CefrLevel::C2,
    }
  }

  pub fn next_down(self) -> CefrLevel {
    match self {
      CefrLevel::Pending | CefrLevel::A1 | CefrLevel::A2 => CefrLevel::A1,
      CefrLevel::B1 => CefrLevel::A2,
      CefrLevel::B2 => CefrLevel::B1,
      CefrLevel::C1 => CefrLevel::B2,
      CefrLevel::C2 => CefrLevel::C1,
    }
  }
}

impl fmt::Display for CefrLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      CefrLevel::A1 => "A1",
      CefrLevel::A2 => "A2",
      CefrLevel::B1 => "B1",
      CefrLevel::B2 => "B2",
      CefrLevel::C1 => "C1",
      CefrLevel::C2 => "C2",
      CefrLevel::Pending => "pending",
    };
    f.write_str(s)
  }
}

impl FromStr for CefrLevel {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_uppercase().as_str() {
      "A1" => Ok(CefrLevel::A1),
      "A2" => Ok(CefrLevel::A2),
      "B1" => Ok(CefrLevel::B1),
      "B2" => Ok(CefrLevel::B2),
      "C1" => Ok(CefrLevel::C1),
      "C2" => Ok(CefrLevel::C2),
      "PENDING" => Ok(CefrLevel::Pending),
      other => Err(format!("unknown CEFR level: {other}")),
    }
  }
}

/// Session lifecycle states. Transitions are enforced by the orchestrator;
/// `completed` and `cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
  Requested,
  Confirmed,
  Completed,
  Cancelled,
}

impl SessionStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      SessionStatus::Requested => "requested",
      SessionStatus::Confirmed => "confirmed",
      SessionStatus::Completed => "completed",
      SessionStatus::Cancelled => "cancelled",
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
  }
}

impl fmt::Display for SessionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SessionStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "requested" => Ok(SessionStatus::Requested),
      "confirmed" => Ok(SessionStatus::Confirmed),
      "completed" => Ok(SessionStatus::Completed),
      "cancelled" => Ok(SessionStatus::Cancelled),
      other => Err(format!("unknown session status: {other}")),
    }
  }
}

/// Skill tag families. Every lesson tag and quiz question tag belongs to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
  Grammar,
  Vocabulary,
  Pronunciation,
  Conversation,
}

impl TagType {
  pub const ALL: [TagType; 4] = [
    TagType::Grammar,
    TagType::Vocabulary,
    TagType::Pronunciation,
    TagType::Conversation,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      TagType::Grammar => "grammar",
      TagType::Vocabulary => "vocabulary",
      TagType::Pronunciation => "pronunciation",
      TagType::Conversation => "conversation",
    }
  }
}

impl fmt::Display for TagType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Closed sum of quiz question kinds; the scorer dispatches on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
  MultipleChoice,
  TrueFalse,
  FillBlank,
  Translate,
  Reorder,
}

/// Global difficulty directive carried by DNA snapshots and plans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalRecommendation {
  Maintain,
  IncreaseDifficulty,
  DecreaseDifficulty,
}

impl fmt::Display for GlobalRecommendation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      GlobalRecommendation::Maintain => "maintain",
      GlobalRecommendation::IncreaseDifficulty => "increase_difficulty",
      GlobalRecommendation::DecreaseDifficulty => "decrease_difficulty",
    };
    f.write_str(s)
  }
}

/// Per-skill difficulty directive. `Insufficient` marks skills with fewer
/// than two scored items in the window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillRecommendation {
  Simplify,
  Maintain,
  Challenge,
  #[serde(rename = "<2pts")]
  Insufficient,
}

impl fmt::Display for SkillRecommendation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SkillRecommendation::Simplify => "simplify",
      SkillRecommendation::Maintain => "maintain",
      SkillRecommendation::Challenge => "challenge",
      SkillRecommendation::Insufficient => "<2pts",
    };
    f.write_str(s)
  }
}

/// Score trend over the recent attempt history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trajectory {
  Improving,
  Stable,
  Declining,
}

impl fmt::Display for Trajectory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Trajectory::Improving => "improving",
      Trajectory::Stable => "stable",
      Trajectory::Declining => "declining",
    };
    f.write_str(s)
  }
}

/// Per-step outcome in the post-confirmation pipeline envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Pending,
  Completed,
  Failed,
}

// ── Lesson schema ──────────────────────────────────────────────────────

/// One skill tag emitted by the lesson generator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkillTagDraft {
  #[serde(rename = "type")]
  pub tag_type: TagType,
  pub value: String,
  pub cefr_level: CefrLevel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WarmUp {
  pub duration_minutes: u32,
  pub description: String,
  #[serde(default)]
  pub materials: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Presentation {
  pub duration_minutes: u32,
  pub topic: String,
  pub explanation: String,
  #[serde(default)]
  pub polish_explanation: Option<String>,
  #[serde(default)]
  pub examples: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Exercise {
  #[serde(rename = "type")]
  pub kind: String,
  pub instruction: String,
  pub content: String,
  #[serde(default)]
  pub answer: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlledPractice {
  pub duration_minutes: u32,
  #[serde(default)]
  pub exercises: Vec<Exercise>,
  #[serde(default)]
  pub success_criteria: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FreePractice {
  pub duration_minutes: u32,
  pub description: String,
  #[serde(default)]
  pub conversation_prompts: Vec<String>,
  #[serde(default)]
  pub success_criteria: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WrapUp {
  pub duration_minutes: u32,
  pub summary: String,
  #[serde(default)]
  pub homework: Option<String>,
}

/// The full five-phase lesson artifact as returned by the generator and
/// stored immutably. `skill_tags` are normalized before persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LessonDraft {
  pub objective: String,
  pub difficulty: CefrLevel,
  #[serde(default)]
  pub polish_explanation: Option<String>,
  pub warm_up: WarmUp,
  pub presentation: Presentation,
  pub controlled_practice: ControlledPractice,
  pub free_practice: FreePractice,
  pub wrap_up: WrapUp,
  #[serde(default)]
  pub skill_tags: Vec<SkillTagDraft>,
}

// ── Quiz schema ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuizQuestion {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: QuestionType,
  pub text: String,
  #[serde(default)]
  pub options: Option<Vec<String>>,
  pub correct_answer: String,
  #[serde(default)]
  pub explanation: Option<String>,
  pub skill_tag: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuizDraft {
  pub title: String,
  #[serde(default)]
  pub title_pl: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub estimated_time_minutes: Option<u32>,
  pub questions: Vec<QuizQuestion>,
}

// ── Plan schema ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaknessPriority {
  High,
  Medium,
  Low,
  Maintenance,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanWeakness {
  pub skill_area: String,
  pub accuracy_observed: f64,
  pub priority: WeaknessPriority,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DifficultyAdjustment {
  pub current_level: CefrLevel,
  pub recommendation: GlobalRecommendation,
  pub rationale: String,
}

/// Versioned learning plan content. The `version` lives on the store row,
/// not in the JSON; continuity is recomputed at write time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanDraft {
  pub summary: String,
  pub goals_next_2_weeks: Vec<String>,
  pub top_weaknesses: Vec<PlanWeakness>,
  pub difficulty_adjustment: DifficultyAdjustment,
  pub grammar_focus: String,
  pub vocabulary_focus: String,
  #[serde(default)]
  pub recommended_drills: Vec<String>,
  #[serde(default)]
  pub teacher_guidance: serde_json::Value,
}

// ── AI grading schema ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradingVerdict {
  pub is_correct: bool,
  pub partial_credit: f64,
  pub feedback: String,
}

// ── Learning DNA snapshot ──────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DnaSnapshot {
  pub computed_at: String,
  /// Attempts since the last CEFR level change (the windowing scope).
  pub attempt_count: usize,
  /// Mean of the most recent min(window, n) scores, 0-100, two decimals.
  pub recent_avg: f64,
  /// Mean of all in-scope scores, 0-100, two decimals.
  pub lifetime_avg: f64,
  pub per_skill: BTreeMap<String, SkillRecommendation>,
  pub global_recommendation: GlobalRecommendation,
  pub trajectory: Trajectory,
  /// True while fewer than two scored attempts exist in scope.
  pub cold_start: bool,
}

// ── Assessment schemas ─────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticGap {
  pub area: String,
  pub severity: String,
  pub description: String,
  #[serde(default)]
  pub l1_context: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LearnerProfileData {
  #[serde(default)]
  pub gaps: Vec<DiagnosticGap>,
  #[serde(default)]
  pub priorities: Vec<String>,
  pub profile_summary: String,
  pub recommended_start_level: CefrLevel,
}

/// Assessor output for the diagnostic stage and for periodic reassessment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssessorVerdict {
  pub determined_level: CefrLevel,
  pub confidence_score: f64,
  #[serde(default)]
  pub weak_areas: Vec<String>,
  #[serde(default)]
  pub justification: Option<String>,
}

// ── Learning point extraction schema ───────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedPoint {
  pub point_type: String,
  pub content: String,
  #[serde(default)]
  pub polish_explanation: Option<String>,
  #[serde(default)]
  pub example_sentence: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedPoints {
  #[serde(default)]
  pub learning_points: Vec<ExtractedPoint>,
}

// ── L1 interference analysis schema ────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectedPattern {
  pub category: String,
  pub detail: String,
  pub evidence: String,
  #[serde(default = "default_severity")]
  pub severity: String,
}

fn default_severity() -> String {
  "low".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectedPatterns {
  #[serde(default)]
  pub patterns: Vec<DetectedPattern>,
}
