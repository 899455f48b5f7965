//! Store: all persistence for the learning loop, over a dedicated SQLite
//! pool (WAL mode, embedded schema). The store exclusively owns the
//! database; plans, DNA snapshots, observations and CEFR history are
//! append-only, lesson/quiz JSON blobs are immutable after insert.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

use crate::domain::{
  DnaSnapshot, LearnerProfileData, SessionStatus, SkillTagDraft,
};
use crate::error::{EngineError, Result};

pub struct Store {
  pool: SqlitePool,
}

// ── Row types ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, FromRow)]
pub struct StudentRow {
  pub id: i64,
  pub name: String,
  pub current_level: String,
  pub native_language: String,
  pub goals: Option<String>,
  pub problem_areas: Option<String>,
}

#[derive(Clone, Debug, FromRow)]
pub struct AssessmentRow {
  pub id: i64,
  pub student_id: i64,
  pub status: String,
  pub bracket: Option<String>,
  pub placement_score: Option<f64>,
  pub determined_level: Option<String>,
  pub confidence: Option<f64>,
  pub weak_areas: Option<String>,
}

#[derive(Clone, Debug, FromRow)]
pub struct SessionRow {
  pub id: i64,
  pub student_id: i64,
  pub teacher_id: i64,
  pub scheduled_at: String,
  pub duration_min: i64,
  pub status: String,
  pub teacher_notes: Option<String>,
  pub homework: Option<String>,
  pub session_summary: Option<String>,
}

impl SessionRow {
  pub fn status(&self) -> Result<SessionStatus> {
    self
      .status
      .parse::<SessionStatus>()
      .map_err(EngineError::Validation)
  }
}

#[derive(Clone, Debug, FromRow)]
pub struct PlanRow {
  pub id: i64,
  pub student_id: i64,
  pub version: i64,
  pub plan_json: String,
  pub summary: Option<String>,
  pub created_at: String,
}

#[derive(Clone, Debug, FromRow)]
pub struct ArtifactRow {
  pub id: i64,
  pub session_id: i64,
  pub student_id: i64,
  pub teacher_id: i64,
  pub lesson_json: String,
  pub topics_json: Option<String>,
  pub difficulty: String,
  pub prompt_version: String,
  pub created_at: String,
}

#[derive(Clone, Debug, FromRow)]
pub struct QuizRow {
  pub id: i64,
  pub session_id: i64,
  pub student_id: i64,
  pub quiz_json: String,
  pub derived_from_lesson_artifact_id: i64,
  pub created_at: String,
}

#[derive(Clone, Debug, FromRow)]
pub struct AttemptRow {
  pub id: i64,
  pub quiz_id: i64,
  pub student_id: i64,
  pub session_id: Option<i64>,
  pub score: Option<f64>,
  pub results_json: Option<String>,
  pub submitted_at: Option<String>,
}

#[derive(Clone, Debug, FromRow)]
pub struct AttemptItemRow {
  pub id: i64,
  pub attempt_id: i64,
  pub question_id: String,
  pub is_correct: i64,
  pub student_answer: Option<String>,
  pub expected_answer: Option<String>,
  pub skill_tag: String,
}

#[derive(Clone, Debug, FromRow)]
pub struct ObservationRow {
  pub id: i64,
  pub student_id: i64,
  pub session_id: i64,
  pub skill: String,
  pub score: f64,
  pub cefr_level: Option<String>,
  pub notes: Option<String>,
  pub created_at: String,
}

#[derive(Clone, Debug, FromRow)]
pub struct CefrHistoryRow {
  pub id: i64,
  pub student_id: i64,
  pub level: String,
  pub confidence: Option<f64>,
  pub source: String,
  pub recorded_at: String,
}

#[derive(Clone, Debug, FromRow)]
pub struct SpacedItemRow {
  pub id: i64,
  pub student_id: i64,
  pub item_kind: String,
  pub point_type: String,
  pub content: String,
  pub polish_explanation: Option<String>,
  pub example_sentence: Option<String>,
  pub ease_factor: f64,
  pub interval_days: f64,
  pub repetitions: i64,
  pub times_reviewed: i64,
  pub last_recall_score: Option<f64>,
  pub next_review: Option<String>,
}

#[derive(Clone, Debug, FromRow)]
pub struct InterferenceRow {
  pub pattern_category: String,
  pub pattern_detail: String,
  pub status: String,
  pub occurrences: i64,
  pub first_seen_at: String,
  pub last_seen_at: String,
  pub overcome_at: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ItemOutcome {
  pub skill_tag: String,
  pub is_correct: bool,
}

fn now_iso() -> String {
  Utc::now().to_rfc3339()
}

impl Store {
  /// Connect to (or create) the database at `path`, enable WAL, run the
  /// embedded schema.
  pub async fn connect(path: &str) -> Result<Self> {
    let url = format!("sqlite:{path}?mode=rwc");
    let options = SqliteConnectOptions::from_str(&url)
      .map_err(|e| EngineError::Validation(format!("invalid database path: {e}")))?
      .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
      .busy_timeout(std::time::Duration::from_secs(5))
      .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    Ok(Self { pool })
  }

  /// In-memory database for tests. Single connection so the schema and the
  /// data share one memory file.
  pub async fn connect_in_memory() -> Result<Self> {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await?;
    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    Ok(Self { pool })
  }

  // ── Students ─────────────────────────────────────────────────────────

  pub async fn create_student(
    &self,
    name: &str,
    native_language: &str,
    current_level: &str,
    goals: Option<&str>,
    problem_areas: Option<&str>,
  ) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO users (name, native_language, current_level, goals, problem_areas)
       VALUES (?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(native_language)
    .bind(current_level)
    .bind(goals)
    .bind(problem_areas)
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  pub async fn get_student(&self, student_id: i64) -> Result<StudentRow> {
    sqlx::query_as::<_, StudentRow>(
      "SELECT id, name, current_level, native_language, goals, problem_areas
       FROM users WHERE id = ?",
    )
    .bind(student_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or(EngineError::NotFound("student", student_id))
  }

  pub async fn set_student_level(&self, student_id: i64, level: &str) -> Result<()> {
    sqlx::query("UPDATE users SET current_level = ? WHERE id = ?")
      .bind(level)
      .bind(student_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  // ── Assessments ──────────────────────────────────────────────────────

  pub async fn create_assessment(&self, student_id: i64) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO assessments (student_id, status) VALUES (?, 'placement')",
    )
    .bind(student_id)
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  pub async fn get_assessment(&self, assessment_id: i64) -> Result<AssessmentRow> {
    sqlx::query_as::<_, AssessmentRow>(
      "SELECT id, student_id, status, bracket, placement_score,
              determined_level, confidence, weak_areas
       FROM assessments WHERE id = ?",
    )
    .bind(assessment_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or(EngineError::NotFound("assessment", assessment_id))
  }

  pub async fn record_placement(
    &self,
    assessment_id: i64,
    bracket: &str,
    placement_score: f64,
    answers_json: &str,
  ) -> Result<()> {
    sqlx::query(
      "UPDATE assessments
       SET status = 'diagnostic', bracket = ?, placement_score = ?,
           placement_answers = ?, updated_at = ?
       WHERE id = ?",
    )
    .bind(bracket)
    .bind(placement_score)
    .bind(answers_json)
    .bind(now_iso())
    .bind(assessment_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  pub async fn complete_assessment(
    &self,
    assessment_id: i64,
    determined_level: &str,
    confidence: f64,
    weak_areas_json: &str,
  ) -> Result<()> {
    sqlx::query(
      "UPDATE assessments
       SET status = 'completed', determined_level = ?, confidence = ?,
           weak_areas = ?, updated_at = ?
       WHERE id = ?",
    )
    .bind(determined_level)
    .bind(confidence)
    .bind(weak_areas_json)
    .bind(now_iso())
    .bind(assessment_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  pub async fn completed_assessment_exists(&self, student_id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
      "SELECT id FROM assessments WHERE student_id = ? AND status = 'completed' LIMIT 1",
    )
    .bind(student_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.is_some())
  }

  // ── Learner profiles / paths ─────────────────────────────────────────

  pub async fn insert_learner_profile(
    &self,
    student_id: i64,
    profile: &LearnerProfileData,
  ) -> Result<i64> {
    let gaps = serde_json::to_string(&profile.gaps)
      .map_err(|e| EngineError::Validation(e.to_string()))?;
    let priorities = serde_json::to_string(&profile.priorities)
      .map_err(|e| EngineError::Validation(e.to_string()))?;
    let res = sqlx::query(
      "INSERT INTO learner_profiles
         (student_id, gaps, priorities, profile_summary, recommended_start_level)
       VALUES (?, ?, ?, ?, ?)",
    )
    .bind(student_id)
    .bind(gaps)
    .bind(priorities)
    .bind(&profile.profile_summary)
    .bind(profile.recommended_start_level.to_string())
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  pub async fn latest_learner_profile(
    &self,
    student_id: i64,
  ) -> Result<Option<LearnerProfileData>> {
    let row: Option<(String, String, String, String)> = sqlx::query_as(
      "SELECT gaps, priorities, profile_summary, recommended_start_level
       FROM learner_profiles WHERE student_id = ?
       ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(student_id)
    .fetch_optional(&self.pool)
    .await?;

    let Some((gaps, priorities, profile_summary, level)) = row else {
      return Ok(None);
    };
    Ok(Some(LearnerProfileData {
      gaps: serde_json::from_str(&gaps).unwrap_or_default(),
      priorities: serde_json::from_str(&priorities).unwrap_or_default(),
      profile_summary,
      recommended_start_level: level
        .parse()
        .map_err(EngineError::Validation)?,
    }))
  }

  pub async fn insert_learning_path(
    &self,
    student_id: i64,
    target_level: &str,
    current_level: &str,
    weekly_plan_json: &str,
  ) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO learning_paths
         (student_id, target_level, current_level, weekly_plan, status)
       VALUES (?, ?, ?, ?, 'active')",
    )
    .bind(student_id)
    .bind(target_level)
    .bind(current_level)
    .bind(weekly_plan_json)
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  // ── Learning plans ───────────────────────────────────────────────────

  /// Insert a plan at `MAX(version) + 1` for the student. The
  /// `UNIQUE(student_id, version)` constraint guards concurrent writers;
  /// a losing writer gets `StoreConflict` and the caller retries once.
  pub async fn insert_plan_next_version(
    &self,
    student_id: i64,
    plan_json: &str,
    summary: &str,
  ) -> Result<(i64, i64)> {
    let (next_version,): (i64,) = sqlx::query_as(
      "SELECT COALESCE(MAX(version), 0) + 1 FROM learning_plans WHERE student_id = ?",
    )
    .bind(student_id)
    .fetch_one(&self.pool)
    .await?;

    let res = sqlx::query(
      "INSERT INTO learning_plans (student_id, version, plan_json, summary, created_at)
       VALUES (?, ?, ?, ?, ?)",
    )
    .bind(student_id)
    .bind(next_version)
    .bind(plan_json)
    .bind(summary)
    .bind(now_iso())
    .execute(&self.pool)
    .await;

    match res {
      Ok(r) => Ok((r.last_insert_rowid(), next_version)),
      Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
        EngineError::StoreConflict(format!(
          "plan version {next_version} already taken for student {student_id}"
        )),
      ),
      Err(e) => Err(e.into()),
    }
  }

  pub async fn latest_plan(&self, student_id: i64) -> Result<Option<PlanRow>> {
    Ok(
      sqlx::query_as::<_, PlanRow>(
        "SELECT id, student_id, version, plan_json, summary, created_at
         FROM learning_plans WHERE student_id = ?
         ORDER BY version DESC LIMIT 1",
      )
      .bind(student_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  pub async fn plan_versions(&self, student_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
      "SELECT version FROM learning_plans WHERE student_id = ? ORDER BY version ASC",
    )
    .bind(student_id)
    .fetch_all(&self.pool)
    .await?;
    Ok(rows.into_iter().map(|(v,)| v).collect())
  }

  // ── Sessions ─────────────────────────────────────────────────────────

  pub async fn create_session(
    &self,
    student_id: i64,
    teacher_id: i64,
    scheduled_at: &str,
    duration_min: i64,
  ) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO sessions (student_id, teacher_id, scheduled_at, duration_min, status)
       VALUES (?, ?, ?, ?, 'requested')",
    )
    .bind(student_id)
    .bind(teacher_id)
    .bind(scheduled_at)
    .bind(duration_min)
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  pub async fn get_session(&self, session_id: i64) -> Result<SessionRow> {
    sqlx::query_as::<_, SessionRow>(
      "SELECT id, student_id, teacher_id, scheduled_at, duration_min, status,
              teacher_notes, homework, session_summary
       FROM sessions WHERE id = ?",
    )
    .bind(session_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or(EngineError::NotFound("session", session_id))
  }

  pub async fn set_session_status(&self, session_id: i64, status: SessionStatus) -> Result<()> {
    sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?")
      .bind(status.as_str())
      .bind(now_iso())
      .bind(session_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  pub async fn complete_session(
    &self,
    session_id: i64,
    teacher_notes: Option<&str>,
    homework: Option<&str>,
    session_summary: Option<&str>,
  ) -> Result<()> {
    sqlx::query(
      "UPDATE sessions
       SET status = 'completed', teacher_notes = ?, homework = ?,
           session_summary = ?, updated_at = ?
       WHERE id = ?",
    )
    .bind(teacher_notes)
    .bind(homework)
    .bind(session_summary)
    .bind(now_iso())
    .bind(session_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  /// Confirmed or completed sessions on record, for session numbering.
  pub async fn session_count(&self, student_id: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
      "SELECT COUNT(*) FROM sessions
       WHERE student_id = ? AND status IN ('confirmed', 'completed')",
    )
    .bind(student_id)
    .fetch_one(&self.pool)
    .await?;
    Ok(count)
  }

  // ── Lesson artifacts + skill tags ────────────────────────────────────

  pub async fn artifact_for_session(&self, session_id: i64) -> Result<Option<ArtifactRow>> {
    Ok(
      sqlx::query_as::<_, ArtifactRow>(
        "SELECT id, session_id, student_id, teacher_id, lesson_json, topics_json,
                difficulty, prompt_version, created_at
         FROM lesson_artifacts WHERE session_id = ?",
      )
      .bind(session_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  pub async fn recent_artifacts(&self, student_id: i64, limit: i64) -> Result<Vec<ArtifactRow>> {
    Ok(
      sqlx::query_as::<_, ArtifactRow>(
        "SELECT id, session_id, student_id, teacher_id, lesson_json, topics_json,
                difficulty, prompt_version, created_at
         FROM lesson_artifacts WHERE student_id = ?
         ORDER BY created_at DESC, id DESC LIMIT ?",
      )
      .bind(student_id)
      .bind(limit)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  /// Artifact and its skill-tag rows land in one transaction: on any
  /// failure, neither persists.
  pub async fn insert_artifact_with_tags(
    &self,
    session_id: i64,
    student_id: i64,
    teacher_id: i64,
    lesson_json: &str,
    topics_json: &str,
    difficulty: &str,
    prompt_version: &str,
    tags: &[SkillTagDraft],
  ) -> Result<i64> {
    let mut tx = self.pool.begin().await?;

    let res = sqlx::query(
      "INSERT INTO lesson_artifacts
         (session_id, student_id, teacher_id, lesson_json, topics_json,
          difficulty, prompt_version, created_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(student_id)
    .bind(teacher_id)
    .bind(lesson_json)
    .bind(topics_json)
    .bind(difficulty)
    .bind(prompt_version)
    .bind(now_iso())
    .execute(&mut *tx)
    .await?;
    let artifact_id = res.last_insert_rowid();

    for tag in tags {
      sqlx::query(
        "INSERT INTO lesson_skill_tags (lesson_artifact_id, tag_type, tag_value, cefr_level)
         VALUES (?, ?, ?, ?)",
      )
      .bind(artifact_id)
      .bind(tag.tag_type.as_str())
      .bind(&tag.value)
      .bind(tag.cefr_level.to_string())
      .execute(&mut *tx)
      .await?;
    }

    tx.commit().await?;
    Ok(artifact_id)
  }

  pub async fn recent_skill_tags(&self, student_id: i64, limit: i64) -> Result<Vec<(String, String, String)>> {
    Ok(
      sqlx::query_as(
        "SELECT lst.tag_type, lst.tag_value, lst.cefr_level
         FROM lesson_skill_tags lst
         JOIN lesson_artifacts la ON la.id = lst.lesson_artifact_id
         WHERE la.student_id = ?
         ORDER BY la.created_at DESC, lst.id DESC LIMIT ?",
      )
      .bind(student_id)
      .bind(limit)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  // ── Quizzes ──────────────────────────────────────────────────────────

  pub async fn quiz_for_session(&self, session_id: i64) -> Result<Option<QuizRow>> {
    Ok(
      sqlx::query_as::<_, QuizRow>(
        "SELECT id, session_id, student_id, quiz_json,
                derived_from_lesson_artifact_id, created_at
         FROM next_quizzes WHERE session_id = ?",
      )
      .bind(session_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  pub async fn insert_quiz(
    &self,
    session_id: i64,
    student_id: i64,
    quiz_json: &str,
    derived_from_lesson_artifact_id: i64,
  ) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO next_quizzes
         (session_id, student_id, quiz_json, derived_from_lesson_artifact_id, created_at)
       VALUES (?, ?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(student_id)
    .bind(quiz_json)
    .bind(derived_from_lesson_artifact_id)
    .bind(now_iso())
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  pub async fn get_quiz(&self, quiz_id: i64) -> Result<QuizRow> {
    sqlx::query_as::<_, QuizRow>(
      "SELECT id, session_id, student_id, quiz_json,
              derived_from_lesson_artifact_id, created_at
       FROM next_quizzes WHERE id = ?",
    )
    .bind(quiz_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or(EngineError::NotFound("quiz", quiz_id))
  }

  /// Quizzes the student has not attempted yet, newest first.
  pub async fn pending_quizzes(&self, student_id: i64) -> Result<Vec<QuizRow>> {
    Ok(
      sqlx::query_as::<_, QuizRow>(
        "SELECT nq.id, nq.session_id, nq.student_id, nq.quiz_json,
                nq.derived_from_lesson_artifact_id, nq.created_at
         FROM next_quizzes nq
         WHERE nq.student_id = ?
           AND NOT EXISTS (
             SELECT 1 FROM quiz_attempts qa
             WHERE qa.quiz_id = nq.id AND qa.student_id = nq.student_id
           )
         ORDER BY nq.created_at DESC, nq.id DESC",
      )
      .bind(student_id)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  /// Submitted score fraction for the quiz derived from an artifact, if any.
  pub async fn quiz_score_for_artifact(&self, artifact_id: i64) -> Result<Option<f64>> {
    let row: Option<(Option<f64>,)> = sqlx::query_as(
      "SELECT qa.score
       FROM quiz_attempts qa
       JOIN next_quizzes nq ON nq.id = qa.quiz_id
       WHERE nq.derived_from_lesson_artifact_id = ? AND qa.submitted_at IS NOT NULL
       ORDER BY qa.submitted_at DESC LIMIT 1",
    )
    .bind(artifact_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.and_then(|(s,)| s))
  }

  // ── Quiz attempts + items ────────────────────────────────────────────

  pub async fn attempt_for_quiz(
    &self,
    quiz_id: i64,
    student_id: i64,
  ) -> Result<Option<AttemptRow>> {
    Ok(
      sqlx::query_as::<_, AttemptRow>(
        "SELECT id, quiz_id, student_id, session_id, score, results_json, submitted_at
         FROM quiz_attempts WHERE quiz_id = ? AND student_id = ?",
      )
      .bind(quiz_id)
      .bind(student_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  /// One attempt per quiz per student; the unique constraint turns a
  /// concurrent duplicate into `StoreConflict`.
  pub async fn insert_attempt(
    &self,
    quiz_id: i64,
    student_id: i64,
    session_id: Option<i64>,
  ) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO quiz_attempts (quiz_id, student_id, session_id) VALUES (?, ?, ?)",
    )
    .bind(quiz_id)
    .bind(student_id)
    .bind(session_id)
    .execute(&self.pool)
    .await;

    match res {
      Ok(r) => Ok(r.last_insert_rowid()),
      Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
        EngineError::StoreConflict(format!(
          "attempt already exists for quiz {quiz_id}, student {student_id}"
        )),
      ),
      Err(e) => Err(e.into()),
    }
  }

  pub async fn submit_attempt(
    &self,
    attempt_id: i64,
    score: f64,
    results_json: &str,
  ) -> Result<()> {
    sqlx::query(
      "UPDATE quiz_attempts SET score = ?, results_json = ?, submitted_at = ? WHERE id = ?",
    )
    .bind(score)
    .bind(results_json)
    .bind(now_iso())
    .bind(attempt_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  pub async fn insert_attempt_items(
    &self,
    attempt_id: i64,
    items: &[(String, bool, String, String, String)],
  ) -> Result<()> {
    let mut tx = self.pool.begin().await?;
    for (question_id, is_correct, student_answer, expected_answer, skill_tag) in items {
      sqlx::query(
        "INSERT INTO quiz_attempt_items
           (attempt_id, question_id, is_correct, student_answer, expected_answer, skill_tag)
         VALUES (?, ?, ?, ?, ?, ?)",
      )
      .bind(attempt_id)
      .bind(question_id)
      .bind(if *is_correct { 1 } else { 0 })
      .bind(student_answer)
      .bind(expected_answer)
      .bind(skill_tag)
      .execute(&mut *tx)
      .await?;
    }
    tx.commit().await?;
    Ok(())
  }

  pub async fn attempt_items(&self, attempt_id: i64) -> Result<Vec<AttemptItemRow>> {
    Ok(
      sqlx::query_as::<_, AttemptItemRow>(
        "SELECT id, attempt_id, question_id, is_correct, student_answer,
                expected_answer, skill_tag
         FROM quiz_attempt_items WHERE attempt_id = ? ORDER BY id ASC",
      )
      .bind(attempt_id)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  pub async fn latest_attempt(&self, student_id: i64) -> Result<Option<AttemptRow>> {
    Ok(
      sqlx::query_as::<_, AttemptRow>(
        "SELECT id, quiz_id, student_id, session_id, score, results_json, submitted_at
         FROM quiz_attempts
         WHERE student_id = ? AND submitted_at IS NOT NULL
         ORDER BY submitted_at DESC, id DESC LIMIT 1",
      )
      .bind(student_id)
      .fetch_optional(&self.pool)
      .await?,
    )
  }

  /// Submitted scores (0-1) in chronological order, optionally only those
  /// after `since` (the last CEFR level change).
  pub async fn attempt_scores_since(
    &self,
    student_id: i64,
    since: Option<&str>,
  ) -> Result<Vec<f64>> {
    let rows: Vec<(f64,)> = match since {
      Some(ts) => {
        sqlx::query_as(
          "SELECT score FROM quiz_attempts
           WHERE student_id = ? AND submitted_at IS NOT NULL AND submitted_at > ?
           ORDER BY submitted_at ASC, id ASC",
        )
        .bind(student_id)
        .bind(ts)
        .fetch_all(&self.pool)
        .await?
      }
      None => {
        sqlx::query_as(
          "SELECT score FROM quiz_attempts
           WHERE student_id = ? AND submitted_at IS NOT NULL
           ORDER BY submitted_at ASC, id ASC",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?
      }
    };
    Ok(rows.into_iter().map(|(s,)| s).collect())
  }

  /// Per-item outcomes in reverse-chronological attempt order, for the
  /// per-skill windows. `since` scopes to the current CEFR level.
  pub async fn recent_item_outcomes(
    &self,
    student_id: i64,
    since: Option<&str>,
    limit: i64,
  ) -> Result<Vec<ItemOutcome>> {
    let rows: Vec<(String, i64)> = match since {
      Some(ts) => {
        sqlx::query_as(
          "SELECT qai.skill_tag, qai.is_correct
           FROM quiz_attempt_items qai
           JOIN quiz_attempts qa ON qa.id = qai.attempt_id
           WHERE qa.student_id = ? AND qa.submitted_at IS NOT NULL AND qa.submitted_at > ?
           ORDER BY qa.submitted_at DESC, qai.id DESC LIMIT ?",
        )
        .bind(student_id)
        .bind(ts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
      }
      None => {
        sqlx::query_as(
          "SELECT qai.skill_tag, qai.is_correct
           FROM quiz_attempt_items qai
           JOIN quiz_attempts qa ON qa.id = qai.attempt_id
           WHERE qa.student_id = ? AND qa.submitted_at IS NOT NULL
           ORDER BY qa.submitted_at DESC, qai.id DESC LIMIT ?",
        )
        .bind(student_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
      }
    };
    Ok(
      rows
        .into_iter()
        .map(|(skill_tag, is_correct)| ItemOutcome {
          skill_tag,
          is_correct: is_correct != 0,
        })
        .collect(),
    )
  }

  // ── Teacher observations ─────────────────────────────────────────────

  pub async fn insert_observation(
    &self,
    student_id: i64,
    session_id: i64,
    skill: &str,
    score: f64,
    cefr_level: Option<&str>,
    notes: Option<&str>,
  ) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO session_skill_observations
         (student_id, session_id, skill, score, cefr_level, notes, created_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(student_id)
    .bind(session_id)
    .bind(skill)
    .bind(score)
    .bind(cefr_level)
    .bind(notes)
    .bind(now_iso())
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  pub async fn recent_observations(
    &self,
    student_id: i64,
    limit: i64,
  ) -> Result<Vec<ObservationRow>> {
    Ok(
      sqlx::query_as::<_, ObservationRow>(
        "SELECT id, student_id, session_id, skill, score, cefr_level, notes, created_at
         FROM session_skill_observations
         WHERE student_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
      )
      .bind(student_id)
      .bind(limit)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  // ── Learning DNA ─────────────────────────────────────────────────────

  /// Unconditional append; versions strictly increase per student.
  pub async fn insert_dna(
    &self,
    student_id: i64,
    snapshot: &DnaSnapshot,
    trigger_event: &str,
  ) -> Result<i64> {
    let dna_json = serde_json::to_string(snapshot)
      .map_err(|e| EngineError::Validation(e.to_string()))?;
    sqlx::query(
      "INSERT INTO learning_dna (student_id, dna_json, version, trigger_event, created_at)
       SELECT ?, ?, COALESCE(MAX(version), 0) + 1, ?, ?
       FROM learning_dna WHERE student_id = ?",
    )
    .bind(student_id)
    .bind(dna_json)
    .bind(trigger_event)
    .bind(now_iso())
    .bind(student_id)
    .execute(&self.pool)
    .await?;

    let (version,): (i64,) = sqlx::query_as(
      "SELECT COALESCE(MAX(version), 0) FROM learning_dna WHERE student_id = ?",
    )
    .bind(student_id)
    .fetch_one(&self.pool)
    .await?;
    Ok(version)
  }

  pub async fn latest_dna(&self, student_id: i64) -> Result<Option<(DnaSnapshot, i64)>> {
    let row: Option<(String, i64)> = sqlx::query_as(
      "SELECT dna_json, version FROM learning_dna
       WHERE student_id = ? ORDER BY version DESC LIMIT 1",
    )
    .bind(student_id)
    .fetch_optional(&self.pool)
    .await?;

    match row {
      Some((json, version)) => {
        let snapshot = serde_json::from_str(&json)
          .map_err(|e| EngineError::Validation(format!("corrupt DNA snapshot: {e}")))?;
        Ok(Some((snapshot, version)))
      }
      None => Ok(None),
    }
  }

  // ── L1 interference ──────────────────────────────────────────────────

  /// Record or increment an observed pattern; re-exhibiting an overcome
  /// pattern flips it back to exhibited.
  pub async fn upsert_interference(
    &self,
    student_id: i64,
    category: &str,
    detail: &str,
  ) -> Result<()> {
    let now = now_iso();
    sqlx::query(
      "INSERT INTO l1_interference_tracking
         (student_id, pattern_category, pattern_detail, status, occurrences,
          first_seen_at, last_seen_at)
       VALUES (?, ?, ?, 'exhibited', 1, ?, ?)
       ON CONFLICT(student_id, pattern_category, pattern_detail) DO UPDATE SET
         occurrences = occurrences + 1,
         last_seen_at = excluded.last_seen_at,
         status = 'exhibited'",
    )
    .bind(student_id)
    .bind(category)
    .bind(detail)
    .bind(&now)
    .bind(&now)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  pub async fn mark_interference_overcome(
    &self,
    student_id: i64,
    category: &str,
    detail: &str,
  ) -> Result<()> {
    sqlx::query(
      "UPDATE l1_interference_tracking
       SET status = 'overcome', overcome_at = ?
       WHERE student_id = ? AND pattern_category = ? AND pattern_detail = ?",
    )
    .bind(now_iso())
    .bind(student_id)
    .bind(category)
    .bind(detail)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  pub async fn interference_rows(&self, student_id: i64) -> Result<Vec<InterferenceRow>> {
    Ok(
      sqlx::query_as::<_, InterferenceRow>(
        "SELECT pattern_category, pattern_detail, status, occurrences,
                first_seen_at, last_seen_at, overcome_at
         FROM l1_interference_tracking
         WHERE student_id = ? ORDER BY last_seen_at DESC",
      )
      .bind(student_id)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  // ── CEFR history ─────────────────────────────────────────────────────

  pub async fn append_cefr(
    &self,
    student_id: i64,
    level: &str,
    confidence: Option<f64>,
    source: &str,
  ) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO cefr_history (student_id, level, confidence, source, recorded_at)
       VALUES (?, ?, ?, ?, ?)",
    )
    .bind(student_id)
    .bind(level)
    .bind(confidence)
    .bind(source)
    .bind(now_iso())
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  pub async fn cefr_history(&self, student_id: i64, limit: i64) -> Result<Vec<CefrHistoryRow>> {
    Ok(
      sqlx::query_as::<_, CefrHistoryRow>(
        "SELECT id, student_id, level, confidence, source, recorded_at
         FROM cefr_history WHERE student_id = ?
         ORDER BY recorded_at DESC, id DESC LIMIT ?",
      )
      .bind(student_id)
      .bind(limit)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  /// Timestamp of the most recent level transition, used to scope the
  /// difficulty window and the reassessment attempt count.
  pub async fn last_level_change_at(&self, student_id: i64) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
      "SELECT recorded_at FROM cefr_history
       WHERE student_id = ? ORDER BY recorded_at DESC, id DESC LIMIT 1",
    )
    .bind(student_id)
    .fetch_optional(&self.pool)
    .await?;
    Ok(row.map(|(ts,)| ts))
  }

  // ── Spaced items (learning points, vocabulary) ───────────────────────

  pub async fn insert_spaced_item(
    &self,
    student_id: i64,
    item_kind: &str,
    point_type: &str,
    content: &str,
    polish_explanation: Option<&str>,
    example_sentence: Option<&str>,
  ) -> Result<i64> {
    let res = sqlx::query(
      "INSERT INTO spaced_items
         (student_id, item_kind, point_type, content, polish_explanation,
          example_sentence, created_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(student_id)
    .bind(item_kind)
    .bind(point_type)
    .bind(content)
    .bind(polish_explanation)
    .bind(example_sentence)
    .bind(now_iso())
    .execute(&self.pool)
    .await?;
    Ok(res.last_insert_rowid())
  }

  /// Items due for review, worst recall first: overdue, never reviewed,
  /// or last recall below 70.
  pub async fn due_spaced_items(&self, student_id: i64, limit: i64) -> Result<Vec<SpacedItemRow>> {
    Ok(
      sqlx::query_as::<_, SpacedItemRow>(
        "SELECT id, student_id, item_kind, point_type, content, polish_explanation,
                example_sentence, ease_factor, interval_days, repetitions,
                times_reviewed, last_recall_score, next_review
         FROM spaced_items
         WHERE student_id = ?
           AND (next_review IS NULL OR next_review <= ? OR times_reviewed = 0
                OR last_recall_score < 70)
         ORDER BY COALESCE(last_recall_score, 0) ASC, next_review ASC
         LIMIT ?",
      )
      .bind(student_id)
      .bind(now_iso())
      .bind(limit)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  pub async fn get_spaced_item(&self, item_id: i64) -> Result<SpacedItemRow> {
    sqlx::query_as::<_, SpacedItemRow>(
      "SELECT id, student_id, item_kind, point_type, content, polish_explanation,
              example_sentence, ease_factor, interval_days, repetitions,
              times_reviewed, last_recall_score, next_review
       FROM spaced_items WHERE id = ?",
    )
    .bind(item_id)
    .fetch_optional(&self.pool)
    .await?
    .ok_or(EngineError::NotFound("spaced item", item_id))
  }

  pub async fn update_spaced_item_review(
    &self,
    item_id: i64,
    ease_factor: f64,
    interval_days: f64,
    repetitions: i64,
    last_recall_score: f64,
    next_review: &str,
  ) -> Result<()> {
    sqlx::query(
      "UPDATE spaced_items
       SET ease_factor = ?, interval_days = ?, repetitions = ?,
           times_reviewed = times_reviewed + 1, last_recall_score = ?, next_review = ?
       WHERE id = ?",
    )
    .bind(ease_factor)
    .bind(interval_days)
    .bind(repetitions)
    .bind(last_recall_score)
    .bind(next_review)
    .bind(item_id)
    .execute(&self.pool)
    .await?;
    Ok(())
  }
}

impl std::fmt::Debug for Store {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Store").finish_non_exhaustive()
  }
}

/// Embedded schema. All tables use `IF NOT EXISTS` so re-running is safe.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'student',
    native_language TEXT NOT NULL DEFAULT 'polish',
    current_level TEXT NOT NULL DEFAULT 'pending',
    goals TEXT,
    problem_areas TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS assessments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    status TEXT NOT NULL DEFAULT 'placement',
    bracket TEXT,
    placement_score REAL,
    placement_answers TEXT,
    determined_level TEXT,
    confidence REAL,
    weak_areas TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_assessments_student ON assessments(student_id, status);

CREATE TABLE IF NOT EXISTS learner_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    gaps TEXT NOT NULL DEFAULT '[]',
    priorities TEXT NOT NULL DEFAULT '[]',
    profile_summary TEXT NOT NULL DEFAULT '',
    recommended_start_level TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS learning_paths (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    target_level TEXT NOT NULL,
    current_level TEXT NOT NULL,
    weekly_plan TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS learning_plans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    version INTEGER NOT NULL,
    plan_json TEXT NOT NULL,
    summary TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(student_id, version)
);

CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    teacher_id INTEGER NOT NULL REFERENCES users(id),
    scheduled_at TEXT NOT NULL,
    duration_min INTEGER NOT NULL DEFAULT 60,
    status TEXT NOT NULL DEFAULT 'requested',
    teacher_notes TEXT,
    homework TEXT,
    session_summary TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_student ON sessions(student_id, status);

CREATE TABLE IF NOT EXISTS lesson_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    student_id INTEGER NOT NULL REFERENCES users(id),
    teacher_id INTEGER NOT NULL,
    lesson_json TEXT NOT NULL,
    topics_json TEXT,
    difficulty TEXT NOT NULL,
    prompt_version TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_artifacts_student ON lesson_artifacts(student_id, created_at);
CREATE INDEX IF NOT EXISTS idx_artifacts_session ON lesson_artifacts(session_id);

CREATE TABLE IF NOT EXISTS lesson_skill_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lesson_artifact_id INTEGER NOT NULL REFERENCES lesson_artifacts(id),
    tag_type TEXT NOT NULL,
    tag_value TEXT NOT NULL,
    cefr_level TEXT
);
CREATE INDEX IF NOT EXISTS idx_skill_tags_lesson ON lesson_skill_tags(lesson_artifact_id);

CREATE TABLE IF NOT EXISTS next_quizzes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    student_id INTEGER NOT NULL REFERENCES users(id),
    quiz_json TEXT NOT NULL,
    derived_from_lesson_artifact_id INTEGER NOT NULL REFERENCES lesson_artifacts(id),
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_quizzes_student ON next_quizzes(student_id, created_at);

CREATE TABLE IF NOT EXISTS quiz_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    quiz_id INTEGER NOT NULL REFERENCES next_quizzes(id),
    student_id INTEGER NOT NULL REFERENCES users(id),
    session_id INTEGER,
    score REAL,
    results_json TEXT,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    submitted_at TEXT,
    UNIQUE(quiz_id, student_id)
);
CREATE INDEX IF NOT EXISTS idx_attempts_student ON quiz_attempts(student_id, submitted_at);

CREATE TABLE IF NOT EXISTS quiz_attempt_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    attempt_id INTEGER NOT NULL REFERENCES quiz_attempts(id),
    question_id TEXT NOT NULL,
    is_correct INTEGER NOT NULL,
    student_answer TEXT,
    expected_answer TEXT,
    skill_tag TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempt_items_attempt ON quiz_attempt_items(attempt_id);
CREATE INDEX IF NOT EXISTS idx_attempt_items_skill ON quiz_attempt_items(skill_tag);

CREATE TABLE IF NOT EXISTS session_skill_observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    skill TEXT NOT NULL,
    score REAL NOT NULL,
    cefr_level TEXT,
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_observations_student ON session_skill_observations(student_id, created_at);

CREATE TABLE IF NOT EXISTS learning_dna (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    dna_json TEXT NOT NULL,
    version INTEGER NOT NULL,
    trigger_event TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_dna_student ON learning_dna(student_id, version);

CREATE TABLE IF NOT EXISTS l1_interference_tracking (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    pattern_category TEXT NOT NULL,
    pattern_detail TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'exhibited',
    occurrences INTEGER NOT NULL DEFAULT 1,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    overcome_at TEXT,
    UNIQUE(student_id, pattern_category, pattern_detail)
);

CREATE TABLE IF NOT EXISTS cefr_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    level TEXT NOT NULL,
    confidence REAL,
    source TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cefr_student ON cefr_history(student_id, recorded_at);

CREATE TABLE IF NOT EXISTS spaced_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES users(id),
    item_kind TEXT NOT NULL DEFAULT 'learning_point',
    point_type TEXT NOT NULL,
    content TEXT NOT NULL,
    polish_explanation TEXT,
    example_sentence TEXT,
    ease_factor REAL NOT NULL DEFAULT 2.5,
    interval_days REAL NOT NULL DEFAULT 1.0,
    repetitions INTEGER NOT NULL DEFAULT 0,
    times_reviewed INTEGER NOT NULL DEFAULT 0,
    last_recall_score REAL,
    next_review TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_spaced_student ON spaced_items(student_id, next_review);
"#;
