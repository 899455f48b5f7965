//! Dispatcher: per-student ordering, bounded cross-student parallelism,
//! and pipeline deadlines.
//!
//! Every lifecycle event runs through `run`: it queues on the student's
//! guard (FIFO per student), takes a pool permit (global bound), and races
//! the pipeline against the deadline. A pipeline that outlives its
//! deadline is dropped; cancellation propagates through every suspension
//! point, so in-flight generator calls are abandoned and nothing past the
//! deadline is persisted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{instrument, warn};

use crate::config::Settings;
use crate::error::{EngineError, Result};

pub struct Dispatcher {
  guards: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
  pool: Arc<Semaphore>,
  deadline: Duration,
}

impl Dispatcher {
  pub fn new(settings: &Settings) -> Self {
    Self {
      guards: Mutex::new(HashMap::new()),
      pool: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
      deadline: Duration::from_secs(settings.pipeline_deadline_secs),
    }
  }

  async fn guard_for(&self, student_id: i64) -> Arc<Mutex<()>> {
    let mut guards = self.guards.lock().await;
    guards.entry(student_id).or_default().clone()
  }

  /// Run one pipeline for one student. Events for the same student execute
  /// in submission order; events for different students run concurrently
  /// up to the pool size.
  #[instrument(level = "debug", skip(self, pipeline))]
  pub async fn run<T, F>(&self, student_id: i64, label: &'static str, pipeline: F) -> Result<T>
  where
    F: Future<Output = Result<T>>,
  {
    let guard = self.guard_for(student_id).await;
    let _ordered = guard.lock().await;
    let _permit = self
      .pool
      .acquire()
      .await
      .map_err(|_| EngineError::Transient("worker pool closed".into()))?;

    match tokio::time::timeout(self.deadline, pipeline).await {
      Ok(result) => result,
      Err(_) => {
        warn!(target: "learning_loop", student_id, label, "pipeline deadline elapsed, work discarded");
        Err(EngineError::Timeout { secs: self.deadline.as_secs() })
      }
    }
  }
}

impl std::fmt::Debug for Dispatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dispatcher").finish_non_exhaustive()
  }
}
