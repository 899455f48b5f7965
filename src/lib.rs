//! Fluentloop · Adaptive learning loop for Polish-speaking English learners
//!
//! The engine drives a closed loop per student: intake assessment →
//! versioned learning plan → lesson artifact → derived quiz → scored
//! attempt → updated plan → next lesson. Each iteration folds in the last
//! quiz's per-skill outcomes, teacher observations, the learning DNA
//! profile, due spaced-repetition items, and Polish L1 interference
//! patterns.
//!
//! - Axum HTTP adapter over transport-agnostic engine operations
//! - SQLite store (sqlx), append-only plans/DNA/observations
//! - OpenAI-compatible structured generator behind a trait seam

pub mod config;
pub mod dispatch;
pub mod dna;
pub mod domain;
pub mod error;
pub mod generator;
pub mod intake;
pub mod interference;
pub mod lesson;
pub mod orchestrator;
pub mod planner;
pub mod protocol;
pub mod reassess;
pub mod routes;
pub mod scorer;
pub mod srs;
pub mod state;
pub mod store;
pub mod taxonomy;
pub mod telemetry;
pub mod util;
