//! Retrieval-augmented curriculum term plan generation.
//!
//! A [`PlanRequest`] is embedded, matched against a vector index of
//! curriculum standards, project templates and assessment criteria, packed
//! into a bounded context, and turned into a validated [`CurriculumPlan`]
//! by a multi-step language model agent. [`engine::PlanEngine`] drives the
//! whole pipeline; every backend sits behind a trait so it can be swapped
//! for a stub in tests.

pub mod agent;
pub mod catalog;
pub mod config;
pub mod context;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod lesson;
pub mod model;
pub mod retrieval;
pub mod retry;
pub mod text;
pub mod validate;

pub use config::EngineConfig;
pub use engine::PlanEngine;
pub use error::{BackendError, EngineError, ErrorKind, Stage};
pub use model::{CurriculumPlan, PlanRequest};
