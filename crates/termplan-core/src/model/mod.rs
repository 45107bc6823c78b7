//! Data model shared by every stage of the plan generation pipeline.
//!
//! Requests come in, fragments are retrieved, and a [`CurriculumPlan`]
//! goes out. Everything here is plain data; behaviour lives in the stage
//! modules.

pub mod fragment;
pub mod plan;
pub mod request;

pub use fragment::{FragmentMetadata, RetrievedFragment, SourceType};
pub use plan::{
    AssessmentCriterion, AttemptOutcome, CurriculumPlan, GenerationAttempt, GenerationStep,
    ProjectAssignment, RepairNote, SourceSummary, TermPlan,
};
pub use request::{PlanRequest, RequestError, TermRange};
