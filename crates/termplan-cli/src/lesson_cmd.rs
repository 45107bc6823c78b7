use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tokio_util::sync::CancellationToken;

use termplan_core::agent::{GenerationGate, ModelCaller};
use termplan_core::lesson::{HomeworkPreference, LessonPlanRequest, LessonPlanner, TeachingStyle};

use crate::backends;
use crate::config::TermplanConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StyleArg {
    Lecture,
    Interactive,
    FlippedClassroom,
    ProjectBased,
    Blended,
}

impl From<StyleArg> for TeachingStyle {
    fn from(arg: StyleArg) -> Self {
        match arg {
            StyleArg::Lecture => TeachingStyle::Lecture,
            StyleArg::Interactive => TeachingStyle::Interactive,
            StyleArg::FlippedClassroom => TeachingStyle::FlippedClassroom,
            StyleArg::ProjectBased => TeachingStyle::ProjectBased,
            StyleArg::Blended => TeachingStyle::Blended,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HomeworkArg {
    None,
    Minimal,
    Moderate,
    Extensive,
}

impl From<HomeworkArg> for HomeworkPreference {
    fn from(arg: HomeworkArg) -> Self {
        match arg {
            HomeworkArg::None => HomeworkPreference::None,
            HomeworkArg::Minimal => HomeworkPreference::Minimal,
            HomeworkArg::Moderate => HomeworkPreference::Moderate,
            HomeworkArg::Extensive => HomeworkPreference::Extensive,
        }
    }
}

/// Syllabus text from the flag, or from a file.
pub fn read_syllabus(inline: Option<String>, file: Option<&Path>) -> Result<String> {
    match (inline, file) {
        (Some(text), _) => Ok(text),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read syllabus from {}", path.display())),
        (None, None) => anyhow::bail!("either --syllabus or --syllabus-file is required"),
    }
}

pub async fn run_lesson(
    config: &TermplanConfig,
    request: &LessonPlanRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    // Lessons need only the model; the index is not touched.
    let gate = GenerationGate::new(
        config.engine.max_concurrent_generations,
        config.engine.backpressure_wait(),
    );
    let caller = ModelCaller::new(
        backends::build_model(config)?,
        gate,
        config.engine.retry,
        config.engine.step_timeout(),
    );
    let planner = LessonPlanner::new(caller);
    let response = planner
        .generate(request, cancel)
        .await
        .map_err(|e| anyhow::anyhow!(e.summary()))?;

    let rendered = serde_json::to_string_pretty(&response).context("failed to serialize lesson plans")?;
    println!("{rendered}");
    Ok(())
}
