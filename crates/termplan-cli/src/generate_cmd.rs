use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tokio_util::sync::CancellationToken;

use termplan_core::{CurriculumPlan, EngineError, PlanRequest};

use crate::backends;
use crate::config::TermplanConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Toml,
}

pub fn render(plan: &CurriculumPlan, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(plan).context("failed to serialize plan as JSON"),
        OutputFormat::Toml => toml::to_string_pretty(plan).context("failed to serialize plan as TOML"),
    }
}

/// Turn an engine failure into a CLI error: the user-facing summary, the
/// stable code, and the last model attempt when there was one.
fn describe(err: &EngineError) -> anyhow::Error {
    let mut message = format!("{} [{}]", err.summary(), err.kind().code());
    if let Some(attempt) = err.last_attempt() {
        message.push_str(&format!(
            "\n  last attempt: {} #{} ({:?})",
            attempt.step, attempt.attempt, attempt.outcome
        ));
        if let Some(detail) = &attempt.detail {
            message.push_str(&format!(": {detail}"));
        }
    }
    anyhow::anyhow!(message)
}

pub async fn run_generate(
    config: &TermplanConfig,
    request: PlanRequest,
    format: OutputFormat,
    output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (engine, _index) = backends::build_engine(config)?;
    let plan = engine.generate_plan(request, cancel).await.map_err(|e| {
        tracing::debug!(error = ?e, "plan generation failed");
        describe(&e)
    })?;

    if !plan.grounded {
        eprintln!("warning: no reference material matched; the plan is not grounded");
    }
    for note in &plan.repair_notes {
        match note.term {
            Some(term) => eprintln!("repaired (term {term}): {}", note.message),
            None => eprintln!("repaired: {}", note.message),
        }
    }

    let rendered = render(&plan, format)?;
    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("failed to write plan to {}", path.display()))?;
            println!("Plan {} written to {}", plan.request_id, path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use termplan_core::model::{AttemptOutcome, GenerationAttempt, GenerationStep};
    use termplan_test_utils::{StaticIndex, StubModel, engine_with, fixture_fragments, math_request};

    use super::*;

    async fn sample_plan() -> CurriculumPlan {
        let engine = engine_with(
            Arc::new(StubModel::new()),
            Arc::new(StaticIndex::new(fixture_fragments())),
        );
        engine
            .generate_plan(math_request(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn json_output_is_the_plan() {
        let plan = sample_plan().await;
        let rendered = render(&plan, OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["terms"].as_array().unwrap().len(), 3);
        assert_eq!(value["request_id"], serde_json::json!(plan.request_id.to_string()));
    }

    #[tokio::test]
    async fn toml_output_has_one_table_per_term() {
        let plan = sample_plan().await;
        let rendered = render(&plan, OutputFormat::Toml).unwrap();
        assert_eq!(rendered.matches("[[terms]]").count(), 3);
        assert!(rendered.contains("subject = \"Math\""));
    }

    #[test]
    fn failure_description_includes_code_and_attempt() {
        let attempt = GenerationAttempt::new(GenerationStep::Outline, 2, "prompt")
            .with_output("Sure! here is", AttemptOutcome::Rejected);
        let err = EngineError::GenerationFailed {
            step: GenerationStep::Outline,
            attempts: 2,
            reason: "no JSON object".to_string(),
            last_attempt: Some(Box::new(attempt)),
        };
        let text = describe(&err).to_string();
        assert!(text.contains("[generation_failed]"), "{text}");
        assert!(text.contains("#2"), "{text}");
        assert!(!text.contains("Sure!"), "{text}");
    }
}
