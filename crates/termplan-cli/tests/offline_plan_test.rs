//! The default offline setup of the `termplan` binary: the built-in catalog
//! indexed in memory with the hashing embedder, driving the full engine.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use termplan_core::PlanEngine;
use termplan_core::catalog::Catalog;
use termplan_core::embedding::HashingEmbedder;
use termplan_core::model::{CurriculumPlan, SourceType};
use termplan_core::retrieval::memory::parse_corpus;
use termplan_core::retrieval::{MemoryIndex, VectorIndex};
use termplan_test_utils::{StubModel, math_request, test_config};

fn offline_engine(index: MemoryIndex, model: Arc<StubModel>) -> PlanEngine {
    let mut config = test_config();
    // Signed hashing can score unrelated text below zero; keep every hit.
    config.similarity_threshold = -1.0;
    PlanEngine::new(
        config,
        Arc::new(HashingEmbedder::default()),
        Arc::new(index),
        model,
    )
}

fn catalog_index() -> MemoryIndex {
    let corpus = Catalog::builtin().unwrap().corpus();
    MemoryIndex::hashed(corpus, &HashingEmbedder::default())
}

#[tokio::test]
async fn plan_survives_toml_output() {
    let engine = offline_engine(catalog_index(), Arc::new(StubModel::new()));
    let plan = engine
        .generate_plan(math_request(), &CancellationToken::new())
        .await
        .unwrap();

    let rendered = toml::to_string_pretty(&plan).unwrap();
    let parsed: CurriculumPlan = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed.request_id, plan.request_id);
    assert_eq!(parsed.terms, plan.terms);
}

#[tokio::test]
async fn custom_corpus_replaces_the_catalog() {
    let corpus = parse_corpus(
        r#"
[[fragments]]
id = "std-sci-7-1"
source_type = "curriculum_standard"
text = "Students investigate how energy flows through ecosystems."
subject = "Science"
grade = "7"

[[fragments]]
id = "proj-sci-7-food-web"
source_type = "project_template"
text = "Food web mapping: model a local ecosystem and trace energy transfer."
subject = "Science"
"#,
    )
    .unwrap();
    let index = MemoryIndex::hashed(corpus, &HashingEmbedder::default());
    assert_eq!(index.list_collections().await.unwrap(), vec!["memory".to_string()]);

    let engine = offline_engine(index, Arc::new(StubModel::new()));
    let request = termplan_core::PlanRequest::new("National", "Science", "7", 2);
    let plan = engine.generate_plan(request, &CancellationToken::new()).await.unwrap();

    assert!(plan.grounded);
    let ids: Vec<&str> = plan.sources.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&"std-sci-7-1"), "{ids:?}");
    assert!(
        plan.sources
            .iter()
            .any(|s| s.source_type == SourceType::ProjectTemplate)
    );
}

#[tokio::test]
async fn other_subjects_are_filtered_out() {
    let engine = offline_engine(catalog_index(), Arc::new(StubModel::new()));
    let request = termplan_core::PlanRequest::new("National", "Science", "5", 2);
    let plan = engine.generate_plan(request, &CancellationToken::new()).await.unwrap();

    let catalog = Catalog::builtin().unwrap();
    for source in &plan.sources {
        let math_only = catalog
            .projects
            .iter()
            .any(|p| p.id == source.id && p.subject.as_deref() == Some("Math"));
        assert!(!math_only, "math template {} grounded a science plan", source.id);
    }
}
