use anyhow::{Context, Result};

use termplan_core::catalog::{Catalog, CriterionTemplate, ProjectTemplate};

use crate::backends;
use crate::config::TermplanConfig;

fn builtin() -> Result<Catalog> {
    Catalog::builtin().context("built-in catalog is invalid")
}

fn subject_label(subject: Option<&str>) -> &str {
    subject.unwrap_or("(any)")
}

fn project_rows(projects: &[&ProjectTemplate]) -> Vec<String> {
    let width = projects.iter().map(|p| p.id.len()).max().unwrap_or(0);
    projects
        .iter()
        .map(|p| {
            format!(
                "{:<width$}  {:<15}  {}",
                p.id,
                subject_label(p.subject.as_deref()),
                p.name
            )
        })
        .collect()
}

fn criterion_rows(criteria: &[&CriterionTemplate]) -> Vec<String> {
    let width = criteria.iter().map(|c| c.id.len()).max().unwrap_or(0);
    criteria
        .iter()
        .map(|c| {
            format!(
                "{:<width$}  {:<15}  {} ({} levels)",
                c.id,
                subject_label(c.subject.as_deref()),
                c.name,
                c.rubric_levels.len()
            )
        })
        .collect()
}

pub fn run_projects(subject: Option<&str>, json: bool) -> Result<()> {
    let catalog = builtin()?;
    let projects = catalog.projects(subject);
    if json {
        println!("{}", serde_json::to_string_pretty(&projects)?);
        return Ok(());
    }
    if projects.is_empty() {
        println!("No project templates found.");
    }
    for row in project_rows(&projects) {
        println!("{row}");
    }
    Ok(())
}

pub fn run_criteria(subject: Option<&str>, json: bool) -> Result<()> {
    let catalog = builtin()?;
    let criteria = catalog.criteria(subject);
    if json {
        println!("{}", serde_json::to_string_pretty(&criteria)?);
        return Ok(());
    }
    if criteria.is_empty() {
        println!("No assessment criteria found.");
    }
    for row in criterion_rows(&criteria) {
        println!("{row}");
    }
    Ok(())
}

pub async fn run_collections(config: &TermplanConfig) -> Result<()> {
    let (_embedder, index) = backends::build_index(config)?;
    let collections = index
        .list_collections()
        .await
        .with_context(|| format!("failed to list collections from {}", index.name()))?;
    if collections.is_empty() {
        println!("No collections found.");
    }
    for name in &collections {
        println!("{name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_rows_are_aligned() {
        let catalog = builtin().unwrap();
        let projects = catalog.projects(Some("Science"));
        let rows = project_rows(&projects);
        assert_eq!(rows.len(), projects.len());
        let widths: Vec<usize> = rows
            .iter()
            .map(|r| r.find("  ").unwrap_or(0))
            .collect();
        let longest = projects.iter().map(|p| p.id.len()).max().unwrap();
        assert!(widths.iter().all(|w| *w <= longest));
        assert!(rows.iter().any(|r| r.contains("(any)")), "cross-curricular templates are listed");
    }

    #[test]
    fn criterion_rows_show_level_counts() {
        let catalog = builtin().unwrap();
        let criteria = catalog.criteria(Some("Math"));
        let rows = criterion_rows(&criteria);
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r.ends_with("levels)")));
    }
}
