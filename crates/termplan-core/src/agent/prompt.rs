//! Prompt construction for the three generation steps.
//!
//! Every user prompt starts with a short block of `Key: value` lines
//! (`Task`, `Curriculum`, `Subject`, `Grade`, `Terms`, and for elaboration
//! `Term` and `Theme`) so that the step and its parameters can be read back
//! from the prompt alone. Pure logic, no I/O.

use crate::context::{GenerationContext, render_blocks};
use crate::model::{GenerationStep, RetrievedFragment};

use super::model::CompletionRequest;
use super::parse::{Outline, OutlineTerm};

// ---------------------------------------------------------------------------
// Fixed prompt text
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You are an experienced curriculum designer. You plan school terms \
around hands-on projects and clear assessment criteria, grounded in the reference material you \
are given. You always answer with a single JSON object and nothing else.";

/// Outline JSON schema included in the outline prompt.
const OUTLINE_SCHEMA: &str = r#"## Output schema

```json
{
  "terms": [
    { "term": 1, "theme": "string" }
  ]
}
```

- Exactly one entry per term, numbered from 1 without gaps.
- Themes build on each other and cover the subject's standards for the grade.
"#;

/// Per-term JSON schema included in elaboration and consistency prompts.
const TERM_SCHEMA: &str = r#"## Term schema

```json
{
  "term_number": 1,
  "theme": "string",
  "projects": [
    {
      "id": "t1-p1",
      "name": "string",
      "description": "string",
      "objectives": ["string"],
      "criteria": ["t1-c1"]
    }
  ],
  "assessment_criteria": [
    {
      "id": "t1-c1",
      "description": "string",
      "rubric_levels": ["Beginning", "Developing", "Proficient", "Extending"]
    }
  ]
}
```

- Project ids are `t{term}-p{n}`; criterion ids are `t{term}-c{n}`.
- Every id in a project's `criteria` must be defined in the same term's
  `assessment_criteria`.
- Every project has at least one objective.
"#;

const CONSISTENCY_RULES: &str = r#"## Consistency rules

1. Keep the number of terms, the term numbers and the themes.
2. No two projects in the plan share a name; rename or replace repeats.
3. Do not repeat the same objective in different terms unless it is
   deliberately revisited at a deeper level.
4. Reuse criterion wording across terms when the same skill is assessed.
5. Keep every project's `criteria` resolvable within its own term.
"#;

fn header(task: &str, ctx: &GenerationContext) -> String {
    let request = ctx.request();
    format!(
        "Task: {task}\nCurriculum: {}\nSubject: {}\nGrade: {}\nTerms: {}\n",
        request.curriculum.trim(),
        request.subject.trim(),
        request.grade.trim(),
        request.term_count
    )
}

fn grounding_note(grounded: bool) -> &'static str {
    if grounded {
        "Base the plan on the reference material below. Prefer its project templates and \
         assessment criteria where they fit.\n\n"
    } else {
        "No reference material matched this request. Plan from general knowledge of the \
         curriculum and keep projects conventional.\n\n"
    }
}

// ---------------------------------------------------------------------------
// Step prompts
// ---------------------------------------------------------------------------

/// Outline step: one theme per term.
pub fn outline_request(ctx: &GenerationContext) -> CompletionRequest {
    let request = ctx.request();
    let mut prompt = header("outline", ctx);
    prompt.push('\n');
    prompt.push_str(&format!(
        "Outline a {}-term {} plan for grade {} following the {} curriculum. \
         Give each term a theme.\n\n",
        request.term_count,
        request.subject.trim(),
        request.grade.trim(),
        request.curriculum.trim()
    ));
    prompt.push_str(grounding_note(ctx.grounded()));
    prompt.push_str(OUTLINE_SCHEMA);
    prompt.push_str("\n## Reference material\n\n");
    prompt.push_str(&ctx.render());
    CompletionRequest::new(GenerationStep::Outline, SYSTEM_PROMPT, prompt)
}

/// Elaboration step for one term.
pub fn elaborate_request(
    ctx: &GenerationContext,
    outline: &Outline,
    term: &OutlineTerm,
    fragments: &[&RetrievedFragment],
) -> CompletionRequest {
    let mut prompt = header("elaborate", ctx);
    prompt.push_str(&format!("Term: {}\nTheme: {}\n\n", term.term, term.theme));
    prompt.push_str(&format!(
        "Write term {} of the plan in detail: two or three projects that fit the theme \
         \"{}\", and the assessment criteria used to grade them.\n\n",
        term.term, term.theme
    ));
    prompt.push_str("## Plan outline\n\n");
    for t in &outline.terms {
        prompt.push_str(&format!("- Term {}: {}\n", t.term, t.theme));
    }
    prompt.push('\n');
    prompt.push_str(grounding_note(!fragments.is_empty()));
    prompt.push_str(TERM_SCHEMA);
    prompt.push_str("\n## Reference material\n\n");
    prompt.push_str(&render_blocks(fragments.iter().copied()));
    CompletionRequest::new(GenerationStep::Elaborate(term.term), SYSTEM_PROMPT, prompt)
}

/// Consistency step over the whole draft.
pub fn consistency_request(ctx: &GenerationContext, draft_json: &str) -> CompletionRequest {
    let mut prompt = header("consistency", ctx);
    prompt.push('\n');
    prompt.push_str(
        "Review the draft plan below for consistency across terms and return the corrected \
         plan as `{\"terms\": [...]}` using the term schema.\n\n",
    );
    prompt.push_str(CONSISTENCY_RULES);
    prompt.push('\n');
    prompt.push_str(TERM_SCHEMA);
    prompt.push_str("\nDraft plan JSON:\n");
    prompt.push_str(draft_json);
    prompt.push('\n');
    CompletionRequest::new(GenerationStep::Consistency, SYSTEM_PROMPT, prompt).with_temperature(0.2)
}

/// Read a `Key: value` header line back from a prompt.
pub fn header_value<'a>(prompt: &'a str, key: &str) -> Option<&'a str> {
    prompt.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
    })
}

/// The draft JSON embedded in a consistency prompt.
pub fn draft_json(prompt: &str) -> Option<&str> {
    prompt
        .split_once("Draft plan JSON:\n")
        .map(|(_, rest)| rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextAssembler;
    use crate::model::{FragmentMetadata, PlanRequest, SourceType};

    fn ctx(fragments: Vec<RetrievedFragment>) -> GenerationContext {
        ContextAssembler::new(4000).assemble(&PlanRequest::new("National", "Math", "5", 3), fragments)
    }

    #[test]
    fn outline_prompt_carries_header_and_grounding() {
        let f = RetrievedFragment::new(
            "std-1",
            SourceType::CurriculumStandard,
            "Add fractions",
            0.9,
            FragmentMetadata::default(),
        );
        let req = outline_request(&ctx(vec![f]));
        let prompt = req.user_prompt();
        assert_eq!(header_value(prompt, "Task"), Some("outline"));
        assert_eq!(header_value(prompt, "Terms"), Some("3"));
        assert!(prompt.contains("[std-1]"));
        assert!(req.json);
    }

    #[test]
    fn ungrounded_prompt_says_so() {
        let req = outline_request(&ctx(vec![]));
        assert!(req.user_prompt().contains("No reference material matched"));
    }

    #[test]
    fn elaborate_prompt_names_term_and_theme() {
        let outline = Outline {
            terms: vec![
                OutlineTerm {
                    term: 1,
                    theme: "Fractions".into(),
                },
                OutlineTerm {
                    term: 2,
                    theme: "Decimals".into(),
                },
            ],
        };
        let req = elaborate_request(&ctx(vec![]), &outline, &outline.terms[1], &[]);
        let prompt = req.user_prompt();
        assert_eq!(header_value(prompt, "Term"), Some("2"));
        assert_eq!(header_value(prompt, "Theme"), Some("Decimals"));
        assert!(prompt.contains("- Term 1: Fractions"));
        assert_eq!(req.step, GenerationStep::Elaborate(2));
    }

    #[test]
    fn consistency_prompt_embeds_draft() {
        let req = consistency_request(&ctx(vec![]), r#"{"terms":[]}"#);
        assert_eq!(draft_json(req.user_prompt()), Some(r#"{"terms":[]}"#));
    }
}
