//! Lesson plan generation from a free-text syllabus.
//!
//! A single JSON-mode model call through the same [`ModelCaller`] as term
//! planning, so it shares the generation gate, deadline and retries.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::{CompletionRequest, ModelCaller};
use crate::error::EngineError;
use crate::model::GenerationStep;
use crate::validate::json::extract_object;

const SYSTEM_PROMPT: &str =
    "You are a helpful teaching assistant that creates detailed, engaging lesson plans.";

/// Allowed `num_classes` values.
pub const MAX_CLASSES: u32 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeachingStyle {
    Lecture,
    #[default]
    Interactive,
    FlippedClassroom,
    ProjectBased,
    Blended,
}

impl TeachingStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lecture => "lecture",
            Self::Interactive => "interactive",
            Self::FlippedClassroom => "flipped_classroom",
            Self::ProjectBased => "project_based",
            Self::Blended => "blended",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Lecture => "Lecture",
            Self::Interactive => "Interactive",
            Self::FlippedClassroom => "Flipped classroom",
            Self::ProjectBased => "Project based",
            Self::Blended => "Blended",
        }
    }
}

impl fmt::Display for TeachingStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomeworkPreference {
    None,
    Minimal,
    #[default]
    Moderate,
    Extensive,
}

impl HomeworkPreference {
    fn label(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Minimal => "Minimal",
            Self::Moderate => "Moderate",
            Self::Extensive => "Extensive",
        }
    }
}

/// Request for a series of lesson plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonPlanRequest {
    /// Syllabus content the lessons are based on.
    #[serde(alias = "syllabus_data")]
    pub syllabus: String,
    pub num_classes: u32,
    /// Length of each class, e.g. "45 minutes" or "1 hour".
    pub class_duration: String,
    #[serde(default)]
    pub teaching_style: TeachingStyle,
    #[serde(default)]
    pub homework_preference: HomeworkPreference,
}

/// One lesson of the generated series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlanUnit {
    pub title: String,
    pub objectives: Vec<String>,
    pub activities: Vec<String>,
    pub resources: Vec<String>,
    pub homework: Option<String>,
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlanResponse {
    pub success: bool,
    pub lesson_plans: Vec<LessonPlanUnit>,
    pub total_duration: String,
    pub teaching_style: TeachingStyle,
}

#[derive(Debug, Clone, Error)]
pub enum LessonError {
    #[error("invalid lesson plan request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Generation(#[from] EngineError),
}

impl LessonError {
    /// Human-readable summary safe to return to an end user.
    pub fn summary(&self) -> String {
        match self {
            Self::InvalidRequest(reason) => format!("The lesson plan request is invalid: {reason}."),
            Self::Generation(e) => e.summary(),
        }
    }
}

impl LessonPlanRequest {
    /// Check the request and return the class length in minutes.
    pub fn validate(&self) -> Result<u32, LessonError> {
        if self.syllabus.trim().is_empty() {
            return Err(LessonError::InvalidRequest("syllabus must not be empty".to_string()));
        }
        if !(1..=MAX_CLASSES).contains(&self.num_classes) {
            return Err(LessonError::InvalidRequest(format!(
                "num_classes {} is outside 1..={MAX_CLASSES}",
                self.num_classes
            )));
        }
        duration_minutes(&self.class_duration).ok_or_else(|| {
            LessonError::InvalidRequest(format!(
                "class_duration {:?} does not start with a number of minutes or hours",
                self.class_duration
            ))
        })
    }

    fn prompt(&self) -> String {
        format!(
            "Create a detailed lesson plan based on the following requirements.\n\n\
             SYLLABUS CONTENT:\n{syllabus}\n\n\
             Create {n} lesson plans. Each lesson should be {duration} long.\n\n\
             TEACHING STYLE: {style}\n\
             HOMEWORK PREFERENCE: {homework}\n\n\
             For each lesson plan, include:\n\
             1. A clear title\n\
             2. 3-5 learning objectives\n\
             3. 3-5 engaging activities that match the teaching style\n\
             4. Required resources/materials\n\
             5. Homework assignment (if applicable)\n\n\
             Answer with a JSON object of this shape:\n\
             {{\"lesson_plans\": [{{\"title\": \"...\", \"objectives\": [\"...\"], \
             \"activities\": [\"...\"], \"resources\": [\"...\"], \"homework\": \"...\"}}]}}\n",
            syllabus = self.syllabus.trim(),
            n = self.num_classes,
            duration = self.class_duration.trim(),
            style = self.teaching_style.label(),
            homework = self.homework_preference.label(),
        )
    }
}

/// Minutes in a duration such as "45 minutes", "1 hour" or "1.5 hours".
/// Only the leading number and the first letter of the unit are read.
pub fn duration_minutes(duration: &str) -> Option<u32> {
    let trimmed = duration.trim();
    let end = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let value: f64 = trimmed[..end].parse().ok()?;
    let unit = trimmed[end..].trim_start().to_ascii_lowercase();
    let minutes = if unit.starts_with('h') { value * 60.0 } else { value };
    let minutes = minutes.round();
    (minutes >= 1.0 && minutes <= f64::from(u32::MAX)).then_some(minutes as u32)
}

/// "H hours M minutes", or "M minutes" under an hour.
pub fn format_total(minutes: u32) -> String {
    let (hours, rest) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{hours} hours {rest} minutes")
    } else {
        format!("{rest} minutes")
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Parse the model's `{"lesson_plans": [...]}` answer.
pub fn parse_lessons(text: &str, duration: &str) -> Result<Vec<LessonPlanUnit>, String> {
    let root = extract_object(text)?;
    let items = root
        .get("lesson_plans")
        .and_then(Value::as_array)
        .ok_or("answer has no \"lesson_plans\" array")?;
    if items.is_empty() {
        return Err("answer lists no lessons".to_string());
    }
    let units = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let obj = item.as_object()?;
            let title = obj
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map_or_else(|| format!("Lesson {}", i + 1), str::to_string);
            let homework = obj
                .get("homework")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some(LessonPlanUnit {
                title,
                objectives: string_list(obj.get("objectives")),
                activities: string_list(obj.get("activities")),
                resources: string_list(obj.get("resources")),
                homework,
                duration: duration.trim().to_string(),
            })
        })
        .collect::<Vec<_>>();
    if units.is_empty() {
        return Err("no lesson entry is an object".to_string());
    }
    Ok(units)
}

/// Generates lesson plan series.
#[derive(Debug, Clone)]
pub struct LessonPlanner {
    caller: ModelCaller,
}

impl LessonPlanner {
    pub fn new(caller: ModelCaller) -> Self {
        Self { caller }
    }

    pub async fn generate(
        &self,
        request: &LessonPlanRequest,
        cancel: &CancellationToken,
    ) -> Result<LessonPlanResponse, LessonError> {
        let minutes = request.validate()?;
        let completion = CompletionRequest::new(GenerationStep::Lesson, SYSTEM_PROMPT, request.prompt())
            .with_temperature(0.7);
        let (lesson_plans, _) = self
            .caller
            .run_step(&completion, cancel, |text| parse_lessons(text, &request.class_duration))
            .await?;
        let total = minutes.saturating_mul(lesson_plans.len() as u32);
        tracing::info!(
            lessons = lesson_plans.len(),
            requested = request.num_classes,
            total_minutes = total,
            "lesson plans generated"
        );
        Ok(LessonPlanResponse {
            success: true,
            lesson_plans,
            total_duration: format_total(total),
            teaching_style: request.teaching_style,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LessonPlanRequest {
        LessonPlanRequest {
            syllabus: "Variables, loops and functions".to_string(),
            num_classes: 2,
            class_duration: "45 minutes".to_string(),
            teaching_style: TeachingStyle::default(),
            homework_preference: HomeworkPreference::default(),
        }
    }

    #[test]
    fn durations_in_minutes_and_hours() {
        assert_eq!(duration_minutes("45 minutes"), Some(45));
        assert_eq!(duration_minutes("1 hour"), Some(60));
        assert_eq!(duration_minutes("1.5 hours"), Some(90));
        assert_eq!(duration_minutes("90min"), Some(90));
        assert_eq!(duration_minutes("an hour"), None);
        assert_eq!(duration_minutes("0 minutes"), None);
    }

    #[test]
    fn totals_are_formatted() {
        assert_eq!(format_total(90), "1 hours 30 minutes");
        assert_eq!(format_total(120), "2 hours 0 minutes");
        assert_eq!(format_total(45), "45 minutes");
    }

    #[test]
    fn request_bounds_are_checked() {
        assert_eq!(request().validate().unwrap(), 45);
        let too_many = LessonPlanRequest {
            num_classes: 51,
            ..request()
        };
        assert!(matches!(too_many.validate(), Err(LessonError::InvalidRequest(_))));
        let blank = LessonPlanRequest {
            syllabus: "  ".to_string(),
            ..request()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn request_accepts_legacy_field_and_defaults() {
        let r: LessonPlanRequest = serde_json::from_str(
            r#"{"syllabus_data": "Fractions", "num_classes": 3, "class_duration": "1 hour"}"#,
        )
        .unwrap();
        assert_eq!(r.syllabus, "Fractions");
        assert_eq!(r.teaching_style, TeachingStyle::Interactive);
        assert_eq!(r.homework_preference, HomeworkPreference::Moderate);
    }

    #[test]
    fn lessons_parse_with_defaults() {
        let text = "```json\n{\"lesson_plans\": [{\"objectives\": [\"Read\"], \"homework\": \"\"}, \
                    {\"title\": \"Loops\", \"activities\": \"Pair coding\"}]}\n```";
        let units = parse_lessons(text, "45 minutes").unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].title, "Lesson 1");
        assert_eq!(units[0].homework, None);
        assert_eq!(units[1].activities, vec!["Pair coding".to_string()]);
        assert_eq!(units[1].duration, "45 minutes");
    }

    #[test]
    fn empty_lesson_list_is_unusable() {
        assert!(parse_lessons(r#"{"lesson_plans": []}"#, "45 minutes").is_err());
        assert!(parse_lessons(r#"{"plans": []}"#, "45 minutes").is_err());
    }

    #[test]
    fn prompt_names_style_and_homework() {
        let prompt = LessonPlanRequest {
            teaching_style: TeachingStyle::FlippedClassroom,
            homework_preference: HomeworkPreference::None,
            ..request()
        }
        .prompt();
        assert!(prompt.contains("TEACHING STYLE: Flipped classroom"));
        assert!(prompt.contains("HOMEWORK PREFERENCE: None"));
        assert!(prompt.contains("Create 2 lesson plans"));
    }
}
