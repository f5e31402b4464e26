use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uphill_core::{DailySummary, FeedbackResult, ValidationError};
use uphill_storage::{RoutineStore, StorageError};

pub mod evaluator;
pub mod model;

use model::{ChatModel, ChatRequest, ModelError};

const FEEDBACK_TEMPERATURE: f32 = 0.7;
const FEEDBACK_MAX_TOKENS: u32 = 500;

const FEEDBACK_SYSTEM_PROMPT: &str = "You are a friendly, warm routine coach. \
    Always speak in a positive, encouraging tone. Respond with JSON only.";

const DEFAULT_SHORT: &str = "Good job today!";
const DEFAULT_FULL: &str = "You're keeping up with your routines. Keep going!";
const DEFAULT_RECOMMENDATIONS: [&str; 3] = ["Stretching", "Drink water", "Meditation"];

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    InvalidDate(ValidationError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Collects everything one user executed on one calendar date and rolls
/// it up. Read-only; the summary is recomputed on every call.
pub fn aggregate(
    store: &RoutineStore,
    owner_id: &str,
    date: &str,
) -> Result<DailySummary, AggregateError> {
    uphill_core::validate_date(date).map_err(AggregateError::InvalidDate)?;

    let mut executions = store.executions_for_date(owner_id, date)?;
    // Ascending start order is part of the contract; feedback wording
    // relies on it (`first routine of the day` and so on).
    executions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    let total_duration_seconds = executions
        .iter()
        .map(|execution| execution.duration_seconds)
        .sum();

    Ok(DailySummary {
        date: date.to_string(),
        total_routines: executions.len() as u64,
        total_duration_seconds,
        executions,
    })
}

#[derive(Debug, Error)]
enum GenerateError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model output was not a JSON object: {0}")]
    Parse(String),
}

/// Turns a daily summary into feedback. The model path is attempted
/// first; any failure lands on the deterministic fallback, so `generate`
/// itself never fails and callers never see a provider error.
pub struct FeedbackGenerator<M> {
    model: Option<M>,
}

impl<M: ChatModel> FeedbackGenerator<M> {
    pub fn new(model: Option<M>) -> Self {
        Self { model }
    }

    pub async fn generate(&self, summary: &DailySummary) -> FeedbackResult {
        match self.try_model(summary).await {
            Ok(feedback) => {
                info!(event = "feedback_generated", date = %summary.date, short = %feedback.short);
                feedback
            }
            Err(err) => {
                warn!(event = "feedback_fallback", date = %summary.date, error = %err);
                fallback_feedback(summary)
            }
        }
    }

    async fn try_model(&self, summary: &DailySummary) -> Result<FeedbackResult, GenerateError> {
        let model = self
            .model
            .as_ref()
            .ok_or(GenerateError::Model(ModelError::MissingCredential))?;

        let request = ChatRequest {
            system: FEEDBACK_SYSTEM_PROMPT.to_string(),
            user: feedback_prompt(summary),
            temperature: FEEDBACK_TEMPERATURE,
            max_tokens: FEEDBACK_MAX_TOKENS,
        };
        let raw = model.complete(&request).await?;
        let text = strip_code_fence(&raw);
        let value: Value = serde_json::from_str(text)
            .map_err(|err| GenerateError::Parse(err.to_string()))?;
        if !value.is_object() {
            return Err(GenerateError::Parse(format!("expected object, got {value}")));
        }

        Ok(normalize_feedback(&value))
    }
}

fn feedback_prompt(summary: &DailySummary) -> String {
    let total_mins = summary.total_duration_seconds / 60;
    let details: Vec<Value> = summary
        .executions
        .iter()
        .map(|execution| {
            serde_json::json!({
                "title": execution.routine_title,
                "started_at": execution.started_at,
                "ended_at": execution.ended_at,
                "duration_minutes": execution.duration_seconds / 60,
            })
        })
        .collect();
    let details = if details.is_empty() {
        "none".to_string()
    } else {
        serde_json::to_string_pretty(&details).unwrap_or_else(|_| "none".to_string())
    };

    format!(
        "You are an AI coach who reviews a user's daily routine execution and gives \
warm, encouraging feedback.\n\n\
Today's date: {date}\n\
Routines completed: {count}\n\
Total time spent: {total_mins} minutes\n\n\
Execution detail:\n{details}\n\n\
Based on the information above, write feedback in the following JSON format:\n\
{{\n\
    \"short\": \"one-line summary (at most 20 characters, the core message)\",\n\
    \"full\": \"detailed feedback (2-3 sentences, encouragement plus concrete advice)\",\n\
    \"recommendations\": [\"suggested routine 1\", \"suggested routine 2\", \"suggested routine 3\"]\n\
}}\n\n\
Rules:\n\
1. Make `short` emotional, brief and impactful.\n\
2. In `full`, mention the routines completed today and encourage specifically.\n\
3. Base `recommendations` on the categories and times of the completed routines.\n\
4. If no routines were completed, recommend simple routines that are easy to start.\n\
5. Output valid JSON only.",
        date = summary.date,
        count = summary.total_routines,
    )
}

/// Deterministic feedback derived from count/duration thresholds alone;
/// no I/O. Branch boundaries (0 / 1 / 2-3 / >=4) are contractual.
pub fn fallback_feedback(summary: &DailySummary) -> FeedbackResult {
    let total_mins = summary.total_duration_seconds / 60;
    let count = summary.total_routines;

    match count {
        0 => FeedbackResult {
            short: "No routines completed yet today".to_string(),
            full: "That's okay, start small. Even a 5-minute stretch or a glass of water \
                   counts!"
                .to_string(),
            recommendations: vec![
                "5-minute stretch".to_string(),
                "Drink a glass of water".to_string(),
                "Short walk".to_string(),
            ],
        },
        1 => {
            let routine_name = summary
                .executions
                .first()
                .map(|execution| execution.routine_title.as_str())
                .unwrap_or("your routine");
            FeedbackResult {
                short: format!("Great start! '{routine_name}' done"),
                full: format!(
                    "You completed '{routine_name}' today and put in {total_mins} minutes. \
                     How about adding one more tomorrow?"
                ),
                recommendations: vec![
                    "Read for 10 minutes".to_string(),
                    "Meditate for 5 minutes".to_string(),
                    "Write a journal entry".to_string(),
                ],
            }
        }
        2..=3 => FeedbackResult {
            short: format!("Nice work! {count} routines done"),
            full: format!(
                "You completed {count} routines today and invested {total_mins} minutes in \
                 total. Keep this pace and the change will add up!"
            ),
            recommendations: vec![
                "Try a new routine".to_string(),
                "Extend a routine by a few minutes".to_string(),
            ],
        },
        _ => FeedbackResult {
            short: format!("Amazing! {count} routines done!"),
            full: format!(
                "You completed {count} routines today for a total of {total_mins} minutes. \
                 That is truly impressive!"
            ),
            recommendations: vec![
                "Take a good rest".to_string(),
                "Keep it going tomorrow".to_string(),
            ],
        },
    }
}

/// Missing keys get fixed defaults; the generator never returns a
/// partially populated result.
fn normalize_feedback(value: &Value) -> FeedbackResult {
    let short = value
        .get("short")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SHORT)
        .to_string();
    let full = value
        .get("full")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_FULL)
        .to_string();
    let recommendations = value
        .get("recommendations")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|items| !items.is_empty())
        .unwrap_or_else(|| {
            DEFAULT_RECOMMENDATIONS
                .iter()
                .map(|item| item.to_string())
                .collect()
        });

    FeedbackResult {
        short,
        full,
        recommendations,
    }
}

/// Models occasionally wrap their JSON answer in a Markdown fence,
/// optionally tagged `json`; unwrap it before parsing.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.split("```").next().unwrap_or(rest).trim()
}
