use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use uphill_core::{new_id, EvaluationRequest, RoutineEvaluation};

use crate::model::{ChatModel, ChatRequest, ModelError};
use crate::strip_code_fence;

const EVALUATION_TEMPERATURE: f32 = 0.7;
const EVALUATION_MAX_TOKENS: u32 = 400;

const EVALUATION_SYSTEM_PROMPT: &str =
    "You are an expert in routines and time management. Respond with JSON only.";

const DEFAULT_SCORE: i64 = 3;
const PARSE_FAILURE_RISK: &str =
    "The model response could not be interpreted, so default values were used.";
const PARSE_FAILURE_TIP: &str = "Review the pacing and intensity of the routine.";
const UNAVAILABLE_SUMMARY: &str = "No evaluation available; the model could not be reached.";

/// Scores a proposed routine through the external model. Model failures
/// of any kind degrade to a defaulted record; the score is clamped to
/// [1, 5] on every path, including the happy one.
pub struct RoutineEvaluator<M> {
    model: Option<M>,
}

impl<M: ChatModel> RoutineEvaluator<M> {
    pub fn new(model: Option<M>) -> Self {
        Self { model }
    }

    pub async fn evaluate(&self, request: &EvaluationRequest) -> RoutineEvaluation {
        let raw = match &self.model {
            Some(model) => {
                let chat = ChatRequest {
                    system: EVALUATION_SYSTEM_PROMPT.to_string(),
                    user: evaluation_prompt(&request.name, &request.goal, &request.steps),
                    temperature: EVALUATION_TEMPERATURE,
                    max_tokens: EVALUATION_MAX_TOKENS,
                };
                match model.complete(&chat).await {
                    Ok(text) => Some(text),
                    Err(err) => {
                        warn!(event = "evaluation_model_error", error = %err);
                        None
                    }
                }
            }
            None => {
                warn!(
                    event = "evaluation_model_error",
                    error = %ModelError::MissingCredential
                );
                None
            }
        };

        let (score_value, summary, risk, tip) = match &raw {
            Some(text) => match serde_json::from_str::<Value>(strip_code_fence(text)) {
                Ok(value) if value.is_object() => (
                    value.get("score").cloned(),
                    field_or(&value, "summary", "No summary provided."),
                    field_or(&value, "risk", "No risks noted."),
                    field_or(&value, "tip", "No tip provided."),
                ),
                _ => (
                    None,
                    text.clone(),
                    PARSE_FAILURE_RISK.to_string(),
                    PARSE_FAILURE_TIP.to_string(),
                ),
            },
            None => (
                None,
                UNAVAILABLE_SUMMARY.to_string(),
                PARSE_FAILURE_RISK.to_string(),
                PARSE_FAILURE_TIP.to_string(),
            ),
        };

        RoutineEvaluation {
            id: new_id(),
            name: request.name.clone(),
            goal: request.goal.clone(),
            steps: request.steps.clone(),
            score: coerce_score(score_value.as_ref()).clamp(1, 5),
            summary,
            risk,
            tip,
            raw_feedback: raw.unwrap_or_default(),
            created_at: Utc::now(),
        }
    }
}

fn field_or(value: &Value, key: &str, default: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

/// Best-effort integer coercion: numbers truncate, strings parse,
/// anything else becomes the default score.
fn coerce_score(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))
            .unwrap_or(DEFAULT_SCORE),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(DEFAULT_SCORE),
        _ => DEFAULT_SCORE,
    }
}

fn evaluation_prompt(name: &str, goal: &str, steps: &[String]) -> String {
    let steps = if steps.is_empty() {
        "  (no steps provided)".to_string()
    } else {
        steps
            .iter()
            .map(|step| format!("  - {step}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "Rate the daily routine below with an integer score from 1 to 5 and answer \
in JSON only.\n\
JSON format:\n\
{{\n\
  \"score\": integer between 1 and 5,\n\
  \"summary\": \"one paragraph on strengths and fit for the goal\",\n\
  \"risk\": \"one sentence on what to watch out for\",\n\
  \"tip\": \"one sentence of improvement advice\"\n\
}}\n\n\
Routine:\n\
- name: {name}\n\
- goal: {goal}\n\
- steps:\n{steps}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticModel(String);

    impl ChatModel for StaticModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, ModelError> {
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    impl ChatModel for FailingModel {
        async fn complete(&self, _request: &ChatRequest) -> Result<String, ModelError> {
            Err(ModelError::Transport("connection refused".to_string()))
        }
    }

    fn request() -> EvaluationRequest {
        EvaluationRequest {
            name: "Morning reset".to_string(),
            goal: "Start the day calm".to_string(),
            steps: vec!["Stretch".to_string(), "Meditate".to_string()],
        }
    }

    async fn evaluate_with(raw: &str) -> RoutineEvaluation {
        RoutineEvaluator::new(Some(StaticModel(raw.to_string())))
            .evaluate(&request())
            .await
    }

    #[tokio::test]
    async fn happy_path_keeps_model_fields_and_clamps_score() {
        let evaluation = evaluate_with(
            r#"{"score": 4, "summary": "Solid", "risk": "Weekends", "tip": "Anchor it"}"#,
        )
        .await;
        assert_eq!(evaluation.score, 4);
        assert_eq!(evaluation.summary, "Solid");
        assert_eq!(evaluation.risk, "Weekends");
        assert_eq!(evaluation.tip, "Anchor it");
        assert_eq!(evaluation.name, "Morning reset");
        assert!(!evaluation.raw_feedback.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_scores_are_clamped() {
        assert_eq!(evaluate_with(r#"{"score": 7}"#).await.score, 5);
        assert_eq!(evaluate_with(r#"{"score": 0}"#).await.score, 1);
        assert_eq!(evaluate_with(r#"{"score": -3}"#).await.score, 1);
    }

    #[tokio::test]
    async fn unparseable_scores_fall_back_to_three() {
        assert_eq!(evaluate_with(r#"{"score": "abc"}"#).await.score, 3);
        assert_eq!(evaluate_with(r#"{"summary": "no score here"}"#).await.score, 3);
        assert_eq!(evaluate_with(r#"{"score": null}"#).await.score, 3);
    }

    #[tokio::test]
    async fn string_and_float_scores_coerce_to_integers() {
        assert_eq!(evaluate_with(r#"{"score": "4"}"#).await.score, 4);
        assert_eq!(evaluate_with(r#"{"score": 4.6}"#).await.score, 4);
    }

    #[tokio::test]
    async fn non_json_output_becomes_the_summary() {
        let evaluation = evaluate_with("This routine looks fine to me.").await;
        assert_eq!(evaluation.score, 3);
        assert_eq!(evaluation.summary, "This routine looks fine to me.");
        assert_eq!(evaluation.risk, PARSE_FAILURE_RISK);
        assert_eq!(evaluation.raw_feedback, "This routine looks fine to me.");
    }

    #[tokio::test]
    async fn fenced_json_output_is_unwrapped() {
        let evaluation = evaluate_with("```json\n{\"score\": 2}\n```").await;
        assert_eq!(evaluation.score, 2);
    }

    #[tokio::test]
    async fn transport_failure_yields_a_defaulted_record() {
        let evaluation = RoutineEvaluator::new(Some(FailingModel))
            .evaluate(&request())
            .await;
        assert_eq!(evaluation.score, 3);
        assert_eq!(evaluation.summary, UNAVAILABLE_SUMMARY);
        assert!(evaluation.raw_feedback.is_empty());

        let unconfigured: RoutineEvaluator<FailingModel> = RoutineEvaluator::new(None);
        let evaluation = unconfigured.evaluate(&request()).await;
        assert_eq!(evaluation.score, 3);
    }

    #[test]
    fn prompt_lists_steps_or_marks_them_missing() {
        let prompt = evaluation_prompt("Reset", "Calm", &["Stretch".to_string()]);
        assert!(prompt.contains("- name: Reset"));
        assert!(prompt.contains("  - Stretch"));

        let empty = evaluation_prompt("Reset", "Calm", &[]);
        assert!(empty.contains("(no steps provided)"));
    }
}
