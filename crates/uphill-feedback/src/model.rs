use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model credential is not configured")]
    MissingCredential,
    #[error("model transport error: {0}")]
    Transport(String),
    #[error("model returned status {0}")]
    Status(u16),
    #[error("model response had no content")]
    EmptyResponse,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Seam for the external language model. The callers treat every failure
/// the same way, so implementations only need to report *that* the call
/// failed, not recover from it.
pub trait ChatModel: Send + Sync {
    fn complete(
        &self,
        request: &ChatRequest,
    ) -> impl Future<Output = Result<String, ModelError>> + Send;
}

/// Chat-completions client for OpenAI or any endpoint speaking the same
/// protocol (e.g. a local model server behind `OPENAI_BASE_URL`).
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ModelError::MissingCredential);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ModelError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// Builds a client from `OPENAI_API_KEY` / `OPENAI_BASE_URL` /
    /// `OPENAI_MODEL`. A missing key yields `Ok(None)`; the callers then
    /// run on the deterministic fallback alone.
    pub fn from_env() -> Result<Option<Self>, ModelError> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => return Ok(None),
        };
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_key, base_url, model).map(Some)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatModel for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Status(status.as_u16()));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| ModelError::Transport(err.to_string()))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(ModelError::EmptyResponse)?;

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            OpenAiClient::new("  ", DEFAULT_BASE_URL, DEFAULT_MODEL),
            Err(ModelError::MissingCredential)
        ));
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = OpenAiClient::new("key", "http://localhost:11434/v1/", "gpt-oss")
            .expect("client");
        assert_eq!(client.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn completion_response_tolerates_missing_content() {
        let completion: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices": [{"message": {}}]}"#).expect("parse");
        assert!(completion.choices[0].message.content.is_none());
    }
}
