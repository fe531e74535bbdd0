//! OpenAI-compatible chat-completions provider.
//!
//! Every capability is a single JSON-mode completion; the model is told the
//! exact response shape and the reply is deserialized into the provider types.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AiError;
use crate::gateway::{ApiKey, ProviderBinding, ProviderFactory};
use crate::provider::{
    AiProvider, LessonContentRequest, LessonContentResponse, OutlineRequest, OutlineResponse,
    ProcessContentRequest, ProcessContentResponse,
};

const OUTLINE_INSTRUCTIONS: &str = "You design course outlines. Reply with JSON only: \
{\"sections\":[{\"title\":string,\"description\":string,\"lessons\":[{\"title\":string,\"summary\":string,\"objectives\":[string]}]}]}";

const LESSON_INSTRUCTIONS: &str = "You write lesson content as ordered components. Reply with JSON only: \
{\"components\":[{\"kind\":\"heading|text|example|callout|quiz|exercise|summary\",\"title\":string|null,\"body\":any}],\"segue_text\":string|null}";

const PROCESS_INSTRUCTIONS: &str = "You condense subject-matter-expert material into a summary and self-contained knowledge chunks. \
Reply with JSON only: {\"summary\":string,\"chunks\":[string]}";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Deserialize)]
struct ChatMessageOwned {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: ApiKey,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: ApiKey,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }

    /// Run one JSON-mode completion and decode the reply.
    ///
    /// Returns the decoded payload and the tokens reported by the provider.
    fn complete<T: DeserializeOwned>(
        &self,
        instructions: &str,
        payload: &impl Serialize,
    ) -> Result<(T, u64), AiError> {
        let user = serde_json::to_string(payload)
            .map_err(|e| AiError::InvalidInput(format!("failed to encode request: {e}")))?;

        let req = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: instructions,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose())
            .json(&req)
            .send()
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().unwrap_or_default();
            return Err(map_status(status, body));
        }

        let parsed: ChatResponse = res
            .json()
            .map_err(|e| AiError::invalid_response(format!("malformed completion: {e}")))?;
        let tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AiError::invalid_response("completion has no content"))?;

        debug!(model = %self.model, tokens, "completion received");

        let decoded = serde_json::from_str(strip_code_fence(&content))
            .map_err(|e| AiError::invalid_response(format!("unexpected JSON shape: {e}")))?;
        Ok((decoded, tokens))
    }
}

impl AiProvider for OpenAiCompatibleProvider {
    fn generate_outline(&self, request: &OutlineRequest) -> Result<OutlineResponse, AiError> {
        let (mut out, tokens): (OutlineResponse, u64) =
            self.complete(OUTLINE_INSTRUCTIONS, request)?;
        if out.sections.is_empty() {
            return Err(AiError::invalid_response("outline has no sections"));
        }
        out.tokens_used = tokens;
        Ok(out)
    }

    fn generate_lesson_content(
        &self,
        request: &LessonContentRequest,
    ) -> Result<LessonContentResponse, AiError> {
        let (mut out, tokens): (LessonContentResponse, u64) =
            self.complete(LESSON_INSTRUCTIONS, request)?;
        if out.components.is_empty() {
            return Err(AiError::invalid_response("lesson has no components"));
        }
        out.tokens_used = tokens;
        Ok(out)
    }

    fn process_content(
        &self,
        request: &ProcessContentRequest,
    ) -> Result<ProcessContentResponse, AiError> {
        if request.content.trim().is_empty() {
            return Err(AiError::InvalidInput("submission content is empty".to_string()));
        }
        let (mut out, tokens): (ProcessContentResponse, u64) =
            self.complete(PROCESS_INSTRUCTIONS, request)?;
        out.tokens_used = tokens;
        Ok(out)
    }
}

fn map_status(status: StatusCode, body: String) -> AiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AiError::Unauthorized(body),
        StatusCode::TOO_MANY_REQUESTS => AiError::RateLimited,
        _ => AiError::RequestFailed(format!("{status}: {body}")),
    }
}

/// Models occasionally wrap JSON in a markdown fence despite JSON mode.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Factory building [`OpenAiCompatibleProvider`]s that share one HTTP client.
#[derive(Clone)]
pub struct OpenAiCompatibleFactory {
    client: Client,
    base_url: String,
    default_model: String,
}

impl OpenAiCompatibleFactory {
    pub fn new(
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AiError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            default_model: default_model.into(),
        })
    }
}

impl ProviderFactory for OpenAiCompatibleFactory {
    fn build(&self, binding: ProviderBinding) -> Result<Box<dyn AiProvider>, AiError> {
        let model = binding
            .model
            .unwrap_or_else(|| self.default_model.clone());
        Ok(Box::new(OpenAiCompatibleProvider::new(
            self.client.clone(),
            self.base_url.clone(),
            model,
            binding.api_key,
        )))
    }
}
