use crate::http::build_client;
use crate::llm::{Generate, retry};
use eyre::Result;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tracing::warn;

static DEFAULT_ROOT: Lazy<String> = Lazy::new(|| {
    std::env::var("GENERATION_API_URL").unwrap_or_else(|_| "https://api.anthropic.com".into())
});

const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const TEMPERATURE: f32 = 0.7;
const MAX_OUTPUT_TOKENS: u32 = 1024;

const PERSONA_PROMPT: &str = "You are an expert social media caption writer for consumer brands. \
You study product imagery and the email context it arrived with, then write short, vivid, \
ready-to-publish captions. You always answer with JSON only, in exactly the shape requested.";

#[derive(Debug, Clone)]
pub struct GenConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl GenConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: DEFAULT_ROOT.clone(),
            api_key: std::env::var("GENERATION_API_KEY").ok(),
            model: std::env::var("GENERATION_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenError {
    #[error("generation client is not configured")]
    NotConfigured,
    #[error("generation service is at capacity")]
    Overloaded,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One block of multimodal prompt content, in the order it should be shown
/// to the model.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { media_type: String, data: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct GenMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

/// Fully assembled prompt for one generation call. Model parameters are
/// fixed by the client; callers only supply content.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub content: Vec<ContentBlock>,
}

pub struct GenClient {
    http: Client,
    config: GenConfig,
}

impl GenClient {
    pub fn new(config: GenConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    async fn attempt(&self, api_key: &str, request: &GenerationRequest) -> Result<String, GenError> {
        let body = MessagesBody {
            model: &self.config.model,
            max_tokens: MAX_OUTPUT_TOKENS,
            temperature: TEMPERATURE,
            system: PERSONA_PROMPT,
            messages: vec![GenMessage {
                role: "user".into(),
                content: request.content.clone(),
            }],
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", self.config.base_url.trim_end_matches('/')))
            .header("x-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| GenError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 529 || text.contains("overloaded_error") {
                return Err(GenError::Overloaded);
            }
            return Err(GenError::Http(format!("HTTP {status}")));
        }

        let payload: MessagesResponse = response
            .json()
            .await
            .map_err(|err| GenError::InvalidResponse(err.to_string()))?;

        payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .map(|item| item.text)
            .ok_or_else(|| GenError::InvalidResponse("missing text block".into()))
    }
}

impl Generate for GenClient {
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<String, GenError>> + Send {
        async move {
            let Some(api_key) = self.config.api_key.as_deref() else {
                return Err(GenError::NotConfigured);
            };

            retry::run(
                |attempt| {
                    if attempt > 1 {
                        warn!(
                            target = "calliope.llm",
                            attempt = attempt,
                            "retrying generation call after overload"
                        );
                    }
                    self.attempt(api_key, request)
                },
                tokio::time::sleep,
            )
            .await
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<GenMessage>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    text: String,
}
