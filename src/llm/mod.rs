pub mod gemini;
pub mod json;
pub mod retry;

use crate::models::GenerationUsage;
use async_trait::async_trait;
use thiserror::Error;

pub use gemini::{GeminiClient, GeminiConfig};
pub use retry::{RetryOutcome, RetryPolicy, Retryable, retry};

/// Which configured model serves a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    Text,
    Image,
    Validation,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Text => "text",
            ModelRole::Image => "image",
            ModelRole::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl InlineImage {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerationSettings {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    /// Ask for `application/json` output.
    pub json_output: bool,
    /// Ask for image output alongside text.
    pub image_output: bool,
}

impl GenerationSettings {
    /// Settings used for image generation and fidelity checks.
    pub fn deterministic() -> Self {
        Self {
            temperature: Some(0.0),
            top_p: Some(0.95),
            top_k: Some(20),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub role: ModelRole,
    pub prompt: String,
    pub images: Vec<InlineImage>,
    pub settings: GenerationSettings,
}

impl GenerateRequest {
    pub fn text(role: ModelRole, prompt: impl Into<String>) -> Self {
        Self {
            role,
            prompt: prompt.into(),
            images: Vec::new(),
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_images(mut self, images: Vec<InlineImage>) -> Self {
        self.images = images;
        self
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub text: String,
    pub images: Vec<InlineImage>,
    pub usage: GenerationUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("missing api key")]
    MissingApiKey,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    /// Only overload and rate-limit responses are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Http { status: 429 | 503, .. })
    }
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn cancelled() -> Self {
        LlmError::Cancelled
    }
}

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// In-memory model that replays scripted responses per role and records
    /// every request it receives.
    #[derive(Default)]
    pub struct ScriptedModel {
        script: Mutex<HashMap<ModelRole, VecDeque<Result<GenerateResponse, LlmError>>>>,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl ScriptedModel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, role: ModelRole, reply: Result<GenerateResponse, LlmError>) -> &Self {
            self.script
                .lock()
                .unwrap()
                .entry(role)
                .or_default()
                .push_back(reply);
            self
        }

        pub fn push_text(&self, role: ModelRole, text: &str, usage: GenerationUsage) -> &Self {
            self.push(
                role,
                Ok(GenerateResponse {
                    text: text.to_string(),
                    images: Vec::new(),
                    usage,
                }),
            )
        }

        pub fn push_status(&self, role: ModelRole, status: u16) -> &Self {
            self.push(
                role,
                Err(LlmError::Http {
                    status,
                    body: String::new(),
                }),
            )
        }

        pub fn requests(&self) -> Vec<GenerateRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn calls(&self, role: ModelRole) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.role == role)
                .count()
        }
    }

    #[async_trait]
    impl GenerativeModel for ScriptedModel {
        async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
            let role = request.role;
            self.requests.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .get_mut(&role)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".into())))
        }
    }
}
