use super::{GenerateRequest, GenerateResponse, GenerativeModel, InlineImage, LlmError, ModelRole};
use crate::config::{env_parse, env_string};
use crate::http::build_client;
use crate::models::GenerationUsage;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Billed output tokens per generated image when the response omits a
/// per-modality breakdown.
pub const IMAGE_TOKENS_PER_IMAGE: u64 = 1290;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub text_model: String,
    pub image_model: String,
    pub validation_model: String,
    /// Per-call deadline; image generation routinely takes far longer than a page fetch.
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            api_key: env_string("GEMINI_API_KEY"),
            text_model: env_string("GEMINI_MODEL_TEXT")
                .unwrap_or_else(|| "gemini-2.5-flash-lite".into()),
            image_model: env_string("GEMINI_MODEL_IMAGE")
                .unwrap_or_else(|| "gemini-2.5-flash-image".into()),
            validation_model: env_string("GEMINI_MODEL_VALIDATION")
                .unwrap_or_else(|| "gemini-2.5-flash-lite".into()),
            timeout: Duration::from_secs(
                env_parse::<u64>("GEMINI_TIMEOUT_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(120),
            ),
        }
    }

    pub fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Text => &self.text_model,
            ModelRole::Image => &self.image_model,
            ModelRole::Validation => &self.validation_model,
        }
    }
}

pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;
        let model = self.config.model_for(request.role);
        let url = format!("{}/models/{}:generateContent", self.config.base_url, model);
        let body = build_body(&request);

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let payload: GeminiResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let parsed = into_response(payload)?;
        debug!(
            target = "vitrine.llm",
            model = %model,
            role = request.role.as_str(),
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            images = parsed.images.len(),
            "generation_completed"
        );
        Ok(parsed)
    }
}

fn build_body(request: &GenerateRequest) -> GeminiRequest {
    let mut parts = vec![Part {
        text: Some(request.prompt.clone()),
        inline_data: None,
    }];
    parts.extend(request.images.iter().map(|image| Part {
        text: None,
        inline_data: Some(Blob {
            mime_type: image.mime_type.clone(),
            data: BASE64.encode(&image.data),
        }),
    }));

    let settings = &request.settings;
    GeminiRequest {
        contents: vec![Content {
            role: "user",
            parts,
        }],
        generation_config: GenerationConfig {
            temperature: settings.temperature,
            top_p: settings.top_p,
            top_k: settings.top_k,
            response_mime_type: settings.json_output.then_some("application/json"),
            response_modalities: settings.image_output.then(|| vec!["IMAGE", "TEXT"]),
        },
    }
}

fn into_response(payload: GeminiResponse) -> Result<GenerateResponse, LlmError> {
    let candidate = payload
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("no candidates".into()))?;

    let mut text = String::new();
    let mut images = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if let Some(blob) = part.inline_data {
            let data = BASE64
                .decode(blob.data.as_bytes())
                .map_err(|err| LlmError::InvalidResponse(format!("inline data: {err}")))?;
            images.push(InlineImage::new(blob.mime_type, data));
        }
    }

    let usage = payload.usage_metadata.unwrap_or_default();
    let input = usage.prompt_token_count.unwrap_or(0);
    let candidates = usage.candidates_token_count.unwrap_or(0);
    let reported_image: u64 = usage
        .candidates_tokens_details
        .iter()
        .filter(|detail| detail.modality.eq_ignore_ascii_case("IMAGE"))
        .map(|detail| detail.token_count.unwrap_or(0))
        .sum();
    let image_tokens = if reported_image > 0 {
        reported_image
    } else {
        IMAGE_TOKENS_PER_IMAGE * images.len() as u64
    };

    Ok(GenerateResponse {
        text,
        usage: GenerationUsage {
            input_tokens: input,
            output_tokens: candidates.saturating_sub(image_tokens),
            image_output_tokens: (!images.is_empty() || reported_image > 0).then_some(image_tokens),
        },
        images,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct Part {
    text: Option<String>,
    inline_data: Option<Blob>,
}

#[derive(Debug, Serialize)]
struct Blob {
    mime_type: String,
    data: String,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    response_mime_type: Option<&'static str>,
    response_modalities: Option<Vec<&'static str>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "inlineData", alias = "inline_data")]
    inline_data: Option<ResponseBlob>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlob {
    #[serde(rename = "mimeType", alias = "mime_type", default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    #[serde(default)]
    candidates_tokens_details: Vec<ModalityTokens>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModalityTokens {
    #[serde(default)]
    modality: String,
    token_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationSettings;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> GeminiConfig {
        GeminiConfig {
            base_url,
            api_key: Some("test-key".into()),
            text_model: "text-model".into(),
            image_model: "image-model".into(),
            validation_model: "validation-model".into(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn sends_inline_images_and_reads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-model:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(json!({
                "contents": [{"role": "user", "parts": [
                    {"text": "descreva"},
                    {"inline_data": {"mime_type": "image/jpeg", "data": "AQID"}}
                ]}],
                "generationConfig": {"responseMimeType": "application/json"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "{\"ok\":"}, {"text": "true}"}]}}],
                "usageMetadata": {"promptTokenCount": 120, "candidatesTokenCount": 30}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::new(config(server.uri()));
        let request = GenerateRequest::text(ModelRole::Text, "descreva")
            .with_images(vec![InlineImage::new("image/jpeg", vec![1, 2, 3])])
            .with_settings(GenerationSettings {
                json_output: true,
                ..Default::default()
            });
        let response = client.generate(request).await.expect("generate");
        assert_eq!(response.text, "{\"ok\":true}");
        assert_eq!(response.usage, GenerationUsage::new(120, 30));
    }

    #[tokio::test]
    async fn missing_usage_counts_as_zero() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "oi"}]}}]
            })))
            .mount(&server)
            .await;
        let client = GeminiClient::new(config(server.uri()));
        let response = client
            .generate(GenerateRequest::text(ModelRole::Text, "x"))
            .await
            .expect("generate");
        assert_eq!(response.usage, GenerationUsage::default());
    }

    #[tokio::test]
    async fn image_tokens_split_from_text_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/image-model:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [
                    {"text": "pronto"},
                    {"inlineData": {"mimeType": "image/png", "data": "iVBORw0KGgo="}}
                ]}}],
                "usageMetadata": {"promptTokenCount": 300, "candidatesTokenCount": 1300}
            })))
            .mount(&server)
            .await;
        let client = GeminiClient::new(config(server.uri()));
        let response = client
            .generate(GenerateRequest::text(ModelRole::Image, "gere"))
            .await
            .expect("generate");
        assert_eq!(response.images.len(), 1);
        assert_eq!(response.images[0].mime_type, "image/png");
        assert_eq!(response.usage.output_tokens, 10);
        assert_eq!(response.usage.image_output_tokens, Some(IMAGE_TOKENS_PER_IMAGE));
    }

    #[tokio::test]
    async fn error_status_is_surfaced_with_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        let client = GeminiClient::new(config(server.uri()));
        let err = client
            .generate(GenerateRequest::text(ModelRole::Text, "x"))
            .await
            .expect_err("503");
        assert_eq!(
            err,
            LlmError::Http {
                status: 503,
                body: "overloaded".into()
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_key_fails_before_network() {
        let mut cfg = config("http://127.0.0.1:9".into());
        cfg.api_key = None;
        let client = GeminiClient::new(cfg);
        let err = client
            .generate(GenerateRequest::text(ModelRole::Text, "x"))
            .await
            .expect_err("no key");
        assert_eq!(err, LlmError::MissingApiKey);
    }
}
