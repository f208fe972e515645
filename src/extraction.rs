use crate::imaging::{self, ProductBox};
use crate::llm::json::{parse_first_object, strip_markdown_fence};
use crate::llm::{
    GenerateRequest, GenerateResponse, GenerationSettings, GenerativeModel, InlineImage, LlmError,
    ModelRole, RetryPolicy, retry,
};
use crate::models::{Barcode, GenerationUsage};
use crate::scrape::price::BrlPrice;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const MAX_PHOTOS: usize = 5;
pub const DEFAULT_MIN_CONFIDENCE: u8 = 70;

const IMAGE_EXTRACTION_PROMPT: &str = r#"Você recebe de 2 a 5 fotos de um mesmo produto, em ordem aleatória: etiqueta de preço, embalagem e o produto em si.
Extraia as informações e responda SOMENTE com um objeto JSON, sem texto antes ou depois, com as chaves:
{"nome_produto": string, "preco": string no formato "R$ 0,00" ou null, "ean": string com o código de barras ou null,
 "especificacoes": lista de strings, "descricao": string curta, "product_image_index": número (1 a N) da foto que melhor mostra o produto sozinho,
 "num_images_received": número de fotos recebidas, "identificacao": qual foto é etiqueta, embalagem e produto}"#;

const DESCRIPTION_PROMPT: &str = "Escreva uma descrição comercial em português do Brasil para o produto abaixo, \
em exatamente 3 parágrafos curtos. Não use emojis, HTML, markdown nem mencione preços. \
Responda apenas com o texto da descrição.";

const PAGE_FIELDS_PROMPT: &str = r#"A partir do texto da página de produto abaixo, responda SOMENTE com um objeto JSON:
{"marca": string ou null, "ean": string com 8 a 14 dígitos ou null, "especificacoes": lista de strings "Nome: valor"}
Use null quando a informação não estiver no texto. Não invente valores."#;

const VALIDATION_PROMPT: &str = r#"Compare a IMAGEM ORIGINAL (primeira) com a IMAGEM GERADA (segunda).
Verifique: mesma marca e logotipo, mesmas cores, mesmo tipo de produto e mesma posição comercial (frente do produto visível).
Responda SOMENTE com JSON: {"approved": true|false, "confidence": 0-100, "issues": [lista de problemas]}"#;

const BOX_PROMPT: &str = r#"Detecte o produto principal na imagem, ignorando etiquetas, mãos e fundo.
Responda SOMENTE com JSON: {"boxes": [{"label": string, "bbox": [ymin, xmin, ymax, xmax]}]} com coordenadas normalizadas de 0 a 1000."#;

static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").expect("blank line regex"));

/// Photo-based extraction result. When the reply cannot be read as the
/// expected JSON, `fields` is empty and the text is kept in `raw_response`;
/// `error` is reserved for calls that failed outright.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImageExtraction {
    pub fields: Option<ExtractedFields>,
    /// Zero-based index of the photo that best shows the product alone.
    pub ideal_image_index: Option<usize>,
    pub raw_response: Option<String>,
    pub error: Option<String>,
    pub usage: GenerationUsage,
    pub attempts: u32,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedFields {
    pub title: Option<String>,
    pub price: Option<BrlPrice>,
    pub barcode: Barcode,
    pub specifications: Vec<String>,
    pub description: Option<String>,
    pub identification: Option<String>,
    pub images_received: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawImageFields {
    #[serde(default, alias = "nome_produto")]
    title: Option<String>,
    #[serde(default, alias = "preco")]
    price: Option<Value>,
    #[serde(default, alias = "ean", deserialize_with = "present")]
    barcode: Option<Value>,
    #[serde(default, alias = "especificacoes")]
    specifications: Option<Value>,
    #[serde(default, alias = "descricao")]
    description: Option<String>,
    #[serde(default)]
    product_image_index: Option<i64>,
    #[serde(default)]
    num_images_received: Option<u32>,
    #[serde(default, alias = "identificacao")]
    identification: Option<Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct DescriptionResult {
    pub description: Option<String>,
    pub error: Option<String>,
    pub usage: GenerationUsage,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct PageFields {
    pub brand: Option<String>,
    pub barcode: Barcode,
    pub specifications: Vec<String>,
    pub raw_response: Option<String>,
    pub error: Option<String>,
    pub usage: GenerationUsage,
}

#[derive(Debug, Deserialize)]
struct RawPageFields {
    #[serde(default, alias = "marca")]
    brand: Option<String>,
    #[serde(default, deserialize_with = "present")]
    ean: Option<Value>,
    #[serde(default, alias = "especificacoes")]
    specifications: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationVerdict {
    pub approved: bool,
    pub confidence: u8,
    pub issues: Vec<String>,
    pub usage: GenerationUsage,
}

impl ValidationVerdict {
    /// Verdict used when the check itself could not be performed or read.
    fn inconclusive(usage: GenerationUsage, reason: &str) -> Self {
        Self {
            approved: true,
            confidence: 50,
            issues: vec![reason.to_string()],
            usage,
        }
    }

    pub fn passes(&self, min_confidence: u8) -> bool {
        self.approved && self.confidence >= min_confidence
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    approved: bool,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    issues: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawBoxes {
    #[serde(default)]
    boxes: Vec<ProductBox>,
}

/// Generative extraction on top of any [`GenerativeModel`]. Every call goes
/// through the shared retry policy and reports its token usage, zero when
/// the call never got a response.
#[derive(Clone)]
pub struct ExtractionClient {
    model: Arc<dyn GenerativeModel>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    image_max_side: u32,
}

impl ExtractionClient {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        retry: RetryPolicy,
        cancel: CancellationToken,
        image_max_side: u32,
    ) -> Self {
        Self {
            model,
            retry,
            cancel,
            image_max_side,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) async fn generate_with_retry(
        &self,
        label: &'static str,
        request: GenerateRequest,
    ) -> (Result<GenerateResponse, LlmError>, u32) {
        let model = &self.model;
        let request = &request;
        let outcome = retry(self.retry, &self.cancel, label, |_| async move {
            model.generate(request.clone()).await
        })
        .await;
        if let Ok(response) = &outcome.result {
            crate::metrics::generation_tokens(label, &response.usage);
        }
        if let Err(err) = &outcome.result {
            warn!(
                target = "vitrine.llm",
                call = label,
                attempts = outcome.attempts,
                error = %err,
                "generation_failed"
            );
        }
        (outcome.result, outcome.attempts)
    }

    pub async fn extract_from_images(
        &self,
        photos: &[Vec<u8>],
        custom_prompt: Option<&str>,
    ) -> ImageExtraction {
        if photos.is_empty() {
            return ImageExtraction {
                error: Some("no photos supplied".into()),
                ..Default::default()
            };
        }
        if photos.len() > MAX_PHOTOS {
            warn!(target = "vitrine.llm", photos = photos.len(), "extra_photos_ignored");
        }
        let photos = &photos[..photos.len().min(MAX_PHOTOS)];
        let images: Vec<InlineImage> = photos
            .iter()
            .map(|bytes| {
                imaging::prepare_for_model(bytes, self.image_max_side).unwrap_or_else(|err| {
                    warn!(target = "vitrine.llm", error = %err, "photo_sent_unscaled");
                    InlineImage::new(imaging::mime_type_of(bytes), bytes.clone())
                })
            })
            .collect();

        let mut prompt = IMAGE_EXTRACTION_PROMPT.to_string();
        if let Some(extra) = custom_prompt.map(str::trim).filter(|p| !p.is_empty()) {
            prompt.push_str("\n\nInstruções adicionais: ");
            prompt.push_str(extra);
        }
        let request = GenerateRequest::text(ModelRole::Text, prompt)
            .with_images(images)
            .with_settings(GenerationSettings {
                json_output: true,
                ..Default::default()
            });

        let count = photos.len();
        let (result, attempts) = self.generate_with_retry("extract_from_images", request).await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                return ImageExtraction {
                    ideal_image_index: Some(fallback_index(count)),
                    error: Some(err.to_string()),
                    attempts,
                    ..Default::default()
                };
            }
        };

        match parse_first_object::<RawImageFields>(&response.text) {
            Some(raw) => {
                let ideal = raw
                    .product_image_index
                    .filter(|idx| *idx >= 1 && (*idx as usize) <= count)
                    .map(|idx| idx as usize - 1)
                    .unwrap_or_else(|| fallback_index(count));
                ImageExtraction {
                    fields: Some(raw.into_fields()),
                    ideal_image_index: Some(ideal),
                    raw_response: None,
                    error: None,
                    usage: response.usage,
                    attempts,
                }
            }
            None => {
                warn!(target = "vitrine.llm", "image_extraction_shape_mismatch");
                ImageExtraction {
                    fields: None,
                    ideal_image_index: Some(fallback_index(count)),
                    raw_response: Some(response.text),
                    error: None,
                    usage: response.usage,
                    attempts,
                }
            }
        }
    }

    pub async fn extract_description(
        &self,
        url: &str,
        title: &str,
        specifications: &[String],
    ) -> DescriptionResult {
        let mut prompt = format!("{DESCRIPTION_PROMPT}\n\nProduto: {title}\nURL: {url}\n");
        if !specifications.is_empty() {
            prompt.push_str("Especificações:\n");
            for spec in specifications {
                prompt.push_str("- ");
                prompt.push_str(spec);
                prompt.push('\n');
            }
        }
        let request = GenerateRequest::text(ModelRole::Text, prompt);
        let (result, _) = self.generate_with_retry("extract_description", request).await;
        match result {
            Ok(response) => {
                let cleaned = clean_description(&response.text);
                if cleaned.is_empty() {
                    DescriptionResult {
                        description: None,
                        error: Some("empty description".into()),
                        usage: response.usage,
                    }
                } else {
                    info!(target = "vitrine.llm", url = %url, chars = cleaned.len(), "description_generated");
                    DescriptionResult {
                        description: Some(cleaned),
                        error: None,
                        usage: response.usage,
                    }
                }
            }
            Err(err) => DescriptionResult {
                description: None,
                error: Some(err.to_string()),
                usage: GenerationUsage::default(),
            },
        }
    }

    /// Reads brand, barcode and specifications out of visible page text.
    pub async fn extract_page_fields(&self, url: &str, page_text: &str) -> PageFields {
        let prompt = format!("{PAGE_FIELDS_PROMPT}\n\nURL: {url}\nTexto:\n{page_text}");
        let request = GenerateRequest::text(ModelRole::Text, prompt).with_settings(
            GenerationSettings {
                json_output: true,
                ..Default::default()
            },
        );
        let (result, _) = self.generate_with_retry("extract_page_fields", request).await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                return PageFields {
                    error: Some(err.to_string()),
                    ..Default::default()
                };
            }
        };
        match parse_first_object::<RawPageFields>(&response.text) {
            Some(raw) => PageFields {
                brand: raw
                    .brand
                    .map(|b| b.trim().to_string())
                    .filter(|b| !b.is_empty() && !b.eq_ignore_ascii_case("null")),
                barcode: barcode_from_value(raw.ean.as_ref()),
                specifications: string_list(raw.specifications.as_ref()),
                raw_response: None,
                error: None,
                usage: response.usage,
            },
            None => PageFields {
                raw_response: Some(response.text),
                usage: response.usage,
                ..Default::default()
            },
        }
    }

    /// Asks the validation model whether `candidate` faithfully depicts the
    /// product in `reference`. Unreadable verdicts come back as approved with
    /// confidence 50, which the default threshold rejects.
    pub async fn validate_generated_image(
        &self,
        reference: &InlineImage,
        candidate: &InlineImage,
    ) -> ValidationVerdict {
        let request = GenerateRequest::text(ModelRole::Validation, VALIDATION_PROMPT)
            .with_images(vec![reference.clone(), candidate.clone()])
            .with_settings(GenerationSettings {
                json_output: true,
                ..GenerationSettings::deterministic()
            });
        let (result, _) = self.generate_with_retry("validate_generated_image", request).await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                return ValidationVerdict::inconclusive(
                    GenerationUsage::default(),
                    &format!("validation unavailable: {err}"),
                );
            }
        };
        match parse_first_object::<RawVerdict>(&response.text) {
            Some(raw) => ValidationVerdict {
                approved: raw.approved,
                confidence: raw.confidence.unwrap_or(50.0).clamp(0.0, 100.0).round() as u8,
                issues: raw
                    .issues
                    .iter()
                    .map(|issue| match issue {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                usage: response.usage,
            },
            None => ValidationVerdict::inconclusive(response.usage, "unreadable verdict"),
        }
    }

    /// Bounding boxes of the product in `image`; empty on any failure.
    pub async fn detect_product_boxes(
        &self,
        image: &InlineImage,
    ) -> (Vec<ProductBox>, GenerationUsage) {
        let request = GenerateRequest::text(ModelRole::Validation, BOX_PROMPT)
            .with_images(vec![image.clone()])
            .with_settings(GenerationSettings {
                json_output: true,
                ..GenerationSettings::deterministic()
            });
        let (result, _) = self.generate_with_retry("detect_product_boxes", request).await;
        match result {
            Ok(response) => {
                let boxes = parse_first_object::<RawBoxes>(&response.text)
                    .map(|raw| raw.boxes)
                    .unwrap_or_default();
                (boxes, response.usage)
            }
            Err(_) => (Vec::new(), GenerationUsage::default()),
        }
    }
}

impl RawImageFields {
    fn into_fields(self) -> ExtractedFields {
        let price = match &self.price {
            Some(Value::String(s)) => {
                BrlPrice::parse_display(s).or_else(|| BrlPrice::parse_decimal(s))
            }
            Some(Value::Number(n)) => n.as_f64().and_then(BrlPrice::from_f64),
            _ => None,
        };
        ExtractedFields {
            title: self
                .title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            price,
            barcode: barcode_from_value(self.barcode.as_ref()),
            specifications: string_list(self.specifications.as_ref()),
            description: self.description.filter(|d| !d.trim().is_empty()),
            identification: self.identification.map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            images_received: self.num_images_received,
        }
    }
}

// Keeps an explicit `null` as `Some(Value::Null)`; only an absent key is `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Photo to use when the model did not name one: the last of three or more
/// (usually the product shot), otherwise the first.
pub fn fallback_index(count: usize) -> usize {
    if count >= 3 { count - 1 } else { 0 }
}

fn barcode_from_value(value: Option<&Value>) -> Barcode {
    match value {
        None => Barcode::Missing,
        Some(Value::Null) => Barcode::DeclaredNull,
        Some(Value::Number(n)) => Barcode::Found(n.to_string()),
        Some(Value::String(s)) => {
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                Barcode::DeclaredNull
            } else {
                Barcode::Found(digits)
            }
        }
        Some(_) => Barcode::Missing,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .lines()
            .map(|line| line.trim().trim_start_matches(['-', '•']).trim().to_string())
            .filter(|line| !line.is_empty())
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, value)| match value {
                Value::String(s) => format!("{name}: {s}"),
                other => format!("{name}: {other}"),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Removes code fences and collapses runs of blank lines.
pub fn clean_description(text: &str) -> String {
    let without_fences = strip_markdown_fence(text).replace("```", "");
    BLANK_LINES
        .replace_all(without_fences.trim(), "\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::testing::png;
    use crate::llm::testing::ScriptedModel;
    use std::time::Duration;

    fn client(model: Arc<ScriptedModel>) -> ExtractionClient {
        ExtractionClient::new(
            model,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            },
            CancellationToken::new(),
            800,
        )
    }

    fn photos(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|_| png(32, 32)).collect()
    }

    #[tokio::test]
    async fn reads_portuguese_keys_and_ideal_index() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text(
            ModelRole::Text,
            r#"```json
{"nome_produto":"Azeite Extra Virgem 500ml","preco":"R$ 39,90","ean":"7891234567895",
 "especificacoes":["Volume: 500 ml"],"descricao":"Azeite","product_image_index":2,"num_images_received":3,
 "identificacao":"1 etiqueta, 2 produto, 3 embalagem"}
```"#,
            GenerationUsage::new(900, 120),
        );
        let extraction = client(model.clone()).extract_from_images(&photos(3), None).await;
        let fields = extraction.fields.expect("fields");
        assert_eq!(fields.title.as_deref(), Some("Azeite Extra Virgem 500ml"));
        assert_eq!(fields.price.map(|p| p.cents()), Some(3_990));
        assert_eq!(fields.barcode, Barcode::Found("7891234567895".into()));
        assert_eq!(extraction.ideal_image_index, Some(1));
        assert_eq!(extraction.usage, GenerationUsage::new(900, 120));
        assert!(extraction.error.is_none());
        let sent = &model.requests()[0];
        assert_eq!(sent.images.len(), 3);
        assert!(sent.settings.json_output);
    }

    #[tokio::test]
    async fn shape_mismatch_keeps_raw_text_without_error() {
        let model = Arc::new(ScriptedModel::new());
        let reply = "Não consegui identificar o produto nas fotos.";
        model.push_text(ModelRole::Text, reply, GenerationUsage::new(500, 12));
        let extraction = client(model).extract_from_images(&photos(2), None).await;
        assert!(extraction.fields.is_none());
        assert_eq!(extraction.raw_response.as_deref(), Some(reply));
        assert!(extraction.error.is_none());
        assert_eq!(extraction.usage, GenerationUsage::new(500, 12));
        assert_eq!(extraction.ideal_image_index, Some(0));
    }

    #[tokio::test]
    async fn wrong_field_types_are_a_shape_mismatch() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text(
            ModelRole::Text,
            r#"{"nome_produto": 42, "product_image_index": "dois"}"#,
            GenerationUsage::new(1, 1),
        );
        let extraction = client(model).extract_from_images(&photos(4), None).await;
        assert!(extraction.fields.is_none());
        assert!(extraction.raw_response.is_some());
        assert_eq!(extraction.ideal_image_index, Some(3));
    }

    #[tokio::test]
    async fn out_of_range_index_falls_back() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text(
            ModelRole::Text,
            r#"{"nome_produto":"Café","product_image_index":9}"#,
            GenerationUsage::new(1, 1),
        );
        let extraction = client(model).extract_from_images(&photos(3), None).await;
        assert_eq!(extraction.ideal_image_index, Some(2));
    }

    #[tokio::test]
    async fn permanent_failure_has_error_and_zero_usage() {
        let model = Arc::new(ScriptedModel::new());
        model.push_status(ModelRole::Text, 400);
        let extraction = client(model.clone()).extract_from_images(&photos(2), None).await;
        assert!(extraction.error.as_deref().unwrap_or_default().contains("400"));
        assert_eq!(extraction.usage, GenerationUsage::default());
        assert_eq!(extraction.attempts, 1);
        assert_eq!(model.calls(ModelRole::Text), 1);
    }

    #[tokio::test]
    async fn description_is_cleaned() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text(
            ModelRole::Text,
            "```\nPrimeiro parágrafo.\n\n\nSegundo parágrafo.\n\nTerceiro.\n```",
            GenerationUsage::new(200, 80),
        );
        let result = client(model)
            .extract_description("https://x", "Furadeira", &["Potência: 650W".into()])
            .await;
        assert_eq!(
            result.description.as_deref(),
            Some("Primeiro parágrafo.\nSegundo parágrafo.\nTerceiro.")
        );
        assert_eq!(result.usage, GenerationUsage::new(200, 80));
    }

    #[tokio::test]
    async fn verdict_threshold_and_unreadable_default() {
        let model = Arc::new(ScriptedModel::new());
        model
            .push_text(
                ModelRole::Validation,
                r#"{"approved": true, "confidence": 85, "issues": []}"#,
                GenerationUsage::new(10, 5),
            )
            .push_text(
                ModelRole::Validation,
                r#"{"approved": true, "confidence": 65, "issues": ["logo borrado"]}"#,
                GenerationUsage::new(10, 5),
            )
            .push_text(ModelRole::Validation, "parece ok", GenerationUsage::new(10, 5));
        let client = client(model);
        let image = InlineImage::new("image/png", png(8, 8));

        let first = client.validate_generated_image(&image, &image).await;
        assert!(first.passes(DEFAULT_MIN_CONFIDENCE));
        let second = client.validate_generated_image(&image, &image).await;
        assert!(!second.passes(DEFAULT_MIN_CONFIDENCE));
        assert_eq!(second.issues, vec!["logo borrado"]);
        let third = client.validate_generated_image(&image, &image).await;
        assert!(third.approved);
        assert_eq!(third.confidence, 50);
        assert!(!third.passes(DEFAULT_MIN_CONFIDENCE));
    }

    #[tokio::test]
    async fn page_fields_fill_brand_and_barcode() {
        let model = Arc::new(ScriptedModel::new());
        model.push_text(
            ModelRole::Text,
            r#"{"marca": "Suvinil", "ean": null, "especificacoes": {"Cor": "Branco"}}"#,
            GenerationUsage::new(300, 20),
        );
        let fields = client(model)
            .extract_page_fields("https://x", "Tinta Suvinil 18L branco")
            .await;
        assert_eq!(fields.brand.as_deref(), Some("Suvinil"));
        assert_eq!(fields.barcode, Barcode::DeclaredNull);
        assert_eq!(fields.specifications, vec!["Cor: Branco"]);
    }

    #[tokio::test]
    async fn boxes_parse_or_come_back_empty() {
        let model = Arc::new(ScriptedModel::new());
        model
            .push_text(
                ModelRole::Validation,
                r#"{"boxes":[{"label":"garrafa","bbox":[100,200,900,800]}]}"#,
                GenerationUsage::new(50, 10),
            )
            .push_status(ModelRole::Validation, 400);
        let client = client(model);
        let image = InlineImage::new("image/png", png(8, 8));
        let (boxes, usage) = client.detect_product_boxes(&image).await;
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].bbox, [100.0, 200.0, 900.0, 800.0]);
        assert_eq!(usage.input_tokens, 50);
        let (boxes, usage) = client.detect_product_boxes(&image).await;
        assert!(boxes.is_empty());
        assert_eq!(usage, GenerationUsage::default());
    }

    #[test]
    fn fallback_index_rule() {
        assert_eq!(fallback_index(1), 0);
        assert_eq!(fallback_index(2), 0);
        assert_eq!(fallback_index(3), 2);
        assert_eq!(fallback_index(5), 4);
    }
}
