use crate::cost::BatchCostSummary;
use crate::extraction::ImageExtraction;
use crate::scrape::price::{BrlPrice, PriceConfidence, ReconciledPrice};
use crate::scrape::retailer::Store;
use crate::synthesis::SynthesisReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};
use uuid::Uuid;

/// Barcode as read from a page. Pages sometimes declare the field and leave
/// it null, which is different from never mentioning it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Barcode {
    Found(String),
    DeclaredNull,
    #[default]
    Missing,
}

impl Barcode {
    pub fn is_found(&self) -> bool {
        matches!(self, Barcode::Found(_))
    }

    /// Display form; both non-found states render as the empty sentinel.
    pub fn as_display(&self) -> &str {
        match self {
            Barcode::Found(code) => code,
            Barcode::DeclaredNull | Barcode::Missing => "",
        }
    }

    /// Keeps the more informative of two readings.
    pub fn merge(self, other: Barcode) -> Barcode {
        match (self, other) {
            (found @ Barcode::Found(_), _) => found,
            (_, found @ Barcode::Found(_)) => found,
            (Barcode::DeclaredNull, _) | (_, Barcode::DeclaredNull) => Barcode::DeclaredNull,
            _ => Barcode::Missing,
        }
    }
}

/// Token counts reported for one generative call.
#[skip_serializing_none]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub image_output_tokens: Option<u64>,
}

impl GenerationUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            image_output_tokens: None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.image_output_tokens.unwrap_or(0)
    }
}

impl Add for GenerationUsage {
    type Output = GenerationUsage;

    fn add(self, rhs: Self) -> Self::Output {
        let image_output_tokens = match (self.image_output_tokens, rhs.image_output_tokens) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
        };
        GenerationUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            image_output_tokens,
        }
    }
}

impl AddAssign for GenerationUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Deterministic fields read from a page before any generative call.
#[derive(Debug, Clone, Default)]
pub struct PartialProductExtraction {
    pub title: Option<String>,
    pub price: Option<ReconciledPrice>,
    pub brand: Option<String>,
    pub barcode: Barcode,
    pub specifications: Vec<String>,
    pub image_urls: Vec<String>,
    pub product_id: Option<String>,
    /// Visible page text, truncated, used to fill gaps generatively.
    pub page_text: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ProductExtraction {
    pub source_url: String,
    pub title: String,
    pub price: Option<BrlPrice>,
    pub price_confidence: Option<PriceConfidence>,
    pub brand: Option<String>,
    pub barcode: Barcode,
    pub specifications: Vec<String>,
    pub description: Option<String>,
    pub image_urls: Vec<String>,
    pub extraction_success: bool,
    pub error: Option<String>,
}

impl ProductExtraction {
    /// Builds the final record. Success requires a title and a price, so the
    /// flag can never disagree with the data.
    pub fn from_partial(
        source_url: &str,
        partial: PartialProductExtraction,
        description: Option<String>,
    ) -> Self {
        let title = partial.title.unwrap_or_default().trim().to_string();
        let price = partial.price.map(|found| found.price);
        let extraction_success = !title.is_empty() && price.is_some();
        let error = if extraction_success {
            None
        } else if title.is_empty() {
            Some("title not found".to_string())
        } else {
            Some("price not found".to_string())
        };
        Self {
            source_url: source_url.to_string(),
            title,
            price,
            price_confidence: partial.price.map(|found| found.confidence),
            brand: partial.brand,
            barcode: partial.barcode,
            specifications: partial.specifications,
            description,
            image_urls: partial.image_urls,
            extraction_success,
            error,
        }
    }

    pub fn failed(source_url: &str, error: impl Into<String>) -> Self {
        Self {
            source_url: source_url.to_string(),
            title: String::new(),
            price: None,
            price_confidence: None,
            brand: None,
            barcode: Barcode::Missing,
            specifications: Vec::new(),
            description: None,
            image_urls: Vec::new(),
            extraction_success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchRequest {
    Urls(UrlBatchRequest),
    Photos(PhotoBatchRequest),
}

#[derive(Debug, Clone, Deserialize)]
pub struct UrlBatchRequest {
    /// Detected from each URL's host when absent.
    #[serde(default)]
    pub store: Option<Store>,
    pub urls: Vec<String>,
    #[serde(default = "default_true")]
    pub generate_description: bool,
    #[serde(default)]
    pub generate_images: bool,
    #[serde(default)]
    pub generate_variants: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoBatchRequest {
    #[serde(default)]
    pub store: Option<Store>,
    /// Local image paths; grouped into products by file name.
    pub files: Vec<String>,
    #[serde(default)]
    pub options: PhotoOptions,
    /// Per-product overrides keyed by group name (e.g. `product_1`).
    #[serde(default)]
    pub overrides: BTreeMap<String, PhotoOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoOptions {
    #[serde(default = "default_true")]
    pub extract_infos: bool,
    #[serde(default)]
    pub generate_images: bool,
    #[serde(default)]
    pub generate_variants: bool,
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

impl Default for PhotoOptions {
    fn default() -> Self {
        Self {
            extract_infos: true,
            generate_images: false,
            generate_variants: false,
            custom_prompt: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct UrlItemResult {
    pub url: String,
    pub product: ProductExtraction,
    pub synthesis: Option<SynthesisReport>,
    pub usage: GenerationUsage,
    pub cost: f64,
    pub stages: Vec<StageReport>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct PhotoItemResult {
    pub group: String,
    pub files: Vec<String>,
    pub extraction: Option<ImageExtraction>,
    pub synthesis: Option<SynthesisReport>,
    pub usage: GenerationUsage,
    pub cost: f64,
    pub error: Option<String>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum BatchItems {
    Urls(Vec<UrlItemResult>),
    Photos(Vec<PhotoItemResult>),
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub batch_id: Uuid,
    pub store: Option<Store>,
    pub results: BatchItems,
    pub summary: BatchCostSummary,
    pub cancelled: bool,
}
