use crate::config::PipelineConfig;
use crate::cost::{BatchCostSummary, UsageCostAccountant};
use crate::extraction::{ExtractionClient, fallback_index};
use crate::fetch::HtmlFetcher;
use crate::llm::GenerativeModel;
use crate::models::{
    Barcode, BatchItems, BatchRequest, BatchResponse, GenerationUsage, PhotoBatchRequest, PhotoItemResult,
    PhotoOptions, ProductExtraction, StageReport, UrlBatchRequest, UrlItemResult,
};
use crate::scrape::{Store, adapter_for};
use crate::storage::{ObjectStore, UsageLogEntry, UsageLogSink};
use crate::synthesis::{ImageSynthesizer, SynthesisReport, SynthesisRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Photos whose file name carries `product<N>` belong to product N.
static PRODUCT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:product|produto)[_\s-]?(\d+)").expect("product prefix regex"));

/// Unmatched photos are grouped this many at a time.
const UNMATCHED_GROUP_SIZE: usize = 3;

/// Runs URL and photo batches item by item. A failing item never stops the
/// batch; cancellation stops it between items and keeps what is done.
#[derive(Clone)]
pub struct Pipeline {
    fetcher: HtmlFetcher,
    extraction: ExtractionClient,
    synthesizer: ImageSynthesizer,
    accountant: UsageCostAccountant,
    usage_log: Option<Arc<dyn UsageLogSink>>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        model: Arc<dyn GenerativeModel>,
        store: Arc<dyn ObjectStore>,
        cancel: CancellationToken,
    ) -> Self {
        let extraction = ExtractionClient::new(model, config.retry, cancel, config.image_max_side);
        let synthesizer =
            ImageSynthesizer::new(extraction.clone(), store, config.synthesis.clone());
        Self::from_parts(
            HtmlFetcher::from_env(),
            extraction,
            synthesizer,
            UsageCostAccountant::new(config.pricing.clone()),
        )
    }

    pub fn from_parts(
        fetcher: HtmlFetcher,
        extraction: ExtractionClient,
        synthesizer: ImageSynthesizer,
        accountant: UsageCostAccountant,
    ) -> Self {
        let cancel = extraction.cancellation().clone();
        Self {
            fetcher,
            extraction,
            synthesizer,
            accountant,
            usage_log: None,
            cancel,
        }
    }

    pub fn with_usage_log(mut self, sink: Arc<dyn UsageLogSink>) -> Self {
        self.usage_log = Some(sink);
        self
    }

    pub async fn run(&self, request: BatchRequest) -> Result<BatchResponse, PipelineError> {
        match request {
            BatchRequest::Urls(request) => self.run_url_batch(request).await,
            BatchRequest::Photos(request) => self.run_photo_batch(request).await,
        }
    }

    pub async fn run_url_batch(
        &self,
        request: UrlBatchRequest,
    ) -> Result<BatchResponse, PipelineError> {
        let urls: Vec<String> = request
            .urls
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(PipelineError::invalid_input("validate_request", "no urls provided"));
        }
        let batch_id = Uuid::new_v4();
        info!(target = "vitrine.pipeline", %batch_id, urls = urls.len(), "url_batch_started");

        let mut ledger: Vec<GenerationUsage> = Vec::new();
        let mut results = Vec::with_capacity(urls.len());
        let mut cancelled = false;
        for url in &urls {
            if self.cancel.is_cancelled() {
                warn!(target = "vitrine.pipeline", %batch_id, done = results.len(), "batch_cancelled");
                cancelled = true;
                break;
            }
            let (item, calls) = self.process_url(url, &request).await;
            crate::metrics::item_finished("url", item.product.extraction_success);
            ledger.extend(calls);
            results.push(item);
        }

        let summary = self.accountant.accumulate(&ledger);
        let store_label = request
            .store
            .unwrap_or_else(|| Store::from_url(&urls[0]))
            .as_str();
        self.record_usage(store_label, results.len(), &summary).await;
        info!(
            target = "vitrine.pipeline",
            %batch_id,
            items = results.len(),
            total_tokens = summary.total_tokens,
            total_cost = summary.total_cost,
            "url_batch_finished"
        );
        Ok(BatchResponse {
            batch_id,
            store: request.store,
            results: BatchItems::Urls(results),
            summary,
            cancelled,
        })
    }

    pub async fn run_photo_batch(
        &self,
        request: PhotoBatchRequest,
    ) -> Result<BatchResponse, PipelineError> {
        if request.files.is_empty() {
            return Err(PipelineError::invalid_input("validate_request", "no files provided"));
        }
        let groups = group_photos(&request.files);
        let batch_id = Uuid::new_v4();
        info!(
            target = "vitrine.pipeline",
            %batch_id,
            files = request.files.len(),
            groups = groups.len(),
            "photo_batch_started"
        );

        let mut ledger: Vec<GenerationUsage> = Vec::new();
        let mut results = Vec::with_capacity(groups.len());
        let mut cancelled = false;
        for group in groups {
            if self.cancel.is_cancelled() {
                warn!(target = "vitrine.pipeline", %batch_id, done = results.len(), "batch_cancelled");
                cancelled = true;
                break;
            }
            let options = request.overrides.get(&group.name).unwrap_or(&request.options);
            let (item, calls) = self.process_photo_group(group, options).await;
            crate::metrics::item_finished("photos", item.error.is_none());
            ledger.extend(calls);
            results.push(item);
        }

        let summary = self.accountant.accumulate(&ledger);
        let store_label = request.store.unwrap_or(Store::Generic).as_str();
        self.record_usage(store_label, results.len(), &summary).await;
        info!(
            target = "vitrine.pipeline",
            %batch_id,
            items = results.len(),
            total_tokens = summary.total_tokens,
            "photo_batch_finished"
        );
        Ok(BatchResponse {
            batch_id,
            store: request.store,
            results: BatchItems::Photos(results),
            summary,
            cancelled,
        })
    }

    async fn process_url(
        &self,
        url: &str,
        request: &UrlBatchRequest,
    ) -> (UrlItemResult, Vec<GenerationUsage>) {
        let adapter = adapter_for(request.store.unwrap_or_else(|| Store::from_url(url)));
        let mut stages = Vec::new();
        let mut calls = Vec::new();

        let document = match self
            .capture_stage("fetch_html", &mut stages, stages::fetch_html(&self.fetcher, url))
            .await
        {
            Ok(document) => document,
            Err(err) => {
                warn!(target = "vitrine.pipeline", url = %url, error = %err, "url_item_failed");
                let item = UrlItemResult {
                    url: url.to_string(),
                    product: ProductExtraction::failed(url, err.detail()),
                    synthesis: None,
                    usage: GenerationUsage::default(),
                    cost: 0.0,
                    stages,
                };
                return (item, calls);
            }
        };

        let mut partial = match self
            .capture_stage(
                "extract_structured",
                &mut stages,
                stages::extract_structured(&document.body, url, adapter),
            )
            .await
        {
            Ok(partial) => partial,
            Err(err) => {
                let item = UrlItemResult {
                    url: url.to_string(),
                    product: ProductExtraction::failed(url, err.detail()),
                    synthesis: None,
                    usage: GenerationUsage::default(),
                    cost: 0.0,
                    stages,
                };
                return (item, calls);
            }
        };

        let has_gaps = partial.brand.is_none()
            || partial.barcode == Barcode::Missing
            || partial.specifications.is_empty();
        if has_gaps && !partial.page_text.trim().is_empty() && !self.cancel.is_cancelled() {
            let outcome = self
                .capture_stage(
                    "fill_gaps",
                    &mut stages,
                    stages::fill_gaps(&self.extraction, url, partial.clone()),
                )
                .await;
            if let Ok((filled, usage)) = outcome {
                partial = filled;
                calls.push(usage);
            }
        }

        let mut description = None;
        if request.generate_description
            && let Some(title) = partial.title.clone().filter(|t| !t.trim().is_empty())
            && !self.cancel.is_cancelled()
        {
            let outcome = self
                .capture_stage(
                    "describe",
                    &mut stages,
                    stages::describe(&self.extraction, url, &title, &partial.specifications),
                )
                .await;
            if let Ok(result) = outcome {
                calls.push(result.usage);
                description = result.description;
            }
        }

        let product_id = partial.product_id.clone();
        let product = ProductExtraction::from_partial(url, partial, description);

        let mut synthesis = None;
        if request.generate_images && !self.cancel.is_cancelled() {
            let source_url = product.image_urls.first().cloned();
            let synth_request = SynthesisRequest {
                product_name: product.title.clone(),
                product_id,
                source: Vec::new(),
                generate_variants: request.generate_variants,
                custom_prompt: None,
            };
            let outcome = self
                .capture_stage(
                    "synthesize_images",
                    &mut stages,
                    stages::synthesize_from_url(
                        &self.fetcher,
                        &self.synthesizer,
                        source_url.as_deref(),
                        synth_request,
                    ),
                )
                .await;
            if let Ok(report) = outcome {
                calls.push(report.usage);
                synthesis = Some(report);
            }
        }

        let usage = calls.iter().copied().fold(GenerationUsage::default(), |a, b| a + b);
        let item = UrlItemResult {
            url: url.to_string(),
            product,
            synthesis,
            usage,
            cost: self.accountant.cost_of(usage),
            stages,
        };
        (item, calls)
    }

    async fn process_photo_group(
        &self,
        group: PhotoGroup,
        options: &PhotoOptions,
    ) -> (PhotoItemResult, Vec<GenerationUsage>) {
        let mut stages = Vec::new();
        let mut calls = Vec::new();
        let mut item = PhotoItemResult {
            group: group.name.clone(),
            files: group.files.clone(),
            extraction: None,
            synthesis: None,
            usage: GenerationUsage::default(),
            cost: 0.0,
            error: None,
            stages: Vec::new(),
        };

        let photos = match self
            .capture_stage("load_photos", &mut stages, stages::load_photos(&group.files))
            .await
        {
            Ok(photos) => photos,
            Err(err) => {
                warn!(target = "vitrine.pipeline", group = %group.name, error = %err, "photo_group_failed");
                item.error = Some(err.detail().to_string());
                item.stages = stages;
                return (item, calls);
            }
        };

        let custom_prompt = options.custom_prompt.as_deref();
        if options.extract_infos {
            if let Ok(extraction) = self
                .capture_stage(
                    "extract_photos",
                    &mut stages,
                    stages::extract_photos(&self.extraction, &photos, custom_prompt),
                )
                .await
            {
                calls.push(extraction.usage);
                item.extraction = Some(extraction);
            }
        }

        if options.generate_images && !self.cancel.is_cancelled() {
            let extraction = item.extraction.as_ref();
            let index = extraction
                .and_then(|e| e.ideal_image_index)
                .filter(|idx| *idx < photos.len())
                .unwrap_or_else(|| fallback_index(photos.len()));
            let product_name = extraction
                .and_then(|e| e.fields.as_ref())
                .and_then(|f| f.title.clone())
                .unwrap_or_else(|| group.name.clone());
            let synth_request = SynthesisRequest {
                product_name,
                product_id: None,
                source: photos[index].clone(),
                generate_variants: options.generate_variants,
                custom_prompt: options.custom_prompt.clone(),
            };
            if let Ok(report) = self
                .capture_stage(
                    "synthesize_images",
                    &mut stages,
                    stages::synthesize(&self.synthesizer, synth_request),
                )
                .await
            {
                calls.push(report.usage);
                item.synthesis = Some(report);
            }
        }

        item.usage = calls.iter().copied().fold(GenerationUsage::default(), |a, b| a + b);
        item.cost = self.accountant.cost_of(item.usage);
        item.stages = stages;
        (item, calls)
    }

    async fn record_usage(&self, store: &str, item_count: usize, summary: &BatchCostSummary) {
        let Some(sink) = &self.usage_log else {
            return;
        };
        let entry = UsageLogEntry {
            store: store.to_string(),
            item_count,
            total_tokens: summary.total_tokens,
            total_cost: summary.total_cost,
        };
        if let Err(err) = sink.record(&entry).await {
            warn!(target = "vitrine.pipeline", store = %store, error = %err, "usage_log_failed");
        }
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoGroup {
    pub name: String,
    pub files: Vec<String>,
}

/// Groups photo paths into products: `product<N>` in the file name wins,
/// the rest go in threes in upload order.
pub fn group_photos(files: &[String]) -> Vec<PhotoGroup> {
    let mut groups: Vec<PhotoGroup> = Vec::new();
    let mut unmatched: Vec<String> = Vec::new();
    for file in files {
        let file_name = Path::new(file)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(file);
        let number = PRODUCT_PREFIX
            .captures(file_name)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok());
        match number {
            Some(number) => {
                let name = format!("product_{number}");
                match groups.iter_mut().find(|group| group.name == name) {
                    Some(group) => group.files.push(file.clone()),
                    None => groups.push(PhotoGroup {
                        name,
                        files: vec![file.clone()],
                    }),
                }
            }
            None => unmatched.push(file.clone()),
        }
    }
    for (index, chunk) in unmatched.chunks(UNMATCHED_GROUP_SIZE).enumerate() {
        groups.push(PhotoGroup {
            name: format!("group_{}", index + 1),
            files: chunk.to_vec(),
        });
    }
    groups
}

mod stages {
    use super::*;
    use crate::extraction::{DescriptionResult, ImageExtraction};
    use crate::fetch::{FetchError, HtmlDocument};
    use crate::models::PartialProductExtraction;
    use crate::scrape::{RetailerAdapter, extract};
    use serde_json::json;

    pub(super) async fn fetch_html(
        fetcher: &HtmlFetcher,
        url: &str,
    ) -> Result<StageOutcome<HtmlDocument>, PipelineError> {
        let document = fetcher.fetch(url).await.map_err(|err| match err {
            FetchError::InvalidUrl(_) => PipelineError::invalid_input("fetch_html", err.to_string()),
            other => PipelineError::internal("fetch_html", other.to_string()),
        })?;
        let output = json!({ "bytes": document.body.len() });
        Ok(StageOutcome::new(document, output))
    }

    pub(super) async fn extract_structured(
        html: &str,
        url: &str,
        adapter: &dyn RetailerAdapter,
    ) -> Result<StageOutcome<PartialProductExtraction>, PipelineError> {
        let partial = extract(html, url, adapter);
        let output = json!({
            "store": adapter.store(),
            "title": partial.title,
            "price": partial.price.map(|found| found.price.to_string()),
            "price_confidence": partial.price.map(|found| found.confidence),
            "brand": partial.brand,
            "barcode": partial.barcode,
            "specifications": partial.specifications.len(),
            "images": partial.image_urls.len(),
        });
        Ok(StageOutcome::new(partial, output))
    }

    pub(super) async fn fill_gaps(
        extraction: &ExtractionClient,
        url: &str,
        mut partial: PartialProductExtraction,
    ) -> Result<StageOutcome<(PartialProductExtraction, GenerationUsage)>, PipelineError> {
        let fields = extraction.extract_page_fields(url, &partial.page_text).await;
        let mut filled = Vec::new();
        if partial.brand.is_none()
            && let Some(brand) = fields.brand.clone()
        {
            partial.brand = Some(brand);
            filled.push("brand");
        }
        if !partial.barcode.is_found() {
            let merged = partial.barcode.clone().merge(fields.barcode.clone());
            if merged != partial.barcode {
                filled.push("barcode");
            }
            partial.barcode = merged;
        }
        if partial.specifications.is_empty() && !fields.specifications.is_empty() {
            partial.specifications = fields.specifications.clone();
            filled.push("specifications");
        }
        let output = json!({
            "filled": filled,
            "unparsed": fields.raw_response.is_some(),
            "error": fields.error,
        });
        Ok(StageOutcome::new((partial, fields.usage), output))
    }

    pub(super) async fn describe(
        extraction: &ExtractionClient,
        url: &str,
        title: &str,
        specifications: &[String],
    ) -> Result<StageOutcome<DescriptionResult>, PipelineError> {
        let result = extraction.extract_description(url, title, specifications).await;
        let output = json!({
            "chars": result.description.as_ref().map(|d| d.chars().count()),
            "error": result.error,
        });
        Ok(StageOutcome::new(result, output))
    }

    pub(super) async fn load_photos(
        files: &[String],
    ) -> Result<StageOutcome<Vec<Vec<u8>>>, PipelineError> {
        let mut photos = Vec::with_capacity(files.len());
        let mut skipped = Vec::new();
        for file in files {
            match tokio::fs::read(file).await {
                Ok(bytes) => photos.push(bytes),
                Err(err) => {
                    warn!(target = "vitrine.pipeline", file = %file, error = %err, "photo_unreadable");
                    skipped.push(file.clone());
                }
            }
        }
        if photos.is_empty() {
            return Err(PipelineError::invalid_input("load_photos", "no readable photos"));
        }
        let output = json!({ "loaded": photos.len(), "skipped": skipped });
        Ok(StageOutcome::new(photos, output))
    }

    pub(super) async fn extract_photos(
        extraction: &ExtractionClient,
        photos: &[Vec<u8>],
        custom_prompt: Option<&str>,
    ) -> Result<StageOutcome<ImageExtraction>, PipelineError> {
        let result = extraction.extract_from_images(photos, custom_prompt).await;
        let output = json!({
            "title": result.fields.as_ref().and_then(|f| f.title.clone()),
            "ideal_image_index": result.ideal_image_index,
            "attempts": result.attempts,
            "unparsed": result.raw_response.is_some(),
            "error": result.error,
        });
        Ok(StageOutcome::new(result, output))
    }

    pub(super) async fn synthesize_from_url(
        fetcher: &HtmlFetcher,
        synthesizer: &ImageSynthesizer,
        image_url: Option<&str>,
        mut request: SynthesisRequest,
    ) -> Result<StageOutcome<SynthesisReport>, PipelineError> {
        let Some(image_url) = image_url else {
            let report = SynthesisReport::failed("no source image on page");
            return Ok(StageOutcome::new(report, json!({ "error": "no source image on page" })));
        };
        match fetcher.fetch_bytes(image_url).await {
            Ok(bytes) => {
                request.source = bytes;
                synthesize(synthesizer, request).await
            }
            Err(err) => {
                let message = format!("source image download failed: {err}");
                let output = json!({ "source": image_url, "error": message });
                Ok(StageOutcome::new(SynthesisReport::failed(message), output))
            }
        }
    }

    pub(super) async fn synthesize(
        synthesizer: &ImageSynthesizer,
        request: SynthesisRequest,
    ) -> Result<StageOutcome<SynthesisReport>, PipelineError> {
        let report = synthesizer.run(&request).await;
        let output = json!({
            "state": report.state,
            "base": report.base.as_ref().and_then(|b| b.url.clone()),
            "variants": report.variants.iter().filter(|v| v.url.is_some()).count(),
            "warnings": report.warnings,
            "error": report.error,
        });
        Ok(StageOutcome::new(report, output))
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}
