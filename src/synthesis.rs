use crate::config::{env_bool, env_parse, env_string};
use crate::extraction::{DEFAULT_MIN_CONFIDENCE, ExtractionClient};
use crate::imaging;
use crate::llm::{GenerateRequest, GenerationSettings, InlineImage, LlmError, ModelRole};
use crate::models::GenerationUsage;
use crate::storage::ObjectStore;
use chrono::Utc;
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Generated payloads smaller than this are treated as placeholders.
pub const MIN_PAYLOAD_BYTES: usize = 1024;

const BASE_PROMPT: &str = "Create a professional e-commerce photo of the product shown in the image. \
Isolate the product on a pure white background (#FFFFFF) with soft, even studio lighting. \
If the product is inside packaging or held by a hand, show only the product itself. \
Remove price tags, stickers, security labels and any hands. \
Keep every logo, brand name and label text exactly as in the original; do not invent or translate text. \
Do not add props, shadows with color casts, borders or watermarks.";

const FEEDBACK_PREFIX: &str = "The previous attempt was rejected for these reasons, fix them:";

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Generate-and-validate rounds per image before settling for the last candidate.
    pub max_attempts: u32,
    pub min_confidence: u8,
    /// Crop the source to the detected product before generating.
    pub crop_to_product: bool,
    /// Parent directory for per-call scratch directories.
    pub scratch_dir: PathBuf,
    pub source_max_side: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            crop_to_product: false,
            scratch_dir: std::env::temp_dir(),
            source_max_side: 1024,
        }
    }
}

impl SynthesisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse::<u32>("SYNTH_MAX_ATTEMPTS")
                .filter(|v| *v >= 1)
                .unwrap_or(defaults.max_attempts),
            min_confidence: env_parse::<u8>("SYNTH_MIN_CONFIDENCE")
                .map(|v| v.min(100))
                .unwrap_or(defaults.min_confidence),
            crop_to_product: env_bool("SYNTH_CROP_TO_PRODUCT").unwrap_or(defaults.crop_to_product),
            scratch_dir: env_string("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            source_max_side: defaults.source_max_side,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Angle {
    /// The cleaned white-background render, stored as the front view.
    #[serde(rename = "front_view")]
    Base,
    SideView,
    PerspectiveView,
    Lifestyle,
}

impl Angle {
    pub const VARIANTS: [Angle; 3] = [Angle::SideView, Angle::PerspectiveView, Angle::Lifestyle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Angle::Base => "front_view",
            Angle::SideView => "side_view",
            Angle::PerspectiveView => "perspective_view",
            Angle::Lifestyle => "lifestyle",
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            Angle::Base => BASE_PROMPT,
            Angle::SideView => {
                "Show exactly the same product from a 45-degree side view, on a pure white background (#FFFFFF). \
                 Keep logos, colors and proportions identical."
            }
            Angle::PerspectiveView => {
                "Show exactly the same product from a 3/4 perspective angle, slightly from above, \
                 on a pure white background (#FFFFFF). Keep logos, colors and proportions identical."
            }
            Angle::Lifestyle => {
                "Place exactly the same product in a realistic lifestyle setting where it is normally used, \
                 for example a clean kitchen countertop, with soft natural light. \
                 The product must stay in focus with logos and colors identical."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisState {
    Start,
    BaseGenerated,
    VariantsGenerated,
    Done,
    Failed,
}

impl SynthesisState {
    pub fn allows(self, next: SynthesisState) -> bool {
        use SynthesisState::*;
        match next {
            Failed => !matches!(self, Done | Failed),
            BaseGenerated => self == Start,
            VariantsGenerated => self == BaseGenerated,
            Done => matches!(self, BaseGenerated | VariantsGenerated),
            Start => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub product_name: String,
    pub product_id: Option<String>,
    /// Raw bytes of the chosen source photo.
    pub source: Vec<u8>,
    pub generate_variants: bool,
    pub custom_prompt: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub angle: Angle,
    pub url: Option<String>,
    pub attempts: u32,
    /// False when the image was kept only because attempts ran out.
    pub validated: bool,
    pub confidence: Option<u8>,
    pub issues: Vec<String>,
    pub error: Option<String>,
}

impl StageResult {
    fn new(angle: Angle) -> Self {
        Self {
            angle,
            url: None,
            attempts: 0,
            validated: false,
            confidence: None,
            issues: Vec::new(),
            error: None,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisReport {
    pub state: SynthesisState,
    pub base: Option<StageResult>,
    pub variants: Vec<StageResult>,
    pub usage: GenerationUsage,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl SynthesisReport {
    fn new() -> Self {
        Self {
            state: SynthesisState::Start,
            base: None,
            variants: Vec::new(),
            usage: GenerationUsage::default(),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// Report for a run that could not start, e.g. the source image never arrived.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::new().fail(error)
    }

    fn move_to(&mut self, next: SynthesisState) {
        if self.state.allows(next) {
            debug!(target = "vitrine.synthesis", from = ?self.state, to = ?next, "state_changed");
            self.state = next;
        } else {
            warn!(target = "vitrine.synthesis", from = ?self.state, to = ?next, "state_change_ignored");
        }
    }

    fn fail(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        warn!(target = "vitrine.synthesis", error = %error, "synthesis_failed");
        self.move_to(SynthesisState::Failed);
        self.error = Some(error);
        self
    }
}

/// One generated image on local disk. The file lives only until the asset
/// is discarded or dropped.
struct ImageAsset {
    file: NamedTempFile,
}

impl ImageAsset {
    fn create(dir: &Path, angle: Angle, bytes: &[u8]) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(angle.as_str())
            .suffix(".png")
            .tempfile_in(dir)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self { file })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }

    fn discard(self) {
        if let Err(err) = self.file.close() {
            warn!(target = "vitrine.synthesis", error = %err, "temp_image_cleanup_failed");
        }
    }
}

struct StageOutput {
    image: Option<InlineImage>,
    result: StageResult,
}

/// Turns a source photo into a validated white-background render and,
/// optionally, three derived angles. Each stage fails on its own; a report
/// is always returned.
#[derive(Clone)]
pub struct ImageSynthesizer {
    extraction: ExtractionClient,
    store: Arc<dyn ObjectStore>,
    config: SynthesisConfig,
}

impl ImageSynthesizer {
    pub fn new(
        extraction: ExtractionClient,
        store: Arc<dyn ObjectStore>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            extraction,
            store,
            config,
        }
    }

    pub async fn run(&self, request: &SynthesisRequest) -> SynthesisReport {
        let report = SynthesisReport::new();
        let scratch = match tempfile::Builder::new()
            .prefix("vitrine-")
            .tempdir_in(&self.config.scratch_dir)
        {
            Ok(dir) => dir,
            Err(err) => return report.fail(format!("scratch directory unavailable: {err}")),
        };
        let report = self.run_in(request, scratch.path(), report).await;
        if let Err(err) = scratch.close() {
            warn!(target = "vitrine.synthesis", error = %err, "scratch_cleanup_failed");
        }
        report
    }

    async fn run_in(
        &self,
        request: &SynthesisRequest,
        scratch: &Path,
        mut report: SynthesisReport,
    ) -> SynthesisReport {
        let source = match self.prepare_source(&request.source, &mut report).await {
            Ok(source) => source,
            Err(err) => return report.fail(err),
        };
        let folder = folder_name(&request.product_name, request.product_id.as_deref());
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        let mut base_prompt = Angle::Base.instruction().to_string();
        if let Some(extra) = request.custom_prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            base_prompt.push_str("\nAdditional instructions: ");
            base_prompt.push_str(extra);
        }
        let base = self
            .generate_stage(Angle::Base, &base_prompt, &source, &source, &mut report)
            .await;
        let Some(base_image) = base.image else {
            let error = base
                .result
                .error
                .clone()
                .unwrap_or_else(|| "base image not generated".into());
            report.base = Some(base.result);
            return report.fail(error);
        };
        let mut base_result = base.result;
        self.upload(scratch, &folder, &stamp, &base_image, &mut base_result)
            .await;
        report.base = Some(base_result);
        report.move_to(SynthesisState::BaseGenerated);

        if request.generate_variants {
            for angle in Angle::VARIANTS {
                if self.extraction.cancellation().is_cancelled() {
                    report.warnings.push(format!("{}: skipped, cancelled", angle.as_str()));
                    continue;
                }
                // Generated from the base render, judged against the original photo.
                let stage = self
                    .generate_stage(angle, angle.instruction(), &base_image, &source, &mut report)
                    .await;
                let mut result = stage.result;
                match stage.image {
                    Some(image) => {
                        self.upload(scratch, &folder, &stamp, &image, &mut result).await;
                    }
                    None if result.error.is_none() => {
                        result.error = Some("image not generated".into());
                    }
                    None => {}
                }
                report.variants.push(result);
            }
            report.move_to(SynthesisState::VariantsGenerated);
        }

        report.move_to(SynthesisState::Done);
        info!(
            target = "vitrine.synthesis",
            folder = %folder,
            variants = report.variants.len(),
            warnings = report.warnings.len(),
            "synthesis_finished"
        );
        report
    }

    async fn prepare_source(
        &self,
        bytes: &[u8],
        report: &mut SynthesisReport,
    ) -> Result<InlineImage, String> {
        let image = imaging::decode(bytes).map_err(|err| format!("source image unreadable: {err}"))?;
        let image = if self.config.crop_to_product {
            let preview = imaging::prepare_png(image.clone(), self.config.source_max_side)
                .map_err(|err| err.to_string())?;
            let (boxes, usage) = self.extraction.detect_product_boxes(&preview).await;
            report.usage += usage;
            match imaging::crop_to_largest_box(&image, &boxes) {
                Some(cropped) => cropped,
                None => {
                    debug!(target = "vitrine.synthesis", boxes = boxes.len(), "crop_skipped");
                    image
                }
            }
        } else {
            image
        };
        imaging::prepare_png(image, self.config.source_max_side).map_err(|err| err.to_string())
    }

    /// Generate, validate against `reference`, re-prompt with the validator's
    /// issues. When attempts run out, or a permanent error stops generation
    /// after a rejection, the most recent candidate is kept unvalidated with
    /// a warning and no stage error. A stage ends with either an image or an
    /// error, never both.
    async fn generate_stage(
        &self,
        angle: Angle,
        instruction: &str,
        input: &InlineImage,
        reference: &InlineImage,
        report: &mut SynthesisReport,
    ) -> StageOutput {
        let mut result = StageResult::new(angle);
        let mut feedback: Vec<String> = Vec::new();
        let mut last_rejected: Option<InlineImage> = None;
        let mut stopped_by: Option<String> = None;
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if self.extraction.cancellation().is_cancelled() {
                result.error = Some("cancelled".into());
                return StageOutput {
                    image: None,
                    result,
                };
            }
            result.attempts = attempt;
            let mut prompt = instruction.to_string();
            if !feedback.is_empty() {
                prompt.push_str("\n\n");
                prompt.push_str(FEEDBACK_PREFIX);
                for issue in &feedback {
                    prompt.push_str("\n- ");
                    prompt.push_str(issue);
                }
            }
            let request = GenerateRequest::text(ModelRole::Image, prompt)
                .with_images(vec![input.clone()])
                .with_settings(GenerationSettings {
                    image_output: true,
                    ..GenerationSettings::deterministic()
                });

            let response = match self
                .extraction
                .generate_with_retry("generate_image", request)
                .await
            {
                (Ok(response), _) => response,
                (Err(LlmError::Cancelled), _) => {
                    result.error = Some("cancelled".into());
                    return StageOutput {
                        image: None,
                        result,
                    };
                }
                (Err(err), _) => {
                    warn!(
                        target = "vitrine.synthesis",
                        angle = angle.as_str(),
                        attempt,
                        error = %err,
                        "generation_stopped"
                    );
                    stopped_by = Some(err.to_string());
                    break;
                }
            };
            report.usage += response.usage;

            let Some(candidate) = select_payload(&response.images) else {
                warn!(target = "vitrine.synthesis", angle = angle.as_str(), attempt, "no_usable_image");
                feedback = vec!["the response did not contain an image".into()];
                continue;
            };

            let verdict = self
                .extraction
                .validate_generated_image(reference, &candidate)
                .await;
            report.usage += verdict.usage;
            result.confidence = Some(verdict.confidence);
            result.issues = verdict.issues.clone();
            if verdict.passes(self.config.min_confidence) {
                result.validated = true;
                result.error = None;
                return StageOutput {
                    image: Some(candidate),
                    result,
                };
            }
            debug!(
                target = "vitrine.synthesis",
                angle = angle.as_str(),
                attempt,
                confidence = verdict.confidence,
                "candidate_rejected"
            );
            feedback = verdict.issues;
            last_rejected = Some(candidate);
        }

        match last_rejected {
            Some(candidate) => {
                let warning = match &stopped_by {
                    Some(err) => format!(
                        "{}: kept unvalidated image, generation stopped at attempt {}: {err}",
                        angle.as_str(),
                        result.attempts
                    ),
                    None => format!(
                        "{}: kept unvalidated image after {} attempts",
                        angle.as_str(),
                        result.attempts
                    ),
                };
                report.warnings.push(warning);
                result.error = None;
                StageOutput {
                    image: Some(candidate),
                    result,
                }
            }
            None => {
                result.error =
                    Some(stopped_by.unwrap_or_else(|| "no usable image generated".into()));
                StageOutput {
                    image: None,
                    result,
                }
            }
        }
    }

    async fn upload(
        &self,
        scratch: &Path,
        folder: &str,
        stamp: &str,
        image: &InlineImage,
        result: &mut StageResult,
    ) {
        let bytes = imaging::decode(&image.data)
            .and_then(|decoded| imaging::encode_png(&decoded))
            .unwrap_or_else(|_| image.data.clone());
        let key = format!("products/{folder}/{stamp}_{}.png", result.angle.as_str());
        let asset = match ImageAsset::create(scratch, result.angle, &bytes) {
            Ok(asset) => asset,
            Err(err) => {
                result.error = Some(format!("temp file failed: {err}"));
                return;
            }
        };
        let uploaded = self.store.upload(asset.path(), &key).await;
        asset.discard();
        match uploaded {
            Ok(url) => {
                debug!(target = "vitrine.synthesis", key = %key, "image_uploaded");
                result.url = Some(url);
            }
            Err(err) => {
                warn!(target = "vitrine.synthesis", key = %key, error = %err, "image_upload_failed");
                result.error = Some(format!("upload failed: {err}"));
            }
        }
    }
}

/// Largest inline payload that is big enough and decodes as an image.
pub fn select_payload(images: &[InlineImage]) -> Option<InlineImage> {
    images
        .iter()
        .filter(|image| image.data.len() >= MIN_PAYLOAD_BYTES)
        .filter(|image| imaging::is_decodable(&image.data))
        .max_by_key(|image| image.data.len())
        .cloned()
}

/// Storage folder: `produto_<id>_<name>` when an id is known, else the name.
/// Accented Latin letters are folded to ASCII; other symbols are dropped.
pub fn folder_name(product_name: &str, product_id: Option<&str>) -> String {
    let mut name = String::new();
    for ch in product_name.trim().chars().map(fold_accent) {
        if ch.is_ascii_alphanumeric() {
            name.push(ch);
        } else if (ch.is_whitespace() || ch == '_' || ch == '-') && !name.ends_with('_') {
            name.push('_');
        }
    }
    let name: String = name.trim_matches('_').chars().take(60).collect();
    let name = name.trim_end_matches('_');
    match (product_id.map(str::trim).filter(|id| !id.is_empty()), name.is_empty()) {
        (Some(id), true) => format!("produto_{id}"),
        (Some(id), false) => format!("produto_{id}_{name}"),
        (None, true) => "produto".to_string(),
        (None, false) => name.to_string(),
    }
}

fn fold_accent(ch: char) -> char {
    match ch {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ç' => 'c',
        'Ç' => 'C',
        'ñ' => 'n',
        'Ñ' => 'N',
        other => other,
    }
}
