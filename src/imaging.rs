use crate::llm::InlineImage;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Crops smaller than this share of the frame are ignored.
pub const MIN_CROP_AREA_RATIO: f64 = 0.03;
pub const MIN_CROP_AREA_PX: u64 = 5_000;
pub const CROP_PADDING: f64 = 0.05;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Detected product region, coordinates normalised to 0..=1000 as
/// `[ymin, xmin, ymax, xmax]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductBox {
    #[serde(default)]
    pub label: String,
    #[serde(rename = "bbox", alias = "box_2d")]
    pub bbox: [f64; 4],
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImagingError> {
    image::load_from_memory(bytes).map_err(|err| ImagingError::Decode(err.to_string()))
}

pub fn is_decodable(bytes: &[u8]) -> bool {
    decode(bytes).is_ok()
}

pub fn mime_type_of(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Gif) => "image/gif",
        _ => "image/jpeg",
    }
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, ImagingError> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| ImagingError::Encode(err.to_string()))?;
    Ok(buffer.into_inner())
}

pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, ImagingError> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, ImageFormat::Jpeg)
        .map_err(|err| ImagingError::Encode(err.to_string()))?;
    Ok(buffer.into_inner())
}

/// Shrinks so the longest side is at most `max_side`, keeping aspect ratio.
pub fn downscale(image: DynamicImage, max_side: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width.max(height) <= max_side {
        return image;
    }
    image.resize(max_side, max_side, FilterType::Lanczos3)
}

/// Decodes, downscales and re-encodes as JPEG for submission to a model.
pub fn prepare_for_model(bytes: &[u8], max_side: u32) -> Result<InlineImage, ImagingError> {
    let image = downscale(decode(bytes)?, max_side);
    Ok(InlineImage::new("image/jpeg", encode_jpeg(&image)?))
}

/// Same as [`prepare_for_model`] but lossless, for sources that feed generation.
pub fn prepare_png(image: DynamicImage, max_side: u32) -> Result<InlineImage, ImagingError> {
    let image = downscale(image, max_side);
    Ok(InlineImage::new("image/png", encode_png(&image)?))
}

/// Crops `image` to the largest box that is big enough to be the product,
/// with padding. `None` when no box qualifies.
pub fn crop_to_largest_box(image: &DynamicImage, boxes: &[ProductBox]) -> Option<DynamicImage> {
    let (width, height) = image.dimensions();
    let frame = width as f64 * height as f64;
    if frame <= 0.0 {
        return None;
    }
    let best = boxes
        .iter()
        .filter_map(|product| pixel_rect(product, width, height))
        .filter(|rect| {
            let area = rect.area() as f64;
            area / frame >= MIN_CROP_AREA_RATIO && rect.area() >= MIN_CROP_AREA_PX
        })
        .max_by_key(|rect| rect.area())?;
    let padded = best.padded(CROP_PADDING, width, height);
    Some(image.crop_imm(padded.x, padded.y, padded.w, padded.h))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

impl Rect {
    fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    fn padded(&self, ratio: f64, max_w: u32, max_h: u32) -> Rect {
        let pad_x = (self.w as f64 * ratio).round() as u32;
        let pad_y = (self.h as f64 * ratio).round() as u32;
        let x = self.x.saturating_sub(pad_x);
        let y = self.y.saturating_sub(pad_y);
        let right = (self.x + self.w + pad_x).min(max_w);
        let bottom = (self.y + self.h + pad_y).min(max_h);
        Rect {
            x,
            y,
            w: right - x,
            h: bottom - y,
        }
    }
}

fn pixel_rect(product: &ProductBox, width: u32, height: u32) -> Option<Rect> {
    let [ymin, xmin, ymax, xmax] = product.bbox.map(|v| v.clamp(0.0, 1000.0) / 1000.0);
    if ymax <= ymin || xmax <= xmin {
        return None;
    }
    let x = (xmin * width as f64).round() as u32;
    let y = (ymin * height as f64).round() as u32;
    let right = ((xmax * width as f64).round() as u32).min(width);
    let bottom = ((ymax * height as f64).round() as u32).min(height);
    (right > x && bottom > y).then_some(Rect {
        x,
        y,
        w: right - x,
        h: bottom - y,
    })
}

#[cfg(test)]
pub mod testing {
    use image::{DynamicImage, Rgb, RgbImage};

    /// Solid-colour PNG of the given size.
    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
        super::encode_png(&DynamicImage::ImageRgb8(image)).expect("encode")
    }

    /// PNG with per-pixel noise so the encoded size stays above small thresholds.
    pub fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(31) ^ y.wrapping_mul(17)).wrapping_mul(2_654_435_761);
            Rgb([(v >> 8) as u8, (v >> 16) as u8, (v >> 24) as u8])
        });
        super::encode_png(&DynamicImage::ImageRgb8(image)).expect("encode")
    }
}
