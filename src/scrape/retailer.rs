use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Store {
    LeroyMerlin,
    Sodimac,
    Decathlon,
    /// Photo-only store: products arrive as uploaded pictures, never as URLs.
    SamsClub,
    Generic,
}

impl Store {
    pub fn as_str(&self) -> &'static str {
        match self {
            Store::LeroyMerlin => "leroy_merlin",
            Store::Sodimac => "sodimac",
            Store::Decathlon => "decathlon",
            Store::SamsClub => "sams_club",
            Store::Generic => "generic",
        }
    }

    pub fn from_url(raw: &str) -> Store {
        let host = Url::parse(raw)
            .ok()
            .and_then(|url| url.host_str().map(str::to_lowercase))
            .unwrap_or_default();
        if host.contains("leroymerlin") {
            Store::LeroyMerlin
        } else if host.contains("sodimac") {
            Store::Sodimac
        } else if host.contains("decathlon") {
            Store::Decathlon
        } else if host.contains("samsclub") {
            Store::SamsClub
        } else {
            Store::Generic
        }
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Regex that either captures a barcode in group 1 or, when `declares_null`
/// is set, matches a page that explicitly states there is none.
pub struct BarcodePattern {
    pub regex: Regex,
    pub declares_null: bool,
}

/// Per-retailer knowledge the extractor needs. Implementations are plain
/// pattern tables; the extraction algorithm itself is shared.
pub trait RetailerAdapter: Send + Sync {
    fn store(&self) -> Store;

    /// Image hosts whose `<img>` and inline-script URLs count as gallery candidates.
    /// Empty means any absolute image URL is accepted.
    fn cdn_prefixes(&self) -> &[&'static str];

    /// Substring that marks a high-resolution variant.
    fn hires_token(&self) -> Option<&'static str>;

    /// Patterns whose first capture group is price text.
    fn price_patterns(&self) -> &[Regex];

    /// Patterns whose first capture group is a brand name.
    fn brand_patterns(&self) -> &[Regex];

    fn barcode_patterns(&self) -> &[BarcodePattern];

    /// Store-specific identifier pattern; `None` falls back to the generic rule.
    fn product_id_pattern(&self) -> Option<&Regex>;

    fn product_id(&self, page_url: &str) -> Option<String> {
        if let Some(pattern) = self.product_id_pattern()
            && let Some(found) = pattern.captures(page_url).and_then(|caps| caps.get(1))
        {
            return Some(found.as_str().to_string());
        }
        generic_product_id(page_url)
    }
}

pub struct RetailerProfile {
    store: Store,
    cdn_prefixes: Vec<&'static str>,
    hires_token: Option<&'static str>,
    price_patterns: Vec<Regex>,
    brand_patterns: Vec<Regex>,
    barcode_patterns: Vec<BarcodePattern>,
    product_id_pattern: Option<Regex>,
}

impl RetailerAdapter for RetailerProfile {
    fn store(&self) -> Store {
        self.store
    }

    fn cdn_prefixes(&self) -> &[&'static str] {
        &self.cdn_prefixes
    }

    fn hires_token(&self) -> Option<&'static str> {
        self.hires_token
    }

    fn price_patterns(&self) -> &[Regex] {
        &self.price_patterns
    }

    fn brand_patterns(&self) -> &[Regex] {
        &self.brand_patterns
    }

    fn barcode_patterns(&self) -> &[BarcodePattern] {
        &self.barcode_patterns
    }

    fn product_id_pattern(&self) -> Option<&Regex> {
        self.product_id_pattern.as_ref()
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("retailer pattern")
}

fn barcode(pattern: &str) -> BarcodePattern {
    BarcodePattern {
        regex: re(pattern),
        declares_null: false,
    }
}

fn barcode_null(pattern: &str) -> BarcodePattern {
    BarcodePattern {
        regex: re(pattern),
        declares_null: true,
    }
}

const BRAND_JSON: &str = r#""brand"\s*:\s*"([^"]+)""#;
const BRAND_SCHEMA: &str = r#""@type"\s*:\s*"Brand"\s*,\s*"name"\s*:\s*"([^"]+)""#;
const EAN_JSON: &str = r#""ean"\s*:\s*"(\d{8,14})""#;
const EAN_JSON_ESCAPED: &str = r#"\\"ean\\"\s*:\s*\\"(\d{8,14})\\""#;
const EAN_JSON_NULL: &str = r#""ean"\s*:\s*null"#;

static LEROY_MERLIN: Lazy<RetailerProfile> = Lazy::new(|| RetailerProfile {
    store: Store::LeroyMerlin,
    cdn_prefixes: vec!["https://cdn.leroymerlin.com.br/products"],
    hires_token: Some("1800x1800"),
    price_patterns: vec![
        re(r"(?i)(R\$\s*[\d.]+,\d{2})\s*(?:<[^>]*>\s*)*(?:à|a)\s+vista"),
        re(r"(?i)(R\$\s*[\d.]+,\d{2})\s*(?:<[^>]*>\s*)*a\s+prazo"),
        re(r#"heading-(?:lg|xl|2xl|md)[^>]*>\s*(R\$\s*[\d.]+,\d{2})"#),
    ],
    brand_patterns: vec![re(BRAND_JSON), re(BRAND_SCHEMA)],
    barcode_patterns: vec![
        barcode(EAN_JSON),
        barcode(EAN_JSON_ESCAPED),
        barcode_null(EAN_JSON_NULL),
    ],
    product_id_pattern: None,
});

static SODIMAC: Lazy<RetailerProfile> = Lazy::new(|| RetailerProfile {
    store: Store::Sodimac,
    cdn_prefixes: vec!["https://media.falabella.com/sodimacBR/"],
    hires_token: None,
    price_patterns: vec![re(
        r#"class="[^"]*price-value[^"]*"[^>]*>\s*(?:<[^>]*>\s*)*(R\$\s*[\d.]+(?:,\d{2})?)"#,
    )],
    brand_patterns: vec![re(BRAND_JSON), re(BRAND_SCHEMA)],
    barcode_patterns: vec![barcode(EAN_JSON), barcode_null(EAN_JSON_NULL)],
    product_id_pattern: Some(re(r"/product/(\d+)")),
});

static DECATHLON: Lazy<RetailerProfile> = Lazy::new(|| RetailerProfile {
    store: Store::Decathlon,
    cdn_prefixes: vec!["https://contents.mediadecathlon.com/"],
    hires_token: None,
    price_patterns: Vec::new(),
    brand_patterns: vec![re(BRAND_SCHEMA)],
    barcode_patterns: vec![
        barcode(r#"technical-description\\?">(\d{13})"#),
        barcode(r"(?s)Códigos EAN13 do produto.*?(\d{13})"),
    ],
    product_id_pattern: None,
});

static GENERIC: Lazy<RetailerProfile> = Lazy::new(|| RetailerProfile {
    store: Store::Generic,
    cdn_prefixes: Vec::new(),
    hires_token: None,
    price_patterns: Vec::new(),
    brand_patterns: vec![re(BRAND_SCHEMA)],
    barcode_patterns: vec![barcode(EAN_JSON)],
    product_id_pattern: None,
});

/// Adapter for a store. Stores without page scraping support get the generic table.
pub fn adapter_for(store: Store) -> &'static dyn RetailerAdapter {
    match store {
        Store::LeroyMerlin => &*LEROY_MERLIN,
        Store::Sodimac => &*SODIMAC,
        Store::Decathlon => &*DECATHLON,
        Store::SamsClub | Store::Generic => &*GENERIC,
    }
}

static NUMERIC_TOKEN: Lazy<Regex> = Lazy::new(|| re(r"\d{5,}"));

/// Longest numeric run of at least five digits in the URL path, else the
/// last path segment's trailing `_`-separated token.
pub fn generic_product_id(page_url: &str) -> Option<String> {
    let path = Url::parse(page_url)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| page_url.to_string());
    let mut best: Option<&str> = None;
    for found in NUMERIC_TOKEN.find_iter(&path) {
        if best.is_none_or(|current| found.as_str().len() > current.len()) {
            best = Some(found.as_str());
        }
    }
    if let Some(id) = best {
        return Some(id.to_string());
    }
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    let token = segment.rsplit('_').next().unwrap_or(segment).trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_detection_by_host() {
        assert_eq!(
            Store::from_url("https://www.leroymerlin.com.br/furadeira_1567895"),
            Store::LeroyMerlin
        );
        assert_eq!(
            Store::from_url("https://www.sodimac.com.br/sodimac-br/product/123456/x"),
            Store::Sodimac
        );
        assert_eq!(Store::from_url("https://loja.exemplo.com/p"), Store::Generic);
    }

    #[test]
    fn product_id_prefers_store_pattern() {
        let adapter = adapter_for(Store::Sodimac);
        assert_eq!(
            adapter
                .product_id("https://www.sodimac.com.br/sodimac-br/product/110404/tinta-acrilica-18l/110404999")
                .as_deref(),
            Some("110404")
        );
    }

    #[test]
    fn generic_id_picks_longest_numeric_token() {
        assert_eq!(
            generic_product_id("https://www.leroymerlin.com.br/kit-12345-lixas_91234567").as_deref(),
            Some("91234567")
        );
        assert_eq!(
            generic_product_id("https://loja.com/p/cadeira_azul").as_deref(),
            Some("azul")
        );
    }

    #[test]
    fn decathlon_barcode_from_technical_markup() {
        let adapter = adapter_for(Store::Decathlon);
        let html = r#"<div class="technical-description">7891234567895</div>"#;
        let hit = adapter
            .barcode_patterns()
            .iter()
            .find_map(|p| p.regex.captures(html))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        assert_eq!(hit.as_deref(), Some("7891234567895"));
    }
}
