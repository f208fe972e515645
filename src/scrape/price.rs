use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;

/// Context radius (in characters) inspected around a price for installment markers.
pub const CONTEXT_RADIUS: usize = 40;

static CURRENCY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"R\$(?:\s|&nbsp;)*(\d[\d.]*)(?:,(\d{2}))?").expect("currency regex")
});

static INSTALLMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b\d{1,2}\s*x\b|parcelad|parcela|sem\s+juros").expect("installment regex")
});

// Block-level tags and line breaks end the text a price belongs to.
static CONTEXT_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(?:p|div|li|ul|ol|tr|td|th|dd|dt|section|article|h[1-6])\b[^>]*>|<br\s*/?>|\n")
        .expect("context break regex")
});

/// Brazilian real amount held as integer centavos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BrlPrice {
    cents: u64,
}

impl BrlPrice {
    pub fn from_cents(cents: u64) -> Self {
        Self { cents }
    }

    pub fn cents(&self) -> u64 {
        self.cents
    }

    pub fn as_f64(&self) -> f64 {
        self.cents as f64 / 100.0
    }

    /// Parses display text such as `R$ 1.190,43`, `1.190,43` or `R$ 104`.
    pub fn parse_display(text: &str) -> Option<Self> {
        let caps = CURRENCY_RE.captures(text)?;
        from_parts(caps.get(1)?.as_str(), caps.get(2).map(|m| m.as_str()))
    }

    /// Parses machine formats found in structured data (`1190.43`, `"1190"`,
    /// occasionally `"1.190,43"`).
    pub fn parse_decimal(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.contains(',') || raw.contains("R$") {
            let prefixed = if raw.contains("R$") {
                raw.to_string()
            } else {
                format!("R$ {raw}")
            };
            return Self::parse_display(&prefixed);
        }
        let value: f64 = raw.parse().ok()?;
        Self::from_f64(value)
    }

    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value <= 0.0 {
            return None;
        }
        Some(Self {
            cents: (value * 100.0).round() as u64,
        })
    }
}

impl fmt::Display for BrlPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = (self.cents / 100).to_string();
        let mut grouped = String::with_capacity(units.len() + units.len() / 3);
        for (idx, ch) in units.chars().enumerate() {
            if idx > 0 && (units.len() - idx) % 3 == 0 {
                grouped.push('.');
            }
            grouped.push(ch);
        }
        write!(f, "R$ {},{:02}", grouped, self.cents % 100)
    }
}

impl Serialize for BrlPrice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

fn from_parts(integer: &str, decimals: Option<&str>) -> Option<BrlPrice> {
    let digits: String = integer.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let units: u64 = digits.parse().ok()?;
    let fraction: u64 = decimals.map(str::parse).transpose().ok()?.unwrap_or(0);
    let cents = units.checked_mul(100)?.checked_add(fraction)?;
    Some(BrlPrice { cents })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriceConfidence {
    #[default]
    High,
    /// Picked from the first currency-looking text because every candidate was filtered out.
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciledPrice {
    pub price: BrlPrice,
    pub confidence: PriceConfidence,
}

/// Returns the canonical display string of the highest genuine price among
/// `candidates`, each of which may carry its surrounding text.
pub fn reconcile<S: AsRef<str>>(candidates: &[S]) -> Option<String> {
    reconcile_detailed(candidates).map(|found| found.price.to_string())
}

pub fn reconcile_detailed<S: AsRef<str>>(candidates: &[S]) -> Option<ReconciledPrice> {
    let mut genuine = Vec::new();
    for candidate in candidates {
        genuine.extend(genuine_prices_in(candidate.as_ref()));
    }
    if let Some(price) = highest(&genuine) {
        return Some(ReconciledPrice {
            price,
            confidence: PriceConfidence::High,
        });
    }
    candidates
        .iter()
        .find_map(|candidate| first_currency(candidate.as_ref()))
        .map(|price| ReconciledPrice {
            price,
            confidence: PriceConfidence::Low,
        })
}

/// Same rule applied to a whole document: `patterns` locate price text (first
/// capture group, or the whole match), `structured` holds prices already read
/// from JSON-LD offers.
pub fn reconcile_document(
    html: &str,
    patterns: &[Regex],
    structured: &[BrlPrice],
) -> Option<ReconciledPrice> {
    let mut genuine: Vec<BrlPrice> = structured.to_vec();
    for pattern in patterns {
        for caps in pattern.captures_iter(html) {
            let Some(found) = caps.get(1).or_else(|| caps.get(0)) else {
                continue;
            };
            let Some(price) = BrlPrice::parse_display(found.as_str()) else {
                continue;
            };
            if is_installment(html, found.start(), found.end()) {
                continue;
            }
            genuine.push(price);
        }
    }
    if let Some(price) = highest(&genuine) {
        return Some(ReconciledPrice {
            price,
            confidence: PriceConfidence::High,
        });
    }
    first_currency(html).map(|price| ReconciledPrice {
        price,
        confidence: PriceConfidence::Low,
    })
}

fn genuine_prices_in(text: &str) -> Vec<BrlPrice> {
    CURRENCY_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            if is_installment(text, whole.start(), whole.end()) {
                return None;
            }
            from_parts(caps.get(1)?.as_str(), caps.get(2).map(|m| m.as_str()))
        })
        .collect()
}

fn first_currency(text: &str) -> Option<BrlPrice> {
    CURRENCY_RE.captures_iter(text).find_map(|caps| {
        from_parts(caps.get(1)?.as_str(), caps.get(2).map(|m| m.as_str()))
    })
}

// Strictly-greater comparison keeps the first of equal values.
fn highest(prices: &[BrlPrice]) -> Option<BrlPrice> {
    let mut best: Option<BrlPrice> = None;
    for price in prices {
        if best.is_none_or(|current| price.cents > current.cents) {
            best = Some(*price);
        }
    }
    best
}

/// Looks for installment markers within `CONTEXT_RADIUS` characters of the
/// price, without crossing into a neighbouring block or line. A cash price
/// printed right above an installment line stays genuine.
fn is_installment(text: &str, start: usize, end: usize) -> bool {
    let before_start = text[..start]
        .char_indices()
        .rev()
        .nth(CONTEXT_RADIUS - 1)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    let after_end = text[end..]
        .char_indices()
        .nth(CONTEXT_RADIUS)
        .map(|(idx, _)| end + idx)
        .unwrap_or(text.len());
    let before = &text[before_start..start];
    let before = CONTEXT_BREAK
        .find_iter(before)
        .last()
        .map_or(before, |m| &before[m.end()..]);
    let after = &text[end..after_end];
    let after = CONTEXT_BREAK.find(after).map_or(after, |m| &after[..m.start()]);
    INSTALLMENT_RE.is_match(&format!("{before}{}{after}", &text[start..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installment_is_excluded_by_pattern() {
        let out = reconcile(&["R$ 100,00 à vista", "R$ 34,67 em até 3x"]);
        assert_eq!(out.as_deref(), Some("R$ 100,00"));
    }

    #[test]
    fn installment_exclusion_is_not_about_magnitude() {
        // The installment-tagged value is the larger one and still loses.
        let out = reconcile(&["R$ 89,90", "10x de R$ 1.999,00 sem juros"]);
        assert_eq!(out.as_deref(), Some("R$ 89,90"));
    }

    #[test]
    fn picks_maximum_not_first() {
        let out = reconcile(&["R$ 99,90", "R$ 149,90"]);
        assert_eq!(out.as_deref(), Some("R$ 149,90"));
    }

    #[test]
    fn falls_back_to_first_currency_with_low_confidence() {
        let found = reconcile_detailed(&["3x de R$ 40,00", "parcelado R$ 120,00"]).expect("price");
        assert_eq!(found.price.to_string(), "R$ 40,00");
        assert_eq!(found.confidence, PriceConfidence::Low);
    }

    #[test]
    fn no_currency_yields_none() {
        assert_eq!(reconcile(&["sem preço", ""]), None);
    }

    #[test]
    fn parses_locale_formats() {
        assert_eq!(BrlPrice::parse_display("R$ 1.190,43").unwrap().cents(), 119_043);
        assert_eq!(BrlPrice::parse_display("R$104").unwrap().cents(), 10_400);
        assert_eq!(
            BrlPrice::parse_display("R$&nbsp;12.345.678,09").unwrap().cents(),
            1_234_567_809
        );
        assert_eq!(BrlPrice::parse_decimal("1190.43").unwrap().cents(), 119_043);
        assert_eq!(BrlPrice::parse_decimal("1.190,43").unwrap().cents(), 119_043);
        assert_eq!(BrlPrice::parse_decimal("0"), None);
    }

    #[test]
    fn display_groups_thousands() {
        assert_eq!(BrlPrice::from_cents(5).to_string(), "R$ 0,05");
        assert_eq!(BrlPrice::from_cents(99_990).to_string(), "R$ 999,90");
        assert_eq!(BrlPrice::from_cents(119_043).to_string(), "R$ 1.190,43");
        assert_eq!(BrlPrice::from_cents(123_456_789).to_string(), "R$ 1.234.567,89");
    }

    #[test]
    fn document_mode_combines_structured_and_patterns() {
        let html = r#"<span class="heading-lg">R$ 1.290,00</span> <p>ou 10x de R$ 129,00 sem juros</p>"#;
        let patterns = vec![Regex::new(r"(R\$\s*[\d.]+,\d{2})").unwrap()];
        let structured = vec![BrlPrice::from_cents(119_000)];
        let found = reconcile_document(html, &patterns, &structured).expect("price");
        assert_eq!(found.price.to_string(), "R$ 1.290,00");
        assert_eq!(found.confidence, PriceConfidence::High);
    }

    #[test]
    fn cash_price_above_installment_line_stays_genuine() {
        let html = r#"<div class="price"><span>R$ 389,90</span><p>ou 10x de R$ 38,99</p></div>"#;
        let patterns = vec![Regex::new(r"(R\$\s*[\d.]+,\d{2})").unwrap()];
        let found = reconcile_document(html, &patterns, &[]).expect("price");
        assert_eq!(found.price.to_string(), "R$ 389,90");
        assert_eq!(found.confidence, PriceConfidence::High);
    }

    #[test]
    fn installment_line_before_cash_price_does_not_taint_it() {
        let html = "<p>ou 10x de R$ 38,99</p><span>R$ 389,90</span>";
        let patterns = vec![Regex::new(r"(R\$\s*[\d.]+,\d{2})").unwrap()];
        let found = reconcile_document(html, &patterns, &[]).expect("price");
        assert_eq!(found.price.to_string(), "R$ 389,90");
        assert_eq!(found.confidence, PriceConfidence::High);
    }

    #[test]
    fn installment_marker_in_same_block_still_excludes() {
        let html = "<p>10x de <strong>R$ 1.999,00</strong> sem juros</p><p>R$ 89,90</p>";
        let patterns = vec![Regex::new(r"(R\$\s*[\d.]+,\d{2})").unwrap()];
        let found = reconcile_document(html, &patterns, &[]).expect("price");
        assert_eq!(found.price.to_string(), "R$ 89,90");
    }

    #[test]
    fn equal_values_keep_first_occurrence() {
        let prices = [BrlPrice::from_cents(100), BrlPrice::from_cents(100)];
        assert_eq!(highest(&prices), Some(BrlPrice::from_cents(100)));
    }
}
