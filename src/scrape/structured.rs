use super::images::{collect_candidates, select_gallery};
use super::price::{BrlPrice, reconcile_document};
use super::retailer::RetailerAdapter;
use crate::models::{Barcode, PartialProductExtraction};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::debug;
use url::Url;

const PAGE_TEXT_LIMIT: usize = 4000;
const BARCODE_KEYS: [&str; 7] = ["gtin13", "gtin", "gtin14", "gtin12", "gtin8", "ean", "upc"];

/// Reads the deterministic part of a product page. Never fails: malformed
/// markup or JSON-LD only means fewer fields are filled.
pub fn extract(
    html: &str,
    page_url: &str,
    adapter: &dyn RetailerAdapter,
) -> PartialProductExtraction {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let nodes = product_nodes(&document);
    debug!(
        target = "vitrine.scrape",
        url = %page_url,
        store = %adapter.store(),
        product_nodes = nodes.len(),
        "structured_data_scanned"
    );

    let title = nodes
        .iter()
        .find_map(|node| non_empty_str(node.get("name")))
        .or_else(|| first_text(&document, "h1"))
        .or_else(|| meta_content(&document, r#"meta[property="og:title"]"#));

    let brand = nodes
        .iter()
        .find_map(|node| brand_of(node.get("brand")))
        .or_else(|| {
            adapter.brand_patterns().iter().find_map(|pattern| {
                pattern
                    .captures_iter(html)
                    .filter_map(|caps| caps.get(1))
                    .map(|m| m.as_str().trim().to_string())
                    .find(|name| is_meaningful(name))
            })
        });

    let barcode = nodes
        .iter()
        .map(barcode_of)
        .fold(Barcode::Missing, Barcode::merge);
    let barcode = if barcode.is_found() {
        barcode
    } else {
        barcode.merge(barcode_from_patterns(html, adapter))
    };

    let structured_prices: Vec<BrlPrice> = nodes
        .iter()
        .flat_map(|node| offer_prices(node.get("offers")))
        .collect();
    let price = reconcile_document(html, adapter.price_patterns(), &structured_prices);

    let mut specifications: Vec<String> = nodes
        .iter()
        .flat_map(|node| properties_of(node.get("additionalProperty")))
        .collect();
    if specifications.is_empty() {
        specifications = table_specifications(&document);
    }

    let structured_images: Vec<String> = nodes
        .iter()
        .flat_map(|node| image_refs(node.get("image")))
        .collect();
    let candidates = collect_candidates(&document, html, base.as_ref(), adapter, &structured_images);
    let product_id = adapter.product_id(page_url);
    let image_urls = select_gallery(candidates, product_id.as_deref(), adapter.hires_token());

    PartialProductExtraction {
        title,
        price,
        brand,
        barcode,
        specifications,
        image_urls,
        product_id,
        page_text: visible_text(&document),
    }
}

/// All JSON-LD nodes typed as a product, across every block, array and `@graph`.
fn product_nodes(document: &Html) -> Vec<Value> {
    let Ok(selector) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => collect_products(value, &mut out),
            Err(err) => {
                debug!(target = "vitrine.scrape", error = %err, "jsonld_block_unparseable");
            }
        }
    }
    out
}

fn collect_products(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_products(item, out);
            }
        }
        Value::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                collect_products(graph, out);
            }
            let value = Value::Object(map);
            if is_product(value.get("@type")) {
                out.push(value);
            }
        }
        _ => {}
    }
}

fn is_product(kind: Option<&Value>) -> bool {
    let matches = |s: &str| {
        let name = s.rsplit('/').next().unwrap_or(s);
        name.eq_ignore_ascii_case("product") || name.eq_ignore_ascii_case("productgroup")
    };
    match kind {
        Some(Value::String(s)) => matches(s),
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).any(matches),
        _ => false,
    }
}

fn is_meaningful(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("null")
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| is_meaningful(s))
}

fn brand_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| is_meaningful(s)),
        Value::Object(map) => non_empty_str(map.get("name")),
        Value::Array(items) => items.iter().find_map(|item| brand_of(Some(item))),
        _ => None,
    }
}

fn barcode_of(node: &Value) -> Barcode {
    let mut state = Barcode::Missing;
    for key in BARCODE_KEYS {
        let reading = match node.get(key) {
            None => Barcode::Missing,
            Some(Value::Null) => Barcode::DeclaredNull,
            Some(Value::String(s)) if is_meaningful(s) => Barcode::Found(s.trim().to_string()),
            Some(Value::String(_)) => Barcode::DeclaredNull,
            Some(Value::Number(n)) => Barcode::Found(n.to_string()),
            Some(_) => Barcode::Missing,
        };
        state = state.merge(reading);
    }
    state
}

fn barcode_from_patterns(html: &str, adapter: &dyn RetailerAdapter) -> Barcode {
    let mut state = Barcode::Missing;
    for pattern in adapter.barcode_patterns() {
        if pattern.declares_null {
            if pattern.regex.is_match(html) {
                state = state.merge(Barcode::DeclaredNull);
            }
        } else if let Some(code) = pattern.regex.captures(html).and_then(|caps| caps.get(1)) {
            return Barcode::Found(code.as_str().to_string());
        }
    }
    state
}

fn price_value(value: Option<&Value>) -> Option<BrlPrice> {
    match value? {
        Value::Number(n) => n.as_f64().and_then(BrlPrice::from_f64),
        Value::String(s) => BrlPrice::parse_decimal(s),
        _ => None,
    }
}

fn offer_prices(offers: Option<&Value>) -> Vec<BrlPrice> {
    match offers {
        Some(Value::Array(items)) => items
            .iter()
            .flat_map(|item| offer_prices(Some(item)))
            .collect(),
        Some(Value::Object(map)) => {
            let mut prices: Vec<BrlPrice> = ["price", "lowPrice", "highPrice"]
                .iter()
                .filter_map(|key| price_value(map.get(*key)))
                .collect();
            if let Some(nested) = map.get("offers") {
                prices.extend(offer_prices(Some(nested)));
            }
            prices
        }
        _ => Vec::new(),
    }
}

fn image_refs(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().flat_map(|i| image_refs(Some(i))).collect(),
        Some(Value::Object(map)) => non_empty_str(map.get("url")).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn properties_of(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = non_empty_str(item.get("name"))?;
            let value = match item.get("value") {
                Some(Value::String(s)) => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => return None,
            };
            Some(format!("{name}: {value}"))
        })
        .collect()
}

fn table_specifications(document: &Html) -> Vec<String> {
    let (Ok(rows), Ok(cells)) = (Selector::parse("table tr"), Selector::parse("th, td")) else {
        return Vec::new();
    };
    document
        .select(&rows)
        .filter_map(|row| {
            let texts: Vec<String> = row.select(&cells).map(element_text).collect();
            match texts.as_slice() {
                [name, value, ..] if !name.is_empty() && !value.is_empty() => {
                    Some(format!("{name}: {value}"))
                }
                _ => None,
            }
        })
        .collect()
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .map(element_text)
        .find(|text| !text.is_empty())
}

fn meta_content(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .filter_map(|meta| meta.value().attr("content"))
        .map(|content| content.trim().to_string())
        .find(|content| !content.is_empty())
}

/// Body text without scripts and styles, whitespace-collapsed and truncated.
fn visible_text(document: &Html) -> String {
    let Ok(body) = Selector::parse("body") else {
        return String::new();
    };
    let Some(body) = document.select(&body).next() else {
        return String::new();
    };
    let mut words: Vec<&str> = Vec::new();
    for node in body.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| el.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    let joined = words.join(" ");
    match joined.char_indices().nth(PAGE_TEXT_LIMIT) {
        Some((idx, _)) => joined[..idx].to_string(),
        None => joined,
    }
}
