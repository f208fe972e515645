use super::retailer::RetailerAdapter;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

pub const MAX_IMAGES: usize = 10;

const IMG_ATTRS: [&str; 6] = ["src", "data-src", "srcset", "data-srcset", "data-zoom", "data-lazy"];

/// Unescapes, percent-decodes and absolutizes an image reference. Returns
/// `None` for inline data and non-HTTP schemes.
pub fn normalize_image_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let unescaped = raw.trim().replace("\\/", "/").replace("\\u002F", "/");
    if unescaped.is_empty() || unescaped.starts_with("data:") {
        return None;
    }
    let decoded = urlencoding::decode(&unescaped)
        .map(|cow| cow.into_owned())
        .unwrap_or(unescaped);
    let resolved = match Url::parse(&decoded) {
        Ok(url) => url,
        Err(_) => base?.join(&decoded).ok()?,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

/// Gathers gallery candidates in priority order: structured data, `<img>`
/// attributes on the retailer CDN, CDN URLs embedded in scripts, then `og:image`.
pub fn collect_candidates(
    document: &Html,
    html: &str,
    page_url: Option<&Url>,
    adapter: &dyn RetailerAdapter,
    structured: &[String],
) -> Vec<String> {
    let prefixes = adapter.cdn_prefixes();
    let on_cdn = |url: &str| prefixes.is_empty() || prefixes.iter().any(|p| url.starts_with(p));
    let mut out = Vec::new();

    out.extend(
        structured
            .iter()
            .filter_map(|raw| normalize_image_url(raw, page_url)),
    );

    if let Ok(selector) = Selector::parse("img") {
        for img in document.select(&selector) {
            for attr in IMG_ATTRS {
                let Some(value) = img.value().attr(attr) else {
                    continue;
                };
                let refs: Vec<&str> = if attr.ends_with("srcset") {
                    value
                        .split(',')
                        .filter_map(|entry| entry.split_whitespace().next())
                        .collect()
                } else {
                    vec![value]
                };
                out.extend(
                    refs.into_iter()
                        .filter_map(|raw| normalize_image_url(raw, page_url))
                        .filter(|url| on_cdn(url.as_str())),
                );
            }
        }
    }

    for prefix in prefixes {
        let pattern = format!(
            r#"{}(?:\\/|[^"'\s<>\\)])*"#,
            regex::escape(prefix).replace('/', r"\\?/")
        );
        if let Ok(regex) = Regex::new(&pattern) {
            out.extend(
                regex
                    .find_iter(html)
                    .filter_map(|found| normalize_image_url(found.as_str(), page_url)),
            );
        }
    }

    if let Ok(selector) = Selector::parse(r#"meta[property="og:image"]"#) {
        out.extend(
            document
                .select(&selector)
                .filter_map(|meta| meta.value().attr("content"))
                .filter_map(|raw| normalize_image_url(raw, page_url)),
        );
    }

    dedupe(out)
}

/// Keeps images that mention the product identifier (all of them when none
/// do), puts high-resolution variants first and caps the list.
pub fn select_gallery(
    candidates: Vec<String>,
    product_id: Option<&str>,
    hires_token: Option<&str>,
) -> Vec<String> {
    let relevant = filter_by_product_id(candidates, product_id);
    let mut ordered = prioritize_hires(relevant, hires_token);
    ordered.truncate(MAX_IMAGES);
    ordered
}

fn filter_by_product_id(candidates: Vec<String>, product_id: Option<&str>) -> Vec<String> {
    let Some(id) = product_id.filter(|id| !id.is_empty()) else {
        return candidates;
    };
    let matching: Vec<String> = candidates
        .iter()
        .filter(|url| url.contains(id))
        .cloned()
        .collect();
    if matching.is_empty() {
        candidates
    } else {
        matching
    }
}

fn prioritize_hires(candidates: Vec<String>, hires_token: Option<&str>) -> Vec<String> {
    let Some(token) = hires_token else {
        return candidates;
    };
    let (mut hires, rest): (Vec<String>, Vec<String>) =
        candidates.into_iter().partition(|url| url.contains(token));
    hires.extend(rest);
    hires
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}
