use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";
pub const BROWSER_ACCEPT_LANGUAGE: &str = "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7";

pub fn timeout_from_env() -> Duration {
    let secs = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(15);
    Duration::from_secs(secs)
}

fn connect_timeout_from_env() -> Duration {
    let secs = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Duration::from_secs(secs)
}

/// Client for API collaborators (LLM gateway, storage, usage log).
pub fn build_client() -> Client {
    Client::builder()
        .timeout(timeout_from_env())
        .connect_timeout(connect_timeout_from_env())
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Client that presents itself as a desktop browser; retailer sites block
/// obvious bots.
pub fn build_browser_client(timeout: Duration) -> Client {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static(BROWSER_ACCEPT_LANGUAGE),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .connect_timeout(connect_timeout_from_env())
        .build()
        .unwrap_or_else(|_| Client::new())
}
