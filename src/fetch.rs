use crate::http::{build_browser_client, timeout_from_env};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct HtmlDocument {
    pub url: String,
    pub body: String,
}

/// Single-shot page and image downloader. Callers own any retry policy.
#[derive(Clone)]
pub struct HtmlFetcher {
    http: Client,
}

impl HtmlFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: build_browser_client(timeout),
        }
    }

    pub fn from_env() -> Self {
        Self::new(timeout_from_env())
    }

    pub async fn fetch(&self, url: &str) -> Result<HtmlDocument, FetchError> {
        let parsed = validate_url(url)?;
        let response = self.send(parsed).await?;
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        debug!(target = "vitrine.fetch", url = %url, bytes = body.len(), "html_downloaded");
        Ok(HtmlDocument {
            url: url.to_string(),
            body,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = validate_url(url)?;
        let response = self.send(parsed).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn send(&self, url: Url) -> Result<reqwest::Response, FetchError> {
        let response = self.http.get(url.clone()).send().await.map_err(|err| {
            warn!(target = "vitrine.fetch", url = %url, error = %err, "fetch_transport_failed");
            FetchError::Transport(err.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            warn!(target = "vitrine.fetch", url = %url, status = status.as_u16(), "fetch_bad_status");
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

fn validate_url(raw: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(raw.trim()).map_err(|_| FetchError::InvalidUrl(raw.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(FetchError::InvalidUrl(raw.to_string()));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{BROWSER_ACCEPT_LANGUAGE, BROWSER_USER_AGENT};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    // Compares the raw header value; the stock matchers split on commas.
    fn raw_header(
        name: &'static str,
        expected: &'static str,
    ) -> impl Fn(&Request) -> bool + Send + Sync + 'static {
        move |request: &Request| {
            request
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                == Some(expected)
        }
    }

    #[tokio::test]
    async fn fetch_sends_browser_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/produto_123456"))
            .and(raw_header("accept-language", BROWSER_ACCEPT_LANGUAGE))
            .and(raw_header("user-agent", BROWSER_USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HtmlFetcher::new(Duration::from_secs(5));
        let doc = fetcher
            .fetch(&format!("{}/produto_123456", server.uri()))
            .await
            .expect("fetch");
        assert_eq!(doc.body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn fetch_reports_status_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HtmlFetcher::new(Duration::from_secs(5));
        let err = fetcher.fetch(&server.uri()).await.expect_err("should fail");
        assert_eq!(err, FetchError::Status(403));
    }

    #[tokio::test]
    async fn fetch_rejects_non_http_urls() {
        let fetcher = HtmlFetcher::new(Duration::from_secs(5));
        let err = fetcher.fetch("ftp://example.com/a").await.expect_err("reject");
        assert!(matches!(err, FetchError::InvalidUrl(_)));
        let err = fetcher.fetch("not a url").await.expect_err("reject");
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
