use crate::config::env_string;
use crate::http::build_client;
use crate::storage::{ObjectStore, SinkError, StorageError, UsageLogEntry, UsageLogSink};
use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use tracing::debug;

/// Supabase Storage for generated images and PostgREST for the usage log.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    bucket: String,
    log_table: String,
    http: Client,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = env_string("SUPABASE_URL")?;
        let service_key = env_string("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|| env_string("SUPABASE_SERVICE_KEY"))
            .or_else(|| env_string("SUPABASE_KEY"))?;
        Some(Self::new(
            &base_url,
            service_key,
            env_string("SUPABASE_STORAGE_BUCKET").unwrap_or_else(|| "product-images".into()),
            env_string("SUPABASE_LOG_TABLE").unwrap_or_else(|| "scraping_logs".into()),
        ))
    }

    pub fn new(base_url: &str, service_key: String, bucket: String, log_table: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            bucket,
            log_table,
            http: build_client(),
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, key
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }
}

#[async_trait]
impl ObjectStore for SupabaseClient {
    async fn upload(&self, local_path: &Path, destination_key: &str) -> Result<String, StorageError> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|err| StorageError::Io(err.to_string()))?;
        let key = destination_key.trim_start_matches('/');
        let url = format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url, self.bucket, key
        );
        let response = self
            .authorized(self.http.post(url))
            .header("Content-Type", "image/png")
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|err| StorageError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(target = "vitrine.supabase", key = %key, "object_uploaded");
        Ok(self.public_url(key))
    }
}

#[async_trait]
impl UsageLogSink for SupabaseClient {
    async fn record(&self, entry: &UsageLogEntry) -> Result<(), SinkError> {
        let url = format!("{}/rest/v1/{}", self.base_url, self.log_table);
        let response = self
            .authorized(self.http.post(url))
            .header("Prefer", "return=minimal")
            .json(entry)
            .send()
            .await
            .map_err(|err| SinkError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_bytes, body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> SupabaseClient {
        SupabaseClient::new(
            &server.uri(),
            "service-key".into(),
            "imagens".into(),
            "scraping_logs".into(),
        )
    }

    #[tokio::test]
    async fn upload_posts_bytes_and_returns_public_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/imagens/products/p/1_front_view.png"))
            .and(header("apikey", "service-key"))
            .and(header("authorization", "Bearer service-key"))
            .and(body_bytes(b"png-bytes".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Key": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"png-bytes").unwrap();
        let url = client(&server)
            .upload(file.path(), "products/p/1_front_view.png")
            .await
            .expect("upload");
        assert_eq!(
            url,
            format!("{}/storage/v1/object/public/imagens/products/p/1_front_view.png", server.uri())
        );
    }

    #[tokio::test]
    async fn upload_failure_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413).set_body_string("too large"))
            .mount(&server)
            .await;
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = client(&server)
            .upload(file.path(), "k.png")
            .await
            .expect_err("413");
        assert!(matches!(err, StorageError::Status { status: 413, .. }));
    }

    #[tokio::test]
    async fn usage_log_inserts_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/scraping_logs"))
            .and(body_json(json!({
                "loja": "sodimac",
                "url_count": 3,
                "total_tokens": 4200,
                "total_cost_brl": 0.012
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        let entry = UsageLogEntry {
            store: "sodimac".into(),
            item_count: 3,
            total_tokens: 4200,
            total_cost: 0.012,
        };
        client(&server).record(&entry).await.expect("record");
    }
}
