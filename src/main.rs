use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use vitrine::config::{PipelineConfig, env_string};
use vitrine::llm::GeminiClient;
use vitrine::models::BatchRequest;
use vitrine::pipeline::Pipeline;
use vitrine::storage::{LocalDirStore, ObjectStore, TracingUsageLog, UsageLogSink};
use vitrine::supabase::SupabaseClient;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "vitrine.runner", "batch failed: {err:?}");
        std::process::exit(1);
    }
}

/// Reads a batch request (JSON file given as the first argument, or stdin),
/// runs it and prints the batch response to stdout.
async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let raw = read_request(std::env::args().nth(1)).await?;
    let request: BatchRequest =
        serde_json::from_str(&raw).wrap_err("batch request is not valid JSON")?;

    let config = PipelineConfig::from_env();
    if config.gemini.api_key.is_none() {
        warn!(target = "vitrine.runner", "gemini_api_key_missing");
    }
    let model = Arc::new(GeminiClient::new(config.gemini.clone()));
    let (store, usage_log): (Arc<dyn ObjectStore>, Arc<dyn UsageLogSink>) =
        match SupabaseClient::from_env() {
            Some(client) => {
                let client = Arc::new(client);
                (client.clone(), client)
            }
            None => {
                let root = env_string("LOCAL_OUTPUT_DIR").unwrap_or_else(|| "output".into());
                info!(target = "vitrine.runner", root = %root, "using_local_storage");
                (Arc::new(LocalDirStore::new(root)), Arc::new(TracingUsageLog))
            }
        };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(target = "vitrine.runner", "interrupt_received");
                cancel.cancel();
            }
        }
    });

    let pipeline = Pipeline::new(&config, model, store, cancel).with_usage_log(usage_log);
    let response = pipeline.run(request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn read_request(path: Option<String>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .wrap_err_with(|| format!("cannot read {path}")),
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .wrap_err("cannot read stdin")?;
            Ok(raw)
        }
    }
}

// Logs go to stderr so stdout carries only the response JSON.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
