use super::types::{ExtractReply, PageText, SummarizeReply, SummarizeRequest};
use super::OcrWorker;
use crate::config::Endpoints;
use crate::error::{OcrError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// HTTP client for a live worker. Wire shapes are decoded here, once; callers
/// only ever see `PageText` or a plain summary string.
pub struct HttpWorker {
    client: reqwest::Client,
    extract_url: String,
    summarize_url: String,
}

impl HttpWorker {
    pub fn new(cfg: &Endpoints, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            extract_url: format!("{}{}", base_url, cfg.extract_path),
            summarize_url: format!("{}{}", base_url, cfg.summarize_path),
        })
    }
}

#[async_trait]
impl OcrWorker for HttpWorker {
    async fn extract_text(&self, image: &[u8], file_name: &str) -> Result<PageText> {
        debug!(file_name, bytes = image.len(), "dispatching page image");

        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.extract_url)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        decode_reply::<ExtractReply>(status, &body)?
            .into_result()
            .map_err(OcrError::WorkerResponse)
    }

    async fn summarize(&self, text: &str, prompt: &str) -> Result<String> {
        debug!(chars = text.len(), "dispatching summarization request");

        let response = self
            .client
            .post(&self.summarize_url)
            .json(&SummarizeRequest { text, prompt })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        decode_reply::<SummarizeReply>(status, &body)?
            .into_result()
            .map_err(OcrError::WorkerResponse)
    }
}

/// Decode a reply body, accepting the error envelope on non-2xx statuses too
/// (the worker reports failures as `{error}` with a 4xx/5xx status).
fn decode_reply<T: serde::de::DeserializeOwned>(
    status: reqwest::StatusCode,
    body: &str,
) -> Result<T> {
    match serde_json::from_str::<T>(body) {
        Ok(reply) => Ok(reply),
        Err(_) if !status.is_success() => Err(OcrError::WorkerResponse(format!(
            "HTTP {status}: {}",
            body.chars().take(200).collect::<String>()
        ))),
        Err(e) => Err(OcrError::WorkerResponse(format!(
            "undecodable reply ({e}): {}",
            body.chars().take(200).collect::<String>()
        ))),
    }
}
