//! OCR engines and the ordered fallback chain.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::retry::BackoffPolicy;

#[derive(Debug, Error)]
pub enum OcrError {
    /// The engine cannot read this document format at all. Retrying the
    /// same engine is pointless; the chain falls through immediately.
    #[error("unsupported document: {0}")]
    UnsupportedDocument(String),
    /// Throttling, timeouts, connection failures. Worth retrying.
    #[error("transient ocr failure: {0}")]
    Transient(String),
    #[error("ocr failure: {0}")]
    Fatal(String),
}

/// Recognized text plus the engine's own confidence estimate in [0, 1].
#[derive(Clone, Debug)]
pub struct OcrText {
    pub text: String,
    pub confidence: f32,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &'static str;
    async fn recognize(&self, document: &[u8]) -> Result<OcrText, OcrError>;
}

/// Managed OCR service spoken to over HTTP.
pub struct CloudOcr {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CloudOcrResponse {
    text: String,
    #[serde(default)]
    confidence: f32,
}

impl CloudOcr {
    pub fn new(config: &ExtractionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.ocr_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.cloud_ocr_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl OcrEngine for CloudOcr {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn recognize(&self, document: &[u8]) -> Result<OcrText, OcrError> {
        let response = self
            .client
            .post(format!("{}/analyze", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(document.to_vec())
            .send()
            .await
            .map_err(|err| OcrError::Transient(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNSUPPORTED_MEDIA_TYPE
            || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            return Err(OcrError::UnsupportedDocument(format!(
                "cloud ocr rejected document: {status}"
            )));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            return Err(OcrError::Transient(format!("cloud ocr: {status}")));
        }
        if !status.is_success() {
            return Err(OcrError::Fatal(format!("cloud ocr: {status}")));
        }

        let body: CloudOcrResponse = response
            .json()
            .await
            .map_err(|err| OcrError::Fatal(err.to_string()))?;
        Ok(OcrText {
            text: body.text,
            confidence: body.confidence.clamp(0.0, 1.0),
        })
    }
}

/// Local `tesseract` binary, the fallback when the cloud engine is down or
/// refuses the document.
pub struct LocalOcr {
    binary: String,
}

impl Default for LocalOcr {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalOcr {
    pub fn new() -> Self {
        Self {
            binary: "tesseract".to_string(),
        }
    }
}

#[async_trait]
impl OcrEngine for LocalOcr {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn recognize(&self, document: &[u8]) -> Result<OcrText, OcrError> {
        let input = std::env::temp_dir()
            .join(format!("ocr-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&input, document)
            .await
            .map_err(|err| OcrError::Fatal(err.to_string()))?;

        let output = tokio::process::Command::new(&self.binary)
            .arg(&input)
            .arg("stdout")
            .output()
            .await;
        let _ = tokio::fs::remove_file(&input).await;

        let output = output.map_err(|err| OcrError::Fatal(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("unsupported image format")
                || stderr.contains("Error in pixReadStream")
            {
                return Err(OcrError::UnsupportedDocument(stderr.into_owned()));
            }
            return Err(OcrError::Fatal(format!(
                "tesseract exited with {}: {}",
                output.status, stderr
            )));
        }

        Ok(OcrText {
            text: String::from_utf8_lossy(&output.stdout).into_owned(),
            // The CLI gives no usable aggregate confidence.
            confidence: 0.5,
        })
    }
}

/// Ordered engines with per-engine transient retries.
///
/// An `UnsupportedDocument` error falls through to the next engine at
/// once; transient errors are retried up to the budget before falling
/// through. Only `UnsupportedDocument` from the final engine is surfaced
/// as such, so callers can distinguish "no engine can ever read this"
/// from "try again later".
pub struct OcrChain {
    engines: Vec<Box<dyn OcrEngine>>,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl OcrChain {
    pub fn new(engines: Vec<Box<dyn OcrEngine>>, max_retries: u32) -> Self {
        Self {
            engines,
            max_retries,
            backoff: BackoffPolicy::new(500, 5_000),
        }
    }

    pub async fn recognize(
        &self,
        document: &[u8],
    ) -> Result<(OcrText, &'static str), OcrError> {
        let mut last_error =
            OcrError::Fatal("no ocr engines configured".to_string());

        for engine in &self.engines {
            let mut attempt: u32 = 0;
            loop {
                match engine.recognize(document).await {
                    Ok(text) => return Ok((text, engine.name())),
                    Err(err @ OcrError::UnsupportedDocument(_)) => {
                        debug!(
                            engine = engine.name(),
                            error = %err,
                            "document unsupported, falling through"
                        );
                        last_error = err;
                        break;
                    }
                    Err(err @ OcrError::Transient(_))
                        if attempt < self.max_retries =>
                    {
                        attempt += 1;
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(
                            engine = engine.name(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "transient ocr failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => {
                        warn!(
                            engine = engine.name(),
                            error = %err,
                            "engine failed, falling through"
                        );
                        last_error = err;
                        break;
                    }
                }
            }
        }

        Err(last_error)
    }
}
