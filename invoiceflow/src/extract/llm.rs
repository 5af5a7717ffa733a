//! Language-model field extraction.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::ExtractionConfig;
use crate::invoice::InvoiceFields;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Upstream throttled us; back off at the message level.
    #[error("model rate limited")]
    RateLimited,
    #[error("model call failed: {0}")]
    Upstream(String),
    #[error("model returned malformed fields: {0}")]
    Malformed(String),
}

/// Structured fields plus whether the OCR text was cut to the prompt
/// budget before the model saw it.
#[derive(Clone, Debug)]
pub struct ExtractedFields {
    pub fields: InvoiceFields,
    pub truncated: bool,
}

#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(
        &self,
        ocr_text: &str,
    ) -> Result<ExtractedFields, ExtractError>;
}

const SYSTEM_PROMPT: &str = "You extract structured invoice data from OCR \
text. Respond with a single JSON object with the keys vendor_name, \
invoice_number, invoice_date (YYYY-MM-DD), total_amount (decimal string), \
currency (ISO 4217) and po_numbers (array of strings). Use null for \
anything the text does not state. Never invent values.";

/// Chat-completions client against an OpenAI-compatible endpoint.
pub struct LlmExtractor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    prompt_max_chars: usize,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl LlmExtractor {
    pub fn new(config: &ExtractionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.model_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.model_api_url.trim_end_matches('/').to_string(),
            api_key: config.model_api_key.clone(),
            model: config.model_name.clone(),
            prompt_max_chars: config.prompt_max_chars,
        })
    }

    /// Cut the OCR text to the prompt budget on a character boundary.
    /// Deterministic: the same text always truncates the same way.
    fn truncate<'a>(&self, text: &'a str) -> (&'a str, bool) {
        match text.char_indices().nth(self.prompt_max_chars) {
            Some((byte_index, _)) => (&text[..byte_index], true),
            None => (text, false),
        }
    }
}

#[async_trait]
impl FieldExtractor for LlmExtractor {
    async fn extract(
        &self,
        ocr_text: &str,
    ) -> Result<ExtractedFields, ExtractError> {
        let (prompt_text, truncated) = self.truncate(ocr_text);
        if truncated {
            debug!(
                original_chars = ocr_text.chars().count(),
                budget = self.prompt_max_chars,
                "ocr text truncated to prompt budget"
            );
        }

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt_text },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ExtractError::Upstream(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExtractError::RateLimited);
        }
        if !status.is_success() {
            return Err(ExtractError::Upstream(format!("model api: {status}")));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|err| ExtractError::Malformed(err.to_string()))?;
        let content = chat
            .choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .ok_or_else(|| {
                ExtractError::Malformed("empty choices".to_string())
            })?;

        let fields: InvoiceFields = serde_json::from_str(content)
            .map_err(|err| ExtractError::Malformed(err.to_string()))?;

        Ok(ExtractedFields { fields, truncated })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;

    fn extractor(prompt_max_chars: usize) -> LlmExtractor {
        LlmExtractor::new(&ExtractionConfig {
            prompt_max_chars,
            ..ExtractionConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn truncates_on_char_boundaries() {
        let extractor = extractor(3);
        let (cut, truncated) = extractor.truncate("héllo");
        assert_eq!(cut, "hél");
        assert!(truncated);
    }

    #[test]
    fn short_text_passes_untouched() {
        let extractor = extractor(8_000);
        let (cut, truncated) = extractor.truncate("short invoice");
        assert_eq!(cut, "short invoice");
        assert!(!truncated);
    }

    #[test]
    fn text_at_exact_budget_is_not_truncated() {
        let extractor = extractor(5);
        let (cut, truncated) = extractor.truncate("12345");
        assert_eq!(cut, "12345");
        assert!(!truncated);
    }
}
