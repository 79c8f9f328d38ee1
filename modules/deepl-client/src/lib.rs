pub mod error;
pub mod types;

pub use error::{DeeplError, Result};
pub use types::Translation;

use types::{TranslateRequest, TranslateResponse};

const PRO_BASE_URL: &str = "https://api.deepl.com";
const FREE_BASE_URL: &str = "https://api-free.deepl.com";

/// Free-tier keys carry this suffix and must use the free endpoint.
const FREE_KEY_SUFFIX: &str = ":fx";

pub struct DeeplClient {
    client: reqwest::Client,
    auth_key: String,
    base_url: String,
}

impl DeeplClient {
    pub fn new(auth_key: String) -> Self {
        let base_url = base_url_for_key(&auth_key).to_string();
        Self {
            client: reqwest::Client::new(),
            auth_key,
            base_url,
        }
    }

    /// Point the client at a different host (a proxy or a local stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Translate a batch of texts. The result has one entry per input, in order.
    pub async fn translate(
        &self,
        texts: &[String],
        source_lang: &str,
        target_lang: &str,
    ) -> Result<Vec<Translation>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = TranslateRequest {
            text: texts,
            source_lang,
            target_lang,
        };

        let url = format!("{}/v2/translate", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(DeeplError::from_status(status.as_u16(), message));
        }

        let raw = resp.text().await?;
        let translations = parse_translations(&raw, texts.len())?;
        tracing::debug!(count = translations.len(), source_lang, target_lang, "DeepL batch translated");
        Ok(translations)
    }

    fn auth_header(&self) -> String {
        format!("DeepL-Auth-Key {}", self.auth_key)
    }
}

fn base_url_for_key(auth_key: &str) -> &'static str {
    if auth_key.ends_with(FREE_KEY_SUFFIX) {
        FREE_BASE_URL
    } else {
        PRO_BASE_URL
    }
}

fn parse_translations(raw: &str, expected: usize) -> Result<Vec<Translation>> {
    let parsed: TranslateResponse = serde_json::from_str(raw)?;
    if parsed.translations.len() != expected {
        return Err(DeeplError::Parse(format!(
            "expected {expected} translations, got {}",
            parsed.translations.len()
        )));
    }
    Ok(parsed.translations)
}
