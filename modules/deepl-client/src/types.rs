use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct TranslateRequest<'a> {
    pub text: &'a [String],
    pub source_lang: &'a str,
    pub target_lang: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TranslateResponse {
    pub translations: Vec<Translation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Translation {
    #[serde(default)]
    pub detected_source_language: Option<String>,
    pub text: String,
}
