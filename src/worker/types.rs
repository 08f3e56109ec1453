use serde::{Deserialize, Serialize};

/// One page's worth of OCR output, as the worker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageText {
    pub text: String,
    pub language: String,
}

/// Extraction endpoint reply. The worker either returns the recognized text
/// (with an optional language tag) or a structured error body; nothing else.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExtractReply {
    Ok {
        text: String,
        #[serde(default)]
        language: Option<String>,
    },
    Err {
        error: String,
    },
}

impl ExtractReply {
    pub fn into_result(self) -> Result<PageText, String> {
        match self {
            ExtractReply::Ok { text, language } => Ok(PageText {
                text,
                language: language.unwrap_or_else(|| "mixed".to_string()),
            }),
            ExtractReply::Err { error } => Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SummarizeRequest<'a> {
    pub text: &'a str,
    pub prompt: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SummarizeReply {
    Ok { summary: String },
    Err { error: String },
}

impl SummarizeReply {
    pub fn into_result(self) -> Result<String, String> {
        match self {
            SummarizeReply::Ok { summary } => Ok(summary),
            SummarizeReply::Err { error } => Err(error),
        }
    }
}
