use crate::sink::{CsvFormat, QuoteStyle};
use serde::Deserialize;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("exam service base url is empty")]
    EmptyBaseUrl,
    #[error("item concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("delimiter must be a single ASCII character other than a quote or line break")]
    InvalidDelimiter,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ExamService {
    pub base_url: String,
    /// Basic-auth credentials identifying this connector to the exam service.
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ExamService {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_url.trim().is_empty() {
            return Err(ValidationError::EmptyBaseUrl);
        }
        Ok(())
    }
}

fn default_item_concurrency() -> usize {
    4
}

fn default_delimiter() -> char {
    ','
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Export {
    /// Reject deliveries whose examinee token does not verify against the
    /// tenant secret instead of exporting them with an empty client id.
    #[serde(default)]
    pub check_secret: bool,
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub quote_style: QuoteStyle,
}

impl Default for Export {
    fn default() -> Self {
        Export {
            check_secret: false,
            item_concurrency: default_item_concurrency(),
            delimiter: default_delimiter(),
            quote_style: QuoteStyle::default(),
        }
    }
}

impl Export {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.item_concurrency == 0 {
            return Err(ValidationError::InvalidConcurrency);
        }
        if !self.delimiter.is_ascii() || matches!(self.delimiter, '"' | '\r' | '\n') {
            return Err(ValidationError::InvalidDelimiter);
        }
        Ok(())
    }

    pub fn csv_format(&self) -> CsvFormat {
        CsvFormat {
            delimiter: self.delimiter as u8,
            quote_style: self.quote_style,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreType {
    Filesystem { base_dir: String },
    Memory,
}
