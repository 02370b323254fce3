use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("network error: {0}")]
    Network(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("stale result for account {0}")]
    StaleAccount(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid account: {0}")]
    InvalidAccount(String),
    #[cfg(feature = "desktop")]
    #[error("runtime error: {0}")]
    Tauri(#[from] tauri::Error),
}

impl From<reqwest::Error> for AppError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Schema(value.to_string())
        } else if value.is_timeout() {
            Self::Network(format!("request timed out: {value}"))
        } else {
            Self::Network(value.to_string())
        }
    }
}

impl From<simd_json::Error> for AppError {
    fn from(value: simd_json::Error) -> Self {
        Self::Schema(format!("json decode error: {value}"))
    }
}

impl From<std::num::ParseIntError> for AppError {
    fn from(value: std::num::ParseIntError) -> Self {
        Self::Schema(format!("integer parse error: {value}"))
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        Self::Network(format!("request timed out: {value}"))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
