// error.rs

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Message(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encoding error: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Template error: {0}")]
    Template(#[from] askama::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Timeout: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Sensor error: {0}")]
    Sensor(String),
    #[error("Radio error: {0}")]
    Radio(String),
    #[error("Frame error: {0}")]
    Frame(#[from] crate::FrameError),
    #[cfg(target_os = "espidf")]
    #[error("ESP-IDF error: {0}")]
    Esp(#[from] esp_idf_sys::EspError),
}

impl From<String> for AppError {
    fn from(msg: String) -> Self {
        AppError::Message(msg)
    }
}

impl From<&str> for AppError {
    fn from(msg: &str) -> Self {
        AppError::Message(msg.into())
    }
}

// EOF
