use crate::multipart::MultipartError;
use crate::transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AvsError>;

#[derive(Error, Debug)]
pub enum AvsError {
    #[error("Invalid connection state: {0}")]
    State(String),

    #[error("Connection error: {0}")]
    Connection(#[from] TransportError),

    #[error("Parse error: {0}")]
    Parse(#[from] MultipartError),

    #[error("HTTP error: status {status}")]
    Http { status: u16, body: Vec<u8> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AvsError {
    /// Status code carried by an `Http` error
    pub fn status(&self) -> Option<u16> {
        match self {
            AvsError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
