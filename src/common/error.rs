use thiserror::Error;

use crate::common::error::MsError::GenericError;

#[derive(Debug, Error)]
pub enum MsError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<sqlx::Error> for MsError {
    fn from(e: sqlx::Error) -> Self {
        Self::StoreError(e.to_string())
    }
}

impl From<anyhow::Error> for MsError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<String> for MsError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}
