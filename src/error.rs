//! Error types for RedVault

use thiserror::Error;
use std::io;

/// Result type alias for RedVault operations
pub type Result<T> = std::result::Result<T, RedVaultError>;

/// Custom error types for RedVault
#[derive(Error, Debug)]
pub enum RedVaultError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Protocol parse error: {0}")]
    Protocol(String),

    #[error("AOF error: {0}")]
    Aof(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Client error: {0}")]
    Client(String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for RedVaultError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => RedVaultError::Protocol("incomplete frame".to_string()),
            nom::Err::Error(e) | nom::Err::Failure(e) => RedVaultError::Protocol(format!(
                "unexpected byte {:?} ({:?})",
                e.input.first().map(|b| *b as char),
                e.code
            )),
        }
    }
}
