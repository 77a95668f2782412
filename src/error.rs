//! Error types shared across the watchlist engine.

use thiserror::Error;

/// Failure of a single quote request.
///
/// `Clone` so that one in-flight request can hand the same outcome to every
/// caller that joined it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuoteError {
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("quote endpoint returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("quote service rejected request: {0}")]
    Rejected(String),

    #[error("invalid quote data: {0}")]
    InvalidQuoteData(String),
}

impl From<reqwest::Error> for QuoteError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => QuoteError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => QuoteError::Network(err.to_string()),
        }
    }
}

/// Failure of the streaming price connection.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open stream: {0}")]
    Connect(String),

    #[error("stream transport error: {0}")]
    Transport(String),

    #[error("stream reported error: {0}")]
    Server(String),

    #[error("stream closed by server")]
    Closed,

    #[error("malformed stream message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Rejected watchlist mutation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} is already on the watchlist")]
    DuplicateSymbol(String),

    #[error("{0} is not on the watchlist")]
    UnknownSymbol(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Json(#[from] serde_json::Error),
}
