use std::io;

use thiserror::Error;

/// Errors raised while locating, fetching or decoding DESI data products.
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "no DESI credentials found at {path}; put them there as a single line `username:password`"
    )]
    MissingCredentials { path: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("authentication rejected for {url} (HTTP {status})")]
    Auth { url: String, status: u16 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("malformed FITS data: {0}")]
    Fits(String),

    #[error("malformed pickle record: {0}")]
    Pickle(String),

    #[error("Gaia index error: {0}")]
    Index(String),

    #[error("object not found in the Gaia index: {0}")]
    ObjectNotFound(i64),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            Error::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
