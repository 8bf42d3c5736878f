//! Error types for the Segretario ledger and its remote clients.

use thiserror::Error;

/// Errors raised while loading or exchanging service-account credentials.
#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("cannot read credentials file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid service-account key: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot sign token assertion: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Spreadsheet (Google Sheets) client errors.
#[derive(Error, Debug)]
pub enum SheetError {
    #[error("spreadsheet auth: {0}")]
    Auth(#[from] CredentialsError),

    #[error("spreadsheet request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("spreadsheet API {status}: {body}")]
    Api { status: u16, body: String },

    #[error("spreadsheet backend: {0}")]
    Backend(String),
}

/// Object storage (Google Drive) client errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage auth: {0}")]
    Auth(#[from] CredentialsError),

    #[error("storage request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage API {status}: {body}")]
    Api { status: u16, body: String },

    #[error("resumable upload session: {0}")]
    Session(String),

    #[error("storage backend: {0}")]
    Backend(String),
}

/// Speech recognition client errors.
#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("speech auth: {0}")]
    Auth(#[from] CredentialsError),

    #[error("speech request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("speech API {status}: {body}")]
    Api { status: u16, body: String },

    #[error("recognition operation failed ({code}): {message}")]
    Operation { code: i64, message: String },

    #[error("recognition did not finish within {0:?}")]
    Timeout(std::time::Duration),

    #[error("speech backend: {0}")]
    Backend(String),
}

/// Service-level error returned by every ledger operation.
///
/// `ClientInput` maps to HTTP 400; everything else is an upstream failure (HTTP 500).
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{0}")]
    ClientInput(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{message}")]
    Sheet {
        message: String,
        #[source]
        source: SheetError,
    },

    #[error("{message}")]
    Storage {
        message: String,
        #[source]
        source: StorageError,
    },

    #[error("{message}")]
    Speech {
        message: String,
        #[source]
        source: SpeechError,
    },
}

impl LedgerError {
    pub fn client(message: impl Into<String>) -> Self {
        LedgerError::ClientInput(message.into())
    }

    /// True when the caller sent bad input (as opposed to a remote/service failure).
    pub fn is_client_error(&self) -> bool {
        matches!(self, LedgerError::ClientInput(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
