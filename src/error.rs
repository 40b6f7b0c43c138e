// src/error.rs

//! Error taxonomy for the agent
//!
//! The first group of variants mirrors the failure kinds the reconciliation
//! pipeline reasons about. Collaborator failures are translated into one of
//! them at the operation boundary so stage transitions can branch on the kind
//! instead of on transport details. The second group covers local plumbing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The management server could not be reached. Retryable once per pass.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered but rejected the request. Terminal for the pass.
    #[error("Server error: {0}")]
    Server(String),

    /// Response signature did not match the locally computed one.
    #[error("Signature verification failed: {0}")]
    Verification(String),

    /// Artifact transfer failed. The queue head is retried in place.
    #[error("Download error: {0}")]
    Download(String),

    /// Package installation failed. Terminal for the item.
    #[error("Install error: {0}")]
    Install(String),

    /// A confirmation intent pointed somewhere it should not.
    #[error("Intent redirection suspected: {0}")]
    IntentRedirection(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Failed to initialize: {0}")]
    InitError(String),
}

impl Error {
    /// Whether the pipeline should treat this as a connectivity failure
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Server rejections and signature mismatches end the pass the same way
    pub fn is_server_side(&self) -> bool {
        matches!(self, Self::Server(_) | Self::Verification(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
