//! Custom error types for the backup daemon.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Failed to collect {}: {source}", path.display())]
    Collection {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Failed to build archive {}: {message}", path.display())]
    Build { path: PathBuf, message: String },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl BackupError {
    pub fn collection(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Collection {
            path: path.into(),
            source,
        }
    }

    pub fn build(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        BackupError::Build {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
