//! Error taxonomy for registry, cache and inference operations.
//!
//! Every variant is terminal for the operation that produced it. Nothing in
//! this crate retries on its own; see [`crate::retry`] for a caller-side
//! policy.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoachError>;

/// Boxed error from the inference backend, passed through untouched.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CoachError {
    #[error("invalid api key: {reason}")]
    InvalidCredential { reason: &'static str },

    #[error("authentication failed against {url}: {message}")]
    Authentication { url: String, message: String },

    #[error("client is not authenticated, call login first")]
    NotAuthenticated,

    #[error("model '{name}' is not part of this profile")]
    UnknownModel { name: String },

    #[error("download of model '{model}' from {url} failed: {message}")]
    Download { model: String, url: String, message: String },

    #[error("artifact not found at {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    #[error("unsupported format version {found} (supported: {supported})")]
    IncompatibleVersion { found: f64, supported: String },

    #[error("base module '{module}' does not end in a 3-digit input size")]
    InvalidBaseModule { module: String },

    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("manifest at {} is invalid: {source}", path.display())]
    Manifest { path: PathBuf, #[source] source: serde_json::Error },

    #[error("io error at {}: {source}", path.display())]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("inference backend failed: {0}")]
    Backend(#[source] BackendError),

    #[error("http client setup failed: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl CoachError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn download(model: &str, url: &str, message: impl ToString) -> Self {
        Self::Download { model: model.to_string(), url: url.to_string(), message: message.to_string() }
    }

    /// True for failures a caller may reasonably retry (transport and disk).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Download { .. } | Self::Io { .. })
    }
}
