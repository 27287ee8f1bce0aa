//! Error types for capture storage and side-effect replay

use std::path::PathBuf;
use thiserror::Error;

use crate::value::{CallArgs, ValueError};

/// Errors that can occur while persisting or reading capture records
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode capture record: {0}")]
    Encode(String),

    #[error("Failed to decode capture record: {0}")]
    Decode(String),

    #[error("Failed to persist capture file {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Value conversion failed: {0}")]
    Value(#[from] ValueError),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors raised by the side-effect replay bridge
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("No recorded side effect in {bucket} matches call {args}")]
    Lookup { bucket: PathBuf, args: CallArgs },

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Expected call {call} was never made")]
    MissingCall { call: CallArgs },

    #[error("Recorded result could not be decoded: {0}")]
    Decode(#[from] ValueError),
}
