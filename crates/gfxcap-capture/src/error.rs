use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Failures internal to the capture core. These never cross the interception
/// boundary: hooks log and drop capture to a safe mode instead of returning
/// errors to the application.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to create capture file {path}: {source}")]
    FileCreate { path: String, source: io::Error },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported compression type {0}")]
    UnsupportedCompression(u32),
}
