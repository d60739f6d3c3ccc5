use reqwest::StatusCode;
use thiserror::Error;

/// Failure reported by a collaborator (the file API or the object store).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("response carried no data")]
    MissingData,

    #[error("response carried no ETag header")]
    MissingChecksum,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Terminal error of an upload call.
///
/// Only the first error observed is reported; a failed abort during cleanup
/// is logged and never replaces it.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload: {0}")]
    Validation(String),

    #[error("failed to initialize upload session: {0}")]
    SessionInit(#[source] BackendError),

    #[error("failed to authorize part {part_number}: {source}")]
    PartAuthorization {
        part_number: u32,
        #[source]
        source: BackendError,
    },

    #[error("failed to upload part {part_number}: {source}")]
    PartTransfer {
        part_number: u32,
        #[source]
        source: BackendError,
    },

    #[error("failed to complete upload: {0}")]
    Completion(#[source] BackendError),
}

impl UploadError {
    /// Part number the error is attached to, if any.
    pub fn part_number(&self) -> Option<u32> {
        match self {
            UploadError::PartAuthorization { part_number, .. }
            | UploadError::PartTransfer { part_number, .. } => Some(*part_number),
            _ => None,
        }
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
