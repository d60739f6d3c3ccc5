//! Concurrent chunked uploads to presigned object storage.
//!
//! [`Uploader`] drives a file through a multipart session: it asks a
//! [`SessionAuthority`] for a session and a signed destination per part,
//! pushes the parts through a [`PartStore`] with bounded concurrency, and
//! completes the session with the ordered manifest, aborting it on failure.
//! [`FileApiClient`] implements both collaborators over HTTP.

pub mod backend;
pub mod client;
pub mod error;
pub mod partition;
pub mod rest_types;
pub mod source;
pub mod uploader;

pub use backend::{PartAuthorization, PartResult, PartStore, SessionAuthority, UploadSession};
pub use client::{FileApiClient, SingleUploadOutcome};
pub use error::{BackendError, UploadError};
pub use partition::{
    DEFAULT_PART_SIZE, MAX_PARTS, MIN_PART_SIZE, PartDescriptor, fit_part_size, plan_parts,
};
pub use source::{LocalFile, MemorySource, UploadSource};
pub use uploader::{DEFAULT_CONCURRENCY, UploadEvent, UploadState, Uploader};
