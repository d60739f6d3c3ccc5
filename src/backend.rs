//! Collaborators of the upload orchestrator.
//!
//! A [`SessionAuthority`] is the trusted backend that owns multipart sessions
//! and signs part destinations. A [`PartStore`] moves bytes to a signed
//! destination and reports the checksum the object store assigned.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::BackendError;

/// Server-tracked context correlating all parts of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    pub key: String,
}

/// Time-limited destination for a single part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartAuthorization {
    pub part_number: u32,
    pub url: Url,
}

/// Checksum of one successfully transferred part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartResult {
    pub part_number: u32,
    pub e_tag: String,
}

#[async_trait]
pub trait SessionAuthority: Send + Sync {
    async fn init_session(
        &self,
        module: &str,
        filename: &str,
    ) -> Result<UploadSession, BackendError>;

    async fn authorize_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        content_type: &str,
    ) -> Result<PartAuthorization, BackendError>;

    /// `parts` is sorted ascending by part number. Returns the object reference.
    async fn complete_session(
        &self,
        session: &UploadSession,
        parts: &[PartResult],
    ) -> Result<String, BackendError>;

    async fn abort_session(&self, session: &UploadSession) -> Result<(), BackendError>;
}

#[async_trait]
pub trait PartStore: Send + Sync {
    /// Returns the store-issued checksum of `body`.
    async fn put_part(
        &self,
        authorization: &PartAuthorization,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, BackendError>;
}
