use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, header};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::backend::{PartAuthorization, PartResult, PartStore, SessionAuthority, UploadSession};
use crate::error::{BackendError, UploadError};
use crate::rest_types::{ApiResponse, CompleteMultipartRequest};
use crate::source::UploadSource;

const PRESIGN_ROUTE: &str = "api/file/presign";
const DELETE_ROUTE: &str = "api/file/delete";
const INIT_MULTIPART_ROUTE: &str = "api/file/multipart/init";
const PRESIGN_PART_ROUTE: &str = "api/file/multipart/presign";
const COMPLETE_MULTIPART_ROUTE: &str = "api/file/multipart/complete";
const ABORT_MULTIPART_ROUTE: &str = "api/file/multipart/abort";

pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleUploadOutcome {
    /// Address of the stored object (the presigned URL without its signature).
    pub url: Url,
    pub e_tag: String,
}

/// Client of the platform's file API and of the presigned object store URLs it hands out.
#[derive(Debug, Clone)]
pub struct FileApiClient {
    client: Client,
    api_base_url: Url,
    auth_token: String,
    presign_ttl: Duration,
}

impl FileApiClient {
    /// Routes are resolved under the full path of `api_base_url`, with or without a trailing slash.
    pub fn new(mut api_base_url: Url, auth_token: String) -> Self {
        if !api_base_url.path().ends_with('/') {
            let path = format!("{}/", api_base_url.path());
            api_base_url.set_path(&path);
        }
        Self {
            client: Client::new(),
            api_base_url,
            auth_token,
            presign_ttl: DEFAULT_PRESIGN_TTL,
        }
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn presign_ttl(mut self, ttl: Duration) -> Self {
        self.presign_ttl = ttl;
        self
    }

    fn route(&self, route: &str) -> Result<Url, BackendError> {
        self.api_base_url
            .join(route)
            .map_err(|e| BackendError::Other(format!("failed to construct {} URL: {}", route, e)))
    }

    fn ttl_seconds(&self) -> String {
        self.presign_ttl.as_secs().to_string()
    }

    async fn read_response<T: DeserializeOwned>(
        response: Response,
    ) -> Result<ApiResponse<T>, BackendError> {
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    async fn read_signed_url(response: Response) -> Result<Url, BackendError> {
        let url: String = Self::read_response(response).await?.into_data()?;
        Url::parse(&url)
            .map_err(|e| BackendError::Other(format!("invalid presigned URL {:?}: {}", url, e)))
    }

    /// Signs a single `PUT` of a whole file.
    pub async fn presign_single(
        &self,
        module: &str,
        filename: &str,
        content_type: &str,
    ) -> Result<Url, BackendError> {
        let url = self.route(PRESIGN_ROUTE)?;
        let ttl_seconds = self.ttl_seconds();

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.auth_token)
            .query(&[
                ("module", module),
                ("filename", filename),
                ("contentType", content_type),
                ("ttlSeconds", ttl_seconds.as_str()),
            ])
            .send()
            .await?;

        Self::read_signed_url(response).await
    }

    async fn put_object(
        &self,
        url: Url,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, BackendError> {
        let response = self
            .client
            .put(url)
            .header(header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(strip_etag_quotes)
            .filter(|e_tag| !e_tag.is_empty())
            .ok_or(BackendError::MissingChecksum)
    }

    /// Uploads a whole source with one presigned `PUT`.
    pub async fn upload_single<U>(
        &self,
        source: &U,
        module: &str,
    ) -> Result<SingleUploadOutcome, UploadError>
    where
        U: UploadSource + ?Sized,
    {
        if source.is_empty() {
            return Err(UploadError::Validation(
                "cannot upload an empty file".to_string(),
            ));
        }

        let signed_url = self
            .presign_single(module, source.name(), source.content_type())
            .await
            .map_err(|source| UploadError::PartAuthorization {
                part_number: 1,
                source,
            })?;

        let transfer_error = |source: BackendError| UploadError::PartTransfer {
            part_number: 1,
            source,
        };

        let body = source
            .read_range(0..source.len())
            .await
            .map_err(|error| transfer_error(BackendError::Io(error)))?;

        let e_tag = self
            .put_object(signed_url.clone(), body, source.content_type())
            .await
            .map_err(transfer_error)?;

        Ok(SingleUploadOutcome {
            url: object_url(&signed_url),
            e_tag,
        })
    }

    /// Deletes an uploaded object by its URL or key.
    pub async fn delete_object(&self, target: &str) -> Result<(), BackendError> {
        let url = self.route(DELETE_ROUTE)?;

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.auth_token)
            .query(&[("target", target)])
            .send()
            .await?;

        Self::read_response::<serde_json::Value>(response)
            .await?
            .into_result()?;
        Ok(())
    }
}

#[async_trait]
impl SessionAuthority for FileApiClient {
    async fn init_session(
        &self,
        module: &str,
        filename: &str,
    ) -> Result<UploadSession, BackendError> {
        let url = self.route(INIT_MULTIPART_ROUTE)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.auth_token)
            .query(&[("module", module), ("filename", filename)])
            .send()
            .await?;

        Self::read_response(response).await?.into_data()
    }

    async fn authorize_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        content_type: &str,
    ) -> Result<PartAuthorization, BackendError> {
        let url = self.route(PRESIGN_PART_ROUTE)?;
        let part_number_param = part_number.to_string();
        let ttl_seconds = self.ttl_seconds();

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.auth_token)
            .query(&[
                ("key", session.key.as_str()),
                ("uploadId", session.upload_id.as_str()),
                ("partNumber", part_number_param.as_str()),
                ("contentType", content_type),
                ("ttlSeconds", ttl_seconds.as_str()),
            ])
            .send()
            .await?;

        let url = Self::read_signed_url(response).await?;
        Ok(PartAuthorization { part_number, url })
    }

    async fn complete_session(
        &self,
        session: &UploadSession,
        parts: &[PartResult],
    ) -> Result<String, BackendError> {
        let url = self.route(COMPLETE_MULTIPART_ROUTE)?;

        let request = CompleteMultipartRequest {
            key: &session.key,
            upload_id: &session.upload_id,
            parts,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.auth_token)
            .json(&request)
            .send()
            .await?;

        Self::read_response(response).await?.into_data()
    }

    async fn abort_session(&self, session: &UploadSession) -> Result<(), BackendError> {
        let url = self.route(ABORT_MULTIPART_ROUTE)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.auth_token)
            .query(&[
                ("key", session.key.as_str()),
                ("uploadId", session.upload_id.as_str()),
            ])
            .send()
            .await?;

        Self::read_response::<serde_json::Value>(response)
            .await?
            .into_result()?;
        debug!(upload_id = %session.upload_id, "multipart upload aborted");
        Ok(())
    }
}

#[async_trait]
impl PartStore for FileApiClient {
    async fn put_part(
        &self,
        authorization: &PartAuthorization,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, BackendError> {
        self.put_object(authorization.url.clone(), body, content_type)
            .await
    }
}

/// Object stores quote ETags; the completion manifest wants them bare.
fn strip_etag_quotes(e_tag: &str) -> String {
    e_tag.replace('"', "")
}

fn object_url(signed_url: &Url) -> Url {
    let mut url = signed_url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url
}
