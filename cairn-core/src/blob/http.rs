use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, header::{CONTENT_LENGTH, CONTENT_TYPE}};
use tracing::warn;

use super::{BlobStore, ByteStream, validate_key};
use crate::error::{Result, SyncError};

const IDEMPOTENT_ATTEMPTS: u32 = 3;

/// Object store reached over HTTP: `PUT`, `DELETE` and `HEAD` on
/// `{endpoint}/{bucket}/{key}` with an optional bearer token.
///
/// Uploads are streamed and not retried here (the body is consumed); the
/// upload queue retries them. Deletes and existence checks are retried with
/// exponential backoff.
#[derive(Clone)]
pub struct HttpBlobStore {
    client: Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl fmt::Debug for HttpBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBlobStore")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl HttpBlobStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Blob(format!("http client init failed: {e}")))?;
        Ok(Self::with_client(client, endpoint, bucket, token))
    }

    pub fn with_client(
        client: Client,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into().trim_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    fn object_url(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}/{}/{}", self.endpoint, self.bucket, key))
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_idempotent(&self, method: Method, key: &str) -> Result<StatusCode> {
        let url = self.object_url(key)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request(method.clone(), &url).send().await {
                Ok(response) if !response.status().is_server_error() => {
                    return Ok(response.status());
                }
                Ok(response) if attempt >= IDEMPOTENT_ATTEMPTS => {
                    return Err(SyncError::Blob(format!(
                        "{method} {key} failed with {}",
                        response.status()
                    )));
                }
                Err(err) if attempt >= IDEMPOTENT_ATTEMPTS => {
                    return Err(SyncError::Blob(format!("{method} {key} failed: {err}")));
                }
                Ok(response) => {
                    warn!(%method, key, status = %response.status(), attempt, "blob request failed, retrying");
                }
                Err(err) => {
                    warn!(%method, key, error = %err, attempt, "blob request failed, retrying");
                }
            }
            tokio::time::sleep(Duration::from_millis(250 * 2u64.pow(attempt - 1))).await;
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put_object(
        &self,
        key: &str,
        body: ByteStream,
        content_length: u64,
        content_type: &str,
    ) -> Result<()> {
        let url = self.object_url(key)?;
        let response = self
            .request(Method::PUT, &url)
            .header(CONTENT_LENGTH, content_length)
            .header(CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| SyncError::Blob(format!("PUT {key} failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::Blob(format!(
                "PUT {key} rejected with {}",
                response.status()
            )))
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let status = self.send_idempotent(Method::DELETE, key).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(SyncError::Blob(format!("DELETE {key} rejected with {status}")))
        }
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let status = self.send_idempotent(Method::HEAD, key).await?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(SyncError::Blob(format!("HEAD {key} rejected with {s}"))),
        }
    }
}
