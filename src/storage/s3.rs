use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use axum::body::Body;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use super::{NewObject, ObjectStore, StoreError, StoredObject};

/// Cache artifacts stored as objects in a single S3 bucket, keyed by hash.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {
                debug!("object exists");
                Ok(true)
            }
            Err(err) => match classify(err, "S3 HeadObject") {
                StoreError::NotFound => {
                    debug!("object does not exist");
                    Ok(false)
                }
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self, object), fields(bucket = %self.bucket, bytes = object.body.len()))]
    async fn put(&self, key: &str, object: NewObject) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(object.body));

        if let Some(content_type) = object.content_type {
            request = request.content_type(content_type);
        }
        if object.if_absent {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => {
                debug!("object uploaded");
                Ok(())
            }
            // 412 when the precondition fails, 409 when a concurrent
            // conditional write is still in flight.
            Err(err) if object.if_absent && matches!(status_of(&err), Some(409 | 412)) => {
                Err(StoreError::AlreadyExists)
            }
            Err(err) => Err(classify(err, "S3 PutObject")),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<StoredObject, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify(err, "S3 GetObject"))?;

        let content_type = output.content_type().map(str::to_owned);
        let content_length = output
            .content_length()
            .and_then(|len| u64::try_from(len).ok());
        let body = Body::from_stream(ReaderStream::new(output.body.into_async_read()));

        debug!(?content_length, "object opened");
        Ok(StoredObject {
            body,
            content_type,
            content_length,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket, ttl_secs = ttl.as_secs()))]
    async fn presign_read(&self, key: &str, ttl: Duration) -> Result<String, StoreError> {
        let presigning = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .context("build PresigningConfig")?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .context("generate presigned URL")?;

        // Never log the URL itself: it embeds the request signature.
        debug!("presigned URL generated");
        Ok(request.uri().to_string())
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|resp| resp.status().as_u16())
}

/// Map an SDK failure onto a [`StoreError`] kind using the HTTP status of the
/// raw response.  Failures without a response (DNS, timeouts, ...) are
/// always [`StoreError::Upstream`].
fn classify<E>(err: SdkError<E, HttpResponse>, operation: &'static str) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match status_of(&err) {
        Some(404) => StoreError::NotFound,
        Some(401 | 403) => StoreError::Forbidden,
        _ => StoreError::Upstream(anyhow::Error::new(err).context(operation)),
    }
}
