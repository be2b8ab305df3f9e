//! Download of presigned object URLs.
//!
//! The gateway hands the store a GET capability and then fetches it itself,
//! streaming the store's response straight back to the client.  Status codes
//! from the store are folded into [`StoreError`] kinds: `404` is a cache miss,
//! any other non-success answer (expired signature, denied access) is treated
//! as forbidden.

use anyhow::Context;
use axum::body::Body;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::{StoreError, StoredObject};

/// Fetch `url` and return the object as a streaming body.
#[instrument(skip_all)]
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<StoredObject, StoreError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(reqwest::Error::without_url)
        .context("request presigned URL")?;

    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        debug!("store reported object missing");
        return Err(StoreError::NotFound);
    }
    if !status.is_success() {
        warn!(%status, "store rejected presigned download");
        return Err(StoreError::Forbidden);
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let content_length = resp.content_length();

    debug!(?content_length, "streaming presigned download");
    Ok(StoredObject {
        body: Body::from_stream(resp.bytes_stream()),
        content_type,
        content_length,
    })
}
