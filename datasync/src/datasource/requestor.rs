use crate::datasource::USER_AGENT;
use crate::datasource::protocol::{AllData, POLL_RESPONSE};
use crate::errors::{ProtocolError, RequestError, ValidationError};
use crate::kinds::Collection;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, ETAG, IF_NONE_MATCH};
use url::Url;

const LATEST_ALL_PATH: &str = "sdk/latest-all";

#[derive(Debug)]
pub enum PollResult {
    /// The snapshot has not changed since the previous request.
    NotModified,
    Updated(Vec<Collection>),
}

/// Fetches full snapshots, remembering the last `ETag` so that an unchanged
/// snapshot is answered with `304 Not Modified`.
pub struct Requestor {
    client: reqwest::Client,
    url: Url,
    sdk_key: String,
    etag: Mutex<Option<String>>,
}

impl Requestor {
    pub fn new(
        client: reqwest::Client,
        base_uri: &Url,
        sdk_key: &str,
    ) -> Result<Self, ValidationError> {
        let full_url = format!(
            "{}/{}",
            base_uri.as_str().trim_end_matches('/'),
            LATEST_ALL_PATH
        );
        let url = Url::parse(&full_url)
            .map_err(|_| ValidationError::InvalidBaseUri(base_uri.to_string()))?;

        Ok(Requestor {
            client,
            url,
            sdk_key: sdk_key.to_string(),
            etag: Mutex::new(None),
        })
    }

    pub async fn request_all(&self) -> Result<PollResult, RequestError> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(AUTHORIZATION, &self.sdk_key)
            .header(reqwest::header::USER_AGENT, USER_AGENT);
        let etag = self.etag.lock().clone();
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(PollResult::NotModified);
        }
        if !status.is_success() {
            return Err(RequestError::Status(status.as_u16()));
        }

        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        let all_data: AllData =
            serde_json::from_slice(&body).map_err(|source| ProtocolError::Json {
                event: POLL_RESPONSE,
                source,
            })?;
        let collections = all_data.into_collections(POLL_RESPONSE)?;

        *self.etag.lock() = new_etag;
        Ok(PollResult::Updated(collections))
    }

    /// Forgets the cached `ETag`, so that the next request fetches the full
    /// snapshot again.
    pub fn reset_cache(&self) {
        *self.etag.lock() = None;
    }
}
