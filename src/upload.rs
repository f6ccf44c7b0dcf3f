// ABOUTME: Entry delivery to an injected store callback or a Nightscout endpoint
// ABOUTME: Also hosts the inbound trait contracts and the api-secret digest
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use ring::digest;
use tracing::debug;

use crate::client::ApiClient;
use crate::errors::{SyncError, SyncResult};
use crate::transform::Entry;

/// Device-name pattern unique to this bridge, used to find the newest
/// previously-uploaded entry on the dashboard
pub const DEVICE_PATTERN: &str = "lvconnect";

/// Host-injected sink that stores converted entries directly
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Store one batch of entries
    async fn store(&self, entries: &[Entry]) -> anyhow::Result<()>;
}

/// Host-injected query for the newest previously-synced record
#[async_trait]
pub trait LastEntryLookup: Send + Sync {
    /// Date of the newest stored record in epoch milliseconds, or `None`
    /// when nothing has been synced yet
    async fn last_entry_date(&self) -> anyhow::Result<Option<i64>>;
}

/// Nightscout dashboard endpoint plus its shared secret
#[derive(Debug, Clone)]
pub struct NightscoutTarget {
    endpoint: String,
    api_secret: String,
}

impl NightscoutTarget {
    /// Build a target from an endpoint URL and the shared API secret
    #[must_use]
    pub fn new(endpoint: impl Into<String>, api_secret: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            api_secret: api_secret.into(),
        }
    }

    /// Endpoint base URL without a trailing slash
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Hex SHA-1 digest of the shared secret, the value Nightscout
    /// expects in its `api-secret` header
    #[must_use]
    pub fn api_secret_digest(&self) -> String {
        let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, self.api_secret.as_bytes());
        hex::encode(hash.as_ref())
    }

    fn entries_url(&self) -> String {
        format!("{}/api/v1/entries.json", self.endpoint)
    }

    /// Date of the newest entry previously uploaded by this bridge, in
    /// epoch milliseconds
    ///
    /// # Errors
    ///
    /// Returns a watermark-lookup error when the request fails or the
    /// response is not an entry list.
    pub async fn last_synced_ms(&self, client: &ApiClient) -> SyncResult<Option<i64>> {
        let entries: Vec<serde_json::Value> = client
            .http()
            .get(self.entries_url())
            .query(&[("find[device][$regex]", DEVICE_PATTERN), ("count", "1")])
            .header(ACCEPT, "application/json")
            .header("api-secret", self.api_secret_digest())
            .send()
            .await
            .map_err(|err| SyncError::WatermarkLookup(err.to_string()))?
            .json()
            .await
            .map_err(|err| SyncError::WatermarkLookup(err.to_string()))?;

        Ok(entries
            .first()
            .and_then(|entry| entry.get("date"))
            .and_then(serde_json::Value::as_i64))
    }

    /// POST one batch of entries, returning the dashboard's response body
    ///
    /// # Errors
    ///
    /// Returns an upload error when the transport fails or the dashboard
    /// answers with a non-success status.
    pub async fn upload(&self, client: &ApiClient, entries: &[Entry]) -> SyncResult<String> {
        debug!(endpoint = %self.endpoint, count = entries.len(), "uploading to Nightscout");
        let response = client
            .http()
            .post(self.entries_url())
            .header(ACCEPT, "application/json")
            .header("api-secret", self.api_secret_digest())
            .json(entries)
            .send()
            .await
            .map_err(|err| SyncError::UploadFailed(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SyncError::UploadFailed(err.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(SyncError::UploadFailed(format!("{status}: {body}")))
        }
    }
}

/// Outcome of one upload call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    /// Zero entries were fetched; nothing was sent anywhere
    NothingToUpload,
    /// The injected store callback accepted the batch
    Stored,
    /// The dashboard accepted the batch; carries its response body
    Accepted(String),
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NothingToUpload => f.write_str("zero entries fetched, nothing to upload"),
            Self::Stored => f.write_str("stored via callback"),
            Self::Accepted(body) => write!(f, "accepted by dashboard: {body}"),
        }
    }
}

/// Delivery target, chosen once at configuration time
#[derive(Clone)]
pub enum UploadSink {
    /// Host-injected store function
    Store(Arc<dyn EntryStore>),
    /// Direct HTTPS push to a Nightscout endpoint
    Nightscout(NightscoutTarget),
}

impl UploadSink {
    /// Deliver one batch of converted entries.
    ///
    /// An empty batch succeeds immediately without any network call —
    /// running a sync with nothing new is not an error.
    ///
    /// # Errors
    ///
    /// Propagates the store callback's failure or the dashboard transport
    /// failure as an upload error.
    pub async fn upload(&self, client: &ApiClient, entries: &[Entry]) -> SyncResult<UploadStatus> {
        if entries.is_empty() {
            debug!("zero entries fetched, nothing to upload");
            return Ok(UploadStatus::NothingToUpload);
        }

        match self {
            Self::Store(store) => {
                store
                    .store(entries)
                    .await
                    .map_err(|err| SyncError::UploadFailed(err.to_string()))?;
                Ok(UploadStatus::Stored)
            }
            Self::Nightscout(target) => {
                Ok(UploadStatus::Accepted(target.upload(client, entries).await?))
            }
        }
    }
}

impl fmt::Debug for UploadSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(_) => f.write_str("UploadSink::Store"),
            Self::Nightscout(target) => f
                .debug_tuple("UploadSink::Nightscout")
                .field(&target.endpoint())
                .finish(),
        }
    }
}
