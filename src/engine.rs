// ABOUTME: Top-level engine sequencing credentials, login, fetch, convert and upload
// ABOUTME: Owns the session so the token and watermark persist across scheduled runs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tracing::{debug, error, info};

use crate::auth::{self, LoginStatus};
use crate::client::ApiClient;
use crate::config::ConnectConfig;
use crate::credentials::{self, CredentialOutcome};
use crate::errors::{SyncError, SyncResult};
use crate::hosts::resolve_host;
use crate::report;
use crate::session::SessionState;
use crate::transform::{self, DailyLogData, Entry};
use crate::upload::{EntryStore, LastEntryLookup, UploadSink, UploadStatus};

/// One synchronization engine: configuration, session and delivery sink.
///
/// The engine is driven by an external scheduling source (host plugin
/// timer or the bundled daemon loop). Each run is awaited to completion
/// before the next starts, so the session is only ever touched by one
/// in-flight run.
pub struct Engine {
    config: ConnectConfig,
    session: SessionState,
    client: ApiClient,
    sink: UploadSink,
    last_lookup: Option<Arc<dyn LastEntryLookup>>,
}

impl Engine {
    /// Engine delivering straight to the configured Nightscout endpoint.
    ///
    /// # Errors
    ///
    /// Configuration error when no Nightscout endpoint is configured, or
    /// client construction failure.
    pub fn new(config: ConnectConfig) -> SyncResult<Self> {
        Self::with_sinks(config, None, None)
    }

    /// Engine with host-injected store and last-record hooks.
    ///
    /// The sink is chosen once here: an injected store wins, otherwise
    /// the Nightscout endpoint; with neither, the engine refuses to start.
    ///
    /// # Errors
    ///
    /// Configuration error when neither a store callback nor a Nightscout
    /// endpoint is available, or client construction failure.
    pub fn with_sinks(
        config: ConnectConfig,
        store: Option<Arc<dyn EntryStore>>,
        last_lookup: Option<Arc<dyn LastEntryLookup>>,
    ) -> SyncResult<Self> {
        let sink = match (store, &config.nightscout) {
            (Some(store), _) => UploadSink::Store(store),
            (None, Some(target)) => UploadSink::Nightscout(target.clone()),
            (None, None) => {
                return Err(SyncError::Config(
                    "neither store callback nor Nightscout endpoint configured".to_owned(),
                ))
            }
        };
        let client = ApiClient::new(config.fetch_timeout)?;
        let session = SessionState::new(
            resolve_host(&config.server),
            config.fetch_timeout,
            config.debug,
        );
        Ok(Self {
            config,
            session,
            client,
            sink,
            last_lookup,
        })
    }

    /// Session snapshot, mainly for the CLI and tests
    #[must_use]
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// One scheduled run. Terminal failures are logged and swallowed so a
    /// bad run never crashes the host process; the next run starts fresh
    /// with the cached token and watermark.
    pub async fn run(&mut self) {
        match self.run_once().await {
            Ok(status) => info!(%status, "sync run finished"),
            Err(err) => error!(%err, "sync run failed"),
        }
    }

    /// One full pipeline pass: fetch, convert, upload.
    ///
    /// A failed upload rewinds the watermark to its pre-run value so the
    /// next run re-fetches the same window instead of skipping past the
    /// undelivered batch.
    ///
    /// # Errors
    ///
    /// Propagates the first unrecovered stage failure.
    pub async fn run_once(&mut self) -> SyncResult<UploadStatus> {
        let watermark_before = self.session.last_data_tm;
        let entries = self.fetch_entries().await?;
        info!(count = entries.len(), "converted glucose records");
        upload_or_rewind(
            &self.client,
            &self.sink,
            &mut self.session.last_data_tm,
            watermark_before,
            &entries,
        )
        .await
    }

    /// Authenticate with retry, then run the login state machine only —
    /// the CLI `login` command.
    ///
    /// # Errors
    ///
    /// Propagates the final authentication failure.
    pub async fn login(&mut self) -> SyncResult<LoginStatus> {
        let policy = self.config.auth_retry_policy();
        policy
            .run_with_state(
                self,
                |engine: &mut Self, attempt: u32| -> BoxFuture<'_, SyncResult<LoginStatus>> {
                    debug!(attempt, "attempting to login");
                    Box::pin(engine.authenticate(attempt))
                },
            )
            .await
    }

    /// Authenticate and fetch with retry, then convert — everything up to
    /// but excluding the upload.
    ///
    /// # Errors
    ///
    /// Propagates the final authenticate-or-fetch failure.
    pub async fn fetch_entries(&mut self) -> SyncResult<Vec<Entry>> {
        let local_offset = self.config.local_offset_secs();
        info!(offset_secs = local_offset, "fetching LibreView data");

        if self.session.last_data_tm.is_none() {
            let watermark =
                initial_watermark(Utc::now().timestamp(), local_offset, self.config.first_full_days);
            debug!(watermark, "initialized watermark for first run");
            self.session.last_data_tm = Some(watermark);
        }

        let policy = self.config.auth_retry_policy();
        let data = policy
            .run_with_state(
                self,
                |engine: &mut Self, attempt: u32| -> BoxFuture<'_, SyncResult<DailyLogData>> {
                    debug!(attempt, "attempting to login and fetch data");
                    Box::pin(engine.authorize_and_fetch(attempt))
                },
            )
            .await?;

        let primary = self
            .session
            .patient
            .primary_device
            .clone()
            .ok_or(SyncError::NoPrimaryDevice)?;
        Ok(transform::convert_all(
            &data,
            &primary,
            &mut self.session.last_data_tm,
            local_offset,
        ))
    }

    /// Credential resolution plus the login state machine, one attempt
    async fn authenticate(&mut self, attempt: u32) -> SyncResult<LoginStatus> {
        let outcome =
            credentials::resolve(&self.client, attempt, &mut self.config.login, &mut self.session)
                .await?;
        if outcome == CredentialOutcome::TokenAdopted {
            // The adopted token makes authorize short-circuit, so the
            // patient context has to be bound here
            auth::bind_patient(&self.client, &self.config.login, &mut self.session).await?;
        }
        auth::authorize(&self.client, &self.config.login, &mut self.session).await
    }

    /// The combined retryable unit: authenticate, then the report pipeline
    async fn authorize_and_fetch(&mut self, attempt: u32) -> SyncResult<DailyLogData> {
        self.authenticate(attempt).await?;
        report::fetch(
            &self.client,
            &self.config,
            &mut self.session,
            self.last_lookup.as_deref(),
        )
        .await
    }
}

/// Deliver one batch, rewinding the watermark on failure.
///
/// Conversion advances the watermark before anything is sent; an upload
/// failure therefore has to restore the pre-run value or the skipped
/// batch would never be re-fetched.
async fn upload_or_rewind(
    client: &ApiClient,
    sink: &UploadSink,
    watermark: &mut Option<i64>,
    watermark_before: Option<i64>,
    entries: &[Entry],
) -> SyncResult<UploadStatus> {
    match sink.upload(client, entries).await {
        Ok(status) => Ok(status),
        Err(err) => {
            *watermark = watermark_before;
            Err(err)
        }
    }
}

/// Watermark for the very first run of a process: start of today shifted
/// to patient-local time, minus the configured lookback window
#[must_use]
pub fn initial_watermark(now_secs: i64, local_offset_secs: i64, first_full_days: i64) -> i64 {
    let today_start = now_secs - now_secs.rem_euclid(86_400);
    today_start - local_offset_secs - first_full_days * 86_400
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    struct FailingStore;

    #[async_trait]
    impl EntryStore for FailingStore {
        async fn store(&self, _entries: &[Entry]) -> anyhow::Result<()> {
            anyhow::bail!("dashboard unavailable")
        }
    }

    struct AcceptingStore;

    #[async_trait]
    impl EntryStore for AcceptingStore {
        async fn store(&self, _entries: &[Entry]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn entry(date: i64) -> Entry {
        Entry {
            sgv: 100,
            date,
            date_string: String::new(),
            device: String::new(),
            entry_type: "sgv".to_owned(),
        }
    }

    #[tokio::test]
    async fn failed_upload_rewinds_the_watermark() {
        let client = ApiClient::new(Duration::from_secs(1)).unwrap();
        let sink = UploadSink::Store(Arc::new(FailingStore));
        // Conversion already moved the watermark past the batch
        let mut watermark = Some(2_000);

        let result =
            upload_or_rewind(&client, &sink, &mut watermark, Some(1_000), &[entry(2_000_000)])
                .await;

        assert!(matches!(result, Err(SyncError::UploadFailed(_))));
        assert_eq!(watermark, Some(1_000));
    }

    #[tokio::test]
    async fn successful_upload_keeps_the_advanced_watermark() {
        let client = ApiClient::new(Duration::from_secs(1)).unwrap();
        let sink = UploadSink::Store(Arc::new(AcceptingStore));
        let mut watermark = Some(2_000);

        let result =
            upload_or_rewind(&client, &sink, &mut watermark, Some(1_000), &[entry(2_000_000)])
                .await;

        assert_eq!(result.unwrap(), UploadStatus::Stored);
        assert_eq!(watermark, Some(2_000));
    }
}
