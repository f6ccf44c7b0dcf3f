// ABOUTME: Stage-tagged error types for the LibreView synchronization pipeline
// ABOUTME: Classifies failures as retryable or fatal so retry decisions are data
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// Result alias used throughout the synchronization pipeline
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors produced by the synchronization pipeline.
///
/// Every stage rejects with a descriptive, stage-tagged reason. The
/// retry layer consults [`SyncError::is_retryable`] instead of matching
/// on error subtypes, so retry decisions stay data-driven.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Capability probe did not find the expected `lvapi` marker header
    #[error("{0} does not appear to be a legitimate LibreView API server")]
    NotALibreViewServer(String),

    /// Server instructed us to use a different regional host; the session
    /// has already been repointed, the caller just needs to retry
    #[error("redirected to {server}")]
    Redirected { server: String },

    /// Credentials were rejected, or the login endpoint returned an
    /// unrecognizable payload
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// A managing (professional) account must always name which patient
    /// to synchronize
    #[error("no patient ID specified for a professional account")]
    MissingPatientId,

    /// Patient-context lookup failed after a successful login
    #[error("failed getting patient details: {0}")]
    PatientLookup(String),

    /// Remote credential bundle was malformed or missing the configured key
    #[error("credential bundle fetch failed: {0}")]
    CredentialFetch(String),

    /// The report-settings endpoint returned an error payload
    #[error("failed getting report settings: {0}")]
    NoReportSettings(String),

    /// The data-source catalog is empty; the patient has no recent data
    #[error("no recent data for patient: device catalog is empty")]
    NoPrimaryDevice,

    /// The report-generation job could not be created
    #[error("report generation request failed: {0}")]
    ReportRequestFailed(String),

    /// Polling URL did not yield a long-poll channel
    #[error("no long-poll channel available")]
    NoChannelAvailable,

    /// The report job is still generating; poll again shortly
    #[error("report is still generating")]
    ReportPending,

    /// The report job ended with an operation we do not recognize
    #[error("report generation ended with operation {operation:?}")]
    ReportFailed { operation: String },

    /// The completed report did not carry a download URL
    #[error("no report URL provided")]
    NoReportUrl,

    /// The downloaded report HTML did not embed the expected data object
    #[error("no report data received")]
    NoDataReceived,

    /// Dashboard watermark discovery failed
    #[error("last-synced lookup failed: {0}")]
    WatermarkLookup(String),

    /// Entry delivery to the store callback or dashboard endpoint failed
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// Invalid or incomplete configuration; never retried
    #[error("configuration error: {0}")]
    Config(String),

    /// Embedded report JSON (or another payload) failed to parse
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Transport-level failure, including per-request timeouts
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A response had none of the shapes the stage knows how to handle
    #[error("unknown response from {stage}, check connection parameters")]
    UnexpectedResponse { stage: &'static str },
}

impl SyncError {
    /// Whether the retry layer should re-attempt after this failure.
    ///
    /// Network errors and timeouts, a received redirect, and a
    /// still-generating report are transient; everything else is fatal
    /// to the current run.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Redirected { .. } | Self::ReportPending
        )
    }
}
