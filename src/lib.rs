// ABOUTME: LibreView to Nightscout synchronization bridge library
// ABOUTME: Authenticated, stateful, retry-driven glucose data pipeline
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronizes glucose readings from the LibreView cloud API into a
//! self-hosted Nightscout dashboard.
//!
//! Each scheduled run authenticates (reusing a cached token while it is
//! valid), requests an asynchronously generated daily-log report, polls
//! for its completion, downloads and parses it, converts the records to
//! Nightscout entries, and uploads everything newer than the last
//! synchronized reading.

/// Login state machine: probe, authenticate, redirects, patient binding
pub mod auth;
/// Shared HTTP client and vendor response envelopes
pub mod client;
/// Environment-based configuration bundle
pub mod config;
/// Remote credential-bundle resolution for managed fleets
pub mod credentials;
/// Top-level run sequencing and failure containment
pub mod engine;
/// Stage-tagged pipeline errors
pub mod errors;
/// Region code to API hostname mapping
pub mod hosts;
/// Report generation, completion polling and download
pub mod report;
/// Bounded exponential-backoff retry
pub mod retry;
/// Mutable per-process session state
pub mod session;
/// Vendor record to Nightscout entry conversion
pub mod transform;
/// Entry delivery and host-injected sink contracts
pub mod upload;

pub use auth::LoginStatus;
pub use client::{ApiClient, AGENT};
pub use config::{ConnectConfig, LoginConfig};
pub use engine::Engine;
pub use errors::{SyncError, SyncResult};
pub use hosts::resolve_host;
pub use retry::RetryPolicy;
pub use session::SessionState;
pub use transform::Entry;
pub use upload::{EntryStore, LastEntryLookup, NightscoutTarget, UploadSink, UploadStatus};
