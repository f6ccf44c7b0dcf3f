// ABOUTME: Process-wide mutable session state shared across scheduled sync runs
// ABOUTME: Holds server host, auth token, resolved identities, device catalog and watermark
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Authenticated principal as reported by the vendor API
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Vendor-assigned account id
    pub id: Option<String>,
    /// Account type marker; `"pat"` marks a non-managing patient account
    pub account_type: Option<String>,
}

/// Monitored patient whose data is fetched; equals the identity when the
/// principal monitors itself
#[derive(Debug, Clone, Default)]
pub struct PatientContext {
    /// Patient id, bound during login
    pub id: Option<String>,
    /// Device-id keyed catalog from the report-settings endpoint
    pub data_sources: DataSourceCatalog,
    /// Device selected to anchor report generation
    pub primary_device: Option<PrimaryDevice>,
    /// Remaining device ids, referenced as secondaries in report requests
    pub secondary_device_ids: Vec<String>,
}

/// One entry of the patient's data-source catalog
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// Vendor device type id
    #[serde(rename = "type")]
    pub device_type: i64,
    /// Firmware version string reported by the device
    #[serde(default)]
    pub firmware_version: String,
    /// Days-ago markers for which the device has data
    #[serde(default)]
    pub days_data: Vec<i64>,
}

/// Device catalog preserving the JSON encounter order.
///
/// Primary-device selection breaks ties by first-seen iteration order, so
/// the map cannot be collected into a sorted or hashed container.
#[derive(Debug, Clone, Default)]
pub struct DataSourceCatalog(pub Vec<(String, DataSource)>);

impl Deref for DataSourceCatalog {
    type Target = [(String, DataSource)];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for DataSourceCatalog {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CatalogVisitor;

        impl<'de> Visitor<'de> for CatalogVisitor {
            type Value = DataSourceCatalog;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a map of device id to data source")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut sources = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((id, source)) = map.next_entry::<String, DataSource>()? {
                    sources.push((id, source));
                }
                Ok(DataSourceCatalog(sources))
            }
        }

        deserializer.deserialize_map(CatalogVisitor)
    }
}

/// Device chosen to anchor report generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryDevice {
    /// Device id from the catalog
    pub id: String,
    /// Vendor device type id
    pub type_id: i64,
    /// Firmware version, embedded into the Nightscout device string
    pub firmware_version: String,
}

/// Auth ticket as embedded in several vendor responses
#[derive(Debug, Clone, Deserialize)]
pub struct AuthTicket {
    /// Bearer token
    pub token: String,
    /// Validity in milliseconds from receipt
    #[serde(default)]
    pub duration: i64,
}

/// Mutable session record for one running bridge process.
///
/// Created once at startup and mutated in place by the authenticator and
/// the report pipeline. It persists across scheduled runs so the auth
/// token and watermark are reused. Runs are single-flight: the scheduling
/// source awaits each run to completion before starting the next, so no
/// locking is needed.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Vendor API hostname, reassigned on redirect
    pub server: String,
    /// Path prefix scoping calls to a managed patient; empty when the
    /// principal is the patient
    pub uri_prefix: String,
    /// Bearer token, reused while unexpired
    pub auth_token: Option<String>,
    /// Absolute token expiry; no login call is issued before this instant
    pub token_expires: Option<DateTime<Utc>>,
    /// Authenticated principal
    pub user: Identity,
    /// Monitored patient context
    pub patient: PatientContext,
    /// Last-synchronized instant, seconds, patient-local; monotonically
    /// non-decreasing
    pub last_data_tm: Option<i64>,
    /// Per-request timeout applied to every outbound call
    pub fetch_timeout: Duration,
    /// Extra protocol chatter in logs
    pub debug: bool,
}

impl SessionState {
    /// Fresh session pointed at the given (already resolved) host
    #[must_use]
    pub fn new(server: String, fetch_timeout: Duration, debug: bool) -> Self {
        Self {
            server,
            uri_prefix: String::new(),
            auth_token: None,
            token_expires: None,
            user: Identity::default(),
            patient: PatientContext::default(),
            last_data_tm: None,
            fetch_timeout,
            debug,
        }
    }

    /// Whether the cached token can still be used without a network login
    #[must_use]
    pub fn token_is_valid(&self) -> bool {
        self.auth_token.is_some()
            && self
                .token_expires
                .is_some_and(|expires| Utc::now() < expires)
    }

    /// Adopt a (possibly refreshed) auth ticket from a vendor response
    pub fn adopt_ticket(&mut self, ticket: &AuthTicket) {
        self.auth_token = Some(ticket.token.clone());
        self.token_expires = Some(Utc::now() + chrono::Duration::milliseconds(ticket.duration));
        debug!(expires = ?self.token_expires, "adopted auth ticket");
    }

    /// Bearer token for the next request, if any
    #[must_use]
    pub fn bearer(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }
}
