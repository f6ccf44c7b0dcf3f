// ABOUTME: Remote credential-bundle resolution for centrally managed fleets
// ABOUTME: Refreshes rotated login details and adopts still-valid cached tokens
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::client::ApiClient;
use crate::config::LoginConfig;
use crate::errors::{SyncError, SyncResult};
use crate::hosts::resolve_host;
use crate::session::SessionState;

/// What the resolver decided for this attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// Keep the credentials already configured
    UseConfigured,
    /// Login details were overwritten from the remote bundle
    Refreshed,
    /// The bundle carried a still-valid token which was adopted directly;
    /// the caller must trigger the patient-context lookup since the
    /// login short-circuit will skip it
    TokenAdopted,
}

/// One bridge's entry within the remote credential bundle
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialBundle {
    user_name: Option<String>,
    password: Option<String>,
    trusted_device_token: Option<String>,
    server: Option<String>,
    debug: Option<bool>,
    auth_token: Option<String>,
    /// Absolute expiry in epoch milliseconds
    token_expires: Option<i64>,
}

/// Resolve login credentials for the given retry attempt.
///
/// The first attempt of a run, and any deployment without a remote
/// bundle configured, uses the credentials as configured. Later attempts
/// re-fetch the bundle — a failed attempt may mean the credentials
/// rotated underneath us.
///
/// # Errors
///
/// `CredentialFetch` when the bundle is malformed or the configured key
/// is absent; transport errors from the HTTPS GET.
pub async fn resolve(
    client: &ApiClient,
    attempt: u32,
    login: &mut LoginConfig,
    session: &mut SessionState,
) -> SyncResult<CredentialOutcome> {
    let (Some(url), Some(key)) = (
        login.pro_credentials_url.clone(),
        login.pro_credentials_key.clone(),
    ) else {
        return Ok(CredentialOutcome::UseConfigured);
    };
    if attempt <= 1 {
        return Ok(CredentialOutcome::UseConfigured);
    }

    debug!(attempt, "refreshing credentials from remote bundle");
    let document: serde_json::Value = client.get_json(&url, None).await?;
    apply_bundle(&document, &key, login, session)
}

/// Fold a fetched bundle document into the login config and session
fn apply_bundle(
    document: &serde_json::Value,
    key: &str,
    login: &mut LoginConfig,
    session: &mut SessionState,
) -> SyncResult<CredentialOutcome> {
    let entry = document
        .get(key)
        .ok_or_else(|| SyncError::CredentialFetch(format!("key {key:?} absent from bundle")))?;
    let bundle: CredentialBundle = serde_json::from_value(entry.clone())
        .map_err(|err| SyncError::CredentialFetch(err.to_string()))?;

    if let Some(user_name) = bundle.user_name {
        login.account_name = user_name;
    }
    if let Some(password) = bundle.password {
        login.password = password;
    }
    if let Some(token) = bundle.trusted_device_token {
        login.trusted_device_token = token;
    }
    if let Some(server) = bundle.server {
        session.server = resolve_host(&server);
    }
    if let Some(dbg) = bundle.debug {
        session.debug = dbg;
    }
    info!(server = %session.server, "credentials refreshed from bundle");

    if let (Some(token), Some(expires_ms)) = (bundle.auth_token, bundle.token_expires) {
        if let Some(expires) = DateTime::<Utc>::from_timestamp_millis(expires_ms) {
            if Utc::now() < expires {
                session.auth_token = Some(token);
                session.token_expires = Some(expires);
                debug!(expires = %expires, "adopted cached token from bundle");
                return Ok(CredentialOutcome::TokenAdopted);
            }
        }
    }

    Ok(CredentialOutcome::Refreshed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn login_with_bundle(url: Option<&str>, key: Option<&str>) -> LoginConfig {
        LoginConfig {
            account_name: "configured@example.com".to_owned(),
            password: "configured-password".to_owned(),
            trusted_device_token: "configured-token".to_owned(),
            patient_id: None,
            pro_credentials_url: url.map(str::to_owned),
            pro_credentials_key: key.map(str::to_owned),
        }
    }

    fn session() -> SessionState {
        SessionState::new("api.libreview.io".to_owned(), Duration::from_secs(30), false)
    }

    fn client() -> ApiClient {
        ApiClient::new(Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn first_attempt_never_fetches_the_bundle() {
        // Port 1 would fail instantly if the resolver issued a request
        let mut login = login_with_bundle(Some("http://127.0.0.1:1/creds"), Some("site-a"));
        let mut session = session();

        let outcome = resolve(&client(), 1, &mut login, &mut session).await.unwrap();
        assert_eq!(outcome, CredentialOutcome::UseConfigured);
        assert_eq!(login.account_name, "configured@example.com");
    }

    #[tokio::test]
    async fn missing_bundle_settings_use_configured_on_any_attempt() {
        let mut login = login_with_bundle(None, None);
        let mut session = session();

        let outcome = resolve(&client(), 5, &mut login, &mut session).await.unwrap();
        assert_eq!(outcome, CredentialOutcome::UseConfigured);

        let mut login = login_with_bundle(Some("http://127.0.0.1:1/creds"), None);
        let outcome = resolve(&client(), 5, &mut login, &mut session).await.unwrap();
        assert_eq!(outcome, CredentialOutcome::UseConfigured);
    }

    #[test]
    fn absent_key_is_a_fatal_credential_fetch() {
        let mut login = login_with_bundle(Some("https://creds.example"), Some("site-a"));
        let mut session = session();
        let document = json!({ "site-b": { "userName": "other@example.com" } });

        let result = apply_bundle(&document, "site-a", &mut login, &mut session);
        assert!(matches!(result, Err(SyncError::CredentialFetch(message)) if message.contains("site-a")));
    }

    #[test]
    fn bundle_overwrites_login_details_and_server() {
        let mut login = login_with_bundle(Some("https://creds.example"), Some("site-a"));
        let mut session = session();
        let document = json!({
            "site-a": {
                "userName": "rotated@example.com",
                "password": "rotated-password",
                "server": "EU",
                "debug": true
            }
        });

        let outcome = apply_bundle(&document, "site-a", &mut login, &mut session).unwrap();
        assert_eq!(outcome, CredentialOutcome::Refreshed);
        assert_eq!(login.account_name, "rotated@example.com");
        assert_eq!(login.password, "rotated-password");
        // Fields absent from the bundle keep their configured values
        assert_eq!(login.trusted_device_token, "configured-token");
        assert_eq!(session.server, "api-eu.libreview.io");
        assert!(session.debug);
    }

    #[test]
    fn unexpired_cached_token_is_adopted() {
        let mut login = login_with_bundle(Some("https://creds.example"), Some("site-a"));
        let mut session = session();
        let expires_ms = (Utc::now() + chrono::Duration::hours(1)).timestamp_millis();
        let document = json!({
            "site-a": { "authToken": "cached-token", "tokenExpires": expires_ms }
        });

        let outcome = apply_bundle(&document, "site-a", &mut login, &mut session).unwrap();
        assert_eq!(outcome, CredentialOutcome::TokenAdopted);
        assert_eq!(session.bearer(), Some("cached-token"));
        assert!(session.token_is_valid());
    }

    #[test]
    fn expired_cached_token_is_ignored() {
        let mut login = login_with_bundle(Some("https://creds.example"), Some("site-a"));
        let mut session = session();
        let document = json!({
            "site-a": { "authToken": "stale-token", "tokenExpires": 1_000 }
        });

        let outcome = apply_bundle(&document, "site-a", &mut login, &mut session).unwrap();
        assert_eq!(outcome, CredentialOutcome::Refreshed);
        assert!(session.auth_token.is_none());
    }
}
