// ABOUTME: Login state machine: capability probe, credential POST, redirects, patient binding
// ABOUTME: Short-circuits while the cached token is valid; surfaces redirects as retryable
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::{ApiClient, Envelope};
use crate::config::LoginConfig;
use crate::errors::{SyncError, SyncResult};
use crate::hosts::resolve_host;
use crate::session::{AuthTicket, SessionState};

/// Outcome of a login pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    /// Cached token was still unexpired; no network login was issued
    Valid,
    /// A new token was obtained and the patient context was (re)bound
    Renewed,
}

/// Named states of the login flow.
///
/// The original continuation-chain flow is reimplemented as an explicit
/// machine: each state performs at most one request and names its
/// successor, which keeps every transition individually testable.
enum AuthStep {
    ProbeCapability,
    Authenticate,
    FetchIdentity,
    BindPatient,
    Done(LoginStatus),
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
    fingerprint: &'a str,
}

/// Payload shared by the login POST and the identity GET
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginData {
    #[serde(default)]
    redirect: bool,
    region: Option<String>,
    user: Option<UserPayload>,
    auth_ticket: Option<AuthTicket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPayload {
    id: Option<String>,
    account_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PatientData {
    patient: Option<PatientPayload>,
}

#[derive(Debug, Deserialize)]
struct PatientPayload {
    id: String,
}

/// What a login-shaped response told us, after session state was updated
enum LoginReply {
    /// Token and identity both present
    Identified,
    /// Token present, identity must be fetched separately
    Anonymous,
}

/// Execute the login state machine against the current session.
///
/// A received redirect repoints `session.server` through the host
/// resolver and surfaces as the retryable [`SyncError::Redirected`]; the
/// outer retry loop re-enters against the new host.
///
/// # Errors
///
/// `NotALibreViewServer` when the capability probe fails, `LoginRejected`
/// on bad credentials or unrecognizable payloads, `MissingPatientId` when
/// a managing account has no patient configured, and transport errors.
pub async fn authorize(
    client: &ApiClient,
    login: &LoginConfig,
    session: &mut SessionState,
) -> SyncResult<LoginStatus> {
    let mut step = if session.token_is_valid() {
        debug!(expires = ?session.token_expires, "current token is still valid");
        AuthStep::Done(LoginStatus::Valid)
    } else {
        AuthStep::ProbeCapability
    };

    loop {
        step = match step {
            AuthStep::ProbeCapability => {
                probe_capability(client, session).await?;
                AuthStep::Authenticate
            }
            AuthStep::Authenticate => {
                let url = format!("https://{}/auth/login", session.server);
                let body = LoginRequest {
                    email: &login.account_name,
                    password: &login.password,
                    fingerprint: &login.trusted_device_token,
                };
                let envelope: Envelope<LoginData> = client.post_json(&url, &body, None).await?;
                match apply_login_data(session, envelope, "login")? {
                    LoginReply::Identified => AuthStep::BindPatient,
                    LoginReply::Anonymous => AuthStep::FetchIdentity,
                }
            }
            AuthStep::FetchIdentity => {
                let url = format!("https://{}/user", session.server);
                let envelope: Envelope<LoginData> =
                    client.get_json(&url, session.bearer()).await?;
                match apply_login_data(session, envelope, "user")? {
                    LoginReply::Identified => AuthStep::BindPatient,
                    // The identity endpoint has no further fallback
                    LoginReply::Anonymous => {
                        return Err(SyncError::LoginRejected(
                            "identity endpoint returned no user".to_owned(),
                        ))
                    }
                }
            }
            AuthStep::BindPatient => {
                bind_patient(client, login, session).await?;
                AuthStep::Done(LoginStatus::Renewed)
            }
            AuthStep::Done(status) => return Ok(status),
        };
    }
}

/// Verify the `lvapi` marker header before sending credentials anywhere.
///
/// Guards against a spoofed or misconfigured host: a missing marker means
/// this is not a LibreView API server and the login is aborted.
///
/// # Errors
///
/// `NotALibreViewServer` when the marker header is absent.
pub async fn probe_capability(client: &ApiClient, session: &SessionState) -> SyncResult<()> {
    let url = format!("https://{}/auth/login", session.server);
    let response = client.options(&url).await?;
    match response.headers().get("lvapi") {
        Some(version) => {
            debug!(lvapi = ?version, "capability probe passed");
            Ok(())
        }
        None => Err(SyncError::NotALibreViewServer(session.server.clone())),
    }
}

/// Fold a login-shaped envelope into the session.
///
/// Handles the three shapes the login and identity endpoints produce:
/// a redirect instruction, a token with or without an embedded identity,
/// or an error payload.
fn apply_login_data(
    session: &mut SessionState,
    envelope: Envelope<LoginData>,
    stage: &'static str,
) -> SyncResult<LoginReply> {
    if let Some(error) = envelope.error {
        return Err(SyncError::LoginRejected(format!(
            "check credentials. Error: {}",
            error.reason()
        )));
    }
    let Some(data) = envelope.data else {
        return Err(SyncError::UnexpectedResponse { stage });
    };

    if data.redirect {
        let region = data.region.unwrap_or_default();
        session.server = resolve_host(&region);
        debug!(server = %session.server, "redirected");
        return Err(SyncError::Redirected {
            server: session.server.clone(),
        });
    }

    if let Some(ticket) = &data.auth_ticket {
        session.adopt_ticket(ticket);
    }
    match data.user {
        Some(user) if user.id.is_some() => {
            session.user.id = user.id;
            session.user.account_type = user.account_type;
            debug!(user = ?session.user.id, "login successful");
            Ok(LoginReply::Identified)
        }
        _ if session.auth_token.is_some() => Ok(LoginReply::Anonymous),
        _ => Err(SyncError::UnexpectedResponse { stage }),
    }
}

/// Bind the monitored patient context after a successful login.
///
/// Self-monitoring accounts (identity id equals the configured patient
/// id, or a `"pat"` account type) become their own patient. Managing
/// accounts fetch the configured patient's details and scope subsequent
/// calls through `uri_prefix`.
///
/// # Errors
///
/// `MissingPatientId` for a managing account without a configured
/// patient, `PatientLookup` when the details request fails.
pub async fn bind_patient(
    client: &ApiClient,
    login: &LoginConfig,
    session: &mut SessionState,
) -> SyncResult<()> {
    let self_monitoring = session.user.id.is_some()
        && (session.user.id == login.patient_id
            || session.user.account_type.as_deref() == Some("pat"));

    if self_monitoring {
        info!("patient is the user");
        session.patient.id.clone_from(&session.user.id);
        session.uri_prefix.clear();
        return Ok(());
    }

    let Some(patient_id) = login.patient_id.as_deref() else {
        return Err(SyncError::MissingPatientId);
    };
    info!("patient is not the user");

    let url = format!("https://{}/patients/{patient_id}", session.server);
    let envelope: Envelope<PatientData> = client.get_json(&url, session.bearer()).await?;

    // Several endpoints piggyback a refreshed ticket
    if let Some(ticket) = &envelope.ticket {
        session.adopt_ticket(ticket);
    }

    if let Some(error) = envelope.error {
        return Err(SyncError::PatientLookup(error.reason().to_owned()));
    }
    let Some(data) = envelope.data else {
        return Err(SyncError::UnexpectedResponse { stage: "patient" });
    };

    session.patient.id = Some(
        data.patient
            .map_or_else(|| patient_id.to_owned(), |patient| patient.id),
    );
    session.uri_prefix = format!("/patients/{patient_id}");
    debug!(patient = ?session.patient.id, "received patient details");
    Ok(())
}
