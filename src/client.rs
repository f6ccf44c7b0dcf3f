// ABOUTME: Shared HTTP client and vendor API response envelope types
// ABOUTME: JSON helpers with bearer auth, user agent and per-request timeout
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, ClientBuilder, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::SyncResult;
use crate::session::AuthTicket;

/// User-Agent value sent on every outbound request, also the leading
/// component of the Nightscout device string
pub const AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Error payload embedded in vendor responses
#[derive(Debug, Deserialize)]
pub struct ApiError {
    /// Human-readable reason supplied by the server
    pub message: Option<String>,
}

impl ApiError {
    /// Server-supplied message, or a placeholder when absent
    #[must_use]
    pub fn reason(&self) -> &str {
        self.message.as_deref().unwrap_or("no error message")
    }
}

/// Common envelope wrapping vendor API payloads.
///
/// Most endpoints answer with `data` on success, `error` or `message` on
/// failure, and may piggyback a refreshed auth `ticket` on any response.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    /// Success payload
    pub data: Option<T>,
    /// Failure payload
    pub error: Option<ApiError>,
    /// Alternate failure payload used by a few endpoints
    pub message: Option<String>,
    /// Refreshed auth ticket, adopted whenever present
    pub ticket: Option<AuthTicket>,
}

/// HTTP client shared by every pipeline stage.
///
/// One reqwest client per engine: connection pooling across the run, a
/// single per-request timeout, and the bridge's User-Agent on every call.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
}

impl ApiClient {
    /// Build a client with the configured per-request timeout.
    ///
    /// The timeout is a hard cutoff; an exceeded timeout surfaces as a
    /// transport error, indistinguishable from any other network failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying TLS backend cannot be initialized.
    pub fn new(fetch_timeout: Duration) -> SyncResult<Self> {
        let http = ClientBuilder::new()
            .timeout(fetch_timeout)
            .user_agent(AGENT)
            .build()?;
        Ok(Self { http })
    }

    /// Raw access for callers composing their own requests
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Issue an OPTIONS request, used by the capability probe
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request fails or times out.
    pub async fn options(&self, url: &str) -> SyncResult<Response> {
        let response = self
            .http
            .request(Method::OPTIONS, url)
            .header(ACCEPT, "*/*")
            .send()
            .await?;
        Ok(response)
    }

    /// GET a JSON payload, optionally with a bearer token
    ///
    /// # Errors
    ///
    /// Returns a transport error on network failure, or a malformed-payload
    /// error if the body does not deserialize into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> SyncResult<T> {
        let mut request = self.http.get(url).header(ACCEPT, "application/json");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?.json().await?)
    }

    /// POST a JSON body and parse the JSON response
    ///
    /// # Errors
    ///
    /// Returns a transport error on network failure, or a malformed-payload
    /// error if the body does not deserialize into `T`.
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> SyncResult<T> {
        let mut request = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?.json().await?)
    }

    /// GET an HTML document with query parameters, returning the raw body
    ///
    /// # Errors
    ///
    /// Returns a transport error on network failure or timeout.
    pub async fn get_html(&self, url: &str, query: &[(&str, &str)]) -> SyncResult<String> {
        let response = self
            .http
            .get(url)
            .query(query)
            .header(ACCEPT, "text/html")
            .send()
            .await?;
        Ok(response.text().await?)
    }
}
