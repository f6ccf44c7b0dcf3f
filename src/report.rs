// ABOUTME: Report pipeline: data-source discovery, watermark, generate, poll, download
// ABOUTME: Drives the vendor's asynchronous generate-poll-download report protocol
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{ApiClient, Envelope};
use crate::config::ConnectConfig;
use crate::errors::{SyncError, SyncResult};
use crate::session::{DataSourceCatalog, PrimaryDevice, SessionState};
use crate::transform::DailyLogData;
use crate::upload::{LastEntryLookup, NightscoutTarget};

/// Position of the daily-log report URL within the completed job's URL list
pub const REPORT_URL_INDEX: usize = 5;

/// Vendor report-id base; the concrete id is `REPORT_ID_BASE + device type`
const REPORT_ID_BASE: i64 = 500_000;

/// Client-side report id requesting the daily-log document
const CLIENT_REPORT_ID: i64 = 5;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportSettingsData {
    data_sources: Option<DataSourceCatalog>,
}

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    #[serde(rename = "PrimaryDeviceId")]
    primary_device_id: &'a str,
    #[serde(rename = "PrimaryDeviceTypeId")]
    primary_device_type_id: i64,
    #[serde(rename = "SecondaryDeviceIds")]
    secondary_device_ids: &'a [String],
    #[serde(rename = "PrintReportsWithPatientInformation")]
    print_reports_with_patient_information: bool,
    #[serde(rename = "ReportIds")]
    report_ids: [i64; 1],
    #[serde(rename = "ClientReportIDs")]
    client_report_ids: [i64; 1],
    #[serde(rename = "StartDates")]
    start_dates: [i64; 1],
    #[serde(rename = "EndDate")]
    end_date: i64,
    #[serde(rename = "PatientId")]
    patient_id: &'a str,
    #[serde(rename = "CultureCode")]
    culture_code: &'static str,
}

#[derive(Debug, Deserialize)]
struct ReportJob {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelData {
    /// Long-poll channel URL
    lp: Option<String>,
}

/// Completion-poll response; the vendor reports job progress through an
/// `args.operation` value instead of the usual data envelope
#[derive(Debug, Deserialize)]
pub struct PollEnvelope {
    /// Job progress arguments
    pub args: Option<PollArgs>,
}

/// Arguments of a completion-poll response
#[derive(Debug, Deserialize)]
pub struct PollArgs {
    /// `"started"` while generating, `"update"` on completion
    pub operation: Option<String>,
    /// Result URL list, populated on completion; individual slots may be null
    pub urls: Option<Vec<Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct ReportDocument {
    #[serde(rename = "Data")]
    data: DailyLogData,
}

/// Run the full report pipeline: discovery, watermark, device selection,
/// generation request, completion poll and download.
///
/// # Errors
///
/// Propagates each stage's tagged error; see the individual steps.
pub async fn fetch(
    client: &ApiClient,
    config: &ConnectConfig,
    session: &mut SessionState,
    last_lookup: Option<&dyn LastEntryLookup>,
) -> SyncResult<DailyLogData> {
    discover_data_sources(client, session).await?;
    determine_watermark(client, session, last_lookup, config.nightscout.as_ref()).await?;

    let (primary, secondary) = select_primary_device(&session.patient.data_sources)?;
    debug!(primary = %primary.id, secondary = secondary.len(), "selected devices");
    session.patient.primary_device = Some(primary);
    session.patient.secondary_device_ids = secondary;

    let poll_url = request_report(client, session, config.local_offset_secs()).await?;
    let channel_url = open_channel(client, session, &poll_url).await?;

    let policy = config.poll_retry_policy();
    let bearer = session.auth_token.clone();
    let report_url = policy
        .run(|attempt| {
            debug!(attempt, "polling report completion");
            let poll = client.get_json::<PollEnvelope>(&channel_url, bearer.as_deref());
            async move { interpret_poll(poll.await?) }
        })
        .await?;

    download_report(client, session, &report_url).await
}

/// Populate the patient's device catalog from the report-settings endpoint.
///
/// # Errors
///
/// `NoReportSettings` on an error payload, `UnexpectedResponse` when the
/// body has no recognizable shape.
pub async fn discover_data_sources(
    client: &ApiClient,
    session: &mut SessionState,
) -> SyncResult<()> {
    let url = format!(
        "https://{}{}/reportSettings",
        session.server, session.uri_prefix
    );
    let envelope: Envelope<ReportSettingsData> = client.get_json(&url, session.bearer()).await?;

    if let Some(ticket) = &envelope.ticket {
        session.adopt_ticket(ticket);
    }
    if let Some(data) = envelope.data {
        if let Some(sources) = data.data_sources {
            debug!(count = sources.len(), "received data sources");
            session.patient.data_sources = sources;
        }
        return Ok(());
    }
    if let Some(error) = envelope.error {
        return Err(SyncError::NoReportSettings(error.reason().to_owned()));
    }
    if let Some(message) = envelope.message {
        return Err(SyncError::NoReportSettings(message));
    }
    Err(SyncError::UnexpectedResponse {
        stage: "reportSettings",
    })
}

/// Resolve the last-synced instant: the injected lookup if provided, else
/// the dashboard query, else leave the watermark untouched.
///
/// A non-null result overwrites the session watermark; entry dates are in
/// epoch milliseconds while the watermark is patient-local seconds.
///
/// # Errors
///
/// `WatermarkLookup` when the injected query or the dashboard request fails.
pub async fn determine_watermark(
    client: &ApiClient,
    session: &mut SessionState,
    last_lookup: Option<&dyn LastEntryLookup>,
    nightscout: Option<&NightscoutTarget>,
) -> SyncResult<()> {
    let last_ms = if let Some(lookup) = last_lookup {
        lookup
            .last_entry_date()
            .await
            .map_err(|err| SyncError::WatermarkLookup(err.to_string()))?
    } else if let Some(target) = nightscout {
        target.last_synced_ms(client).await?
    } else {
        None
    };

    if let Some(ms) = last_ms {
        let watermark = ms / 1000;
        debug!(watermark, "watermark recovered from dashboard");
        session.last_data_tm = Some(watermark);
    }
    Ok(())
}

/// Pick the device anchoring report generation.
///
/// The device whose smallest `daysData` marker is lowest has the most
/// recent data and becomes primary; ties keep the first-seen device.
/// This mirrors observed vendor behavior and is preserved as-is,
/// including devices with empty `daysData` losing every comparison.
///
/// # Errors
///
/// `NoPrimaryDevice` when the catalog is empty.
pub fn select_primary_device(
    catalog: &DataSourceCatalog,
) -> SyncResult<(PrimaryDevice, Vec<String>)> {
    let mut best: Option<(usize, i64)> = None;
    for (index, (_, source)) in catalog.iter().enumerate() {
        let newest = source.days_data.iter().copied().min().unwrap_or(i64::MAX);
        if best.is_none_or(|(_, current)| newest < current) {
            best = Some((index, newest));
        }
    }

    let (primary_index, _) = best.ok_or(SyncError::NoPrimaryDevice)?;
    let (id, source) = &catalog[primary_index];
    let primary = PrimaryDevice {
        id: id.clone(),
        type_id: source.device_type,
        firmware_version: source.firmware_version.clone(),
    };
    let secondary = catalog
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != primary_index)
        .map(|(_, (id, _))| id.clone())
        .collect();
    Ok((primary, secondary))
}

/// POST the report-generation job and return its polling URL.
///
/// The window lower bound is half-open: one second past the watermark,
/// shifted back to UTC, so the watermark record itself is not re-included.
///
/// # Errors
///
/// `ReportRequestFailed` when no polling URL comes back, `Config` when
/// the pipeline reaches this stage without a device or watermark.
pub async fn request_report(
    client: &ApiClient,
    session: &mut SessionState,
    local_offset_secs: i64,
) -> SyncResult<String> {
    let Some(primary) = session.patient.primary_device.clone() else {
        return Err(SyncError::Config("no primary device selected".to_owned()));
    };
    let Some(watermark) = session.last_data_tm else {
        return Err(SyncError::Config("watermark not initialized".to_owned()));
    };
    let Some(patient_id) = session.patient.id.clone() else {
        return Err(SyncError::Config("patient context not bound".to_owned()));
    };

    let url = format!("https://{}/reports", session.server);
    let body = ReportRequest {
        primary_device_id: &primary.id,
        primary_device_type_id: primary.type_id,
        secondary_device_ids: &session.patient.secondary_device_ids,
        print_reports_with_patient_information: false,
        report_ids: [REPORT_ID_BASE + primary.type_id],
        client_report_ids: [CLIENT_REPORT_ID],
        start_dates: [watermark - local_offset_secs + 1],
        end_date: Utc::now().timestamp(),
        patient_id: &patient_id,
        culture_code: "en-US",
    };
    let envelope: Envelope<ReportJob> = client.post_json(&url, &body, session.bearer()).await?;

    if let Some(ticket) = &envelope.ticket {
        session.adopt_ticket(ticket);
    }
    if let Some(data) = envelope.data {
        return data
            .url
            .ok_or_else(|| SyncError::ReportRequestFailed("no URL for channels returned".to_owned()));
    }
    if let Some(error) = envelope.error {
        return Err(SyncError::ReportRequestFailed(error.reason().to_owned()));
    }
    Err(SyncError::UnexpectedResponse { stage: "reports" })
}

/// GET the polling URL once to obtain the long-poll channel URL.
///
/// # Errors
///
/// `NoChannelAvailable` when the response carries no channel.
pub async fn open_channel(
    client: &ApiClient,
    session: &SessionState,
    poll_url: &str,
) -> SyncResult<String> {
    let envelope: Envelope<ChannelData> = client.get_json(poll_url, session.bearer()).await?;
    match envelope.data {
        Some(data) => data.lp.ok_or(SyncError::NoChannelAvailable),
        None => Err(SyncError::UnexpectedResponse { stage: "channels" }),
    }
}

/// Interpret one completion-poll response.
///
/// `"started"` means the report is still generating — a retryable soft
/// failure. `"update"` carries the result URL list with the daily-log
/// document at [`REPORT_URL_INDEX`]. Any other operation is a hard
/// failure carrying the raw operation name for diagnostics.
///
/// # Errors
///
/// `ReportPending`, `ReportFailed`, `NoReportUrl` or `UnexpectedResponse`
/// per the rules above.
pub fn interpret_poll(envelope: PollEnvelope) -> SyncResult<String> {
    let Some(args) = envelope.args else {
        return Err(SyncError::UnexpectedResponse { stage: "poll" });
    };
    match args.operation.as_deref() {
        Some("started") => Err(SyncError::ReportPending),
        Some("update") => args
            .urls
            .and_then(|mut urls| {
                urls.get_mut(REPORT_URL_INDEX)
                    .and_then(std::option::Option::take)
            })
            .ok_or(SyncError::NoReportUrl),
        Some(operation) => Err(SyncError::ReportFailed {
            operation: operation.to_owned(),
        }),
        None => Err(SyncError::UnexpectedResponse { stage: "poll" }),
    }
}

/// Download the finished report and extract its embedded data.
///
/// This endpoint does not accept bearer headers; the token rides along
/// as a query parameter instead.
///
/// # Errors
///
/// `NoDataReceived` when the expected pattern is absent from the HTML,
/// `MalformedPayload` when the captured text is not valid JSON.
pub async fn download_report(
    client: &ApiClient,
    session: &SessionState,
    report_url: &str,
) -> SyncResult<DailyLogData> {
    let token = session.bearer().unwrap_or_default();
    let html = client.get_html(report_url, &[("session", token)]).await?;
    parse_report_document(&html)
}

/// Extract the JSON object assigned to the report's known global variable.
///
/// # Errors
///
/// `NoDataReceived` when the assignment pattern is absent,
/// `MalformedPayload` when the captured object fails to parse.
pub fn parse_report_document(html: &str) -> SyncResult<DailyLogData> {
    let pattern = Regex::new(r"DataForLibreDailyLog\s*=\s*(\{.*\})")
        .map_err(|err| SyncError::Config(format!("invalid report pattern: {err}")))?;
    let captured = pattern
        .captures(html)
        .and_then(|caps| caps.get(1))
        .ok_or(SyncError::NoDataReceived)?;
    let document: ReportDocument = serde_json::from_str(captured.as_str())?;
    Ok(document.data)
}
