// ABOUTME: Conversion of vendor glucose records into Nightscout entry records
// ABOUTME: Applies the UTC-offset correction, unit conversion, and watermark advance
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::client::AGENT;
use crate::session::PrimaryDevice;

/// Fixed mmol/L → mg/dL conversion factor
pub const MMOL_TO_MGDL: f64 = 18.018;

/// Daily-log payload extracted from the downloaded report
#[derive(Debug, Clone, Deserialize)]
pub struct DailyLogData {
    /// Per-day record groups, in report order
    #[serde(rename = "Days", default)]
    pub days: Vec<Day>,
}

/// One day's worth of glucose records
#[derive(Debug, Clone, Deserialize)]
pub struct Day {
    /// Glucose readings within the day, in report order
    #[serde(rename = "Glucose", default)]
    pub glucose: Vec<GlucoseReading>,
}

/// A single vendor glucose record
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GlucoseReading {
    /// Reading instant, epoch seconds UTC
    pub timestamp: i64,
    /// Reading value in mmol/L
    pub value: f64,
    /// Marks records emitted around a device time change
    #[serde(default)]
    pub is_time_change: bool,
}

/// Nightscout entry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Sensor glucose value in mg/dL
    pub sgv: i32,
    /// Reading instant, epoch milliseconds, patient-local
    pub date: i64,
    /// ISO-8601 rendering of `date`
    #[serde(rename = "dateString")]
    pub date_string: String,
    /// Originating device: agent/device-type/firmware
    pub device: String,
    /// Always `"sgv"`
    #[serde(rename = "type")]
    pub entry_type: String,
}

/// Convert a full daily-log payload into Nightscout entries.
///
/// The nested per-day sequences are flattened into one ordered sequence
/// preserving day order, then within-day order — the output is not
/// re-sorted. Each converted record advances the watermark to the
/// maximum adjusted timestamp seen; it never regresses.
#[must_use]
pub fn convert_all(
    data: &DailyLogData,
    primary: &PrimaryDevice,
    watermark: &mut Option<i64>,
    local_offset_secs: i64,
) -> Vec<Entry> {
    let device = format!(
        "{AGENT}/{}/{}",
        primary.type_id, primary.firmware_version
    );
    data.days
        .iter()
        .flat_map(|day| day.glucose.iter())
        .map(|glucose| convert_one_glucose(glucose, &device, watermark, local_offset_secs))
        .collect()
}

/// Convert one vendor glucose record into a Nightscout entry
fn convert_one_glucose(
    glucose: &GlucoseReading,
    device: &str,
    watermark: &mut Option<i64>,
    local_offset_secs: i64,
) -> Entry {
    let timestamp = glucose.timestamp + local_offset_secs;
    if watermark.is_none_or(|current| timestamp > current) {
        *watermark = Some(timestamp);
    }

    let date = timestamp * 1000;
    Entry {
        sgv: (glucose.value * MMOL_TO_MGDL).round() as i32,
        date,
        date_string: iso_timestamp(date),
        device: device.to_owned(),
        entry_type: "sgv".to_owned(),
    }
}

fn iso_timestamp(epoch_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
        .map(|instant| instant.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}
