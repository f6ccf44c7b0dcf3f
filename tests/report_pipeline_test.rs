// ABOUTME: Unit tests for the report pipeline's pure stages
// ABOUTME: Covers device selection, completion-poll interpretation and document parsing
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use lvconnect::report::{interpret_poll, parse_report_document, select_primary_device, PollArgs, PollEnvelope, REPORT_URL_INDEX};
use lvconnect::session::{DataSource, DataSourceCatalog};
use lvconnect::{RetryPolicy, SyncError};

fn source(device_type: i64, days_data: Vec<i64>) -> DataSource {
    DataSource {
        device_type,
        firmware_version: "1.0.0".to_owned(),
        days_data,
    }
}

fn poll(operation: Option<&str>, urls: Option<Vec<Option<String>>>) -> PollEnvelope {
    PollEnvelope {
        args: Some(PollArgs {
            operation: operation.map(str::to_owned),
            urls,
        }),
    }
}

fn completed_urls(url: &str) -> Vec<Option<String>> {
    let mut urls = vec![None; REPORT_URL_INDEX + 1];
    urls[REPORT_URL_INDEX] = Some(url.to_owned());
    urls
}

#[test]
fn device_with_most_recent_data_becomes_primary() {
    let catalog = DataSourceCatalog(vec![
        ("older".to_owned(), source(4, vec![3, 7])),
        ("newer".to_owned(), source(4, vec![0, 1])),
    ]);

    let (primary, secondary) = select_primary_device(&catalog).unwrap();
    assert_eq!(primary.id, "newer");
    assert_eq!(secondary, vec!["older".to_owned()]);
}

#[test]
fn ties_keep_the_first_seen_device() {
    let catalog = DataSourceCatalog(vec![
        ("first".to_owned(), source(4, vec![1, 2])),
        ("second".to_owned(), source(4, vec![1])),
    ]);

    let (primary, _) = select_primary_device(&catalog).unwrap();
    assert_eq!(primary.id, "first");
}

#[test]
fn device_without_day_markers_loses_against_any_other() {
    let catalog = DataSourceCatalog(vec![
        ("silent".to_owned(), source(4, Vec::new())),
        ("active".to_owned(), source(4, vec![5])),
    ]);

    let (primary, secondary) = select_primary_device(&catalog).unwrap();
    assert_eq!(primary.id, "active");
    assert_eq!(secondary, vec!["silent".to_owned()]);
}

#[test]
fn empty_catalog_yields_no_primary_device() {
    let result = select_primary_device(&DataSourceCatalog::default());
    assert!(matches!(result, Err(SyncError::NoPrimaryDevice)));
}

#[test]
fn selection_carries_type_and_firmware_into_the_primary() {
    let catalog = DataSourceCatalog(vec![("only".to_owned(), source(40_066, vec![0]))]);

    let (primary, secondary) = select_primary_device(&catalog).unwrap();
    assert_eq!(primary.type_id, 40_066);
    assert_eq!(primary.firmware_version, "1.0.0");
    assert!(secondary.is_empty());
}

#[test]
fn started_operation_is_a_retryable_pending_report() {
    let result = interpret_poll(poll(Some("started"), None));
    assert!(matches!(result, Err(SyncError::ReportPending)));
    assert!(SyncError::ReportPending.is_retryable());
}

#[test]
fn update_operation_yields_the_daily_log_url() {
    let envelope = poll(Some("update"), Some(completed_urls("https://reports.example/daily")));
    assert_eq!(interpret_poll(envelope).unwrap(), "https://reports.example/daily");
}

#[test]
fn update_without_a_daily_log_slot_is_an_error() {
    let envelope = poll(Some("update"), Some(vec![Some("https://other".to_owned())]));
    assert!(matches!(interpret_poll(envelope), Err(SyncError::NoReportUrl)));

    let envelope = poll(Some("update"), None);
    assert!(matches!(interpret_poll(envelope), Err(SyncError::NoReportUrl)));
}

#[test]
fn unknown_operation_fails_with_the_raw_name() {
    let result = interpret_poll(poll(Some("error"), None));
    assert!(matches!(result, Err(SyncError::ReportFailed { operation }) if operation == "error"));
}

#[test]
fn response_without_args_is_unexpected() {
    let result = interpret_poll(PollEnvelope { args: None });
    assert!(matches!(result, Err(SyncError::UnexpectedResponse { .. })));
}

#[tokio::test]
async fn poll_retries_until_the_report_completes() {
    let responses = RefCell::new(VecDeque::from([
        poll(Some("started"), None),
        poll(Some("started"), None),
        poll(Some("update"), Some(completed_urls("https://reports.example/daily"))),
    ]));
    let polls = AtomicU32::new(0);

    let policy = RetryPolicy {
        min_delay: Duration::from_millis(1),
        max_attempts: 10,
        backoff_factor: 1.0,
    };
    let url = policy
        .run(|_| {
            polls.fetch_add(1, Ordering::SeqCst);
            let envelope = responses.borrow_mut().pop_front().unwrap();
            async move { interpret_poll(envelope) }
        })
        .await
        .unwrap();

    assert_eq!(url, "https://reports.example/daily");
    assert_eq!(polls.load(Ordering::SeqCst), 3);
}

#[test]
fn extracts_the_embedded_daily_log_document() {
    let html = concat!(
        "<html><script>\n",
        "var DataForLibreDailyLog = {\"Data\":{\"Days\":[{\"Glucose\":",
        "[{\"Timestamp\":1700000000,\"Value\":5.5}]}]}};\n",
        "</script></html>"
    );

    let data = parse_report_document(html).unwrap();
    assert_eq!(data.days.len(), 1);
    assert_eq!(data.days[0].glucose[0].timestamp, 1_700_000_000);
    assert!((data.days[0].glucose[0].value - 5.5).abs() < f64::EPSILON);
}

#[test]
fn missing_document_pattern_means_no_data_received() {
    let result = parse_report_document("<html>report unavailable</html>");
    assert!(matches!(result, Err(SyncError::NoDataReceived)));
}

#[test]
fn malformed_document_payload_is_rejected() {
    let result = parse_report_document("var DataForLibreDailyLog = {not json};");
    assert!(matches!(result, Err(SyncError::MalformedPayload(_))));
}
