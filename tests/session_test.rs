// ABOUTME: Unit tests for session state: token lifetime and catalog decoding
// ABOUTME: Verifies validity short-circuits and JSON encounter-order preservation
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use lvconnect::session::{AuthTicket, DataSourceCatalog};
use lvconnect::SessionState;

fn session() -> SessionState {
    SessionState::new("api.libreview.io".to_owned(), Duration::from_secs(30), false)
}

#[test]
fn fresh_session_has_no_valid_token() {
    assert!(!session().token_is_valid());
}

#[test]
fn adopted_ticket_makes_the_token_valid_for_its_duration() {
    let mut session = session();
    session.adopt_ticket(&AuthTicket {
        token: "tok-1".to_owned(),
        duration: 60_000,
    });

    assert!(session.token_is_valid());
    assert_eq!(session.bearer(), Some("tok-1"));
}

#[test]
fn expired_ticket_is_not_valid() {
    let mut session = session();
    session.adopt_ticket(&AuthTicket {
        token: "tok-1".to_owned(),
        duration: -1_000,
    });

    assert!(!session.token_is_valid());
}

#[test]
fn newer_ticket_replaces_the_cached_token() {
    let mut session = session();
    session.adopt_ticket(&AuthTicket {
        token: "tok-1".to_owned(),
        duration: 60_000,
    });
    session.adopt_ticket(&AuthTicket {
        token: "tok-2".to_owned(),
        duration: 60_000,
    });

    assert_eq!(session.bearer(), Some("tok-2"));
}

#[test]
fn catalog_preserves_json_encounter_order() {
    let json = r#"{
        "bbb": {"type": 2, "firmwareVersion": "2.0", "daysData": [1]},
        "aaa": {"type": 1, "firmwareVersion": "1.0", "daysData": [0]},
        "ccc": {"type": 3, "firmwareVersion": "3.0", "daysData": []}
    }"#;

    let catalog: DataSourceCatalog = serde_json::from_str(json).unwrap();
    let ids: Vec<&str> = catalog.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["bbb", "aaa", "ccc"]);
    assert_eq!(catalog[1].1.device_type, 1);
}

#[test]
fn catalog_tolerates_missing_optional_fields() {
    let catalog: DataSourceCatalog = serde_json::from_str(r#"{"dev": {"type": 4}}"#).unwrap();
    assert_eq!(catalog[0].1.firmware_version, "");
    assert!(catalog[0].1.days_data.is_empty());
}
