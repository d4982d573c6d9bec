use std::fs;
use std::path::{Path, PathBuf};

use beacon_core::Conversation;
use beacon_extract::{extract, extract_fields, locate_beacon_note, OrdinalTableLocator};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ExtractionSnapshot {
    conversation_id: String,
    fields: Vec<(String, String)>,
}

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures root")
}

fn load_conversation(name: &str) -> Conversation {
    let path = fixtures_root().join("conversations").join(name);
    let text = fs::read_to_string(&path).expect("read conversation fixture");
    let envelope: serde_json::Value = serde_json::from_str(&text).expect("parse conversation fixture");
    serde_json::from_value(envelope["item"].clone()).expect("decode conversation")
}

#[test]
fn golden_snapshot_beacon_note_conversation() {
    let convo = load_conversation("beacon-note.json");
    let extraction = extract(&convo).unwrap().expect("beacon fields");

    let text = fs::read_to_string(fixtures_root().join("conversations/beacon-note.snapshot.json"))
        .expect("read snapshot");
    let expected: ExtractionSnapshot = serde_json::from_str(&text).expect("parse snapshot");

    let actual: Vec<(String, String)> = extraction
        .fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert_eq!(extraction.conversation_id.as_str(), expected.conversation_id);
    assert_eq!(actual, expected.fields);
}

#[test]
fn later_beacon_notes_are_never_consulted() {
    let convo = load_conversation("beacon-note.json");
    let note = locate_beacon_note(&convo).expect("beacon note");
    assert!(note.body.as_deref().unwrap_or_default().contains("Beacon Submission"));

    let extraction = extract(&convo).unwrap().unwrap();
    assert_ne!(extraction.fields.get("roles"), Some("anonymous"));
}

#[test]
fn conversation_without_widget_note_has_no_fields() {
    let convo = load_conversation("no-beacon.json");
    assert!(locate_beacon_note(&convo).is_none());
    assert!(extract(&convo).unwrap().is_none());
}

#[test]
fn raw_note_fixture_selects_second_table() {
    let body = fs::read_to_string(fixtures_root().join("notes/customer-information.html"))
        .expect("read note fixture");
    let fields = extract_fields(&body, &OrdinalTableLocator).unwrap().unwrap();
    assert_eq!(fields.len(), 3);
    assert_eq!(fields.get("site_name"), Some("University of Colorado Boulder"));
    assert_eq!(fields.get("Page"), None);
}
