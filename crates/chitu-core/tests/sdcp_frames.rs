//! Integration tests for the chitu-core SDCP codec and normalizer.
//!
//! These tests feed captured printer frames through the public API exactly
//! the way a session worker does: decode the text frame, then normalize the
//! status it carries against the previous snapshot.

use chitu_core::protocol::codec::{command_payload, decode_frame, encode_request};
use chitu_core::protocol::messages::{CommandCode, InboundFrame};
use chitu_core::{
    normalize_update, CommandArgs, CommandKind, MachineStatus, PrintStatus, PrinterDescriptor,
    PrinterStatus, SequenceCounter,
};

fn status_frame(status_code: i64, layer: u32) -> String {
    format!(
        r#"{{"Status":{{"CurrentStatus":[1],"PrintInfo":{{"Status":{status_code},"CurrentLayer":{layer},"TotalLayer":100,"Filename":"cube.goo"}}}},"MainboardID":"MB01","TimeStamp":1,"Topic":"sdcp/status/MB01"}}"#
    )
}

/// Decodes and normalizes one frame the way a session worker would.
fn apply(text: &str, previous: Option<&PrinterStatus>, seq: &SequenceCounter) -> Option<PrinterStatus> {
    match decode_frame(text).expect("frame must decode") {
        InboundFrame::Status { status, .. } => {
            normalize_update(&status, previous, seq.next()).expect("status must normalize")
        }
        other => panic!("expected a status frame, got {other:?}"),
    }
}

#[test]
fn test_sequence_of_status_frames_publishes_only_changes() {
    // Arrange
    let seq = SequenceCounter::new();
    let frames = [
        status_frame(3, 10),
        status_frame(3, 10),
        status_frame(4, 10),
        status_frame(3, 11),
    ];

    // Act
    let mut current: Option<PrinterStatus> = None;
    let mut published = Vec::new();
    for f in &frames {
        if let Some(next) = apply(f, current.as_ref(), &seq) {
            published.push(next.clone());
            current = Some(next);
        }
    }

    // Assert – the duplicate second frame produced nothing
    assert_eq!(published.len(), 3);
    assert_eq!(published[1].print_status, PrintStatus::Lifting);
    assert_eq!(published[2].current_layer, 11);
    for w in published.windows(2) {
        assert!(w[1].updated_at > w[0].updated_at);
    }
}

#[test]
fn test_malformed_status_does_not_touch_previous() {
    let seq = SequenceCounter::new();
    let first = apply(&status_frame(3, 10), None, &seq).unwrap();

    let bad = r#"{"Status":{"CurrentStatus":[1],"PrintInfo":{"Status":"exposing"}},"Topic":"sdcp/status/MB01"}"#;
    let decoded = decode_frame(bad).unwrap();
    let InboundFrame::Status { status, .. } = decoded else {
        panic!("expected status");
    };

    assert!(normalize_update(&status, Some(&first), seq.next()).is_err());
    assert_eq!(first.machine_status, MachineStatus::Printing);
    assert_eq!(first.current_layer, 10);
}

#[test]
fn test_command_request_matches_response_correlation() {
    // Arrange
    let printer = PrinterDescriptor::new("MB01", "Mars", "10.1.1.1".parse().unwrap());
    let data = command_payload(CommandKind::Stop, &CommandArgs::None);
    let request = encode_request(&printer, CommandCode::Stop, data, "req-42", 10).unwrap();
    let sent: serde_json::Value = serde_json::from_str(&request).unwrap();

    // Act – the printer echoes the RequestID back on the response topic
    let response = format!(
        r#"{{"Id":"MB01","Data":{{"Cmd":130,"Data":{{"Ack":0}},"RequestID":"{}","MainboardID":"MB01","TimeStamp":11}},"Topic":"sdcp/response/MB01"}}"#,
        sent["Data"]["RequestID"].as_str().unwrap()
    );

    // Assert
    match decode_frame(&response).unwrap() {
        InboundFrame::Response(r) => {
            assert_eq!(r.request_id, "req-42");
            assert_eq!(r.cmd, CommandCode::Stop.code());
            assert!(r.is_accepted());
        }
        other => panic!("unexpected {other:?}"),
    }
}
