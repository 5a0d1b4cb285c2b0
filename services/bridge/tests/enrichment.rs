/// Tests for the enrichment stage: decoder dispatch through the inventory,
/// filter counters, and timestamp synthesis on the way to the sinks.
use axb_protocol::ArrivalTime;
use bridge::connection::RawFrame;
use bridge::decoders::DecoderRegistry;
use bridge::filter::FilterSet;
use bridge::metrics;
use bridge::pipeline::{Pipeline, SharedState};
use bridge::sinks::SinkSet;
use std::collections::HashMap;
use std::sync::Arc;

const DEVICE: &str = "64-7F-DA-00-00-00-07-85";

fn frame(payload: &str) -> RawFrame {
    RawFrame {
        appx_uri: "ws://appx.test".to_owned(),
        appx_id: "appx-1".to_owned(),
        payload: payload.to_owned(),
    }
}

fn pipeline_with(types: &[&str], euis: &[&str], inventory: &[(&str, &str)]) -> Pipeline {
    let types: Vec<String> = types.iter().map(|s| s.to_string()).collect();
    let euis: Vec<String> = euis.iter().map(|s| s.to_string()).collect();
    let filters = FilterSet::compile(&types, &euis).expect("compile filters");
    let inventory: HashMap<String, String> = inventory
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Pipeline::new(
        Arc::new(SharedState::new(filters, inventory, DecoderRegistry::builtin())),
        SinkSet::empty(),
    )
}

fn open_pipeline(inventory: &[(&str, &str)]) -> Pipeline {
    pipeline_with(&["*"], &[".*"], inventory)
}

/// Test: an updf from an inventoried device gets its decoded payload
/// attached under `payload`.
#[test]
fn inventoried_updf_gets_payload_attached() {
    let pipeline = open_pipeline(&[(DEVICE, "tracknet-gps")]);
    let wire = format!(
        r#"{{"msgtype":"updf","DevEui":"{}","upid":49373205491740460,"FRMPayload":"00FF0169"}}"#,
        DEVICE
    );
    let docs = pipeline.prepare_batch(&[frame(&wire)]);
    assert_eq!(docs.len(), 1);
    let battery = docs[0]["payload"]["battery"].as_f64().expect("battery");
    assert!((battery - 3.61).abs() < 1e-9);
    // The large identifier survives enrichment untouched.
    assert_eq!(docs[0]["upid"].to_string(), "49373205491740460");
}

/// Test: a device absent from the inventory leaves the message unchanged —
/// this is not an error.
#[test]
fn device_not_in_inventory_is_forwarded_unchanged() {
    let pipeline = open_pipeline(&[]);
    let wire = format!(
        r#"{{"msgtype":"updf","DevEui":"{}","FRMPayload":"00FF0169"}}"#,
        DEVICE
    );
    let docs = pipeline.prepare_batch(&[frame(&wire)]);
    assert_eq!(docs.len(), 1);
    assert!(docs[0].get("payload").is_none());
}

/// Test: an inventory type with no registered decoder leaves the message
/// unchanged.
#[test]
fn unknown_device_type_is_forwarded_unchanged() {
    let pipeline = open_pipeline(&[(DEVICE, "mystery-sensor")]);
    let wire = format!(
        r#"{{"msgtype":"updf","DevEui":"{}","FRMPayload":"00FF0169"}}"#,
        DEVICE
    );
    let docs = pipeline.prepare_batch(&[frame(&wire)]);
    assert_eq!(docs.len(), 1);
    assert!(docs[0].get("payload").is_none());
}

/// Test: a decoder failure drops the attachment, not the message.
#[test]
fn decoder_failure_is_forwarded_unchanged() {
    let pipeline = open_pipeline(&[(DEVICE, "tracknet-gps")]);
    let failed_before = metrics::MESSAGES_DECODING_FAILED.get();
    let wire = format!(
        // 0xFF is not a known data channel
        r#"{{"msgtype":"updf","DevEui":"{}","FRMPayload":"FF00"}}"#,
        DEVICE
    );
    let docs = pipeline.prepare_batch(&[frame(&wire)]);
    assert_eq!(docs.len(), 1);
    assert!(docs[0].get("payload").is_none());
    assert_eq!(metrics::MESSAGES_DECODING_FAILED.get() - failed_before, 1);
}

/// Test: only data-bearing upstream variants are enriched; a dndf with a
/// payload passes through untouched.
#[test]
fn dndf_is_not_enriched() {
    let pipeline = open_pipeline(&[(DEVICE, "tracknet-gps")]);
    let wire = format!(
        r#"{{"msgtype":"dndf","MsgId":9,"DevEui":"{}","FRMPayload":"00FF0169"}}"#,
        DEVICE
    );
    let docs = pipeline.prepare_batch(&[frame(&wire)]);
    assert_eq!(docs.len(), 1);
    assert!(docs[0].get("payload").is_none());
}

/// Test: an undecodable frame is dropped and counted, and never reaches the
/// documents.
#[test]
fn undecodable_frame_is_dropped() {
    let pipeline = open_pipeline(&[]);
    let decode_failed_before = metrics::MESSAGES_DECODE_FAILED.get();
    let docs = pipeline.prepare_batch(&[frame("{not json"), frame(r#"{"msgtype":"upwat"}"#)]);
    assert!(docs.is_empty());
    assert_eq!(metrics::MESSAGES_DECODE_FAILED.get() - decode_failed_before, 2);
}

/// Test: filter rejections drop messages and count per reason, labelled by
/// message type.
#[test]
fn filter_rejections_count_by_reason() {
    let pipeline = pipeline_with(&["updf"], &["^64-7F-.*"], &[]);

    let deveui_before = metrics::MESSAGES_DROPPED_BY_DEVEUI
        .with_label_values(&["updf"])
        .get();
    let type_before = metrics::MESSAGES_DROPPED_BY_TYPE
        .with_label_values(&["dntxed"])
        .get();

    let batch = vec![
        frame(r#"{"msgtype":"updf","DevEui":"64-7F-DA-00-00-00-07-85"}"#),
        frame(r#"{"msgtype":"updf","DevEui":"80-7B-85-90-20-00-05-5A"}"#),
        frame(r#"{"msgtype":"dntxed","MsgId":1,"DevEui":"64-7F-DA-00-00-00-07-85"}"#),
    ];
    let docs = pipeline.prepare_batch(&batch);

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["DevEui"].as_str(), Some("64-7F-DA-00-00-00-07-85"));
    assert_eq!(
        metrics::MESSAGES_DROPPED_BY_DEVEUI
            .with_label_values(&["updf"])
            .get()
            - deveui_before,
        1
    );
    assert_eq!(
        metrics::MESSAGES_DROPPED_BY_TYPE
            .with_label_values(&["dntxed"])
            .get()
            - type_before,
        1
    );
}

/// Test: a message without a wire timestamp leaves the pipeline with a
/// synthesized second-precision ArrTime; a wire timestamp survives truncated.
#[test]
fn timestamps_are_synthesized_or_truncated() {
    let pipeline = open_pipeline(&[]);

    let before = ArrivalTime::now().secs();
    let docs = pipeline.prepare_batch(&[
        frame(r#"{"msgtype":"dnacked","MsgId":7}"#),
        frame(r#"{"msgtype":"updf","DevEui":"64-7F-DA-00-00-00-07-85","ArrTime":1532602005.487868}"#),
    ]);
    let after = ArrivalTime::now().secs();

    let synthesized = docs[0]["ArrTime"].as_i64().expect("ArrTime");
    assert!(synthesized >= before - 2 && synthesized <= after + 2);
    assert_eq!(docs[0]["SynthTime"].as_bool(), Some(true));

    assert_eq!(docs[1]["ArrTime"].as_i64(), Some(1532602005));
    assert!(docs[1].get("SynthTime").is_none());
}
