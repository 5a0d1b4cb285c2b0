//! Typed metrics surface.
//!
//! All instruments live in a dedicated registry and are exposed in
//! Prometheus text format at `GET /metrics` on the `-p` port.  Counter and
//! histogram names are stable operational API; durations are milliseconds.

use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::error;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<T: prometheus::core::Collector + Clone + 'static>(metric: T) -> T {
    REGISTRY
        .register(Box::new(metric.clone()))
        .expect("metric registered twice");
    metric
}

fn counter(name: &str, help: &str) -> IntCounter {
    register(IntCounter::new(name, help).expect(name))
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    register(IntCounterVec::new(Opts::new(name, help), labels).expect(name))
}

fn duration_histogram(name: &str, help: &str) -> Histogram {
    let opts = HistogramOpts::new(name, help)
        .buckets(exponential_buckets(1.0, 10.0, 5).expect("buckets"));
    register(Histogram::with_opts(opts).expect(name))
}

// ---------------------------------------------------------------------------
// Process / connection instruments
// ---------------------------------------------------------------------------

pub static PROXY_INFO: Lazy<IntGaugeVec> = Lazy::new(|| {
    register(
        IntGaugeVec::new(
            Opts::new("appx_proxy_info", "Common bridge information"),
            &["appx_name", "owner_id"],
        )
        .expect("appx_proxy_info"),
    )
});

pub static WS_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new("appx_ws_connections", "Number of live appx WebSocket sessions")
            .expect("appx_ws_connections"),
    )
});

pub static WS_PING_SENT: Lazy<IntCounter> =
    Lazy::new(|| counter("appx_ws_ping_sent", "Pings sent on appx sessions"));

pub static WS_PONG_RCVD: Lazy<IntCounter> =
    Lazy::new(|| counter("appx_ws_pong_rcvd", "Pongs received on appx sessions"));

pub static RAW_MESSAGES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "appx_raw_messages_received",
        "Raw messages received per appx endpoint",
        &["appx_id", "appx_uri"],
    )
});

// ---------------------------------------------------------------------------
// Pipeline instruments
// ---------------------------------------------------------------------------

pub static MESSAGES_SEEN_BY_FILTER: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "appx_messages_received_by_filter",
        "Decoded messages that reached the filter",
        &["msg_type"],
    )
});

pub static MESSAGES_PASSED_FILTER: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "appx_messages_passed_by_filter",
        "Messages that passed the filter",
        &["msg_type"],
    )
});

pub static MESSAGES_DROPPED_BY_TYPE: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "appx_messages_dropped_by_type_wl",
        "Messages dropped by the type whitelist",
        &["msg_type"],
    )
});

pub static MESSAGES_DROPPED_BY_DEVEUI: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "appx_messages_dropped_by_deveui_wl",
        "Messages dropped by the DevEui whitelist",
        &["msg_type"],
    )
});

pub static MESSAGES_DECODE_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_messages_decode_failed",
        "Wire payloads dropped by the codec",
    )
});

pub static QUEUE_FLUSHED_BY_SIZE: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_queue_flushed_by_size",
        "Times the queue flushed on the size threshold",
    )
});

pub static QUEUE_FLUSHED_BY_TIME: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_queue_flushed_by_time",
        "Times the queue flushed on the time threshold",
    )
});

// ---------------------------------------------------------------------------
// Decoder instruments
// ---------------------------------------------------------------------------

pub static MESSAGES_HIT_DECODER: Lazy<IntCounter> =
    Lazy::new(|| counter("appx_messages_hit_decoder", "Messages dispatched to a decoder"));

pub static MESSAGES_DECODED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_messages_decoded_success",
        "Messages with a successfully decoded payload",
    )
});

pub static MESSAGES_DECODING_FAILED: Lazy<IntCounter> =
    Lazy::new(|| counter("appx_messages_decoding_failed", "Messages whose decoder failed"));

pub static MESSAGES_DECODER_NOT_FOUND: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_messages_decoder_not_found",
        "Messages whose device type has no registered decoder",
    )
});

pub static MESSAGES_LEFT_WITHOUT_DECODING: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_messages_left_without_decoding",
        "Messages from devices not listed in the inventory",
    )
});

// ---------------------------------------------------------------------------
// Sink instruments
// ---------------------------------------------------------------------------

pub static MESSAGES_STORED_DOCSTORE: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_messages_stored_docstore",
        "Messages stored in the document store",
    )
});

pub static DOCSTORE_INSERT_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_docstore_insert_fail",
        "Batches that failed to insert into the document store",
    )
});

pub static DOCSTORE_DURATION_MILLIS: Lazy<Histogram> = Lazy::new(|| {
    duration_histogram(
        "appx_docstore_duration_millis",
        "Document store insert duration",
    )
});

pub static MESSAGES_STORED_ELASTIC: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_messages_stored_elastic",
        "Messages indexed into the search index",
    )
});

pub static ELASTIC_INSERT_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_elastic_messages_insert_fail",
        "Batches that failed to bulk-index",
    )
});

pub static ELASTIC_DURATION_MILLIS: Lazy<Histogram> =
    Lazy::new(|| duration_histogram("appx_elastic_duration_millis", "Bulk index duration"));

pub static MESSAGES_PUBLISHED_MQTT: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_messages_published_mqtt",
        "Messages published to the uplink topic",
    )
});

pub static MQTT_PUBLISH_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_mqtt_messages_push_fail",
        "Batches that failed to publish to the uplink topic",
    )
});

pub static MQTT_DURATION_MILLIS: Lazy<Histogram> =
    Lazy::new(|| duration_histogram("appx_mqtt_duration_millis", "MQTT publish duration"));

// ---------------------------------------------------------------------------
// Downlink instruments
// ---------------------------------------------------------------------------

pub static MESSAGES_RECEIVED_MQTT: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "appx_messages_received_mqtt",
        "Downlink payloads received from the bus",
    )
});

pub static MESSAGES_FORWARDED_TO_APPX: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "appx_messages_forwarded_to_appx",
        "Downlink commands written to an appx session",
        &["appx_id", "appx_uri"],
    )
});

pub static MESSAGES_DROPPED_MQTT: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "appx_messages_dropped_mqtt",
        "Downlink commands dropped, by reason",
        &["error"],
    )
});

// ---------------------------------------------------------------------------
// HTTP exposition
// ---------------------------------------------------------------------------

/// Serve `GET /metrics` until the process exits.
pub async fn serve(port: u16) -> std::io::Result<()> {
    let router = Router::new().route("/metrics", get(render));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, router).await
}

async fn render() -> String {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buf) {
        error!(error = %e, "metrics encode failed");
    }
    String::from_utf8(buf).unwrap_or_default()
}
