//! Downlink path: pub/sub bus → validation → a live appx session.
//!
//! Drives the shared bus event loop (which also flushes uplink publishes)
//! and re-subscribes to the downlink topic on every connack.  Each bus
//! payload is a JSON array of downlink commands; valid commands are written
//! round-robin across the live sessions.

use crate::connection::ConnPool;
use crate::metrics;
use axb_protocol::{AppxMessage, DnDfMsg};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run the downlink handler until shutdown.
pub async fn run_downlink(
    mut eventloop: EventLoop,
    client: AsyncClient,
    dn_topic: String,
    dn_qos: QoS,
    pool: ConnPool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %dn_topic, "bus connected, subscribing to downlink topic");
                    if let Err(e) = client.subscribe(dn_topic.clone(), dn_qos).await {
                        error!(error = %e, "downlink subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    metrics::MESSAGES_RECEIVED_MQTT.inc();
                    handle_downlink_payload(&publish.payload, &pool).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "bus connection lost, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            },
            _ = shutdown_rx.changed() => {}
        }
        if *shutdown_rx.borrow() {
            info!("downlink handler stopping (shutdown)");
            return;
        }
    }
}

/// Validate and route one bus payload: a JSON array of `dndf` commands.
///
/// Invalid entries are dropped and counted by reason; the pool snapshot is
/// taken per command, so sessions joining mid-array are eligible.
pub async fn handle_downlink_payload(payload: &[u8], pool: &ConnPool) {
    let commands: Vec<DnDfMsg> = match serde_json::from_slice(payload) {
        Ok(commands) => commands,
        Err(e) => {
            warn!(error = %e, "undecodable downlink payload, dropping");
            metrics::MESSAGES_DROPPED_MQTT
                .with_label_values(&["malformed_json"])
                .inc();
            return;
        }
    };

    for command in commands {
        if command.msg_type != "dndf" || command.dev_eui.is_empty() {
            warn!(
                msg_type = %command.msg_type,
                "downlink command is not a well-formed dndf, dropping"
            );
            metrics::MESSAGES_DROPPED_MQTT
                .with_label_values(&["invalid_command"])
                .inc();
            continue;
        }

        let Some(conn) = pool.pick().await else {
            warn!("no live appx session for downlink, dropping");
            metrics::MESSAGES_DROPPED_MQTT
                .with_label_values(&["no_connection"])
                .inc();
            continue;
        };

        let message = AppxMessage::DnDf(command);
        let text = match message.encode().map(String::from_utf8) {
            Ok(Ok(text)) => text,
            _ => {
                metrics::MESSAGES_DROPPED_MQTT
                    .with_label_values(&["serialize"])
                    .inc();
                continue;
            }
        };
        match conn.write_text(text).await {
            Ok(()) => {
                metrics::MESSAGES_FORWARDED_TO_APPX
                    .with_label_values(&[&conn.appx_id, &conn.appx_uri])
                    .inc();
            }
            Err(e) => {
                warn!(uri = %conn.appx_uri, error = %e, "downlink write failed");
                metrics::MESSAGES_DROPPED_MQTT
                    .with_label_values(&["ws_write"])
                    .inc();
            }
        }
    }
}
