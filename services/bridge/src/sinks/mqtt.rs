//! Pub/sub sink and the shared bus connection.
//!
//! One MQTT connection serves both directions: the sink publishes each
//! batch as a single JSON array to the uplink topic, and the downlink
//! handler drives the event loop (subscription included).  The event loop
//! reconnects on its own; the subscription is re-issued on every connack.

use super::SinkError;
use crate::config::MqttConfig;
use crate::metrics;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS, TlsConfiguration, Transport};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::info;

/// Map a config QoS level (0/1/2) to the protocol QoS.
pub fn parse_qos(level: u8) -> Result<QoS, SinkError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(SinkError::Config(format!("invalid QoS level {}", other))),
    }
}

/// Build the shared bus connection from the first configured broker.
///
/// TLS brokers (`ssl://`, `mqtts://`, or port 8883) require
/// `mqtt.trust_chain`; a client certificate pair is optional on top.
pub fn connect(cfg: &MqttConfig, client_id: &str) -> Result<(AsyncClient, EventLoop), SinkError> {
    let broker = cfg
        .brokers
        .first()
        .ok_or_else(|| SinkError::Config("no mqtt brokers configured".to_owned()))?;
    let (host, port, tls) = parse_broker(broker)?;

    let mut options = MqttOptions::new(client_id, &host, port);
    options.set_credentials(cfg.user.clone(), cfg.password.clone());
    options.set_keep_alive(Duration::from_secs(30));

    if tls {
        let chain_path = cfg.trust_chain.as_ref().ok_or_else(|| {
            SinkError::Config("TLS broker but mqtt.trust_chain not configured".to_owned())
        })?;
        let ca = std::fs::read(chain_path)
            .map_err(|e| SinkError::Config(format!("reading '{}': {}", chain_path, e)))?;
        let client_auth = match (&cfg.certificate, &cfg.private_key) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path)
                    .map_err(|e| SinkError::Config(format!("reading '{}': {}", cert_path, e)))?;
                let key = std::fs::read(key_path)
                    .map_err(|e| SinkError::Config(format!("reading '{}': {}", key_path, e)))?;
                Some((cert, key))
            }
            _ => None,
        };
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }

    info!(broker = %broker, client_id = %client_id, "bus connection configured");
    Ok(AsyncClient::new(options, 64))
}

fn parse_broker(broker: &str) -> Result<(String, u16, bool), SinkError> {
    let (scheme, rest) = match broker.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", broker),
    };
    let mut tls = matches!(scheme, "ssl" | "tls" | "mqtts");
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host.to_owned(),
            port.parse::<u16>()
                .map_err(|_| SinkError::Config(format!("invalid broker port in '{}'", broker)))?,
        ),
        None => (rest.to_owned(), if tls { 8883 } else { 1883 }),
    };
    if port == 8883 {
        tls = true;
    }
    Ok((host, port, tls))
}

// ---------------------------------------------------------------------------
// Uplink sink
// ---------------------------------------------------------------------------

pub struct MqttSink {
    client: AsyncClient,
    topic: String,
    qos: QoS,
}

impl MqttSink {
    pub fn new(client: AsyncClient, topic: String, qos: QoS) -> MqttSink {
        MqttSink { client, topic, qos }
    }

    /// Publish the batch as one JSON array, retain = false.
    pub async fn publish_batch(&self, documents: &[Value]) -> Result<(), SinkError> {
        let payload =
            serde_json::to_vec(documents).map_err(|e| SinkError::Serialize(e.to_string()))?;
        let started = Instant::now();
        let result = self
            .client
            .publish(self.topic.clone(), self.qos, false, payload)
            .await;
        metrics::MQTT_DURATION_MILLIS.observe(started.elapsed().as_millis() as f64);
        match result {
            Ok(()) => {
                metrics::MESSAGES_PUBLISHED_MQTT.inc_by(documents.len() as u64);
                Ok(())
            }
            Err(e) => {
                metrics::MQTT_PUBLISH_FAILED.inc();
                Err(SinkError::Write(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels_map_to_protocol_values() {
        assert_eq!(parse_qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(parse_qos(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(parse_qos(2).unwrap(), QoS::ExactlyOnce);
        assert!(parse_qos(3).is_err());
    }

    #[test]
    fn broker_strings_parse_scheme_host_and_port() {
        assert_eq!(
            parse_broker("tcp://broker.example.com:1883").unwrap(),
            ("broker.example.com".to_owned(), 1883, false)
        );
        assert_eq!(
            parse_broker("ssl://broker.example.com:8883").unwrap(),
            ("broker.example.com".to_owned(), 8883, true)
        );
        assert_eq!(
            parse_broker("broker.example.com").unwrap(),
            ("broker.example.com".to_owned(), 1883, false)
        );
        assert_eq!(
            parse_broker("broker.example.com:8883").unwrap(),
            ("broker.example.com".to_owned(), 8883, true)
        );
        assert!(parse_broker("tcp://broker.example.com:notaport").is_err());
    }
}
