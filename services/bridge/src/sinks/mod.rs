//! Ordered sink fan-out.
//!
//! Each non-empty batch is handed to every sink named in
//! `owner.storage_pref_list`, in order.  Sinks are independent: a failing
//! sink is counted and logged, and never prevents the others from running.
//! Unknown sink names never get this far (fatal at config load).

pub mod document;
pub mod elastic;
pub mod mqtt;

use crate::config::{BridgeConfig, SinkName};
use document::{DocStoreParams, DocumentSink};
use elastic::ElasticSink;
use mqtt::MqttSink;
use serde_json::Value;
use tracing::warn;

/// The configured sinks plus their delivery order.
pub struct SinkSet {
    order: Vec<SinkName>,
    rethinkdb: Option<DocumentSink>,
    mongo: Option<DocumentSink>,
    elastic: Option<ElasticSink>,
    mqtt: Option<MqttSink>,
}

impl SinkSet {
    /// A set that delivers to nothing.  Used by tests and dry runs.
    pub fn empty() -> SinkSet {
        SinkSet {
            order: Vec::new(),
            rethinkdb: None,
            mongo: None,
            elastic: None,
            mqtt: None,
        }
    }

    /// Build every sink named in the preference list.  `mqtt_client` is the
    /// shared bus connection, required when `mqtt` is listed.
    pub async fn init(
        cfg: &BridgeConfig,
        mqtt_client: Option<rumqttc::AsyncClient>,
    ) -> Result<SinkSet, SinkError> {
        let mut set = SinkSet::empty();
        set.order = cfg.owner.storage_pref_list.clone();

        for name in &cfg.owner.storage_pref_list {
            match name {
                SinkName::RethinkDb => {
                    let section = cfg.rethinkdb.as_ref().ok_or_else(|| {
                        SinkError::Config("rethinkdb section missing".to_owned())
                    })?;
                    let sink = DocumentSink::connect(DocStoreParams::from_rethinkdb(section)).await?;
                    set.rethinkdb = Some(sink);
                }
                SinkName::Mongo => {
                    let section = cfg
                        .mongo
                        .as_ref()
                        .ok_or_else(|| SinkError::Config("mongo section missing".to_owned()))?;
                    let sink = DocumentSink::connect(DocStoreParams::from_mongo(section)).await?;
                    set.mongo = Some(sink);
                }
                SinkName::Elastic => {
                    let section = cfg
                        .elastic
                        .as_ref()
                        .ok_or_else(|| SinkError::Config("elastic section missing".to_owned()))?;
                    set.elastic = Some(ElasticSink::new(section)?);
                }
                SinkName::Mqtt => {
                    let section = cfg
                        .mqtt
                        .as_ref()
                        .ok_or_else(|| SinkError::Config("mqtt section missing".to_owned()))?;
                    let client = mqtt_client.clone().ok_or_else(|| {
                        SinkError::Config("mqtt listed but bus connection not initialized".to_owned())
                    })?;
                    set.mqtt = Some(MqttSink::new(
                        client,
                        section.up_topic.clone(),
                        mqtt::parse_qos(section.up_qos)?,
                    ));
                }
            }
        }
        Ok(set)
    }

    /// Deliver one batch to every configured sink, in preference order.
    pub async fn deliver(&self, documents: &[Value]) {
        for name in &self.order {
            match name {
                SinkName::RethinkDb => {
                    if let Some(sink) = &self.rethinkdb {
                        if let Err(e) = sink.insert_batch(documents).await {
                            warn!(sink = "rethinkdb", error = %e, "document store insert failed");
                        }
                    }
                }
                SinkName::Mongo => {
                    if let Some(sink) = &self.mongo {
                        if let Err(e) = sink.insert_batch(documents).await {
                            warn!(sink = "mongo", error = %e, "document store insert failed");
                        }
                    }
                }
                SinkName::Elastic => {
                    if let Some(sink) = &self.elastic {
                        if let Err(e) = sink.bulk_index(documents).await {
                            warn!(sink = "elastic", error = %e, "bulk index failed");
                        }
                    }
                }
                SinkName::Mqtt => {
                    if let Some(sink) = &self.mqtt {
                        if let Err(e) = sink.publish_batch(documents).await {
                            warn!(sink = "mqtt", error = %e, "uplink publish failed");
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SinkError {
    Config(String),
    Connect(String),
    Serialize(String),
    Write(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Config(s) => write!(f, "sink configuration error: {}", s),
            SinkError::Connect(s) => write!(f, "sink connection error: {}", s),
            SinkError::Serialize(s) => write!(f, "sink serialization error: {}", s),
            SinkError::Write(s) => write!(f, "sink write error: {}", s),
        }
    }
}

impl std::error::Error for SinkError {}
