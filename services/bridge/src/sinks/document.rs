//! Document-store sink.
//!
//! Inserts each batch as one write into a configured database/collection.
//! The session is health-checked before every insert; on failure the client
//! is rebuilt from the original parameters (addresses, pool bounds).  Both
//! the `rethinkdb` and `mongo` preference names construct this sink, from
//! their respective config sections.

use super::SinkError;
use crate::config::{MongoConfig, RethinkDbConfig};
use crate::metrics;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, ServerAddress};
use mongodb::Client;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Connection parameters, kept verbatim for reconnects.
#[derive(Debug, Clone)]
pub struct DocStoreParams {
    /// Full connection URI (mongo section).
    pub uri: Option<String>,
    /// `host:port` addresses (rethinkdb section: `uri` plus `uris`).
    pub addresses: Vec<String>,
    pub db: String,
    pub collection: String,
    /// Initial pool capacity.
    pub initial_cap: Option<u32>,
    /// Pool ceiling.
    pub max_open: Option<u32>,
}

impl DocStoreParams {
    pub fn from_rethinkdb(cfg: &RethinkDbConfig) -> DocStoreParams {
        let mut addresses = Vec::new();
        if let Some(uri) = &cfg.uri {
            addresses.push(uri.clone());
        }
        addresses.extend(cfg.uris.iter().cloned());
        DocStoreParams {
            uri: None,
            addresses,
            db: cfg.db.clone(),
            collection: cfg.collection.clone(),
            initial_cap: cfg.initial_cap,
            max_open: cfg.max_open,
        }
    }

    pub fn from_mongo(cfg: &MongoConfig) -> DocStoreParams {
        DocStoreParams {
            uri: Some(cfg.uri.clone()),
            addresses: Vec::new(),
            db: cfg.db.clone(),
            collection: cfg.collection.clone(),
            initial_cap: None,
            max_open: None,
        }
    }
}

pub struct DocumentSink {
    params: DocStoreParams,
    /// Health-check-and-reconnect is serialized by this mutex.
    client: Mutex<Client>,
}

impl DocumentSink {
    pub async fn connect(params: DocStoreParams) -> Result<DocumentSink, SinkError> {
        let client = build_client(&params).await?;
        info!(db = %params.db, collection = %params.collection, "document store connected");
        Ok(DocumentSink {
            params,
            client: Mutex::new(client),
        })
    }

    /// Insert the whole batch as one write, with duration and outcome
    /// metrics.
    pub async fn insert_batch(&self, documents: &[Value]) -> Result<(), SinkError> {
        let started = Instant::now();
        let result = self.try_insert(documents).await;
        metrics::DOCSTORE_DURATION_MILLIS.observe(started.elapsed().as_millis() as f64);
        match result {
            Ok(()) => {
                metrics::MESSAGES_STORED_DOCSTORE.inc_by(documents.len() as u64);
                Ok(())
            }
            Err(e) => {
                metrics::DOCSTORE_INSERT_FAILED.inc();
                Err(e)
            }
        }
    }

    async fn try_insert(&self, documents: &[Value]) -> Result<(), SinkError> {
        let client = {
            let mut guard = self.client.lock().await;
            if ping(&guard).await.is_err() {
                warn!("document store session lost, reconnecting with original parameters");
                *guard = build_client(&self.params).await?;
            }
            guard.clone()
        };

        let mut batch = Vec::with_capacity(documents.len());
        for value in documents {
            batch.push(to_bson_document(value)?);
        }
        client
            .database(&self.params.db)
            .collection::<Document>(&self.params.collection)
            .insert_many(batch, None)
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;
        Ok(())
    }
}

async fn ping(client: &Client) -> Result<(), mongodb::error::Error> {
    client
        .database("admin")
        .run_command(doc! { "ping": 1 }, None)
        .await
        .map(|_| ())
}

async fn build_client(params: &DocStoreParams) -> Result<Client, SinkError> {
    let mut options = if let Some(uri) = &params.uri {
        ClientOptions::parse(uri)
            .await
            .map_err(|e| SinkError::Connect(e.to_string()))?
    } else {
        let mut hosts = Vec::with_capacity(params.addresses.len());
        for address in &params.addresses {
            hosts.push(
                ServerAddress::parse(address).map_err(|e| SinkError::Connect(e.to_string()))?,
            );
        }
        ClientOptions::builder().hosts(hosts).build()
    };
    options.min_pool_size = params.initial_cap;
    options.max_pool_size = params.max_open;
    options.server_selection_timeout = Some(Duration::from_secs(5));
    Client::with_options(options).map_err(|e| SinkError::Connect(e.to_string()))
}

fn to_bson_document(value: &Value) -> Result<Document, SinkError> {
    match json_to_bson(value) {
        Bson::Document(document) => Ok(document),
        other => Err(SinkError::Serialize(format!(
            "expected a JSON object per message, got {}",
            other
        ))),
    }
}

/// 64-bit-safe JSON → BSON conversion.  Integer tokens that fit an `Int64`
/// stay native (both endpoints are 64-bit safe); anything wider stays an
/// exact decimal string rather than rounding through a double.
fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else {
                let token = n.to_string();
                if token.contains(['.', 'e', 'E']) {
                    n.as_f64().map(Bson::Double).unwrap_or(Bson::String(token))
                } else {
                    Bson::String(token)
                }
            }
        }
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => {
            let mut document = Document::new();
            for (key, item) in map {
                document.insert(key.clone(), json_to_bson(item));
            }
            Bson::Document(document)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integers_within_i64_stay_native() {
        let bson = json_to_bson(&json!({ "upid": 49373205491740460_i64 }));
        let document = match bson {
            Bson::Document(d) => d,
            other => panic!("expected document, got {}", other),
        };
        assert_eq!(document.get("upid"), Some(&Bson::Int64(49373205491740460)));
    }

    #[test]
    fn integers_beyond_i64_become_exact_strings() {
        let value: Value = serde_json::from_str(r#"{"upid":18446744073709551615}"#).expect("parse");
        let document = match json_to_bson(&value) {
            Bson::Document(d) => d,
            other => panic!("expected document, got {}", other),
        };
        assert_eq!(
            document.get("upid"),
            Some(&Bson::String("18446744073709551615".to_owned()))
        );
    }

    #[test]
    fn nested_arrays_and_objects_convert() {
        let value = json!({ "upinfo": [{ "rssi": -91.5, "ok": true }], "region": "EU863" });
        let document = match json_to_bson(&value) {
            Bson::Document(d) => d,
            other => panic!("expected document, got {}", other),
        };
        let upinfo = document.get_array("upinfo").expect("upinfo array");
        assert_eq!(upinfo.len(), 1);
        assert_eq!(document.get_str("region"), Ok("EU863"));
    }
}
