//! Search-index sink.
//!
//! One bulk-index request per batch, one item per message.  The index name
//! is the current UTC time formatted against the configured strftime-style
//! template (daily indices in practice); the document type is a constant
//! from config.

use super::SinkError;
use crate::config::ElasticConfig;
use crate::metrics;
use serde_json::Value;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

pub struct ElasticSink {
    http: reqwest::Client,
    hosts: Vec<String>,
    index_format: String,
    doc_type: String,
}

impl ElasticSink {
    pub fn new(cfg: &ElasticConfig) -> Result<ElasticSink, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SinkError::Connect(e.to_string()))?;
        Ok(ElasticSink {
            http,
            hosts: cfg.hosts.clone(),
            index_format: cfg.index.clone(),
            doc_type: cfg.doc_type.clone(),
        })
    }

    /// Bulk-index one batch, with duration and outcome metrics.
    pub async fn bulk_index(&self, documents: &[Value]) -> Result<(), SinkError> {
        let started = Instant::now();
        let result = self.try_bulk(documents).await;
        metrics::ELASTIC_DURATION_MILLIS.observe(started.elapsed().as_millis() as f64);
        match result {
            Ok(()) => {
                metrics::MESSAGES_STORED_ELASTIC.inc_by(documents.len() as u64);
                Ok(())
            }
            Err(e) => {
                metrics::ELASTIC_INSERT_FAILED.inc();
                Err(e)
            }
        }
    }

    async fn try_bulk(&self, documents: &[Value]) -> Result<(), SinkError> {
        let index = self.index_name()?;
        let body = self.build_bulk_body(&index, documents)?;

        let mut last_error = SinkError::Config("no elastic hosts configured".to_owned());
        for host in &self.hosts {
            let url = format!("{}/_bulk", host.trim_end_matches('/'));
            match self
                .http
                .post(&url)
                .header("content-type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error =
                        SinkError::Write(format!("{} returned {}", url, response.status()));
                }
                Err(e) => {
                    last_error = SinkError::Write(format!("{}: {}", url, e));
                }
            }
        }
        Err(last_error)
    }

    fn index_name(&self) -> Result<String, SinkError> {
        let mut name = String::new();
        // An invalid strftime token errors at format time; surface it as a
        // config error instead of aborting the emitter task.
        write!(name, "{}", chrono::Utc::now().format(&self.index_format)).map_err(|_| {
            SinkError::Config(format!("invalid elastic.index template '{}'", self.index_format))
        })?;
        Ok(name)
    }

    fn build_bulk_body(&self, index: &str, documents: &[Value]) -> Result<String, SinkError> {
        let mut body = String::new();
        for document in documents {
            let action =
                serde_json::json!({ "index": { "_index": index, "_type": self.doc_type } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(
                &serde_json::to_string(document).map_err(|e| SinkError::Serialize(e.to_string()))?,
            );
            body.push('\n');
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink(index: &str) -> ElasticSink {
        ElasticSink::new(&ElasticConfig {
            hosts: vec!["http://127.0.0.1:9200".to_owned()],
            index: index.to_owned(),
            doc_type: "logs".to_owned(),
        })
        .expect("build sink")
    }

    #[test]
    fn index_name_follows_template() {
        let name = sink("bridge-%Y.%m.%d").index_name().expect("format");
        assert!(name.starts_with("bridge-2"));
        assert_eq!(name.len(), "bridge-2026.01.01".len());
    }

    #[test]
    fn bulk_body_pairs_action_and_source_lines() {
        let s = sink("bridge");
        let body = s
            .build_bulk_body("bridge-2026.08.01", &[json!({"a": 1}), json!({"b": 2})])
            .expect("body");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains(r#""_index":"bridge-2026.08.01""#));
        assert!(lines[0].contains(r#""_type":"logs""#));
        assert_eq!(lines[1], r#"{"a":1}"#);
        assert!(body.ends_with('\n'));
    }
}
