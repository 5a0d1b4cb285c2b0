//! Per-batch enrichment and fan-out.
//!
//! For each message in a batch: decode to the typed variant, filter,
//! synthesize the arrival timestamp when the wire had none, attach the
//! decoded application payload for data-bearing variants, then hand the
//! surviving documents to every configured sink in preference order.

use crate::batcher::BatchProcessor;
use crate::connection::RawFrame;
use crate::decoders::DecoderRegistry;
use crate::filter::{FilterReject, FilterSet};
use crate::metrics;
use crate::sinks::SinkSet;
use async_trait::async_trait;
use axb_protocol::{AppxMessage, ArrivalTime};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Shared reloadable state
// ---------------------------------------------------------------------------

/// Filter rules and inventory behind swappable pointers, plus the immutable
/// decoder registry.  SIGHUP replaces the rules; batches in flight keep the
/// snapshot they started with.
pub struct SharedState {
    filters: RwLock<Arc<FilterSet>>,
    inventory: RwLock<Arc<HashMap<String, String>>>,
    registry: DecoderRegistry,
}

impl SharedState {
    pub fn new(
        filters: FilterSet,
        inventory: HashMap<String, String>,
        registry: DecoderRegistry,
    ) -> SharedState {
        SharedState {
            filters: RwLock::new(Arc::new(filters)),
            inventory: RwLock::new(Arc::new(inventory)),
            registry,
        }
    }

    /// Atomically replace the filter rules and the inventory.
    pub fn swap_rules(&self, filters: FilterSet, inventory: HashMap<String, String>) {
        match self.filters.write() {
            Ok(mut guard) => *guard = Arc::new(filters),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(filters),
        }
        match self.inventory.write() {
            Ok(mut guard) => *guard = Arc::new(inventory),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(inventory),
        }
    }

    pub fn filters(&self) -> Arc<FilterSet> {
        match self.filters.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn inventory(&self) -> Arc<HashMap<String, String>> {
        match self.inventory.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    shared: Arc<SharedState>,
    sinks: SinkSet,
}

impl Pipeline {
    pub fn new(shared: Arc<SharedState>, sinks: SinkSet) -> Pipeline {
        Pipeline { shared, sinks }
    }

    /// Decode, filter, and enrich one batch; returns the documents that
    /// survive.  Rule snapshots are taken once per batch.
    pub fn prepare_batch(&self, batch: &[RawFrame]) -> Vec<Value> {
        let filters = self.shared.filters();
        let inventory = self.shared.inventory();

        let mut documents = Vec::with_capacity(batch.len());
        for frame in batch {
            let mut message = match AppxMessage::decode(frame.payload.as_bytes()) {
                Ok(m) => m,
                Err(e) => {
                    metrics::MESSAGES_DECODE_FAILED.inc();
                    warn!(uri = %frame.appx_uri, error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            metrics::MESSAGES_SEEN_BY_FILTER
                .with_label_values(&[message.msg_type()])
                .inc();
            match filters.evaluate(message.msg_type(), message.dev_eui()) {
                Ok(()) => {
                    metrics::MESSAGES_PASSED_FILTER
                        .with_label_values(&[message.msg_type()])
                        .inc();
                }
                Err(reason) => {
                    let counter = match reason {
                        FilterReject::TypeWhitelist => &metrics::MESSAGES_DROPPED_BY_TYPE,
                        FilterReject::DevEuiWhitelist => &metrics::MESSAGES_DROPPED_BY_DEVEUI,
                    };
                    counter.with_label_values(&[message.msg_type()]).inc();
                    debug!(
                        msg_type = message.msg_type(),
                        dev_eui = message.dev_eui().unwrap_or(""),
                        reason = reason.as_str(),
                        "message filtered"
                    );
                    continue;
                }
            }

            message.ensure_arrival_time(ArrivalTime::now());

            let payload = match (&message, message.frm_payload()) {
                (AppxMessage::UpDf(_) | AppxMessage::UpInfo(_), Some(hex)) => message
                    .dev_eui()
                    .and_then(|eui| self.decode_payload(&inventory, eui, hex)),
                _ => None,
            };

            let mut document = match message.to_document() {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "document serialization failed");
                    continue;
                }
            };
            if let (Some(object), Some(payload)) = (document.as_object_mut(), payload) {
                object.insert("payload".to_owned(), payload);
            }
            documents.push(document);
        }
        documents
    }

    /// Decoder dispatch: inventory lookup by device id, registry lookup by
    /// device type.  Any miss leaves the message unchanged.
    fn decode_payload(
        &self,
        inventory: &HashMap<String, String>,
        dev_eui: &str,
        payload_hex: &str,
    ) -> Option<Value> {
        let device_type = match inventory.get(dev_eui) {
            Some(t) => t,
            None => {
                metrics::MESSAGES_LEFT_WITHOUT_DECODING.inc();
                return None;
            }
        };
        let decode = match self.shared.registry().get(device_type) {
            Some(f) => f,
            None => {
                metrics::MESSAGES_DECODER_NOT_FOUND.inc();
                debug!(dev_eui, device_type, "no decoder registered for device type");
                return None;
            }
        };
        metrics::MESSAGES_HIT_DECODER.inc();
        match decode(payload_hex) {
            Ok(value) => {
                metrics::MESSAGES_DECODED.inc();
                Some(value)
            }
            Err(e) => {
                metrics::MESSAGES_DECODING_FAILED.inc();
                warn!(dev_eui, device_type, error = %e, "payload decoder failed");
                None
            }
        }
    }
}

#[async_trait]
impl BatchProcessor for Pipeline {
    async fn process_batch(&self, batch: Vec<RawFrame>) {
        let documents = self.prepare_batch(&batch);
        // Sinks only ever see non-empty batches.
        if documents.is_empty() {
            return;
        }
        self.sinks.deliver(&documents).await;
    }
}
