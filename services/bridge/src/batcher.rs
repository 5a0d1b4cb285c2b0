//! Time-and-count batcher over the fan-in queue.
//!
//! A single task consumes the bounded queue.  A batch is emitted when the
//! buffer reaches `queue_flush_count` entries (size trigger) or when the
//! `queue_flush_time` ticker fires with a non-empty buffer (time trigger).
//! Emission hands the batch to a spawned task so ingestion never blocks on
//! sinks; on shutdown the residual buffer is flushed synchronously as a
//! final batch and every in-flight emitter is awaited.

use crate::connection::RawFrame;
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::info;

/// Consumer of emitted batches.  Production wires the enrichment-and-fan-out
/// pipeline here; tests substitute a recorder.
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    async fn process_batch(&self, batch: Vec<RawFrame>);
}

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub flush_count: usize,
    pub flush_time: Duration,
}

/// Run the batcher until the queue closes or shutdown fires.
pub async fn run_batcher(
    mut frames: mpsc::Receiver<RawFrame>,
    cfg: BatcherConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    processor: Arc<dyn BatchProcessor>,
) {
    let mut buf: Vec<RawFrame> = Vec::with_capacity(cfg.flush_count);
    let mut inflight: JoinSet<()> = JoinSet::new();
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + cfg.flush_time,
        cfg.flush_time,
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = frames.recv() => match maybe {
                Some(frame) => {
                    buf.push(frame);
                    if buf.len() >= cfg.flush_count {
                        metrics::QUEUE_FLUSHED_BY_SIZE.inc();
                        spawn_batch(&mut inflight, &processor, std::mem::take(&mut buf));
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buf.is_empty() {
                    metrics::QUEUE_FLUSHED_BY_TIME.inc();
                    spawn_batch(&mut inflight, &processor, std::mem::take(&mut buf));
                }
            },
            // Reap finished emitters so the set does not grow unbounded.
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {},
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    if buf.is_empty() {
        info!("batcher terminating, nothing to flush");
    } else {
        info!(count = buf.len(), "batcher terminating, flushing residual buffer as final batch");
        processor.process_batch(std::mem::take(&mut buf)).await;
    }
    while inflight.join_next().await.is_some() {}
}

fn spawn_batch(
    inflight: &mut JoinSet<()>,
    processor: &Arc<dyn BatchProcessor>,
    batch: Vec<RawFrame>,
) {
    let processor = processor.clone();
    inflight.spawn(async move {
        processor.process_batch(batch).await;
    });
}
