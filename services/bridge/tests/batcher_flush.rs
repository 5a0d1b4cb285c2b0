/// Tests for the time-and-count batcher: size trigger, time trigger, and the
/// shutdown flush of the residual buffer.
use async_trait::async_trait;
use bridge::batcher::{run_batcher, BatchProcessor, BatcherConfig};
use bridge::connection::RawFrame;
use bridge::metrics;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Vec<RawFrame>>>,
}

impl Recorder {
    fn sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl BatchProcessor for Recorder {
    async fn process_batch(&self, batch: Vec<RawFrame>) {
        self.batches.lock().unwrap().push(batch);
    }
}

fn frame(i: usize) -> RawFrame {
    RawFrame {
        appx_uri: "ws://appx.test".to_owned(),
        appx_id: "appx-1".to_owned(),
        payload: format!(r#"{{"msgtype":"updf","upid":{}}}"#, i),
    }
}

async fn wait_for_batches(recorder: &Recorder, count: usize) {
    timeout(Duration::from_secs(2), async {
        loop {
            if recorder.batches.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batches did not arrive in time");
}

/// Test: seven fast messages with flush_count=3 / flush_time=100ms batch as
/// [3, 3, 1] — two size flushes and one time flush.
#[tokio::test]
async fn seven_fast_messages_batch_as_3_3_1() {
    let (tx, rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recorder = Arc::new(Recorder::default());

    let size_before = metrics::QUEUE_FLUSHED_BY_SIZE.get();
    let time_before = metrics::QUEUE_FLUSHED_BY_TIME.get();

    let batcher = tokio::spawn(run_batcher(
        rx,
        BatcherConfig {
            flush_count: 3,
            flush_time: Duration::from_millis(100),
        },
        shutdown_rx,
        recorder.clone(),
    ));

    for i in 0..7 {
        tx.send(frame(i)).await.expect("enqueue");
    }

    wait_for_batches(&recorder, 3).await;
    assert_eq!(recorder.sizes(), vec![3, 3, 1]);
    assert_eq!(metrics::QUEUE_FLUSHED_BY_SIZE.get() - size_before, 2);
    assert_eq!(metrics::QUEUE_FLUSHED_BY_TIME.get() - time_before, 1);

    shutdown_tx.send(true).expect("signal shutdown");
    drop(tx);
    timeout(Duration::from_secs(1), batcher)
        .await
        .expect("batcher shutdown timeout")
        .expect("batcher join");
}

/// Test: enqueue order is preserved inside a batch.
#[tokio::test]
async fn batches_preserve_enqueue_order() {
    let (tx, rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recorder = Arc::new(Recorder::default());

    let batcher = tokio::spawn(run_batcher(
        rx,
        BatcherConfig {
            flush_count: 4,
            flush_time: Duration::from_secs(30),
        },
        shutdown_rx,
        recorder.clone(),
    ));

    for i in 0..4 {
        tx.send(frame(i)).await.expect("enqueue");
    }
    wait_for_batches(&recorder, 1).await;

    let batches = recorder.batches.lock().unwrap();
    let payloads: Vec<&str> = batches[0].iter().map(|f| f.payload.as_str()).collect();
    assert_eq!(
        payloads,
        vec![
            r#"{"msgtype":"updf","upid":0}"#,
            r#"{"msgtype":"updf","upid":1}"#,
            r#"{"msgtype":"updf","upid":2}"#,
            r#"{"msgtype":"updf","upid":3}"#,
        ]
    );
    drop(batches);

    shutdown_tx.send(true).expect("signal shutdown");
    drop(tx);
    timeout(Duration::from_secs(1), batcher)
        .await
        .expect("batcher shutdown timeout")
        .expect("batcher join");
}

/// Test: on shutdown, residual messages appear in exactly one terminal batch.
#[tokio::test]
async fn shutdown_flushes_residual_as_final_batch() {
    let (tx, rx) = mpsc::channel(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recorder = Arc::new(Recorder::default());

    let batcher = tokio::spawn(run_batcher(
        rx,
        BatcherConfig {
            flush_count: 10,
            flush_time: Duration::from_secs(30),
        },
        shutdown_rx,
        recorder.clone(),
    ));

    tx.send(frame(0)).await.expect("enqueue");
    tx.send(frame(1)).await.expect("enqueue");
    // Let the batcher drain the channel into its buffer before signalling.
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown_tx.send(true).expect("signal shutdown");
    timeout(Duration::from_secs(1), batcher)
        .await
        .expect("batcher shutdown timeout")
        .expect("batcher join");

    assert_eq!(recorder.sizes(), vec![2]);
}

/// Test: the queue closing (all sessions gone) also flushes the residue.
#[tokio::test]
async fn queue_close_flushes_residual() {
    let (tx, rx) = mpsc::channel(32);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let recorder = Arc::new(Recorder::default());

    let batcher = tokio::spawn(run_batcher(
        rx,
        BatcherConfig {
            flush_count: 10,
            flush_time: Duration::from_secs(30),
        },
        shutdown_rx,
        recorder.clone(),
    ));

    tx.send(frame(0)).await.expect("enqueue");
    drop(tx);

    timeout(Duration::from_secs(1), batcher)
        .await
        .expect("batcher close timeout")
        .expect("batcher join");
    assert_eq!(recorder.sizes(), vec![1]);
}

/// Test: an empty buffer produces no batch at shutdown — sinks only ever see
/// non-empty batches.
#[tokio::test]
async fn empty_shutdown_emits_nothing() {
    let (tx, rx) = mpsc::channel::<RawFrame>(32);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recorder = Arc::new(Recorder::default());

    let batcher = tokio::spawn(run_batcher(
        rx,
        BatcherConfig {
            flush_count: 10,
            flush_time: Duration::from_millis(20),
        },
        shutdown_rx,
        recorder.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(80)).await;
    shutdown_tx.send(true).expect("signal shutdown");
    drop(tx);
    timeout(Duration::from_secs(1), batcher)
        .await
        .expect("batcher shutdown timeout")
        .expect("batcher join");

    assert!(recorder.sizes().is_empty());
}
