/// Tests for the downlink path: command validation, round-robin routing into
/// live sessions, and drop counting.
use axb_test_utils::{MockAppxOptions, MockAppxServer};
use bridge::config::SslConfig;
use bridge::connection::{connect_appx, run_session, ConnPool, SessionTiming};
use bridge::downlink::handle_downlink_payload;
use bridge::metrics;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

async fn session_pool(
    servers: &[&MockAppxServer],
    shutdown_rx: &watch::Receiver<bool>,
) -> (ConnPool, mpsc::Receiver<bridge::connection::RawFrame>) {
    let pool = ConnPool::new();
    let (tx, rx) = mpsc::channel(8);
    for (index, server) in servers.iter().enumerate() {
        let stream = connect_appx(&server.url(), &SslConfig::default())
            .await
            .expect("connect");
        tokio::spawn(run_session(
            server.url(),
            format!("appx-{}", index),
            SslConfig::default(),
            pool.clone(),
            tx.clone(),
            SessionTiming {
                keepalive: Duration::from_secs(5),
                respawn: Duration::from_millis(500),
            },
            shutdown_rx.clone(),
            stream,
        ));
    }
    // Wait until every session registered.
    timeout(Duration::from_secs(1), async {
        loop {
            if pool.len().await == servers.len() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pool did not fill");
    (pool, rx)
}

/// Test: a well-formed array of N dndf commands results in exactly N writes
/// distributed across the live sessions, serialized with exact identifiers.
#[tokio::test]
async fn well_formed_commands_are_routed_across_sessions() {
    let server_a = MockAppxServer::start(MockAppxOptions::default())
        .await
        .expect("start a");
    let server_b = MockAppxServer::start(MockAppxOptions::default())
        .await
        .expect("start b");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pool, _rx) = session_pool(&[&server_a, &server_b], &shutdown_rx).await;

    let payload = r#"[
        {"msgtype":"dndf","MsgId":49373205491740460,"FPort":2,"FRMPayload":"0101","DevEui":"64-7F-DA-00-00-00-07-85","confirm":true},
        {"msgtype":"dndf","MsgId":49373205491740461,"FPort":2,"FRMPayload":"0102","DevEui":"64-7F-DA-00-00-00-07-86"},
        {"msgtype":"dndf","MsgId":49373205491740462,"FPort":2,"FRMPayload":"0103","DevEui":"64-7F-DA-00-00-00-07-87"}
    ]"#;
    handle_downlink_payload(payload.as_bytes(), &pool).await;

    let mut written = Vec::new();
    for server in [&server_a, &server_b] {
        while let Ok(Some(text)) =
            timeout(Duration::from_millis(300), server.next_received()).await
        {
            written.push(text);
        }
    }
    assert_eq!(written.len(), 3, "expected one write per command");
    assert!(written.iter().all(|w| w.contains(r#""msgtype":"dndf""#)));
    // Identifiers survive as unquoted number tokens.
    assert!(written
        .iter()
        .any(|w| w.contains(r#""MsgId":49373205491740460"#)));
    assert!(!written
        .iter()
        .any(|w| w.contains(r#""MsgId":"49373205491740460""#)));

    shutdown_tx.send(true).expect("signal shutdown");
}

/// Test: a malformed entry (wrong msgtype or missing DevEui) produces zero
/// writes and one drop count per entry.
#[tokio::test]
async fn malformed_commands_are_dropped_without_writes() {
    let server = MockAppxServer::start(MockAppxOptions::default())
        .await
        .expect("start");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (pool, _rx) = session_pool(&[&server], &shutdown_rx).await;

    let dropped_before = metrics::MESSAGES_DROPPED_MQTT
        .with_label_values(&["invalid_command"])
        .get();

    let payload = r#"[
        {"msgtype":"dndf","MsgId":1,"FPort":2,"FRMPayload":"0101"},
        {"msgtype":"updf","MsgId":2,"DevEui":"64-7F-DA-00-00-00-07-85"}
    ]"#;
    handle_downlink_payload(payload.as_bytes(), &pool).await;

    assert_eq!(
        metrics::MESSAGES_DROPPED_MQTT
            .with_label_values(&["invalid_command"])
            .get()
            - dropped_before,
        2
    );
    assert!(
        timeout(Duration::from_millis(300), server.next_received())
            .await
            .is_err(),
        "malformed commands must produce no writes"
    );

    shutdown_tx.send(true).expect("signal shutdown");
}

/// Test: an unparseable payload counts one drop for the whole array.
#[tokio::test]
async fn unparseable_payload_counts_one_drop() {
    let pool = ConnPool::new();
    let dropped_before = metrics::MESSAGES_DROPPED_MQTT
        .with_label_values(&["malformed_json"])
        .get();

    handle_downlink_payload(b"{not an array", &pool).await;

    assert_eq!(
        metrics::MESSAGES_DROPPED_MQTT
            .with_label_values(&["malformed_json"])
            .get()
            - dropped_before,
        1
    );
}

/// Test: with no live sessions, commands are dropped with a counter and no
/// retry.
#[tokio::test]
async fn empty_pool_drops_commands() {
    let pool = ConnPool::new();
    let dropped_before = metrics::MESSAGES_DROPPED_MQTT
        .with_label_values(&["no_connection"])
        .get();

    let payload =
        r#"[{"msgtype":"dndf","MsgId":1,"FPort":2,"FRMPayload":"0101","DevEui":"64-7F-DA-00-00-00-07-85"}]"#;
    handle_downlink_payload(payload.as_bytes(), &pool).await;

    assert_eq!(
        metrics::MESSAGES_DROPPED_MQTT
            .with_label_values(&["no_connection"])
            .get()
            - dropped_before,
        1
    );
}
