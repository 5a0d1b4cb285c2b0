// bridge: LoRaWAN application-exchange bridge.
//
// Runtime event loop: bootstraps the appx catalog, keeps one WebSocket
// session per appx endpoint, batches upstream messages through the
// filter/enrichment pipeline into the configured sinks, and injects bus
// downlinks back into a live session.

use bridge::batcher::{run_batcher, BatcherConfig};
use bridge::config::{self, BridgeConfig, SinkName};
use bridge::connection::{bootstrap, connect_appx, run_session, ConnPool, SessionTiming};
use bridge::decoders::DecoderRegistry;
use bridge::downlink::run_downlink;
use bridge::metrics;
use bridge::pipeline::{Pipeline, SharedState};
use bridge::sinks::{mqtt, SinkSet};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

struct CliOptions {
    config_path: PathBuf,
    log_output: String,
    log_level: String,
    keepalive: Duration,
    respawn: Duration,
    backlog: bool,
    metrics_port: u16,
}

fn parse_cli() -> CliOptions {
    let matches = Command::new("appx-bridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("LoRaWAN application-exchange bridge")
        .arg(
            Arg::new("config")
                .short('C')
                .value_name("path")
                .default_value("/etc/appx-bridge/bridge.yaml")
                .help("config file full path"),
        )
        .arg(
            Arg::new("log-output")
                .short('L')
                .value_name("file|stdout")
                .default_value("stdout")
                .help("log file path or stdout"),
        )
        .arg(
            Arg::new("keepalive")
                .short('K')
                .value_name("sec")
                .value_parser(clap::value_parser!(u64).range(1..))
                .default_value("5")
                .help("keepalive interval, sec"),
        )
        .arg(
            Arg::new("respawn")
                .short('R')
                .value_name("sec")
                .value_parser(clap::value_parser!(u64).range(1..))
                .default_value("10")
                .help("respawn interval, sec"),
        )
        .arg(
            Arg::new("backlog")
                .short('b')
                .action(ArgAction::SetTrue)
                .help("replay backlogged messages from the beginning"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .value_name("level")
                .default_value("info")
                .help("logging level (error, warn, info, debug, trace)"),
        )
        .arg(
            Arg::new("metrics-port")
                .short('p')
                .value_name("port")
                .value_parser(clap::value_parser!(u16))
                .default_value("9002")
                .help("prometheus exposition port"),
        )
        .get_matches();

    CliOptions {
        config_path: PathBuf::from(
            matches
                .get_one::<String>("config")
                .map(String::as_str)
                .unwrap_or("/etc/appx-bridge/bridge.yaml"),
        ),
        log_output: matches
            .get_one::<String>("log-output")
            .cloned()
            .unwrap_or_else(|| "stdout".to_owned()),
        log_level: matches
            .get_one::<String>("log-level")
            .cloned()
            .unwrap_or_else(|| "info".to_owned()),
        keepalive: Duration::from_secs(matches.get_one::<u64>("keepalive").copied().unwrap_or(5)),
        respawn: Duration::from_secs(matches.get_one::<u64>("respawn").copied().unwrap_or(10)),
        backlog: matches.get_flag("backlog"),
        metrics_port: matches.get_one::<u16>("metrics-port").copied().unwrap_or(9002),
    }
}

fn init_logging(level: &str, output: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if output == "stdout" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(output) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        Err(e) => {
            eprintln!("FATAL: cannot open log file '{}': {}", output, e);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = parse_cli();
    init_logging(&cli.log_level, &cli.log_output);

    info!(version = env!("CARGO_PKG_VERSION"), "bridge starting");

    let cfg: BridgeConfig = match config::load_from_path(&cli.config_path) {
        Ok(cfg) => {
            info!(
                appname = %cfg.appname,
                owner = %cfg.owner.id,
                sinks = ?cfg.owner.storage_pref_list.iter().map(SinkName::as_str).collect::<Vec<_>>(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let filters = match config::compile_filters(&cfg.filters) {
        Ok(filters) => filters,
        Err(e) => {
            eprintln!("FATAL: failed to compile filters: {}", e);
            std::process::exit(1);
        }
    };

    let registry = DecoderRegistry::builtin();
    for tag in registry.type_tags() {
        info!(device_type = tag, "decoder loaded");
    }
    if let Some(path) = &cfg.decoders_path {
        info!(path = %path, "decoders.path configured; dispatching compiled-in decoders");
    }

    let shared = Arc::new(SharedState::new(filters, cfg.inventory.clone(), registry));

    // The bus connection is shared by the uplink sink and the downlink
    // handler; it exists iff "mqtt" is in the preference list.
    let bus = if cfg.owner.storage_pref_list.contains(&SinkName::Mqtt) {
        let mqtt_cfg = match &cfg.mqtt {
            Some(m) => m,
            None => {
                eprintln!("FATAL: mqtt listed in storage_pref_list but not configured");
                std::process::exit(1);
            }
        };
        match mqtt::connect(mqtt_cfg, &cfg.appname) {
            Ok((client, eventloop)) => Some((client, eventloop)),
            Err(e) => {
                eprintln!("FATAL: failed to set up the bus connection: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let (bus_client, bus_eventloop) = match bus {
        Some((client, eventloop)) => (Some(client), Some(eventloop)),
        None => (None, None),
    };

    let sinks = match SinkSet::init(&cfg, bus_client.clone()).await {
        Ok(sinks) => sinks,
        Err(e) => {
            eprintln!("FATAL: failed to initialize sinks: {}", e);
            std::process::exit(1);
        }
    };

    metrics::PROXY_INFO
        .with_label_values(&[&cfg.appname, &cfg.owner.id])
        .set(1);

    let catalog = match bootstrap(&cfg.owner.appx_bootstrap_uri, &cfg.owner.id, &cfg.ssl).await {
        Ok(catalog) => {
            info!(
                owner = %catalog.owner,
                endpoints = catalog.appx_list.len(),
                version = catalog.version,
                release = catalog.release,
                "bootstrap catalog received"
            );
            catalog
        }
        Err(e) => {
            eprintln!("FATAL: bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    let (frame_tx, frame_rx) = mpsc::channel(cfg.owner.queue_flush_count * 3);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = ConnPool::new();
    let timing = SessionTiming {
        keepalive: cli.keepalive,
        respawn: cli.respawn,
    };

    for entry in catalog.appx_list {
        let mut uri = entry.uri;
        if cli.backlog {
            uri.push_str("/?upid=0");
        }
        let stream = match connect_appx(&uri, &cfg.ssl).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("FATAL: bootstrap connection to {} failed: {}", uri, e);
                std::process::exit(1);
            }
        };
        info!(uri = %uri, appxid = %entry.appxid, "listening on appx endpoint");
        tokio::spawn(run_session(
            uri,
            entry.appxid,
            cfg.ssl.clone(),
            pool.clone(),
            frame_tx.clone(),
            timing,
            shutdown_rx.clone(),
            stream,
        ));
    }
    // The session tasks hold the only senders now; when they exit the
    // batcher sees the queue close.
    drop(frame_tx);

    let pipeline = Arc::new(Pipeline::new(shared.clone(), sinks));
    let batcher_cfg = BatcherConfig {
        flush_count: cfg.owner.queue_flush_count,
        flush_time: Duration::from_millis(cfg.owner.queue_flush_time),
    };
    let batcher = tokio::spawn(run_batcher(
        frame_rx,
        batcher_cfg,
        shutdown_rx.clone(),
        pipeline,
    ));

    if let (Some(client), Some(eventloop)) = (bus_client, bus_eventloop) {
        let mqtt_cfg = cfg.mqtt.clone();
        let Some(mqtt_cfg) = mqtt_cfg else {
            eprintln!("FATAL: mqtt listed in storage_pref_list but not configured");
            std::process::exit(1);
        };
        let dn_qos = match mqtt::parse_qos(mqtt_cfg.dn_qos) {
            Ok(qos) => qos,
            Err(e) => {
                eprintln!("FATAL: {}", e);
                std::process::exit(1);
            }
        };
        tokio::spawn(run_downlink(
            eventloop,
            client,
            mqtt_cfg.dn_topic,
            dn_qos,
            pool.clone(),
            shutdown_rx.clone(),
        ));
    }

    {
        let port = cli.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(port).await {
                error!(port, error = %e, "metrics endpoint failed");
                std::process::exit(1);
            }
        });
    }

    // SIGHUP: swap filter rules and inventory; connections stay untouched.
    #[cfg(unix)]
    {
        let shared = shared.clone();
        let config_path = cli.config_path.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "failed to install SIGHUP handler");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading filters and inventory");
                match config::reload_rules(&config_path) {
                    Ok((filters, inventory)) => {
                        shared.swap_rules(filters, inventory);
                        info!("filter reload done");
                    }
                    Err(e) => {
                        error!(error = %e, "filter reload failed, keeping previous rules");
                    }
                }
            }
        });
    }

    info!("bridge initialized, all workers running");

    // Wait for SIGINT / SIGTERM.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
                shutdown_tx.send(true).ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }

    info!("preparing graceful shutdown");
    pool.close_all().await;
    shutdown_tx.send(true).ok();

    // Keepalive-scaled grace period for the batcher's final flush and any
    // in-flight sink calls; stragglers are abandoned.
    let grace = cli.keepalive * 2;
    match tokio::time::timeout(grace, batcher).await {
        Ok(_) => info!("drain complete"),
        Err(_) => warn!(grace_secs = grace.as_secs(), "grace period expired, abandoning in-flight tasks"),
    }
    info!("bridge shutdown complete");
}
