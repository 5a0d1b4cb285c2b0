//! Bridge configuration loading.
//!
//! YAML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/appx-bridge/bridge.yaml`.
//!
//! # Required fields
//! - `owner.id`
//! - `owner.appx_bootstrap_uri`
//! - A configured section for every sink named in `owner.storage_pref_list`
//!
//! # SIGHUP
//! Only `filters` and `inventory` are reloadable at runtime; everything else
//! (TLS material, sink parameters, bootstrap URI) requires a restart.

use crate::filter::FilterSet;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Sink names
// ---------------------------------------------------------------------------

/// A sink named in `owner.storage_pref_list`.  Anything else is a fatal
/// configuration error at load time, not at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkName {
    RethinkDb,
    Elastic,
    Mqtt,
    Mongo,
}

impl SinkName {
    pub fn parse(name: &str) -> Option<SinkName> {
        match name {
            "rethinkdb" => Some(SinkName::RethinkDb),
            "elastic" => Some(SinkName::Elastic),
            "mqtt" => Some(SinkName::Mqtt),
            "mongo" => Some(SinkName::Mongo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SinkName::RethinkDb => "rethinkdb",
            SinkName::Elastic => "elastic",
            SinkName::Mqtt => "mqtt",
            SinkName::Mongo => "mongo",
        }
    }
}

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Identity string surfaced as a metric label and MQTT client id.
    pub appname: String,
    pub version: Option<u32>,
    /// Directory of decoder plugin artifacts.  Recognized for config
    /// compatibility; v1 dispatches the compiled-in decoder factory.
    pub decoders_path: Option<String>,
    pub owner: OwnerConfig,
    pub ssl: SslConfig,
    pub mongo: Option<MongoConfig>,
    pub rethinkdb: Option<RethinkDbConfig>,
    pub elastic: Option<ElasticConfig>,
    pub mqtt: Option<MqttConfig>,
    pub filters: FilterRules,
    /// Device-id → device-type, for decoder dispatch.
    pub inventory: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct OwnerConfig {
    pub id: String,
    pub appx_bootstrap_uri: String,
    /// Ordered sink fan-out list.
    pub storage_pref_list: Vec<SinkName>,
    /// Batch size trigger.
    pub queue_flush_count: usize,
    /// Batch time trigger, milliseconds.
    pub queue_flush_time: u64,
}

/// TLS client material for upstream `wss://` endpoints.
#[derive(Debug, Clone, Default)]
pub struct SslConfig {
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    pub trust_chain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub db: String,
    pub collection: String,
}

#[derive(Debug, Clone)]
pub struct RethinkDbConfig {
    pub uri: Option<String>,
    pub uris: Vec<String>,
    pub db: String,
    pub collection: String,
    pub initial_cap: Option<u32>,
    pub max_open: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub hosts: Vec<String>,
    /// strftime-style template for the index name, e.g. `bridge-%Y.%m.%d`.
    pub index: String,
    pub doc_type: String,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub brokers: Vec<String>,
    pub certificate: Option<String>,
    pub private_key: Option<String>,
    pub trust_chain: Option<String>,
    pub user: String,
    pub password: String,
    pub dn_topic: String,
    pub up_topic: String,
    pub up_qos: u8,
    pub dn_qos: u8,
}

/// The raw (uncompiled) filter rule strings, kept for logging on reload.
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    pub deveui: Vec<String>,
    pub msg_type: Vec<String>,
}

// ---------------------------------------------------------------------------
// Raw YAML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    appname: Option<String>,
    version: Option<u32>,
    decoders: Option<RawDecodersConfig>,
    owner: Option<RawOwnerConfig>,
    ssl: Option<RawSslConfig>,
    mongo: Option<RawMongoConfig>,
    rethinkdb: Option<RawRethinkDbConfig>,
    elastic: Option<RawElasticConfig>,
    mqtt: Option<RawMqttConfig>,
    filters: Option<RawFilterRules>,
    inventory: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawDecodersConfig {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOwnerConfig {
    id: Option<String>,
    appx_bootstrap_uri: Option<String>,
    storage_pref_list: Option<Vec<String>>,
    queue_flush_count: Option<usize>,
    queue_flush_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawSslConfig {
    certificate: Option<String>,
    private_key: Option<String>,
    trust_chain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMongoConfig {
    uri: Option<String>,
    db: Option<String>,
    collection: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRethinkDbConfig {
    uri: Option<String>,
    uris: Option<Vec<String>>,
    db: Option<String>,
    collection: Option<String>,
    initial_cap: Option<u32>,
    max_open: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawElasticConfig {
    hosts: Option<Vec<String>>,
    index: Option<String>,
    doc_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMqttConfig {
    brokers: Option<Vec<String>>,
    certificate: Option<String>,
    private_key: Option<String>,
    trust_chain: Option<String>,
    user: Option<String>,
    password: Option<String>,
    dntopic: Option<String>,
    uptopic: Option<String>,
    upqos: Option<u8>,
    dnqos: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RawFilterRules {
    deveui: Option<Vec<String>>,
    msg_type: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load bridge config from a path.
pub fn load_from_path(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_from_str(&yaml)
}

/// Load bridge config from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<BridgeConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_owner = raw
        .owner
        .ok_or_else(|| ConfigError::MissingField("owner".to_owned()))?;
    let id = raw_owner
        .id
        .ok_or_else(|| ConfigError::MissingField("owner.id".to_owned()))?;
    let appx_bootstrap_uri = raw_owner
        .appx_bootstrap_uri
        .ok_or_else(|| ConfigError::MissingField("owner.appx_bootstrap_uri".to_owned()))?;

    let mut storage_pref_list = Vec::new();
    for name in raw_owner.storage_pref_list.unwrap_or_default() {
        let sink = SinkName::parse(&name).ok_or_else(|| {
            ConfigError::InvalidValue(format!("unknown storage driver [{}] in storage_pref_list", name))
        })?;
        storage_pref_list.push(sink);
    }

    let queue_flush_count = raw_owner.queue_flush_count.unwrap_or(10);
    if queue_flush_count == 0 {
        return Err(ConfigError::InvalidValue(
            "owner.queue_flush_count must be at least 1".to_owned(),
        ));
    }
    let queue_flush_time = raw_owner.queue_flush_time.unwrap_or(1000);
    if queue_flush_time == 0 {
        return Err(ConfigError::InvalidValue(
            "owner.queue_flush_time must be at least 1 ms".to_owned(),
        ));
    }

    let ssl = match raw.ssl {
        Some(s) => SslConfig {
            certificate: s.certificate,
            private_key: s.private_key,
            trust_chain: s.trust_chain,
        },
        None => SslConfig::default(),
    };

    let mongo = raw.mongo.map(|m| MongoConfig {
        uri: m.uri.unwrap_or_default(),
        db: m.db.unwrap_or_default(),
        collection: m.collection.unwrap_or_default(),
    });

    let rethinkdb = raw.rethinkdb.map(|r| RethinkDbConfig {
        uri: r.uri,
        uris: r.uris.unwrap_or_default(),
        db: r.db.unwrap_or_default(),
        collection: r.collection.unwrap_or_default(),
        initial_cap: r.initial_cap,
        max_open: r.max_open,
    });

    let elastic = raw.elastic.map(|e| ElasticConfig {
        hosts: e.hosts.unwrap_or_default(),
        index: e.index.unwrap_or_default(),
        doc_type: e.doc_type.unwrap_or_else(|| "logs".to_owned()),
    });

    let mqtt = raw.mqtt.map(|m| MqttConfig {
        brokers: m.brokers.unwrap_or_default(),
        certificate: m.certificate,
        private_key: m.private_key,
        trust_chain: m.trust_chain,
        user: m.user.unwrap_or_default(),
        password: m.password.unwrap_or_default(),
        dn_topic: m.dntopic.unwrap_or_default(),
        up_topic: m.uptopic.unwrap_or_default(),
        up_qos: m.upqos.unwrap_or(0),
        dn_qos: m.dnqos.unwrap_or(0),
    });

    let filters = match raw.filters {
        Some(f) => FilterRules {
            deveui: f.deveui.unwrap_or_default(),
            msg_type: f.msg_type.unwrap_or_default(),
        },
        None => FilterRules::default(),
    };

    let cfg = BridgeConfig {
        appname: raw.appname.unwrap_or_else(|| "appx-bridge".to_owned()),
        version: raw.version,
        decoders_path: raw.decoders.and_then(|d| d.path),
        owner: OwnerConfig {
            id,
            appx_bootstrap_uri,
            storage_pref_list,
            queue_flush_count,
            queue_flush_time,
        },
        ssl,
        mongo,
        rethinkdb,
        elastic,
        mqtt,
        filters,
        inventory: raw.inventory.unwrap_or_default(),
    };

    validate_sinks(&cfg)?;
    Ok(cfg)
}

/// Re-read the config file and return only the SIGHUP-reloadable parts:
/// compiled filters and the inventory.
pub fn reload_rules(path: &Path) -> Result<(FilterSet, HashMap<String, String>), ConfigError> {
    let cfg = load_from_path(path)?;
    let filters = compile_filters(&cfg.filters)?;
    Ok((filters, cfg.inventory))
}

/// Compile the DevEui regular expressions and the type whitelist.
pub fn compile_filters(rules: &FilterRules) -> Result<FilterSet, ConfigError> {
    FilterSet::compile(&rules.msg_type, &rules.deveui)
        .map_err(|e| ConfigError::InvalidValue(format!("filters.deveui: {}", e)))
}

// ---------------------------------------------------------------------------
// Sink section validation
// ---------------------------------------------------------------------------

/// A sink listed in the preference order must have a usable section; this is
/// fatal at initialization, never discovered at runtime.
fn validate_sinks(cfg: &BridgeConfig) -> Result<(), ConfigError> {
    for sink in &cfg.owner.storage_pref_list {
        match sink {
            SinkName::RethinkDb => {
                let ok = cfg.rethinkdb.as_ref().is_some_and(|r| {
                    (r.uri.is_some() || !r.uris.is_empty())
                        && !r.db.is_empty()
                        && !r.collection.is_empty()
                });
                if !ok {
                    return Err(ConfigError::InvalidValue(
                        "rethinkdb listed in storage_pref_list but not configured".to_owned(),
                    ));
                }
            }
            SinkName::Mongo => {
                let ok = cfg
                    .mongo
                    .as_ref()
                    .is_some_and(|m| !m.uri.is_empty() && !m.db.is_empty() && !m.collection.is_empty());
                if !ok {
                    return Err(ConfigError::InvalidValue(
                        "mongo listed in storage_pref_list but not configured".to_owned(),
                    ));
                }
            }
            SinkName::Elastic => {
                let ok = cfg
                    .elastic
                    .as_ref()
                    .is_some_and(|e| !e.hosts.is_empty() && !e.index.is_empty());
                if !ok {
                    return Err(ConfigError::InvalidValue(
                        "elastic listed in storage_pref_list but not configured".to_owned(),
                    ));
                }
            }
            SinkName::Mqtt => {
                let ok = cfg.mqtt.as_ref().is_some_and(|m| {
                    !m.brokers.is_empty()
                        && !m.user.is_empty()
                        && !m.password.is_empty()
                        && !m.dn_topic.is_empty()
                        && !m.up_topic.is_empty()
                });
                if !ok {
                    return Err(ConfigError::InvalidValue(
                        "mqtt listed in storage_pref_list but not configured".to_owned(),
                    ));
                }
                if let Some(m) = &cfg.mqtt {
                    if m.up_qos > 2 || m.dn_qos > 2 {
                        return Err(ConfigError::InvalidValue(
                            "mqtt QoS must be 0, 1 or 2".to_owned(),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
