// axb-protocol: Typed appx message family and wire serialization.
//
// Every upstream payload is a JSON object tagged by a `msgtype` field.
// Decoding is two-pass: probe the tag, then decode the variant schema from
// the same bytes.  Several identifier fields arrive as JSON numbers that can
// exceed 53-bit float precision; they are carried as exact decimal strings
// and never pass through a floating-point representation.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// BigId: large integer identifiers as exact decimal strings
// ---------------------------------------------------------------------------

/// A wire identifier that is a JSON number but may exceed the 53-bit
/// precision of a double (`MsgId`, `upid`, `SessID`, `NetID`, `routerid`,
/// `muxid`).
///
/// Decodes the raw number token into its exact decimal string and encodes
/// it back as the same unquoted number.  Requires `serde_json` with the
/// `arbitrary_precision` feature so the token never becomes an `f64`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigId(String);

impl BigId {
    pub fn new(digits: impl Into<String>) -> Self {
        BigId(digits.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for BigId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let number: serde_json::Number = self
            .0
            .parse()
            .map_err(|_| serde::ser::Error::custom(format!("not a number token: {}", self.0)))?;
        number.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BigId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let number = serde_json::Number::deserialize(deserializer)?;
        Ok(BigId(number.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ArrivalTime: second-granular epoch timestamps
// ---------------------------------------------------------------------------

/// Arrival timestamp, whole seconds since the Unix epoch.
///
/// The wire form is a floating-point epoch (`1532602005.487868`); the
/// fractional part is discarded on decode because every downstream store is
/// second-grained.  Encodes as an integer JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalTime(i64);

impl ArrivalTime {
    pub fn from_secs(secs: i64) -> Self {
        ArrivalTime(secs)
    }

    pub fn secs(&self) -> i64 {
        self.0
    }

    /// Current wall clock truncated to a whole second.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        ArrivalTime(secs)
    }
}

impl Serialize for ArrivalTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for ArrivalTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let number = serde_json::Number::deserialize(deserializer)?;
        let epoch = number
            .as_f64()
            .ok_or_else(|| D::Error::custom(format!("not an epoch timestamp: {}", number)))?;
        Ok(ArrivalTime(epoch.trunc() as i64))
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

// ---------------------------------------------------------------------------
// Message variants
// ---------------------------------------------------------------------------

/// `updf`: an up data frame as transmitted by a device.  Forwarded without
/// delay; when multiple gateways hear the same frame only the first copy is
/// forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpDfMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: String,
    #[serde(rename = "upid", default, skip_serializing_if = "Option::is_none")]
    pub upid: Option<BigId>,
    #[serde(rename = "SessID", default, skip_serializing_if = "Option::is_none")]
    pub sess_id: Option<BigId>,
    #[serde(rename = "FCntUp", default, skip_serializing_if = "Option::is_none")]
    pub f_cnt_up: Option<u32>,
    #[serde(rename = "FPort", default, skip_serializing_if = "Option::is_none")]
    pub f_port: Option<u8>,
    #[serde(rename = "FRMPayload", default, skip_serializing_if = "String::is_empty")]
    pub frm_payload: String,
    #[serde(rename = "DR", default, skip_serializing_if = "Option::is_none")]
    pub dr: Option<u32>,
    #[serde(rename = "Freq", default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<u32>,
    #[serde(rename = "region", default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

/// One per-router receive record inside `upinfo` and `joining`.
///
/// Undocumented wire fields (`xtime`, `RxDelay`, `RX1DRoff`, `doorid`,
/// `rxtime`) are ignored on decode.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpInfoRecord {
    #[serde(rename = "routerid", default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<BigId>,
    #[serde(rename = "muxid", default, skip_serializing_if = "Option::is_none")]
    pub mux_id: Option<BigId>,
    #[serde(rename = "rssi", default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(rename = "snr", default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
}

/// `upinfo`: reception metadata for an up data frame.  Arrives a short time
/// after the corresponding `updf` because forwarding waits for context from
/// potentially multiple routers.  Linked to its `updf` via `SessID` +
/// `FCntUp` (NOT via `upid`, which is unique per message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpInfoMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: String,
    #[serde(rename = "upid", default, skip_serializing_if = "Option::is_none")]
    pub upid: Option<BigId>,
    #[serde(rename = "SessID", default, skip_serializing_if = "Option::is_none")]
    pub sess_id: Option<BigId>,
    #[serde(rename = "FCntUp", default, skip_serializing_if = "Option::is_none")]
    pub f_cnt_up: Option<u32>,
    #[serde(rename = "FPort", default, skip_serializing_if = "Option::is_none")]
    pub f_port: Option<u8>,
    #[serde(rename = "FRMPayload", default, skip_serializing_if = "String::is_empty")]
    pub frm_payload: String,
    #[serde(rename = "DR", default, skip_serializing_if = "Option::is_none")]
    pub dr: Option<u32>,
    #[serde(rename = "Freq", default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<u32>,
    #[serde(rename = "region", default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Ordered per-router receive records; wire order is preserved.
    #[serde(rename = "upinfo", default, skip_serializing_if = "Vec::is_empty")]
    pub up_info: Vec<UpInfoRecord>,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

/// `dndf`: a downstream message submitted for transmission within the next
/// downlink window of a device.  Also the command shape accepted on the
/// pub/sub downlink topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnDfMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "MsgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<BigId>,
    #[serde(rename = "FPort", default, skip_serializing_if = "Option::is_none")]
    pub f_port: Option<u8>,
    #[serde(rename = "FRMPayload", default, skip_serializing_if = "String::is_empty")]
    pub frm_payload: String,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: String,
    #[serde(rename = "confirm", default, skip_serializing_if = "is_false")]
    pub confirm: bool,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

/// The router reference nested in a `dntxed` message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DnTxedRouter {
    #[serde(rename = "routerid", default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<BigId>,
}

/// `dntxed`: successful transmission of a down data frame.  `MsgId` links it
/// to the originating `dndf`; confirmed frames report every retransmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnTxedMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "MsgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<BigId>,
    #[serde(rename = "upinfo", default)]
    pub up_info: DnTxedRouter,
    #[serde(rename = "confirm", default, skip_serializing_if = "is_false")]
    pub confirm: bool,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: String,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

/// `dnacked`: the device acknowledged a confirmed down data frame.  Carries
/// no device identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnAckedMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "MsgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<BigId>,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

/// `joining`: a device initiated an over-the-air activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoiningMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "SessID", default, skip_serializing_if = "Option::is_none")]
    pub sess_id: Option<BigId>,
    #[serde(rename = "NetID", default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<BigId>,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: String,
    #[serde(rename = "DR", default, skip_serializing_if = "Option::is_none")]
    pub dr: Option<u32>,
    #[serde(rename = "Freq", default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<u32>,
    #[serde(rename = "region", default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(rename = "upinfo", default, skip_serializing_if = "Vec::is_empty")]
    pub up_info: Vec<UpInfoRecord>,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

/// `joined`: a device completed an over-the-air activation and established a
/// new session with the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "SessID", default, skip_serializing_if = "Option::is_none")]
    pub sess_id: Option<BigId>,
    #[serde(rename = "NetID", default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<BigId>,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: String,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

/// `bad_dndf`: error echo of a rejected downlink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadDnDfMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "MsgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<BigId>,
    #[serde(rename = "FPort", default, skip_serializing_if = "Option::is_none")]
    pub f_port: Option<u8>,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: String,
    #[serde(rename = "error", default)]
    pub error: String,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

/// `dnclr`: a buffered downstream message was cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnClrMsg {
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(rename = "MsgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<BigId>,
    #[serde(rename = "DevEui", default)]
    pub dev_eui: String,
    #[serde(rename = "upid", default, skip_serializing_if = "Option::is_none")]
    pub upid: Option<BigId>,
    #[serde(rename = "ArrTime", default, skip_serializing_if = "Option::is_none")]
    pub arr_time: Option<ArrivalTime>,
    #[serde(rename = "SynthTime", default, skip_serializing_if = "is_false")]
    pub synth_time: bool,
}

// ---------------------------------------------------------------------------
// Top-level message
// ---------------------------------------------------------------------------

/// All known `msgtype` values, in wire spelling.
pub const KNOWN_TYPES: &[&str] = &[
    "updf", "upinfo", "dndf", "dntxed", "dnacked", "joining", "joined", "bad_dndf", "dnclr",
];

/// A decoded appx message, one variant per `msgtype`.
#[derive(Debug, Clone, PartialEq)]
pub enum AppxMessage {
    UpDf(UpDfMsg),
    UpInfo(UpInfoMsg),
    DnDf(DnDfMsg),
    DnTxed(DnTxedMsg),
    DnAcked(DnAckedMsg),
    Joining(JoiningMsg),
    Joined(JoinedMsg),
    BadDnDf(BadDnDfMsg),
    DnClr(DnClrMsg),
}

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "msgtype", default)]
    msg_type: String,
}

fn variant_error(err: serde_json::Error) -> DecodeError {
    match err.classify() {
        serde_json::error::Category::Data => DecodeError::FieldTypeMismatch(err.to_string()),
        _ => DecodeError::MalformedJson(err.to_string()),
    }
}

impl AppxMessage {
    /// Decode a wire payload.  Two passes: probe `msgtype`, then decode the
    /// variant schema from the same bytes.
    pub fn decode(bytes: &[u8]) -> Result<AppxMessage, DecodeError> {
        let probe: TypeProbe = serde_json::from_slice(bytes).map_err(|e| {
            if e.classify() == serde_json::error::Category::Data {
                DecodeError::FieldTypeMismatch(e.to_string())
            } else {
                DecodeError::MalformedJson(e.to_string())
            }
        })?;

        match probe.msg_type.as_str() {
            "updf" => serde_json::from_slice(bytes)
                .map(AppxMessage::UpDf)
                .map_err(variant_error),
            "upinfo" => serde_json::from_slice(bytes)
                .map(AppxMessage::UpInfo)
                .map_err(variant_error),
            "dndf" => serde_json::from_slice(bytes)
                .map(AppxMessage::DnDf)
                .map_err(variant_error),
            "dntxed" => serde_json::from_slice(bytes)
                .map(AppxMessage::DnTxed)
                .map_err(variant_error),
            "dnacked" => serde_json::from_slice(bytes)
                .map(AppxMessage::DnAcked)
                .map_err(variant_error),
            "joining" => serde_json::from_slice(bytes)
                .map(AppxMessage::Joining)
                .map_err(variant_error),
            "joined" => serde_json::from_slice(bytes)
                .map(AppxMessage::Joined)
                .map_err(variant_error),
            "bad_dndf" => serde_json::from_slice(bytes)
                .map(AppxMessage::BadDnDf)
                .map_err(variant_error),
            "dnclr" => serde_json::from_slice(bytes)
                .map(AppxMessage::DnClr)
                .map_err(variant_error),
            other => Err(DecodeError::UnknownType(other.to_owned())),
        }
    }

    /// Encode back to the wire form.  Large identifiers are emitted as the
    /// same unquoted number tokens they decoded from.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            AppxMessage::UpDf(m) => serde_json::to_vec(m),
            AppxMessage::UpInfo(m) => serde_json::to_vec(m),
            AppxMessage::DnDf(m) => serde_json::to_vec(m),
            AppxMessage::DnTxed(m) => serde_json::to_vec(m),
            AppxMessage::DnAcked(m) => serde_json::to_vec(m),
            AppxMessage::Joining(m) => serde_json::to_vec(m),
            AppxMessage::Joined(m) => serde_json::to_vec(m),
            AppxMessage::BadDnDf(m) => serde_json::to_vec(m),
            AppxMessage::DnClr(m) => serde_json::to_vec(m),
        }
    }

    pub fn msg_type(&self) -> &str {
        match self {
            AppxMessage::UpDf(m) => &m.msg_type,
            AppxMessage::UpInfo(m) => &m.msg_type,
            AppxMessage::DnDf(m) => &m.msg_type,
            AppxMessage::DnTxed(m) => &m.msg_type,
            AppxMessage::DnAcked(m) => &m.msg_type,
            AppxMessage::Joining(m) => &m.msg_type,
            AppxMessage::Joined(m) => &m.msg_type,
            AppxMessage::BadDnDf(m) => &m.msg_type,
            AppxMessage::DnClr(m) => &m.msg_type,
        }
    }

    /// The device identifier, when the variant carries one (`dnacked` does
    /// not; an empty wire value counts as absent).
    pub fn dev_eui(&self) -> Option<&str> {
        let eui = match self {
            AppxMessage::UpDf(m) => &m.dev_eui,
            AppxMessage::UpInfo(m) => &m.dev_eui,
            AppxMessage::DnDf(m) => &m.dev_eui,
            AppxMessage::DnTxed(m) => &m.dev_eui,
            AppxMessage::DnAcked(_) => return None,
            AppxMessage::Joining(m) => &m.dev_eui,
            AppxMessage::Joined(m) => &m.dev_eui,
            AppxMessage::BadDnDf(m) => &m.dev_eui,
            AppxMessage::DnClr(m) => &m.dev_eui,
        };
        if eui.is_empty() {
            None
        } else {
            Some(eui)
        }
    }

    /// The application payload hex, for data-bearing variants.
    pub fn frm_payload(&self) -> Option<&str> {
        let hex = match self {
            AppxMessage::UpDf(m) => &m.frm_payload,
            AppxMessage::UpInfo(m) => &m.frm_payload,
            AppxMessage::DnDf(m) => &m.frm_payload,
            _ => return None,
        };
        if hex.is_empty() {
            None
        } else {
            Some(hex)
        }
    }

    pub fn arr_time(&self) -> Option<ArrivalTime> {
        match self {
            AppxMessage::UpDf(m) => m.arr_time,
            AppxMessage::UpInfo(m) => m.arr_time,
            AppxMessage::DnDf(m) => m.arr_time,
            AppxMessage::DnTxed(m) => m.arr_time,
            AppxMessage::DnAcked(m) => m.arr_time,
            AppxMessage::Joining(m) => m.arr_time,
            AppxMessage::Joined(m) => m.arr_time,
            AppxMessage::BadDnDf(m) => m.arr_time,
            AppxMessage::DnClr(m) => m.arr_time,
        }
    }

    pub fn synth_time(&self) -> bool {
        match self {
            AppxMessage::UpDf(m) => m.synth_time,
            AppxMessage::UpInfo(m) => m.synth_time,
            AppxMessage::DnDf(m) => m.synth_time,
            AppxMessage::DnTxed(m) => m.synth_time,
            AppxMessage::DnAcked(m) => m.synth_time,
            AppxMessage::Joining(m) => m.synth_time,
            AppxMessage::Joined(m) => m.synth_time,
            AppxMessage::BadDnDf(m) => m.synth_time,
            AppxMessage::DnClr(m) => m.synth_time,
        }
    }

    /// Fill in the arrival timestamp when the wire carried none.  Marks the
    /// timestamp as synthesized.
    pub fn ensure_arrival_time(&mut self, now: ArrivalTime) {
        macro_rules! fill {
            ($m:expr) => {
                if $m.arr_time.is_none() {
                    $m.arr_time = Some(now);
                    $m.synth_time = true;
                }
            };
        }
        match self {
            AppxMessage::UpDf(m) => fill!(m),
            AppxMessage::UpInfo(m) => fill!(m),
            AppxMessage::DnDf(m) => fill!(m),
            AppxMessage::DnTxed(m) => fill!(m),
            AppxMessage::DnAcked(m) => fill!(m),
            AppxMessage::Joining(m) => fill!(m),
            AppxMessage::Joined(m) => fill!(m),
            AppxMessage::BadDnDf(m) => fill!(m),
            AppxMessage::DnClr(m) => fill!(m),
        }
    }

    /// The canonical JSON object handed to sinks.
    pub fn to_document(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            AppxMessage::UpDf(m) => serde_json::to_value(m),
            AppxMessage::UpInfo(m) => serde_json::to_value(m),
            AppxMessage::DnDf(m) => serde_json::to_value(m),
            AppxMessage::DnTxed(m) => serde_json::to_value(m),
            AppxMessage::DnAcked(m) => serde_json::to_value(m),
            AppxMessage::Joining(m) => serde_json::to_value(m),
            AppxMessage::Joined(m) => serde_json::to_value(m),
            AppxMessage::BadDnDf(m) => serde_json::to_value(m),
            AppxMessage::DnClr(m) => serde_json::to_value(m),
        }
    }
}

// ---------------------------------------------------------------------------
// Decode errors
// ---------------------------------------------------------------------------

/// Why a wire payload could not be decoded.
#[derive(Debug)]
pub enum DecodeError {
    /// `msgtype` is not in the known set.
    UnknownType(String),
    /// The payload is not valid JSON.
    MalformedJson(String),
    /// Valid JSON, but a field does not match the variant schema.
    FieldTypeMismatch(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnknownType(t) => write!(f, "unknown msgtype: {}", t),
            DecodeError::MalformedJson(s) => write!(f, "malformed JSON: {}", s),
            DecodeError::FieldTypeMismatch(s) => write!(f, "field type mismatch: {}", s),
        }
    }
}

impl std::error::Error for DecodeError {}
