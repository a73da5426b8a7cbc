//! Wire protocol: per-kind body structs, the flat JSON envelope, and the
//! codec mapping between [`DomainMessage`] and wire bytes.
//!
//! Every payload is a flat JSON object with a `type` discriminator,
//! `deviceId`, `callsign`, optional `recipients`, a timestamp, and the
//! kind-specific body fields. Timestamp field naming is historically
//! inconsistent across kinds (`ts` / `timestamp` / `createdAtMillis`); the
//! decoder accepts all three spellings for every kind and the encoder emits
//! each kind's historical one, so any existing peer population keeps
//! interoperating.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Acknowledgment, Direction, DomainMessage};
use crate::types::{DeviceAddress, MessageKind};

/// Errors produced by the wire codec.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload carries no timestamp field")]
    MissingTimestamp,

    #[error("type discriminator mismatch: expected `{expected}`, got `{got}`")]
    TypeMismatch { expected: &'static str, got: String },
}

/// Compile-time descriptor tying a wire body type to its [`MessageKind`].
///
/// The delivery machinery (stores, coordinator, codec) is generic over this
/// trait instead of being copy-pasted once per kind.
pub trait Kind: Send + Sync + 'static {
    type Body: Clone + std::fmt::Debug + Send + Serialize + DeserializeOwned;
    const KIND: MessageKind;
}

macro_rules! kinds {
    ($($marker:ident => $body:ty, $kind:expr;)*) => {
        $(
            pub enum $marker {}

            impl Kind for $marker {
                type Body = $body;
                const KIND: MessageKind = $kind;
            }
        )*
    };
}

kinds! {
    PositionKind => PositionBody, MessageKind::Position;
    PinKind      => PinBody,      MessageKind::Pin;
    ProfileKind  => ProfileBody,  MessageKind::Profile;
    ChatKind     => ChatBody,     MessageKind::Chat;
    OrderKind    => OrderBody,    MessageKind::Order;
    ReportKind   => ReportBody,   MessageKind::Report;
    MethaneKind  => MethaneBody,  MessageKind::Methane;
    MedevacKind  => MedevacBody,  MessageKind::Medevac;
    FormKind     => FormBody,     MessageKind::Form;
}

/// Periodic own-position beacon. Keyed by device id (latest wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionBody {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<i32>,
}

/// Map pin shared with the team.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinBody {
    pub lat: f64,
    pub lon: f64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Self-description broadcast; merged into the identity cache on receipt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileBody {
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub role: String,
}

/// Chat message within a thread (`"all"` or a peer device address).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    pub text: String,
    #[serde(default)]
    pub thread: String,
}

/// Tasking order, addressed and delivery-tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBody {
    pub title: String,
    pub text: String,
}

/// Field report, addressed and delivery-tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportBody {
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub category: String,
}

/// METHANE emergency report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethaneBody {
    pub major_incident: bool,
    pub exact_location: String,
    #[serde(default)]
    pub hazards: String,
    #[serde(default)]
    pub access: String,
    #[serde(default)]
    pub casualties: u32,
    #[serde(default)]
    pub emergency_services: String,
}

/// Medevac request (9-line subset).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedevacBody {
    pub location: String,
    pub precedence: String,
    #[serde(default)]
    pub patients: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_equipment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_at_pickup: Option<String>,
}

/// One filled field of a linked form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub name: String,
    pub value: String,
}

/// Filled form linked to a schema known to both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormBody {
    pub form_name: String,
    #[serde(default)]
    pub fields: Vec<FormField>,
}

/// Bulk-sync request payload carried on `pin_req` / `profile_req`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(rename = "deviceId")]
    pub device_id: DeviceAddress,
    #[serde(rename = "ts", alias = "timestamp", alias = "createdAtMillis")]
    pub ts: i64,
}

/// The common envelope every domain message is flattened into on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<B> {
    #[serde(rename = "type")]
    type_tag: String,
    id: String,
    #[serde(rename = "deviceId")]
    device_id: DeviceAddress,
    #[serde(rename = "callsign", default)]
    callsign: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    recipients: Vec<DeviceAddress>,
    #[serde(rename = "createdAtMillis", alias = "ts", alias = "timestamp")]
    created_at_millis: i64,
    #[serde(flatten)]
    body: B,
}

const TS_SPELLINGS: [&str; 3] = ["createdAtMillis", "ts", "timestamp"];

/// Extract the embedded timestamp from a raw payload, trying every known
/// field spelling. Used by the replay filter ahead of full decoding.
pub fn peek_timestamp(value: &serde_json::Value) -> Option<i64> {
    let obj = value.as_object()?;
    TS_SPELLINGS
        .iter()
        .find_map(|name| obj.get(*name).and_then(|v| v.as_i64()))
}

/// Serialize a domain message to wire bytes, emitting the kind's historical
/// timestamp field name.
pub fn encode<K: Kind>(msg: &DomainMessage<K::Body>) -> Result<Vec<u8>, CodecError> {
    let envelope = Envelope {
        type_tag: K::KIND.wire_type().to_string(),
        id: msg.id.clone(),
        device_id: msg.sender_id.clone(),
        callsign: msg.sender_callsign.clone(),
        recipients: msg.recipients.clone(),
        created_at_millis: msg.created_at_millis,
        body: msg.body.clone(),
    };

    let mut value = serde_json::to_value(&envelope)?;
    let ts_field = K::KIND.timestamp_field();
    if ts_field != "createdAtMillis" {
        let obj = value.as_object_mut().ok_or(CodecError::NotAnObject)?;
        if let Some(ts) = obj.remove("createdAtMillis") {
            obj.insert(ts_field.to_string(), ts);
        }
    }
    Ok(serde_json::to_vec(&value)?)
}

/// Decode a raw payload into a domain message of kind `K`.
///
/// The resulting message is marked `Incoming` and unread; the channel the
/// bytes arrived on decides `K`, the embedded `type` tag is only verified.
pub fn decode<K: Kind>(value: serde_json::Value) -> Result<DomainMessage<K::Body>, CodecError> {
    let expected = K::KIND.wire_type();
    if let Some(got) = value.get("type").and_then(|t| t.as_str()) {
        if got != expected {
            return Err(CodecError::TypeMismatch {
                expected,
                got: got.to_string(),
            });
        }
    }
    if peek_timestamp(&value).is_none() {
        return Err(CodecError::MissingTimestamp);
    }

    let envelope: Envelope<K::Body> = serde_json::from_value(value)?;
    Ok(DomainMessage {
        id: envelope.id,
        created_at_millis: envelope.created_at_millis,
        sender_id: envelope.device_id,
        sender_callsign: envelope.callsign,
        recipients: envelope.recipients,
        direction: Direction::Incoming,
        is_read: false,
        body: envelope.body,
    })
}

/// Serialize an acknowledgment for its kind's ack channel.
pub fn encode_ack(ack: &Acknowledgment) -> Result<Vec<u8>, CodecError> {
    let mut value = serde_json::to_value(ack)?;
    let obj = value.as_object_mut().ok_or(CodecError::NotAnObject)?;
    obj.insert("type".to_string(), serde_json::Value::from("ack"));
    Ok(serde_json::to_vec(&value)?)
}

/// Decode an acknowledgment payload.
pub fn decode_ack(value: serde_json::Value) -> Result<Acknowledgment, CodecError> {
    Ok(serde_json::from_value(value)?)
}

/// Serialize a bulk-sync request for `pin_req` / `profile_req`.
pub fn encode_request(
    type_tag: &str,
    device_id: &DeviceAddress,
    ts: i64,
) -> Result<Vec<u8>, CodecError> {
    let req = SyncRequest {
        type_tag: type_tag.to_string(),
        device_id: device_id.clone(),
        ts,
    };
    Ok(serde_json::to_vec(&req)?)
}

/// Decode a bulk-sync request payload.
pub fn decode_request(value: serde_json::Value) -> Result<SyncRequest, CodecError> {
    Ok(serde_json::from_value(value)?)
}
