//! Network packet codec.
//!
//! Packets are JSON objects terminated by a newline, one per line. The
//! envelope carries an `id` (milliseconds since epoch), a `type` string and
//! a `body` object; file payload offers additionally carry `payloadSize`
//! and `payloadTransferInfo` as envelope-level siblings of `body`.

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Protocol version this implementation advertises.
pub const PROTOCOL_VERSION: i64 = 8;

/// Device type this implementation advertises.
pub const DEVICE_TYPE: &str = "desktop";

/// Maximum accepted length of the cleartext identity line on a fresh
/// connection. Anything longer is hostile.
pub const IDENTITY_BUFFER_SIZE: usize = 8192;

/// Wire packet type strings.
pub mod packet_type {
    pub const IDENTITY: &str = "kdeconnect.identity";
    pub const PAIR: &str = "kdeconnect.pair";
    pub const PING: &str = "kdeconnect.ping";
    pub const RING: &str = "kdeconnect.findmyphone.request";
    pub const NOTIFICATION: &str = "kdeconnect.notification";
    pub const NOTIFICATION_REQUEST: &str = "kdeconnect.notification.request";
    pub const RUNCOMMAND: &str = "kdeconnect.runcommand";
    pub const RUNCOMMAND_REQUEST: &str = "kdeconnect.runcommand.request";
    pub const SHARE: &str = "kdeconnect.share.request";
}

/// Payload offer attached to an outgoing notification: content digest,
/// total size and the transfer port serving the bytes.
#[derive(Debug, Clone)]
pub struct PayloadInfo {
    pub digest: String,
    pub size: i64,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// Some peers stamp the id as a string, others as a number.
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,

    #[serde(rename = "type")]
    pub packet_type: String,

    #[serde(default)]
    pub body: Value,

    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Create a packet stamped with the current time.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Serialize to the wire format: JSON followed by a newline.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse one wire line. Leading and trailing whitespace is tolerated.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let start = data
            .iter()
            .position(|&b| b != 0 && !b.is_ascii_whitespace())
            .unwrap_or(data.len());
        let end = data
            .iter()
            .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
            .map(|p| p + 1)
            .unwrap_or(start);

        serde_json::from_slice(&data[start..end])
            .map_err(|e| ProtocolError::InvalidPacket(format!("unserialization error: {}", e)))
    }

    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Fetch a typed field out of the body.
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn has_body_field(&self, key: &str) -> bool {
        self.body.get(key).is_some()
    }

    /// Identity packet announcing this device.
    ///
    /// `version` lets the directed discovery reply and post-TLS identity
    /// echo the peer's advertised protocol version.
    pub fn create_identity(
        identifier: &str,
        name: &str,
        tcp_port: u16,
        version: Option<i64>,
    ) -> Self {
        Self::new(
            packet_type::IDENTITY,
            json!({
                "protocolVersion": version.unwrap_or(PROTOCOL_VERSION),
                "deviceId": identifier,
                "deviceName": name,
                "deviceType": DEVICE_TYPE,
                "tcpPort": tcp_port,
                "incomingCapabilities": [
                    packet_type::PING,
                    packet_type::NOTIFICATION_REQUEST,
                    packet_type::RUNCOMMAND_REQUEST,
                    packet_type::RUNCOMMAND,
                    packet_type::SHARE,
                ],
                "outgoingCapabilities": [
                    packet_type::RING,
                    packet_type::NOTIFICATION,
                    packet_type::PING,
                    packet_type::RUNCOMMAND,
                ],
            }),
        )
    }

    pub fn create_pair(pair: bool) -> Self {
        Self::new(
            packet_type::PAIR,
            json!({
                "pair": pair,
                "timestamp": Utc::now().timestamp(),
            }),
        )
    }

    pub fn create_ping(message: Option<&str>) -> Self {
        let body = match message {
            Some(msg) => json!({ "message": msg }),
            None => json!({}),
        };
        Self::new(packet_type::PING, body)
    }

    pub fn create_ring() -> Self {
        Self::new(packet_type::RING, json!({}))
    }

    /// Notification packet. An empty reference is replaced by a fresh uuid.
    /// A payload offer moves `payloadSize` and the transfer port to the
    /// envelope and keeps only the digest inside the body.
    pub fn create_notification(
        text: &str,
        title: &str,
        application: &str,
        reference: &str,
        payload: Option<&PayloadInfo>,
    ) -> Self {
        let reference = if reference.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            reference.to_string()
        };

        let mut packet = Self::new(
            packet_type::NOTIFICATION,
            json!({
                "id": reference,
                "appName": application,
                "title": title,
                "text": text,
                "isClearable": true,
                "ticker": format!("{}: {}", title, text),
            }),
        );

        if let Some(payload) = payload {
            if let Value::Object(ref mut map) = packet.body {
                map.insert("payloadHash".into(), json!(payload.digest));
            }
            packet.payload_size = Some(payload.size);
            packet.payload_transfer_info =
                Some(HashMap::from([("port".to_string(), json!(payload.port))]));
        }

        packet
    }

    /// Cancel for a previously sent notification.
    pub fn create_cancel(reference: &str) -> Self {
        Self::new(
            packet_type::NOTIFICATION,
            json!({
                "id": reference,
                "isCancel": true,
            }),
        )
    }

    /// Command catalog offered to the peer. The list itself travels as a
    /// JSON-encoded string, matching what the Android app expects.
    pub fn create_commands(commands: &HashMap<String, Value>) -> Result<Self> {
        let encoded = serde_json::to_string(commands)?;
        Ok(Self::new(
            packet_type::RUNCOMMAND,
            json!({
                "canAddCommand": false,
                "commandList": encoded,
            }),
        ))
    }

    /// Ask the peer to execute one of its advertised commands.
    pub fn create_run(key: &str) -> Self {
        Self::new(packet_type::RUNCOMMAND_REQUEST, json!({ "key": key }))
    }

    /// Build a packet from caller-supplied JSON, stamping `id` and
    /// defaulting `body` when absent.
    pub fn from_value(mut data: Value) -> Result<Self> {
        if let Value::Object(ref mut map) = data {
            map.entry("id").or_insert_with(|| json!(current_timestamp()));
            map.entry("body").or_insert_with(|| json!({}));
        }
        serde_json::from_value(data)
            .map_err(|e| ProtocolError::InvalidPacket(format!("unserialization error: {}", e)))
    }

    /// Validate an identity body carries every required key.
    pub fn is_valid_identity(&self) -> bool {
        const REQUIRED: [&str; 6] = [
            "deviceId",
            "deviceName",
            "deviceType",
            "protocolVersion",
            "incomingCapabilities",
            "outgoingCapabilities",
        ];
        self.is_type(packet_type::IDENTITY) && REQUIRED.iter().all(|k| self.has_body_field(k))
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| Error::custom("invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Milliseconds since the epoch, the packet id convention.
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        let packet = Packet::create_ping(Some("hello"));
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');

        let parsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);

        let reencoded = parsed.to_bytes().unwrap();
        let a: Value = serde_json::from_slice(&bytes).unwrap();
        let b: Value = serde_json::from_slice(&reencoded).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_packet() {
        let packet = Packet::create_identity("a1b2", "workstation", 1764, None);
        assert!(packet.is_valid_identity());
        assert_eq!(packet.get_body_field::<u16>("tcpPort"), Some(1764));
        assert_eq!(
            packet.get_body_field::<i64>("protocolVersion"),
            Some(PROTOCOL_VERSION)
        );
        assert_eq!(
            packet.get_body_field::<String>("deviceType"),
            Some("desktop".to_string())
        );

        let incoming = packet
            .get_body_field::<Vec<String>>("incomingCapabilities")
            .unwrap();
        assert!(incoming.contains(&packet_type::SHARE.to_string()));
    }

    #[test]
    fn test_identity_echoes_peer_version() {
        let packet = Packet::create_identity("a1b2", "workstation", 1764, Some(7));
        assert_eq!(packet.get_body_field::<i64>("protocolVersion"), Some(7));
    }

    #[test]
    fn test_pair_packet() {
        let packet = Packet::create_pair(true);
        assert_eq!(packet.get_body_field::<bool>("pair"), Some(true));
        assert!(packet.has_body_field("timestamp"));
    }

    #[test]
    fn test_notification_payload_placement() {
        let payload = PayloadInfo {
            digest: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            size: 512,
            port: 1739,
        };
        let packet = Packet::create_notification("text", "title", "app", "r1", Some(&payload));

        // digest in the body, size and port at the envelope level
        assert_eq!(
            packet.get_body_field::<String>("payloadHash"),
            Some(payload.digest.clone())
        );
        assert_eq!(packet.payload_size, Some(512));
        let info = packet.payload_transfer_info.as_ref().unwrap();
        assert_eq!(info.get("port"), Some(&json!(1739)));

        let value: Value = serde_json::from_slice(&packet.to_bytes().unwrap()).unwrap();
        assert!(value.get("payloadSize").is_some());
        assert!(value["body"].get("payloadSize").is_none());
        assert_eq!(value["payloadTransferInfo"]["port"], json!(1739));
    }

    #[test]
    fn test_notification_generates_reference() {
        let packet = Packet::create_notification("t", "T", "app", "", None);
        let reference = packet.get_body_field::<String>("id").unwrap();
        assert!(!reference.is_empty());
    }

    #[test]
    fn test_cancel_packet() {
        let packet = Packet::create_cancel("r1");
        assert!(packet.is_type(packet_type::NOTIFICATION));
        assert_eq!(packet.get_body_field::<bool>("isCancel"), Some(true));
        assert_eq!(packet.get_body_field::<String>("id"), Some("r1".to_string()));
    }

    #[test]
    fn test_commands_catalog_is_string_encoded() {
        let mut commands = HashMap::new();
        commands.insert(
            "k1".to_string(),
            json!({"name": "reboot", "command": "systemctl reboot"}),
        );
        let packet = Packet::create_commands(&commands).unwrap();

        let encoded = packet.get_body_field::<String>("commandList").unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded["k1"]["name"], "reboot");
        assert_eq!(packet.get_body_field::<bool>("canAddCommand"), Some(false));
    }

    #[test]
    fn test_from_value_stamps_defaults() {
        let packet = Packet::from_value(json!({"type": "kdeconnect.ping"})).unwrap();
        assert!(packet.id > 0);
        assert!(packet.body.is_object());
    }

    #[test]
    fn test_malformed_line_rejected() {
        assert!(Packet::from_bytes(b"{not json}\n").is_err());
        assert!(Packet::from_bytes(b"").is_err());
    }
}
