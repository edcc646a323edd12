//! Peer device identity.
//!
//! A [`DeviceInfo`] is what an identity packet tells us about the peer on
//! the other end; it exists independently of pairing state.

use crate::packet::{packet_type, Packet};
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Device classes appearing in identity packets. Anything we do not
/// recognise is carried as [`DeviceType::Unknown`] rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl From<&str> for DeviceType {
    fn from(value: &str) -> Self {
        match value {
            "desktop" => DeviceType::Desktop,
            "laptop" => DeviceType::Laptop,
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Unknown,
        }
    }
}

/// Pairing status of a live session. Persistent trust lives in the
/// database; this is only the in-flight handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    NotPaired,
    Requested,
    Paired,
}

/// Identity advertised by a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: i64,
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,
    /// Absent on the TCP identity packet; required on UDP.
    #[serde(default)]
    pub tcp_port: Option<u16>,
}

impl DeviceInfo {
    /// Parse an identity packet.
    pub fn from_identity(packet: &Packet) -> Result<Self> {
        if !packet.is_type(packet_type::IDENTITY) {
            return Err(ProtocolError::InvalidPacket(
                "not an identity packet".to_string(),
            ));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing deviceId".to_string()))?;

        let device_name = packet
            .get_body_field::<String>("deviceName")
            .unwrap_or_else(|| "unnamed".to_string());

        let device_type = packet
            .get_body_field::<String>("deviceType")
            .map(|t| DeviceType::from(t.as_str()))
            .unwrap_or(DeviceType::Unknown);

        let protocol_version = packet.get_body_field::<i64>("protocolVersion").unwrap_or(0);

        let incoming_capabilities = packet
            .get_body_field::<Vec<String>>("incomingCapabilities")
            .unwrap_or_default();

        let outgoing_capabilities = packet
            .get_body_field::<Vec<String>>("outgoingCapabilities")
            .unwrap_or_default();

        let tcp_port = packet.get_body_field::<u16>("tcpPort");

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
            tcp_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_identity() {
        let packet = Packet::create_identity("dev_a", "Workstation", 1764, None);
        let info = DeviceInfo::from_identity(&packet).unwrap();

        assert_eq!(info.device_id, "dev_a");
        assert_eq!(info.device_name, "Workstation");
        assert_eq!(info.device_type, DeviceType::Desktop);
        assert_eq!(info.tcp_port, Some(1764));
        assert!(!info.incoming_capabilities.is_empty());
    }

    #[test]
    fn test_parse_identity_defaults() {
        let packet = Packet::new(
            packet_type::IDENTITY,
            json!({"deviceId": "dev_b", "deviceType": "fridge"}),
        );
        let info = DeviceInfo::from_identity(&packet).unwrap();

        assert_eq!(info.device_name, "unnamed");
        assert_eq!(info.device_type, DeviceType::Unknown);
        assert_eq!(info.protocol_version, 0);
        assert_eq!(info.tcp_port, None);
    }

    #[test]
    fn test_missing_device_id_rejected() {
        let packet = Packet::new(packet_type::IDENTITY, json!({"deviceName": "x"}));
        assert!(DeviceInfo::from_identity(&packet).is_err());
    }

    #[test]
    fn test_non_identity_rejected() {
        let packet = Packet::create_ping(None);
        assert!(DeviceInfo::from_identity(&packet).is_err());
    }
}
