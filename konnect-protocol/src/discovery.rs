//! UDP device discovery.
//!
//! An identity beacon is broadcast on UDP 1716 at startup and on demand.
//! Inbound identity packets are screened (own id, dedup window, service
//! port range, protocol version) and answered with a *directed* identity
//! packet so the peer learns our TCP service port and dials back.

use crate::packet::{packet_type, Packet, PROTOCOL_VERSION};
use crate::Result;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Fixed protocol discovery port.
pub const DISCOVERY_PORT: u16 = 1716;

/// Service ports outside this range are not KDE Connect.
pub const MIN_PORT: u16 = 1716;
pub const MAX_PORT: u16 = 1764;

/// Two packets from the same device inside this window are one packet.
const DEDUP_WINDOW: Duration = Duration::from_millis(500);

const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// What the ingest pipeline decided about one datagram.
#[derive(Debug, PartialEq, Eq)]
enum Ingest {
    /// Reply with a directed identity packet echoing this version.
    Reply(i64),
    Discard(&'static str),
}

pub struct Discovery {
    socket: Arc<UdpSocket>,
    identifier: String,
    name: String,
    service_port: u16,
}

impl Discovery {
    /// Bind the discovery socket. With `receiver` unset an ephemeral port
    /// is used: we can announce and be answered, but stay invisible to
    /// broadcasts.
    pub async fn bind(
        identifier: impl Into<String>,
        name: impl Into<String>,
        discovery_port: u16,
        service_port: u16,
        receiver: bool,
    ) -> Result<Self> {
        let port = if receiver { discovery_port } else { 0 };
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        socket.set_broadcast(true)?;

        info!("Discovery bound to UDP port {}", socket.local_addr()?.port());

        Ok(Self {
            socket: Arc::new(socket),
            identifier: identifier.into(),
            name: name.into(),
            service_port,
        })
    }

    /// Broadcast our identity.
    pub async fn announce(&self) -> Result<()> {
        info!("Broadcasting identity packet");
        self.send_identity(IpAddr::V4(BROADCAST_ADDR), None).await
    }

    /// Directed identity to a single host, echoing its protocol version.
    async fn announce_to(&self, address: IpAddr, version: i64) -> Result<()> {
        debug!("Directed identity to {}", address);
        self.send_identity(address, Some(version)).await
    }

    async fn send_identity(&self, address: IpAddr, version: Option<i64>) -> Result<()> {
        let packet =
            Packet::create_identity(&self.identifier, &self.name, self.service_port, version);
        let target = SocketAddr::new(address, DISCOVERY_PORT);
        self.socket.send_to(&packet.to_bytes()?, target).await?;
        Ok(())
    }

    /// Ingest loop. Never returns under normal operation.
    pub async fn run(&self) -> Result<()> {
        let mut buf = [0u8; 8192];
        let mut last_seen: HashMap<String, Instant> = HashMap::new();

        loop {
            let (size, addr) = self.socket.recv_from(&mut buf).await?;

            let packet = match Packet::from_bytes(&buf[..size]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Unserialization error from {}: {}", addr, e);
                    continue;
                }
            };

            match evaluate(&self.identifier, &packet, &mut last_seen, Instant::now()) {
                Ingest::Reply(version) => {
                    debug!(
                        "Received UDP identity packet from {}, trying reverse connection",
                        addr.ip()
                    );
                    if let Err(e) = self.announce_to(addr.ip(), version).await {
                        warn!("Failed to answer {}: {}", addr.ip(), e);
                    }
                }
                Ingest::Discard(reason) => debug!("Discarding datagram from {}: {}", addr, reason),
            }
        }
    }
}

/// Screening pipeline for one inbound identity packet. Updates the
/// dedup map only when the packet is accepted.
fn evaluate(
    own_identifier: &str,
    packet: &Packet,
    last_seen: &mut HashMap<String, Instant>,
    now: Instant,
) -> Ingest {
    if !packet.is_type(packet_type::IDENTITY) {
        return Ingest::Discard("not an identity packet");
    }

    let device_id = match packet.get_body_field::<String>("deviceId") {
        Some(id) => id,
        None => return Ingest::Discard("missing deviceId"),
    };

    if device_id == own_identifier {
        return Ingest::Discard("own broadcast");
    }

    if let Some(seen) = last_seen.get(&device_id) {
        if now.duration_since(*seen) < DEDUP_WINDOW {
            return Ingest::Discard("second packet inside the dedup window");
        }
    }

    let tcp_port = packet.get_body_field::<u16>("tcpPort").unwrap_or(0);
    if !(MIN_PORT..=MAX_PORT).contains(&tcp_port) {
        return Ingest::Discard("tcpPort outside of kdeconnect's range");
    }

    let version = packet.get_body_field::<i64>("protocolVersion").unwrap_or(0);
    if version < PROTOCOL_VERSION - 1 {
        info!(
            "Refusing to connect to a device using an older protocol version, ignoring {}",
            device_id
        );
        return Ingest::Discard("protocol version too old");
    }

    last_seen.insert(device_id, now);
    Ingest::Reply(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(id: &str, port: u16, version: i64) -> Packet {
        Packet::new(
            packet_type::IDENTITY,
            json!({
                "deviceId": id,
                "deviceName": id,
                "deviceType": "phone",
                "protocolVersion": version,
                "tcpPort": port,
                "incomingCapabilities": [],
                "outgoingCapabilities": [],
            }),
        )
    }

    #[test]
    fn test_accepts_and_echoes_version() {
        let mut seen = HashMap::new();
        let packet = identity("b", 1764, 8);
        assert_eq!(
            evaluate("a", &packet, &mut seen, Instant::now()),
            Ingest::Reply(8)
        );
    }

    #[test]
    fn test_discards_own_broadcast() {
        let mut seen = HashMap::new();
        let packet = identity("a", 1764, 8);
        assert!(matches!(
            evaluate("a", &packet, &mut seen, Instant::now()),
            Ingest::Discard(_)
        ));
    }

    #[test]
    fn test_discards_non_identity() {
        let mut seen = HashMap::new();
        let packet = Packet::create_ping(None);
        assert!(matches!(
            evaluate("a", &packet, &mut seen, Instant::now()),
            Ingest::Discard(_)
        ));
    }

    #[test]
    fn test_dedup_window() {
        let mut seen = HashMap::new();
        let packet = identity("b", 1764, 8);
        let start = Instant::now();

        assert_eq!(evaluate("a", &packet, &mut seen, start), Ingest::Reply(8));
        assert!(matches!(
            evaluate("a", &packet, &mut seen, start + Duration::from_millis(100)),
            Ingest::Discard(_)
        ));
        assert_eq!(
            evaluate("a", &packet, &mut seen, start + Duration::from_millis(600)),
            Ingest::Reply(8)
        );
    }

    #[test]
    fn test_rejected_packets_do_not_arm_the_dedup_window() {
        let mut seen = HashMap::new();
        let start = Instant::now();

        let bad = identity("b", 1715, 8);
        assert!(matches!(
            evaluate("a", &bad, &mut seen, start),
            Ingest::Discard(_)
        ));

        let good = identity("b", 1716, 8);
        assert_eq!(
            evaluate("a", &good, &mut seen, start + Duration::from_millis(10)),
            Ingest::Reply(8)
        );
    }

    #[test]
    fn test_port_bounds() {
        let mut seen = HashMap::new();
        for port in [1715u16, 1765] {
            let packet = identity("b", port, 8);
            assert!(matches!(
                evaluate("a", &packet, &mut seen, Instant::now()),
                Ingest::Discard(_)
            ));
        }
        for port in [1716u16, 1764] {
            let packet = identity(&format!("b{}", port), port, 8);
            assert!(matches!(
                evaluate("a", &packet, &mut seen, Instant::now()),
                Ingest::Reply(_)
            ));
        }
    }

    #[test]
    fn test_old_protocol_version_refused() {
        let mut seen = HashMap::new();
        let packet = identity("b", 1764, 5);
        assert!(matches!(
            evaluate("a", &packet, &mut seen, Instant::now()),
            Ingest::Discard(_)
        ));

        let packet = identity("c", 1764, PROTOCOL_VERSION - 1);
        assert!(matches!(
            evaluate("a", &packet, &mut seen, Instant::now()),
            Ingest::Reply(_)
        ));
    }
}
