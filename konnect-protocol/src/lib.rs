//! Headless KDE Connect protocol implementation.
//!
//! This library carries the wire codec, UDP discovery, the per-peer
//! session state machine, the trust store and the payload side-channel.
//! The companion daemon crate wires these together and exposes the admin
//! HTTP surface.

pub mod certificate;
pub mod database;
pub mod device;
pub mod discovery;
pub mod packet;
pub mod registry;
pub mod session;
pub mod tls;
pub mod transfer;

mod error;

pub use certificate::CertificateInfo;
pub use database::{CommandRow, Database, NotificationRow, TrustedDevice};
pub use device::{DeviceInfo, DeviceType, PairingStatus};
pub use discovery::{Discovery, DISCOVERY_PORT, MAX_PORT, MIN_PORT};
pub use error::{ProtocolError, Result};
pub use packet::{current_timestamp, Packet, PayloadInfo, DEVICE_TYPE, PROTOCOL_VERSION};
pub use registry::Registry;
pub use session::{PeerServer, ServerContext, SessionCommand, SessionHandle, PAIRING_TIMEOUT};
pub use transfer::TransferManager;
