//! Peer session state machine.
//!
//! One task per accepted TCP connection. The first line must be a
//! cleartext identity packet; the socket is then upgraded in place to TLS
//! with *us* in the client role (the KDE Connect inversion) and all
//! further traffic is line-delimited JSON over the encrypted stream.
//!
//! The task is the single consumer for its connection: inbound packets
//! and admin-originated commands are interleaved through one `select!`
//! loop, which gives every peer FIFO ordering between the two.

use crate::certificate::{common_name, peer_cert_pem, CertificateInfo};
use crate::database::Database;
use crate::device::{DeviceInfo, DeviceType, PairingStatus};
use crate::packet::{packet_type, Packet, PayloadInfo, IDENTITY_BUFFER_SIZE, PROTOCOL_VERSION};
use crate::registry::Registry;
use crate::transfer::TransferManager;
use crate::{ProtocolError, Result};
use openssl::ssl::{Ssl, SslConnector};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An unanswered outgoing pair request expires after this long.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between consecutive notifications during replay.
const REPLAY_STAGGER: Duration = Duration::from_millis(100);

/// Post-TLS lines beyond this size abort the connection.
const MAX_LINE_SIZE: usize = 10 * 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a session needs besides its own socket.
pub struct ServerContext {
    pub identity: CertificateInfo,
    pub device_name: String,
    pub service_port: u16,
    pub connector: Arc<SslConnector>,
    pub database: Arc<Database>,
    pub registry: Arc<Registry>,
    pub transfers: Arc<TransferManager>,
}

impl ServerContext {
    pub fn identifier(&self) -> &str {
        &self.identity.device_id
    }
}

/// Admin-originated work for a live session.
#[derive(Debug)]
pub enum SessionCommand {
    SendPing {
        message: Option<String>,
    },
    SendRing,
    SendNotification {
        text: String,
        title: String,
        application: String,
        reference: String,
        payload: Option<PayloadInfo>,
    },
    SendCancel {
        reference: String,
    },
    /// Ask the peer to run one of its advertised commands.
    SendRunRequest {
        key: String,
    },
    /// Prebuilt packet from the debug endpoint.
    SendCustom {
        packet: Packet,
    },
    RequestPair,
    RequestUnpair,
    /// Fired by the pairing timer task.
    PairTimeout,
    Close,
}

/// Peer state shared with the registry and the admin API.
#[derive(Debug)]
struct PeerShared {
    name: String,
    device_type: DeviceType,
    status: PairingStatus,
    /// Command catalog the peer advertised to us.
    commands: HashMap<String, Value>,
}

/// Cloneable reference to a live session.
#[derive(Clone)]
pub struct SessionHandle {
    connection_id: Uuid,
    identifier: String,
    address: SocketAddr,
    shared: Arc<Mutex<PeerShared>>,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn name(&self) -> String {
        self.shared.lock().unwrap().name.clone()
    }

    pub fn device_type(&self) -> DeviceType {
        self.shared.lock().unwrap().device_type
    }

    pub fn status(&self) -> PairingStatus {
        self.shared.lock().unwrap().status
    }

    pub fn commands(&self) -> HashMap<String, Value> {
        self.shared.lock().unwrap().commands.clone()
    }

    /// Enqueue a command; FIFO with respect to everything else on this
    /// session.
    pub fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| ProtocolError::NotReachable(self.identifier.clone()))
    }
}

/// TCP service listener; one spawned session task per accepted socket.
pub struct PeerServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl PeerServer {
    pub async fn bind(ctx: Arc<ServerContext>, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Service listening on TCP port {}", port);
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, address) = self.listener.accept().await?;
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(ctx, stream, address).await {
                    debug!("Session {} ended: {}", address, e);
                }
            });
        }
    }
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    address: SocketAddr,
) -> Result<()> {
    socket2::SockRef::from(&stream).set_keepalive(true)?;

    let mut stream = stream;

    // Cleartext phase: wait for the identity packet, one bounded line at
    // a time. Reading byte-by-byte keeps the TLS ClientHello that follows
    // the newline out of our hands.
    let peer = loop {
        let line = read_cleartext_line(&mut stream, address).await?;
        let packet = Packet::from_bytes(&line).map_err(|e| {
            warn!("Unserialization error from {}: {}", address, e);
            e
        })?;

        if !packet.is_type(packet_type::IDENTITY) {
            warn!(
                "Device at {} not identified, ignoring non encrypted packet {}",
                address, packet.packet_type
            );
            continue;
        }

        break DeviceInfo::from_identity(&packet)?;
    };

    if peer.protocol_version < PROTOCOL_VERSION - 1 {
        info!(
            "{} uses an old protocol version, this won't work",
            peer.device_name
        );
        return Err(ProtocolError::UnsupportedProtocolVersion(
            peer.device_id,
            peer.protocol_version,
        ));
    }

    // In-place upgrade; we accepted the TCP socket but start TLS as the
    // client so both sides exchange certificates without verification.
    debug!("Starting client TLS with {} (accepted socket)", address);
    let ssl = Ssl::new(ctx.connector.context())?;
    let mut tls = SslStream::new(ssl, stream)?;
    timeout(HANDSHAKE_TIMEOUT, Pin::new(&mut tls).connect())
        .await
        .map_err(|_| ProtocolError::Handshake("handshake timeout".to_string()))?
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let peer_cert = tls
        .ssl()
        .peer_certificate()
        .ok_or_else(|| ProtocolError::Certificate("peer sent no certificate".to_string()))?;
    let peer_cn = common_name(&peer_cert).ok_or_else(|| {
        ProtocolError::Certificate("peer certificate carries no common name".to_string())
    })?;
    let peer_pem = peer_cert_pem(&peer_cert)?;

    if ctx.database.is_trusted(&peer.device_id) {
        info!("It is a known device {}", peer.device_name);
    } else {
        info!("It is a new device {}", peer.device_name);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(PeerShared {
        name: peer.device_name.clone(),
        device_type: peer.device_type,
        status: PairingStatus::NotPaired,
        commands: HashMap::new(),
    }));

    let handle = SessionHandle {
        connection_id: Uuid::new_v4(),
        identifier: peer.device_id.clone(),
        address,
        shared: shared.clone(),
        tx: tx.clone(),
    };

    if let Some(superseded) = ctx.registry.insert(handle.clone()) {
        let _ = superseded.send(SessionCommand::Close);
    }

    let (read_half, write_half) = tokio::io::split(tls);

    let mut session = PeerSession {
        ctx: ctx.clone(),
        connection_id: handle.connection_id,
        address,
        identifier: peer.device_id.clone(),
        peer_cn,
        peer_pem,
        shared,
        tx,
        writer: write_half,
        pair_timer: None,
    };

    let result = session.run(BufReader::new(read_half), rx).await;

    if let Some(timer) = session.pair_timer.take() {
        timer.abort();
    }
    ctx.registry
        .remove(&session.identifier, session.connection_id);
    info!("Device {} disconnected", session.shared_name());

    result
}

/// Read one cleartext line without buffering past the newline. Lines
/// longer than the identity bound are hostile.
async fn read_cleartext_line(stream: &mut TcpStream, address: SocketAddr) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        if byte[0] == b'\n' {
            return Ok(line);
        }
        line.push(byte[0]);
        if line.len() > IDENTITY_BUFFER_SIZE {
            warn!(
                "Suspiciously long identity package received, closing connection to {}",
                address
            );
            return Err(ProtocolError::InvalidPacket(
                "identity line exceeds buffer size".to_string(),
            ));
        }
    }
}

struct PeerSession {
    ctx: Arc<ServerContext>,
    connection_id: Uuid,
    address: SocketAddr,
    identifier: String,
    peer_cn: String,
    /// PEM capture of the peer certificate, stored at pairing time.
    peer_pem: String,
    shared: Arc<Mutex<PeerShared>>,
    /// Loops back timer and replay events into our own queue.
    tx: mpsc::UnboundedSender<SessionCommand>,
    writer: WriteHalf<SslStream<TcpStream>>,
    pair_timer: Option<JoinHandle<()>>,
}

enum Flow {
    Continue,
    Stop,
}

impl PeerSession {
    async fn run(
        &mut self,
        mut reader: BufReader<tokio::io::ReadHalf<SslStream<TcpStream>>>,
        mut rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<()> {
        let mut line = Vec::new();

        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut line) => {
                    match read {
                        Ok(0) => return Ok(()),
                        Ok(_) => {
                            if line.len() > MAX_LINE_SIZE {
                                return Err(ProtocolError::InvalidPacket(
                                    "packet exceeds maximum size".to_string(),
                                ));
                            }
                            let packet = match Packet::from_bytes(&line) {
                                Ok(packet) => packet,
                                Err(e) => {
                                    warn!("Unserialization error from {}: {}", self.address, e);
                                    return Err(e);
                                }
                            };
                            line.clear();
                            if let Flow::Stop = self.dispatch(packet).await? {
                                return Ok(());
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                command = rx.recv() => {
                    match command {
                        None => return Ok(()),
                        Some(command) => {
                            if let Flow::Stop = self.handle_command(command).await? {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// One inbound post-TLS packet.
    async fn dispatch(&mut self, packet: Packet) -> Result<Flow> {
        // The certificate is pinned for the lifetime of the connection;
        // its CN must keep matching the announced device id.
        if self.peer_cn != self.identifier {
            warn!(
                "DeviceID in cert doesn't match deviceID in identity packet, {} vs {}",
                self.identifier, self.peer_cn
            );
            return Err(ProtocolError::Certificate(
                "certificate common name mismatch".to_string(),
            ));
        }

        debug!(
            "RecvTCP({}) - {} {}",
            self.address, packet.packet_type, packet.body
        );

        if packet.is_type(packet_type::PAIR) {
            self.handle_pairing(&packet).await?;
        } else if packet.is_type(packet_type::IDENTITY) {
            let version = packet.get_body_field::<i64>("protocolVersion");
            let identity = Packet::create_identity(
                self.ctx.identifier(),
                &self.ctx.device_name,
                self.ctx.service_port,
                version,
            );
            self.send_packet(&identity).await?;
        } else if self.is_trusted() {
            if packet.is_type(packet_type::NOTIFICATION_REQUEST) {
                self.handle_notify(&packet).await?;
            } else if packet.is_type(packet_type::PING) {
                let message = packet.get_body_field::<String>("message");
                self.send_packet(&Packet::create_ping(message.as_deref()))
                    .await?;
            } else if packet.is_type(packet_type::RUNCOMMAND) {
                self.handle_command_catalog(&packet);
            } else if packet.is_type(packet_type::RUNCOMMAND_REQUEST) {
                self.handle_command_request(&packet).await?;
            } else if packet.is_type(packet_type::SHARE) {
                self.handle_share(&packet)?;
            } else {
                warn!(
                    "Discarding unsupported packet {} for {}",
                    packet.packet_type,
                    self.shared_name()
                );
            }
        } else {
            warn!(
                "Device {} not paired, ignoring packet {}",
                self.shared_name(),
                packet.packet_type
            );
            self.set_status(PairingStatus::NotPaired);
            self.send_packet(&Packet::create_pair(false)).await?;
        }

        Ok(Flow::Continue)
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<Flow> {
        match command {
            SessionCommand::SendPing { message } => {
                self.send_packet(&Packet::create_ping(message.as_deref()))
                    .await?;
            }
            SessionCommand::SendRing => {
                self.send_packet(&Packet::create_ring()).await?;
            }
            SessionCommand::SendNotification {
                text,
                title,
                application,
                reference,
                payload,
            } => {
                let packet = Packet::create_notification(
                    &text,
                    &title,
                    &application,
                    &reference,
                    payload.as_ref(),
                );
                self.send_packet(&packet).await?;
            }
            SessionCommand::SendCancel { reference } => {
                self.send_packet(&Packet::create_cancel(&reference)).await?;
            }
            SessionCommand::SendRunRequest { key } => {
                self.send_packet(&Packet::create_run(&key)).await?;
            }
            SessionCommand::SendCustom { packet } => {
                self.send_packet(&packet).await?;
            }
            SessionCommand::RequestPair => self.send_pair_request().await?,
            SessionCommand::RequestUnpair => self.send_unpair().await?,
            SessionCommand::PairTimeout => {
                if self.status() == PairingStatus::Requested {
                    info!("Pairing request timed out");
                    self.send_unpair().await?;
                }
            }
            SessionCommand::Close => return Ok(Flow::Stop),
        }
        Ok(Flow::Continue)
    }

    async fn handle_pairing(&mut self, packet: &Packet) -> Result<()> {
        let pair = packet
            .get_body_field::<bool>("pair")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing pair field".to_string()))?;

        self.cancel_pair_timer();

        if pair {
            if self.status() == PairingStatus::Requested {
                info!("Pair answer");
                self.set_status(PairingStatus::Paired);

                let (name, device_type) = self.peer_name_type();
                if self.is_trusted() {
                    self.ctx
                        .database
                        .update_device(&self.identifier, &name, &device_type)?;
                } else {
                    self.ctx.database.pair_device(
                        &self.identifier,
                        &self.peer_pem,
                        &name,
                        &device_type,
                    )?;
                }
            } else {
                info!("Pair request");
                let accept = self.status() == PairingStatus::Paired || self.is_trusted();

                if accept {
                    info!("I'm already paired, but they think I'm not");
                    let (name, device_type) = self.peer_name_type();
                    self.ctx
                        .database
                        .update_device(&self.identifier, &name, &device_type)?;
                } else {
                    info!("Pairing started by the other end, rejecting their request");
                }

                self.send_packet(&Packet::create_pair(accept)).await?;
            }
        } else {
            info!("Unpair request");
            if self.status() == PairingStatus::Requested {
                info!("Canceled by other peer");
            }
            self.set_status(PairingStatus::NotPaired);
            self.ctx.database.unpair_device(&self.identifier)?;
        }

        Ok(())
    }

    /// Outgoing pair request with its expiry timer. A request already in
    /// flight keeps its original timer.
    async fn send_pair_request(&mut self) -> Result<()> {
        if self.status() == PairingStatus::Requested {
            debug!("Pair request already pending for {}", self.identifier);
            return Ok(());
        }

        self.set_status(PairingStatus::Requested);

        let tx = self.tx.clone();
        self.pair_timer = Some(tokio::spawn(async move {
            sleep(PAIRING_TIMEOUT).await;
            let _ = tx.send(SessionCommand::PairTimeout);
        }));

        self.send_packet(&Packet::create_pair(true)).await
    }

    async fn send_unpair(&mut self) -> Result<()> {
        self.cancel_pair_timer();
        self.set_status(PairingStatus::NotPaired);
        self.send_packet(&Packet::create_pair(false)).await?;
        self.ctx.database.unpair_device(&self.identifier)?;
        Ok(())
    }

    /// Notification listener registration and dismissal.
    async fn handle_notify(&mut self, packet: &Packet) -> Result<()> {
        if let Some(reference) = packet.get_body_field::<String>("cancel") {
            debug!("Dismiss notification request for {}", reference);
            self.ctx
                .database
                .dismiss_notification(&self.identifier, &reference)?;
        } else if packet.get_body_field::<bool>("request") == Some(true) {
            info!("Registered notifications listener");
            let (name, device_type) = self.peer_name_type();
            self.ctx
                .database
                .update_device(&self.identifier, &name, &device_type)?;

            let mut pending = Vec::new();
            for notification in self.ctx.database.list_notifications(&self.identifier)? {
                if notification.cancel {
                    // Tombstones fire exactly once, then disappear.
                    self.send_packet(&Packet::create_cancel(&notification.reference))
                        .await?;
                    self.ctx
                        .database
                        .dismiss_notification(&self.identifier, &notification.reference)?;
                } else {
                    pending.push(notification);
                }
            }

            // Replay the backlog staggered at 100 ms intervals, in order.
            if !pending.is_empty() {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    for notification in pending {
                        sleep(REPLAY_STAGGER).await;
                        let sent = tx.send(SessionCommand::SendNotification {
                            text: notification.text,
                            title: notification.title,
                            application: notification.application,
                            reference: notification.reference,
                            payload: None,
                        });
                        if sent.is_err() {
                            break;
                        }
                    }
                });
            }
        } else {
            debug!("Ignoring unknown request");
        }

        Ok(())
    }

    /// Cache the command catalog the peer advertises. The list travels as
    /// a JSON-encoded string; garbage resets the cache.
    fn handle_command_catalog(&mut self, packet: &Packet) {
        let Some(encoded) = packet.get_body_field::<String>("commandList") else {
            return;
        };
        let commands = serde_json::from_str::<HashMap<String, Value>>(&encoded).unwrap_or_default();
        self.shared.lock().unwrap().commands = commands;
    }

    async fn handle_command_request(&mut self, packet: &Packet) -> Result<()> {
        if packet.get_body_field::<bool>("requestCommandList") == Some(true) {
            let mut catalog = HashMap::new();
            for row in self.ctx.database.list_commands(&self.identifier)? {
                catalog.insert(
                    row.key,
                    serde_json::json!({ "name": row.name, "command": row.command }),
                );
            }
            self.send_packet(&Packet::create_commands(&catalog)?).await?;
        } else if let Some(key) = packet.get_body_field::<String>("key") {
            match self.ctx.database.get_command(&self.identifier, &key)? {
                None => warn!("{} is not a configured command", key),
                Some(command) => {
                    info!("Running: {}", command);
                    // Fire and forget; output is not captured.
                    if let Err(e) = tokio::process::Command::new("sh")
                        .arg("-c")
                        .arg(&command)
                        .spawn()
                    {
                        warn!("Failed to spawn command: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Incoming file offer. Requires a configured destination path; the
    /// actual transfer runs detached and is size-checked on completion.
    fn handle_share(&mut self, packet: &Packet) -> Result<()> {
        let Some(filename) = packet.get_body_field::<String>("filename") else {
            debug!("Share request without filename, ignoring");
            return Ok(());
        };
        let Some(size) = packet.payload_size else {
            debug!("Share request without payloadSize, ignoring");
            return Ok(());
        };
        let Some(port) = packet
            .payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(|port| port.as_u64())
            .map(|port| port as u16)
        else {
            debug!("Share request without transfer port, ignoring");
            return Ok(());
        };

        let Some(path) = self.ctx.database.get_path(&self.identifier)? else {
            warn!(
                "No download path configured for {}, rejecting share",
                self.shared_name()
            );
            return Ok(());
        };

        // Strip any directory components the peer may have smuggled in.
        let filename = Path::new(&filename)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let transfers = self.ctx.transfers.clone();
        let address = self.address.ip();
        tokio::spawn(async move {
            match transfers
                .receive_file(address, port, size as u64, Path::new(&path), &filename)
                .await
            {
                Ok(stored) => info!("Share stored at {:?}", stored),
                Err(e) => warn!("Share transfer failed: {}", e),
            }
        });

        Ok(())
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        debug!(
            "SendTCP({}) - {} {}",
            self.address, packet.packet_type, packet.body
        );
        let bytes = packet.to_bytes()?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn cancel_pair_timer(&mut self) {
        if let Some(timer) = self.pair_timer.take() {
            timer.abort();
        }
    }

    fn is_trusted(&self) -> bool {
        self.ctx.database.is_trusted(&self.identifier)
    }

    fn status(&self) -> PairingStatus {
        self.shared.lock().unwrap().status
    }

    fn set_status(&self, status: PairingStatus) {
        self.shared.lock().unwrap().status = status;
    }

    fn shared_name(&self) -> String {
        self.shared.lock().unwrap().name.clone()
    }

    fn peer_name_type(&self) -> (String, String) {
        let shared = self.shared.lock().unwrap();
        (shared.name.clone(), shared.device_type.as_str().to_string())
    }
}
