//! Connection bring-up and pairing tests over loopback.
//!
//! The fake peer plays the role a real KDE Connect device would: it dials
//! our service port, sends a cleartext identity line and then *accepts*
//! TLS (the side that initiated TCP acts as the TLS server).

use konnect_protocol::{
    tls, CertificateInfo, Database, Packet, PeerServer, Registry, ServerContext, SessionCommand,
    TransferManager, PROTOCOL_VERSION,
};
use openssl::ssl::Ssl;
use serde_json::json;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_openssl::SslStream;

struct TestPeer {
    stream: SslStream<TcpStream>,
}

impl TestPeer {
    /// Connect, identify in cleartext and finish the TLS role-inverted
    /// handshake using a certificate whose CN is `cert_cn`.
    async fn connect(addr: SocketAddr, device_id: &str, cert_cn: &str) -> TestPeer {
        let mut tcp = TcpStream::connect(addr).await.unwrap();

        let identity = Packet::new(
            "kdeconnect.identity",
            json!({
                "deviceId": device_id,
                "deviceName": format!("peer {}", device_id),
                "deviceType": "phone",
                "protocolVersion": PROTOCOL_VERSION,
                "incomingCapabilities": ["kdeconnect.ping"],
                "outgoingCapabilities": ["kdeconnect.ping"],
            }),
        );
        tcp.write_all(&identity.to_bytes().unwrap()).await.unwrap();

        let cert = CertificateInfo::generate(cert_cn).unwrap();
        let acceptor = tls::create_acceptor(&cert).unwrap();
        let ssl = Ssl::new(acceptor.context()).unwrap();
        let mut stream = SslStream::new(ssl, tcp).unwrap();
        timeout(Duration::from_secs(5), Pin::new(&mut stream).accept())
            .await
            .expect("handshake timed out")
            .expect("handshake failed");

        TestPeer { stream }
    }

    async fn send(&mut self, packet: &Packet) {
        self.stream
            .write_all(&packet.to_bytes().unwrap())
            .await
            .unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut byte))
                .await
                .expect("read timed out")
                .expect("read failed");
            assert!(n > 0, "connection closed while expecting a packet");
            if byte[0] == b'\n' {
                return Packet::from_bytes(&line).unwrap();
            }
            line.push(byte[0]);
        }
    }

    /// Expect the server to drop the connection.
    async fn expect_close(&mut self) {
        let mut buf = [0u8; 64];
        let result = timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await;
        match result {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            Ok(Ok(n)) => panic!("expected close, got {} bytes", n),
            Err(_) => panic!("server kept the connection open"),
        }
    }
}

async fn spawn_server() -> (Arc<ServerContext>, SocketAddr) {
    let identity = CertificateInfo::generate("server_under_test").unwrap();
    let connector = tls::create_connector(&identity).unwrap();
    let acceptor = tls::create_acceptor(&identity).unwrap();

    let ctx = Arc::new(ServerContext {
        identity,
        device_name: "test server".to_string(),
        service_port: 1764,
        connector: connector.clone(),
        database: Arc::new(Database::open_in_memory().unwrap()),
        registry: Arc::new(Registry::new()),
        transfers: Arc::new(TransferManager::new(acceptor, connector, 1763, 3)),
    });

    let server = PeerServer::bind(ctx.clone(), 0).await.unwrap();
    let addr: SocketAddr = format!("127.0.0.1:{}", server.local_addr().unwrap().port())
        .parse()
        .unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    (ctx, addr)
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

/// Pair the fake peer with the server through the registry handle, the
/// same way the admin API does.
async fn pair(ctx: &Arc<ServerContext>, peer: &mut TestPeer, device_id: &str) {
    wait_until(|| ctx.registry.get(device_id).is_some()).await;
    let handle = ctx.registry.get(device_id).unwrap();
    handle.send(SessionCommand::RequestPair).unwrap();

    let request = peer.recv().await;
    assert!(request.is_type("kdeconnect.pair"));
    assert_eq!(request.get_body_field::<bool>("pair"), Some(true));

    peer.send(&Packet::create_pair(true)).await;
    let database = ctx.database.clone();
    let id = device_id.to_string();
    wait_until(move || database.is_trusted(&id)).await;
}

#[tokio::test]
async fn untrusted_packet_answered_with_unpair() {
    let (_ctx, addr) = spawn_server().await;
    let mut peer = TestPeer::connect(addr, "peer_a", "peer_a").await;

    peer.send(&Packet::create_ping(None)).await;

    let answer = peer.recv().await;
    assert!(answer.is_type("kdeconnect.pair"));
    assert_eq!(answer.get_body_field::<bool>("pair"), Some(false));
}

#[tokio::test]
async fn peer_initiated_pair_is_rejected_when_unknown() {
    let (_ctx, addr) = spawn_server().await;
    let mut peer = TestPeer::connect(addr, "peer_b", "peer_b").await;

    peer.send(&Packet::create_pair(true)).await;

    let answer = peer.recv().await;
    assert!(answer.is_type("kdeconnect.pair"));
    assert_eq!(answer.get_body_field::<bool>("pair"), Some(false));
}

#[tokio::test]
async fn pair_exchange_establishes_trust_and_ping_echoes() {
    let (ctx, addr) = spawn_server().await;
    let mut peer = TestPeer::connect(addr, "peer_c", "peer_c").await;

    pair(&ctx, &mut peer, "peer_c").await;

    // Stored certificate carries the peer identity.
    let pem = ctx.database.device_certificate("peer_c").unwrap().unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

    peer.send(&Packet::create_ping(Some("hello"))).await;
    let echo = peer.recv().await;
    assert!(echo.is_type("kdeconnect.ping"));
    assert_eq!(
        echo.get_body_field::<String>("message"),
        Some("hello".to_string())
    );
}

#[tokio::test]
async fn certificate_cn_mismatch_is_fatal() {
    let (_ctx, addr) = spawn_server().await;
    // Identity says peer_d, certificate says somebody else.
    let mut peer = TestPeer::connect(addr, "peer_d", "impostor").await;

    peer.send(&Packet::create_ping(None)).await;
    peer.expect_close().await;
}

#[tokio::test]
async fn post_tls_identity_is_answered_with_ours() {
    let (ctx, addr) = spawn_server().await;
    let mut peer = TestPeer::connect(addr, "peer_e", "peer_e").await;

    let identity = Packet::new(
        "kdeconnect.identity",
        json!({
            "deviceId": "peer_e",
            "deviceName": "peer e",
            "deviceType": "phone",
            "protocolVersion": 7,
            "incomingCapabilities": [],
            "outgoingCapabilities": [],
        }),
    );
    peer.send(&identity).await;

    let answer = peer.recv().await;
    assert!(answer.is_type("kdeconnect.identity"));
    assert_eq!(
        answer.get_body_field::<String>("deviceId"),
        Some(ctx.identifier().to_string())
    );
    assert_eq!(answer.get_body_field::<u16>("tcpPort"), Some(1764));
    // Our answer adopts the version the peer announced.
    assert_eq!(answer.get_body_field::<i64>("protocolVersion"), Some(7));
}

#[tokio::test]
async fn notification_replay_and_tombstone() {
    let (ctx, addr) = spawn_server().await;
    let mut peer = TestPeer::connect(addr, "peer_f", "peer_f").await;

    pair(&ctx, &mut peer, "peer_f").await;

    ctx.database
        .persist_notification("peer_f", "text", "title", "app", "r1")
        .unwrap();
    ctx.database
        .persist_notification("peer_f", "text2", "title2", "app", "r2")
        .unwrap();
    ctx.database.cancel_notification("peer_f", "r2").unwrap();

    peer.send(&Packet::new(
        "kdeconnect.notification.request",
        json!({ "request": true }),
    ))
    .await;

    // Tombstones first and exactly once, then the staggered backlog.
    let cancel = peer.recv().await;
    assert!(cancel.is_type("kdeconnect.notification"));
    assert_eq!(cancel.get_body_field::<bool>("isCancel"), Some(true));
    assert_eq!(
        cancel.get_body_field::<String>("id"),
        Some("r2".to_string())
    );

    let replayed = peer.recv().await;
    assert!(replayed.is_type("kdeconnect.notification"));
    assert_eq!(
        replayed.get_body_field::<String>("id"),
        Some("r1".to_string())
    );
    assert_eq!(
        replayed.get_body_field::<String>("appName"),
        Some("app".to_string())
    );

    // The tombstone row is gone, the pending row stays queued.
    let rows = ctx.database.list_notifications("peer_f").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].reference, "r1");
}

#[tokio::test]
async fn command_catalog_is_served_on_request() {
    let (ctx, addr) = spawn_server().await;
    let mut peer = TestPeer::connect(addr, "peer_g", "peer_g").await;

    pair(&ctx, &mut peer, "peer_g").await;

    ctx.database
        .add_command("peer_g", "key1", "list", "ls -l")
        .unwrap();

    peer.send(&Packet::new(
        "kdeconnect.runcommand.request",
        json!({ "requestCommandList": true }),
    ))
    .await;

    let catalog = peer.recv().await;
    assert!(catalog.is_type("kdeconnect.runcommand"));

    let encoded = catalog.get_body_field::<String>("commandList").unwrap();
    let commands: serde_json::Value = serde_json::from_str(&encoded).unwrap();
    assert_eq!(commands["key1"]["command"], "ls -l");
}

#[tokio::test]
async fn oversized_identity_line_aborts_connection() {
    let (ctx, addr) = spawn_server().await;

    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(&vec![b'x'; 8193]).await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), tcp.read(&mut buf))
        .await
        .expect("server did not close the connection")
        .unwrap_or(0);
    assert_eq!(n, 0);

    // Aborted before any state change.
    assert!(ctx.registry.snapshot().is_empty());
}

#[tokio::test]
async fn peer_unpair_clears_trust() {
    let (ctx, addr) = spawn_server().await;
    let mut peer = TestPeer::connect(addr, "peer_h", "peer_h").await;

    pair(&ctx, &mut peer, "peer_h").await;
    assert!(ctx.database.is_trusted("peer_h"));

    peer.send(&Packet::create_pair(false)).await;

    let database = ctx.database.clone();
    wait_until(move || !database.is_trusted("peer_h")).await;
}
