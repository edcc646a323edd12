//! Payload side-channel.
//!
//! Outgoing payloads (notification icons, shared files) are served from a
//! transient TLS listener on a dynamically reserved port; the peer dials
//! in, receives the bytes and the listener goes away. Incoming payloads
//! are the mirror image: we dial the port named in the share packet and
//! stream to a temporary file, accepting it only when the byte count
//! matches the advertised size.

use crate::{ProtocolError, Result};
use openssl::ssl::{Ssl, SslAcceptor, SslConnector};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transfer ports live strictly inside the protocol port range.
const TRANSFER_PORT_MIN: u16 = 1717;
const TRANSFER_PORT_MAX: u16 = 1763;

/// Streaming chunk size for outgoing files.
const CHUNK_SIZE: usize = 16 * 1024;

/// How long a listener lingers after the served file is fully written.
const LINGER: Duration = Duration::from_secs(1);

/// How long a listener waits for the peer to dial in.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Collision suffix ceiling for `name (N).ext`.
const MAX_COLLISIONS: u32 = 9999;

pub struct TransferManager {
    acceptor: Arc<SslAcceptor>,
    connector: Arc<SslConnector>,
    /// Allocation scans downward from here.
    top_port: u16,
    /// Cap on simultaneously open send listeners.
    max_ports: usize,
    active: Arc<AtomicUsize>,
}

impl TransferManager {
    pub fn new(
        acceptor: Arc<SslAcceptor>,
        connector: Arc<SslConnector>,
        top_port: u16,
        max_ports: usize,
    ) -> Self {
        let top_port = top_port.clamp(TRANSFER_PORT_MIN, TRANSFER_PORT_MAX);
        Self {
            acceptor,
            connector,
            top_port,
            max_ports,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a port and serve `path` to exactly one TLS client. Returns
    /// the chosen port immediately; the transfer itself runs detached.
    pub async fn serve_file(&self, path: PathBuf) -> Result<u16> {
        if self.active.load(Ordering::SeqCst) >= self.max_ports {
            return Err(ProtocolError::PortsExhausted);
        }

        let (listener, port) = self.reserve_port().await?;
        let acceptor = self.acceptor.clone();
        let active = self.active.clone();

        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = serve_one(listener, acceptor, &path).await {
                warn!("Payload transfer on port {} failed: {}", port, e);
            }
            active.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(port)
    }

    async fn reserve_port(&self) -> Result<(TcpListener, u16)> {
        for port in (TRANSFER_PORT_MIN..=self.top_port).rev() {
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                debug!("Reserved transfer port {}", port);
                return Ok((listener, port));
            }
        }
        Err(ProtocolError::PortsExhausted)
    }

    /// Dial a peer's payload port and store the stream as `filename`
    /// inside `dest_dir`. Only a byte-complete transfer survives.
    pub async fn receive_file(
        &self,
        address: IpAddr,
        port: u16,
        size: u64,
        dest_dir: &Path,
        filename: &str,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let tcp = TcpStream::connect((address, port)).await?;
        let ssl = Ssl::new(self.connector.context())?;
        let mut stream = SslStream::new(ssl, tcp).map_err(ProtocolError::Tls)?;
        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

        debug!("Receiving {} bytes from {}:{}", size, address, port);

        let temp_path = dest_dir.join(format!(".{}.{}.part", filename, Uuid::new_v4().simple()));
        let mut temp = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;

        let mut received: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];

        let outcome = loop {
            match stream.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    received += n as u64;
                    if let Err(e) = temp.write_all(&buf[..n]).await {
                        break Err(ProtocolError::Io(e));
                    }
                }
                Err(e) => break Err(ProtocolError::Io(e)),
            }
        };

        temp.flush().await?;
        drop(temp);

        if let Err(e) = outcome {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if received != size {
            warn!(
                "Truncated payload from {}:{}, expected {} got {}",
                address, port, size, received
            );
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(ProtocolError::PayloadSizeMismatch {
                expected: size,
                received,
            });
        }

        let final_path = available_path(dest_dir, filename)?;
        tokio::fs::rename(&temp_path, &final_path).await?;
        info!("Stored payload as {:?}", final_path);

        Ok(final_path)
    }
}

/// Accept one connection, stream the file, linger briefly, shut down.
async fn serve_one(listener: TcpListener, acceptor: Arc<SslAcceptor>, path: &Path) -> Result<()> {
    let (tcp, peer) = timeout(ACCEPT_TIMEOUT, listener.accept())
        .await
        .map_err(|_| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no client dialed the transfer port",
            ))
        })??;

    debug!("Transfer({}) - File({:?})", peer, path.file_name());

    let ssl = Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, tcp).map_err(ProtocolError::Tls)?;
    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;
    }

    stream.flush().await?;
    sleep(LINGER).await;
    let _ = stream.shutdown().await;

    info!("Served {} bytes to {}", sent, peer);
    Ok(())
}

/// First free destination path, suffixing `name (N).ext` on collision.
pub fn available_path(dir: &Path, filename: &str) -> Result<PathBuf> {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let (stem, extension) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    };

    for n in 1..=MAX_COLLISIONS {
        let name = match extension {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "no free destination filename",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tls, CertificateInfo};
    use tempfile::TempDir;

    fn manager() -> TransferManager {
        let identity = CertificateInfo::generate("transfer_test").unwrap();
        TransferManager::new(
            tls::create_acceptor(&identity).unwrap(),
            tls::create_connector(&identity).unwrap(),
            1763,
            3,
        )
    }

    #[test]
    fn test_available_path_no_collision() {
        let dir = TempDir::new().unwrap();
        let path = available_path(dir.path(), "file.txt").unwrap();
        assert_eq!(path, dir.path().join("file.txt"));
    }

    #[test]
    fn test_available_path_suffixes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file.txt"), b"x").unwrap();
        assert_eq!(
            available_path(dir.path(), "file.txt").unwrap(),
            dir.path().join("file (1).txt")
        );

        std::fs::write(dir.path().join("file (1).txt"), b"x").unwrap();
        assert_eq!(
            available_path(dir.path(), "file.txt").unwrap(),
            dir.path().join("file (2).txt")
        );
    }

    #[test]
    fn test_available_path_without_extension() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(
            available_path(dir.path(), "README").unwrap(),
            dir.path().join("README (1)")
        );
    }

    #[tokio::test]
    async fn test_send_receive_roundtrip() {
        let manager = manager();
        let src_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();

        let payload = vec![0xabu8; 40 * 1024];
        let src = src_dir.path().join("blob.bin");
        std::fs::write(&src, &payload).unwrap();

        let port = manager.serve_file(src).await.unwrap();

        let stored = manager
            .receive_file(
                "127.0.0.1".parse().unwrap(),
                port,
                payload.len() as u64,
                dest_dir.path(),
                "blob.bin",
            )
            .await
            .unwrap();

        assert_eq!(stored, dest_dir.path().join("blob.bin"));
        assert_eq!(std::fs::read(&stored).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_receive_collision_renames() {
        let manager = manager();
        let src_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();

        std::fs::write(dest_dir.path().join("file.txt"), b"existing").unwrap();

        let payload = vec![1u8; 1024];
        let src = src_dir.path().join("file.txt");
        std::fs::write(&src, &payload).unwrap();

        let port = manager.serve_file(src).await.unwrap();
        let stored = manager
            .receive_file(
                "127.0.0.1".parse().unwrap(),
                port,
                1024,
                dest_dir.path(),
                "file.txt",
            )
            .await
            .unwrap();

        assert_eq!(stored, dest_dir.path().join("file (1).txt"));
        assert_eq!(
            std::fs::read(dest_dir.path().join("file.txt")).unwrap(),
            b"existing"
        );
    }

    #[tokio::test]
    async fn test_short_transfer_is_discarded() {
        let manager = manager();
        let src_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();

        let src = src_dir.path().join("short.bin");
        std::fs::write(&src, vec![2u8; 100]).unwrap();

        let port = manager.serve_file(src).await.unwrap();
        let result = manager
            .receive_file(
                "127.0.0.1".parse().unwrap(),
                port,
                4096, // advertised size larger than what will arrive
                dest_dir.path(),
                "short.bin",
            )
            .await;

        assert!(matches!(
            result,
            Err(ProtocolError::PayloadSizeMismatch { .. })
        ));
        assert!(std::fs::read_dir(dest_dir.path()).unwrap().next().is_none());
    }
}
