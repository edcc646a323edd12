//! TLS configuration.
//!
//! Sessions upgrade an already-accepted TCP socket with the *client* role
//! (the KDE Connect inversion: whoever accepted the TCP connection starts
//! client-side encryption). Payload listeners are ordinary TLS servers and
//! payload receives are ordinary TLS clients. Certificates are never
//! chain-verified; trust is pinned at pairing time by the stored PEM.

use crate::{CertificateInfo, Result};
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use std::sync::Arc;
use tracing::debug;

/// Connector used both for the in-place session upgrade and for dialing
/// payload ports. Presents our certificate, verifies nothing.
pub fn create_connector(identity: &CertificateInfo) -> Result<Arc<SslConnector>> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;

    builder.set_verify(SslVerifyMode::NONE);
    builder.set_certificate(&identity.certificate)?;
    builder.set_private_key(&identity.private_key)?;

    debug!("TLS connector configured for {}", identity.device_id);
    Ok(Arc::new(builder.build()))
}

/// Acceptor for payload transfer listeners, serving the same identity
/// certificate as the session layer.
pub fn create_acceptor(identity: &CertificateInfo) -> Result<Arc<SslAcceptor>> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    builder.set_verify(SslVerifyMode::NONE);
    builder.set_certificate(&identity.certificate)?;
    builder.set_private_key(&identity.private_key)?;

    debug!("TLS acceptor configured for {}", identity.device_id);
    Ok(Arc::new(builder.build()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configs_build() {
        let identity = CertificateInfo::generate("tls_test").unwrap();
        assert!(create_connector(&identity).is_ok());
        assert!(create_acceptor(&identity).is_ok());
    }
}
