//! TLS termination using rustls
//!
//! Certificates and the private key are loaded once from PEM files when the
//! server is built; the handshake itself runs inside each connection task.

use crate::errors::{Error, Result};
use std::{fs::File, io::BufReader, path::Path, sync::Arc};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig,
    },
    TlsAcceptor,
};

/// Builds an acceptor that speaks HTTP/1.1 only.
pub(crate) fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("failed to open cert file {}: {e}", path.display())))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certs: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls("no certificates found in file".to_string()));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("failed to open key file {}: {e}", path.display())))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("failed to parse key: {e}")))?
        .ok_or_else(|| Error::Tls("no private key found in file".to_string()))
}
