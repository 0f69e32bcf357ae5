//! Certificate Holder: a single-cell container for the current TLS keypair.
//!
//! Read by every TLS handshake, written only by the rotation task the
//! supervisor drives every 24h. Grounded on the teacher's `server_tls.rs`
//! loading path (rustls + rustls-pemfile), generalized from "load once from
//! a file at startup" to "install a freshly parsed keypair on every rotation".

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::{
    crypto::ring::sign::any_supported_type,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("no PEM certificate found")]
    NoCertificate,
    #[error("no PEM private key found")]
    NoPrivateKey,
    #[error("invalid PEM certificate: {0}")]
    InvalidCertificate(std::io::Error),
    #[error("invalid PEM private key: {0}")]
    InvalidPrivateKey(std::io::Error),
    #[error("unsupported or malformed private key: {0}")]
    UnsupportedKey(#[from] rustls::Error),
}

/// Parses a PEM certificate chain and a PEM private key into a signable keypair.
pub fn parse_keypair(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, CertError> {
    let mut cert_rd = cert_pem.as_bytes();
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_rd)
        .collect::<Result<_, _>>()
        .map_err(CertError::InvalidCertificate)?;
    if certs.is_empty() {
        return Err(CertError::NoCertificate);
    }

    let mut key_rd = key_pem.as_bytes();
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_rd)
        .map_err(CertError::InvalidPrivateKey)?
        .ok_or(CertError::NoPrivateKey)?;

    let signing_key = any_supported_type(&key)?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Thread-safe holder for the node's current TLS keypair.
///
/// `Get` (via `ResolvesServerCert`) must be lock-cheap since it runs on every
/// handshake; `Update` takes exclusive access only for the instant of the
/// pointer swap. Rotation never resets or terminates existing connections —
/// handshakes already past `ClientHello` keep whichever keypair they already
/// captured.
pub struct CertificateHolder {
    current: ArcSwapOption<CertifiedKey>,
}

impl CertificateHolder {
    pub fn empty() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    /// Replaces the held keypair.
    pub fn update(&self, key: CertifiedKey) {
        self.current.store(Some(Arc::new(key)));
    }

    /// Returns the currently held keypair, if any has been installed yet.
    pub fn get(&self) -> Option<Arc<CertifiedKey>> {
        self.current.load_full()
    }
}

impl std::fmt::Debug for CertificateHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateHolder")
            .field("installed", &self.current.load().is_some())
            .finish()
    }
}

impl ResolvesServerCert for CertificateHolder {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_holder_resolves_to_none() {
        let holder = CertificateHolder::empty();
        assert!(holder.get().is_none());
    }
}
