// Copyright 2025 Sandflow (https://github.com/sandflow)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Mutual-TLS acceptor for the ingest listener.
//!
//! Client certificates are required: a producer that cannot present a
//! certificate chaining to the configured CA is rejected during the TLS
//! handshake, before any frame is consumed.

use sandflow_core::{Result, SandflowError, TlsConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| {
        SandflowError::Config(format!("cannot open {}: {}", path.display(), e))
    })?);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SandflowError::Config(format!("bad certificate in {}: {}", path.display(), e)))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| {
        SandflowError::Config(format!("cannot open {}: {}", path.display(), e))
    })?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| SandflowError::Config(format!("bad key in {}: {}", path.display(), e)))?
        .ok_or_else(|| SandflowError::Config(format!("no private key in {}", path.display())))
}

/// Build the acceptor from configured cert/key/CA paths. Returns None
/// when TLS is disabled.
pub fn build_acceptor(tls: &TlsConfig) -> Result<Option<TlsAcceptor>> {
    if !tls.enabled {
        return Ok(None);
    }

    let cert_path = tls
        .cert_path
        .as_ref()
        .ok_or_else(|| SandflowError::Config("tls.cert_path required".into()))?;
    let key_path = tls
        .key_path
        .as_ref()
        .ok_or_else(|| SandflowError::Config("tls.key_path required".into()))?;
    let ca_path = tls
        .ca_path
        .as_ref()
        .ok_or_else(|| SandflowError::Config("tls.ca_path required".into()))?;

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(ca_path)? {
        roots
            .add(ca)
            .map_err(|e| SandflowError::Config(format!("bad CA certificate: {}", e)))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| SandflowError::Config(format!("client verifier: {}", e)))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| SandflowError::Config(format!("tls configuration: {}", e)))?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tls_builds_nothing() {
        let acceptor = build_acceptor(&TlsConfig::default()).unwrap();
        assert!(acceptor.is_none());
    }

    #[test]
    fn test_enabled_without_paths_is_config_error() {
        let tls = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            build_acceptor(&tls),
            Err(SandflowError::Config(_))
        ));
    }

    #[test]
    fn test_missing_files_are_config_errors() {
        let tls = TlsConfig {
            enabled: true,
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            ca_path: Some("/nonexistent/ca.pem".into()),
        };
        assert!(matches!(
            build_acceptor(&tls),
            Err(SandflowError::Config(_))
        ));
    }
}
