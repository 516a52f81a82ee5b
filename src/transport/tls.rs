use crate::{error::Error, Result};
use std::{path::Path, sync::Arc};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
        ClientConfig, RootCertStore, ServerConfig,
    },
    TlsAcceptor, TlsConnector,
};

// TLS configuration, all material in PEM format
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    // Server certificate chain
    pub cert: Option<Vec<u8>>,
    // Server private key
    pub key: Option<Vec<u8>>,
    // Client certificate chain, presented when the server asks for one
    pub client_cert: Option<Vec<u8>>,
    // Client private key
    pub client_key: Option<Vec<u8>>,
    // Extra CA certificates trusted by clients
    pub ca_certs: Option<Vec<u8>>,
}

impl TlsConfig {
    /// Server side configuration read from PEM files.
    pub fn from_pem_files(cert: impl AsRef<Path>, key: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            cert: Some(std::fs::read(cert)?),
            key: Some(std::fs::read(key)?),
            ..Default::default()
        })
    }

    pub fn with_ca_certs(mut self, pem: Vec<u8>) -> Self {
        self.ca_certs = Some(pem);
        self
    }

    pub fn with_client_auth(mut self, cert: Vec<u8>, key: Vec<u8>) -> Self {
        self.client_cert = Some(cert);
        self.client_key = Some(key);
        self
    }
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, std::io::Error>>()
        .map_err(|e| Error::TlsError(format!("Failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::TlsError("No certificate found".to_string()));
    }
    Ok(certs)
}

fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::TlsError(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| Error::TlsError("No valid private key found".to_string()))
}

/// Server side TLS context.
pub fn create_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = match &config.cert {
        Some(cert) => load_certs(cert)?,
        None => return Err(Error::TlsError("No certificate provided".to_string())),
    };
    let key = match &config.key {
        Some(key) => load_private_key(key)?,
        None => return Err(Error::TlsError("No private key provided".to_string())),
    };

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Client side TLS context trusting the configured CA certificates.
pub fn create_connector(config: &TlsConfig) -> Result<TlsConnector> {
    let mut root_store = RootCertStore::empty();
    if let Some(ca_certs) = &config.ca_certs {
        for cert in load_certs(ca_certs)? {
            root_store.add(cert)?;
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    let client_config = match (&config.client_cert, &config.client_key) {
        (Some(cert), Some(key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Name the server certificate is verified against.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::TlsError(format!("Invalid DNS name: {}", host)))
}
