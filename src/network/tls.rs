use rustls::pki_types::{CertificateDer, ServerName};
use std::io;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Invalid certificate")]
    InvalidCertificate,
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Client-side TLS configuration for ElectrumX connections.
///
/// Public servers are verified against the webpki roots, optionally with an
/// extra CA from a PEM file. Many community servers use self-signed
/// certificates, so verification can be switched off per config.
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
    verifying: bool,
}

impl TlsConfig {
    /// Verify against the bundled webpki root store
    pub fn with_webpki_roots() -> Result<Self, TlsError> {
        Self::build(Self::webpki_store())
    }

    /// Verify against the webpki roots plus every certificate in `ca_path`
    pub fn with_ca_file(ca_path: &Path) -> Result<Self, TlsError> {
        let mut roots = Self::webpki_store();
        let mut reader = io::BufReader::new(std::fs::File::open(ca_path)?);
        let certs: Vec<CertificateDer> =
            rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(TlsError::InvalidCertificate);
        }
        for cert in certs {
            roots.add(cert).map_err(TlsError::Tls)?;
        }
        Self::build(roots)
    }

    /// Accept any server certificate (self-signed servers)
    pub fn accept_any() -> Self {
        let mut client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertVerifier))
            .with_no_client_auth();

        // Enable session resumption for faster reconnects
        client_config.resumption = rustls::client::Resumption::default();

        Self {
            client_config: Arc::new(client_config),
            verifying: false,
        }
    }

    /// Pick a configuration from the `[server]` settings
    pub fn from_settings(verify: bool, ca_file: Option<&Path>) -> Result<Self, TlsError> {
        match (verify, ca_file) {
            (false, _) => Ok(Self::accept_any()),
            (true, Some(path)) => Self::with_ca_file(path),
            (true, None) => Self::with_webpki_roots(),
        }
    }

    pub fn is_verifying(&self) -> bool {
        self.verifying
    }

    fn webpki_store() -> rustls::RootCertStore {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        roots
    }

    fn build(roots: rustls::RootCertStore) -> Result<Self, TlsError> {
        let mut client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        client_config.resumption = rustls::client::Resumption::default();

        Ok(Self {
            client_config: Arc::new(client_config),
            verifying: true,
        })
    }

    /// Create a TLS connector for outbound connections
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    /// Wrap a TCP stream with TLS as a client
    pub async fn connect_client(
        &self,
        stream: TcpStream,
        domain: &str,
    ) -> Result<TlsStream<TcpStream>, TlsError> {
        let domain = ServerName::try_from(domain)
            .map_err(|_| TlsError::InvalidServerName(domain.to_string()))?
            .to_owned();

        Ok(self.connector().connect(domain, stream).await?)
    }
}

/// Certificate verifier that accepts anything. Only used when the operator
/// turns verification off for a self-signed server.
#[derive(Debug)]
struct AcceptAnyCertVerifier;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
