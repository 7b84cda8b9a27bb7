use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::{
    io::{AsyncRead, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::config::AppConfig;

pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Source of the raw upstream byte stream. The production implementation
/// opens a socket to the camera; tests substitute canned multipart bytes.
#[async_trait]
pub trait UpstreamBackend: Send + Sync {
    async fn open(&self) -> Result<ByteSource>;
}

/// Long-lived MJPEG camera endpoint reached over plain TCP or TLS.
///
/// Host, path, and credentials come from the validated configuration and
/// are never logged or echoed downstream.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    host: String,
    port: u16,
    path: String,
    use_tls: bool,
    accept_invalid_certs: bool,
    auth: Option<String>,
}

impl HttpUpstream {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            host: config.upstream_host.clone(),
            port: config.upstream_port,
            path: config.upstream_path.clone(),
            use_tls: config.upstream_tls,
            accept_invalid_certs: config.upstream_accept_invalid_certs,
            auth: config.upstream_auth.clone(),
        }
    }
}

#[async_trait]
impl UpstreamBackend for HttpUpstream {
    async fn open(&self) -> Result<ByteSource> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .context("failed to connect to upstream camera")?;
        let request = build_request(&self.path, &self.host, self.auth.as_deref());

        if self.use_tls {
            let connector = TlsConnector::from(Arc::new(tls_config(self.accept_invalid_certs)));
            let server_name = ServerName::try_from(self.host.clone())
                .context("upstream host is not a valid TLS server name")?;
            let mut tls = connector
                .connect(server_name, stream)
                .await
                .context("TLS handshake with upstream camera failed")?;
            tls.write_all(request.as_bytes())
                .await
                .context("failed to send request to upstream camera")?;
            Ok(Box::new(tls))
        } else {
            let mut plain = stream;
            plain
                .write_all(request.as_bytes())
                .await
                .context("failed to send request to upstream camera")?;
            Ok(Box::new(plain))
        }
    }
}

fn build_request(path: &str, host: &str, auth: Option<&str>) -> String {
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n");
    if let Some(credentials) = auth {
        let encoded = STANDARD.encode(credentials);
        request.push_str(&format!("Authorization: Basic {encoded}\r\n"));
    }
    request.push_str("\r\n");
    request
}

fn tls_config(accept_invalid_certs: bool) -> ClientConfig {
    if accept_invalid_certs {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Certificate verifier that accepts any certificate.
///
/// Cameras on private networks frequently ship self-signed certificates;
/// this verifier is only installed when `UPSTREAM_ACCEPT_INVALID_CERTS`
/// is set explicitly.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}
