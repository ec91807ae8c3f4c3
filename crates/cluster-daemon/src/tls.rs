//! TLS for the public listener and for requests to other daemons.
//!
//! Daemons identify each other by self-signed certificates whose
//! fingerprints are exchanged during pairing, so there is no CA to chain
//! to. The public listener asks every client for a certificate without
//! requiring one: join intents and identity lookups happen before any trust
//! exists and are authenticated by the passphrase HMAC instead. Handlers
//! that need an authenticated peer read the connection's
//! [`PeerCertificate`] and look its fingerprint up in the session trust
//! store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use axum::{Extension, Router};
use cluster_core::certificate::Certificate;
use cluster_core::context::Context;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub const CERTIFICATE_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";

/// Time a client gets to complete the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Certificate and key this daemon presents on both ends of a connection.
pub struct TlsIdentity {
    certificate_pem: String,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    fingerprint: String,
    provider: Arc<CryptoProvider>,
}

impl TlsIdentity {
    /// Read `server.crt` and `server.key` from `config_dir`, generating a
    /// self-signed pair for `name` on first start.
    pub fn load_or_generate(config_dir: &Path, name: &str) -> Result<Self> {
        let cert_file = config_dir.join(CERTIFICATE_FILE);
        let key_file = config_dir.join(KEY_FILE);

        if !cert_file.exists() {
            generate(config_dir, name)?;
        }

        let cert_pem = std::fs::read_to_string(&cert_file)
            .with_context(|| format!("Failed to read certificate: {:?}", cert_file))?;
        let key_pem = std::fs::read_to_string(&key_file)
            .with_context(|| format!("Failed to read private key: {:?}", key_file))?;

        Self::from_pem(cert_pem, &key_pem)
    }

    pub fn from_pem(certificate_pem: String, key_pem: &str) -> Result<Self> {
        let certs = CertificateDer::pem_slice_iter(certificate_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate")?;
        let Some(leaf) = certs.first() else {
            bail!("No certificate found");
        };
        let fingerprint = Certificate::from_der(leaf.clone())
            .context("Invalid identity certificate")?
            .fingerprint();

        let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
            .context("Failed to parse private key")?;

        Ok(Self {
            certificate_pem,
            certs,
            key,
            fingerprint,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// PEM of the certificate, as sent in join intents.
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Server side of the public listener.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let verifier = AnyCertificate::new(&self.provider);
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .context("Unsupported TLS protocol versions")?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .context("Failed to build TLS server config")?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Client side for requests to other daemons, presenting our certificate.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let verifier = AnyCertificate::new(&self.provider);
        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .context("Unsupported TLS protocol versions")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .context("Failed to build TLS client config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// HTTP client for other daemons' public listeners.
    pub fn http_client(&self, timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .use_preconfigured_tls(self.client_config()?)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }
}

fn generate(config_dir: &Path, name: &str) -> Result<()> {
    let key_pair = rcgen::KeyPair::generate().context("Failed to generate key pair")?;
    let params = rcgen::CertificateParams::new(vec![name.to_string()])
        .with_context(|| format!("Invalid certificate name: {name:?}"))?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to self-sign certificate")?;

    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;
    write_private(&config_dir.join(KEY_FILE), &key_pair.serialize_pem())?;

    let cert_file = config_dir.join(CERTIFICATE_FILE);
    std::fs::write(&cert_file, cert.pem())
        .with_context(|| format!("Failed to write certificate: {:?}", cert_file))?;
    info!("Generated certificate at {:?}", cert_file);
    Ok(())
}

fn write_private(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions of {:?}", path))?;
    }

    Ok(())
}

/// Accepts any well-formed X.509 certificate whose key signed the handshake.
///
/// Whether the certificate is trusted is decided per request against the
/// session trust store, not during the handshake.
#[derive(Debug)]
struct AnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyCertificate {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }

    fn check(end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        Certificate::from_der(end_entity.clone().into_owned())
            .map(|_| ())
            .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))
    }
}

impl ClientCertVerifier for AnyCertificate {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Self::check(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

// Peers are reached by address before their certificate is known. What they
// are sent is either HMAC protected or only useful to a member the local
// operator confirmed.
impl ServerCertVerifier for AnyCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Self::check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Certificate the client presented on the current connection.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificate(pub Option<Certificate>);

impl PeerCertificate {
    pub fn fingerprint(&self) -> Option<String> {
        self.0.as_ref().map(Certificate::fingerprint)
    }
}

/// Serve `router` over TLS until `ctx` is cancelled.
///
/// Each connection sees its client certificate as an
/// `Extension<PeerCertificate>`. Open connections are shut down gracefully
/// on cancellation.
pub async fn serve(listener: TcpListener, acceptor: TlsAcceptor, router: Router, ctx: Context) {
    loop {
        let (stream, remote) = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    debug!(%remote, "TLS handshake failed: {}", e);
                    return;
                }
                Err(_) => {
                    debug!(%remote, "TLS handshake timed out");
                    return;
                }
            };

            let peer = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .and_then(|cert| Certificate::from_der(cert.clone()).ok());
            debug!(%remote, fingerprint = ?peer.as_ref().map(Certificate::fingerprint), "TLS connection");

            let service = TowerToHyperService::new(router.layer(Extension(PeerCertificate(peer))));
            let builder = Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(TokioIo::new(tls), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = ctx.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                debug!(%remote, "Connection ended with error: {}", e);
            }
        });
    }
}
