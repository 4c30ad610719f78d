//! TLS negotiation for the relay listener
//!
//! Backends and ordinary clients share one listening port. A connection whose
//! ClientHello offers the `bastion/0` ALPN protocol is a backend dialing in: it
//! gets a dedicated TLS 1.3-only configuration that requires a self-signed
//! Ed25519 client certificate whose key hash is allowed. Every other connection
//! is handed the server's regular configuration, untouched.

use crate::identity::{CertificateError, Identity};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{DigitallySignedStruct, DistinguishedName, OtherError, ServerConfig, SignatureScheme};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

/// ALPN protocol offered by backends registering with the relay
pub const RELAY_ALPN: &[u8] = b"bastion/0";

/// Decides which backends may register.
///
/// Called during the TLS handshake, possibly from many connections at once.
/// Must not block for long.
pub trait BackendAuthorizer: Send + Sync + 'static {
    fn is_allowed(&self, identity: &Identity) -> bool;
}

impl<F> BackendAuthorizer for F
where
    F: Fn(&Identity) -> bool + Send + Sync + 'static,
{
    fn is_allowed(&self, identity: &Identity) -> bool {
        self(identity)
    }
}

/// Fixed set of allowed backend identities
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    identities: HashSet<Identity>,
}

impl AllowList {
    pub fn new(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            identities: identities.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl BackendAuthorizer for AllowList {
    fn is_allowed(&self, identity: &Identity) -> bool {
        self.identities.contains(identity)
    }
}

/// Per-connection configuration selector for non-backend connections.
///
/// Returning `None` falls back to the overlay's base configuration.
pub trait SelectConfig: Send + Sync + 'static {
    fn select(&self, client_hello: &ClientHello<'_>) -> Option<Arc<ServerConfig>>;
}

/// Serves one certificate to every connection
#[derive(Debug)]
pub struct StaticCertResolver {
    certified_key: Arc<CertifiedKey>,
}

impl StaticCertResolver {
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, rustls::Error> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }
}

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.certified_key))
    }
}

/// Verifies backend client certificates
pub struct BackendCertVerifier {
    authorizer: Arc<dyn BackendAuthorizer>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl BackendCertVerifier {
    pub fn new(authorizer: Arc<dyn BackendAuthorizer>, algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self {
            authorizer,
            algorithms,
        }
    }
}

impl std::fmt::Debug for BackendCertVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCertVerifier")
            .field("authorizer", &"<dyn BackendAuthorizer>")
            .finish()
    }
}

fn reject(error: CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::Other(OtherError(Arc::new(error))))
}

impl ClientCertVerifier for BackendCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if !intermediates.is_empty() {
            warn!(chain_len = intermediates.len() + 1, "Backend presented a certificate chain");
            return Err(reject(CertificateError::NotSelfSigned));
        }

        let identity = Identity::from_certificate(end_entity).map_err(|e| {
            warn!(error = %e, "Rejected backend certificate");
            reject(e)
        })?;

        if !self.authorizer.is_allowed(&identity) {
            warn!(backend = %identity, "Unrecognized backend");
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        debug!(backend = %identity, "Backend certificate accepted");
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
        vec![SignatureScheme::ED25519]
    }
}

/// Certificate chain and private key read from a pair of PEM files
pub fn load_pem(cert_path: &str, key_path: &str) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let open = |path: &str| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", path, e))
    };

    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", cert_path, e))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", cert_path);
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", key_path, e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", key_path))?;

    Ok((certs, key))
}

/// Fresh self-signed certificate for `names`
pub fn self_signed_cert(names: &[&str]) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;
    Ok((vec![CertificateDer::from(cert.der().to_vec())], key))
}

/// Crypto provider used for every TLS configuration the relay builds
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Configuration for ordinary clients: no client auth, `alpn` advertised
pub fn client_server_config(
    cert_resolver: Arc<dyn ResolvesServerCert>,
    alpn: &[&[u8]],
) -> Result<ServerConfig, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(cert_resolver);
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Build the configuration used for backend connections
pub fn backend_server_config(
    cert_resolver: Arc<dyn ResolvesServerCert>,
    authorizer: Arc<dyn BackendAuthorizer>,
) -> Result<ServerConfig, rustls::Error> {
    let provider = crypto_provider();
    let verifier = Arc::new(BackendCertVerifier::new(
        authorizer,
        provider.signature_verification_algorithms,
    ));

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(cert_resolver);
    config.alpn_protocols = vec![RELAY_ALPN.to_vec()];

    Ok(config)
}

/// Whether the ClientHello offers the relay protocol
pub fn offers_relay_protocol(client_hello: &ClientHello<'_>) -> bool {
    client_hello
        .alpn()
        .map(|mut alpn| alpn.any(|p| p == RELAY_ALPN))
        .unwrap_or(false)
}

/// Outcome of accepting a TLS connection
pub enum Negotiated<IO> {
    /// A backend negotiated the relay protocol and passed verification
    Backend {
        stream: TlsStream<IO>,
        identity: Identity,
    },
    /// Any other client
    Client(TlsStream<IO>),
}

/// Wraps the server's TLS configuration to intercept backend connections
pub struct TlsOverlay {
    base: Arc<ServerConfig>,
    fallback: Option<Arc<dyn SelectConfig>>,
    backend: Arc<ServerConfig>,
}

impl TlsOverlay {
    /// `base` serves ordinary clients; backends get a configuration built from
    /// `backend_certs` and `authorizer`.
    pub fn new(
        base: Arc<ServerConfig>,
        backend_certs: Arc<dyn ResolvesServerCert>,
        authorizer: Arc<dyn BackendAuthorizer>,
    ) -> Result<Self, rustls::Error> {
        Ok(Self {
            base,
            fallback: None,
            backend: Arc::new(backend_server_config(backend_certs, authorizer)?),
        })
    }

    /// Chain an existing per-connection selector for non-backend connections
    pub fn with_fallback(mut self, selector: Arc<dyn SelectConfig>) -> Self {
        self.fallback = Some(selector);
        self
    }

    /// Configuration for a connection, given its ClientHello
    pub fn select(&self, client_hello: &ClientHello<'_>) -> Arc<ServerConfig> {
        if offers_relay_protocol(client_hello) {
            return Arc::clone(&self.backend);
        }
        self.fallback
            .as_ref()
            .and_then(|selector| selector.select(client_hello))
            .unwrap_or_else(|| Arc::clone(&self.base))
    }

    /// Run the TLS handshake and classify the connection by negotiated protocol
    pub async fn accept<IO>(&self, io: IO) -> io::Result<Negotiated<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(Acceptor::default(), io).await?;
        let config = self.select(&start.client_hello());
        let stream = start.into_stream(config).await?;

        let (_, connection) = stream.get_ref();
        if connection.alpn_protocol() != Some(RELAY_ALPN) {
            return Ok(Negotiated::Client(stream));
        }

        let identity = connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "backend presented no certificate"))
            .and_then(|cert| {
                Identity::from_certificate(cert)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            })?;

        Ok(Negotiated::Backend { stream, identity })
    }
}

impl std::fmt::Debug for TlsOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOverlay")
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
