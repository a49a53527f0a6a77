//! TLS support for broker connections
//!
//! Builds a rustls client configuration from [`TlsOptions`] and performs the
//! handshake on a freshly dialed TCP stream. Framing above the TLS layer is
//! identical to plaintext connections.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::ClientConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::config::TlsOptions;
use crate::error::KafkalinkClientError;
use crate::profile::BrokerKey;

/// Client-side TLS connector shared by every channel of a client
#[derive(Clone)]
pub struct BrokerTlsConnector {
    inner: tokio_rustls::TlsConnector,
    server_name: Option<String>,
}

impl BrokerTlsConnector {
    /// Create a connector from configuration
    pub fn new(options: &TlsOptions) -> Result<Self, KafkalinkClientError> {
        let config = build_client_config(options)?;
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            server_name: options.server_name.clone(),
        })
    }

    /// Run the TLS handshake with `host` over an established TCP stream.
    /// Failures are reported against `broker`.
    pub async fn connect(
        &self,
        broker: &BrokerKey,
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, KafkalinkClientError> {
        let name = self.server_name.as_deref().unwrap_or(host);
        let server_name: ServerName<'static> = name.to_string().try_into().map_err(|_| {
            KafkalinkClientError::tls(format!("invalid server name for SNI: {}", name))
        })?;

        match self.inner.connect(server_name, stream).await {
            Ok(tls_stream) => {
                debug!("TLS handshake with {} ({}) completed", broker, name);
                Ok(tls_stream)
            }
            Err(e) => {
                warn!("TLS handshake with {} ({}) failed: {}", broker, name, e);
                Err(KafkalinkClientError::connection(
                    broker.as_str(),
                    format!("TLS handshake with {} failed: {}", name, e),
                ))
            }
        }
    }
}

impl std::fmt::Debug for BrokerTlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerTlsConnector")
            .field("server_name", &self.server_name)
            .finish()
    }
}

fn build_client_config(options: &TlsOptions) -> Result<ClientConfig, KafkalinkClientError> {
    let builder = if options.reject_unauthorized {
        let mut roots = rustls::RootCertStore::empty();
        match options.ca_path {
            Some(ref ca_path) => {
                for cert in load_certs(ca_path)? {
                    roots.add(cert).map_err(|e| {
                        KafkalinkClientError::tls(format!("invalid CA certificate: {}", e))
                    })?;
                }
            }
            None => {
                let native = rustls_native_certs::load_native_certs();
                for e in &native.errors {
                    warn!("Skipping unreadable system certificate: {}", e);
                }
                let (added, ignored) = roots.add_parsable_certificates(native.certs);
                debug!("Loaded {} system root certificates ({} ignored)", added, ignored);
            }
        }
        if roots.is_empty() {
            return Err(KafkalinkClientError::tls(
                "no trusted root certificates available",
            ));
        }
        ClientConfig::builder().with_root_certificates(roots)
    } else {
        warn!("TLS certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyServerCert::default()))
    };

    match (&options.cert_path, &options.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            info!("Using client certificate from {}", cert_path);
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| KafkalinkClientError::tls(format!("invalid client cert/key: {}", e)))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(KafkalinkClientError::invalid_config(
            "TLS client authentication needs both cert_path and key_path",
        )),
    }
}

/// Load certificates from a PEM file
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, KafkalinkClientError> {
    let file = File::open(path).map_err(|e| {
        KafkalinkClientError::tls(format!("failed to read certificate file {}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KafkalinkClientError::tls(format!("failed to parse {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(KafkalinkClientError::tls(format!(
            "no certificates found in {}",
            path
        )));
    }

    debug!("Loaded {} certificates from {}", certs.len(), path);
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, KafkalinkClientError> {
    let file = File::open(path).map_err(|e| {
        KafkalinkClientError::tls(format!("failed to read key file {}: {}", path, e))
    })?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| KafkalinkClientError::tls(format!("failed to parse {}: {}", path, e)))?
        .ok_or_else(|| KafkalinkClientError::tls(format!("no private key found in {}", path)))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    /// Accepts any server certificate while still checking handshake
    /// signatures. Used when `reject_unauthorized` is off.
    #[derive(Debug)]
    pub struct AcceptAnyServerCert(CryptoProvider);

    impl Default for AcceptAnyServerCert {
        fn default() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
