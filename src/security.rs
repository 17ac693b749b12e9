//! Security parameters and TLS contexts.
//!
//! [`SecurityParameters`] name PEM files on disk. Before any stream attempt
//! they are turned into a [`SecurityContext`], a shared rustls client or
//! server configuration used for every handshake of that connection or
//! listener.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::net::TcpStream;

/// Errors building a TLS context from security parameters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SecurityError {
    /// A PEM file could not be read or parsed.
    #[error("{path}: {source}")]
    Pem {
        /// The offending file.
        path: PathBuf,
        /// The parse error.
        #[source]
        source: rustls::pki_types::pem::Error,
    },

    /// A listener needs an identity to present to clients.
    #[error("no identity configured for a server context")]
    MissingIdentity,

    /// The identity file holds no certificate.
    #[error("{0}: no certificates found")]
    EmptyChain(PathBuf),

    /// rustls rejected the configuration.
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// Certificates and trust anchors for a secured connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityParameters {
    identity: Option<PathBuf>,
    trusted_ca: Vec<PathBuf>,
}

impl SecurityParameters {
    /// No identity, trusting the platform's root certificates.
    pub fn new() -> Self {
        Self::default()
    }

    /// A PEM file holding this side's certificate chain and private key.
    pub fn with_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity = Some(path.into());
        self
    }

    /// Trust the certificate authorities in a PEM file. When none are added,
    /// clients trust the platform's native roots.
    pub fn with_trusted_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted_ca.push(path.into());
        self
    }

    /// The identity file, if any.
    pub fn identity(&self) -> Option<&Path> {
        self.identity.as_deref()
    }

    /// Trusted CA files.
    pub fn trusted_ca(&self) -> &[PathBuf] {
        &self.trusted_ca
    }

    /// Build a client context, used by outgoing stream attempts.
    pub fn client_context(&self) -> Result<SecurityContext, SecurityError> {
        let roots = if self.trusted_ca.is_empty() {
            native_roots()
        } else {
            self.root_store()?
        };

        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);

        let config = match &self.identity {
            Some(path) => {
                let (chain, key) = load_identity(path)?;
                builder.with_client_auth_cert(chain, key)?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(SecurityContext::Client(Arc::new(config)))
    }

    /// Build a server context, used by listeners.
    ///
    /// Client certificates are verified against the trusted CAs when a client
    /// presents one, but are not required.
    pub fn server_context(&self) -> Result<SecurityContext, SecurityError> {
        let path = self.identity.as_ref().ok_or(SecurityError::MissingIdentity)?;
        let (chain, key) = load_identity(path)?;

        let builder = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?;

        let builder = if self.trusted_ca.is_empty() {
            builder.with_no_client_auth()
        } else {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(self.root_store()?), provider())
                    .allow_unauthenticated()
                    .build()?;
            builder.with_client_cert_verifier(verifier)
        };

        Ok(SecurityContext::Server(Arc::new(
            builder.with_single_cert(chain, key)?,
        )))
    }

    fn root_store(&self) -> Result<RootCertStore, SecurityError> {
        let mut roots = RootCertStore::empty();
        for path in &self.trusted_ca {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        }
        Ok(roots)
    }
}

/// A TLS configuration shared by every handshake of one connection or listener.
#[derive(Clone)]
pub enum SecurityContext {
    /// Used when this side opened the connection.
    Client(Arc<ClientConfig>),

    /// Used by listeners for accepted connections.
    Server(Arc<ServerConfig>),
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client(_) => f.write_str("SecurityContext::Client"),
            Self::Server(_) => f.write_str("SecurityContext::Server"),
        }
    }
}

impl SecurityContext {
    /// Run the client handshake over a connected TCP stream.
    pub(crate) async fn connect(
        &self,
        stream: TcpStream,
        server_name: ServerName<'static>,
    ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        match self {
            Self::Client(config) => {
                tokio_rustls::TlsConnector::from(config.clone())
                    .connect(server_name, stream)
                    .await
            }
            Self::Server(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "server context used for an outgoing connection",
            )),
        }
    }

    /// Run the server handshake over an accepted TCP stream.
    pub(crate) async fn accept(
        &self,
        stream: TcpStream,
    ) -> io::Result<tokio_rustls::server::TlsStream<TcpStream>> {
        match self {
            Self::Server(config) => {
                tokio_rustls::TlsAcceptor::from(config.clone())
                    .accept(stream)
                    .await
            }
            Self::Client(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "client context used for an incoming connection",
            )),
        }
    }
}

/// The name to verify the server certificate against: the host name when the
/// application gave one, otherwise the address dialed.
pub(crate) fn server_name(host: Option<&str>, addr: IpAddr) -> io::Result<ServerName<'static>> {
    match host {
        Some(host) => ServerName::try_from(host.to_string())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err)),
        None => Ok(ServerName::IpAddress(addr.into())),
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!(%error, "loading native root certificates");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!(added, ignored, "native root certificates");
    roots
}

fn pem_error(path: &Path) -> impl FnOnce(rustls::pki_types::pem::Error) -> SecurityError + '_ {
    move |source| SecurityError::Pem {
        path: path.to_path_buf(),
        source,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SecurityError> {
    CertificateDer::pem_file_iter(path)
        .map_err(pem_error(path))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error(path))
}

fn load_identity(
    path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SecurityError> {
    let chain = load_certs(path)?;
    if chain.is_empty() {
        return Err(SecurityError::EmptyChain(path.to_path_buf()));
    }
    let key = PrivateKeyDer::from_pem_file(path).map_err(pem_error(path))?;
    Ok((chain, key))
}
