//! TLS identity loading and the server-side acceptor.

use std::{fmt, io::Cursor, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{
    rustls::{version, ServerConfig, SupportedProtocolVersion},
    server::TlsStream,
    TlsAcceptor as RustlsAcceptor,
};

use crate::config::TlsVersion;
use crate::error::Fault;

/// ALPN identifiers advertised during the handshake. They assist clients
/// in picking a protocol; the preface sniff on the decrypted stream stays
/// authoritative.
const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP1: &[u8] = b"http/1.1";

/// A PEM certificate chain.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub(crate) pem: Vec<u8>,
}

impl Certificate {
    pub fn from_pem(pem: impl Into<Vec<u8>>) -> Self {
        Self { pem: pem.into() }
    }
}

/// A PEM certificate chain plus its private key.
#[derive(Debug, Clone)]
pub struct Identity {
    pub(crate) cert: Certificate,
    pub(crate) key: Vec<u8>,
}

impl Identity {
    pub fn from_pem(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        let cert = Certificate::from_pem(cert);
        Self {
            cert,
            key: key.into(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct TlsAcceptor {
    inner: Arc<ServerConfig>,
}

impl TlsAcceptor {
    pub(crate) fn new(
        identity: Identity,
        min_version: Option<TlsVersion>,
        max_version: Option<TlsVersion>,
    ) -> Result<Self, Fault> {
        let versions = protocol_versions(min_version, max_version);
        if versions.is_empty() {
            return Err(Fault::new(
                "the configured TLS version bounds leave no protocol version enabled",
            ));
        }

        let builder =
            ServerConfig::builder_with_protocol_versions(&versions).with_no_client_auth();

        let (cert, key) = load_identity(identity)?;
        let mut config = builder.with_single_cert(cert, key).map_err(|e| {
            Fault::new("the TLS identity was rejected").caused_by_text(e.to_string())
        })?;

        config.alpn_protocols.push(ALPN_H2.into());
        config.alpn_protocols.push(ALPN_HTTP1.into());
        Ok(Self {
            inner: Arc::new(config),
        })
    }

    pub(crate) async fn accept<IO>(&self, io: IO) -> std::io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = RustlsAcceptor::from(self.inner.clone());
        acceptor.accept(io).await
    }
}

impl fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAcceptor").finish()
    }
}

fn protocol_versions(
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
) -> Vec<&'static SupportedProtocolVersion> {
    [
        (TlsVersion::Tls12, &version::TLS12),
        (TlsVersion::Tls13, &version::TLS13),
    ]
    .into_iter()
    .filter(|(version, _)| min.map_or(true, |min| *version >= min))
    .filter(|(version, _)| max.map_or(true, |max| *version <= max))
    .map(|(_, supported)| supported)
    .collect()
}

fn load_identity(
    identity: Identity,
) -> Result<
    (
        Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>,
        tokio_rustls::rustls::pki_types::PrivateKeyDer<'static>,
    ),
    Fault,
> {
    let cert = rustls_pemfile::certs(&mut Cursor::new(identity.cert.pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| Fault::new("the TLS certificate could not be parsed"))?;

    let Ok(Some(key)) = rustls_pemfile::private_key(&mut Cursor::new(identity.key)) else {
        return Err(Fault::new(
            "the TLS private key could not be parsed - no RSA or PKCS8-encoded keys found",
        ));
    };

    Ok((cert, key))
}
