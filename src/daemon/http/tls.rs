//! Utilities for dealing with TLS.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::{error, fmt, io};
use log::debug;
use openssl::x509::X509;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{KeyLogFile, RootCertStore};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub use tokio_rustls::rustls::ServerConfig;


//------------ Constants ----------------------------------------------------

const SSLKEYLOGFILE_ENV_VAR_NAME: &str = "SSLKEYLOGFILE";


//------------ create_server_config -----------------------------------------

/// Creates the TLS server config.
///
/// If `client_ca_path` is given, clients are asked for a certificate issued
/// by one of the CAs in the file. Clients without a certificate are still
/// accepted so that workers can decide whether they need one.
pub fn create_server_config(
    key_path: &Path,
    cert_path: &Path,
    client_ca_path: Option<&Path>,
) -> Result<ServerConfig, TlsConfigError> {
    let builder = ServerConfig::builder();
    let builder = match client_ca_path {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in read_certs(path)? {
                roots.add(cert).map_err(|err| {
                    TlsConfigError::other(ErrorKind::Cert(path.into()), err)
                })?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|err| TlsConfigError::other(ErrorKind::Tls, err))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let mut config = builder
        .with_single_cert(read_certs(cert_path)?, read_key(key_path)?)
        .map_err(|err| TlsConfigError::other(ErrorKind::Tls, err))?;

    // See: https://wiki.wireshark.org/TLS#tls-decryption
    if std::env::var(SSLKEYLOGFILE_ENV_VAR_NAME).is_ok() {
        config.key_log = Arc::new(KeyLogFile::new());
    }

    Ok(config)
}

/// Reads the certificates from the given PEM file.
fn read_certs(
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    rustls_pemfile::certs(&mut io::BufReader::new(File::open(path).map_err(
        |err| TlsConfigError::new(ErrorKind::Cert(path.into()), err),
    )?))
    .collect::<Result<_, _>>()
    .map_err(|err| TlsConfigError::new(ErrorKind::Cert(path.into()), err))
}

/// Reads a private key from the given PEM file.
///
/// The key may be a PKCS#1 RSA private key, a PKCS#8 private key, or a
/// SEC1 encoded EC private key. All other PEM items are ignored.
fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    use rustls_pemfile::Item::*;

    let mut key_file =
        io::BufReader::new(File::open(path).map_err(|err| {
            TlsConfigError::new(ErrorKind::Key(path.into()), err)
        })?);

    let mut key = None;

    while let Some(item) = rustls_pemfile::read_one(&mut key_file).transpose()
    {
        let item = item.map_err(|err| {
            TlsConfigError::new(ErrorKind::Key(path.into()), err)
        })?;

        let bits = match item {
            Pkcs1Key(bits) => bits.into(),
            Pkcs8Key(bits) => bits.into(),
            Sec1Key(bits) => bits.into(),
            _ => continue,
        };
        if key.is_some() {
            return Err(TlsConfigError::other(
                ErrorKind::Key(path.into()),
                "file contains multiple keys",
            ));
        }
        key = Some(bits)
    }

    key.ok_or_else(|| {
        TlsConfigError::other(
            ErrorKind::Key(path.into()),
            "file does not contain any usable keys",
        )
    })
}


//------------ MaybeTlsTcpStream ---------------------------------------------

pin_project! {
    /// A TCP stream that may or may not use TLS.
    #[project = MaybeTlsProj]
    pub enum MaybeTlsTcpStream {
        Plain { #[pin] sock: TcpStream },
        Tls { #[pin] sock: TlsStream<TcpStream> },
    }
}

impl MaybeTlsTcpStream {
    /// Accepts a new connection.
    ///
    /// If `tls` is `Some(_)`, the TLS handshake is completed before
    /// returning so that the client certificate is known.
    pub async fn accept(
        sock: TcpStream, tls: Option<&TlsAcceptor>
    ) -> Result<Self, io::Error> {
        match tls {
            Some(tls) => {
                Ok(MaybeTlsTcpStream::Tls { sock: tls.accept(sock).await? })
            }
            None => Ok(MaybeTlsTcpStream::Plain { sock }),
        }
    }

    /// Returns the certificate the client authenticated with, if any.
    pub fn client_certificate(&self) -> Option<X509> {
        let MaybeTlsTcpStream::Tls { sock } = self else {
            return None
        };
        let cert = sock.get_ref().1.peer_certificates()?.first()?;
        match X509::from_der(cert.as_ref()) {
            Ok(cert) => Some(cert),
            Err(err) => {
                debug!("Cannot parse client certificate: {err}");
                None
            }
        }
    }
}

impl AsyncRead for MaybeTlsTcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<Result<(), io::Error>> {
        match self.project() {
            MaybeTlsProj::Plain { sock } => sock.poll_read(cx, buf),
            MaybeTlsProj::Tls { sock } => sock.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsTcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.project() {
            MaybeTlsProj::Plain { sock } => sock.poll_write(cx, buf),
            MaybeTlsProj::Tls { sock } => sock.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Result<(), io::Error>> {
        match self.project() {
            MaybeTlsProj::Plain { sock } => sock.poll_flush(cx),
            MaybeTlsProj::Tls { sock } => sock.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Result<(), io::Error>> {
        match self.project() {
            MaybeTlsProj::Plain { sock } => sock.poll_shutdown(cx),
            MaybeTlsProj::Tls { sock } => sock.poll_shutdown(cx),
        }
    }
}


//------------ TlsConfigError -----------------------------------------------

/// Represents errors that can occur building the TlsConfig
#[derive(Debug)]
pub struct TlsConfigError {
    kind: ErrorKind,
    err: io::Error,
}

#[derive(Clone, Debug)]
enum ErrorKind {
    Key(PathBuf),
    Cert(PathBuf),
    Tls,
}

impl TlsConfigError {
    fn new(kind: ErrorKind, err: io::Error) -> Self {
        Self { kind, err }
    }

    fn other(
        kind: ErrorKind,
        err: impl Into<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Self { kind, err: io::Error::other(err) }
    }
}

impl fmt::Display for TlsConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Key(ref path) => {
                write!(
                    f, "Error in TLS key file {}: {}", path.display(), self.err
                )
            }
            ErrorKind::Cert(ref path) => {
                write!(
                    f,
                    "Error in TLS certificate file {}: {}",
                    path.display(),
                    self.err
                )
            }
            ErrorKind::Tls => {
                write!(f, "Error in TLS configuration: {}", self.err)
            }
        }
    }
}

impl error::Error for TlsConfigError {}


//------------ Tests ---------------------------------------------------------
