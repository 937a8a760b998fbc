//! HTTPS GET as an explicit state machine: RESOLVING -> CONNECTING -> HANDSHAKING -> WRITING ->
//! READING -> PARSING -> COMPLETE | FAILED. Built on `tokio::net` + `rustls`/`tokio-rustls`, the
//! manual-TLS idiom the retrieved pack's own network clients use rather than a higher-level HTTP
//! client crate — this handler only ever issues one GET and reads to EOF.

use std::io;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::config::FetchCoreConfig;
use crate::model::{ErrorMessage, ProgressTag, ResultBundle, Url};
use crate::status::StatusSender;

use super::Loader;

/// Stage-tagged errors for the HTTPS GET state machine.
#[derive(Debug, thiserror::Error)]
pub enum HttpsError {
    #[error("resolving host {host:?} failed: {source}")]
    ResolutionFailed { host: String, source: io::Error },
    #[error("connecting to {host:?} failed: {source}")]
    ConnectFailed { host: String, source: io::Error },
    #[error("SNI name {host:?} is not a valid DNS name")]
    SniFailed { host: String },
    #[error("TLS handshake with {host:?} failed: {source}")]
    TlsHandshakeFailed { host: String, source: io::Error },
    #[error("writing request to {host:?} failed: {source}")]
    WriteFailed { host: String, source: io::Error },
    #[error("reading response from {host:?} was interrupted: {source}")]
    ReadInterrupted { host: String, source: io::Error },
    #[error("response from {host:?} never reached a header terminator")]
    NoHeaderTerminator { host: String },
}

impl From<HttpsError> for ErrorMessage {
    fn from(e: HttpsError) -> Self {
        ErrorMessage::new("https", e.to_string())
    }
}

fn root_store() -> &'static RootCertStore {
    static ROOTS: OnceLock<RootCertStore> = OnceLock::new();
    ROOTS.get_or_init(|| {
        let mut store = RootCertStore::empty();
        if let Ok(certs) = rustls_native_certs::load_native_certs() {
            for cert in certs {
                let _ = store.add(cert);
            }
        }
        store
    })
}

fn tls_connector() -> TlsConnector {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store().clone())
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub struct HttpsHandler {
    config: Arc<FetchCoreConfig>,
}

impl HttpsHandler {
    pub fn new(config: Arc<FetchCoreConfig>) -> Self {
        HttpsHandler { config }
    }

    fn host_and_port(&self, url: &Url) -> (String, u16) {
        match url.authority.split_once(':') {
            Some((host, port)) => (
                host.to_owned(),
                port.parse().unwrap_or(self.config.https_port),
            ),
            None => (url.authority.clone(), self.config.https_port),
        }
    }
}

#[async_trait]
impl Loader for HttpsHandler {
    async fn load_async(
        &self,
        url: &Url,
        status: StatusSender,
        _cancel: Option<CancellationToken>,
    ) -> Result<ResultBundle, ErrorMessage> {
        let (host, port) = self.host_and_port(url);
        let span = tracing::trace_span!("https_load", host = %host, path = %url.path);
        let _entered = span.enter();

        let _ = status.send(Ok(ProgressTag("resolving")));
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|source| HttpsError::ResolutionFailed {
                host: host.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| HttpsError::ResolutionFailed {
                host: host.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
            })?;

        let _ = status.send(Ok(ProgressTag("connecting")));
        tracing::debug!(%addr, "connecting");
        let stream =
            TcpStream::connect(addr)
                .await
                .map_err(|source| HttpsError::ConnectFailed {
                    host: host.clone(),
                    source,
                })?;

        let _ = status.send(Ok(ProgressTag("tls-handshake")));
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| HttpsError::SniFailed { host: host.clone() })?;
        let connector = tls_connector();
        let mut tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|source| HttpsError::TlsHandshakeFailed {
                host: host.clone(),
                source,
            })?;

        let _ = status.send(Ok(ProgressTag("requesting")));
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            if url.path.is_empty() { "/" } else { &url.path },
            host
        );
        tls.write_all(request.as_bytes())
            .await
            .map_err(|source| HttpsError::WriteFailed {
                host: host.clone(),
                source,
            })?;

        let _ = status.send(Ok(ProgressTag("reading")));
        let mut raw = Vec::new();
        tls.read_to_end(&mut raw)
            .await
            .map_err(|source| HttpsError::ReadInterrupted {
                host: host.clone(),
                source,
            })?;

        let terminator = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| HttpsError::NoHeaderTerminator { host: host.clone() })?;
        let body = raw[terminator + 4..].to_vec();

        let _ = status.send(Ok(ProgressTag("completed")));
        Ok(ResultBundle::single(url.basename(), body))
    }
}
