//! TLS terminator
//! Accepts TLS connections, runs the host admission gate on each decrypted
//! request and hands admitted requests to the forwarder

use crate::admission::{effective_host, Admission, HostGate};
use crate::certificate::{self, CertificateError, GeneratedCertificate};
use crate::forward::{text_response, Forwarder, ProxyBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Body of the response sent for hosts that are not on the allow-list
pub const FORBIDDEN_BODY: &str = "Host not Allowed\r\n";

/// Pause after a failed accept() so a full fd table does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Terminator configuration
#[derive(Clone, Debug)]
pub struct TerminatorConfig {
    pub listen_addr: String,
    pub handshake_timeout: Duration,
    pub header_read_timeout: Duration,
    pub gate: HostGate,
    /// Span that the accept loop and every connection are logged under
    pub span: Span,
}

impl Default for TerminatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:443".to_string(),
            handshake_timeout: Duration::from_secs(10),
            header_read_timeout: Duration::from_secs(30),
            gate: HostGate::default(),
            span: info_span!("httpsgate"),
        }
    }
}

/// Errors that stop the terminator. There is no retry for either.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to generate TLS certificate: {0}")]
    Certificate(#[from] CertificateError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors confined to a single connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("HTTP service error: {0}")]
    Http(#[from] hyper::Error),
}

/// State shared by every connection task. Immutable after construction.
struct ConnectionHandler {
    acceptor: TlsAcceptor,
    gate: HostGate,
    forwarder: Arc<dyn Forwarder>,
    handshake_timeout: Duration,
    header_read_timeout: Duration,
}

/// TLS listener that owns the process-lifetime key material
pub struct TlsTerminator {
    listener: TcpListener,
    local_addr: SocketAddr,
    certificate: GeneratedCertificate,
    handler: Arc<ConnectionHandler>,
    span: Span,
}

/// Generate key material, bind `listen_addr` and accept connections forever
pub async fn serve(
    listen_addr: impl Into<String>,
    forwarder: Arc<dyn Forwarder>,
) -> Result<(), ServeError> {
    let config = TerminatorConfig {
        listen_addr: listen_addr.into(),
        ..TerminatorConfig::default()
    };
    TlsTerminator::bind(config, forwarder).await?.run().await
}

impl TlsTerminator {
    /// Generate the certificate and bind the listener.
    ///
    /// Certificate generation happens exactly once per terminator. Either
    /// failure is returned as is; the caller is expected to abort.
    pub async fn bind(
        config: TerminatorConfig,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self, ServeError> {
        let certificate = certificate::generate()?;
        let acceptor = TlsAcceptor::from(Arc::new(certificate.server_config()?));

        let bind_error = |source| ServeError::Bind {
            addr: config.listen_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(parent: &config.span, "TLS listener bound on {}", local_addr);

        let handler = Arc::new(ConnectionHandler {
            acceptor,
            gate: config.gate,
            forwarder,
            handshake_timeout: config.handshake_timeout,
            header_read_timeout: config.header_read_timeout,
        });

        Ok(Self {
            listener,
            local_addr,
            certificate,
            handler,
            span: config.span,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The certificate presented to every client
    pub fn certificate(&self) -> &GeneratedCertificate {
        &self.certificate
    }

    /// Accept connections until the process is terminated
    pub async fn run(self) -> Result<(), ServeError> {
        let span = self.span.clone();
        self.accept_loop().instrument(span).await
    }

    async fn accept_loop(self) -> Result<(), ServeError> {
        // Keep the key material alive for as long as we accept
        let _certificate = self.certificate;

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let handler = self.handler.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = handler.handle_connection(stream, remote_addr).await {
                        debug!("Connection closed with error: {}", e);
                    }
                }
                .instrument(info_span!("connection", %remote_addr)),
            );
        }
    }
}

impl ConnectionHandler {
    /// Handle a single TLS connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let tls_stream = match timeout(self.handshake_timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ConnectionError::Handshake(e)),
            Err(_) => return Err(ConnectionError::HandshakeTimeout(self.handshake_timeout)),
        };

        let sni = tls_stream.get_ref().1.server_name().map(str::to_string);
        debug!(?sni, "TLS handshake completed");

        let io = TokioIo::new(tls_stream);
        let handler = self.clone();

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout)
            .preserve_header_case(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let handler = handler.clone();
                    async move { handler.handle_request(req, remote_addr).await }
                }),
            )
            .await?;

        Ok(())
    }

    /// Gate a decrypted request and dispatch it
    async fn handle_request(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let host = effective_host(&req);

        if self.gate.admit(&host) == Admission::Deny {
            info!(host = %host, method = %req.method(), "Host not allowed");
            return Ok(forbidden_response());
        }

        debug!(host = %host, "{} {}", req.method(), req.uri());

        if req.uri().authority().is_none() {
            match absolute_uri(req.uri(), &host) {
                Ok(uri) => *req.uri_mut() = uri,
                Err(e) => {
                    warn!(host = %host, "Cannot build request target: {}", e);
                    return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request"));
                }
            }
        }

        match self.forwarder.forward(req, remote_addr).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!(host = %host, "Forwarding failed: {:#}", e);
                Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
            }
        }
    }
}

/// The fixed rejection for hosts outside the allow-list
pub fn forbidden_response() -> Response<ProxyBody> {
    text_response(StatusCode::FORBIDDEN, FORBIDDEN_BODY)
}

/// Absolute-form target built from an origin-form URI and the `Host` value
fn absolute_uri(uri: &Uri, host: &str) -> Result<Uri, hyper::http::Error> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme("https")
        .authority(host)
        .path_and_query(path_and_query)
        .build()
}
