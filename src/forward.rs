//! Forwarding dispatch
//! The boundary between the admission gate and the engine that relays admitted traffic

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, HOST, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

/// Response body type shared by the terminator and every forwarder
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that only make sense on a single hop
const HOP_BY_HOP: &[&str] = &["keep-alive", "proxy-connection"];

/// The engine that handles an admitted request.
///
/// Called exactly once per admitted request. The request URI is always in
/// absolute form: when the client sent origin form, the terminator has already
/// filled in the authority from the `Host` header. Implementations may stream
/// and take as long as they need.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>>;
}

/// Relays admitted requests to the real origin over TLS
pub struct UpstreamForwarder {
    connector: TlsConnector,
    resolved: HashMap<String, SocketAddr>,
}

impl UpstreamForwarder {
    /// Create a forwarder that verifies upstreams against the webpki roots
    pub fn new() -> Result<Self, rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self::with_client_config(Arc::new(config)))
    }

    /// Create a forwarder with a caller-supplied TLS client configuration
    pub fn with_client_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            resolved: HashMap::new(),
        }
    }

    /// Pin `host` to a fixed socket address instead of resolving it
    pub fn resolve(mut self, host: impl Into<String>, addr: SocketAddr) -> Self {
        self.resolved.insert(host.into().to_ascii_lowercase(), addr);
        self
    }

    async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        match self.resolved.get(&host.to_ascii_lowercase()) {
            Some(addr) => TcpStream::connect(addr).await,
            None => TcpStream::connect((host, port)).await,
        }
    }

    /// Rewrite the request for the upstream hop
    fn prepare_request(req: &mut Request<Incoming>, remote_addr: SocketAddr) -> Result<()> {
        let authority = req
            .uri()
            .authority()
            .cloned()
            .ok_or_else(|| anyhow!("request has no authority"))?;

        let origin_form: Uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .context("Invalid request path")?;
        *req.uri_mut() = origin_form;
        *req.version_mut() = Version::HTTP_11;

        let headers = req.headers_mut();
        strip_hop_by_hop(headers);

        if !headers.contains_key(HOST) {
            headers.insert(HOST, HeaderValue::from_str(authority.as_str())?);
        }
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_str(&remote_addr.ip().to_string())?,
        );

        Ok(())
    }
}

#[async_trait]
impl Forwarder for UpstreamForwarder {
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let authority = req
            .uri()
            .authority()
            .cloned()
            .ok_or_else(|| anyhow!("request has no authority"))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(443);

        debug!("Forwarding {} {} to {}:{}", req.method(), req.uri(), host, port);

        let stream = match self.connect(&host, port).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to connect to upstream {}:{}: {}", host, port, e);
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        let server_name = ServerName::try_from(host.clone())
            .with_context(|| format!("Invalid upstream server name: {}", host))?;
        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .with_context(|| format!("TLS handshake with {} failed", host))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
            .await
            .context("Failed to establish connection to upstream")?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection error: {}", e);
            }
        });

        Self::prepare_request(&mut req, remote_addr)?;

        let response = sender
            .send_request(req)
            .await
            .context("Failed to send request to upstream")?;

        Ok(response.map(|body| body.boxed()))
    }
}

/// Remove headers that must not cross the proxy, including any that the
/// `Connection` header names
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .filter(|name| *name != HOST)
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, PROXY_AUTHORIZATION] {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Create a plain-text response
pub fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes)
        .map_err(|never| match never {})
        .boxed()
}
