//! httpsgate - TLS front door for an HTTPS-intercepting proxy
//!
//! Provides:
//! - Ephemeral self-signed certificate generation at startup
//! - TLS termination with one task per connection
//! - A host admission gate backed by a fixed suffix allow-list
//! - A forwarding boundary for admitted requests, with an upstream relay

pub mod admission;
pub mod certificate;
pub mod forward;
pub mod proxy;

pub use admission::{Admission, AllowList, HostGate, SuffixMatch};
pub use certificate::{CertificateError, GeneratedCertificate};
pub use forward::{Forwarder, ProxyBody, UpstreamForwarder};
pub use proxy::{serve, ConnectionError, ServeError, TerminatorConfig, TlsTerminator};
