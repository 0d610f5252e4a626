//! Ephemeral self-signed certificate generation
//! Produces the key pair and leaf certificate used to terminate inbound TLS

use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::info;

/// Organization placed in both subject and issuer
pub const ORGANIZATION: &str = "Zarten";

/// Ten years of 365 days
pub const VALIDITY_DAYS: i64 = 365 * 10;

/// Serial numbers carry this many random bytes (128 bits)
pub const SERIAL_BYTES: usize = 16;

/// Errors raised while building key material. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("random source unavailable: {0}")]
    Entropy(#[source] rand::Error),

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("validity window out of range: {0}")]
    Time(#[from] time::error::ComponentRange),

    #[error("failed to parse PEM material: {0}")]
    Pem(#[source] std::io::Error),

    #[error("no private key found in PEM material")]
    MissingKey,

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// A freshly generated self-signed certificate together with its private key.
///
/// Nothing here is ever written to disk; the value lives as long as the
/// terminator that owns it.
pub struct GeneratedCertificate {
    cert_pem: String,
    key_pem: String,
    cert_der: CertificateDer<'static>,
    serial: [u8; SERIAL_BYTES],
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl std::fmt::Debug for GeneratedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedCertificate")
            .field("serial", &hex(&self.serial))
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Generate a new key pair and a self-signed server certificate
pub fn generate() -> Result<GeneratedCertificate, CertificateError> {
    let mut serial = [0u8; SERIAL_BYTES];
    OsRng
        .try_fill_bytes(&mut serial)
        .map_err(CertificateError::Entropy)?;

    // X.509 stores whole seconds; truncate so the window length is exact
    let not_before = OffsetDateTime::now_utc().replace_nanosecond(0)?;
    let not_after = not_before + Duration::days(VALIDITY_DAYS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.not_before = not_before;
    params.not_after = not_after;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let generated = GeneratedCertificate {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        cert_der: cert.der().clone(),
        serial,
        not_before,
        not_after,
    };

    info!(
        serial = %hex(&generated.serial),
        not_before = %generated.not_before,
        not_after = %generated.not_after,
        "Generated self-signed certificate"
    );

    Ok(generated)
}

impl GeneratedCertificate {
    /// Certificate in PEM form
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PKCS#8 private key in PEM form
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Certificate in DER form
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Raw serial number bytes as drawn from the RNG
    pub fn serial(&self) -> &[u8; SERIAL_BYTES] {
        &self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Build a rustls server configuration that presents this certificate.
    ///
    /// The PEM pair is parsed back the same way an operator-supplied pair
    /// would be, so the transport-ready encoding is what the TLS stack sees.
    pub fn server_config(&self) -> Result<ServerConfig, CertificateError> {
        let certs = rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(CertificateError::Pem)?;
        let key = rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(CertificateError::Pem)?
            .ok_or(CertificateError::MissingKey)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
