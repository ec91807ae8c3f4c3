//! X.509 certificates and their fingerprints.
//!
//! Certificates arrive PEM encoded inside join intents and DER encoded from
//! TLS handshakes. Both are checked to be well-formed X.509 before they can
//! be trusted. Fingerprints are the lowercase hex SHA-256 of the DER bytes.

use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::{self, PemObject};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("Invalid certificate file: {0}")]
    InvalidPem(String),

    #[error("Failed to parse certificate: {0}")]
    InvalidDer(String),

    #[error("Certificate is empty")]
    Empty,
}

/// A parsed X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: CertificateDer<'static>,
}

impl Certificate {
    /// Parse the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        let der = CertificateDer::from_pem_slice(pem.as_bytes()).map_err(|e| match e {
            pem::Error::NoItemsFound => CertificateError::InvalidPem("no certificate found".into()),
            e => CertificateError::InvalidPem(e.to_string()),
        })?;

        Self::from_der(der)
    }

    /// Accept `der` only if it holds exactly one X.509 certificate.
    pub fn from_der(der: impl Into<CertificateDer<'static>>) -> Result<Self, CertificateError> {
        let der = der.into();
        if der.is_empty() {
            return Err(CertificateError::Empty);
        }

        let (rest, _) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| CertificateError::InvalidDer(e.to_string()))?;
        if !rest.is_empty() {
            return Err(CertificateError::InvalidDer(format!(
                "{} trailing bytes",
                rest.len()
            )));
        }

        Ok(Self { der })
    }

    /// Hex SHA-256 of the DER bytes.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }
}

/// Fingerprint of a PEM encoded certificate.
pub fn fingerprint_pem(pem: &str) -> Result<String, CertificateError> {
    Ok(Certificate::from_pem(pem)?.fingerprint())
}
