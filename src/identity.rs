//! Backend identities
//!
//! A backend is identified by the SHA-256 digest of its raw Ed25519 public key.
//! The digest is the pool key and, hex-encoded, the first path segment of every
//! public request routed to that backend.

use rustls::pki_types::CertificateDer;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x509_parser::prelude::*;

/// Length of an identity digest in bytes
pub const IDENTITY_LEN: usize = 32;

/// Dotted OID of the Ed25519 subject public key algorithm
const ED25519_OID: &str = "1.3.101.112";

/// Errors decoding an identity from its hex form
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("backend key hash is not valid hex")]
    InvalidHex,
    #[error("backend key hash is {0} bytes, expected 32")]
    WrongLength(usize),
}

/// Reasons a backend certificate cannot yield an identity
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to parse certificate: {0}")]
    Parse(String),
    #[error("self-signed certificate key type is not Ed25519")]
    NotEd25519,
    #[error("certificate is not self-signed")]
    NotSelfSigned,
    #[error("Ed25519 public key is {0} bytes, expected 32")]
    BadKeyLength(usize),
}

/// SHA-256 digest of a backend's Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the identity of a raw Ed25519 public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(Sha256::digest(public_key).into())
    }

    /// Extract the identity from a self-signed Ed25519 certificate
    pub fn from_certificate(cert: &CertificateDer<'_>) -> Result<Self, CertificateError> {
        let (_, parsed) = X509Certificate::from_der(cert.as_ref())
            .map_err(|e| CertificateError::Parse(e.to_string()))?;

        let spki = parsed.public_key();
        if spki.algorithm.algorithm.to_id_string() != ED25519_OID {
            return Err(CertificateError::NotEd25519);
        }

        if parsed.issuer().as_raw() != parsed.subject().as_raw() {
            return Err(CertificateError::NotSelfSigned);
        }

        let key = spki.subject_public_key.data.as_ref();
        if key.len() != IDENTITY_LEN {
            return Err(CertificateError::BadKeyLength(key.len()));
        }

        Ok(Self::from_public_key(key))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Lowercase hex, as used in request paths
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidHex)?;
        let bytes: [u8; IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| IdentityError::WrongLength(b.len()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}
