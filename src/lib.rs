//! Bastion relay - serve HTTP for backends that can only dial out
//!
//! Backends behind NAT or firewalls open a TLS connection to the relay,
//! authenticate with a self-signed Ed25519 certificate and keep an HTTP/2
//! session open. The relay then:
//! - Recognizes backend connections by their negotiated ALPN protocol
//! - Identifies each backend by the SHA-256 hash of its public key
//! - Keeps one live session per backend, draining superseded ones
//! - Forwards public requests for `/<key hash>/<path>` over that session

pub mod admission;
pub mod config;
pub mod error;
pub mod identity;
pub mod pool;
pub mod router;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;
