//! Backend admission
//!
//! Runs on every connection that negotiated the relay protocol and passed
//! certificate verification: promote it to a session, ping it, register it,
//! then hold on to it until it closes.

use crate::identity::Identity;
use crate::pool::Pool;
use crate::session::{Session, SessionConfig, SessionError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Reasons a backend connection was not admitted
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("HTTP/2 handshake with backend {identity} failed: {source}")]
    Handshake {
        identity: Identity,
        #[source]
        source: SessionError,
    },
    #[error("backend {identity} failed liveness check: {source}")]
    Liveness {
        identity: Identity,
        #[source]
        source: SessionError,
    },
}

/// Admits authenticated backend connections into the pool
#[derive(Debug, Clone)]
pub struct Admission {
    pool: Pool,
    config: SessionConfig,
}

impl Admission {
    pub fn new(pool: Pool, config: SessionConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Admit one backend connection.
    ///
    /// Returns only once the session has closed, or immediately if the
    /// connection could not be admitted. The connection is dropped either way.
    pub async fn admit<IO>(&self, io: IO, identity: Identity) -> Result<(), AdmissionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::handshake(io, &self.config)
            .await
            .map_err(|source| AdmissionError::Handshake { identity, source })?;

        if let Err(source) = session.ping(self.config.ping_timeout).await {
            session.close();
            return Err(AdmissionError::Liveness { identity, source });
        }
        debug!(backend = %identity, "Backend answered liveness check");

        self.pool.register(identity, session.clone());
        info!(backend = %identity, "Accepted new backend connection");

        session.closed().await;
        info!(backend = %identity, "Backend connection expired");
        Ok(())
    }

    /// Like [`Admission::admit`], logging instead of returning the failure
    pub async fn serve<IO>(&self, io: IO, identity: Identity)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(e) = self.admit(io, identity).await {
            warn!(backend = %identity, error = %e, "Backend admission failed");
        }
    }
}
