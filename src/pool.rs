//! Pool of backend sessions
//!
//! Maps each backend identity to the single session that currently serves it.
//! A reconnecting backend replaces its previous session, which is drained in the
//! background. Entries are only ever overwritten: a session that dies stays in
//! place, failing forwards, until its backend connects again.

use crate::identity::Identity;
use crate::session::Session;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Counters for pool activity
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Sessions installed through `register`
    pub registrations: AtomicU64,
    /// Registrations that superseded a live session
    pub replacements: AtomicU64,
    /// Lookups that found no session
    pub misses: AtomicU64,
}

impl PoolStats {
    pub fn get_registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    pub fn get_replacements(&self) -> u64 {
        self.replacements.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Shared map from backend identity to its session
#[derive(Clone)]
pub struct Pool {
    sessions: Arc<RwLock<HashMap<Identity, Session>>>,
    drain_timeout: Duration,
    stats: Arc<PoolStats>,
}

impl Pool {
    /// Create an empty pool. Superseded sessions get `drain_timeout` to finish
    /// their open streams.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            drain_timeout,
            stats: Arc::new(PoolStats::default()),
        }
    }

    /// Install `session` for `identity`.
    ///
    /// A previous session that is still open is drained on a detached task;
    /// this call never waits for it.
    pub fn register(&self, identity: Identity, session: Session) {
        let mut sessions = self.sessions.write();
        if let Some(old) = sessions.get(&identity) {
            if !old.is_closed() && !old.same_session(&session) {
                let old = old.clone();
                let deadline = self.drain_timeout;
                self.stats.replacements.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    old.shutdown(deadline).await;
                    debug!(backend = %identity, "Superseded backend session drained");
                });
            }
        }
        sessions.insert(identity, session);
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Session currently registered for `identity`
    pub fn lookup(&self, identity: &Identity) -> Option<Session> {
        let session = self.sessions.read().get(identity).cloned();
        if session.is_none() {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        session
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("sessions", &self.len())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{fast_config, spawn_backend};
    use hyper::body::Bytes;
    use hyper::Response;

    async fn live_session() -> Session {
        let (relay_io, backend_io) = tokio::io::duplex(64 * 1024);
        spawn_backend(backend_io, |_, _| Response::new(Bytes::new()));
        Session::handshake(relay_io, &fast_config()).await.unwrap()
    }

    fn identity(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn test_lookup_miss_on_empty_pool() {
        let pool = Pool::new(Duration::from_secs(1));
        assert!(pool.lookup(&identity(1)).is_none());
        assert!(pool.is_empty());
        assert_eq!(pool.stats().get_misses(), 1);
    }

    #[tokio::test]
    async fn test_register_then_lookup() {
        let pool = Pool::new(Duration::from_secs(1));
        let session = live_session().await;

        pool.register(identity(1), session.clone());

        let found = pool.lookup(&identity(1)).unwrap();
        assert!(found.same_session(&session));
        assert!(pool.lookup(&identity(2)).is_none());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats().get_registrations(), 1);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_and_drains_old_session() {
        let pool = Pool::new(Duration::from_secs(1));
        let old = live_session().await;
        let new = live_session().await;

        pool.register(identity(7), old.clone());
        pool.register(identity(7), new.clone());

        assert!(pool.lookup(&identity(7)).unwrap().same_session(&new));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats().get_replacements(), 1);

        tokio::time::timeout(Duration::from_secs(2), old.closed())
            .await
            .expect("superseded session should be drained");
        assert!(old.is_draining());
        assert!(!new.is_draining());
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn test_closed_session_is_replaced_without_drain() {
        let pool = Pool::new(Duration::from_secs(1));
        let old = live_session().await;
        old.close();
        old.closed().await;

        pool.register(identity(3), old.clone());
        pool.register(identity(3), live_session().await);

        assert_eq!(pool.stats().get_replacements(), 0);
        assert!(!old.is_draining());
    }

    #[tokio::test]
    async fn test_dead_session_stays_registered() {
        let pool = Pool::new(Duration::from_secs(1));
        let session = live_session().await;
        pool.register(identity(4), session.clone());

        session.close();
        session.closed().await;

        let found = pool.lookup(&identity(4)).unwrap();
        assert!(found.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_keep_distinct_entries() {
        const N: u8 = 32;
        let pool = Pool::new(Duration::from_secs(1));

        let mut sessions = Vec::new();
        for _ in 0..N {
            sessions.push(live_session().await);
        }

        let handles: Vec<_> = sessions
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, session)| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.register(identity(i as u8), session) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(pool.len(), N as usize);
        for (i, session) in sessions.iter().enumerate() {
            let found = pool.lookup(&identity(i as u8)).unwrap();
            assert!(found.same_session(session), "identity {} mapped to wrong session", i);
        }
    }
}
