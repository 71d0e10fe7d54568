//! Per-client session state and the session table.
//!
//! The table keeps two synchronized maps: client id → assigned address
//! and address → live session. Both are mutated inside one critical
//! section so the bijection between them can never be observed broken.

use crate::ip_pool::IpPool;
use crate::pump::FecSender;
use bytes::Bytes;
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::info;

/// Live tunnel state for one connected client.
pub struct Session {
    pub client_id: String,
    /// Assigned host prefix (/32).
    pub assigned: IpNetwork,
    /// Assigned IPv6 host prefix (/128) when a v6 pool is configured.
    pub assigned_v6: Option<IpNetwork>,
    /// Feeds the session's Tun→Tunnel pump.
    pub tx: mpsc::Sender<Bytes>,
    /// Outbound FEC state, shared between the pump and the
    /// demultiplexer path; `None` when FEC is off for this session.
    pub fec: Option<Arc<Mutex<FecSender>>>,
    /// Cancels the session's tasks.
    shutdown: broadcast::Sender<()>,
    terminating: AtomicBool,
}

impl Session {
    pub fn new(
        client_id: String,
        assigned: IpNetwork,
        assigned_v6: Option<IpNetwork>,
        tx: mpsc::Sender<Bytes>,
        fec: Option<Arc<Mutex<FecSender>>>,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            client_id,
            assigned,
            assigned_v6,
            tx,
            fec,
            shutdown,
            terminating: AtomicBool::new(false),
        })
    }

    /// Assigned IPv4 address.
    pub fn addr(&self) -> IpAddr {
        self.assigned.ip()
    }

    /// Subscribe to this session's cancellation signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Signal the session's tasks to stop.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(());
    }

    /// Flip the terminating flag. Returns true for the caller that
    /// won; everyone else must not release resources again.
    pub fn begin_teardown(&self) -> bool {
        !self.terminating.swap(true, Ordering::SeqCst)
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Tables {
    by_client: HashMap<String, IpAddr>,
    by_addr: HashMap<IpAddr, Arc<Session>>,
}

/// The server's map of live sessions, keyed both ways.
#[derive(Default)]
pub struct SessionTable {
    inner: RwLock<Tables>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under its client id and assigned address(es).
    pub fn insert(&self, session: Arc<Session>) {
        let mut tables = self.inner.write().expect("session table poisoned");
        tables
            .by_client
            .insert(session.client_id.clone(), session.addr());
        if let Some(v6) = session.assigned_v6 {
            tables.by_addr.insert(v6.ip(), session.clone());
        }
        tables.by_addr.insert(session.addr(), session);
    }

    /// Session owning `addr`, v4 or v6.
    pub fn lookup_addr(&self, addr: &IpAddr) -> Option<Arc<Session>> {
        let tables = self.inner.read().expect("session table poisoned");
        tables.by_addr.get(addr).cloned()
    }

    /// Session for `client_id`, if connected.
    pub fn lookup_client(&self, client_id: &str) -> Option<Arc<Session>> {
        let tables = self.inner.read().expect("session table poisoned");
        let addr = tables.by_client.get(client_id)?;
        tables.by_addr.get(addr).cloned()
    }

    /// Remove `session` from both maps in one critical section.
    /// A newer session that replaced this one is left untouched.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut tables = self.inner.write().expect("session table poisoned");
        let current = match tables.by_addr.get(&session.addr()) {
            Some(s) if Arc::ptr_eq(s, session) => true,
            _ => false,
        };
        if !current {
            return false;
        }
        tables.by_addr.remove(&session.addr());
        if let Some(v6) = session.assigned_v6 {
            tables.by_addr.remove(&v6.ip());
        }
        if tables.by_client.get(&session.client_id) == Some(&session.addr()) {
            tables.by_client.remove(&session.client_id);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("session table poisoned")
            .by_client
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tear a session down: cancel its tasks, drop it from the table, and
/// release its pool slot(s). The terminating flag makes this
/// exactly-once even when the pump exit and an administrative
/// disconnect race.
pub fn teardown_session(
    table: &SessionTable,
    pool: &IpPool,
    pool_v6: Option<&IpPool>,
    session: &Arc<Session>,
) -> bool {
    if !session.begin_teardown() {
        return false;
    }
    session.cancel();
    table.remove(session);
    pool.release(session.addr());
    if let (Some(pool_v6), Some(v6)) = (pool_v6, session.assigned_v6) {
        pool_v6.release(v6.ip());
    }
    info!(
        client = %session.client_id,
        addr = %session.addr(),
        "session torn down, address released"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(client: &str, addr: &str) -> Arc<Session> {
        let (tx, _rx) = mpsc::channel(4);
        Session::new(
            client.to_string(),
            format!("{addr}/32").parse().unwrap(),
            None,
            tx,
            None,
        )
    }

    #[test]
    fn maps_stay_bijective() {
        let table = SessionTable::new();
        let s1 = session("alice", "10.0.0.2");
        let s2 = session("bob", "10.0.0.3");
        table.insert(s1.clone());
        table.insert(s2.clone());

        let by_addr = table.lookup_addr(&"10.0.0.2".parse().unwrap()).unwrap();
        assert_eq!(by_addr.client_id, "alice");
        let by_client = table.lookup_client("alice").unwrap();
        assert_eq!(by_client.addr(), "10.0.0.2".parse::<IpAddr>().unwrap());

        assert!(table.remove(&s1));
        assert!(table.lookup_client("alice").is_none());
        assert!(table.lookup_addr(&"10.0.0.2".parse().unwrap()).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_spares_replacement_session() {
        let table = SessionTable::new();
        let old = session("alice", "10.0.0.2");
        table.insert(old.clone());

        // Reconnect: a new session takes the same identity and address.
        let new = session("alice", "10.0.0.2");
        table.insert(new.clone());

        // The old session's late teardown must not evict the new one.
        assert!(!table.remove(&old));
        assert!(table.lookup_client("alice").is_some());
        assert!(Arc::ptr_eq(
            &table.lookup_addr(&"10.0.0.2".parse().unwrap()).unwrap(),
            &new
        ));
    }

    #[test]
    fn teardown_releases_exactly_once() {
        let pool = IpPool::new(
            "10.0.0.0/29".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
        )
        .unwrap();
        let table = SessionTable::new();

        let assigned = pool.allocate("alice").unwrap();
        let s = session("alice", &assigned.ip().to_string());
        table.insert(s.clone());
        let before = pool.stats();

        assert!(teardown_session(&table, &pool, None, &s));
        assert!(!teardown_session(&table, &pool, None, &s));

        let after = pool.stats();
        assert_eq!(after.available, before.available + 1);
        assert_eq!(after.allocated, before.allocated - 1);
        assert!(table.is_empty());
    }

    #[test]
    fn v6_addresses_indexed_and_removed() {
        let table = SessionTable::new();
        let (tx, _rx) = mpsc::channel(4);
        let s = Session::new(
            "alice".into(),
            "10.0.0.2/32".parse().unwrap(),
            Some("fd00::2/128".parse().unwrap()),
            tx,
            None,
        );
        table.insert(s.clone());

        assert!(table.lookup_addr(&"fd00::2".parse().unwrap()).is_some());
        table.remove(&s);
        assert!(table.lookup_addr(&"fd00::2".parse().unwrap()).is_none());
    }
}
