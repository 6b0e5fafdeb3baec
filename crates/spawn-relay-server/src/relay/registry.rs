//! Connection registry.
//!
//! Indexes every live connection by owning identity, and keeps a second,
//! process-wide list of machine-scoped (daemon) connections used as the
//! cross-identity fallback pool. Both indexes sit behind one lock, so a
//! connection is never visible in one and missing from the other.
//!
//! Lists preserve registration order; "first match" lookups depend on it.

use crate::transport::Channel;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Whether a connection belongs to a daemon controlling a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    Plain,
    MachineScoped { machine_id: String },
}

/// One live duplex connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    identity: String,
    kind: ConnectionKind,
    channel: Channel,
}

impl ConnectionRecord {
    pub fn new(id: ConnectionId, identity: String, kind: ConnectionKind, channel: Channel) -> Self {
        Self {
            id,
            identity,
            kind,
            channel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Authenticated owner of the connection.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Machine id for machine-scoped connections.
    pub fn machine_id(&self) -> Option<&str> {
        match &self.kind {
            ConnectionKind::MachineScoped { machine_id } => Some(machine_id),
            ConnectionKind::Plain => None,
        }
    }

    pub fn is_machine_scoped(&self) -> bool {
        matches!(self.kind, ConnectionKind::MachineScoped { .. })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[derive(Default)]
struct Indexes {
    by_identity: HashMap<String, Vec<Arc<ConnectionRecord>>>,
    machine_scoped: Vec<Arc<ConnectionRecord>>,
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    indexes: RwLock<Indexes>,
    next_conn_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate the id for a connection about to be registered.
    pub fn next_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a connection to both indexes.
    pub fn register(&self, record: Arc<ConnectionRecord>) {
        let mut indexes = self.indexes.write();
        if record.is_machine_scoped() {
            indexes.machine_scoped.push(record.clone());
        }
        let id = record.id();
        let identity = record.identity().to_string();
        let machine_id = record.machine_id().map(str::to_string);
        indexes
            .by_identity
            .entry(identity.clone())
            .or_default()
            .push(record);
        drop(indexes);

        info!(
            conn_id = id,
            identity = %identity,
            machine_id = ?machine_id,
            daemons = self.machine_count(),
            "connection registered"
        );
    }

    /// Remove a connection from both indexes.
    ///
    /// Unknown ids are ignored, so this is safe for connections that never
    /// finished registering.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        let mut indexes = self.indexes.write();
        indexes.machine_scoped.retain(|r| r.id() != id);

        let mut removed = None;
        let mut emptied = None;
        for (identity, records) in indexes.by_identity.iter_mut() {
            if let Some(pos) = records.iter().position(|r| r.id() == id) {
                removed = Some(records.remove(pos));
                if records.is_empty() {
                    emptied = Some(identity.clone());
                }
                break;
            }
        }
        if let Some(identity) = emptied {
            indexes.by_identity.remove(&identity);
        }
        drop(indexes);

        match &removed {
            Some(record) => debug!(
                conn_id = id,
                identity = %record.identity(),
                daemons = self.machine_count(),
                "connection unregistered"
            ),
            None => debug!(conn_id = id, "unregister of unknown connection ignored"),
        }
        removed
    }

    /// Snapshot of the live connections owned by `identity`, in registration order.
    pub fn connections_for(&self, identity: &str) -> Vec<Arc<ConnectionRecord>> {
        self.indexes
            .read()
            .by_identity
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every machine-scoped connection, in registration order.
    pub fn all_machine_scoped(&self) -> Vec<Arc<ConnectionRecord>> {
        self.indexes.read().machine_scoped.clone()
    }

    #[cfg(test)]
    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.indexes
            .read()
            .by_identity
            .values()
            .any(|records| records.iter().any(|r| r.id() == id))
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.indexes.read().by_identity.values().map(Vec::len).sum()
    }

    /// Number of live machine-scoped connections.
    pub fn machine_count(&self) -> usize {
        self.indexes.read().machine_scoped.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use spawn_relay_core::Frame;
    use tokio::sync::mpsc;

    /// Build a record with a fresh channel; the receiver sees its outbound frames.
    pub(crate) fn record(
        registry: &ConnectionRegistry,
        identity: &str,
        machine_id: Option<&str>,
    ) -> (Arc<ConnectionRecord>, mpsc::Receiver<Frame>) {
        let (channel, rx) = Channel::pair();
        let kind = match machine_id {
            Some(m) => ConnectionKind::MachineScoped {
                machine_id: m.to_string(),
            },
            None => ConnectionKind::Plain,
        };
        let record = ConnectionRecord::new(registry.next_id(), identity.to_string(), kind, channel);
        (Arc::new(record), rx)
    }

    fn ids(records: &[Arc<ConnectionRecord>]) -> Vec<ConnectionId> {
        records.iter().map(|r| r.id()).collect()
    }

    #[test]
    fn register_indexes_by_identity_and_kind() {
        let registry = ConnectionRegistry::new();
        let (web, _r1) = record(&registry, "U1", None);
        let (daemon, _r2) = record(&registry, "U1", Some("M1"));
        registry.register(web.clone());
        registry.register(daemon.clone());

        assert_eq!(ids(&registry.connections_for("U1")), vec![web.id(), daemon.id()]);
        assert_eq!(ids(&registry.all_machine_scoped()), vec![daemon.id()]);
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.machine_count(), 1);
    }

    #[test]
    fn unknown_identity_is_empty() {
        let registry = ConnectionRegistry::new();
        assert!(registry.connections_for("nobody").is_empty());
        assert!(registry.all_machine_scoped().is_empty());
    }

    #[test]
    fn unregister_removes_from_both_indexes() {
        let registry = ConnectionRegistry::new();
        let (daemon, _r) = record(&registry, "U1", Some("M1"));
        registry.register(daemon.clone());

        let removed = registry.unregister(daemon.id()).unwrap();
        assert_eq!(removed.id(), daemon.id());
        assert!(registry.connections_for("U1").is_empty());
        assert!(registry.all_machine_scoped().is_empty());
        assert!(!registry.is_registered(daemon.id()));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        let (web, _r) = record(&registry, "U1", None);
        registry.register(web.clone());

        assert!(registry.unregister(9999).is_none());
        assert!(registry.is_registered(web.id()));
    }

    #[test]
    fn order_is_registration_order() {
        let registry = ConnectionRegistry::new();
        let mut expected = Vec::new();
        let mut keep = Vec::new();
        for (identity, machine) in [("A", "M3"), ("B", "M1"), ("A", "M2")] {
            let (r, rx) = record(&registry, identity, Some(machine));
            expected.push(r.id());
            registry.register(r);
            keep.push(rx);
        }
        assert_eq!(ids(&registry.all_machine_scoped()), expected);
        assert_eq!(
            ids(&registry.connections_for("A")),
            vec![expected[0], expected[2]]
        );

        registry.unregister(expected[1]);
        assert_eq!(
            ids(&registry.all_machine_scoped()),
            vec![expected[0], expected[2]]
        );
    }

    #[test]
    fn snapshot_outlives_unregister() {
        let registry = ConnectionRegistry::new();
        let (daemon, _r) = record(&registry, "U1", Some("M1"));
        registry.register(daemon.clone());

        let snapshot = registry.connections_for("U1");
        registry.unregister(daemon.id());
        assert_eq!(snapshot.len(), 1);
        assert!(registry.connections_for("U1").is_empty());
    }

    #[test]
    fn concurrent_register_and_unregister_stay_consistent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let machine = format!("M{t}-{i}");
                        let (r, _rx) = record(&registry, &format!("U{t}"), Some(&machine));
                        let id = r.id();
                        registry.register(r);
                        // Either both views contain it or neither does.
                        let in_identity = registry
                            .connections_for(&format!("U{t}"))
                            .iter()
                            .any(|r| r.id() == id);
                        let in_pool = registry
                            .all_machine_scoped()
                            .iter()
                            .any(|r| r.id() == id);
                        assert_eq!(in_identity, in_pool);
                        registry.unregister(id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.machine_count(), 0);
    }
}
