//! The node publisher's in-memory session table: how many currently
//! published volumes reference a given NVMe-oF subsystem or iSCSI target on
//! this node, so the publisher only tears down the shared session once the
//! last referencing volume unstages.
//!
//! Never persisted: on startup the table starts empty and is reconciled from
//! whatever udev/iscsiadm/nvme already show as connected, rather than from
//! a counter left over from a previous process.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Protocol {
    NvmeTcp,
    Iscsi,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SubsystemKey {
    pub protocol: Protocol,
    pub key: String,
}

impl SubsystemKey {
    pub(crate) fn nvmf(nqn: &str) -> Self {
        SubsystemKey {
            protocol: Protocol::NvmeTcp,
            key: nqn.to_string(),
        }
    }

    pub(crate) fn iscsi(portal: &str, iqn: &str) -> Self {
        SubsystemKey {
            protocol: Protocol::Iscsi,
            key: format!("{}/{}", portal, iqn),
        }
    }
}

#[derive(Debug)]
struct Session {
    refcount: u32,
    last_seen: Instant,
}

/// Reader/writer-locked map from subsystem/target identity to refcount.
/// Mutation (incrementing/decrementing a single entry) still happens under
/// the caller's per-volume-id lock, so the map lock here only ever guards
/// enumeration and entry creation/removal, never compound mutation.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    sessions: RwLock<HashMap<SubsystemKey, Session>>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a new reference to `key`, creating the entry if this is the
    /// first volume to use it. Returns the refcount after incrementing.
    pub(crate) async fn acquire(&self, key: SubsystemKey) -> u32 {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(key.clone()).or_insert(Session {
            refcount: 0,
            last_seen: Instant::now(),
        });
        entry.refcount += 1;
        entry.last_seen = Instant::now();
        debug!(?key, refcount = entry.refcount, "session acquired");
        entry.refcount
    }

    /// Drop a reference to `key`. Returns the refcount after decrementing;
    /// `0` means the caller owns tearing the shared session down. The entry
    /// itself is removed once it reaches zero.
    pub(crate) async fn release(&self, key: SubsystemKey) -> u32 {
        let mut sessions = self.sessions.write().await;
        let remaining = match sessions.get_mut(&key) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.last_seen = Instant::now();
                entry.refcount
            }
            None => 0,
        };
        if remaining == 0 {
            sessions.remove(&key);
        }
        debug!(?key, refcount = remaining, "session released");
        remaining
    }

    pub(crate) async fn refcount(&self, key: &SubsystemKey) -> u32 {
        self.sessions.read().await.get(key).map(|s| s.refcount).unwrap_or(0)
    }

    /// Seed the table from whatever the kernel already reports as attached,
    /// called once at node-publisher startup. `keys` is the set of
    /// subsystem/target identities the kernel reports as live; anything the
    /// node reports that doesn't match our naming convention is left alone
    /// since it isn't ours to manage.
    pub(crate) async fn reconcile(&self, keys: impl IntoIterator<Item = (SubsystemKey, u32)>) {
        let mut sessions = self.sessions.write().await;
        for (key, refcount) in keys {
            sessions.insert(key, Session {
                refcount,
                last_seen: Instant::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_increments_and_release_decrements() {
        let table = SessionTable::new();
        let key = SubsystemKey::nvmf("nqn.2014-08.org.nvmexpress:uuid:abc");

        assert_eq!(table.acquire(key.clone()).await, 1);
        assert_eq!(table.acquire(key.clone()).await, 2);
        assert_eq!(table.refcount(&key).await, 2);

        assert_eq!(table.release(key.clone()).await, 1);
        assert_eq!(table.release(key.clone()).await, 0);
        assert_eq!(table.refcount(&key).await, 0);
    }

    #[tokio::test]
    async fn release_on_unknown_key_is_a_noop() {
        let table = SessionTable::new();
        let key = SubsystemKey::iscsi("10.0.0.5:3260", "iqn.2016-06.io.csi:vol-1");
        assert_eq!(table.release(key).await, 0);
    }

    #[tokio::test]
    async fn entry_is_removed_once_refcount_hits_zero() {
        let table = SessionTable::new();
        let key = SubsystemKey::nvmf("nqn.test");
        table.acquire(key.clone()).await;
        table.release(key.clone()).await;

        // Reconciling with a fresh state should not find a stale count left
        // behind from the removed entry.
        table.reconcile([(key.clone(), 3)]).await;
        assert_eq!(table.refcount(&key).await, 3);
    }

    #[test]
    fn iscsi_key_combines_portal_and_iqn() {
        let key = SubsystemKey::iscsi("10.0.0.5:3260", "iqn.2016-06.io.csi:vol-1");
        assert_eq!(key.key, "10.0.0.5:3260/iqn.2016-06.io.csi:vol-1");
        assert_eq!(key.protocol, Protocol::Iscsi);
    }
}
