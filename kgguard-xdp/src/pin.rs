//! Named table registry.
//!
//! Ingress and egress are wired independently; both look the connection table
//! up by name so they end up sharing one instance.

use std::sync::Arc;

use dashmap::DashMap;

use crate::conntrack::ConnTracker;

#[derive(Default)]
pub struct PinRegistry {
    conn_trackers: DashMap<String, Arc<ConnTracker>>,
}

impl PinRegistry {
    /// Existing table under `name`, or a new one with `max_entries`.
    /// Capacity is fixed by whoever pins first.
    pub fn conn_tracker(&self, name: &str, max_entries: usize) -> Arc<ConnTracker> {
        if let Some(t) = self.conn_trackers.get(name) {
            return Arc::clone(t.value());
        }
        let t = self
            .conn_trackers
            .entry(name.to_string())
            .or_insert_with(|| {
                log::debug!("pinned {} ({} entries)", name, max_entries);
                Arc::new(ConnTracker::with_max_entries(max_entries))
            });
        Arc::clone(t.value())
    }

    pub fn unpin(&self, name: &str) -> bool {
        self.conn_trackers.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgguard_common::ACTIVE_CONNECTIONS_PIN;
    use std::net::Ipv4Addr;

    #[test]
    fn same_name_same_table() {
        let pins = PinRegistry::default();
        let a = pins.conn_tracker(ACTIVE_CONNECTIONS_PIN, 8);
        let b = pins.conn_tracker(ACTIVE_CONNECTIONS_PIN, 1_000);
        assert!(Arc::ptr_eq(&a, &b));

        a.record(Ipv4Addr::new(8, 8, 8, 8), 0);
        assert!(b.is_fresh(Ipv4Addr::new(8, 8, 8, 8), 1));
    }

    #[test]
    fn different_names_are_isolated() {
        let pins = PinRegistry::default();
        let a = pins.conn_tracker("a", 8);
        let b = pins.conn_tracker("b", 8);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(pins.unpin("a"));
        assert!(!Arc::ptr_eq(&a, &pins.conn_tracker("a", 8)));
    }
}
