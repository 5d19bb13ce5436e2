use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::store::{
    ConfigEvent, ConfigProvider, ConfigSnapshot, ConfigSource, FieldMap, Subscription,
    TableEntries,
};

struct Subscriber {
    tables: Vec<String>,
    tx: mpsc::Sender<ConfigEvent>,
}

#[derive(Default)]
struct Inner {
    tables: BTreeMap<String, TableEntries>,
    subscribers: Vec<Subscriber>,
}

impl Inner {
    fn notify(&mut self, event: ConfigEvent) {
        // Dropped receivers are pruned here.
        self.subscribers.retain(|sub| {
            if !sub.tables.iter().any(|t| *t == event.table) {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }
}

/// Thread-safe in-memory configuration store.
///
/// Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated from a snapshot (no events are emitted).
    pub fn from_snapshot(snapshot: ConfigSnapshot) -> Self {
        let store = Self::new();
        store.lock().tables = snapshot.into_tables();
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace an entry and notify subscribers with its new fields.
    pub fn set_entry(&self, table: &str, key: &str, fields: FieldMap) {
        let mut inner = self.lock();
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), fields.clone());
        inner.notify(ConfigEvent::set(table, key, fields));
    }

    /// Set one field of an entry, creating the entry if needed.
    ///
    /// Subscribers see only the changed field.
    pub fn set_field(&self, table: &str, key: &str, field: &str, value: &str) {
        let mut inner = self.lock();
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        let mut changed = FieldMap::new();
        changed.insert(field.to_string(), value.to_string());
        inner.notify(ConfigEvent::set(table, key, changed));
    }

    /// Delete an entry. Deleting a missing entry is a no-op.
    pub fn del_entry(&self, table: &str, key: &str) {
        let mut inner = self.lock();
        let removed = inner
            .tables
            .get_mut(table)
            .and_then(|entries| entries.remove(key));
        if removed.is_some() {
            inner.notify(ConfigEvent::del(table, key));
        }
    }

    /// Converge the store to `snapshot`, emitting one event per changed entry.
    ///
    /// Tables absent from the snapshot are emptied. Returns the number of
    /// events emitted.
    pub fn apply_snapshot(&self, snapshot: ConfigSnapshot) -> usize {
        let mut inner = self.lock();
        let mut desired = snapshot.into_tables();
        let names: BTreeSet<String> = inner
            .tables
            .keys()
            .chain(desired.keys())
            .cloned()
            .collect();

        let mut events = Vec::new();
        for name in names {
            let current = inner.tables.remove(&name).unwrap_or_default();
            let wanted = desired.remove(&name).unwrap_or_default();

            for (key, fields) in &wanted {
                if current.get(key) != Some(fields) {
                    events.push(ConfigEvent::set(&name, key, fields.clone()));
                }
            }
            for key in current.keys() {
                if !wanted.contains_key(key) {
                    events.push(ConfigEvent::del(&name, key));
                }
            }

            if !wanted.is_empty() {
                inner.tables.insert(name, wanted);
            }
        }

        let count = events.len();
        for event in events {
            inner.notify(event);
        }
        count
    }

    /// Number of live subscriptions (pruned lazily on the next notification).
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl ConfigSource for MemoryConfigStore {
    fn get_table(&self, table: &str) -> TableEntries {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    fn get_entry(&self, table: &str, key: &str) -> Option<FieldMap> {
        self.lock().tables.get(table)?.get(key).cloned()
    }
}

impl ConfigProvider for MemoryConfigStore {
    fn snapshot(&self, tables: &[&str]) -> ConfigSnapshot {
        let inner = self.lock();
        let mut snapshot = ConfigSnapshot::new();
        for &name in tables {
            if let Some(entries) = inner.tables.get(name) {
                snapshot = snapshot.with_table(name, entries.clone());
            }
        }
        snapshot
    }

    fn subscribe(&self, tables: &[&str]) -> Subscription {
        let (tx, subscription) = Subscription::channel();
        self.lock().subscribers.push(Subscriber {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            tx,
        });
        subscription
    }
}

impl std::fmt::Debug for MemoryConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryConfigStore")
            .field("tables", &inner.tables.keys().collect::<Vec<_>>())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::{field_map, Operation};

    fn drain(sub: &Subscription) -> Vec<ConfigEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.try_recv().unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn set_and_read_entry() {
        let store = MemoryConfigStore::new();
        store.set_entry("CONSOLE_PORT", "1", field_map([("baud_rate", "9600")]));

        assert_eq!(store.get_table("CONSOLE_PORT").len(), 1);
        assert_eq!(
            store.get_entry("CONSOLE_PORT", "1"),
            Some(field_map([("baud_rate", "9600")]))
        );
        assert!(store.get_entry("CONSOLE_PORT", "2").is_none());
    }

    #[test]
    fn subscribers_receive_only_their_tables() {
        let store = MemoryConfigStore::new();
        let ports = store.subscribe(&["CONSOLE_PORT"]);
        let switch = store.subscribe(&["CONSOLE_SWITCH"]);

        store.set_field("CONSOLE_SWITCH", "console_mgmt", "enabled", "yes");

        assert!(drain(&ports).is_empty());
        let events = drain(&switch);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "console_mgmt");
        assert_eq!(events[0].op, Operation::Set);
        assert_eq!(events[0].fields, field_map([("enabled", "yes")]));
    }

    #[test]
    fn set_field_merges() {
        let store = MemoryConfigStore::new();
        store.set_field("T", "k", "a", "1");
        store.set_field("T", "k", "b", "2");
        assert_eq!(
            store.get_entry("T", "k"),
            Some(field_map([("a", "1"), ("b", "2")]))
        );
    }

    #[test]
    fn del_entry_notifies_once() {
        let store = MemoryConfigStore::new();
        store.set_entry("T", "k", FieldMap::new());
        let sub = store.subscribe(&["T"]);

        store.del_entry("T", "k");
        store.del_entry("T", "k");

        let events = drain(&sub);
        assert_eq!(events, vec![ConfigEvent::del("T", "k")]);
    }

    #[test]
    fn apply_snapshot_emits_diff() {
        let store = MemoryConfigStore::from_snapshot(
            ConfigSnapshot::new()
                .with_entry("P", "1", field_map([("baud_rate", "9600")]))
                .with_entry("P", "2", field_map([("baud_rate", "9600")])),
        );
        let sub = store.subscribe(&["P"]);

        let changed = store.apply_snapshot(
            ConfigSnapshot::new()
                .with_entry("P", "1", field_map([("baud_rate", "9600")]))
                .with_entry("P", "3", field_map([("baud_rate", "115200")])),
        );

        assert_eq!(changed, 2);
        let events = drain(&sub);
        assert!(events.contains(&ConfigEvent::set(
            "P",
            "3",
            field_map([("baud_rate", "115200")])
        )));
        assert!(events.contains(&ConfigEvent::del("P", "2")));
        assert_eq!(store.get_table("P").len(), 2);
    }

    #[test]
    fn apply_snapshot_empties_missing_tables() {
        let store = MemoryConfigStore::from_snapshot(
            ConfigSnapshot::new().with_entry("P", "1", FieldMap::new()),
        );
        assert_eq!(store.apply_snapshot(ConfigSnapshot::new()), 1);
        assert!(store.get_table("P").is_empty());
    }

    #[test]
    fn apply_identical_snapshot_is_silent() {
        let snapshot = ConfigSnapshot::new().with_entry("P", "1", field_map([("x", "y")]));
        let store = MemoryConfigStore::from_snapshot(snapshot.clone());
        let sub = store.subscribe(&["P"]);
        assert_eq!(store.apply_snapshot(snapshot), 0);
        assert!(drain(&sub).is_empty());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let store = MemoryConfigStore::new();
        let sub = store.subscribe(&["T"]);
        assert_eq!(store.subscriber_count(), 1);
        drop(sub);
        store.set_field("T", "k", "f", "v");
        assert_eq!(store.subscriber_count(), 0);
    }

    #[test]
    fn snapshot_contains_requested_tables() {
        let store = MemoryConfigStore::new();
        store.set_field("A", "k", "f", "v");
        store.set_field("B", "k", "f", "v");
        let snapshot = store.snapshot(&["A", "C"]);
        assert!(snapshot.table("A").is_some());
        assert!(snapshot.table("B").is_none());
        assert!(snapshot.table("C").is_none());
    }

    #[test]
    fn events_cross_threads() {
        let store = MemoryConfigStore::new();
        let sub = store.subscribe(&["T"]);
        let writer = store.clone();
        std::thread::spawn(move || writer.set_field("T", "k", "f", "v"))
            .join()
            .unwrap();
        let event = sub.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(event.key, "k");
    }
}
