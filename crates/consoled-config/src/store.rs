use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Field name to value map of one table entry.
pub type FieldMap = BTreeMap<String, String>;

/// Entry key to fields map of one table.
pub type TableEntries = BTreeMap<String, FieldMap>;

/// Build a [`FieldMap`] from string pairs.
pub fn field_map<I, K, V>(pairs: I) -> FieldMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Full contents of a set of tables at one point in time.
///
/// Serializes as `{ "TABLE": { "key": { "field": "value" } } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSnapshot {
    tables: BTreeMap<String, TableEntries>,
}

impl ConfigSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one entry.
    pub fn with_entry(mut self, table: &str, key: &str, fields: FieldMap) -> Self {
        self.insert_entry(table, key, fields);
        self
    }

    /// Add or replace one entry in place.
    pub fn insert_entry(&mut self, table: &str, key: &str, fields: FieldMap) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), fields);
    }

    /// Add or replace a whole table.
    pub fn with_table(mut self, table: &str, entries: TableEntries) -> Self {
        self.tables.insert(table.to_string(), entries);
        self
    }

    /// Borrow one table.
    pub fn table(&self, table: &str) -> Option<&TableEntries> {
        self.tables.get(table)
    }

    /// Iterate over all tables.
    pub fn tables(&self) -> impl Iterator<Item = (&String, &TableEntries)> {
        self.tables.iter()
    }

    /// Keep only the named tables.
    pub fn retain_tables(&mut self, names: &[&str]) {
        self.tables.retain(|name, _| names.contains(&name.as_str()));
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|entries| entries.is_empty())
    }

    pub(crate) fn into_tables(self) -> BTreeMap<String, TableEntries> {
        self.tables
    }
}

/// Kind of mutation reported by a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Set,
    Del,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Set => f.write_str("SET"),
            Operation::Del => f.write_str("DEL"),
        }
    }
}

/// One change notification: `{table, entry_key, operation, field_map}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEvent {
    pub table: String,
    pub key: String,
    pub op: Operation,
    /// Changed fields for `Set`; empty for `Del`.
    pub fields: FieldMap,
}

impl ConfigEvent {
    pub fn set(table: &str, key: &str, fields: FieldMap) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            op: Operation::Set,
            fields,
        }
    }

    pub fn del(table: &str, key: &str) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            op: Operation::Del,
            fields: FieldMap::new(),
        }
    }
}

/// Read side of a configuration store.
///
/// Reads never fail: a missing table or entry is reported as empty / `None`.
pub trait ConfigSource {
    /// All entries of a table.
    fn get_table(&self, table: &str) -> TableEntries;

    /// One entry of a table.
    fn get_entry(&self, table: &str, key: &str) -> Option<FieldMap> {
        self.get_table(table).remove(key)
    }
}

/// A live configuration store: snapshot reads plus change subscriptions.
pub trait ConfigProvider: ConfigSource + Send + Sync {
    /// Contents of the named tables right now.
    fn snapshot(&self, tables: &[&str]) -> ConfigSnapshot;

    /// Receive every later change to the named tables.
    fn subscribe(&self, tables: &[&str]) -> Subscription;
}

impl ConfigSource for ConfigSnapshot {
    fn get_table(&self, table: &str) -> TableEntries {
        self.tables.get(table).cloned().unwrap_or_default()
    }

    fn get_entry(&self, table: &str, key: &str) -> Option<FieldMap> {
        self.tables.get(table)?.get(key).cloned()
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for &T {
    fn get_table(&self, table: &str) -> TableEntries {
        (**self).get_table(table)
    }

    fn get_entry(&self, table: &str, key: &str) -> Option<FieldMap> {
        (**self).get_entry(table, key)
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for Arc<T> {
    fn get_table(&self, table: &str) -> TableEntries {
        (**self).get_table(table)
    }

    fn get_entry(&self, table: &str, key: &str) -> Option<FieldMap> {
        (**self).get_entry(table, key)
    }
}

impl<T: ConfigProvider + ?Sized> ConfigProvider for Arc<T> {
    fn snapshot(&self, tables: &[&str]) -> ConfigSnapshot {
        (**self).snapshot(tables)
    }

    fn subscribe(&self, tables: &[&str]) -> Subscription {
        (**self).subscribe(tables)
    }
}

/// Receiving end of a change subscription.
///
/// Events are delivered in mutation order on a single queue, so a consumer
/// draining one subscription handles them strictly one at a time.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<ConfigEvent>,
}

impl Subscription {
    /// Create a connected sender / subscription pair.
    pub fn channel() -> (mpsc::Sender<ConfigEvent>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// Returns `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ConfigEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ConfigError::SubscriptionClosed),
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&self) -> Result<Option<ConfigEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ConfigError::SubscriptionClosed),
        }
    }
}
