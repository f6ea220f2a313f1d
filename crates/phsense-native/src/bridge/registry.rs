//! Device registry.
//!
//! The registry is the only shared mutable record of what the host knows
//! about nearby sensors. Writers go through find-or-insert
//! ([`DeviceRegistry::record_sighting`]) or find-and-update
//! ([`DeviceRegistry::update`]) keyed by id; records are never removed or
//! replaced wholesale. Insertion order is preserved.

use std::ops::Deref;
use std::sync::Arc;

use phsense_core::types::{sorted_for_display, DeviceId, DeviceRecord};

/// Outcome of recording an advertisement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegistryChange {
    /// A new record was created
    Inserted,
    /// An existing record learned its name
    Updated,
    /// Nothing changed
    Unchanged,
}

impl RegistryChange {
    /// Whether observers need a new snapshot.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Ordered collection of device records keyed by id.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    records: Vec<DeviceRecord>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no device has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    /// Whether the id is known.
    #[must_use]
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.get(id).is_some()
    }

    /// Insert a record for `id` if absent.
    ///
    /// Existing records keep their `connected` and `last_value`; the only
    /// thing a repeat sighting may do is fill in a name that was missing.
    pub fn record_sighting(
        &mut self,
        id: &DeviceId,
        name: Option<&str>,
        rssi: Option<i16>,
    ) -> RegistryChange {
        if let Some(existing) = self.records.iter_mut().find(|r| &r.id == id) {
            return match (existing.name.is_none(), name) {
                (true, Some(name)) => {
                    existing.name = Some(name.to_string());
                    RegistryChange::Updated
                }
                _ => RegistryChange::Unchanged,
            };
        }

        self.records.push(DeviceRecord::discovered(
            id.clone(),
            name.map(str::to_string),
            rssi,
        ));
        RegistryChange::Inserted
    }

    /// Apply `f` to the record for `id`. Returns false if the id is unknown.
    pub fn update<F>(&mut self, id: &DeviceId, f: F) -> bool
    where
        F: FnOnce(&mut DeviceRecord),
    {
        match self.records.iter_mut().find(|r| &r.id == id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Set the connected flag. Returns true if the flag changed.
    pub fn set_connected(&mut self, id: &DeviceId, connected: bool) -> bool {
        let mut changed = false;
        self.update(id, |r| {
            changed = r.connected != connected;
            r.connected = connected;
        });
        changed
    }

    /// Store a decoded sample. Returns false if the id is unknown.
    pub fn set_last_value(&mut self, id: &DeviceId, value: f32) -> bool {
        self.update(id, |r| r.last_value = value)
    }

    /// The connected record, if any.
    #[must_use]
    pub fn active(&self) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.connected)
    }

    /// Iterate records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.iter()
    }

    /// Immutable copy for observers.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot(self.records.as_slice().into())
    }
}

/// Immutable copy of the registry handed to observers.
///
/// Cloning is cheap; the records are shared behind an `Arc`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrySnapshot(Arc<[DeviceRecord]>);

impl RegistrySnapshot {
    /// The connected record, if any.
    #[must_use]
    pub fn active(&self) -> Option<&DeviceRecord> {
        self.0.iter().find(|r| r.connected)
    }

    /// Look up a record by id.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.0.iter().find(|r| &r.id == id)
    }

    /// Named devices sorted by name, for pickers.
    #[must_use]
    pub fn sorted_for_display(&self) -> Vec<DeviceRecord> {
        sorted_for_display(&self.0)
    }
}

impl Deref for RegistrySnapshot {
    type Target = [DeviceRecord];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s)
    }

    #[test]
    fn test_insert_if_absent() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(
            registry.record_sighting(&id("a"), Some("pH-A"), Some(-50)),
            RegistryChange::Inserted
        );
        assert_eq!(
            registry.record_sighting(&id("a"), Some("pH-A"), Some(-40)),
            RegistryChange::Unchanged
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id("a")).unwrap().rssi, Some(-50));
    }

    #[test]
    fn test_resighting_preserves_state() {
        let mut registry = DeviceRegistry::new();
        registry.record_sighting(&id("a"), None, None);
        registry.set_connected(&id("a"), true);
        registry.set_last_value(&id("a"), 6.8);

        assert_eq!(
            registry.record_sighting(&id("a"), Some("pH-A"), None),
            RegistryChange::Updated
        );
        assert_eq!(
            registry.record_sighting(&id("a"), Some("Renamed"), None),
            RegistryChange::Unchanged
        );

        let record = registry.get(&id("a")).unwrap();
        assert!(record.connected);
        assert_eq!(record.last_value, 6.8);
        assert_eq!(record.name.as_deref(), Some("pH-A"));
    }

    #[test]
    fn test_insertion_order() {
        let mut registry = DeviceRegistry::new();
        for name in ["c", "a", "b"] {
            registry.record_sighting(&id(name), Some(name), None);
        }
        let ids: Vec<&str> = registry.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_update_unknown_id() {
        let mut registry = DeviceRegistry::new();
        assert!(!registry.set_last_value(&id("ghost"), 7.0));
        assert!(!registry.set_connected(&id("ghost"), true));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_connected_reports_change() {
        let mut registry = DeviceRegistry::new();
        registry.record_sighting(&id("a"), None, None);
        assert!(registry.set_connected(&id("a"), true));
        assert!(!registry.set_connected(&id("a"), true));
        assert_eq!(registry.active().map(|r| r.id.as_str()), Some("a"));
        assert!(registry.set_connected(&id("a"), false));
        assert!(registry.active().is_none());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut registry = DeviceRegistry::new();
        registry.record_sighting(&id("a"), Some("pH-A"), None);
        let snapshot = registry.snapshot();

        registry.set_last_value(&id("a"), 9.0);
        registry.record_sighting(&id("b"), None, None);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&id("a")).unwrap().last_value, 0.0);
    }
}
