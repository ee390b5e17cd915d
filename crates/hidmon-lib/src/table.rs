//! Device table — the authoritative list of attached devices.
//!
//! Every mutation happens inside one mutex and returns the change it made,
//! stamped with a sequence number taken under the same lock. The caller
//! enqueues that change for fan-out after the lock is released, and the
//! dispatcher uses the sequence numbers to restore mutation order.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::device::{DeviceDescriptor, DeviceIdentity, PlatformHandle};

/// Table change as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "device", rename_all = "lowercase")]
pub enum DeviceEvent {
    /// A device was added, or an existing entry was refreshed in place.
    Arrived(DeviceDescriptor),
    /// A device left the table. Carries the last known descriptor.
    Departed(DeviceDescriptor),
}

impl DeviceEvent {
    pub fn device(&self) -> &DeviceDescriptor {
        match self {
            DeviceEvent::Arrived(d) | DeviceEvent::Departed(d) => d,
        }
    }

    pub fn is_arrival(&self) -> bool {
        matches!(self, DeviceEvent::Arrived(_))
    }
}

/// A mutation result waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableChange {
    pub seq: u64,
    pub event: DeviceEvent,
}

#[derive(Debug, Default)]
struct TableState {
    devices: Vec<DeviceDescriptor>,
    frozen: bool,
    next_seq: u64,
}

impl TableState {
    fn stamp(&mut self, event: DeviceEvent) -> TableChange {
        let seq = self.next_seq;
        self.next_seq += 1;
        TableChange { seq, event }
    }

    fn position(&self, identity: &DeviceIdentity) -> Option<usize> {
        self.devices.iter().position(|d| d.identity() == *identity)
    }
}

/// Ordered, lock-guarded collection of [`DeviceDescriptor`]s.
#[derive(Debug, Default)]
pub struct DeviceTable {
    state: Mutex<TableState>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the Vec half-updated, so a
    // poisoned guard is still usable.
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point-in-time copy of the table.
    pub fn snapshot(&self) -> Vec<DeviceDescriptor> {
        self.lock().devices.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().devices.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// Sequence number the next change will get.
    pub(crate) fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    /// Insert a new device or refresh an existing entry with the same identity.
    ///
    /// Returns `None` when nothing changed (identical re-arrival, frozen table).
    pub(crate) fn insert_or_update(&self, device: DeviceDescriptor) -> Option<TableChange> {
        let mut state = self.lock();
        if state.frozen {
            return None;
        }
        match state.position(&device.identity()) {
            Some(i) if state.devices[i] == device => None,
            Some(i) => {
                state.devices[i] = device.clone();
                Some(state.stamp(DeviceEvent::Arrived(device)))
            }
            None => {
                state.devices.push(device.clone());
                Some(state.stamp(DeviceEvent::Arrived(device)))
            }
        }
    }

    /// Remove the entry with this identity. Unknown identities are a no-op.
    pub(crate) fn remove_by_identity(&self, identity: &DeviceIdentity) -> Option<TableChange> {
        let mut state = self.lock();
        if state.frozen {
            return None;
        }
        let i = state.position(identity)?;
        let removed = state.devices.remove(i);
        Some(state.stamp(DeviceEvent::Departed(removed)))
    }

    /// Remove every entry reached through `handle`.
    ///
    /// Removal notifications on some platforms only carry the handle, not
    /// the full identity.
    pub(crate) fn remove_by_handle(&self, handle: &PlatformHandle) -> Vec<TableChange> {
        let mut state = self.lock();
        if state.frozen {
            return Vec::new();
        }
        let mut changes = Vec::new();
        let mut i = 0;
        while i < state.devices.len() {
            if state.devices[i].handle == *handle {
                let removed = state.devices.remove(i);
                changes.push(state.stamp(DeviceEvent::Departed(removed)));
            } else {
                i += 1;
            }
        }
        changes
    }

    /// Make the table match a full enumeration.
    ///
    /// Entries missing from `devices` depart first (in table order), then
    /// new or changed entries arrive (in enumeration order). Duplicate
    /// identities inside `devices` collapse to the last one.
    pub(crate) fn reconcile(&self, devices: Vec<DeviceDescriptor>) -> Vec<TableChange> {
        let mut state = self.lock();
        if state.frozen {
            return Vec::new();
        }
        let mut changes = Vec::new();

        let wanted: Vec<DeviceIdentity> = devices.iter().map(|d| d.identity()).collect();
        let mut i = 0;
        while i < state.devices.len() {
            if wanted.contains(&state.devices[i].identity()) {
                i += 1;
            } else {
                let removed = state.devices.remove(i);
                changes.push(state.stamp(DeviceEvent::Departed(removed)));
            }
        }

        for device in devices {
            match state.position(&device.identity()) {
                Some(i) if state.devices[i] == device => {}
                Some(i) => {
                    state.devices[i] = device.clone();
                    changes.push(state.stamp(DeviceEvent::Arrived(device)));
                }
                None => {
                    state.devices.push(device.clone());
                    changes.push(state.stamp(DeviceEvent::Arrived(device)));
                }
            }
        }
        changes
    }

    /// Stop accepting mutations. Queries keep returning the last contents.
    pub(crate) fn freeze(&self) {
        self.lock().frozen = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(pid: u16, path: &str, serial: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x20a0,
            product_id: pid,
            serial_number: serial.into(),
            handle: PlatformHandle::Path(path.into()),
            ..Default::default()
        }
    }

    // ── insert_or_update ──

    #[test]
    fn insert_then_remove() {
        let t = DeviceTable::new();
        let d = dev(0x415a, "/dev/hidraw0", "");
        let c = t.insert_or_update(d.clone()).unwrap();
        assert_eq!(c.seq, 0);
        assert_eq!(c.event, DeviceEvent::Arrived(d.clone()));
        assert_eq!(t.snapshot(), vec![d.clone()]);

        let c = t.remove_by_identity(&d.identity()).unwrap();
        assert_eq!(c.seq, 1);
        assert_eq!(c.event, DeviceEvent::Departed(d));
        assert!(t.is_empty());
    }

    #[test]
    fn rearrival_updates_in_place() {
        let t = DeviceTable::new();
        t.insert_or_update(dev(0x415a, "p", "A"));
        t.insert_or_update(dev(0x415b, "q", ""));
        let c = t.insert_or_update(dev(0x415a, "p", "B")).unwrap();
        assert!(c.event.is_arrival());

        let snap = t.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].serial_number, "B", "position is preserved");
    }

    #[test]
    fn identical_rearrival_is_silent() {
        let t = DeviceTable::new();
        t.insert_or_update(dev(0x415a, "p", "A"));
        assert!(t.insert_or_update(dev(0x415a, "p", "A")).is_none());
        assert_eq!(t.len(), 1);
        assert_eq!(t.next_seq(), 1);
    }

    // ── removal ──

    #[test]
    fn remove_unknown_is_noop() {
        let t = DeviceTable::new();
        t.insert_or_update(dev(0x415a, "p", ""));
        assert!(t.remove_by_identity(&dev(0x415a, "other", "").identity()).is_none());
        assert!(t.remove_by_handle(&PlatformHandle::Path("nope".into())).is_empty());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn remove_by_handle_takes_all_interfaces() {
        let t = DeviceTable::new();
        let mut a = dev(0x415a, "p", "");
        a.usage = 1;
        let mut b = dev(0x415a, "p", "");
        b.usage = 2;
        t.insert_or_update(a);
        t.insert_or_update(b);
        t.insert_or_update(dev(0x415c, "q", ""));

        let changes = t.remove_by_handle(&PlatformHandle::Path("p".into()));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].seq + 1, changes[1].seq);
        assert_eq!(t.len(), 1);
    }

    // ── reconcile ──

    #[test]
    fn reconcile_adds_updates_and_removes() {
        let t = DeviceTable::new();
        t.insert_or_update(dev(0x415a, "keep", "old"));
        t.insert_or_update(dev(0x415b, "gone", ""));

        let changes = t.reconcile(vec![dev(0x415a, "keep", "new"), dev(0x415c, "fresh", "")]);
        let kinds: Vec<_> = changes
            .iter()
            .map(|c| (c.event.is_arrival(), c.event.device().handle.to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (false, "gone".to_string()),
                (true, "keep".to_string()),
                (true, "fresh".to_string()),
            ]
        );
        let snap = t.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].serial_number, "new");
    }

    #[test]
    fn reconcile_unchanged_emits_nothing() {
        let t = DeviceTable::new();
        t.reconcile(vec![dev(0x415a, "p", "")]);
        assert!(t.reconcile(vec![dev(0x415a, "p", "")]).is_empty());
    }

    #[test]
    fn reconcile_collapses_duplicates() {
        let t = DeviceTable::new();
        t.reconcile(vec![dev(0x415a, "p", "A"), dev(0x415a, "p", "B")]);
        let snap = t.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].serial_number, "B");
    }

    // ── freeze ──

    #[test]
    fn frozen_table_rejects_mutations_but_answers_queries() {
        let t = DeviceTable::new();
        let d = dev(0x415a, "p", "");
        t.insert_or_update(d.clone());
        t.freeze();

        assert!(t.is_frozen());
        assert!(t.insert_or_update(dev(0x415b, "q", "")).is_none());
        assert!(t.remove_by_identity(&d.identity()).is_none());
        assert!(t.reconcile(Vec::new()).is_empty());
        assert_eq!(t.snapshot(), vec![d]);
    }

    #[test]
    fn sequence_numbers_are_contiguous() {
        let t = DeviceTable::new();
        let mut seqs = Vec::new();
        for i in 0..5u16 {
            seqs.push(t.insert_or_update(dev(0x415a, &i.to_string(), "")).unwrap().seq);
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }
}
