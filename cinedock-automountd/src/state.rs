// SPDX-License-Identifier: GPL-3.0-only

//! The one shared state object.
//!
//! Every worker (udev consumer, CFE HAT poller, both watchdogs, the
//! signal handler) mutates device state exclusively through a single
//! `Mutex<StorageState>`, so hotplug events, latch edges and watchdog
//! ticks can never interleave against each other.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use cinedock_types::MountRecord;
use cinedock_sys::vm::VmSnapshot;

use crate::config::MOUNT_COOLDOWN;

#[derive(Default)]
pub struct StorageState {
    /// devnode -> tracked mount. At most one entry per devnode; no two
    /// entries share a mountpoint.
    mounts: BTreeMap<String, MountRecord>,
    /// devnode -> time of the last failed mount attempt.
    cooldown: HashMap<String, Instant>,
    /// Devices currently labeled as raw recording candidates.
    raw_pool: BTreeSet<String>,
    /// The single active raw target; always a pool member with a mount.
    pub active_raw: Option<String>,
    /// Devices whose mount applied VM cushioning.
    tuned: BTreeSet<String>,
    /// Pre-tuning sysctl values, held while the tuned set is nonempty.
    vm_snapshot: Option<VmSnapshot>,
}

impl StorageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tracked(&self, devnode: &str) -> bool {
        self.mounts.contains_key(devnode)
    }

    pub fn record(&self, devnode: &str) -> Option<&MountRecord> {
        self.mounts.get(devnode)
    }

    pub fn insert_record(&mut self, record: MountRecord) {
        debug_assert!(
            !self
                .mounts
                .values()
                .any(|r| r.mountpoint == record.mountpoint && r.devnode != record.devnode),
            "duplicate mountpoint {:?}",
            record.mountpoint
        );
        self.mounts.insert(record.devnode.clone(), record);
    }

    pub fn remove_record(&mut self, devnode: &str) -> Option<MountRecord> {
        self.mounts.remove(devnode)
    }

    pub fn tracked_devnodes(&self) -> Vec<String> {
        self.mounts.keys().cloned().collect()
    }

    pub fn tracked_records(&self) -> Vec<MountRecord> {
        self.mounts.values().cloned().collect()
    }

    // ---- failure cooldown ------------------------------------------------

    /// Purge expired entries, then report whether the device is cooling
    /// down. Expired entries must never influence a mount decision.
    pub fn in_cooldown(&mut self, devnode: &str, now: Instant) -> bool {
        self.purge_cooldown(now);
        self.cooldown.contains_key(devnode)
    }

    pub fn set_cooldown(&mut self, devnode: &str, now: Instant) {
        self.cooldown.insert(devnode.to_string(), now);
    }

    pub fn purge_cooldown(&mut self, now: Instant) {
        self.cooldown
            .retain(|_, failed_at| now.duration_since(*failed_at) < MOUNT_COOLDOWN);
    }

    /// Explicit user action (reseating the CFE card) overrides cooldown.
    pub fn clear_nvme_cooldowns(&mut self) {
        self.cooldown
            .retain(|devnode, _| !devnode.contains("nvme"));
    }

    // ---- raw pool --------------------------------------------------------

    pub fn register_raw(&mut self, devnode: &str) -> bool {
        self.raw_pool.insert(devnode.to_string())
    }

    pub fn unregister_raw(&mut self, devnode: &str) -> bool {
        self.raw_pool.remove(devnode)
    }

    pub fn raw_pool_contains(&self, devnode: &str) -> bool {
        self.raw_pool.contains(devnode)
    }

    pub fn clear_raw_pool(&mut self) {
        self.raw_pool.clear();
    }

    /// Arbitration winner: the lexicographically greatest pool member.
    /// Deliberately exactly that ordering, for compatibility.
    pub fn best_raw(&self) -> Option<String> {
        self.raw_pool.iter().next_back().cloned()
    }

    // ---- sysctl cushion bracketing ---------------------------------------

    /// Note a device as tuned; returns true on the empty->nonempty
    /// transition, i.e. when the pre-tuning snapshot must be captured.
    pub fn note_tuned(&mut self, devnode: &str) -> bool {
        let was_empty = self.tuned.is_empty();
        self.tuned.insert(devnode.to_string());
        was_empty
    }

    /// Forget a device's tuning; returns true on the nonempty->empty
    /// transition, i.e. when the snapshot must be restored.
    pub fn note_untuned(&mut self, devnode: &str) -> bool {
        self.tuned.remove(devnode) && self.tuned.is_empty()
    }

    pub fn set_vm_snapshot(&mut self, snap: VmSnapshot) {
        self.vm_snapshot = Some(snap);
    }

    pub fn has_vm_snapshot(&self) -> bool {
        self.vm_snapshot.is_some()
    }

    pub fn take_vm_snapshot(&mut self) -> Option<VmSnapshot> {
        self.vm_snapshot.take()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use cinedock_types::MediaKind;

    use super::*;

    fn record(devnode: &str, mountpoint: &str) -> MountRecord {
        MountRecord {
            devnode: devnode.to_string(),
            mountpoint: PathBuf::from(mountpoint),
            kind: MediaKind::UsbSsd,
        }
    }

    #[test]
    fn one_record_per_devnode() {
        let mut st = StorageState::new();
        st.insert_record(record("/dev/sda1", "/media/A"));
        st.insert_record(record("/dev/sda1", "/media/B"));
        assert_eq!(st.tracked_devnodes(), vec!["/dev/sda1".to_string()]);
        assert_eq!(
            st.record("/dev/sda1").map(|r| r.mountpoint.clone()),
            Some(PathBuf::from("/media/B"))
        );
    }

    #[test]
    fn cooldown_expires_after_thirty_seconds() {
        let mut st = StorageState::new();
        let start = Instant::now();
        st.set_cooldown("/dev/sda1", start);

        let before_expiry = start + Duration::from_secs(29);
        assert!(st.in_cooldown("/dev/sda1", before_expiry));

        let after_expiry = start + Duration::from_secs(31);
        assert!(!st.in_cooldown("/dev/sda1", after_expiry));
        // The entry is gone, not just hidden.
        assert!(!st.in_cooldown("/dev/sda1", before_expiry));
    }

    #[test]
    fn reseating_the_card_clears_only_nvme_cooldowns() {
        let mut st = StorageState::new();
        let now = Instant::now();
        st.set_cooldown("/dev/nvme0n1p1", now);
        st.set_cooldown("/dev/sda1", now);
        st.clear_nvme_cooldowns();
        assert!(!st.in_cooldown("/dev/nvme0n1p1", now));
        assert!(st.in_cooldown("/dev/sda1", now));
    }

    #[test]
    fn arbitration_picks_the_lexicographically_greatest_candidate() {
        let mut st = StorageState::new();
        st.register_raw("/dev/nvme0n1p1");
        st.register_raw("/dev/nvme1n1p1");
        assert_eq!(st.best_raw().as_deref(), Some("/dev/nvme1n1p1"));

        st.unregister_raw("/dev/nvme1n1p1");
        assert_eq!(st.best_raw().as_deref(), Some("/dev/nvme0n1p1"));

        st.unregister_raw("/dev/nvme0n1p1");
        assert_eq!(st.best_raw(), None);
    }

    #[test]
    fn tuned_set_transitions_bracket_snapshot_lifecycle() {
        let mut st = StorageState::new();
        assert!(st.note_tuned("/dev/sda1"), "first tune captures");
        assert!(!st.note_tuned("/dev/sdb1"), "second tune does not");

        assert!(!st.note_untuned("/dev/sda1"), "set still nonempty");
        assert!(st.note_untuned("/dev/sdb1"), "last untune restores");
        assert!(!st.note_untuned("/dev/sdb1"), "double untune is a no-op");
    }
}
