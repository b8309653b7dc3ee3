// SPDX-License-Identifier: GPL-3.0-only

//! RAW target arbitration.
//!
//! Any number of devices may carry the raw-recording label, but exactly
//! one may be mounted as the active recording target at a time. Ties are
//! broken by the lexicographically greatest devnode string; that exact
//! ordering is load-bearing for compatibility and must not change.
//!
//! All functions take `&mut StorageState`, so the caller's hold on the
//! single state lock is what makes arbitration mutually exclusive.

use tracing::{info, warn};

use crate::mounter::Mounter;
use crate::state::StorageState;

/// Make `devnode` the active raw target (or clear it with `None`).
///
/// Idempotent when the target already is active: no unmount/mount pair
/// is issued.
pub async fn switch_to_raw(mounter: &Mounter, st: &mut StorageState, devnode: Option<&str>) {
    if st.active_raw.as_deref() == devnode {
        return;
    }

    if let Some(current) = st.active_raw.take() {
        info!(devnode = %current, "releasing active raw target");
        mounter.unmount(st, &current);
    }

    let Some(devnode) = devnode else {
        return;
    };

    if mounter.mount(st, devnode).await && st.is_tracked(devnode) {
        info!(devnode, "active raw target");
        st.active_raw = Some(devnode.to_string());
    } else {
        warn!(devnode, "raw candidate failed to mount, no active target");
    }
}

/// Add a raw candidate and re-arbitrate immediately, so a newly attached
/// device that wins the tie-break takes over at the moment of addition.
pub async fn register_and_arbitrate(mounter: &Mounter, st: &mut StorageState, devnode: &str) {
    if st.register_raw(devnode) {
        info!(devnode, "raw candidate registered");
    }
    arbitrate(mounter, st).await;
}

/// Point the active selection at the current pool winner.
pub async fn arbitrate(mounter: &Mounter, st: &mut StorageState) {
    let best = st.best_raw();
    if best.as_deref() != st.active_raw.as_deref() {
        switch_to_raw(mounter, st, best.as_deref()).await;
    }
}

/// Device disappeared (remove event, yank, controller death): drop it
/// from the pool and tracking, and fail over if it was the active target.
pub async fn handle_device_removal(mounter: &Mounter, st: &mut StorageState, devnode: &str) {
    if st.unregister_raw(devnode) {
        info!(devnode, "raw candidate unregistered");
    }
    let was_active = st.active_raw.as_deref() == Some(devnode);
    mounter.unmount(st, devnode);

    if was_active {
        st.active_raw = None;
        let next = st.best_raw();
        if let Some(next) = &next {
            info!(devnode, next = %next, "active raw target lost, failing over");
        } else {
            info!(devnode, "active raw target lost, pool empty");
        }
        switch_to_raw(mounter, st, next.as_deref()).await;
    }
}

/// Periodic correction pass: if asynchronous pool changes left the active
/// selection stale, move it to the current winner.
pub async fn self_heal(mounter: &Mounter, st: &mut StorageState) {
    arbitrate(mounter, st).await;
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use cinedock_types::{MediaKind, MountRecord};

    use crate::config::Owner;

    use super::*;

    fn mounter() -> Mounter {
        Mounter::new(
            Owner {
                uid: 1000,
                gid: 1000,
            },
            PathBuf::from("/media"),
        )
    }

    fn track(st: &mut StorageState, devnode: &str) {
        st.insert_record(MountRecord {
            devnode: devnode.to_string(),
            mountpoint: PathBuf::from("/media/RAW"),
            kind: MediaKind::CfeNvme,
        });
    }

    #[tokio::test]
    async fn switch_to_current_active_is_a_no_op() {
        let m = mounter();
        let mut st = StorageState::new();
        st.register_raw("/dev/nvme0n1p1");
        track(&mut st, "/dev/nvme0n1p1");
        st.active_raw = Some("/dev/nvme0n1p1".to_string());

        // Returns before any unmount/mount is issued.
        switch_to_raw(&m, &mut st, Some("/dev/nvme0n1p1")).await;

        assert_eq!(st.active_raw.as_deref(), Some("/dev/nvme0n1p1"));
        assert!(st.is_tracked("/dev/nvme0n1p1"));
    }

    #[tokio::test]
    async fn adding_a_lesser_candidate_does_not_preempt_the_active_target() {
        let m = mounter();
        let mut st = StorageState::new();
        st.register_raw("/dev/nvme1n1p1");
        track(&mut st, "/dev/nvme1n1p1");
        st.active_raw = Some("/dev/nvme1n1p1".to_string());

        // nvme0... sorts below nvme1..., so the winner is unchanged and
        // arbitration never touches a syscall.
        register_and_arbitrate(&m, &mut st, "/dev/nvme0n1p1").await;

        assert_eq!(st.active_raw.as_deref(), Some("/dev/nvme1n1p1"));
        assert!(st.raw_pool_contains("/dev/nvme0n1p1"));
    }
}
