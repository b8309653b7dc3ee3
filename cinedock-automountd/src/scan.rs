// SPDX-License-Identifier: GPL-3.0-only

//! Boot-time device scan.
//!
//! Runs once, before any event source is armed, so the daemon reaches a
//! deterministic state that live events cannot race: stale mountpoints
//! removed, every present device either mounted or registered, and one
//! raw target arbitrated with the same tie-break the live path uses.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use cinedock_sys::{blockdev, mountfs, probe};

use crate::config::{media_root, RAW_LABEL};
use crate::raw;
use crate::Shared;

pub async fn initial_scan(daemon: &Shared) {
    purge_stale_mountpoints(media_root());

    let mut candidates = blockdev::list_partitions();
    let mut whole_disks = blockdev::list_disks_without_partitions();
    info!(
        partitions = candidates.len(),
        whole_disks = whole_disks.len(),
        "initial device scan"
    );
    candidates.append(&mut whole_disks);

    let mut raw_candidates: Vec<String> = Vec::new();
    let mut st = daemon.state.lock().await;

    for devnode in candidates {
        let label = match probe::probe(&devnode).await {
            Ok((label, Some(_fstype))) => label,
            Ok((_, None)) => {
                debug!(devnode, "no filesystem, skipping");
                continue;
            }
            Err(err) => {
                warn!(devnode, error = %err, "probe failed, skipping");
                continue;
            }
        };

        if label.as_deref() == Some(RAW_LABEL) {
            raw_candidates.push(devnode);
        } else {
            daemon.mounter.mount(&mut st, &devnode).await;
        }
    }

    for devnode in &raw_candidates {
        st.register_raw(devnode);
    }
    raw::arbitrate(&daemon.mounter, &mut st).await;

    info!(
        mounted = st.tracked_devnodes().len(),
        raw_candidates = raw_candidates.len(),
        active_raw = st.active_raw.as_deref().unwrap_or("none"),
        "initial scan complete"
    );
}

/// Remove leftovers of an unclean shutdown: directories under the media
/// root that are not current mountpoints and are empty.
fn purge_stale_mountpoints(root: &Path) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || mountfs::is_mountpoint(&path) {
            continue;
        }
        match fs::remove_dir(&path) {
            Ok(()) => info!(path = %path.display(), "removed stale mountpoint"),
            Err(err) => debug!(path = %path.display(), error = %err, "stale mountpoint left in place"),
        }
    }
}
