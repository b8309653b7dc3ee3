// SPDX-License-Identifier: GPL-3.0-only

//! VM dirty-page sysctl cushioning.
//!
//! Sustained high-bitrate writes stall badly when the kernel lets dirty
//! pages pile up to a percentage of RAM and then flushes them in one
//! burst. While recording media is mounted the daemon pins flushing to
//! byte thresholds with a short writeback interval; the pre-tuning values
//! are snapshotted once and restored when the last tuned mount goes away.

use std::fs;
use std::path::Path;

use cinedock_types::MediaProfile;
use tracing::debug;

use crate::Result;

const VM_SYSCTL_DIR: &str = "/proc/sys/vm";

const DIRTY_RATIO: &str = "dirty_ratio";
const DIRTY_BACKGROUND_RATIO: &str = "dirty_background_ratio";
const DIRTY_BYTES: &str = "dirty_bytes";
const DIRTY_BACKGROUND_BYTES: &str = "dirty_background_bytes";
const DIRTY_WRITEBACK_CENTISECS: &str = "dirty_writeback_centisecs";
const DIRTY_EXPIRE_CENTISECS: &str = "dirty_expire_centisecs";

/// 1.5s writeback interval while tuned.
const CUSHION_WRITEBACK_CENTISECS: &str = "150";
/// 30s expiry while tuned.
const CUSHION_EXPIRE_CENTISECS: &str = "3000";

/// Pre-tuning values of the six dirty-page sysctls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSnapshot {
    dirty_ratio: String,
    dirty_background_ratio: String,
    dirty_bytes: String,
    dirty_background_bytes: String,
    dirty_writeback_centisecs: String,
    dirty_expire_centisecs: String,
}

/// Capture the current dirty-page sysctls. Fails only if `/proc/sys/vm`
/// is unreadable, in which case the caller skips cushioning entirely
/// rather than risk restoring garbage later.
pub fn snapshot() -> Result<VmSnapshot> {
    Ok(VmSnapshot {
        dirty_ratio: read_sysctl(DIRTY_RATIO)?,
        dirty_background_ratio: read_sysctl(DIRTY_BACKGROUND_RATIO)?,
        dirty_bytes: read_sysctl(DIRTY_BYTES)?,
        dirty_background_bytes: read_sysctl(DIRTY_BACKGROUND_BYTES)?,
        dirty_writeback_centisecs: read_sysctl(DIRTY_WRITEBACK_CENTISECS)?,
        dirty_expire_centisecs: read_sysctl(DIRTY_EXPIRE_CENTISECS)?,
    })
}

/// Move flushing to byte-threshold governance with the profile's limits.
pub fn apply_cushions(profile: &MediaProfile) {
    write_sysctl(DIRTY_RATIO, "0");
    write_sysctl(DIRTY_BACKGROUND_RATIO, "0");
    write_sysctl(DIRTY_WRITEBACK_CENTISECS, CUSHION_WRITEBACK_CENTISECS);
    write_sysctl(DIRTY_EXPIRE_CENTISECS, CUSHION_EXPIRE_CENTISECS);
    write_sysctl(DIRTY_BYTES, &profile.dirty_bytes.to_string());
    write_sysctl(
        DIRTY_BACKGROUND_BYTES,
        &profile.dirty_background_bytes.to_string(),
    );
}

/// Put the snapshotted values back.
///
/// The kernel clears `dirty_bytes` when `dirty_ratio` is written and vice
/// versa, so the byte values go first and a nonzero ratio wins afterwards,
/// leaving whichever family the system originally used in force.
pub fn restore(snap: &VmSnapshot) {
    write_sysctl(DIRTY_WRITEBACK_CENTISECS, &snap.dirty_writeback_centisecs);
    write_sysctl(DIRTY_EXPIRE_CENTISECS, &snap.dirty_expire_centisecs);
    write_sysctl(DIRTY_BYTES, &snap.dirty_bytes);
    write_sysctl(DIRTY_BACKGROUND_BYTES, &snap.dirty_background_bytes);
    if snap.dirty_ratio != "0" {
        write_sysctl(DIRTY_RATIO, &snap.dirty_ratio);
    }
    if snap.dirty_background_ratio != "0" {
        write_sysctl(DIRTY_BACKGROUND_RATIO, &snap.dirty_background_ratio);
    }
}

fn read_sysctl(name: &str) -> Result<String> {
    let value = fs::read_to_string(Path::new(VM_SYSCTL_DIR).join(name))?;
    Ok(value.trim().to_string())
}

fn write_sysctl(name: &str, value: &str) {
    let path = Path::new(VM_SYSCTL_DIR).join(name);
    if let Err(err) = fs::write(&path, value) {
        debug!(path = %path.display(), value, error = %err, "sysctl write skipped");
    }
}
