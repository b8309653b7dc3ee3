// SPDX-License-Identifier: GPL-3.0-only

//! Retried filesystem label/type lookup via blkid.
//!
//! Right after a hotplug add event the superblock is often not readable
//! yet (udev settle race), so the lookup retries with a short delay and
//! only gives up after several attempts.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Result, SysError};

pub const PROBE_RETRIES: u32 = 5;
pub const PROBE_DELAY: Duration = Duration::from_millis(500);

/// Look up `(label, fstype)` for a device node.
///
/// Returns `(None, None)` when no filesystem type could be determined
/// after all retries; callers must treat that as "unknown filesystem, do
/// not mount", not as an error.
pub async fn probe(devnode: &str) -> Result<(Option<String>, Option<String>)> {
    probe_with(devnode, PROBE_RETRIES, PROBE_DELAY).await
}

pub async fn probe_with(
    devnode: &str,
    retries: u32,
    delay: Duration,
) -> Result<(Option<String>, Option<String>)> {
    let blkid = which::which("blkid").map_err(|_| SysError::ToolMissing("blkid".into()))?;

    for attempt in 1..=retries {
        let fstype = blkid_value(&blkid, "TYPE", devnode).await;
        if fstype.is_some() {
            let label = blkid_value(&blkid, "LABEL", devnode).await;
            debug!(devnode, ?label, ?fstype, attempt, "filesystem probe complete");
            return Ok((label, fstype));
        }
        if attempt < retries {
            tokio::time::sleep(delay).await;
        }
    }

    warn!(devnode, retries, "no filesystem type found, treating as unmountable");
    Ok((None, None))
}

async fn blkid_value(blkid: &Path, tag: &str, devnode: &str) -> Option<String> {
    let output = Command::new(blkid)
        .args(["-s", tag, "-o", "value", devnode])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}
