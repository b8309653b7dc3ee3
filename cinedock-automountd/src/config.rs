// SPDX-License-Identifier: GPL-3.0-only

//! Environment-driven configuration and fixed operating constants.
//!
//! The daemon deliberately has no CLI surface: log verbosity comes from
//! `RUST_LOG`, the mountpoint owner from `CINEDOCK_UID`/`CINEDOCK_GID`.

use std::path::Path;
use std::time::Duration;

use tracing::warn;

/// Root under which all media mountpoints are created.
pub const MEDIA_ROOT: &str = "/media";

/// Volume label marking a device as the designated raw recording target.
pub const RAW_LABEL: &str = "RAW";

/// Suppression window after a failed mount attempt.
pub const MOUNT_COOLDOWN: Duration = Duration::from_secs(30);

/// Pause before probing a freshly announced device, letting udev settle.
pub const ADD_SETTLE: Duration = Duration::from_millis(200);

/// CFE HAT latch poll cadence.
pub const CFE_POLL: Duration = Duration::from_millis(50);

/// Enumeration settle after powering the CFE slot up.
pub const CFE_ENUM_SETTLE: Duration = Duration::from_millis(1000);

/// Pause between PCIe driver bind and bus rescan.
pub const CFE_BIND_SETTLE: Duration = Duration::from_millis(500);

/// NVMe controller-death watchdog period.
pub const NVME_WATCHDOG_PERIOD: Duration = Duration::from_millis(500);

/// Filesystem sanity watchdog period.
pub const SANITY_WATCHDOG_PERIOD: Duration = Duration::from_secs(3);

const DEFAULT_UID: u32 = 1000;
const DEFAULT_GID: u32 = 1000;

/// Uid/gid that own every mountpoint the daemon creates.
#[derive(Debug, Clone, Copy)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn from_env() -> Self {
        Self {
            uid: env_id("CINEDOCK_UID", DEFAULT_UID),
            gid: env_id("CINEDOCK_GID", DEFAULT_GID),
        }
    }
}

fn env_id(var: &str, default: u32) -> u32 {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(var, value, default, "unparsable id in environment, using default");
                default
            }
        },
        Err(_) => default,
    }
}

pub fn media_root() -> &'static Path {
    Path::new(MEDIA_ROOT)
}
