// SPDX-License-Identifier: GPL-3.0-only

//! Failure watchdogs.
//!
//! Two periodic passes keep the mount table honest: a fast one watching
//! NVMe controller link state, and a slower one statting every tracked
//! mountpoint to catch yanked drives. Both funnel failures through the
//! same removal path as a udev remove event, so failover and sysctl
//! restore behave identically however a device dies.

use std::collections::HashMap;

use nix::errno::Errno;
use nix::sys::statvfs::statvfs;
use tracing::{debug, error, info};

use cinedock_sys::{blockdev, classify};

use crate::config::{NVME_WATCHDOG_PERIOD, SANITY_WATCHDOG_PERIOD};
use crate::raw;
use crate::Shared;

/// Controller-death watchdog: an NVMe controller whose link state reads
/// `dead` will hang any further I/O, so its mounts are detached at once.
pub async fn run_nvme_death(daemon: Shared) -> anyhow::Result<()> {
    info!("nvme death watchdog started");
    let mut ticker = tokio::time::interval(NVME_WATCHDOG_PERIOD);

    loop {
        ticker.tick().await;
        let mut st = daemon.state.lock().await;

        for record in st.tracked_records() {
            let devname = classify::devname_of(&record.devnode);
            let Some(controller) = blockdev::nvme_controller_of(devname) else {
                continue;
            };
            let Some(state) = blockdev::nvme_controller_state(&controller) else {
                continue;
            };
            if state == "dead" {
                error!(devnode = %record.devnode, controller, "nvme controller dead, detaching");
                raw::handle_device_removal(&daemon.mounter, &mut st, &record.devnode).await;
            }
        }
    }
}

/// Filesystem sanity watchdog: statvfs every tracked mountpoint and treat
/// device-absent / I/O-error results as a yanked drive. SD-card-backed
/// mounts are skipped because statvfs on a dying card can block for
/// seconds. Ends each pass with the raw-pool self-heal.
pub async fn run_sanity(daemon: Shared) -> anyhow::Result<()> {
    info!("sanity watchdog started");
    let mut ticker = tokio::time::interval(SANITY_WATCHDOG_PERIOD);
    let mut last_free_gib: HashMap<String, u64> = HashMap::new();

    loop {
        ticker.tick().await;
        let mut st = daemon.state.lock().await;

        for record in st.tracked_records() {
            let devname = classify::devname_of(&record.devnode);
            if devname.starts_with("mmcblk") {
                continue;
            }

            match statvfs(&record.mountpoint) {
                Ok(stat) => {
                    if st.active_raw.as_deref() == Some(record.devnode.as_str()) {
                        let free_gib = (stat.blocks_available() as u64
                            * stat.fragment_size() as u64)
                            / (1024 * 1024 * 1024);
                        let entry = last_free_gib.entry(record.devnode.clone()).or_insert(u64::MAX);
                        if *entry != free_gib {
                            *entry = free_gib;
                            debug!(devnode = %record.devnode, free_gib, "raw target free space");
                        }
                    }
                }
                Err(errno @ (Errno::EIO | Errno::ENODEV | Errno::ENXIO | Errno::ENOENT)) => {
                    error!(
                        devnode = %record.devnode,
                        mountpoint = %record.mountpoint.display(),
                        error = %errno,
                        "mount failed sanity check, treating as yanked"
                    );
                    last_free_gib.remove(&record.devnode);
                    raw::handle_device_removal(&daemon.mounter, &mut st, &record.devnode).await;
                }
                Err(errno) => {
                    debug!(devnode = %record.devnode, error = %errno, "sanity probe soft error");
                }
            }
        }

        raw::self_heal(&daemon.mounter, &mut st).await;
    }
}
