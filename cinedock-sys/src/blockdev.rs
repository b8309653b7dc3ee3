// SPDX-License-Identifier: GPL-3.0-only

//! Block-layer queue tuning, NVMe helpers and sysfs device enumeration.
//!
//! All sysfs writes here are best-effort: a missing or read-only control
//! file is logged at debug level and otherwise ignored, because tuning
//! must never make a mount fail.

use std::fs;
use std::path::Path;

use cinedock_types::MediaProfile;
use tracing::debug;

use crate::classify::devname_of;

const SYS_BLOCK: &str = "/sys/block";
const SYS_CLASS_BLOCK: &str = "/sys/class/block";
const NVME_PS_LATENCY_PATH: &str = "/sys/module/nvme_core/parameters/default_ps_max_latency_us";

/// Device classes the daemon never touches: the boot SD card, loop and
/// RAM-disk devices.
pub fn is_ignored_class(devname: &str) -> bool {
    devname.starts_with("mmcblk")
        || devname.starts_with("loop")
        || devname.starts_with("ram")
        || devname.starts_with("zram")
}

/// Resolve the whole-disk name a partition belongs to.
///
/// NVMe partitions carry a `pN` suffix (`nvme0n1p2` -> `nvme0n1`); every
/// other naming scheme just appends the partition number (`sda1` -> `sda`).
pub fn root_block_name(devname: &str) -> String {
    if devname.starts_with("nvme") {
        if let Some(pos) = devname.rfind('p') {
            let suffix = &devname[pos + 1..];
            let preceded_by_digit = devname[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_digit());
            if !suffix.is_empty()
                && suffix.chars().all(|c| c.is_ascii_digit())
                && preceded_by_digit
            {
                return devname[..pos].to_string();
            }
        }
        return devname.to_string();
    }
    devname
        .trim_end_matches(|c: char| c.is_ascii_digit())
        .to_string()
}

/// Write the profile's scheduler, completion affinity and queue depth to
/// the root device's queue control files.
pub fn apply_block_tuning(devnode: &str, profile: &MediaProfile) {
    let root = root_block_name(devname_of(devnode));
    let queue = Path::new(SYS_BLOCK).join(&root).join("queue");
    write_attr(&queue.join("scheduler"), profile.io_scheduler);
    write_attr(&queue.join("rq_affinity"), &profile.rq_affinity.to_string());
    write_attr(&queue.join("nr_requests"), &profile.nr_requests.to_string());
}

/// Hint the NVMe core to stay out of deep power states under sustained
/// writes. Module-wide, best-effort.
pub fn apply_nvme_power_tuning(profile: &MediaProfile) {
    write_attr(
        Path::new(NVME_PS_LATENCY_PATH),
        &profile.nvme_ps_max_latency_us.to_string(),
    );
}

fn write_attr(path: &Path, value: &str) {
    if let Err(err) = fs::write(path, value) {
        debug!(path = %path.display(), value, error = %err, "tuning write skipped");
    }
}

/// `nvme0n1p1` -> controller name `nvme0`.
pub fn nvme_controller_of(devname: &str) -> Option<String> {
    let rest = devname.strip_prefix("nvme")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("nvme{digits}"))
}

/// Read the controller link state, e.g. `live` or `dead`.
pub fn nvme_controller_state(controller: &str) -> Option<String> {
    fs::read_to_string(format!("/sys/class/nvme/{controller}/state"))
        .ok()
        .map(|s| s.trim().to_string())
}

fn is_partition(devname: &str) -> bool {
    Path::new(SYS_CLASS_BLOCK)
        .join(devname)
        .join("partition")
        .exists()
}

/// Whether a whole disk has any partitions (they appear as subdirectories
/// of the disk's sysfs node).
pub fn disk_has_partitions(devname: &str) -> bool {
    let disk_dir = Path::new(SYS_BLOCK).join(devname);
    let Ok(entries) = fs::read_dir(disk_dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|entry| entry.path().join("partition").exists())
}

fn list_block_names() -> Vec<String> {
    let Ok(entries) = fs::read_dir(SYS_CLASS_BLOCK) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !is_ignored_class(name))
        .collect();
    names.sort();
    names
}

/// All partition devnodes, `/dev/`-prefixed and sorted.
pub fn list_partitions() -> Vec<String> {
    list_block_names()
        .into_iter()
        .filter(|name| is_partition(name))
        .map(|name| format!("/dev/{name}"))
        .collect()
}

/// Whole-disk devnodes that carry no partition table, `/dev/`-prefixed.
pub fn list_disks_without_partitions() -> Vec<String> {
    list_block_names()
        .into_iter()
        .filter(|name| !is_partition(name) && !disk_has_partitions(name))
        .map(|name| format!("/dev/{name}"))
        .collect()
}

/// NVMe partition devnodes, for the CFE HAT post-bind scan.
pub fn list_nvme_partitions() -> Vec<String> {
    list_partitions()
        .into_iter()
        .filter(|devnode| devname_of(devnode).starts_with("nvme"))
        .collect()
}

/// NVMe whole disks without partitions, the CFE HAT scan fallback.
pub fn list_nvme_disks_without_partitions() -> Vec<String> {
    list_disks_without_partitions()
        .into_iter()
        .filter(|devnode| devname_of(devnode).starts_with("nvme"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nvme_partitions_strip_the_pn_suffix() {
        assert_eq!(root_block_name("nvme0n1p2"), "nvme0n1");
        assert_eq!(root_block_name("nvme1n1p12"), "nvme1n1");
        assert_eq!(root_block_name("nvme0n1"), "nvme0n1");
    }

    #[test]
    fn scsi_partitions_strip_trailing_digits() {
        assert_eq!(root_block_name("sda1"), "sda");
        assert_eq!(root_block_name("sdb12"), "sdb");
        assert_eq!(root_block_name("sdc"), "sdc");
    }

    #[test]
    fn controller_name_is_derived_from_the_namespace() {
        assert_eq!(nvme_controller_of("nvme0n1p1").as_deref(), Some("nvme0"));
        assert_eq!(nvme_controller_of("nvme12n1").as_deref(), Some("nvme12"));
        assert_eq!(nvme_controller_of("sda1"), None);
    }

    #[test]
    fn boot_and_virtual_devices_are_ignored() {
        assert!(is_ignored_class("mmcblk0p1"));
        assert!(is_ignored_class("loop3"));
        assert!(is_ignored_class("ram0"));
        assert!(is_ignored_class("zram0"));
        assert!(!is_ignored_class("nvme0n1"));
        assert!(!is_ignored_class("sda"));
    }
}
