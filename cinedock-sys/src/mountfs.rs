// SPDX-License-Identifier: GPL-3.0-only

//! mount(2)/umount2(2) wrappers and mount-table helpers.

use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use tracing::debug;

use crate::{Result, SysError};

/// Mount a filesystem with an fstab-style option string.
///
/// The option string is split into mount flags and driver data the way
/// mount(8) does; `ntfs` is mounted through the in-kernel `ntfs3` driver.
pub fn mount(devnode: &str, mountpoint: &Path, fstype: &str, options: &str) -> Result<()> {
    let (flags, data) = split_mount_options(options);
    let data_opt: Option<&str> = if data.is_empty() {
        None
    } else {
        Some(data.as_str())
    };
    nix::mount::mount(
        Some(Path::new(devnode)),
        mountpoint,
        Some(kernel_fstype(fstype)),
        flags,
        data_opt,
    )
    .map_err(|errno| {
        SysError::OperationFailed(format!(
            "mount {} ({}) on {}: {}",
            devnode,
            fstype,
            mountpoint.display(),
            errno
        ))
    })
}

/// Detach the mount immediately and let the kernel finish teardown in the
/// background. Never blocks on a wedged device, unlike a plain umount.
pub fn lazy_unmount(mountpoint: &Path) -> Result<()> {
    nix::mount::umount2(mountpoint, MntFlags::MNT_DETACH).map_err(|errno| {
        SysError::OperationFailed(format!("lazy umount {}: {}", mountpoint.display(), errno))
    })
}

pub fn chown_to(path: &Path, uid: u32, gid: u32) -> Result<()> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(|errno| {
        SysError::OperationFailed(format!("chown {}:{} {}: {}", uid, gid, path.display(), errno))
    })
}

/// Where a device is currently mounted, if anywhere.
pub fn mountpoint_of(devnode: &str) -> Option<PathBuf> {
    let table = fs::read_to_string("/proc/self/mountinfo").ok()?;
    find_mount_source(&table, devnode)
}

/// Whether a path is a current mountpoint.
pub fn is_mountpoint(path: &Path) -> bool {
    let Ok(table) = fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    let found = parse_mount_table(&table)
        .any(|(_, mountpoint)| mountpoint == path);
    found
}

/// Pure mountinfo lookup: mount source -> mountpoint.
pub fn find_mount_source(table: &str, devnode: &str) -> Option<PathBuf> {
    parse_mount_table(table)
        .find(|(source, _)| source == devnode)
        .map(|(_, mountpoint)| mountpoint)
}

/// Parse `(source, mountpoint)` pairs out of /proc/self/mountinfo.
fn parse_mount_table(table: &str) -> impl Iterator<Item = (String, PathBuf)> + '_ {
    table.lines().filter_map(|line| {
        let (left, right) = line.split_once(" - ")?;
        let mount_point = left.split_whitespace().nth(4)?;
        let source = right.split_whitespace().nth(1)?;
        Some((
            unescape_mount_field(source),
            PathBuf::from(unescape_mount_field(mount_point)),
        ))
    })
}

/// Mountinfo escapes space, tab, newline and backslash as octal.
fn unescape_mount_field(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1].is_ascii_digit()
            && bytes[index + 2].is_ascii_digit()
            && bytes[index + 3].is_ascii_digit()
        {
            let octal = &value[index + 1..index + 4];
            if let Ok(num) = u8::from_str_radix(octal, 8) {
                output.push(num as char);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index] as char);
        index += 1;
    }

    output
}

/// Turn a volume label into a safe mountpoint component: word characters,
/// `-` and `.` only, at most 64 chars, `UNLABELED` when nothing survives.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "UNLABELED".to_string()
    } else {
        cleaned
    }
}

/// Split an fstab-style option string into mount(2) flags and the
/// driver-specific data string.
pub fn split_mount_options(options: &str) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data: Vec<&str> = Vec::new();

    for option in options.split(',').filter(|o| !o.is_empty()) {
        match option {
            "rw" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "lazytime" => flags |= MsFlags::MS_LAZYTIME,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

fn kernel_fstype(fstype: &str) -> &str {
    // blkid reports "ntfs"; the Pi kernel mounts it with the ntfs3 driver.
    if fstype == "ntfs" { "ntfs3" } else { fstype }
}

/// Remove a mountpoint directory if (and only if) it is empty. Best
/// effort: a busy or already-removed directory is fine.
pub fn remove_mountpoint_if_empty(path: &Path) {
    if let Err(err) = fs::remove_dir(path) {
        debug!(path = %path.display(), error = %err, "mountpoint left in place");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_labels_to_safe_path_components() {
        assert_eq!(sanitize_label("FOOTAGE"), "FOOTAGE");
        assert_eq!(sanitize_label("my drive/!?"), "mydrive");
        assert_eq!(sanitize_label("a.b-c_d"), "a.b-c_d");
        assert_eq!(sanitize_label("///"), "UNLABELED");
        assert_eq!(sanitize_label(""), "UNLABELED");
        let long = "x".repeat(100);
        assert_eq!(sanitize_label(&long).len(), 64);
    }

    #[test]
    fn splits_flags_from_driver_data() {
        let (flags, data) = split_mount_options("rw,noatime,lazytime");
        assert!(flags.contains(MsFlags::MS_NOATIME));
        assert!(flags.contains(MsFlags::MS_LAZYTIME));
        assert!(!flags.contains(MsFlags::MS_RDONLY));
        assert!(data.is_empty());

        let (flags, data) =
            split_mount_options("uid=1000,gid=1000,dmask=022,fmask=133,rw,noatime");
        assert!(flags.contains(MsFlags::MS_NOATIME));
        assert_eq!(data, "uid=1000,gid=1000,dmask=022,fmask=133");
    }

    #[test]
    fn ntfs_maps_to_the_in_kernel_driver() {
        assert_eq!(kernel_fstype("ntfs"), "ntfs3");
        assert_eq!(kernel_fstype("ext4"), "ext4");
        assert_eq!(kernel_fstype("exfat"), "exfat");
    }

    #[test]
    fn finds_mount_sources_in_mountinfo() {
        let sample = "36 25 8:2 / / rw,relatime - ext4 /dev/nvme0n1p2 rw\n\
                      37 25 0:5 / /proc rw,nosuid - proc proc rw\n\
                      44 25 8:17 / /media/RAW\\040DISK rw,noatime - exfat /dev/sdb1 rw\n";

        assert_eq!(
            find_mount_source(sample, "/dev/nvme0n1p2"),
            Some(PathBuf::from("/"))
        );
        assert_eq!(
            find_mount_source(sample, "/dev/sdb1"),
            Some(PathBuf::from("/media/RAW DISK"))
        );
        assert_eq!(find_mount_source(sample, "/dev/sdc1"), None);
    }
}
