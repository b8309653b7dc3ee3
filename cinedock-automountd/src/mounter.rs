// SPDX-License-Identifier: GPL-3.0-only

//! Mount manager: the per-device Unmounted -> Mounting -> Mounted ->
//! Unmounting -> Unmounted state machine, with auto-repair, failure
//! cooldown and tuning application.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use cinedock_sys::{blockdev, classify, mountfs, probe, vm};
use cinedock_types::{MediaKind, MediaProfile, MountRecord};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::Owner;
use crate::state::StorageState;

pub struct Mounter {
    owner: Owner,
    media_root: PathBuf,
}

impl Mounter {
    pub fn new(owner: Owner, media_root: PathBuf) -> Self {
        Self { owner, media_root }
    }

    /// Mount a device and start tracking it. Returns whether the device
    /// is tracked afterwards.
    ///
    /// Idempotent: a tracked device or one in failure cooldown is left
    /// alone without issuing a second mount syscall.
    pub async fn mount(&self, st: &mut StorageState, devnode: &str) -> bool {
        let now = Instant::now();
        if st.in_cooldown(devnode, now) {
            debug!(devnode, "in failure cooldown, skipping mount");
            return false;
        }
        if st.is_tracked(devnode) {
            debug!(devnode, "already tracked, skipping mount");
            return true;
        }

        let (label, fstype) = match probe::probe(devnode).await {
            Ok(result) => result,
            Err(err) => {
                warn!(devnode, error = %err, "filesystem probe failed");
                (None, None)
            }
        };
        let Some(fstype) = fstype else {
            st.set_cooldown(devnode, now);
            return false;
        };

        let kind = classify::classify(devnode);
        let profile = kind.profile();

        let name = match &label {
            Some(label) => mountfs::sanitize_label(label),
            None => mountfs::sanitize_label(classify::devname_of(devnode)),
        };
        let mountpoint = self.media_root.join(name);

        // Raced by another mounter (or mounted before we started): adopt
        // the existing mount instead of mounting twice. System mounts
        // outside the media root (/, /boot/firmware) are not ours to
        // track and stay untouched.
        if let Some(existing) = mountfs::mountpoint_of(devnode) {
            if !existing.starts_with(&self.media_root) {
                debug!(devnode, mountpoint = %existing.display(), "mounted outside media root, leaving alone");
                return false;
            }
            info!(devnode, mountpoint = %existing.display(), kind = %kind, "adopting existing mount");
            st.insert_record(MountRecord {
                devnode: devnode.to_string(),
                mountpoint: existing,
                kind,
            });
            self.apply_tuning(st, devnode, kind, profile);
            return true;
        }

        if let Err(err) = fs::create_dir_all(&mountpoint) {
            error!(devnode, mountpoint = %mountpoint.display(), error = %err, "cannot create mountpoint");
            st.set_cooldown(devnode, now);
            return false;
        }

        let options = self.options_for(&fstype, profile);
        info!(devnode, %fstype, kind = %kind, mountpoint = %mountpoint.display(), "mounting");

        match mountfs::mount(devnode, &mountpoint, &fstype, &options) {
            Ok(()) => {
                self.finish_mount(st, devnode, mountpoint, kind, profile);
                true
            }
            Err(err) => {
                error!(devnode, error = %err, "mount failed");
                if self.auto_repair(devnode, &fstype).await {
                    match mountfs::mount(devnode, &mountpoint, &fstype, &options) {
                        Ok(()) => {
                            info!(devnode, "mounted after repair");
                            self.finish_mount(st, devnode, mountpoint, kind, profile);
                            return true;
                        }
                        Err(err) => {
                            error!(devnode, error = %err, "mount still failing after repair")
                        }
                    }
                }
                mountfs::remove_mountpoint_if_empty(&mountpoint);
                st.set_cooldown(devnode, now);
                false
            }
        }
    }

    fn finish_mount(
        &self,
        st: &mut StorageState,
        devnode: &str,
        mountpoint: PathBuf,
        kind: MediaKind,
        profile: &MediaProfile,
    ) {
        if let Err(err) = mountfs::chown_to(&mountpoint, self.owner.uid, self.owner.gid) {
            debug!(devnode, error = %err, "chown skipped");
        }
        st.insert_record(MountRecord {
            devnode: devnode.to_string(),
            mountpoint,
            kind,
        });
        self.apply_tuning(st, devnode, kind, profile);
        info!(devnode, kind = %kind, "mounted and tuned");
    }

    fn apply_tuning(
        &self,
        st: &mut StorageState,
        devnode: &str,
        kind: MediaKind,
        profile: &MediaProfile,
    ) {
        blockdev::apply_block_tuning(devnode, profile);
        if kind.is_nvme() {
            blockdev::apply_nvme_power_tuning(profile);
        }
        if st.note_tuned(devnode) {
            match vm::snapshot() {
                Ok(snap) => st.set_vm_snapshot(snap),
                Err(err) => {
                    warn!(error = %err, "cannot snapshot vm sysctls, cushions skipped")
                }
            }
        }
        if st.has_vm_snapshot() {
            vm::apply_cushions(profile);
        }
    }

    /// Stop tracking and lazily unmount a device.
    ///
    /// The record is dropped before the umount so concurrent callers see
    /// the device as gone immediately; the umount itself is detached and
    /// never blocks on a wedged device.
    pub fn unmount(&self, st: &mut StorageState, devnode: &str) {
        let Some(record) = st.remove_record(devnode) else {
            debug!(devnode, "unmount requested but not tracked");
            return;
        };

        info!(devnode, mountpoint = %record.mountpoint.display(), "lazy unmounting");
        if let Err(err) = mountfs::lazy_unmount(&record.mountpoint) {
            warn!(devnode, error = %err, "lazy unmount failed");
        }
        mountfs::remove_mountpoint_if_empty(&record.mountpoint);
        self.restore_check(st, devnode);
    }

    /// Restore the VM sysctls once the last tuned mount is gone. Safe to
    /// call after every unmount; no-ops until the tuned set empties.
    pub fn restore_check(&self, st: &mut StorageState, devnode: &str) {
        if st.note_untuned(devnode) {
            if let Some(snap) = st.take_vm_snapshot() {
                vm::restore(&snap);
                info!("vm dirty-page sysctls restored");
            }
        }
    }

    fn options_for(&self, fstype: &str, profile: &MediaProfile) -> String {
        if fstype == "ext4" {
            profile.ext4_options.to_string()
        } else {
            format!(
                "uid={},gid={},dmask=022,fmask=133,rw,noatime",
                self.owner.uid, self.owner.gid
            )
        }
    }

    /// One repair attempt for a filesystem that refused to mount.
    /// e2fsck exits 1/2 for "errors corrected", which still counts as
    /// repaired.
    async fn auto_repair(&self, devnode: &str, fstype: &str) -> bool {
        let (tool, args): (&str, &[&str]) = match fstype {
            "ext4" => ("e2fsck", &["-f", "-p", devnode]),
            "ntfs" => ("ntfsfix", &[devnode]),
            "exfat" => ("fsck.exfat", &["-a", devnode]),
            _ => {
                debug!(devnode, fstype, "no repair tool for filesystem");
                return false;
            }
        };

        let Ok(tool_path) = which::which(tool) else {
            warn!(devnode, tool, "repair tool not installed");
            return false;
        };

        warn!(devnode, tool, "attempting filesystem repair");
        let status = match Command::new(tool_path).args(args).status().await {
            Ok(status) => status,
            Err(err) => {
                error!(devnode, tool, error = %err, "repair tool failed to run");
                return false;
            }
        };

        let repaired = match fstype {
            "ext4" => matches!(status.code(), Some(0 | 1 | 2)),
            _ => status.success(),
        };
        if repaired {
            info!(devnode, tool, "repair successful");
        } else {
            error!(devnode, tool, code = ?status.code(), "repair failed, filesystem still dirty");
        }
        repaired
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use cinedock_types::MediaKind;

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

    #[tokio::test]
    async fn mount_is_idempotent_for_tracked_devices() {
        let m = mounter();
        let mut st = StorageState::new();
        st.insert_record(MountRecord {
            devnode: "/dev/sda1".to_string(),
            mountpoint: PathBuf::from("/media/FOOTAGE"),
            kind: MediaKind::UsbSsd,
        });

        // Returns before probing or mounting anything.
        assert!(m.mount(&mut st, "/dev/sda1").await);
        assert_eq!(st.tracked_devnodes().len(), 1);
    }

    #[tokio::test]
    async fn mount_skips_devices_in_cooldown() {
        let m = mounter();
        let mut st = StorageState::new();
        st.set_cooldown("/dev/sdb1", Instant::now());

        assert!(!m.mount(&mut st, "/dev/sdb1").await);
        assert!(st.tracked_devnodes().is_empty());
    }

    #[test]
    fn ext4_uses_profile_options_and_the_rest_get_owner_masks() {
        let m = mounter();
        let profile = MediaKind::UsbSsd.profile();
        assert_eq!(m.options_for("ext4", profile), profile.ext4_options);
        assert_eq!(
            m.options_for("exfat", profile),
            "uid=1000,gid=1000,dmask=022,fmask=133,rw,noatime"
        );
    }
}
