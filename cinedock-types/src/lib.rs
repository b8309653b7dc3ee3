// SPDX-License-Identifier: GPL-3.0-only

//! Shared data types for the cinedock storage daemon.
//!
//! The daemon classifies every removable recording medium into a
//! [`MediaKind`] and derives all block-layer and VM tuning from the
//! corresponding static [`MediaProfile`].

use std::path::PathBuf;

/// Tuning class of a block device, derived from its bus topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// CFexpress card behind the PCIe HAT.
    CfeNvme,
    /// NVMe drive behind a USB bridge, or any UAS-attached drive.
    UsbNvme,
    /// Plain USB-attached SSD (usb-storage, no UAS).
    UsbSsd,
    /// NVMe drive directly on PCIe (NVMe base HAT).
    NvmeHat,
    /// Anything unclassifiable; gets conservative defaults.
    Other,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::CfeNvme => "cfe_nvme",
            MediaKind::UsbNvme => "usb_nvme",
            MediaKind::UsbSsd => "usb_ssd",
            MediaKind::NvmeHat => "nvme_hat",
            MediaKind::Other => "other",
        }
    }

    /// Whether the underlying medium is an NVMe namespace.
    pub fn is_nvme(self) -> bool {
        matches!(
            self,
            MediaKind::CfeNvme | MediaKind::UsbNvme | MediaKind::NvmeHat
        )
    }

    pub fn profile(self) -> &'static MediaProfile {
        match self {
            MediaKind::CfeNvme => &CFE_NVME_PROFILE,
            MediaKind::UsbNvme => &USB_NVME_PROFILE,
            MediaKind::UsbSsd => &USB_SSD_PROFILE,
            MediaKind::NvmeHat => &NVME_HAT_PROFILE,
            MediaKind::Other => &OTHER_PROFILE,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static tuning parameters for one media kind.
///
/// `dirty_bytes` / `dirty_background_bytes` cap the page cache so a dying
/// or slow drive cannot accumulate tens of seconds of unflushed video data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaProfile {
    /// Mount options applied when the filesystem is ext4.
    pub ext4_options: &'static str,
    /// vm.dirty_bytes while this medium is mounted.
    pub dirty_bytes: u64,
    /// vm.dirty_background_bytes while this medium is mounted.
    pub dirty_background_bytes: u64,
    /// Block-layer I/O scheduler (`none` keeps latency flat on SSDs).
    pub io_scheduler: &'static str,
    /// queue/rq_affinity: 2 steers completions to the submitting CPU.
    pub rq_affinity: u8,
    /// queue/nr_requests.
    pub nr_requests: u32,
    /// nvme_core default_ps_max_latency_us; 0 pins the controller out of
    /// deep power states during sustained writes.
    pub nvme_ps_max_latency_us: u32,
}

const MIB: u64 = 1024 * 1024;

pub static CFE_NVME_PROFILE: MediaProfile = MediaProfile {
    ext4_options: "rw,noatime,lazytime",
    dirty_bytes: 512 * MIB,
    dirty_background_bytes: 128 * MIB,
    io_scheduler: "none",
    rq_affinity: 2,
    nr_requests: 1023,
    nvme_ps_max_latency_us: 0,
};

pub static USB_NVME_PROFILE: MediaProfile = MediaProfile {
    ext4_options: "rw,noatime,lazytime",
    dirty_bytes: 512 * MIB,
    dirty_background_bytes: 128 * MIB,
    io_scheduler: "none",
    rq_affinity: 2,
    nr_requests: 512,
    nvme_ps_max_latency_us: 0,
};

pub static USB_SSD_PROFILE: MediaProfile = MediaProfile {
    ext4_options: "rw,noatime",
    dirty_bytes: 256 * MIB,
    dirty_background_bytes: 64 * MIB,
    io_scheduler: "none",
    rq_affinity: 1,
    nr_requests: 256,
    nvme_ps_max_latency_us: 0,
};

pub static NVME_HAT_PROFILE: MediaProfile = MediaProfile {
    ext4_options: "rw,noatime,lazytime",
    dirty_bytes: 512 * MIB,
    dirty_background_bytes: 128 * MIB,
    io_scheduler: "none",
    rq_affinity: 2,
    nr_requests: 1023,
    nvme_ps_max_latency_us: 0,
};

pub static OTHER_PROFILE: MediaProfile = MediaProfile {
    ext4_options: "rw,noatime",
    dirty_bytes: 128 * MIB,
    dirty_background_bytes: 32 * MIB,
    io_scheduler: "mq-deadline",
    rq_affinity: 1,
    nr_requests: 128,
    nvme_ps_max_latency_us: 5500,
};

/// One tracked mount. At most one record per devnode, and no two records
/// share a mountpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub devnode: String,
    pub mountpoint: PathBuf,
    pub kind: MediaKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_ssd_kinds_use_the_none_scheduler() {
        for kind in [
            MediaKind::CfeNvme,
            MediaKind::UsbNvme,
            MediaKind::UsbSsd,
            MediaKind::NvmeHat,
        ] {
            assert_eq!(kind.profile().io_scheduler, "none", "{kind}");
        }
        assert_eq!(MediaKind::Other.profile().io_scheduler, "mq-deadline");
    }

    #[test]
    fn nvme_kinds_disable_deep_power_states() {
        assert_eq!(MediaKind::CfeNvme.profile().nvme_ps_max_latency_us, 0);
        assert!(MediaKind::CfeNvme.is_nvme());
        assert!(!MediaKind::UsbSsd.is_nvme());
    }

    #[test]
    fn background_threshold_stays_below_dirty_threshold() {
        for kind in [
            MediaKind::CfeNvme,
            MediaKind::UsbNvme,
            MediaKind::UsbSsd,
            MediaKind::NvmeHat,
            MediaKind::Other,
        ] {
            let p = kind.profile();
            assert!(p.dirty_background_bytes < p.dirty_bytes, "{kind}");
        }
    }
}
