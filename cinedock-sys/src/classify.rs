// SPDX-License-Identifier: GPL-3.0-only

//! Media-kind classification from sysfs bus topology.

use std::path::Path;

use cinedock_types::MediaKind;
use tracing::debug;

use crate::pcie::CFE_PCIE_NODE;

/// Classify a device node by walking its resolved sysfs path.
///
/// Classification never fails: any lookup error falls back to
/// [`MediaKind::Other`], which carries conservative tuning.
pub fn classify(devnode: &str) -> MediaKind {
    let name = devname_of(devnode);
    let syspath = match std::fs::canonicalize(format!("/sys/class/block/{name}")) {
        Ok(path) => path,
        Err(err) => {
            debug!(devnode, error = %err, "sysfs lookup failed, classifying as other");
            return MediaKind::Other;
        }
    };
    let uas = chain_has_uas_driver(&syspath);
    let kind = classify_sys_path(&syspath.to_string_lossy(), name, uas);
    debug!(devnode, kind = %kind, "classified");
    kind
}

/// Path-walk core, separated out so it is testable without hardware.
///
/// A USB-attached device shows a `usbN` root-port segment in its resolved
/// sysfs path. PCIe-direct NVMe behind the CFE HAT's controller node is the
/// CFexpress slot; any other PCIe-direct NVMe is a base HAT.
pub fn classify_sys_path(syspath: &str, name: &str, uas_driver: bool) -> MediaKind {
    let has_usb_ancestor = syspath
        .split('/')
        .any(|segment| segment.starts_with("usb") && segment.len() > 3);

    if !has_usb_ancestor {
        if name.starts_with("nvme") {
            if syspath.contains(CFE_PCIE_NODE) {
                return MediaKind::CfeNvme;
            }
            return MediaKind::NvmeHat;
        }
        return MediaKind::Other;
    }

    if name.starts_with("nvme") || uas_driver {
        // UAS implies the same sustained-throughput class as a USB-NVMe
        // bridge, so both share a tuning profile.
        return MediaKind::UsbNvme;
    }

    MediaKind::UsbSsd
}

/// `/dev/nvme0n1p1` -> `nvme0n1p1`
pub fn devname_of(devnode: &str) -> &str {
    devnode.rsplit('/').next().unwrap_or(devnode)
}

fn chain_has_uas_driver(syspath: &Path) -> bool {
    let mut dir = syspath.parent();
    while let Some(d) = dir {
        if let Ok(target) = std::fs::read_link(d.join("driver")) {
            if target.file_name().and_then(|n| n.to_str()) == Some("uas") {
                return true;
            }
        }
        if d == Path::new("/sys/devices") || d == Path::new("/") {
            break;
        }
        dir = d.parent();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const USB_SSD_PATH: &str = "/sys/devices/platform/axi/1000120000.pcie/1f00200000.usb/xhci-hcd.1/usb2/2-1/2-1:1.0/host0/target0:0:0/0:0:0:0/block/sda/sda1";
    const CFE_PATH: &str = "/sys/devices/platform/axi/1000110000.pcie/1000110000.pcie/pci0000:00/0000:00:00.0/0000:01:00.0/nvme/nvme0/nvme0n1/nvme0n1p1";
    const HAT_PATH: &str = "/sys/devices/platform/scb/fd500000.pcie/pci0000:00/0000:00:00.0/0000:01:00.0/nvme/nvme0/nvme0n1/nvme0n1p1";

    #[test]
    fn usb_sata_without_uas_is_usb_ssd() {
        assert_eq!(
            classify_sys_path(USB_SSD_PATH, "sda1", false),
            MediaKind::UsbSsd
        );
    }

    #[test]
    fn uas_attachment_upgrades_to_the_usb_nvme_class() {
        assert_eq!(
            classify_sys_path(USB_SSD_PATH, "sda1", true),
            MediaKind::UsbNvme
        );
    }

    #[test]
    fn nvme_behind_usb_bridge_is_usb_nvme() {
        let path = USB_SSD_PATH.replace("sda/sda1", "nvme0n1/nvme0n1p1");
        assert_eq!(
            classify_sys_path(&path, "nvme0n1p1", false),
            MediaKind::UsbNvme
        );
    }

    #[test]
    fn pcie_direct_nvme_splits_on_the_cfe_controller_node() {
        assert_eq!(
            classify_sys_path(CFE_PATH, "nvme0n1p1", false),
            MediaKind::CfeNvme
        );
        assert_eq!(
            classify_sys_path(HAT_PATH, "nvme0n1p1", false),
            MediaKind::NvmeHat
        );
    }

    #[test]
    fn non_usb_non_nvme_falls_back_to_other() {
        assert_eq!(
            classify_sys_path("/sys/devices/platform/emmc2bus/fe340000.mmc/mmc_host/mmc0/mmc0:aaaa/block/mmcblk0/mmcblk0p1", "mmcblk0p1", false),
            MediaKind::Other
        );
    }

    #[test]
    fn devname_strips_the_dev_prefix() {
        assert_eq!(devname_of("/dev/nvme0n1p1"), "nvme0n1p1");
        assert_eq!(devname_of("sda1"), "sda1");
    }
}
