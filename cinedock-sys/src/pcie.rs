// SPDX-License-Identifier: GPL-3.0-only

//! CFE HAT PCIe controller control via the brcm-pcie platform driver.
//!
//! Binding and unbinding the controller node powers the CFexpress slot's
//! link up and down around card insertion, so a half-removed card never
//! wedges the NVMe driver. All writes are best-effort; EBUSY from a bind
//! that already happened is expected and ignored.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// The CFE HAT hangs off this PCIe controller node on the Pi 5.
pub const CFE_PCIE_NODE: &str = "1000110000.pcie";

const DRIVER_DIR: &str = "/sys/bus/platform/drivers/brcm-pcie";
const DRIVER_LINK: &str = "/sys/devices/platform/axi/1000110000.pcie/driver";
const PCI_RESCAN: &str = "/sys/bus/pci/rescan";

pub fn bind() {
    write_driver_ctl("bind");
}

pub fn unbind() {
    write_driver_ctl("unbind");
}

/// Whether the controller currently has its driver bound.
pub fn driver_bound() -> bool {
    Path::new(DRIVER_LINK).exists()
}

/// Ask the PCI core to re-enumerate, picking up a freshly powered card.
pub fn rescan() {
    if let Err(err) = fs::write(PCI_RESCAN, "1") {
        debug!(path = PCI_RESCAN, error = %err, "pci rescan write skipped");
    }
}

fn write_driver_ctl(target: &str) {
    let path = Path::new(DRIVER_DIR).join(target);
    match fs::write(&path, CFE_PCIE_NODE) {
        Ok(()) => debug!(target, node = CFE_PCIE_NODE, "pcie driver control ok"),
        Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
            debug!(target, error = %err, "pcie controller busy, already in requested state")
        }
        Err(err) => {
            warn!(path = %path.display(), node = CFE_PCIE_NODE, error = %err, "pcie driver control failed")
        }
    }
}
