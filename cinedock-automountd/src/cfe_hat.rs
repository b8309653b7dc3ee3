// SPDX-License-Identifier: GPL-3.0-only

//! CFE HAT worker: polls the HAT's I2C status register and edge-detects
//! the insert latch and eject button.
//!
//! The latch opens *before* the card physically leaves the slot, so the
//! open edge is the one chance to detach every NVMe mount ahead of the
//! electrical removal. Nothing in this loop may block anywhere near the
//! poll cadence; unmounts are lazy and PCIe control is a sysfs write.

use tracing::{debug, info, warn};

use cinedock_sys::{blockdev, i2c::I2cBus, pcie};

use crate::config::{CFE_BIND_SETTLE, CFE_ENUM_SETTLE, CFE_POLL};
use crate::udev;
use crate::Shared;

const I2C_BUS: u8 = 1;
const I2C_ADDRESS: u16 = 0x34;

const INSERT_BIT: u8 = 0x01;
const EJECT_BIT: u8 = 0x02;
/// The HAT controller answers 0x69 while busy; such reads carry no latch
/// state and are skipped.
const BUSY_SENTINEL: u8 = 0x69;

const LED_ON: u8 = 0x01;
const LED_OFF: u8 = 0x00;

pub async fn run(daemon: Shared) -> anyhow::Result<()> {
    let mut bus = match I2cBus::open(I2C_BUS, I2C_ADDRESS) {
        Ok(bus) => bus,
        Err(err) => {
            info!(error = %err, "CFE HAT not reachable on i2c, worker idle");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };
    // Probe once so a HAT-less system parks before the poll loop.
    if let Err(err) = bus.read_byte() {
        info!(error = %err, "CFE HAT not detected, worker idle");
        std::future::pending::<()>().await;
    }

    info!("CFE HAT worker started");
    let mut ticker = tokio::time::interval(CFE_POLL);
    let mut previous: Option<u8> = None;
    let mut read_error_logged = false;

    loop {
        ticker.tick().await;

        let byte = match bus.read_byte() {
            Ok(byte) => {
                read_error_logged = false;
                byte
            }
            Err(err) => {
                if !read_error_logged {
                    warn!(error = %err, "CFE HAT i2c read failed, retrying");
                    read_error_logged = true;
                }
                continue;
            }
        };
        if byte == BUSY_SENTINEL {
            continue;
        }

        let Some(prev) = previous.replace(byte) else {
            continue;
        };

        let insert_was = prev & INSERT_BIT != 0;
        let insert_now = byte & INSERT_BIT != 0;
        let eject_was = prev & EJECT_BIT != 0;
        let eject_now = byte & EJECT_BIT != 0;

        // Latch opening means the card is on its way out.
        if !insert_was && insert_now {
            info!("CFE latch opened, detaching nvme mounts pre-emptively");
            on_latch_open(&daemon, &mut bus).await;
        }

        // Latch closing means a card was seated.
        if insert_was && !insert_now {
            info!("CFE latch closed, powering slot up");
            on_latch_close(&daemon, &mut bus).await;
        }

        // Eject button released: operator wants everything out.
        if eject_was && !eject_now {
            info!("CFE eject released, unmounting everything");
            on_eject(&daemon, &mut bus).await;
        }
    }
}

/// Card being pulled: lazily unmount every NVMe device, power the slot
/// down, LED off. All before the physical removal completes.
async fn on_latch_open(daemon: &Shared, bus: &mut I2cBus) {
    let mut st = daemon.state.lock().await;

    let nvme_devices: Vec<String> = st
        .tracked_records()
        .into_iter()
        .filter(|record| record.kind.is_nvme())
        .map(|record| record.devnode)
        .collect();

    for devnode in nvme_devices {
        st.unregister_raw(&devnode);
        if st.active_raw.as_deref() == Some(devnode.as_str()) {
            st.active_raw = None;
        }
        daemon.mounter.unmount(&mut st, &devnode);
    }

    pcie::unbind();
    set_led(bus, false);
}

/// Card seated: power the slot, forgive earlier NVMe mount failures, wait
/// for enumeration, then bring up whatever appeared. Partitions always
/// take priority over whole-disk mounting.
async fn on_latch_close(daemon: &Shared, bus: &mut I2cBus) {
    if pcie::driver_bound() {
        pcie::rescan();
    } else {
        pcie::bind();
        tokio::time::sleep(CFE_BIND_SETTLE).await;
        pcie::rescan();
    }
    set_led(bus, true);

    {
        let mut st = daemon.state.lock().await;
        st.clear_nvme_cooldowns();
    }

    tokio::time::sleep(CFE_ENUM_SETTLE).await;

    let partitions = blockdev::list_nvme_partitions();
    if !partitions.is_empty() {
        for devnode in partitions {
            udev::handle_candidate(daemon, &devnode, false).await;
        }
        return;
    }

    debug!("no nvme partitions after bind, falling back to whole disks");
    let disks = blockdev::list_nvme_disks_without_partitions();
    if disks.is_empty() {
        warn!("CFE latch closed but no nvme device enumerated");
        return;
    }
    for devnode in disks {
        udev::handle_candidate(daemon, &devnode, true).await;
    }
}

/// Eject button: full teardown of every tracked device, slot powered
/// down, LED off. The raw pool is cleared so self-heal does not remount
/// what the operator just ejected; candidates re-register on fresh add
/// events.
async fn on_eject(daemon: &Shared, bus: &mut I2cBus) {
    let mut st = daemon.state.lock().await;

    st.clear_raw_pool();
    st.active_raw = None;
    for devnode in st.tracked_devnodes() {
        daemon.mounter.unmount(&mut st, &devnode);
    }

    pcie::unbind();
    set_led(bus, false);
}

fn set_led(bus: &mut I2cBus, on: bool) {
    let value = if on { LED_ON } else { LED_OFF };
    if let Err(err) = bus.write_byte(value) {
        warn!(error = %err, on, "CFE HAT led write failed");
    }
}
