// SPDX-License-Identifier: GPL-3.0-only

//! Kernel uevent consumer for block hotplug.
//!
//! Listens on a NETLINK_KOBJECT_UEVENT socket (kernel broadcast group 1)
//! from a dedicated blocking thread and forwards parsed block events into
//! the async side over a channel. udevd-forwarded messages (the
//! `libudev` magic) are ignored; the daemon reacts to the kernel's own
//! announcements.

use std::io;
use std::mem;

use anyhow::Context as _;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use cinedock_sys::{blockdev, classify, probe};

use crate::config::{ADD_SETTLE, RAW_LABEL};
use crate::raw;
use crate::Shared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UEvent {
    pub action: String,
    pub subsystem: Option<String>,
    pub devtype: Option<String>,
    pub devname: Option<String>,
}

/// Parse one kernel uevent datagram: `action@devpath\0KEY=VALUE\0...`.
pub fn parse_uevent(buf: &[u8]) -> Option<UEvent> {
    if buf.starts_with(b"libudev") {
        return None;
    }

    let mut fields = buf.split(|b| *b == 0).map(|f| String::from_utf8_lossy(f));
    let header = fields.next()?;
    let (action, _devpath) = header.split_once('@')?;

    let mut event = UEvent {
        action: action.to_string(),
        subsystem: None,
        devtype: None,
        devname: None,
    };

    for field in fields {
        if let Some((key, value)) = field.split_once('=') {
            match key {
                "SUBSYSTEM" => event.subsystem = Some(value.to_string()),
                "DEVTYPE" => event.devtype = Some(value.to_string()),
                "DEVNAME" => {
                    // The kernel reports names relative to /dev.
                    event.devname = Some(if value.starts_with('/') {
                        value.to_string()
                    } else {
                        format!("/dev/{value}")
                    });
                }
                _ => {}
            }
        }
    }

    Some(event)
}

/// Open the uevent socket and pump parsed events from a blocking thread.
pub fn spawn_listener() -> anyhow::Result<mpsc::Receiver<UEvent>> {
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            libc::NETLINK_KOBJECT_UEVENT,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("opening netlink uevent socket");
    }

    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = 1;
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err).context("binding netlink uevent socket");
    }

    let (tx, rx) = mpsc::channel(64);
    std::thread::Builder::new()
        .name("uevent-netlink".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; 8192];
            loop {
                let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    error!(error = %err, "netlink recv failed, uevent listener stopping");
                    break;
                }
                if n == 0 {
                    continue;
                }
                if let Some(event) = parse_uevent(&buf[..n as usize]) {
                    if tx.blocking_send(event).is_err() {
                        break;
                    }
                }
            }
            unsafe { libc::close(fd) };
        })
        .context("spawning uevent listener thread")?;

    Ok(rx)
}

/// The async half: dispatch block events into the mount manager and
/// arbitrator.
pub async fn run(daemon: Shared, mut events: mpsc::Receiver<UEvent>) -> anyhow::Result<()> {
    info!("udev worker started");

    while let Some(event) = events.recv().await {
        if event.subsystem.as_deref() != Some("block") {
            continue;
        }
        let Some(devnode) = event.devname.clone() else {
            continue;
        };
        if blockdev::is_ignored_class(classify::devname_of(&devnode)) {
            continue;
        }

        match event.action.as_str() {
            "add" | "change" => {
                debug!(devnode, action = %event.action, "block device announced");
                tokio::time::sleep(ADD_SETTLE).await;
                let whole_disk = event.devtype.as_deref() == Some("disk");
                handle_candidate(&daemon, &devnode, whole_disk).await;
            }
            "remove" => {
                info!(devnode, "block device removed");
                let mut st = daemon.state.lock().await;
                raw::handle_device_removal(&daemon.mounter, &mut st, &devnode).await;
            }
            _ => {}
        }
    }

    anyhow::bail!("uevent channel closed")
}

/// Probe a candidate and route it: raw-labeled devices go through the
/// arbitrator, everything else mounts normally. Whole disks only count
/// when they carry a filesystem and no partition table.
pub async fn handle_candidate(daemon: &Shared, devnode: &str, whole_disk: bool) {
    if whole_disk && blockdev::disk_has_partitions(classify::devname_of(devnode)) {
        debug!(devnode, "disk has partitions, waiting for partition events");
        return;
    }

    let label = match probe::probe(devnode).await {
        Ok((label, Some(_fstype))) => label,
        Ok((_, None)) => {
            if whole_disk {
                debug!(devnode, "whole disk without filesystem, ignoring");
                return;
            }
            // Partitions with an unreadable filesystem still go through
            // the mount manager so they land in failure cooldown.
            None
        }
        Err(err) => {
            debug!(devnode, error = %err, "probe failed");
            None
        }
    };

    let mut st = daemon.state.lock().await;
    if label.as_deref() == Some(RAW_LABEL) {
        raw::register_and_arbitrate(&daemon.mounter, &mut st, devnode).await;
    } else {
        daemon.mounter.mount(&mut st, devnode).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_kernel_block_uevent() {
        let raw = b"add@/devices/platform/axi/1000120000.pcie/usb2/2-1/block/sda/sda1\0\
                    ACTION=add\0\
                    DEVPATH=/devices/platform/axi/1000120000.pcie/usb2/2-1/block/sda/sda1\0\
                    SUBSYSTEM=block\0\
                    DEVNAME=sda1\0\
                    DEVTYPE=partition\0\
                    SEQNUM=4711\0";

        let event = parse_uevent(raw).expect("parses");
        assert_eq!(event.action, "add");
        assert_eq!(event.subsystem.as_deref(), Some("block"));
        assert_eq!(event.devtype.as_deref(), Some("partition"));
        assert_eq!(event.devname.as_deref(), Some("/dev/sda1"));
    }

    #[test]
    fn ignores_udevd_forwarded_messages() {
        assert_eq!(parse_uevent(b"libudev\0whatever"), None);
    }

    #[test]
    fn ignores_datagrams_without_a_header() {
        assert_eq!(parse_uevent(b"ACTION=add\0SUBSYSTEM=block\0"), None);
    }
}
