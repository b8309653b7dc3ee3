// SPDX-License-Identifier: GPL-3.0-only

//! cinedock automount daemon.
//!
//! Watches removable recording media (CFexpress behind the PCIe HAT, USB
//! NVMe/SSD, NVMe base HAT), mounts whatever appears under /media, tunes
//! the block layer and VM dirty-page behavior for sustained video writes,
//! keeps exactly one device active as the RAW recording target, and fails
//! over when a drive dies or is yanked mid-recording.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod cfe_hat;
mod config;
mod mounter;
mod raw;
mod scan;
mod state;
mod udev;
mod watchdog;

use config::Owner;
use mounter::Mounter;
use state::StorageState;

/// Everything the workers share: the mount manager and the single lock
/// serializing all device state.
pub struct Daemon {
    pub state: tokio::sync::Mutex<StorageState>,
    pub mounter: Mounter,
}

pub type Shared = Arc<Daemon>;

#[tokio::main]
async fn main() -> Result<()> {
    // Log to stderr so journald picks everything up.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cinedock_automountd=info,cinedock_sys=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        "starting cinedock automount daemon v{}",
        env!("CARGO_PKG_VERSION")
    );

    if unsafe { libc::geteuid() } != 0 {
        error!("daemon must run as root to mount and tune devices");
        anyhow::bail!("must run with root privileges");
    }

    let owner = Owner::from_env();
    fs::create_dir_all(config::media_root())?;

    let daemon: Shared = Arc::new(Daemon {
        state: tokio::sync::Mutex::new(StorageState::new()),
        mounter: Mounter::new(owner, config::media_root().to_path_buf()),
    });

    // Deterministic state before any live event can race the scan.
    scan::initial_scan(&daemon).await;

    let uevents = udev::spawn_listener()?;

    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    workers.spawn(udev::run(daemon.clone(), uevents));
    workers.spawn(cfe_hat::run(daemon.clone()));
    workers.spawn(watchdog::run_nvme_death(daemon.clone()));
    workers.spawn(watchdog::run_sanity(daemon.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    info!("cinedock automount daemon ready");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                break;
            }
            // Workers run forever; one finishing means coverage was lost,
            // which must be visible instead of silent.
            Some(result) = workers.join_next() => match result {
                Ok(Ok(())) => warn!("worker exited cleanly but unexpectedly"),
                Ok(Err(err)) => error!(error = %err, "worker failed"),
                Err(err) => error!(error = %err, "worker panicked"),
            },
        }
    }

    shutdown(&daemon).await;
    Ok(())
}

/// Best-effort teardown: lazily unmount everything we track and restore
/// the sysctls, then let the process exit 0.
async fn shutdown(daemon: &Shared) {
    let mut st = daemon.state.lock().await;
    let tracked = st.tracked_devnodes();
    info!(devices = tracked.len(), "unmounting everything before exit");
    st.clear_raw_pool();
    st.active_raw = None;
    for devnode in tracked {
        daemon.mounter.unmount(&mut st, &devnode);
    }
    info!("cinedock automount daemon stopped");
}
