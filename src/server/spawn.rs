//! Detached launcher spawning and pid tracking.
//!
//! `create_session` / `start_folder_session` spawn a launcher process that
//! outlives the hub's client connections. The hub keeps the spawned pids
//! so shutdown can politely terminate them; the set is swept for dead
//! processes on a slow cadence to bound memory.

use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Cadence of the dead-pid sweep.
pub const PID_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

/// Spawn a detached launcher for a session. Returns the child pid.
pub fn spawn_detached_launcher(
    id: &str,
    cwd: &Path,
    skip_permissions: bool,
    pids: &Mutex<HashSet<u32>>,
) -> std::io::Result<u32> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("launch")
        .arg("--id")
        .arg(id)
        .arg("--cwd")
        .arg(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if skip_permissions {
        cmd.arg("--skip-permissions");
    }

    let child = cmd.spawn()?;
    let pid = child.id();
    pids.lock().insert(pid);
    info!(session_id = %id, pid, "spawned detached launcher");
    Ok(pid)
}

/// Whether a process is still alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Ask a launcher to exit.
#[cfg(unix)]
pub fn terminate_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32) {}

/// Drop pids whose processes are gone.
pub fn sweep_dead_pids(pids: &Mutex<HashSet<u32>>) {
    let mut pids = pids.lock();
    let before = pids.len();
    pids.retain(|&pid| pid_alive(pid));
    let removed = before - pids.len();
    if removed > 0 {
        debug!(removed, "swept dead launcher pids");
    }
}

/// Politely terminate every tracked launcher (hub shutdown).
pub fn terminate_all(pids: &Mutex<HashSet<u32>>) {
    let pids = pids.lock();
    for &pid in pids.iter() {
        if pid_alive(pid) {
            debug!(pid, "terminating tracked launcher");
            terminate_pid(pid);
        } else {
            warn!(pid, "tracked launcher already gone");
        }
    }
}
