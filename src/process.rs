//! Child process bookkeeping.
//!
//! Every spawned worker is registered so that a termination signal to the
//! parent can take its children down with it. Termination always escalates:
//! polite terminate, a grace window, then a forced kill.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::error::{Result, SubforgeError};

/// File name of the isolated translation worker binary.
pub const WORKER_BINARY: &str = if cfg!(windows) { "subforge-worker.exe" } else { "subforge-worker" };

/// Live child PIDs, shared between the pipeline and the signal listener.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    pids: Arc<Mutex<BTreeSet<u32>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32) {
        debug!("Registered child process {}", pid);
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).insert(pid);
    }

    pub fn unregister(&self, pid: u32) {
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).remove(&pid);
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Terminate every registered process, escalating to a kill after `grace`.
    pub async fn terminate_all(&self, grace: Duration) {
        let pids = self.pids();
        if pids.is_empty() {
            return;
        }
        warn!("Terminating {} child processes", pids.len());

        for &pid in &pids {
            signal_group(pid, "TERM").await;
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut alive: Vec<u32> = pids.clone();
        while !alive.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut still = Vec::new();
            for pid in alive {
                if is_alive(pid).await {
                    still.push(pid);
                }
            }
            alive = still;
        }

        for pid in alive {
            warn!("Child process {} ignored terminate, killing it", pid);
            send_signal(pid, "KILL").await;
        }
        for pid in pids {
            // grandchildren (the inference sidecar) may outlive the worker
            signal_group_only(pid, "KILL").await;
            self.unregister(pid);
        }
    }
}

fn valid_pid(pid: u32) -> bool {
    pid != 0 && pid <= i32::MAX as u32
}

#[cfg(unix)]
async fn send_signal(pid: u32, signal: &str) {
    if !valid_pid(pid) {
        warn!("Skipping signal for invalid pid {}", pid);
        return;
    }
    let result = tokio::process::Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .output()
        .await;
    if let Err(e) = result {
        debug!("Could not signal {}: {}", pid, e);
    }
}

/// Signal the process group led by `pid`, or just `pid` when it leads none.
async fn signal_group(pid: u32, signal: &str) {
    if !signal_group_only(pid, signal).await {
        send_signal(pid, signal).await;
    }
}

/// Signal every member of the process group led by `pid`. False when no
/// such group exists.
#[cfg(unix)]
async fn signal_group_only(pid: u32, signal: &str) -> bool {
    if !valid_pid(pid) {
        return false;
    }
    tokio::process::Command::new("kill")
        .arg(format!("-{}", signal))
        .arg("--")
        .arg(format!("-{}", pid))
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn signal_group_only(_pid: u32, _signal: &str) -> bool {
    false
}

#[cfg(not(unix))]
async fn send_signal(pid: u32, _signal: &str) {
    if !valid_pid(pid) {
        return;
    }
    let _ = tokio::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()
        .await;
}

#[cfg(unix)]
async fn is_alive(pid: u32) -> bool {
    if !valid_pid(pid) {
        return false;
    }
    tokio::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn is_alive(_pid: u32) -> bool {
    false
}

/// Terminate an owned child and its process group, escalating to a kill
/// after `grace`. Whatever is left of the group afterwards is killed too.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Result<()> {
    if let Ok(Some(_)) = child.try_wait() {
        return Ok(());
    }
    let Some(pid) = child.id() else {
        return Ok(());
    };

    if cfg!(unix) {
        signal_group(pid, "TERM").await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Child {} exited after terminate: {}", pid, status);
                signal_group_only(pid, "KILL").await;
                return Ok(());
            }
            Ok(Err(e)) => return Err(SubforgeError::Io(e)),
            Err(_) => warn!("Child {} did not exit within {:?}, killing it", pid, grace),
        }
        signal_group(pid, "KILL").await;
    }

    if let Ok(Some(_)) = child.try_wait() {
        return Ok(());
    }
    child.kill().await.map_err(SubforgeError::Io)
}

/// Kill whatever is left of the process group a finished child led.
pub async fn kill_process_group(pid: u32) {
    if signal_group_only(pid, "KILL").await {
        warn!("Killed processes left behind by child {}", pid);
    }
}

/// On SIGINT/SIGTERM, take every registered child down and exit.
pub fn spawn_signal_listener(registry: ProcessRegistry, grace: Duration) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            warn!("Signal handling unavailable: {}", e);
            return;
        }
        warn!("Shutdown requested, cleaning up child processes");
        registry.terminate_all(grace).await;
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}

/// Locate the worker binary: configured path, next to the running
/// executable, one directory up (test harness layout), else `PATH`.
pub fn find_worker_binary(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(WORKER_BINARY);
            if sibling.exists() {
                return sibling;
            }
            if let Some(up) = dir.parent() {
                let candidate = up.join(WORKER_BINARY);
                if candidate.exists() {
                    return candidate;
                }
            }
        }
    }

    PathBuf::from(WORKER_BINARY)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn terminate_child_stops_a_sleeper() {
        let mut child = Command::new("sh").args(["-c", "sleep 30"]).spawn().unwrap();
        terminate_child(&mut child, Duration::from_secs(2)).await.unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
            .spawn()
            .unwrap();
        // let the trap install
        tokio::time::sleep(Duration::from_millis(200)).await;

        terminate_child(&mut child, Duration::from_millis(300)).await.unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn registry_terminates_registered_children() {
        let registry = ProcessRegistry::new();
        let mut child = Command::new("sh").args(["-c", "sleep 30"]).spawn().unwrap();
        registry.register(child.id().unwrap());

        registry.terminate_all(Duration::from_secs(2)).await;
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(registry.pids().is_empty());
    }

    /// Running and not a zombie.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// A worker leading its own process group, with a grandchild that
    /// ignores TERM like a busy inference sidecar.
    #[cfg(target_os = "linux")]
    async fn spawn_worker_with_sidecar(dir: &Path) -> (tokio::process::Child, u32) {
        let pid_file = dir.join("sidecar.pid");
        let script = format!(
            "sh -c 'trap \"\" TERM; while :; do sleep 1; done' &\necho $! > '{}'\nwait\n",
            pid_file.display()
        );
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse::<u32>() {
                    // let the trap install
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    return (child, pid);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("sidecar never started");
    }

    #[cfg(target_os = "linux")]
    async fn gone_within(pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        !is_running(pid)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_child_takes_the_sidecar_down() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, sidecar) = spawn_worker_with_sidecar(dir.path()).await;
        assert!(is_running(sidecar));

        terminate_child(&mut worker, Duration::from_millis(500)).await.unwrap();

        assert!(worker.try_wait().unwrap().is_some());
        assert!(gone_within(sidecar, Duration::from_secs(3)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn shutdown_takes_registered_sidecars_down() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, sidecar) = spawn_worker_with_sidecar(dir.path()).await;
        let registry = ProcessRegistry::new();
        registry.register(worker.id().unwrap());

        registry.terminate_all(Duration::from_millis(500)).await;

        tokio::time::timeout(Duration::from_secs(5), worker.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(gone_within(sidecar, Duration::from_secs(3)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn leftover_group_members_are_killed_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, sidecar) = spawn_worker_with_sidecar(dir.path()).await;
        let pid = worker.id().unwrap();
        // the worker dies alone, as after an abort
        send_signal(pid, "KILL").await;
        worker.wait().await.unwrap();
        assert!(is_running(sidecar));

        kill_process_group(pid).await;
        assert!(gone_within(sidecar, Duration::from_secs(3)).await);
    }

    #[test]
    fn configured_worker_path_wins() {
        let path = find_worker_binary(Some(Path::new("/opt/bin/worker")));
        assert_eq!(path, PathBuf::from("/opt/bin/worker"));
    }
}
