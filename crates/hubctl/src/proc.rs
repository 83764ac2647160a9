//! Background-process bookkeeping: state directory, PID file, signalling.

use anyhow::Context as _;
use std::path::PathBuf;

/// `~/.mcp-hub`, created on first use.
pub fn state_dir() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .context("cannot determine home directory")?;
    let dir = PathBuf::from(home).join(".mcp-hub");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create state dir {}", dir.display()))?;
    Ok(dir)
}

pub fn pid_file() -> anyhow::Result<PathBuf> {
    Ok(state_dir()?.join("proxy.pid"))
}

pub fn log_file() -> anyhow::Result<PathBuf> {
    Ok(state_dir()?.join("proxy.log"))
}

/// Read the PID file and verify the process is alive. A stale file is
/// cleaned up and reported as absent.
pub fn read_live_pid() -> anyhow::Result<Option<i32>> {
    let path = pid_file()?;
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Ok(None);
    };
    let Ok(pid) = text.trim().parse::<i32>() else {
        let _ = std::fs::remove_file(&path);
        return Ok(None);
    };
    if process_alive(pid) {
        Ok(Some(pid))
    } else {
        let _ = std::fs::remove_file(&path);
        Ok(None)
    }
}

pub fn save_pid(pid: u32) -> anyhow::Result<()> {
    let path = pid_file()?;
    std::fs::write(&path, pid.to_string())
        .with_context(|| format!("write PID file {}", path.display()))
}

pub fn remove_pid_file() -> anyhow::Result<()> {
    let path = pid_file()?;
    if path.exists() {
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
pub fn process_alive(pid: i32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(unix)]
pub fn terminate(pid: i32) -> anyhow::Result<()> {
    anyhow::ensure!(
        unsafe { libc::kill(pid, libc::SIGTERM) } == 0,
        "cannot signal process {pid}: {}",
        std::io::Error::last_os_error()
    );
    Ok(())
}

#[cfg(unix)]
pub fn force_kill(pid: i32) -> anyhow::Result<()> {
    anyhow::ensure!(
        unsafe { libc::kill(pid, libc::SIGKILL) } == 0,
        "cannot kill process {pid}: {}",
        std::io::Error::last_os_error()
    );
    Ok(())
}

#[cfg(not(unix))]
pub fn process_alive(_pid: i32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn terminate(_pid: i32) -> anyhow::Result<()> {
    anyhow::bail!("process signalling is not supported on this platform")
}

#[cfg(not(unix))]
pub fn force_kill(_pid: i32) -> anyhow::Result<()> {
    anyhow::bail!("process signalling is not supported on this platform")
}
