//! Observing and signalling host processes by pid

use crate::errors::RuntimeError;
use regex::Regex;
use std::{
    fs::File,
    io::{self, Read},
    time::{Duration, Instant},
};

/// How long `terminate` waits between SIGTERM and SIGKILL
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn read_proc_status(pid: u32) -> io::Result<String> {
    let path = format!("/proc/{}/status", pid);
    let mut file = File::open(path)?;
    let mut string = String::with_capacity(4096);
    file.read_to_string(&mut string)?;
    Ok(string)
}

/// Single-letter scheduler state from `/proc/<pid>/status`, if the process
/// table has an entry for this pid
fn proc_state(pid: u32) -> Option<char> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"(?m)^State:\s+([A-Za-z])").unwrap();
    }
    let status = read_proc_status(pid).ok()?;
    RE.captures(&status)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().chars().next())
}

/// Does this pid name a live process?
///
/// Zombies and dead entries count as not alive, since they will never run
/// again. Pid 0 is never alive.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if cfg!(target_os = "linux") {
        match proc_state(pid) {
            Some('Z') | Some('X') | Some('x') => false,
            Some(_) => true,
            None => false,
        }
    } else {
        match unsafe { libc::kill(pid as libc::pid_t, 0) } {
            0 => true,
            _ => io::Error::last_os_error().raw_os_error() == Some(libc::EPERM),
        }
    }
}

/// Deliver one signal to one process
pub fn signal(pid: u32, signal: i32) -> Result<(), RuntimeError> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(RuntimeError::Signal {
            pid,
            signal,
            source: io::Error::from_raw_os_error(libc::ESRCH),
        });
    }
    match unsafe { libc::kill(pid as libc::pid_t, signal) } {
        0 => Ok(()),
        _ => Err(RuntimeError::Signal {
            pid,
            signal,
            source: io::Error::last_os_error(),
        }),
    }
}

/// Ask a process to exit, then insist
///
/// Sends SIGTERM and waits up to `grace` for the process to go away, checking
/// every 100 ms. If it's still there, SIGKILL follows; failures of that last
/// signal are ignored, since the process may have exited on its own in the
/// meantime.
pub async fn terminate(pid: u32, grace: Duration) -> Result<(), RuntimeError> {
    log::debug!("sending SIGTERM to pid {}", pid);
    signal(pid, libc::SIGTERM)?;
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            log::debug!("pid {} exited within the grace period", pid);
            return Ok(());
        }
        tokio::time::delay_for(POLL_INTERVAL).await;
    }
    if is_alive(pid) {
        log::debug!("pid {} still alive after {:?}, sending SIGKILL", pid, grace);
        if let Err(err) = signal(pid, libc::SIGKILL) {
            log::debug!("ignoring {}", err);
        }
    }
    Ok(())
}
