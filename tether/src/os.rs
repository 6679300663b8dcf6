//! Hard process termination.
//!
//! The only unsafe in this crate: delivering SIGKILL by pid. The
//! supervisor prefers the cooperative shutdown protocol; this is the
//! last resort for workers that stopped answering.

#![allow(unsafe_code)]

use std::io;

#[cfg(unix)]
pub(crate) fn force_kill(pid: u32) -> io::Result<()> {
    // SAFETY: kill(2) takes plain integers and touches no memory.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
pub(crate) fn force_kill(pid: u32) -> io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .output()
        .map(|_| ())
}
