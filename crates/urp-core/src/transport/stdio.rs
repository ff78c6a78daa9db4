//! The stdio-relocation dance for a server embedded in a process whose
//! stdin/stdout are otherwise spoken for: duplicate the original descriptors
//! aside for the protocol to use, then point the process-visible stdin at
//! `/dev/null` and stdout at stderr, so anything the host program or its
//! dependencies print doesn't corrupt the framing.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Relocates fds 0 and 1. Returns the *original* stdin and stdout,
/// duplicated aside, for the caller to wrap as the actual transport (e.g.
/// via `std::os::fd::OwnedFd` -> `std::net::UnixStream` -> `tokio`).
///
/// Unix-only: the descriptor-duplication trick this performs has no
/// equivalent on Windows.
pub fn relocate_stdio_for_embedded_server() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let original_stdin = dup_fd(0)?;
    let original_stdout = dup_fd(1)?;

    let devnull = File::open("/dev/null")?;
    checked(unsafe { libc::dup2(devnull.as_raw_fd(), 0) })?;
    checked(unsafe { libc::dup2(2, 1) })?;

    Ok((original_stdin, original_stdout))
}

fn dup_fd(fd: i32) -> std::io::Result<OwnedFd> {
    let dup = checked(unsafe { libc::dup(fd) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

fn checked(ret: i32) -> std::io::Result<i32> {
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
