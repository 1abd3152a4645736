// SPDX-License-Identifier: GPL-3.0-only

//! Raw descriptor helpers for helper-process pipes
//!
//! Thin wrappers over `fcntl(2)` and `poll(2)`.

use std::io;
use std::os::unix::io::RawFd;
use tracing::debug;

/// Readiness bits callers care about
pub(crate) const READABLE: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
pub(crate) const WRITABLE: libc::c_short = libc::POLLOUT | libc::POLLHUP | libc::POLLERR;

fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Put a descriptor into non-blocking mode
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

/// Keep a descriptor from leaking into later children
pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    if flags & libc::FD_CLOEXEC == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    }
    Ok(())
}

/// Kernel buffer size of the pipe behind `fd`, if the platform tells
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn pipe_capacity(fd: RawFd) -> Option<usize> {
    match unsafe { libc::fcntl(fd, libc::F_GETPIPE_SZ) } {
        size if size > 0 => Some(size as usize),
        _ => {
            debug!(error = %io::Error::last_os_error(), "F_GETPIPE_SZ failed");
            None
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn pipe_capacity(_fd: RawFd) -> Option<usize> {
    None
}

/// Capacity of a freshly created pipe on this host
///
/// Falls back to [`FALLBACK_PIPE_CAPACITY`](crate::constants::FALLBACK_PIPE_CAPACITY)
/// when it cannot be determined.
pub fn host_pipe_capacity() -> usize {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return crate::constants::FALLBACK_PIPE_CAPACITY;
    }
    let capacity = pipe_capacity(fds[0]);
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
    capacity.unwrap_or(crate::constants::FALLBACK_PIPE_CAPACITY)
}

/// Wait for readiness on `fds`
///
/// `timeout_ms` follows `poll(2)`: zero returns immediately, negative waits
/// without limit. An interrupted wait reports nothing ready.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> io::Result<usize> {
    if fds.is_empty() {
        return Ok(0);
    }
    let result = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(result as usize)
}

/// A `pollfd` asking for `events` on `fd`
pub(crate) fn interest(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}
