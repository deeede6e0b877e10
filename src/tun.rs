//! Tunnel descriptor I/O.
//!
//! The host hands the engine an already-open fd for the platform tunnel
//! interface. The engine switches it to non-blocking and pumps bytes;
//! it never closes the fd, because the interface lifecycle belongs to
//! the host.

use std::io;
use std::os::fd::RawFd;

/// Non-blocking wrapper around the host-provided tunnel fd.
///
/// Reads return whole outgoing IP packets; writes deliver incoming
/// packets to the interface. There is deliberately no `Drop` impl.
#[derive(Debug)]
pub struct TunDevice {
    fd: RawFd,
}

impl TunDevice {
    /// Adopt `fd`, switching it to non-blocking mode.
    pub fn new(fd: RawFd) -> io::Result<Self> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid tunnel fd {fd}"),
            ));
        }
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0
            && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Read one packet. `Ok(None)` means nothing is pending right now.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n >= 0 {
                return if n == 0 { Ok(None) } else { Ok(Some(n as usize)) };
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    /// Write one packet. Surfaces `WouldBlock` so the caller can decide
    /// whether to drop (the interface queue is full).
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }
}
