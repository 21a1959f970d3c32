//! Raw packet sockets for socket-filter programs
//!
//! A filter sees every packet of the host network namespace: the socket is
//! `AF_PACKET`/`SOCK_RAW` bound to `ETH_P_ALL`. The program itself is
//! attached to the socket by the backend (`SO_ATTACH_BPF` through aya).

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use super::attach::AttachError;
use super::handles::{Closer, ReleaseError};

/// Protocol argument for `socket(2)`: `ETH_P_ALL` in network byte order.
pub fn eth_p_all_be() -> libc::c_int {
    htons(libc::ETH_P_ALL as u16) as libc::c_int
}

fn htons(v: u16) -> u16 {
    v.to_be()
}

/// Open the raw packet socket a filter program is attached to.
pub fn open_packet_socket(program: &str) -> Result<OwnedFd, AttachError> {
    // SAFETY: plain syscall, the result is checked below.
    let raw = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            eth_p_all_be(),
        )
    };
    if raw < 0 {
        return Err(AttachError::SocketFailure {
            program: program.to_string(),
            reason: format!("socket: {}", io::Error::last_os_error()),
        });
    }
    // SAFETY: `raw` is a freshly opened descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// An open raw socket carrying a filter program.
///
/// Closing the socket removes the filter with it.
#[derive(Debug)]
pub struct SocketFilterHandle {
    program: String,
    fd: Option<OwnedFd>,
}

impl SocketFilterHandle {
    pub fn new(program: impl Into<String>, fd: OwnedFd) -> Self {
        Self {
            program: program.into(),
            fd: Some(fd),
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn socket(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }
}

impl Closer for SocketFilterHandle {
    fn close(&mut self) -> Result<(), ReleaseError> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let raw = fd.into_raw_fd();
        // SAFETY: `raw` came from an OwnedFd we just gave up, so nobody else closes it.
        if unsafe { libc::close(raw) } != 0 {
            return Err(ReleaseError {
                label: self.program.clone(),
                reason: io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }
}
