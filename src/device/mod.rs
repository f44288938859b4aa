mod probe;
mod raw;
mod tun;
mod variant;

pub use self::probe::{candidates, probe, Candidate, DeviceOpener, Opened, Platform};
pub use self::raw::PacketSocket;
pub use self::tun::SystemOpener;
pub use self::variant::{Framing, Inbound, Lead, Variant};


use std::os::unix::io::RawFd;

/// A trait for network device I/O
///
/// Handles are expected to be non-blocking: a call that cannot make progress
/// returns `io::ErrorKind::WouldBlock`.
pub trait Device: Send {
    /// Receive one frame from the device
    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Send one frame to the device
    fn send(&self, buf: &[u8]) -> std::io::Result<usize>;

    /// Descriptor to wait on, for devices backed by one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Release the OS handle. Must not block or fail.
    fn close(&mut self) {}
}

/// Put a descriptor into non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
