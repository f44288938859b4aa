//! Raw link-layer access for sending pre-framed packets.

use super::Device;
use std::io;
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
use nix::sys::socket::{send, MsgFlags};
#[cfg(target_os = "linux")]
use std::os::fd::{AsRawFd, OwnedFd};

/// An `AF_PACKET` socket bound to one interface. Frames written to it go out
/// on the wire as-is.
pub struct PacketSocket {
    #[cfg(target_os = "linux")]
    fd: Option<OwnedFd>,
    ifname: String,
}

impl PacketSocket {
    #[cfg(target_os = "linux")]
    pub fn open(ifname: &str) -> io::Result<Self> {
        use nix::net::if_::if_nametoindex;
        use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};

        let ifindex = if_nametoindex(ifname)?;
        let fd = socket(
            AddressFamily::Packet,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::EthAll,
        )?;

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as libc::c_ushort;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = ifindex as libc::c_int;

        // SAFETY: sll is a fully initialised sockaddr_ll and the length matches.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::info!(ifname, ifindex, "raw packet socket bound");
        Ok(Self {
            fd: Some(fd),
            ifname: ifname.to_string(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(ifname: &str) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("raw link sockets are not supported here ({ifname})"),
        ))
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }
}

#[cfg(target_os = "linux")]
impl Device for PacketSocket {
    fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        // Send-only: receiving belongs to a separate capture element.
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))?;
        Ok(send(fd.as_raw_fd(), buf, MsgFlags::empty())?)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn close(&mut self) {
        self.fd = None;
    }
}

#[cfg(not(target_os = "linux"))]
impl Device for PacketSocket {
    fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn send(&self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}
