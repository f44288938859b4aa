use super::{set_nonblocking, Candidate, Device, DeviceOpener, Opened, Variant};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

/// Opens the real tunnel drivers.
#[derive(Debug, Default)]
pub struct SystemOpener;

impl DeviceOpener for SystemOpener {
    fn open(&mut self, candidate: &Candidate) -> io::Result<Opened> {
        match candidate.variant {
            #[cfg(target_os = "linux")]
            Variant::LinuxUniversal => {
                let tun = UniversalTun::new(candidate.name.as_deref().unwrap_or(""))?;
                let name = tun.device.name().to_string();
                Ok(Opened {
                    device: Box::new(tun),
                    name,
                })
            }
            #[cfg(not(target_os = "linux"))]
            Variant::LinuxUniversal => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the universal TUN/TAP driver is Linux only",
            )),
            _ => {
                let dev = CharDevice::open(candidate)?;
                let name = candidate.name.clone().unwrap_or_else(|| {
                    candidate
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                });
                Ok(Opened {
                    device: Box::new(dev),
                    name,
                })
            }
        }
    }
}

// UniversalTun wraps /dev/net/tun in tun mode, with packet information
#[cfg(target_os = "linux")]
pub struct UniversalTun {
    device: tun_tap::Iface,
}

#[cfg(target_os = "linux")]
impl UniversalTun {
    pub fn new(name: &str) -> io::Result<Self> {
        let device = tun_tap::Iface::new(name, tun_tap::Mode::Tun)?;
        set_nonblocking(device.as_raw_fd())?;
        Ok(Self { device })
    }
}

#[cfg(target_os = "linux")]
impl Device for UniversalTun {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.device.send(buf) // Direct passthrough
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.device.as_raw_fd())
    }
}

/// A `/dev/tunN` or `/dev/tapN` character device.
pub struct CharDevice {
    file: Option<File>,
}

impl CharDevice {
    fn open(candidate: &Candidate) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&candidate.path)?;
        set_nonblocking(file.as_raw_fd())?;
        Ok(Self { file: Some(file) })
    }

    fn file(&self) -> io::Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device closed"))
    }
}

impl Device for CharDevice {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file()?;
        file.read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file()?;
        file.write(buf)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    fn close(&mut self) {
        self.file = None;
    }
}
