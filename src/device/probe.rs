//! Finding a tunnel driver that will open.

use super::{Device, Variant};
use crate::error::{Error, Result};
use std::io;
use std::path::PathBuf;

/// Unit numbers tried for `/dev/tunN` and `/dev/tapN` style drivers.
pub const MAX_UNITS: u32 = 32;

/// One driver and path to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub variant: Variant,
    pub path: PathBuf,
    /// Interface name to request, for drivers that let us choose.
    pub name: Option<String>,
}

/// A successfully opened driver handle and the interface name it got.
pub struct Opened {
    pub device: Box<dyn Device>,
    pub name: String,
}

/// Opens candidates. The system implementation lives in `SystemOpener`;
/// tests substitute a mock.
pub trait DeviceOpener {
    fn open(&mut self, candidate: &Candidate) -> io::Result<Opened>;
}

/// Operating system families with their own driver sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    FreeBsd,
    MacOs,
    NetBsd,
}

impl Platform {
    pub fn current() -> Platform {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "netbsd") {
            Platform::NetBsd
        } else if cfg!(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )) {
            Platform::FreeBsd
        } else {
            Platform::Linux
        }
    }

    /// Drivers to try, best first.
    pub fn variants(self) -> &'static [Variant] {
        match self {
            Platform::Linux => &[Variant::LinuxUniversal, Variant::LinuxEthertap],
            Platform::FreeBsd => &[Variant::BsdTun, Variant::BsdTap],
            Platform::MacOs => &[Variant::MacosTun],
            Platform::NetBsd => &[Variant::NetbsdTun, Variant::NetbsdTap],
        }
    }
}

/// Candidates for `platform` in probing order.
///
/// With a name hint only the matching driver is tried: the universal Linux
/// driver is asked for that exact name, other drivers only open
/// `/dev/<hint>` when the hint names one of their units.
pub fn candidates(platform: Platform, dev_name: Option<&str>) -> Vec<Candidate> {
    let mut out = Vec::new();
    for &variant in platform.variants() {
        if variant == Variant::LinuxUniversal {
            out.push(Candidate {
                variant,
                path: PathBuf::from("/dev/net/tun"),
                name: dev_name.map(str::to_string),
            });
            if dev_name.is_some() {
                // The universal driver honours names itself.
                break;
            }
            continue;
        }

        let prefix = variant.dev_prefix();
        match dev_name {
            Some(hint) => {
                let unit = hint.strip_prefix(prefix).and_then(|n| n.parse::<u32>().ok());
                if unit.is_some() {
                    out.push(Candidate {
                        variant,
                        path: PathBuf::from(format!("/dev/{hint}")),
                        name: Some(hint.to_string()),
                    });
                }
            }
            None => out.extend((0..MAX_UNITS).map(|unit| Candidate {
                variant,
                path: PathBuf::from(format!("/dev/{prefix}{unit}")),
                name: None,
            })),
        }
    }
    out
}

/// Open the first candidate that works.
///
/// When none does, the error reported is the first one that is not a plain
/// "no such device"; those are what every unused unit returns and say
/// nothing about why the interesting ones failed.
pub fn probe(opener: &mut dyn DeviceOpener, candidates: &[Candidate]) -> Result<(Variant, Opened)> {
    let mut best: Option<io::Error> = None;
    for candidate in candidates {
        match opener.open(candidate) {
            Ok(opened) => {
                tracing::debug!(
                    variant = %candidate.variant,
                    path = %candidate.path.display(),
                    "opened tunnel driver"
                );
                return Ok((candidate.variant, opened));
            }
            Err(err) => {
                tracing::trace!(path = %candidate.path.display(), error = %err, "open failed");
                let replace = match &best {
                    None => true,
                    Some(prev) => is_absent(prev) && !is_absent(&err),
                };
                if replace {
                    best = Some(err);
                }
            }
        }
    }
    Err(Error::DeviceUnavailable {
        tried: candidates.len(),
        source: best.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no tunnel device matches the request")
        }),
    })
}

fn is_absent(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
        || matches!(err.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENXIO))
}
