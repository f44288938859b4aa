use std::io;

use thiserror::Error;

/// Errors surfaced by the tun and raw-link components.
///
/// Only `DeviceUnavailable`, `Configuration` and `InvalidConfig` ever leave a
/// component as a hard failure. The remaining variants describe conditions the
/// transfer loops absorb locally; they exist so diagnostics and counters can
/// name what happened.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no tunnel device could be opened ({tried} candidates tried): {source}")]
    DeviceUnavailable {
        tried: usize,
        #[source]
        source: io::Error,
    },

    #[error("could not configure {dev_name}: {source}")]
    Configuration {
        dev_name: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transient I/O error: {0}")]
    TransientIo(#[source] io::Error),

    #[error("I/O error: {0}")]
    PersistentIo(#[source] io::Error),

    #[error("packet of {len} bytes exceeds MTU {mtu}")]
    OversizeDropped { len: usize, mtu: usize },

    #[error("retry slot occupied, packet rejected")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which way a packet was moving when an I/O error hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

impl Error {
    /// Sort a device error into transient or persistent.
    ///
    /// Would-block and interrupted calls are transient in both directions. A
    /// full device queue (`ENOBUFS`) is backpressure on the write side, but on
    /// the read side it signals resource exhaustion and counts as persistent.
    pub fn classify(direction: Direction, err: io::Error) -> Error {
        if is_transient(direction, &err) {
            Error::TransientIo(err)
        } else {
            Error::PersistentIo(err)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientIo(_))
    }
}

fn is_transient(direction: Direction, err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => true,
        _ => direction == Direction::Write && err.raw_os_error() == Some(libc::ENOBUFS),
    }
}
