//! Resolved element options.
//!
//! Keys follow the element keyword names (`ADDR`, `GATEWAY`, `HEADROOM`,
//! `MTU`, `ETHER`, `IGNORE_QUEUE_OVERFLOWS`, `DEV_NAME`, `USE_Q`). Parsing a
//! configuration string into these structs happens elsewhere; any serde
//! format will do.

use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub const DEFAULT_HEADROOM: usize = 28;
pub const DEFAULT_MTU: usize = 1500;

/// Smallest MTU an IPv4 interface may carry.
const MIN_MTU: usize = 68;

fn default_headroom() -> usize {
    DEFAULT_HEADROOM
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

/// Options for a kernel tunnel interface.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct TunConfig {
    /// Near (kernel-side) address and prefix, e.g. `10.0.0.1/24`.
    pub addr: Ipv4Net,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default = "default_headroom")]
    pub headroom: usize,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default)]
    pub ether: Option<EtherAddress>,
    #[serde(default)]
    pub ignore_queue_overflows: bool,
    #[serde(default)]
    pub dev_name: Option<String>,
}

impl TunConfig {
    /// Config with defaults for everything but the address.
    pub fn new(near: Ipv4Addr, mask: Ipv4Addr) -> Result<Self> {
        let mask_bits = u32::from(mask);
        if mask_bits.leading_ones() != mask_bits.count_ones() {
            return Err(Error::InvalidConfig(format!("netmask {mask} is not contiguous")));
        }
        let addr = Ipv4Net::new(near, mask_bits.count_ones() as u8)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(Self {
            addr,
            gateway: None,
            headroom: DEFAULT_HEADROOM,
            mtu: DEFAULT_MTU,
            ether: None,
            ignore_queue_overflows: false,
            dev_name: None,
        })
    }

    pub fn near(&self) -> Ipv4Addr {
        self.addr.addr()
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.addr.netmask()
    }

    /// The configured hardware address, or the stock `00:01:02:03:04:05`.
    pub fn ether_or_default(&self) -> EtherAddress {
        self.ether.unwrap_or(EtherAddress::DEFAULT)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU {
            return Err(Error::InvalidConfig(format!(
                "MTU {} below minimum {MIN_MTU}",
                self.mtu
            )));
        }
        if let Some(gw) = self.gateway {
            if !gw.is_unspecified() && !self.addr.contains(&gw) {
                return Err(Error::InvalidConfig(format!(
                    "gateway {gw} is not on network {}",
                    self.addr.trunc()
                )));
            }
        }
        if let Some(name) = &self.dev_name {
            if name.is_empty() || name.len() >= libc::IFNAMSIZ {
                return Err(Error::InvalidConfig(format!("bad device name {name:?}")));
            }
        }
        Ok(())
    }

    /// Gateway to route through, ignoring an explicit `0.0.0.0`.
    pub fn effective_gateway(&self) -> Option<Ipv4Addr> {
        self.gateway.filter(|gw| !gw.is_unspecified())
    }
}

/// Options for a raw link-layer sender.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct SenderConfig {
    pub devname: String,
    #[serde(default)]
    pub use_q: bool,
    #[serde(default)]
    pub ignore_queue_overflows: bool,
    /// Largest frame accepted for sending. Unlimited when absent.
    #[serde(default)]
    pub mtu: Option<usize>,
}

impl SenderConfig {
    pub fn new(devname: impl Into<String>) -> Self {
        Self {
            devname: devname.into(),
            use_q: false,
            ignore_queue_overflows: false,
            mtu: None,
        }
    }
}

/// A 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct EtherAddress(pub [u8; 6]);

impl EtherAddress {
    pub const DEFAULT: EtherAddress = EtherAddress([0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for EtherAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for EtherAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidConfig(format!("bad Ethernet address {s:?}"));
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(bad)?;
            if part.is_empty() || part.len() > 2 {
                return Err(bad());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| bad())?;
        }
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(EtherAddress(octets))
    }
}

impl TryFrom<String> for EtherAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}
