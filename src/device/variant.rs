//! Tunnel driver flavours and the link framing each one uses.

use crate::buffer::PacketBuffer;
use crate::config::EtherAddress;
use etherparse::{EtherType, Ethernet2Header, Ethernet2HeaderSlice};
use std::fmt;

/// Source address written into Ethernet headers we hand to the kernel.
const PEER_ETHER: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

const ETHER_HEADER_LEN: usize = Ethernet2Header::LEN;

/// The tunnel driver an open handle talks to. Fixed once the handle is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// `/dev/net/tun` in tun mode with packet information.
    LinuxUniversal,
    /// The pre-2.4 `/dev/tapN` ethertap driver.
    LinuxEthertap,
    BsdTun,
    BsdTap,
    MacosTun,
    NetbsdTun,
    NetbsdTap,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::LinuxUniversal => write!(f, "linux-universal"),
            Variant::LinuxEthertap => write!(f, "linux-ethertap"),
            Variant::BsdTun => write!(f, "bsd-tun"),
            Variant::BsdTap => write!(f, "bsd-tap"),
            Variant::MacosTun => write!(f, "macos-tun"),
            Variant::NetbsdTun => write!(f, "netbsd-tun"),
            Variant::NetbsdTap => write!(f, "netbsd-tap"),
        }
    }
}

impl Variant {
    /// The single place where per-driver behaviour is decided.
    pub fn framing(self) -> Framing {
        match self {
            Variant::LinuxUniversal => Framing::PacketInfo,
            Variant::LinuxEthertap => Framing::Ethernet(Lead::Padding),
            Variant::BsdTap | Variant::NetbsdTap => Framing::Ethernet(Lead::None),
            Variant::BsdTun => Framing::AddressFamily,
            Variant::MacosTun | Variant::NetbsdTun => Framing::Raw,
        }
    }

    /// Whether the driver carries Ethernet frames (and so a hardware address).
    pub fn is_tap(self) -> bool {
        matches!(self.framing(), Framing::Ethernet(_))
    }

    /// Character device prefix under `/dev`, for the drivers opened by path.
    pub fn dev_prefix(self) -> &'static str {
        match self {
            Variant::LinuxUniversal => "net/tun",
            Variant::BsdTun | Variant::MacosTun | Variant::NetbsdTun => "tun",
            Variant::LinuxEthertap | Variant::BsdTap | Variant::NetbsdTap => "tap",
        }
    }
}

/// Bytes in front of the Ethernet header on Ethernet-framed drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lead {
    None,
    /// Two zero bytes.
    Padding,
}

impl Lead {
    fn len(self) -> usize {
        match self {
            Lead::None => 0,
            Lead::Padding => 2,
        }
    }
}

/// How packets are wrapped between us and the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Bare IP packets.
    Raw,
    /// A 32-bit network-order address family word, then the IP packet.
    AddressFamily,
    /// `struct tun_pi`: 16-bit flags, then the 16-bit EtherType of the IP packet.
    PacketInfo,
    /// An Ethernet header (after an optional lead), then the IP packet.
    Ethernet(Lead),
}

/// Result of unwrapping one frame read from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inbound {
    /// Bytes of driver framing in front of the payload.
    pub header_len: usize,
    /// Whether the framing claims the payload is IP.
    pub claims_ip: bool,
}

impl Framing {
    pub fn header_len(self) -> usize {
        match self {
            Framing::Raw => 0,
            Framing::AddressFamily | Framing::PacketInfo => 4,
            Framing::Ethernet(lead) => lead.len() + ETHER_HEADER_LEN,
        }
    }

    /// Work out where the payload of `frame` starts.
    ///
    /// Frames too short to hold the framing report a header covering the whole
    /// frame and never claim to carry IP.
    pub fn inbound(self, frame: &[u8]) -> Inbound {
        let header_len = self.header_len();
        if frame.len() < header_len {
            return Inbound {
                header_len: frame.len(),
                claims_ip: false,
            };
        }
        let claims_ip = match self {
            Framing::Raw | Framing::AddressFamily => true,
            Framing::PacketInfo => {
                let proto = EtherType(u16::from_be_bytes([frame[2], frame[3]]));
                proto == EtherType::IPV4 || proto == EtherType::IPV6
            }
            Framing::Ethernet(lead) => Ethernet2HeaderSlice::from_slice(&frame[lead.len()..])
                .map(|eth| {
                    let ty = eth.ether_type();
                    ty == EtherType::IPV4 || ty == EtherType::IPV6
                })
                .unwrap_or(false),
        };
        Inbound {
            header_len,
            claims_ip,
        }
    }

    /// Prepend the driver framing to an IP packet, using its headroom.
    pub fn encapsulate(self, packet: &mut PacketBuffer, ether: EtherAddress) {
        let is_v6 = packet.data().first().map(|b| b >> 4) == Some(6);
        let ether_type = if is_v6 { EtherType::IPV6 } else { EtherType::IPV4 };
        match self {
            Framing::Raw => {}
            Framing::AddressFamily => {
                let family = (if is_v6 { libc::AF_INET6 } else { libc::AF_INET }) as u32;
                packet.push(4).copy_from_slice(&family.to_be_bytes());
            }
            Framing::PacketInfo => {
                let pi = packet.push(4);
                pi[..2].fill(0);
                pi[2..].copy_from_slice(&ether_type.0.to_be_bytes());
            }
            Framing::Ethernet(lead) => {
                let header = Ethernet2Header {
                    source: PEER_ETHER,
                    destination: ether.octets(),
                    ether_type,
                };
                packet
                    .push(ETHER_HEADER_LEN)
                    .copy_from_slice(&header.to_bytes());
                if lead == Lead::Padding {
                    packet.push(2).fill(0);
                }
            }
        }
    }
}
