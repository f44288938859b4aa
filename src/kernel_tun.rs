//! Kernel tunnel element: exchanges IP packets with the host network stack
//! through a tun/tap pseudo-device.
//!
//! Output 0 carries IP packets read from the kernel. Output 1, if connected,
//! receives frames the kernel sent that are not valid IP; otherwise those are
//! dropped. Packets pushed in are written to the kernel.

use crate::buffer::PacketBuffer;
use crate::config::TunConfig;
use crate::configurator::{AddressConfigurator, Addressing};
use crate::device::{candidates, probe, Candidate, Device, DeviceOpener, Platform, Variant};
use crate::error::{Direction, Error, Result};
use crate::port::{Output, Port};
use crate::suppress::ErrorSuppression;
use crate::task::{CooperativeTask, Interest, Poll, ReadinessSignal, WaitFd};
use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unopened,
    /// Handle open, addressing not yet applied.
    Opened,
    /// Handle open, addressing applied; transferring packets.
    Running,
    /// Handle open but addressing failed. Transfers still work; cleanup
    /// still tries to undo whatever part of the addressing took effect.
    Failed,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Unopened => write!(f, "UNOPENED"),
            State::Opened => write!(f, "OPENED"),
            State::Running => write!(f, "RUNNING"),
            State::Failed => write!(f, "FAILED"),
            State::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    DeviceOpened,
    Configured,
    ConfigureFailed,
    Close,
}

impl State {
    pub fn on_event(self, ev: Event) -> Option<State> {
        use Event::*;
        use State::*;
        match (self, ev) {
            (Unopened, DeviceOpened) => Some(Opened),
            (Opened, Configured) => Some(Running),
            (Opened, ConfigureFailed) => Some(Failed),
            (Unopened | Opened | Running | Failed, Close) => Some(Closed),
            _ => None,
        }
    }

    /// Whether a device handle is held in this state.
    pub fn has_handle(self) -> bool {
        matches!(self, State::Opened | State::Running | State::Failed)
    }
}

/// Per-element counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunStats {
    /// Frames read from the device.
    pub received: u64,
    /// IP packets handed to output 0.
    pub delivered: u64,
    /// Non-IP or malformed frames handed to output 1.
    pub diverted: u64,
    /// Frames dropped on the read side: not IP with no output 1, or no output 0.
    pub dropped: u64,
    pub read_errors: u64,
    /// Packets written to the device.
    pub sent: u64,
    pub oversize_dropped: u64,
    /// Writes that hit a full device queue or would block.
    pub write_transient: u64,
    pub write_errors: u64,
    /// Packets pushed while no handle was open.
    pub dropped_inactive: u64,
}

pub struct KernelTun {
    config: TunConfig,
    state: State,
    device: Option<Box<dyn Device>>,
    variant: Option<Variant>,
    dev_name: Option<String>,
    configurator: Box<dyn AddressConfigurator>,
    addressing: Option<Addressing>,
    signal: ReadinessSignal,
    output: Port,
    diversion: Port,
    suppression: ErrorSuppression,
    stats: TunStats,
}

impl KernelTun {
    pub fn new(config: TunConfig, configurator: Box<dyn AddressConfigurator>) -> Self {
        let suppression = ErrorSuppression::new(config.ignore_queue_overflows);
        Self {
            config,
            state: State::Unopened,
            device: None,
            variant: None,
            dev_name: None,
            configurator,
            addressing: None,
            signal: ReadinessSignal::new(false),
            output: Port::default(),
            diversion: Port::default(),
            suppression,
            stats: TunStats::default(),
        }
    }

    /// Output 0: IP packets from the kernel.
    pub fn connect_output(&mut self, output: Box<dyn Output>) {
        self.output.connect(output);
    }

    /// Output 1: frames from the kernel that are not IP.
    pub fn connect_diversion(&mut self, output: Box<dyn Output>) {
        self.diversion.connect(output);
    }

    /// Open and configure the interface using the drivers of this platform.
    pub fn initialize(&mut self, opener: &mut dyn DeviceOpener) -> Result<()> {
        let list = candidates(Platform::current(), self.config.dev_name.as_deref());
        self.initialize_with(opener, &list)
    }

    /// Open the first working candidate, then apply addressing.
    ///
    /// A failure to open leaves the element unopened. A failure to configure
    /// leaves it open in the `Failed` state, so `close` still runs the
    /// teardown.
    pub fn initialize_with(
        &mut self,
        opener: &mut dyn DeviceOpener,
        candidates: &[Candidate],
    ) -> Result<()> {
        if self.state != State::Unopened {
            return Err(Error::InvalidConfig(format!(
                "cannot initialize in state {}",
                self.state
            )));
        }
        self.config.validate()?;

        let (variant, opened) = probe(opener, candidates)?;
        tracing::info!(dev = %opened.name, %variant, "tunnel device allocated");
        self.device = Some(opened.device);
        self.variant = Some(variant);
        self.dev_name = Some(opened.name.clone());
        self.transition(Event::DeviceOpened);

        let addressing = Addressing {
            dev_name: opened.name,
            variant,
            near: self.config.near(),
            mask: self.config.mask(),
            gateway: self.config.effective_gateway(),
            mtu: self.config.mtu,
            ether: variant.is_tap().then(|| self.config.ether_or_default()),
        };
        let applied = self.configurator.apply(&addressing);
        self.addressing = Some(addressing);
        // The device may already hold frames; look before the first wakeup.
        self.signal.set();

        match applied {
            Ok(()) => {
                self.transition(Event::Configured);
                Ok(())
            }
            Err(source) => {
                self.transition(Event::ConfigureFailed);
                let dev_name = self.dev_name.clone().unwrap_or_default();
                tracing::error!(dev = %dev_name, error = %source, "interface configuration failed");
                Err(Error::Configuration { dev_name, source })
            }
        }
    }

    /// Tear down: undo the addressing, then close the handle.
    ///
    /// Never fails and is safe to call more than once; a failing revert is
    /// logged and the handle is closed anyway.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        if let Some(addressing) = self.addressing.take() {
            if let Err(e) = self.configurator.revert(&addressing) {
                tracing::warn!(dev = %addressing.dev_name, error = %e, "could not bring interface down");
            }
        }
        if let Some(mut device) = self.device.take() {
            device.close();
            tracing::info!(dev = %self.dev_name.as_deref().unwrap_or(""), "tunnel device closed");
        }
        self.signal.clear();
        self.transition(Event::Close);
    }

    /// Write path: send one IP packet to the kernel.
    pub fn push(&mut self, mut packet: PacketBuffer) {
        let (Some(device), Some(variant)) = (self.device.as_ref(), self.variant) else {
            self.stats.dropped_inactive += 1;
            return;
        };

        if packet.len() > self.config.mtu {
            self.stats.oversize_dropped += 1;
            tracing::debug!(
                "{}",
                Error::OversizeDropped {
                    len: packet.len(),
                    mtu: self.config.mtu
                }
            );
            return;
        }

        variant
            .framing()
            .encapsulate(&mut packet, self.config.ether_or_default());

        match device.send(packet.data()) {
            Ok(_) => {
                self.stats.sent += 1;
                self.suppression.reset(Direction::Write);
            }
            Err(e) => {
                let err = Error::classify(Direction::Write, e);
                if err.is_transient() {
                    self.stats.write_transient += 1;
                } else {
                    self.stats.write_errors += 1;
                }
                if self.suppression.should_report(Direction::Write) {
                    tracing::warn!(dev = %self.dev_name.as_deref().unwrap_or(""), "write: {err}");
                }
            }
        }
    }

    /// Read path: move at most one frame from the kernel to an output.
    fn read_one(&mut self) -> Poll {
        let (Some(device), Some(variant)) = (self.device.as_ref(), self.variant) else {
            return Poll::Idle;
        };
        let framing = variant.framing();
        let mut packet = PacketBuffer::new(self.config.headroom, self.config.mtu + framing.header_len());

        let n = match device.recv(packet.spare_mut()) {
            Ok(0) => {
                self.signal.clear();
                return Poll::Idle;
            }
            Ok(n) => n,
            Err(e) => {
                let err = Error::classify(Direction::Read, e);
                if !err.is_transient() {
                    self.stats.read_errors += 1;
                    if self.suppression.should_report(Direction::Read) {
                        tracing::warn!(dev = %self.dev_name.as_deref().unwrap_or(""), "read: {err}");
                    }
                }
                self.signal.clear();
                return Poll::Idle;
            }
        };
        packet.commit(n);
        self.stats.received += 1;
        self.suppression.reset(Direction::Read);

        let inbound = framing.inbound(packet.data());
        packet.pull(inbound.header_len);

        if inbound.claims_ip && is_valid_ip(packet.data()) {
            match self.output.emit(packet) {
                Ok(()) => self.stats.delivered += 1,
                Err(_) => self.stats.dropped += 1,
            }
        } else {
            match self.diversion.emit(packet) {
                Ok(()) => self.stats.diverted += 1,
                Err(dropped) => {
                    self.stats.dropped += 1;
                    tracing::debug!(len = dropped.len(), "dropping non-IP frame");
                }
            }
        }
        Poll::DidWork
    }

    fn transition(&mut self, ev: Event) {
        match self.state.on_event(ev) {
            Some(next) => {
                tracing::debug!("{} --{:?}--> {}", self.state, ev, next);
                self.state = next;
            }
            None => tracing::warn!("no transition from {} on {:?}", self.state, ev),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn variant(&self) -> Option<Variant> {
        self.variant
    }

    pub fn dev_name(&self) -> Option<&str> {
        self.dev_name.as_deref()
    }

    pub fn stats(&self) -> TunStats {
        self.stats
    }

    pub fn suppression(&self) -> &ErrorSuppression {
        &self.suppression
    }

    /// Raised while the device may have frames to read.
    pub fn signal(&self) -> ReadinessSignal {
        self.signal.clone()
    }

    /// Read-only introspection by handler name.
    pub fn read_handler(&self, name: &str) -> Option<String> {
        match name {
            "dev_name" => self.dev_name.clone(),
            "variant" => self.variant.map(|v| v.to_string()),
            "state" => Some(self.state.to_string()),
            _ => None,
        }
    }
}

/// A complete IPv4 or IPv6 header, going by the version nibble.
fn is_valid_ip(data: &[u8]) -> bool {
    match data.first().map(|b| b >> 4) {
        Some(4) => Ipv4HeaderSlice::from_slice(data).is_ok(),
        Some(6) => Ipv6HeaderSlice::from_slice(data).is_ok(),
        _ => false,
    }
}

impl CooperativeTask for KernelTun {
    fn poll_once(&mut self) -> Poll {
        if !self.state.has_handle() {
            return Poll::Idle;
        }
        self.read_one()
    }

    fn is_ready(&self) -> bool {
        self.signal.is_set()
    }

    fn wait_fd(&self) -> Option<WaitFd> {
        let fd = self.device.as_ref()?.raw_fd()?;
        Some(WaitFd {
            fd,
            interest: Interest::Readable,
            signal: self.signal.clone(),
        })
    }
}

impl Output for KernelTun {
    fn push(&mut self, packet: PacketBuffer) {
        KernelTun::push(self, packet)
    }
}

impl Drop for KernelTun {
    fn drop(&mut self) {
        self.close();
    }
}
