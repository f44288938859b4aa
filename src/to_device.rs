//! Raw link-layer sender.
//!
//! Sends already-framed packets out a network device. It can be pushed to,
//! or scheduled as a task that pulls from an upstream queue. Packets that
//! were written go to the success output if connected; packets that could not
//! be written go to the failure output if connected. Both are otherwise freed.
//!
//! With `use_q`, a write that fails because the device queue is momentarily
//! full parks the packet in a one-packet retry slot instead of failing it.
//! The slot is always drained before anything newer is sent.

use crate::buffer::PacketBuffer;
use crate::config::SenderConfig;
use crate::device::{Device, PacketSocket};
use crate::error::{Direction, Error, Result};
use crate::port::{Output, Port, Upstream};
use crate::suppress::ErrorSuppression;
use crate::task::{CooperativeTask, Interest, Poll, ReadinessSignal, WaitFd};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub sent: u64,
    /// Packets parked in the retry slot after a transient failure.
    pub queued: u64,
    /// Retry attempts of the parked packet.
    pub retries: u64,
    /// Packets rejected because the retry slot was occupied.
    pub overflow: u64,
    pub oversize_dropped: u64,
    /// Packets that failed to send and were not kept for retry.
    pub failed: u64,
    /// A parked packet destroyed at teardown.
    pub dropped_at_close: u64,
}

/// What happened to one write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Sent,
    Parked,
    Failed,
}

pub struct ToDevice {
    config: SenderConfig,
    device: Option<Box<dyn Device>>,
    upstream: Option<Box<dyn Upstream>>,
    upstream_signal: ReadinessSignal,
    /// Cleared while a parked packet waits for a descriptor-backed device to
    /// drain; the scheduler raises it again on POLLOUT.
    writable: ReadinessSignal,
    success: Port,
    failure: Port,
    retry: Option<PacketBuffer>,
    suppression: ErrorSuppression,
    stats: SenderStats,
}

impl ToDevice {
    pub fn new(config: SenderConfig, device: Box<dyn Device>) -> Self {
        let suppression = ErrorSuppression::new(config.ignore_queue_overflows);
        Self {
            config,
            device: Some(device),
            upstream: None,
            upstream_signal: ReadinessSignal::new(false),
            writable: ReadinessSignal::new(true),
            success: Port::default(),
            failure: Port::default(),
            retry: None,
            suppression,
            stats: SenderStats::default(),
        }
    }

    /// Open a raw packet socket on the configured device.
    pub fn open(config: SenderConfig) -> Result<Self> {
        let socket = PacketSocket::open(&config.devname)
            .map_err(|source| Error::DeviceUnavailable { tried: 1, source })?;
        Ok(Self::new(config, Box::new(socket)))
    }

    /// Wire pull-style: the task pulls from `upstream` while its signal is up.
    pub fn connect_upstream(&mut self, upstream: Box<dyn Upstream>) {
        self.upstream_signal = upstream.signal();
        self.upstream = Some(upstream);
    }

    pub fn connect_success(&mut self, output: Box<dyn Output>) {
        self.success.connect(output);
    }

    pub fn connect_failure(&mut self, output: Box<dyn Output>) {
        self.failure.connect(output);
    }

    /// Push entry. Rejected while a packet waits in the retry slot.
    pub fn push(&mut self, packet: PacketBuffer) {
        if self.retry.is_some() {
            self.stats.overflow += 1;
            tracing::debug!(ifname = %self.config.devname, "{}", Error::Overflow);
            self.fail(packet);
            return;
        }
        self.send_packet(packet);
    }

    /// Destroy any parked packet and close the device. Safe to repeat.
    pub fn close(&mut self) {
        if self.retry.take().is_some() {
            self.stats.dropped_at_close += 1;
        }
        if let Some(mut device) = self.device.take() {
            device.close();
            tracing::info!(ifname = %self.config.devname, "raw device closed");
        }
    }

    fn send_packet(&mut self, packet: PacketBuffer) -> Attempt {
        if let Some(mtu) = self.config.mtu {
            if packet.len() > mtu {
                self.stats.oversize_dropped += 1;
                tracing::debug!("{}", Error::OversizeDropped { len: packet.len(), mtu });
                self.fail(packet);
                return Attempt::Failed;
            }
        }

        let Some(device) = self.device.as_ref() else {
            self.stats.failed += 1;
            self.fail(packet);
            return Attempt::Failed;
        };

        match device.send(packet.data()) {
            Ok(_) => {
                self.stats.sent += 1;
                self.suppression.reset(Direction::Write);
                // Unwired success output: the packet is simply freed.
                let _ = self.success.emit(packet);
                Attempt::Sent
            }
            Err(e) => {
                let err = Error::classify(Direction::Write, e);
                if err.is_transient() && self.config.use_q {
                    self.stats.queued += 1;
                    if device.raw_fd().is_some() {
                        self.writable.clear();
                    }
                    self.retry = Some(packet);
                    return Attempt::Parked;
                }
                self.stats.failed += 1;
                if self.suppression.should_report(Direction::Write) {
                    tracing::warn!(ifname = %self.config.devname, "send: {err}");
                }
                self.fail(packet);
                Attempt::Failed
            }
        }
    }

    fn fail(&mut self, packet: PacketBuffer) {
        if let Err(dropped) = self.failure.emit(packet) {
            tracing::trace!(len = dropped.len(), "dropping unsent packet");
        }
    }

    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }

    pub fn suppression(&self) -> &ErrorSuppression {
        &self.suppression
    }

    pub fn ifname(&self) -> &str {
        &self.config.devname
    }
}

impl CooperativeTask for ToDevice {
    /// Retry the parked packet, then pull and send one fresh packet.
    fn poll_once(&mut self) -> Poll {
        if self.device.is_none() {
            return Poll::Idle;
        }

        let mut worked = false;
        if let Some(packet) = self.retry.take() {
            self.stats.retries += 1;
            worked = true;
            if self.send_packet(packet) != Attempt::Sent {
                return Poll::DidWork;
            }
        }

        match self.upstream.as_mut().and_then(|up| up.pull()) {
            Some(packet) => {
                self.send_packet(packet);
                Poll::DidWork
            }
            None if worked => Poll::DidWork,
            None => Poll::Idle,
        }
    }

    /// A parked packet gates the task on the device alone; upstream work
    /// waits until the slot is empty.
    fn is_ready(&self) -> bool {
        if self.device.is_none() {
            return false;
        }
        match self.retry {
            Some(_) => self.writable.is_set(),
            None => self.upstream_signal.is_set(),
        }
    }

    fn wait_fd(&self) -> Option<WaitFd> {
        if self.retry.is_none() || self.writable.is_set() {
            return None;
        }
        let fd = self.device.as_ref()?.raw_fd()?;
        Some(WaitFd {
            fd,
            interest: Interest::Writable,
            signal: self.writable.clone(),
        })
    }
}

impl Output for ToDevice {
    fn push(&mut self, packet: PacketBuffer) {
        ToDevice::push(self, packet)
    }
}

impl Drop for ToDevice {
    fn drop(&mut self) {
        self.close();
    }
}
