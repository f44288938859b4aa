//! Pipeline-facing ports.

use crate::buffer::PacketBuffer;
use crate::task::ReadinessSignal;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Downstream side of a connection: takes ownership of each packet.
pub trait Output {
    fn push(&mut self, packet: PacketBuffer);
}

/// Upstream side of a pull connection.
pub trait Upstream {
    fn pull(&mut self) -> Option<PacketBuffer>;

    /// Raised while the upstream may have packets to hand out.
    fn signal(&self) -> ReadinessSignal;
}

/// Lets a scheduled element (held as `Rc<RefCell<_>>`) be wired downstream.
impl<T: Output + ?Sized> Output for Rc<RefCell<T>> {
    fn push(&mut self, packet: PacketBuffer) {
        self.borrow_mut().push(packet)
    }
}

/// An optional output port. Packets sent to an unconnected port are dropped.
#[derive(Default)]
pub struct Port {
    output: Option<Box<dyn Output>>,
}

impl Port {
    pub fn connect(&mut self, output: Box<dyn Output>) {
        self.output = Some(output);
    }

    pub fn is_connected(&self) -> bool {
        self.output.is_some()
    }

    /// Deliver `packet`, or hand it back when nothing is connected.
    pub fn emit(&mut self, packet: PacketBuffer) -> Result<(), PacketBuffer> {
        match self.output.as_mut() {
            Some(out) => {
                out.push(packet);
                Ok(())
            }
            None => Err(packet),
        }
    }
}

#[derive(Debug)]
struct QueueState {
    packets: VecDeque<PacketBuffer>,
    capacity: usize,
    drops: u64,
}

/// Bounded FIFO usable as a push output on one side and a pull upstream on
/// the other. Its signal is raised while it holds packets. Clones share the
/// same queue.
#[derive(Debug, Clone)]
pub struct Queue {
    state: Rc<RefCell<QueueState>>,
    signal: ReadinessSignal,
}

impl Queue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(QueueState {
                packets: VecDeque::with_capacity(capacity),
                capacity,
                drops: 0,
            })),
            signal: ReadinessSignal::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.state.borrow().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packets dropped because the queue was full.
    pub fn drops(&self) -> u64 {
        self.state.borrow().drops
    }

    pub fn drain(&self) -> Vec<PacketBuffer> {
        self.signal.clear();
        self.state.borrow_mut().packets.drain(..).collect()
    }
}

impl Output for Queue {
    fn push(&mut self, packet: PacketBuffer) {
        let mut state = self.state.borrow_mut();
        if state.packets.len() >= state.capacity {
            state.drops += 1;
            tracing::debug!(len = packet.len(), "queue full, dropping packet");
            return;
        }
        state.packets.push_back(packet);
        self.signal.set();
    }
}

impl Upstream for Queue {
    fn pull(&mut self) -> Option<PacketBuffer> {
        let mut state = self.state.borrow_mut();
        let packet = state.packets.pop_front();
        if state.packets.is_empty() {
            self.signal.clear();
        }
        packet
    }

    fn signal(&self) -> ReadinessSignal {
        self.signal.clone()
    }
}
