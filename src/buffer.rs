//! Packet buffers with head and tail reservation.

use std::fmt;

/// An owned packet: `[ headroom | data | tailroom ]` over one allocation.
///
/// Data grows backward into the headroom (`push`) or forward into the
/// tailroom (`put`). When either side is too small the packet is moved into a
/// larger allocation, so the bytes in use never leave the backing storage.
pub struct PacketBuffer {
    storage: Vec<u8>,
    head: usize,
    len: usize,
}

impl PacketBuffer {
    /// An empty packet with `headroom` reserved bytes in front and room for
    /// `capacity` bytes of data behind them.
    pub fn new(headroom: usize, capacity: usize) -> Self {
        Self {
            storage: vec![0u8; headroom + capacity],
            head: headroom,
            len: 0,
        }
    }

    /// Copy `data` into a fresh packet with `headroom` bytes in front of it.
    pub fn from_slice(headroom: usize, data: &[u8]) -> Self {
        let mut pkt = Self::new(headroom, data.len());
        pkt.storage[headroom..].copy_from_slice(data);
        pkt.len = data.len();
        pkt
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.head - self.len
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.storage[self.head..self.head + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.head + self.len]
    }

    /// The unused bytes after the data, for reading a frame in place.
    /// Follow up with [`PacketBuffer::commit`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let end = self.head + self.len;
        &mut self.storage[end..]
    }

    /// Claim `n` bytes of tailroom that were filled through `spare_mut`.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.tailroom(), "commit past end of buffer");
        self.len += n;
    }

    /// Grow the data `n` bytes toward the front and return the new prefix.
    pub fn push(&mut self, n: usize) -> &mut [u8] {
        if n > self.head {
            self.reserve_headroom(n);
        }
        self.head -= n;
        self.len += n;
        &mut self.storage[self.head..self.head + n]
    }

    /// Drop `n` bytes from the front of the data, returning them to headroom.
    pub fn pull(&mut self, n: usize) {
        let n = n.min(self.len);
        self.head += n;
        self.len -= n;
    }

    /// Grow the data `n` bytes at the end and return the new suffix.
    pub fn put(&mut self, n: usize) -> &mut [u8] {
        if n > self.tailroom() {
            let extra = n - self.tailroom();
            self.storage.resize(self.storage.len() + extra, 0);
        }
        let start = self.head + self.len;
        self.len += n;
        &mut self.storage[start..start + n]
    }

    /// Drop `n` bytes from the end of the data.
    pub fn take(&mut self, n: usize) {
        self.len -= n.min(self.len);
    }

    fn reserve_headroom(&mut self, needed: usize) {
        let grow = needed - self.head;
        let mut storage = vec![0u8; self.storage.len() + grow];
        storage[self.head + grow..].copy_from_slice(&self.storage[self.head..]);
        self.storage = storage;
        self.head += grow;
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("headroom", &self.headroom())
            .field("len", &self.len)
            .field("tailroom", &self.tailroom())
            .finish()
    }
}
