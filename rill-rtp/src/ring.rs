//! Per-SSRC ring of recently sent (or recovered) packets, indexed by the
//! 16-bit sequence number, backing NACK retransmission.

use crate::packet::Packet;
use crate::sequence::UINT16_SIZE_HALF;

/// Fixed-capacity circular packet store.
///
/// Capacity must be a power of two so the sequence number maps to a slot by
/// masking. A `get` only returns a packet whose stored sequence matches the
/// request, so displaced slots never alias under wraparound.
pub struct RingBuffer {
    packets: Vec<Option<Packet>>,
    size: u16,
    highest_added: u16,
    started: bool,
}

impl RingBuffer {
    /// `None` when `size` is not a power of 2 in `1..=32768`.
    pub fn new(size: u16) -> Option<Self> {
        let is_valid = (0..=15).any(|i| size == 1 << i);
        if !is_valid {
            return None;
        }
        Some(Self {
            packets: vec![None; size as usize],
            size,
            highest_added: 0,
            started: false,
        })
    }

    pub fn add(&mut self, packet: Packet) {
        let seq = packet.header.sequence_number;

        if !self.started {
            self.packets[(seq % self.size) as usize] = Some(packet);
            self.highest_added = seq;
            self.started = true;
            return;
        }

        let diff = seq.wrapping_sub(self.highest_added);
        if diff == 0 {
            // duplicate: keep the original
            return;
        } else if diff < UINT16_SIZE_HALF {
            // moved forward: clear the slots we jumped over
            let mut i = self.highest_added.wrapping_add(1);
            while i != seq {
                let idx = (i % self.size) as usize;
                self.packets[idx] = None;
                i = i.wrapping_add(1);
            }
            self.highest_added = seq;
        }
        // out-of-order packets (negative diff) are stored without moving
        // highest_added; this is how NACK-recovered packets re-enter

        let idx = (seq % self.size) as usize;
        self.packets[idx] = Some(packet);
    }

    pub fn get(&self, seq: u16) -> Option<&Packet> {
        if !self.started {
            return None;
        }
        let diff = self.highest_added.wrapping_sub(seq);
        if diff >= UINT16_SIZE_HALF {
            return None; // ahead of everything we stored
        }
        if diff >= self.size {
            return None; // displaced
        }
        let idx = (seq % self.size) as usize;
        let packet = self.packets[idx].as_ref()?;
        if packet.header.sequence_number != seq {
            return None;
        }
        Some(packet)
    }

    pub fn contains(&self, seq: u16) -> bool {
        self.get(seq).is_some()
    }

    pub fn highest(&self) -> Option<u16> {
        self.started.then_some(self.highest_added)
    }
}
