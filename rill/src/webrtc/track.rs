//! RTP send/receive tracks, the SSRC fast cache and the PLI throttle.

use rtp::jitter::JitterEstimator;
use rtp::nack::{NackList, ReceiveOutcome};
use rtp::ring::RingBuffer;
use rtp::rtcp::ReportBlock;
use rtp::sequence::seq_distance;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Receive side of one SSRC: loss tracking for NACK, a ring of received
/// packets, jitter estimation and RR statistics.
pub struct RecvTrack {
    pub ssrc: u32,
    pub kind: TrackKind,
    nack: RefCell<NackList>,
    ring: RefCell<RingBuffer>,
    jitter: RefCell<JitterEstimator>,
    packets: Cell<u64>,
    bytes: Cell<u64>,
    base_seq: Cell<Option<u16>>,
    last_sr_compact_ntp: Cell<u32>,
    last_sr_at: Cell<Option<Instant>>,
}

impl RecvTrack {
    pub fn new(ssrc: u32, kind: TrackKind, clock_rate: u32) -> Rc<Self> {
        Rc::new(Self {
            ssrc,
            kind,
            nack: RefCell::new(NackList::new(15, Duration::from_millis(20), 1024)),
            ring: RefCell::new(RingBuffer::new(1024).expect("power of two")),
            jitter: RefCell::new(JitterEstimator::new(clock_rate)),
            packets: Cell::new(0),
            bytes: Cell::new(0),
            base_seq: Cell::new(None),
            last_sr_compact_ntp: Cell::new(0),
            last_sr_at: Cell::new(None),
        })
    }

    /// Handles one received packet. A packet that was marked lost is taken
    /// off the NACK list AND inserted into the ring buffer, so a later
    /// retransmit request can never resurrect it as missing.
    pub fn on_rtp(&self, packet: &rtp::Packet, now: Instant) -> ReceiveOutcome {
        let seq = packet.header.sequence_number;
        let outcome = self.nack.borrow_mut().on_received(seq, now);
        match outcome {
            ReceiveOutcome::First | ReceiveOutcome::Fresh | ReceiveOutcome::Recovered => {
                self.ring.borrow_mut().add(packet.clone());
                self.packets.set(self.packets.get() + 1);
                self.bytes
                    .set(self.bytes.get() + packet.payload.len() as u64);
                if self.base_seq.get().is_none() {
                    self.base_seq.set(Some(seq));
                }
                self.jitter
                    .borrow_mut()
                    .on_packet(packet.header.timestamp, now);
            }
            ReceiveOutcome::Stale => {}
        }
        outcome
    }

    pub fn has_packet(&self, seq: u16) -> bool {
        self.ring.borrow().contains(seq)
    }

    pub fn is_missing(&self, seq: u16) -> bool {
        self.nack.borrow().contains(seq)
    }

    pub fn missing_count(&self) -> usize {
        self.nack.borrow().len()
    }

    pub fn update_rtt(&self, rtt: Duration) {
        self.nack.borrow_mut().update_rtt(rtt);
    }

    /// Sequences due for a NACK request now.
    pub fn poll_nacks(&self, now: Instant) -> Vec<u16> {
        self.nack.borrow_mut().poll_requests(now)
    }

    pub fn on_sender_report(&self, compact_ntp: u32, now: Instant) {
        self.last_sr_compact_ntp.set(compact_ntp);
        self.last_sr_at.set(Some(now));
    }

    /// Builds this track's reception report block.
    pub fn report_block(&self, now: Instant) -> ReportBlock {
        let highest = self.nack.borrow().highest().unwrap_or(0);
        let extended_highest = match self.base_seq.get() {
            Some(base) => seq_distance(highest, base) as u32,
            None => 0,
        };
        let delay = self
            .last_sr_at
            .get()
            .map(|at| (now.duration_since(at).as_secs_f64() * 65536.0) as u32)
            .unwrap_or(0);
        ReportBlock {
            ssrc: self.ssrc,
            fraction_lost: 0,
            total_lost: self.missing_count() as u32,
            highest_seq: extended_highest,
            jitter: self.jitter.borrow().jitter(),
            last_sr: self.last_sr_compact_ntp.get(),
            delay_since_last_sr: delay,
        }
    }
}

/// Send side of one SSRC: sequence/ssrc rewrite and the retransmit ring.
pub struct SendTrack {
    pub ssrc: u32,
    pub kind: TrackKind,
    /// Negotiated payload type rewritten onto every outbound packet.
    payload_type: u8,
    next_seq: Cell<u16>,
    ring: RefCell<RingBuffer>,
    packets: Cell<u64>,
    bytes: Cell<u64>,
}

impl SendTrack {
    pub fn new(ssrc: u32, kind: TrackKind, payload_type: u8) -> Rc<Self> {
        Rc::new(Self {
            ssrc,
            kind,
            payload_type,
            next_seq: Cell::new(0),
            ring: RefCell::new(RingBuffer::new(1024).expect("power of two")),
            packets: Cell::new(0),
            bytes: Cell::new(0),
        })
    }

    /// Rewrites the packet onto this track's sequence space, SSRC and
    /// payload type, and stores it for NACK retransmission. Every packet
    /// handed to the wire stays in the ring until displaced by newer ones.
    pub fn on_send(&self, mut packet: rtp::Packet) -> rtp::Packet {
        let seq = self.next_seq.get();
        self.next_seq.set(seq.wrapping_add(1));
        packet.header.sequence_number = seq;
        packet.header.ssrc = self.ssrc;
        packet.header.payload_type = self.payload_type;
        self.ring.borrow_mut().add(packet.clone());
        self.packets.set(self.packets.get() + 1);
        self.bytes
            .set(self.bytes.get() + packet.payload.len() as u64);
        packet
    }

    pub fn has_packet(&self, seq: u16) -> bool {
        self.ring.borrow().contains(seq)
    }

    /// Looks up packets for a NACK; sequences no longer buffered are
    /// silently skipped.
    pub fn retransmit(&self, seqs: &[u16]) -> Vec<rtp::Packet> {
        let ring = self.ring.borrow();
        seqs.iter()
            .filter_map(|s| ring.get(*s).cloned())
            .collect()
    }

    pub fn sent_packets(&self) -> u64 {
        self.packets.get()
    }

    pub fn sent_bytes(&self) -> u64 {
        self.bytes.get()
    }
}

/// Three-slot SSRC cache fronting the track map on the per-packet path.
pub struct TrackSet<T> {
    tracks: RefCell<HashMap<u32, Rc<T>>>,
    slots: RefCell<[Option<(u32, Rc<T>)>; 3]>,
    next_slot: Cell<usize>,
    cache_hits: Cell<u64>,
    cache_misses: Cell<u64>,
}

impl<T> Default for TrackSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TrackSet<T> {
    pub fn new() -> Self {
        Self {
            tracks: RefCell::new(HashMap::new()),
            slots: RefCell::new([None, None, None]),
            next_slot: Cell::new(0),
            cache_hits: Cell::new(0),
            cache_misses: Cell::new(0),
        }
    }

    pub fn insert(&self, ssrc: u32, track: Rc<T>) {
        self.tracks.borrow_mut().insert(ssrc, track);
    }

    pub fn find(&self, ssrc: u32) -> Option<Rc<T>> {
        {
            let slots = self.slots.borrow();
            for slot in slots.iter().flatten() {
                if slot.0 == ssrc {
                    self.cache_hits.set(self.cache_hits.get() + 1);
                    return Some(slot.1.clone());
                }
            }
        }
        self.cache_misses.set(self.cache_misses.get() + 1);
        let track = self.tracks.borrow().get(&ssrc).cloned()?;
        let mut slots = self.slots.borrow_mut();
        let idx = self.next_slot.get();
        slots[idx] = Some((ssrc, track.clone()));
        self.next_slot.set((idx + 1) % slots.len());
        Some(track)
    }

    pub fn values(&self) -> Vec<Rc<T>> {
        self.tracks.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        (self.cache_hits.get(), self.cache_misses.get())
    }
}

/// Debounces keyframe requests per SSRC.
pub struct PliThrottle {
    min_interval: Duration,
    last: RefCell<HashMap<u32, Instant>>,
}

impl PliThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: RefCell::new(HashMap::new()),
        }
    }

    /// Whether a PLI for `ssrc` may go out now; recording the grant.
    pub fn allow(&self, ssrc: u32, now: Instant) -> bool {
        let mut last = self.last.borrow_mut();
        match last.get(&ssrc) {
            Some(at) if now.duration_since(*at) < self.min_interval => false,
            _ => {
                last.insert(ssrc, now);
                true
            }
        }
    }
}
