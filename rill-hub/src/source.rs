//! The per-stream fan-out bus.

use crate::bridge::Bridge;
use crate::consumer::Consumer;
use crate::gop::GopCache;
use crate::jitter::JitterAlgorithm;
use crate::meta::MetaCache;
use crate::packet::MediaPacket;
use crate::request::Request;
use crate::token::{PublishToken, PublishTokenManager};
use log::{debug, info, warn};
use rand::Rng;
use shared::error::Result;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// One source per unique stream URL.
///
/// Exactly one publisher coroutine mutates the caches and walks the
/// consumer vector; consumers only touch their own queues. Between two
/// suspension points nothing else runs, so none of this needs locking.
pub struct Source {
    req: RefCell<Request>,
    source_id: Cell<u64>,
    prev_source_id: Cell<u64>,
    publishing: Cell<bool>,
    atc: Cell<bool>,
    jitter_algorithm: Cell<JitterAlgorithm>,
    consumers: RefCell<Vec<Rc<Consumer>>>,
    meta: RefCell<MetaCache>,
    gop: RefCell<GopCache>,
    bridges: RefCell<Vec<Rc<dyn Bridge>>>,
    /// Stamped when the last publisher or consumer left; drives GC.
    stream_die_at: Cell<Option<Instant>>,
    /// A subscriber asked the publisher for a keyframe (PLI routing).
    keyframe_requested: Cell<bool>,
}

impl Source {
    pub fn new(req: Request, gop_cache: bool) -> Rc<Self> {
        Rc::new(Self {
            req: RefCell::new(req),
            source_id: Cell::new(0),
            prev_source_id: Cell::new(0),
            publishing: Cell::new(false),
            atc: Cell::new(false),
            jitter_algorithm: Cell::new(JitterAlgorithm::Full),
            consumers: RefCell::new(Vec::new()),
            meta: RefCell::new(MetaCache::new()),
            gop: RefCell::new(GopCache::new(gop_cache)),
            bridges: RefCell::new(Vec::new()),
            stream_die_at: Cell::new(Some(Instant::now())),
            keyframe_requested: Cell::new(false),
        })
    }

    pub fn request(&self) -> Request {
        self.req.borrow().clone()
    }

    pub fn update_request(&self, req: Request) {
        *self.req.borrow_mut() = req;
    }

    pub fn stream_url(&self) -> String {
        self.req.borrow().stream_url()
    }

    pub fn source_id(&self) -> u64 {
        self.source_id.get()
    }

    pub fn prev_source_id(&self) -> u64 {
        self.prev_source_id.get()
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing.get()
    }

    pub fn set_atc(&self, atc: bool) {
        self.atc.set(atc);
    }

    pub fn set_jitter_algorithm(&self, algorithm: JitterAlgorithm) {
        self.jitter_algorithm.set(algorithm);
    }

    pub fn set_gop_cache(&self, enabled: bool) {
        self.gop.borrow_mut().set_enabled(enabled);
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.borrow().len()
    }

    /// Publisher attach: mints a new source id and wakes consumers so they
    /// can notice the change (RTC players request a PLI on it).
    pub fn on_publish(&self) {
        self.prev_source_id.set(self.source_id.get());
        self.source_id.set(rand::thread_rng().gen::<u64>() | 1);
        self.publishing.set(true);
        self.stream_die_at.set(None);
        info!(
            "source {} publish, id={:x}",
            self.stream_url(),
            self.source_id.get()
        );
        for c in self.consumers.borrow().iter() {
            c.on_source_changed();
        }
    }

    /// Publisher detach: bridges are torn down synchronously before the
    /// die-at stamp so consumers can never observe a half-attached bridge.
    pub fn on_unpublish(&self) {
        let bridges: Vec<Rc<dyn Bridge>> = self.bridges.borrow_mut().drain(..).collect();
        for b in &bridges {
            b.on_unpublish();
        }
        self.publishing.set(false);
        self.meta.borrow_mut().clear();
        self.gop.borrow_mut().clear();
        if self.consumers.borrow().is_empty() {
            self.stream_die_at.set(Some(Instant::now()));
        }
        info!("source {} unpublish", self.stream_url());
        for c in self.consumers.borrow().iter() {
            c.wakeup();
        }
    }

    pub fn attach_bridge(&self, bridge: Rc<dyn Bridge>) {
        self.bridges.borrow_mut().push(bridge);
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.borrow().len()
    }

    /// Publisher-side audio entry.
    pub fn on_audio(&self, packet: MediaPacket) -> Result<()> {
        self.dispatch(packet)
    }

    /// Publisher-side video entry.
    pub fn on_video(&self, packet: MediaPacket) -> Result<()> {
        self.dispatch(packet)
    }

    pub fn on_meta_data(&self, packet: MediaPacket) -> Result<()> {
        self.meta.borrow_mut().update_metadata(packet.clone());
        let atc = self.atc.get();
        let algo = self.jitter_algorithm.get();
        for c in self.consumers.borrow().iter() {
            c.enqueue(&packet, atc, algo);
        }
        Ok(())
    }

    fn dispatch(&self, packet: MediaPacket) -> Result<()> {
        if packet.is_sequence_header() {
            self.meta.borrow_mut().update_sequence_header(packet.clone());
        } else {
            self.gop.borrow_mut().cache(&packet);
        }

        let atc = self.atc.get();
        let algo = self.jitter_algorithm.get();
        for c in self.consumers.borrow().iter() {
            c.enqueue(&packet, atc, algo);
        }

        for b in self.bridges.borrow().iter() {
            let r = if packet.is_audio() {
                b.on_audio(&packet)
            } else {
                b.on_video(&packet)
            };
            // a codec hiccup inside a bridge drops one packet, it does
            // not take the publisher down
            if let Err(e) = r {
                warn!("source {} bridge dropped a packet: {e}", self.stream_url());
            }
        }
        Ok(())
    }

    /// Creates a consumer and dumps the catch-up state in serving order:
    /// metadata, audio SH, video SH, then the gop cache chronologically.
    pub fn create_consumer(&self, queue_size_ms: i64) -> Rc<Consumer> {
        let consumer = Rc::new(Consumer::new(queue_size_ms));
        self.dump_to_consumer(&consumer);
        self.consumers.borrow_mut().push(consumer.clone());
        self.stream_die_at.set(None);
        debug!(
            "source {} consumer attached, total={}",
            self.stream_url(),
            self.consumer_count()
        );
        consumer
    }

    fn dump_to_consumer(&self, consumer: &Rc<Consumer>) {
        let atc = self.atc.get();
        let algo = self.jitter_algorithm.get();
        for p in self.meta.borrow().dump() {
            consumer.enqueue(&p, atc, algo);
        }
        for p in self.gop.borrow().packets() {
            consumer.enqueue(p, atc, algo);
        }
    }

    /// A subscriber wants a keyframe; the publisher side polls this and
    /// relays it over its own protocol (PLI for RTC publishers).
    pub fn request_keyframe(&self) {
        self.keyframe_requested.set(true);
    }

    /// Consumes the pending keyframe request, if any.
    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_requested.replace(false)
    }

    /// Consumer detach; stamps the die-at time when the source is empty.
    pub fn on_consumer_destroy(&self, consumer: &Rc<Consumer>) {
        self.consumers
            .borrow_mut()
            .retain(|c| !Rc::ptr_eq(c, consumer));
        if self.consumers.borrow().is_empty() && !self.publishing.get() {
            self.stream_die_at.set(Some(Instant::now()));
        }
    }

    /// Whether the source has been idle (no publisher, no consumer) for at
    /// least `timeout`.
    pub fn stream_is_dead_for(&self, timeout: Duration, now: Instant) -> bool {
        if self.publishing.get() || !self.consumers.borrow().is_empty() {
            return false;
        }
        match self.stream_die_at.get() {
            Some(at) => now.duration_since(at) >= timeout,
            None => false,
        }
    }
}

/// Owns the source pool and the publish tokens.
pub struct SourceManager {
    pool: RefCell<HashMap<String, Rc<Source>>>,
    tokens: PublishTokenManager,
    gop_cache: Cell<bool>,
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SourceManager {
    pub fn new(gop_cache: bool) -> Self {
        Self {
            pool: RefCell::new(HashMap::new()),
            tokens: PublishTokenManager::new(),
            gop_cache: Cell::new(gop_cache),
        }
    }

    pub fn set_gop_cache(&self, enabled: bool) {
        self.gop_cache.set(enabled);
    }

    /// Fetches the source for the request's stream URL, creating it on
    /// first publish or play.
    pub fn fetch_or_create(&self, req: &Request) -> Rc<Source> {
        let url = req.stream_url();
        let mut pool = self.pool.borrow_mut();
        if let Some(s) = pool.get(&url) {
            return s.clone();
        }
        let s = Source::new(req.clone(), self.gop_cache.get());
        pool.insert(url, s.clone());
        s
    }

    pub fn fetch(&self, stream_url: &str) -> Option<Rc<Source>> {
        self.pool.borrow().get(stream_url).cloned()
    }

    pub fn len(&self) -> usize {
        self.pool.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.borrow().is_empty()
    }

    /// Acquires the single-writer token for a stream URL.
    pub fn acquire_publish(&self, stream_url: &str) -> Result<PublishToken> {
        self.tokens.acquire(stream_url)
    }

    /// Evicts sources that have been idle past `timeout`.
    pub fn cleanup(&self, timeout: Duration) {
        let now = Instant::now();
        self.pool.borrow_mut().retain(|url, s| {
            let dead = s.stream_is_dead_for(timeout, now);
            if dead {
                info!("source {url} evicted after idle timeout");
            }
            !dead
        });
    }
}
