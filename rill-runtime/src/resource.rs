//! Centralized resource lifecycle with deferred disposal.
//!
//! A connection's own coroutine frequently asks for its own removal; freeing
//! it synchronously would unwind frames that are still executing. `remove`
//! therefore only unlinks the indices and parks the strong handle on a
//! zombie list; a dedicated GC coroutine drops the zombies on the next
//! scheduler cycle, after notifying dispose subscribers.

use crate::cond::CondWaiter;
use crate::coroutine::{Coroutine, CoroutineContext};
use log::debug;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// Implemented by everything the manager owns.
pub trait Resource {
    /// Stable string id, unique within one manager.
    fn resource_id(&self) -> String;

    /// Human-readable description for logs.
    fn desc(&self) -> String {
        self.resource_id()
    }
}

/// Observer of the two disposal phases.
pub trait DisposeHandler<R: ?Sized> {
    /// Called before the zombie's strong handle is dropped.
    fn on_before_dispose(&self, r: &Rc<R>);
    /// Called after the manager released its handle.
    fn on_disposing(&self, r: &Rc<R>);
}

/// Size of the collision-free level-0 fast-id cache. UDP packet dispatch
/// hits this array on almost every datagram, the map only on collisions.
const FAST_ID_CACHE_SIZE: usize = 512;

struct Indices<R: ?Sized> {
    all: Vec<Rc<R>>,
    by_id: HashMap<String, Rc<R>>,
    by_fast_id: HashMap<u64, Rc<R>>,
    fast_cache: Vec<Option<(u64, Rc<R>)>>,
    by_name: HashMap<String, Rc<R>>,
    zombies: Vec<Rc<R>>,
}

/// Index-and-dispose owner for connections and long-lived objects.
pub struct ResourceManager<R: ?Sized> {
    label: String,
    indices: RefCell<Indices<R>>,
    handlers: RefCell<Vec<Rc<dyn DisposeHandler<R>>>>,
    gc_wakeup: CondWaiter,
    gc: RefCell<Option<Rc<Coroutine>>>,
}

impl<R: ?Sized + 'static> ResourceManager<R> {
    pub fn new(label: &str) -> Rc<Self> {
        let mut fast_cache = Vec::with_capacity(FAST_ID_CACHE_SIZE);
        fast_cache.resize_with(FAST_ID_CACHE_SIZE, || None);
        Rc::new(Self {
            label: label.to_string(),
            indices: RefCell::new(Indices {
                all: Vec::new(),
                by_id: HashMap::new(),
                by_fast_id: HashMap::new(),
                fast_cache,
                by_name: HashMap::new(),
                zombies: Vec::new(),
            }),
            handlers: RefCell::new(Vec::new()),
            gc_wakeup: CondWaiter::new(),
            gc: RefCell::new(None),
        })
    }

    pub fn subscribe(&self, handler: Rc<dyn DisposeHandler<R>>) {
        self.handlers.borrow_mut().push(handler);
    }

    /// Launches the GC coroutine. Without it, zombies accumulate until
    /// `gc_cycle` is driven manually (tests do the latter).
    pub fn start(self: &Rc<Self>) {
        let co = Rc::new(Coroutine::new(&format!("manager-{}", self.label)));
        let this = Rc::clone(self);
        co.start(move |ctx: CoroutineContext| async move {
            loop {
                ctx.pull()?;
                // 1s cap so a lost signal cannot park zombies forever
                this.gc_wakeup.wait_timeout(Duration::from_secs(1)).await;
                this.gc_cycle();
            }
        });
        *self.gc.borrow_mut() = Some(co);
    }

    pub async fn stop(&self) {
        let co = self.gc.borrow_mut().take();
        if let Some(co) = co {
            co.stop().await;
        }
        self.gc_cycle();
    }

    pub fn add(&self, r: Rc<R>) {
        self.indices.borrow_mut().all.push(r);
    }

    pub fn add_with_id(&self, id: &str, r: Rc<R>) {
        let mut idx = self.indices.borrow_mut();
        if !idx.all.iter().any(|x| Rc::ptr_eq(x, &r)) {
            idx.all.push(Rc::clone(&r));
        }
        idx.by_id.insert(id.to_string(), r);
    }

    pub fn add_with_fast_id(&self, fast_id: u64, r: Rc<R>) {
        let mut idx = self.indices.borrow_mut();
        if !idx.all.iter().any(|x| Rc::ptr_eq(x, &r)) {
            idx.all.push(Rc::clone(&r));
        }
        let slot = (fast_id as usize) % FAST_ID_CACHE_SIZE;
        if idx.fast_cache[slot].is_none() {
            idx.fast_cache[slot] = Some((fast_id, Rc::clone(&r)));
        }
        idx.by_fast_id.insert(fast_id, r);
    }

    pub fn add_with_name(&self, name: &str, r: Rc<R>) {
        let mut idx = self.indices.borrow_mut();
        if !idx.all.iter().any(|x| Rc::ptr_eq(x, &r)) {
            idx.all.push(Rc::clone(&r));
        }
        idx.by_name.insert(name.to_string(), r);
    }

    pub fn find_by_id(&self, id: &str) -> Option<Rc<R>> {
        self.indices.borrow().by_id.get(id).cloned()
    }

    /// O(1) lookup on the UDP hot path: level-0 array first, map fallback.
    pub fn find_by_fast_id(&self, fast_id: u64) -> Option<Rc<R>> {
        let idx = self.indices.borrow();
        let slot = (fast_id as usize) % FAST_ID_CACHE_SIZE;
        if let Some((cached_id, r)) = &idx.fast_cache[slot] {
            if *cached_id == fast_id {
                return Some(Rc::clone(r));
            }
        }
        idx.by_fast_id.get(&fast_id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Rc<R>> {
        self.indices.borrow().by_name.get(name).cloned()
    }

    /// Snapshot of every live resource, for periodic sweeps.
    pub fn all(&self) -> Vec<Rc<R>> {
        self.indices.borrow().all.clone()
    }

    pub fn len(&self) -> usize {
        self.indices.borrow().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn zombie_count(&self) -> usize {
        self.indices.borrow().zombies.len()
    }

    /// Unlinks every index entry for `r` and parks it for the GC cycle.
    /// After this returns `r` is unreachable through `find_by_*` but still
    /// alive; callers inside `r`'s own coroutine stay on valid frames.
    pub fn remove(&self, r: &Rc<R>) {
        let mut idx = self.indices.borrow_mut();
        idx.all.retain(|x| !Rc::ptr_eq(x, r));
        idx.by_id.retain(|_, x| !Rc::ptr_eq(x, r));
        idx.by_fast_id.retain(|_, x| !Rc::ptr_eq(x, r));
        idx.by_name.retain(|_, x| !Rc::ptr_eq(x, r));
        for slot in idx.fast_cache.iter_mut() {
            if let Some((_, x)) = slot {
                if Rc::ptr_eq(x, r) {
                    *slot = None;
                }
            }
        }
        idx.zombies.push(Rc::clone(r));
        drop(idx);
        self.gc_wakeup.signal();
    }

    /// Drains zombies: notifies subscribers and drops the manager's strong
    /// handles. Called by the GC coroutine; exposed for tests.
    pub fn gc_cycle(&self) {
        let zombies: Vec<Rc<R>> = std::mem::take(&mut self.indices.borrow_mut().zombies);
        if zombies.is_empty() {
            return;
        }
        debug!("manager-{} disposing {} zombies", self.label, zombies.len());
        let handlers = self.handlers.borrow().clone();
        for z in zombies {
            for h in &handlers {
                h.on_before_dispose(&z);
            }
            for h in &handlers {
                h.on_disposing(&z);
            }
            // strong handle dropped here; the payload dies unless another
            // holder still references it
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct TestConn {
        id: String,
    }

    impl Resource for TestConn {
        fn resource_id(&self) -> String {
            self.id.clone()
        }
    }

    fn conn(id: &str) -> Rc<TestConn> {
        Rc::new(TestConn { id: id.to_string() })
    }

    #[test]
    fn test_add_find_remove() {
        let m: Rc<ResourceManager<TestConn>> = ResourceManager::new("test");
        let c = conn("a");
        m.add_with_id("a", c.clone());
        assert!(m.find_by_id("a").is_some());

        m.remove(&c);
        // unreachable but not yet deleted
        assert!(m.find_by_id("a").is_none());
        assert_eq!(m.zombie_count(), 1);
        assert!(Rc::strong_count(&c) >= 2);

        m.gc_cycle();
        assert_eq!(m.zombie_count(), 0);
        assert_eq!(Rc::strong_count(&c), 1);
    }

    #[test]
    fn test_add_then_remove_is_noop_on_sizes() {
        let m: Rc<ResourceManager<TestConn>> = ResourceManager::new("test");
        let c = conn("x");
        m.add_with_id("x", c.clone());
        m.add_with_fast_id(42, c.clone());
        m.add_with_name("conn-x", c.clone());
        assert_eq!(m.len(), 1);

        m.remove(&c);
        m.gc_cycle();
        assert_eq!(m.len(), 0);
        assert!(m.find_by_fast_id(42).is_none());
        assert!(m.find_by_name("conn-x").is_none());
    }

    #[test]
    fn test_fast_id_cache_hit_and_collision() {
        let m: Rc<ResourceManager<TestConn>> = ResourceManager::new("test");
        let a = conn("a");
        let b = conn("b");
        // same slot: ids differ by the cache size
        m.add_with_fast_id(7, a.clone());
        m.add_with_fast_id(7 + FAST_ID_CACHE_SIZE as u64, b.clone());

        assert!(Rc::ptr_eq(&m.find_by_fast_id(7).unwrap(), &a));
        assert!(Rc::ptr_eq(
            &m.find_by_fast_id(7 + FAST_ID_CACHE_SIZE as u64).unwrap(),
            &b
        ));
    }

    #[test]
    fn test_dispose_handler_order() {
        struct Probe {
            before: Cell<u32>,
            disposing: Cell<u32>,
        }
        impl DisposeHandler<TestConn> for Probe {
            fn on_before_dispose(&self, _r: &Rc<TestConn>) {
                self.before.set(self.before.get() + 1);
            }
            fn on_disposing(&self, _r: &Rc<TestConn>) {
                assert!(self.before.get() > self.disposing.get());
                self.disposing.set(self.disposing.get() + 1);
            }
        }

        let m: Rc<ResourceManager<TestConn>> = ResourceManager::new("test");
        let probe = Rc::new(Probe {
            before: Cell::new(0),
            disposing: Cell::new(0),
        });
        m.subscribe(probe.clone());

        let c = conn("a");
        m.add(c.clone());
        m.remove(&c);
        m.gc_cycle();
        assert_eq!(probe.before.get(), 1);
        assert_eq!(probe.disposing.get(), 1);
    }

    #[tokio::test]
    async fn test_gc_coroutine_reaps_self_removal() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let m: Rc<ResourceManager<TestConn>> = ResourceManager::new("test");
                m.start();

                let c = conn("self");
                m.add_with_id("self", c.clone());

                // a connection removing itself from inside its own task
                let mgr = m.clone();
                let me = c.clone();
                tokio::task::spawn_local(async move {
                    mgr.remove(&me);
                })
                .await
                .unwrap();

                // next cycle frees it
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(m.zombie_count(), 0);
                assert_eq!(Rc::strong_count(&c), 1);
                m.stop().await;
            })
            .await;
    }
}
