//! The registry of event handlers attached to a [`super::RawChannel`].
//!
//! Handlers live in an arena of slots addressed by [`HandlerId`]s. A slot is
//! only reused after its generation was bumped, so a stale id can never remove
//! somebody else's handler. Removing a handler while a dispatch pass is
//! running only tombstones it; the slot is freed once the last pass finished.

use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{AtomicBool, Ordering},
    },
};

/// Decides whether a handler is interested in a raw report.
pub type Predicate = dyn Fn(&[u8]) -> bool + Send + Sync;

/// Consumes a raw report.
pub type Callback = dyn Fn(&[u8]) + Send + Sync;

/// Identifies a handler inside an [`EventHandlerList`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandlerId {
    index: u32,
    generation: u32,
}

struct Handler {
    /// Registration order. Dispatch runs from the newest to the oldest handler.
    seq: u64,
    removed: AtomicBool,
    predicate: Box<Predicate>,
    callback: Box<Callback>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    handler: Option<Arc<Handler>>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_seq: u64,
    dispatching: usize,
    tombstones: Vec<HandlerId>,
}

impl Inner {
    fn release(&mut self, id: HandlerId) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }

        slot.handler = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }
}

/// A list of (predicate, callback) pairs receiving every raw report read from
/// a channel.
#[derive(Default)]
pub struct EventHandlerList {
    inner: Mutex<Inner>,
}

impl EventHandlerList {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new handler.
    ///
    /// The handler stays registered until the returned handle is dropped.
    pub fn insert(
        self: &Arc<Self>,
        predicate: Box<Predicate>,
        callback: Box<Callback>,
    ) -> HandlerHandle {
        let mut inner = self.lock();

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::default());
                (inner.slots.len() - 1) as u32
            },
        };

        let slot = &mut inner.slots[index as usize];
        slot.handler = Some(Arc::new(Handler {
            seq,
            removed: AtomicBool::new(false),
            predicate,
            callback,
        }));

        HandlerHandle {
            list: Arc::downgrade(self),
            id: HandlerId {
                index,
                generation: slot.generation,
            },
        }
    }

    /// Removes a handler. If a dispatch pass is running, the handler is only
    /// tombstoned and will not be invoked again by that pass.
    fn remove(&self, id: HandlerId) {
        let mut inner = self.lock();

        let Some(slot) = inner.slots.get(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        if let Some(handler) = &slot.handler {
            handler.removed.store(true, Ordering::Release);
        }

        if inner.dispatching > 0 {
            inner.tombstones.push(id);
        } else {
            inner.release(id);
        }
    }

    /// The amount of handlers that are registered and not tombstoned.
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter_map(|slot| slot.handler.as_ref())
            .filter(|handler| !handler.removed.load(Ordering::Acquire))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every live handler whose predicate accepts the report, newest
    /// first.
    ///
    /// The internal lock is not held while handlers run, so handlers may
    /// register new handlers or drop their own handle.
    pub fn dispatch(&self, report: &[u8]) {
        let mut snapshot: Vec<Arc<Handler>> = {
            let mut inner = self.lock();
            inner.dispatching += 1;
            inner
                .slots
                .iter()
                .filter_map(|slot| slot.handler.clone())
                .collect()
        };
        snapshot.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));

        let _pass = DispatchPass { list: self };
        for handler in snapshot {
            if handler.removed.load(Ordering::Acquire) {
                continue;
            }

            if (handler.predicate)(report) {
                (handler.callback)(report);
            }
        }
    }
}

/// Ends a dispatch pass, even when a handler panicked.
struct DispatchPass<'a> {
    list: &'a EventHandlerList,
}

impl Drop for DispatchPass<'_> {
    fn drop(&mut self) {
        let mut inner = self.list.lock();
        inner.dispatching -= 1;

        if inner.dispatching == 0 {
            for id in std::mem::take(&mut inner.tombstones) {
                inner.release(id);
            }
        }
    }
}

/// Keeps a handler registered. Dropping the handle removes the handler.
///
/// The handle only weakly references its list, so it may safely outlive the
/// channel it was obtained from.
#[must_use = "dropping the handle removes the handler immediately"]
pub struct HandlerHandle {
    list: Weak<EventHandlerList>,
    id: HandlerId,
}

impl HandlerHandle {
    pub fn id(&self) -> HandlerId {
        self.id
    }
}

impl fmt::Debug for HandlerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerHandle")
            .field("id", &self.id)
            .field("attached", &(self.list.strong_count() > 0))
            .finish()
    }
}

impl Drop for HandlerHandle {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn always() -> Box<Predicate> {
        Box::new(|_| true)
    }

    #[test]
    fn dispatches_newest_first() {
        let list = Arc::new(EventHandlerList::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                list.insert(always(), Box::new(move |_| order.lock().unwrap().push(i)))
            })
            .collect();

        list.dispatch(&[0x10]);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        drop(handles);
        assert!(list.is_empty());
    }

    #[test]
    fn predicate_filters_reports() {
        let list = Arc::new(EventHandlerList::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let _handle = list.insert(Box::new(|raw| raw[0] == 0x11), {
            let hits = Arc::clone(&hits);
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        });

        list.dispatch(&[0x10]);
        list.dispatch(&[0x11]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_can_remove_itself_during_dispatch() {
        let list = Arc::new(EventHandlerList::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<HandlerHandle>>> = Arc::new(Mutex::new(None));

        let handle = list.insert(always(), {
            let hits = Arc::clone(&hits);
            let slot = Arc::clone(&slot);
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                slot.lock().unwrap().take();
            })
        });
        *slot.lock().unwrap() = Some(handle);

        list.dispatch(&[0x10]);
        list.dispatch(&[0x10]);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn removal_during_dispatch_skips_later_handlers() {
        let list = Arc::new(EventHandlerList::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let victim: Arc<Mutex<Option<HandlerHandle>>> = Arc::new(Mutex::new(None));

        // Registered first, so it runs last.
        let victim_handle = list.insert(always(), {
            let hits = Arc::clone(&hits);
            Box::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        });
        *victim.lock().unwrap() = Some(victim_handle);

        let _killer = list.insert(always(), {
            let victim = Arc::clone(&victim);
            Box::new(move |_| {
                victim.lock().unwrap().take();
            })
        });

        list.dispatch(&[0x10]);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn stale_ids_do_not_remove_reused_slots() {
        let list = Arc::new(EventHandlerList::new());

        let first = list.insert(always(), Box::new(|_| ()));
        let first_id = first.id();
        drop(first);

        let second = list.insert(always(), Box::new(|_| ()));
        assert_eq!(second.id().index, first_id.index);
        assert_ne!(second.id(), first_id);

        list.remove(first_id);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn handle_outlives_list() {
        let list = Arc::new(EventHandlerList::new());
        let handle = list.insert(always(), Box::new(|_| ()));
        drop(list);
        drop(handle);
    }
}
