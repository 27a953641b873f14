//! A serialized fan-out of typed events to subscriber callbacks.
//!
//! A [`Broadcast<E>`] holds an ordered list of slots (callbacks) and invokes
//! every live one on [`notify`](Broadcast::notify). The slot list's own lock
//! is dropped during dispatch so that slots may freely connect and
//! disconnect; an outer mutex restores the guarantee the rest of the crate's
//! event model depends on: two threads can never run slots of the same sink
//! concurrently.
//!
//! [`Broadcast::global`] provides the process-wide instance per event type
//! that event routing plugs into.

use core::any::{Any, TypeId};
use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering::*};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

/// The registry backing [`Broadcast::global`]: one leaked singleton per
/// event type, the Rust rendition of a function-local static per template
/// instantiation.
static REGISTRY: OnceLock<RwLock<HashMap<TypeId, &'static (dyn Any + Send + Sync)>>> =
    OnceLock::new();

/// A single-writer broadcast sink for events of type `E`.
///
/// Slots run in subscription order. A slot connected while a `notify` is in
/// flight is observed by subsequent notifications only. A panicking slot
/// propagates to the `notify` caller and skips the remaining slots of that
/// one call; later calls are unaffected.
///
/// Slots of one sink must not `notify` that same sink recursively; the
/// serializing mutex is not reentrant and the call deadlocks.
pub struct Broadcast<E: 'static> {
    /// Serializes whole `notify` calls; never held while connecting.
    notify_lock: Mutex<()>,
    slots: RwLock<Vec<Slot<E>>>,
}

struct Slot<E: 'static> {
    alive: Arc<AtomicBool>,
    call: Arc<dyn Fn(&E) + Send + Sync>,
}

/// A subscription to a [`Broadcast`].
///
/// Dropping the token (or calling [`disconnect`](Token::disconnect))
/// disconnects the slot; a disconnection observed mid-`notify` takes effect
/// before that slot would run.
#[must_use = "dropping a Token disconnects the slot immediately"]
pub struct Token {
    alive: Arc<AtomicBool>,
}

// === impl Broadcast ===

impl<E: 'static> Broadcast<E> {
    /// Returns a new sink with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            notify_lock: Mutex::new(()),
            slots: RwLock::new(Vec::new()),
        }
    }

    /// The process-wide sink for events of type `E`, created on first use.
    pub fn global() -> &'static Self {
        let registry = REGISTRY.get_or_init(Default::default);
        let key = TypeId::of::<E>();
        {
            let read = registry.read();
            if let Some(&entry) = read.get(&key) {
                return entry
                    .downcast_ref::<Self>()
                    .expect("broadcast registry entry has the event type it was keyed under");
            }
        }
        let mut write = registry.write();
        let entry = *write.entry(key).or_insert_with(|| {
            let leaked: &'static (dyn Any + Send + Sync) = &*Box::leak(Box::new(Self::new()));
            leaked
        });
        drop(write);
        entry
            .downcast_ref::<Self>()
            .expect("broadcast registry entry has the event type it was keyed under")
    }

    /// Appends `slot` to the subscription list.
    ///
    /// The slot stays connected for as long as the returned [`Token`]
    /// lives. May be called at any time, including from inside a slot
    /// during `notify`; the new slot is first run by the *next*
    /// notification.
    pub fn connect<F>(&self, slot: F) -> Token
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let mut slots = self.slots.write();
        // sweep slots whose tokens are gone
        slots.retain(|s| s.alive.load(Acquire));
        slots.push(Slot {
            alive: alive.clone(),
            call: Arc::new(slot),
        });
        Token { alive }
    }

    /// Invokes every live slot with `event`, in subscription order.
    ///
    /// Concurrent `notify` calls from different threads are serialized:
    /// one call's slot invocations never interleave with another's.
    pub fn notify(&self, event: &E) {
        let _serialized = self.notify_lock.lock();
        // snapshot under the list lock, dispatch outside it, so slots can
        // mutate subscriptions
        let slots: Vec<Slot<E>> = self
            .slots
            .read()
            .iter()
            .map(|s| Slot {
                alive: s.alive.clone(),
                call: s.call.clone(),
            })
            .collect();
        for slot in &slots {
            if slot.alive.load(Acquire) {
                (slot.call)(event);
            }
        }
    }

    /// The number of currently connected slots.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|s| s.alive.load(Acquire))
            .count()
    }

    /// Whether no slot is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Broadcast<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> fmt::Debug for Broadcast<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("slots", &self.len())
            .finish_non_exhaustive()
    }
}

// === impl Token ===

impl Token {
    /// Disconnects the slot. Equivalent to dropping the token.
    pub fn disconnect(self) {}
}

impl Drop for Token {
    fn drop(&mut self) {
        self.alive.store(false, Release);
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("connected", &self.alive.load(Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_is_per_type() {
        struct EventA;
        struct EventB;

        let a1 = Broadcast::<EventA>::global() as *const _;
        let a2 = Broadcast::<EventA>::global() as *const _;
        let b = Broadcast::<EventB>::global() as *const Broadcast<EventB>;

        assert_eq!(a1, a2);
        assert_ne!(a1 as usize, b as usize);
    }

    #[test]
    fn token_drop_disconnects() {
        let sink = Broadcast::<u32>::new();
        let hits = Arc::new(AtomicBool::new(false));

        let hits2 = hits.clone();
        let token = sink.connect(move |_| hits2.store(true, Release));
        assert_eq!(sink.len(), 1);

        drop(token);
        assert!(sink.is_empty());

        sink.notify(&7);
        assert!(!hits.load(Acquire));
    }
}
