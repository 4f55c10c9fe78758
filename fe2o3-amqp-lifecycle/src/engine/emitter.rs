//! Listener registry shared by the engine objects and the wrappers

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::EventName;

/// A registered event listener
pub type Listener<C> = Arc<dyn Fn(&C) + Send + Sync>;

/// Identifies a listener registered on an [`EventEmitter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<C> {
    name: EventName,
    once: bool,
    listener: Listener<C>,
}

struct Registry<C> {
    next_id: u64,
    // Insertion order is the invocation order
    entries: IndexMap<u64, Entry<C>>,
}

/// An event emitter keyed by [`EventName`].
///
/// Listeners are invoked in registration order, outside of the registry lock,
/// so a listener may register or remove listeners (including itself) while it
/// runs.
pub struct EventEmitter<C> {
    registry: Mutex<Registry<C>>,
}

impl<C> fmt::Debug for EventEmitter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.registry.lock().entries.len())
            .finish()
    }
}

impl<C> Default for EventEmitter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> EventEmitter<C> {
    /// Creates an emitter without any listener
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                entries: IndexMap::new(),
            }),
        }
    }

    /// Registers a listener that is invoked every time `name` is emitted
    pub fn on<F>(&self, name: EventName, listener: F) -> ListenerId
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.register(name, false, Arc::new(listener))
    }

    /// Registers a listener that is removed right before its first invocation
    pub fn once<F>(&self, name: EventName, listener: F) -> ListenerId
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.register(name, true, Arc::new(listener))
    }

    fn register(&self, name: EventName, once: bool, listener: Listener<C>) -> ListenerId {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(
            id,
            Entry {
                name,
                once,
                listener,
            },
        );
        ListenerId(id)
    }

    /// Removes a listener. Returns `false` if it was already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.registry.lock().entries.shift_remove(&id.0).is_some()
    }

    /// Removes every listener of `name`, or every listener if `name` is `None`
    pub fn remove_all_listeners(&self, name: Option<EventName>) {
        let mut registry = self.registry.lock();
        match name {
            Some(name) => registry.entries.retain(|_, entry| entry.name != name),
            None => registry.entries.clear(),
        }
    }

    /// Number of listeners registered for `name`
    pub fn listener_count(&self, name: EventName) -> usize {
        self.registry
            .lock()
            .entries
            .values()
            .filter(|entry| entry.name == name)
            .count()
    }

    /// Invokes every listener registered for `name`.
    ///
    /// Returns `false` if there was no listener for `name`.
    pub fn emit(&self, name: EventName, context: &C) -> bool {
        let listeners: Vec<Listener<C>> = {
            let mut registry = self.registry.lock();
            let mut spent = Vec::new();
            let listeners: Vec<Listener<C>> = registry
                .entries
                .iter()
                .filter(|(_, entry)| entry.name == name)
                .map(|(id, entry)| {
                    if entry.once {
                        spent.push(*id);
                    }
                    entry.listener.clone()
                })
                .collect();
            for id in spent {
                registry.entries.shift_remove(&id);
            }
            listeners
        };

        for listener in &listeners {
            listener(context);
        }
        !listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use parking_lot::Mutex;

    use super::{EventEmitter, EventName};

    #[test]
    fn emit_without_listener_returns_false() {
        let emitter = EventEmitter::<u32>::new();
        assert!(!emitter.emit(EventName::SessionOpen, &1));
    }

    #[test]
    fn once_listener_fires_once() {
        let emitter = EventEmitter::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        emitter.once(EventName::SenderOpen, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(emitter.emit(EventName::SenderOpen, &0));
        assert!(!emitter.emit(EventName::SenderOpen, &0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(EventName::SenderOpen), 0);
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let emitter = EventEmitter::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            emitter.on(EventName::Message, move |ctx| order.lock().push((i, *ctx)));
        }
        emitter.emit(EventName::Message, &7);
        assert_eq!(*order.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn remove_listener_is_idempotent() {
        let emitter = EventEmitter::<u32>::new();
        let id = emitter.on(EventName::Settled, |_| {});
        assert!(emitter.remove_listener(id));
        assert!(!emitter.remove_listener(id));
        assert_eq!(emitter.listener_count(EventName::Settled), 0);
    }

    #[test]
    fn listener_can_remove_itself_while_running() {
        let emitter = Arc::new(EventEmitter::<u32>::new());
        let slot = Arc::new(Mutex::new(None));
        let emitter_clone = emitter.clone();
        let slot_clone = slot.clone();
        let id = emitter.on(EventName::SessionError, move |_| {
            if let Some(id) = slot_clone.lock().take() {
                emitter_clone.remove_listener(id);
            }
        });
        *slot.lock() = Some(id);

        assert!(emitter.emit(EventName::SessionError, &0));
        assert!(!emitter.emit(EventName::SessionError, &0));
    }

    #[test]
    fn remove_all_listeners_by_name() {
        let emitter = EventEmitter::<u32>::new();
        emitter.on(EventName::SenderOpen, |_| {});
        emitter.on(EventName::SenderOpen, |_| {});
        emitter.on(EventName::SenderClose, |_| {});

        emitter.remove_all_listeners(Some(EventName::SenderOpen));
        assert_eq!(emitter.listener_count(EventName::SenderOpen), 0);
        assert_eq!(emitter.listener_count(EventName::SenderClose), 1);

        emitter.remove_all_listeners(None);
        assert_eq!(emitter.listener_count(EventName::SenderClose), 0);
    }
}
