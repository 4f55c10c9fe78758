//! Behaviour shared by connections, sessions and links.
//!
//! Every wrapper subscribes to the whole event vocabulary of the engine
//! object it wraps as soon as it is constructed, and re-emits each event,
//! translated into an [`EventContext`], on its own [`EventEmitter`]. Because
//! the engine object therefore always has a listener, the engine never
//! propagates an event to the parent object.
//!
//! Error events are held back while a create or close operation of the
//! emitting entity is pending. The operation's own listeners are registered
//! on the engine object and observe the event first, so the awaiting caller
//! always sees the failure before any listener registered on the wrapper.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    context::EventContext,
    dispatcher::Dispatcher,
    engine::{EventEmitter, EventName, ListenerId, RawEndpoint, RawEventContext},
    util::PendingOperations,
};

/// State every wrapper carries
#[derive(Debug, Default)]
pub(crate) struct EntityCore {
    pub pending: PendingOperations,
    pub events: EventEmitter<EventContext>,
    forwarders: Mutex<Vec<ListenerId>>,
}

impl EntityCore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Implemented by the shared state behind each wrapper
pub(crate) trait Forward: Send + Sync + 'static {
    fn core(&self) -> &EntityCore;

    /// Dispatcher of the owning connection
    fn dispatcher(&self) -> &Dispatcher;

    /// Replaces the engine objects in `raw` with wrappers, this entity being
    /// the emitter
    fn translate(inner: &Arc<Self>, raw: &RawEventContext) -> EventContext
    where
        Self: Sized;
}

/// Forwards every event in `names` from the engine object to the wrapper
pub(crate) fn subscribe<T, O>(inner: &Arc<T>, raw: &O, names: &[EventName])
where
    T: Forward,
    O: RawEndpoint + ?Sized,
{
    let ids: Vec<ListenerId> = names
        .iter()
        .map(|&name| {
            let weak = Arc::downgrade(inner);
            raw.events().on(name, move |context| {
                if let Some(inner) = weak.upgrade() {
                    emit_event(&inner, context);
                }
            })
        })
        .collect();
    inner.core().forwarders.lock().extend(ids);
}

/// Removes the forwarding listeners. Subsequent events on the engine object
/// are subject to the engine's own propagation again.
pub(crate) fn unsubscribe<O>(core: &EntityCore, raw: &O)
where
    O: RawEndpoint + ?Sized,
{
    let ids = std::mem::take(&mut *core.forwarders.lock());
    for id in ids {
        raw.events().remove_listener(id);
    }
}

fn emit_event<T: Forward>(inner: &Arc<T>, raw: &RawEventContext) {
    let name = raw.name;
    let context = T::translate(inner, raw);
    let core = inner.core();

    if matches!(name, EventName::ConnectionError | EventName::ProtocolError) {
        #[cfg(feature = "tracing")]
        tracing::error!(event = %name, error = ?raw.error);
        #[cfg(feature = "log")]
        log::error!("{}: {:?}", name, raw.error);
    }

    let pending = core.pending.count();
    if name.is_error() && pending > 0 {
        #[cfg(feature = "tracing")]
        tracing::debug!(event = %name, pending, "deferring until pending operations settle");
        #[cfg(feature = "log")]
        log::debug!(
            "deferring {} until {} pending operation(s) settle",
            name,
            pending
        );

        let target = inner.clone();
        inner.dispatcher().defer(core.pending.clone(), move || {
            target.core().events.emit(name, &context);
        });
    } else {
        #[cfg(feature = "tracing")]
        tracing::trace!(event = %name, "re-emitting");
        #[cfg(feature = "log")]
        log::trace!("re-emitting {}", name);

        core.events.emit(name, &context);
    }
}

/// The translated event surface of a connection, session or link
pub trait Entity {
    /// The emitter that re-emits the events of the wrapped engine object
    fn events(&self) -> &EventEmitter<EventContext>;

    /// Registers a listener for `name`
    fn on<F>(&self, name: EventName, listener: F) -> ListenerId
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        self.events().on(name, listener)
    }

    /// Registers a listener that is invoked at most once
    fn once<F>(&self, name: EventName, listener: F) -> ListenerId
    where
        F: Fn(&EventContext) + Send + Sync + 'static,
    {
        self.events().once(name, listener)
    }

    /// Removes a listener. Returns `false` if it was already removed.
    fn remove_listener(&self, id: ListenerId) -> bool {
        self.events().remove_listener(id)
    }

    /// Number of listeners registered for `name`
    fn listener_count(&self, name: EventName) -> usize {
        self.events().listener_count(name)
    }
}
