use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

use fe2o3_amqp_types::definitions;
use parking_lot::Mutex;

use crate::{
    engine::{EngineError, EventEmitter, RawEndpoint, RawEventContext, RawLink, RawSession, Role},
    link::{ReceiverOptions, SenderOptions},
    session::SessionOptions,
};

use super::{link::LinkParams, Command, EndpointState, LoopbackConnection, LoopbackLink};

/// A session on a [`LoopbackConnection`]
pub struct LoopbackSession {
    me: Weak<LoopbackSession>,
    connection: Weak<LoopbackConnection>,
    local_channel: u16,
    handle_max: u32,
    remote_channel: Mutex<Option<u16>>,
    events: EventEmitter<RawEventContext>,
    state: Mutex<EndpointState>,
    error: Mutex<Option<EngineError>>,
    links: Mutex<BTreeMap<u32, Arc<LoopbackLink>>>,
    next_outgoing_id: AtomicU32,
    next_incoming_id: AtomicU32,
}

impl std::fmt::Debug for LoopbackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSession")
            .field("local_channel", &self.local_channel)
            .field("remote_channel", &*self.remote_channel.lock())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl LoopbackSession {
    pub(crate) fn new(
        connection: Weak<LoopbackConnection>,
        local_channel: u16,
        options: &SessionOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connection,
            local_channel,
            handle_max: options.handle_max,
            remote_channel: Mutex::new(None),
            events: EventEmitter::new(),
            state: Mutex::new(EndpointState::default()),
            error: Mutex::new(None),
            links: Mutex::new(BTreeMap::new()),
            next_outgoing_id: AtomicU32::new(0),
            next_incoming_id: AtomicU32::new(0),
        })
    }

    pub(crate) fn command(&self, command: Command) {
        if let Some(connection) = self.connection.upgrade() {
            connection.command(command);
        }
    }

    pub(crate) fn link(&self, handle: u32) -> Option<Arc<LoopbackLink>> {
        self.links.lock().get(&handle).cloned()
    }

    pub(crate) fn links(&self) -> Vec<Arc<LoopbackLink>> {
        self.links.lock().values().cloned().collect()
    }

    pub(crate) fn forget_link(&self, handle: u32) {
        self.links.lock().remove(&handle);
    }

    pub(crate) fn next_outgoing_id(&self) -> u32 {
        self.next_outgoing_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_incoming_id(&self) -> u32 {
        self.next_incoming_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn on_remote_begin(&self, remote_channel: u16) {
        *self.remote_channel.lock() = Some(remote_channel);
        self.state.lock().remote_open = true;
    }

    pub(crate) fn on_remote_end(&self, error: Option<EngineError>) {
        if error.is_some() {
            *self.error.lock() = error;
        }
        self.state.lock().remote_closed = true;
        // Ending a session implicitly detaches its links
        for link in std::mem::take(&mut *self.links.lock()).into_values() {
            link.shut();
        }
    }

    /// Closed along with the connection, without any frame
    pub(crate) fn shut(&self) {
        self.state.lock().shut();
        for link in std::mem::take(&mut *self.links.lock()).into_values() {
            link.shut();
        }
    }

    fn attach_link(&self, role: Role, params: LinkParams) -> Arc<LoopbackLink> {
        let mut links = self.links.lock();
        let mut handle = 0u32;
        while links.contains_key(&handle) && handle < self.handle_max {
            handle += 1;
        }
        let link = LoopbackLink::new(self.me.clone(), self.local_channel, handle, role, params);
        links.insert(handle, link.clone());
        link
    }
}

impl RawEndpoint for LoopbackSession {
    fn events(&self) -> &EventEmitter<RawEventContext> {
        &self.events
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    fn is_remote_open(&self) -> bool {
        self.state.lock().is_remote_open()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    fn is_itself_closed(&self) -> bool {
        self.state.lock().local_closed
    }

    fn error(&self) -> Option<EngineError> {
        self.error.lock().clone()
    }

    fn close(&self, _error: Option<definitions::Error>) {
        {
            let mut state = self.state.lock();
            if state.local_closed {
                return;
            }
            state.local_closed = true;
        }
        self.command(Command::End(self.local_channel));
    }

    fn remove(&self) {
        self.shut();
        if let Some(connection) = self.connection.upgrade() {
            connection.forget_session(self.local_channel);
        }
    }
}

impl RawSession for LoopbackSession {
    fn local_channel(&self) -> u16 {
        self.local_channel
    }

    fn remote_channel(&self) -> Option<u16> {
        *self.remote_channel.lock()
    }

    fn begin(&self) {
        {
            let mut state = self.state.lock();
            if state.local_open {
                return;
            }
            state.local_open = true;
        }
        self.command(Command::Begin(self.local_channel));
    }

    fn create_sender(&self, options: &SenderOptions) -> Arc<dyn RawLink> {
        let params = LinkParams {
            name: options.name.clone(),
            address: options.address.clone(),
            snd_settle_mode: options.snd_settle_mode.clone(),
            rcv_settle_mode: options.rcv_settle_mode.clone(),
            properties: options.properties.clone(),
            credit_window: 0,
            auto_accept: false,
        };
        self.attach_link(Role::Sender, params)
    }

    fn create_receiver(&self, options: &ReceiverOptions) -> Arc<dyn RawLink> {
        let params = LinkParams {
            name: options.name.clone(),
            address: options.address.clone(),
            snd_settle_mode: options.snd_settle_mode.clone(),
            rcv_settle_mode: options.rcv_settle_mode.clone(),
            properties: options.properties.clone(),
            credit_window: options.credit_window,
            auto_accept: options.auto_accept,
        };
        self.attach_link(Role::Receiver, params)
    }
}
