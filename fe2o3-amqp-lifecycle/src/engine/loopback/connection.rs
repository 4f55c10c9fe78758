use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use fe2o3_amqp_types::{definitions, messaging::DeliveryState};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    connection::ConnectionOptions,
    engine::{
        Delivery, EngineError, EventEmitter, EventName, Message, RawConnection, RawEndpoint,
        RawEventContext, RawLink, RawSession, Role,
    },
    session::SessionOptions,
};

use super::{
    Command, EndpointState, LoopbackLink, LoopbackSession, PeerAction, PeerShared, Performative,
    Running,
};

/// A connection to the in-memory peer
pub struct LoopbackConnection {
    me: Weak<LoopbackConnection>,
    container_id: String,
    channel_max: u16,
    events: EventEmitter<RawEventContext>,
    state: Mutex<EndpointState>,
    error: Mutex<Option<EngineError>>,
    sessions: Mutex<BTreeMap<u16, Arc<LoopbackSession>>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("container_id", &self.container_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl LoopbackConnection {
    pub(crate) fn spawn(
        container_id: &str,
        options: &ConnectionOptions,
        top: Arc<EventEmitter<RawEventContext>>,
        peer: Arc<PeerShared>,
    ) -> Arc<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let connection = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            container_id: container_id.to_string(),
            channel_max: options.channel_max,
            events: EventEmitter::new(),
            state: Mutex::new(EndpointState::default()),
            error: Mutex::new(None),
            sessions: Mutex::new(BTreeMap::new()),
            commands,
        });

        let driver = Driver {
            connection: Arc::downgrade(&connection),
            commands: rx,
            top,
            peer,
            disconnected: false,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(driver.event_loop());
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(container_id, "no runtime to drive the loopback connection");
                #[cfg(feature = "log")]
                log::error!(
                    "no runtime to drive the loopback connection of {}",
                    container_id
                );
            }
        }
        connection
    }

    pub(crate) fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(container_id = %self.container_id, "loopback driver has stopped");
            #[cfg(feature = "log")]
            log::warn!("loopback driver of {} has stopped", self.container_id);
        }
    }

    pub(crate) fn session(&self, channel: u16) -> Option<Arc<LoopbackSession>> {
        self.sessions.lock().get(&channel).cloned()
    }

    pub(crate) fn forget_session(&self, channel: u16) {
        self.sessions.lock().remove(&channel);
    }

    fn sessions(&self) -> Vec<Arc<LoopbackSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    fn links(&self) -> Vec<Arc<LoopbackLink>> {
        self.sessions()
            .iter()
            .flat_map(|session| session.links())
            .collect()
    }

    fn shut_all(&self) {
        self.state.lock().shut();
        let sessions: Vec<_> = std::mem::take(&mut *self.sessions.lock())
            .into_values()
            .collect();
        for session in sessions {
            session.shut();
        }
    }
}

impl RawEndpoint for LoopbackConnection {
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
        self.command(Command::Close);
    }

    fn remove(&self) {
        self.shut_all();
        self.command(Command::Remove);
    }
}

impl RawConnection for LoopbackConnection {
    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn open(&self) {
        {
            let mut state = self.state.lock();
            if state.local_open {
                return;
            }
            state.local_open = true;
        }
        self.command(Command::Open);
    }

    fn create_session(&self, options: &SessionOptions) -> Arc<dyn RawSession> {
        let mut sessions = self.sessions.lock();
        // Lowest free channel
        let mut channel = 0u16;
        while sessions.contains_key(&channel) && channel < self.channel_max {
            channel += 1;
        }
        let session = LoopbackSession::new(self.me.clone(), channel, options);
        sessions.insert(channel, session.clone());
        session
    }

    fn is_session_max_reached(&self) -> bool {
        self.sessions.lock().len() > self.channel_max as usize
    }
}

/// Answers the local side of one connection
struct Driver {
    connection: Weak<LoopbackConnection>,
    commands: mpsc::UnboundedReceiver<Command>,
    top: Arc<EventEmitter<RawEventContext>>,
    peer: Arc<PeerShared>,
    disconnected: bool,
}

impl Driver {
    async fn event_loop(mut self) {
        while let Some(command) = self.commands.recv().await {
            let connection = match self.connection.upgrade() {
                Some(connection) => connection,
                None => break,
            };
            if let Running::Stop = self.on_command(&connection, command) {
                break;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("loopback driver exiting event_loop");
        #[cfg(feature = "log")]
        log::trace!("loopback driver exiting event_loop");
    }

    fn on_command(&mut self, connection: &Arc<LoopbackConnection>, command: Command) -> Running {
        let command = match command {
            Command::Remove => return Running::Stop,
            // The transport is gone
            _ if self.disconnected => return Running::Continue,
            Command::Peer(action) => {
                self.on_peer_action(connection, action);
                return Running::Continue;
            }
            command => command,
        };

        let performative = match &command {
            Command::Open => Performative::Open,
            Command::Close => Performative::Close,
            Command::Begin(_) => Performative::Begin,
            Command::End(_) => Performative::End,
            Command::Attach(..) => Performative::Attach,
            Command::Detach(..) => Performative::Detach,
            Command::Transfer { .. } => Performative::Transfer,
            Command::Flow(..) => Performative::Flow,
            Command::Disposition { .. } => Performative::Disposition,
            Command::Remove | Command::Peer(_) => return Running::Continue,
        };
        self.peer.record(performative);
        if !self.peer.is_responsive() {
            return Running::Continue;
        }

        match command {
            Command::Open => match self.peer.take_open_error() {
                Some(error) => self.on_close(connection, Some(error)),
                None => self.on_open(connection),
            },
            Command::Close => self.on_close(connection, None),
            Command::Begin(channel) => self.on_begin(connection, channel),
            Command::End(channel) => {
                let error = self.peer.take_end_error();
                self.on_end(connection, channel, error);
            }
            Command::Attach(channel, handle) => self.on_attach(connection, channel, handle),
            Command::Detach(channel, handle) => {
                if let Some(link) = find_link(connection, channel, handle) {
                    let error = self.peer.take_detach_error();
                    self.on_detach(connection, &link, error);
                }
            }
            Command::Transfer {
                channel,
                handle,
                delivery,
                message,
            } => {
                if let Some(link) = find_link(connection, channel, handle) {
                    self.on_transfer(connection, &link, delivery, message);
                }
            }
            Command::Flow(channel, handle) => {
                if let Some(link) = find_link(connection, channel, handle) {
                    self.on_receiver_flow(connection, &link);
                }
            }
            Command::Disposition {
                channel,
                handle,
                requeue,
            } => {
                let link = find_link(connection, channel, handle);
                let address = link.as_ref().and_then(|link| link.address());
                if let (Some(address), Some(message)) = (address, requeue) {
                    self.peer.requeue(address, message);
                    self.peer.announce(address);
                }
            }
            Command::Remove | Command::Peer(_) => {}
        }
        Running::Continue
    }

    fn on_peer_action(&mut self, connection: &Arc<LoopbackConnection>, action: PeerAction) {
        match action {
            PeerAction::End(channel, error) => {
                let open = connection
                    .session(channel)
                    .map(|session| session.is_remote_open())
                    .unwrap_or(false);
                if open {
                    self.on_end(connection, channel, error);
                }
            }
            PeerAction::Detach(name, error) => {
                let link = connection
                    .links()
                    .into_iter()
                    .find(|link| link.name() == name && link.is_remote_open());
                if let Some(link) = link {
                    self.on_detach(connection, &link, error);
                }
            }
            PeerAction::Close(error) => {
                if connection.is_remote_open() {
                    self.on_close(connection, error);
                }
            }
            PeerAction::Disconnect(reason) => self.on_disconnect(connection, reason),
            PeerAction::GrantCredit(name, credit) => {
                let link = connection.links().into_iter().find(|link| {
                    link.name() == name && link.role() == Role::Sender && link.is_open()
                });
                if let Some(link) = link {
                    link.grant(credit);
                    self.dispatch_flow(connection, &link);
                }
            }
            PeerAction::Serve(address) => {
                for link in connection.links() {
                    if link.role() == Role::Receiver && link.address() == Some(address.as_str()) {
                        self.serve(connection, &link);
                    }
                }
            }
        }
    }

    /* ------------------------------- Connection ------------------------------- */

    fn on_open(&mut self, connection: &Arc<LoopbackConnection>) {
        connection.state.lock().remote_open = true;
        self.dispatch(connection_context(EventName::ConnectionOpen, connection));
    }

    fn on_close(
        &mut self,
        connection: &Arc<LoopbackConnection>,
        error: Option<definitions::Error>,
    ) {
        connection.state.lock().remote_closed = true;
        for session in connection.sessions() {
            session.shut();
        }
        connection.sessions.lock().clear();

        if let Some(error) = error {
            let error = EngineError::Protocol(error);
            *connection.error.lock() = Some(error.clone());
            let mut context = connection_context(EventName::ConnectionError, connection);
            context.error = Some(error.clone());
            self.dispatch(context);

            let mut context = connection_context(EventName::ConnectionClose, connection);
            context.error = Some(error);
            self.dispatch(context);
        } else {
            self.dispatch(connection_context(EventName::ConnectionClose, connection));
        }
    }

    fn on_disconnect(&mut self, connection: &Arc<LoopbackConnection>, reason: String) {
        self.disconnected = true;
        let error = EngineError::Disconnected(reason);
        *connection.error.lock() = Some(error.clone());
        connection.shut_all();

        let mut context = connection_context(EventName::Disconnected, connection);
        context.error = Some(error);
        context.reconnecting = Some(false);
        self.dispatch(context);
    }

    /* --------------------------------- Session -------------------------------- */

    fn on_begin(&mut self, connection: &Arc<LoopbackConnection>, channel: u16) {
        if let Some(session) = connection.session(channel) {
            session.on_remote_begin(channel);
            self.dispatch(session_context(EventName::SessionOpen, connection, &session));
        }
    }

    fn on_end(
        &mut self,
        connection: &Arc<LoopbackConnection>,
        channel: u16,
        error: Option<definitions::Error>,
    ) {
        let session = match connection.session(channel) {
            Some(session) => session,
            None => return,
        };
        let error = error.map(EngineError::Protocol);
        session.on_remote_end(error.clone());
        if session.is_closed() {
            connection.forget_session(channel);
        }

        if let Some(error) = error {
            let mut context = session_context(EventName::SessionError, connection, &session);
            context.error = Some(error.clone());
            self.dispatch(context);

            let mut context = session_context(EventName::SessionClose, connection, &session);
            context.error = Some(error);
            self.dispatch(context);
        } else {
            self.dispatch(session_context(EventName::SessionClose, connection, &session));
        }
    }

    /* ---------------------------------- Link ---------------------------------- */

    fn on_attach(&mut self, connection: &Arc<LoopbackConnection>, channel: u16, handle: u32) {
        let link = match find_link(connection, channel, handle) {
            Some(link) => link,
            None => return,
        };

        if let Some(error) = self.peer.refusal(link.address()) {
            // The peer answers with an attach without terminus, then detaches
            link.on_remote_detach(Some(EngineError::Protocol(error.clone())));
            self.dispatch_detach(connection, &link, Some(error));
            return;
        }

        link.on_remote_attach();
        let open = match link.role() {
            Role::Sender => EventName::SenderOpen,
            Role::Receiver => EventName::ReceiverOpen,
        };
        self.dispatch(link_context(open, connection, &link));

        match link.role() {
            Role::Sender => {
                link.grant(self.peer.initial_credit());
                self.dispatch_flow(connection, &link);
            }
            Role::Receiver => self.serve(connection, &link),
        }

        if let Some(error) = self.peer.failure_after_attach(link.address()) {
            self.on_detach(connection, &link, Some(error));
        }
    }

    fn on_detach(
        &mut self,
        connection: &Arc<LoopbackConnection>,
        link: &Arc<LoopbackLink>,
        error: Option<definitions::Error>,
    ) {
        link.on_remote_detach(error.clone().map(EngineError::Protocol));
        if link.is_closed() {
            link.forget();
        }
        self.dispatch_detach(connection, link, error);
    }

    fn dispatch_detach(
        &mut self,
        connection: &Arc<LoopbackConnection>,
        link: &Arc<LoopbackLink>,
        error: Option<definitions::Error>,
    ) {
        let (error_name, close_name) = match link.role() {
            Role::Sender => (EventName::SenderError, EventName::SenderClose),
            Role::Receiver => (EventName::ReceiverError, EventName::ReceiverClose),
        };
        let error = error.map(EngineError::Protocol);
        if let Some(error) = &error {
            let mut context = link_context(error_name, connection, link);
            context.error = Some(error.clone());
            self.dispatch(context);
        }
        let mut context = link_context(close_name, connection, link);
        context.error = error;
        self.dispatch(context);
    }

    fn dispatch_flow(&mut self, connection: &Arc<LoopbackConnection>, link: &Arc<LoopbackLink>) {
        self.dispatch(link_context(EventName::SenderFlow, connection, link));
        if link.sendable() {
            self.dispatch(link_context(EventName::Sendable, connection, link));
        }
    }

    fn on_transfer(
        &mut self,
        connection: &Arc<LoopbackConnection>,
        link: &Arc<LoopbackLink>,
        mut delivery: Delivery,
        message: Message,
    ) {
        if !link.is_remote_open() {
            return;
        }

        let state = self.peer.disposition().to_state();
        let routed = matches!(state, None | Some(DeliveryState::Accepted(_)));
        if let (true, Some(address)) = (routed, link.address()) {
            self.peer.enqueue(address, message);
            self.peer.announce(address);
        }

        // Pre-settled transfers never get a disposition
        if delivery.settled {
            return;
        }
        let state = match state {
            Some(state) => state,
            None => return,
        };
        let outcome = match &state {
            DeliveryState::Accepted(_) => EventName::Accepted,
            DeliveryState::Rejected(_) => EventName::Rejected,
            DeliveryState::Released(_) => EventName::Released,
            DeliveryState::Modified(_) => EventName::Modified,
            _ => return,
        };
        delivery.settled = true;
        delivery.remote_state = Some(state);

        let mut context = link_context(outcome, connection, link);
        context.delivery = Some(delivery.clone());
        self.dispatch(context);

        let mut context = link_context(EventName::Settled, connection, link);
        context.delivery = Some(delivery);
        self.dispatch(context);
    }

    fn on_receiver_flow(&mut self, connection: &Arc<LoopbackConnection>, link: &Arc<LoopbackLink>) {
        if link.role() != Role::Receiver {
            return;
        }
        self.serve(connection, link);
        if link.drain_pending() {
            self.dispatch(link_context(EventName::ReceiverDrained, connection, link));
        }
    }

    /// Hands queued messages to a receiver as long as it has credit
    fn serve(&mut self, connection: &Arc<LoopbackConnection>, link: &Arc<LoopbackLink>) {
        let address = match link.address() {
            Some(address) => address.to_string(),
            None => return,
        };
        while link.is_open() && link.credit() > 0 {
            let message = match self.peer.dequeue(&address) {
                Some(message) => message,
                None => break,
            };
            let delivery = link.on_incoming_transfer(message.clone());
            let delivery_id = delivery.id;

            let mut context = link_context(EventName::Message, connection, link);
            context.delivery = Some(delivery);
            context.message = Some(message);
            self.dispatch(context);

            link.after_incoming_transfer(delivery_id);
        }
    }

    /* -------------------------------- Dispatch -------------------------------- */

    /// Emits on the innermost object that has a listener for the event
    fn dispatch(&self, context: RawEventContext) {
        let name = context.name;
        let link = context.sender.clone().or_else(|| context.receiver.clone());
        if let Some(link) = link {
            if link.events().emit(name, &context) {
                return;
            }
        }
        if let Some(session) = context.session.clone() {
            if session.events().emit(name, &context) {
                return;
            }
        }
        if context.connection.events().emit(name, &context) {
            return;
        }
        if self.top.emit(name, &context) {
            return;
        }
        if name.is_error() && !self.top.emit(EventName::Error, &context) {
            #[cfg(feature = "tracing")]
            tracing::error!(event = %name, error = ?context.error, "unhandled error");
            #[cfg(feature = "log")]
            log::error!("unhandled {} event: {:?}", name, context.error);
        }
    }
}

fn find_link(
    connection: &LoopbackConnection,
    channel: u16,
    handle: u32,
) -> Option<Arc<LoopbackLink>> {
    connection.session(channel)?.link(handle)
}

fn connection_context(name: EventName, connection: &Arc<LoopbackConnection>) -> RawEventContext {
    let raw: Arc<dyn RawConnection> = connection.clone();
    RawEventContext::new(name, raw)
}

fn session_context(
    name: EventName,
    connection: &Arc<LoopbackConnection>,
    session: &Arc<LoopbackSession>,
) -> RawEventContext {
    let mut context = connection_context(name, connection);
    let session: Arc<dyn RawSession> = session.clone();
    context.session = Some(session);
    context
}

fn link_context(
    name: EventName,
    connection: &Arc<LoopbackConnection>,
    link: &Arc<LoopbackLink>,
) -> RawEventContext {
    let mut context = match link.session() {
        Some(session) => session_context(name, connection, &session),
        None => connection_context(name, connection),
    };
    let raw: Arc<dyn RawLink> = link.clone();
    match link.role() {
        Role::Sender => context.sender = Some(raw),
        Role::Receiver => context.receiver = Some(raw),
    }
    context
}
