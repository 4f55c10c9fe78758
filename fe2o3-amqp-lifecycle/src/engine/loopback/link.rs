use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use fe2o3_amqp_types::{
    definitions::{self, Fields, LinkError, ReceiverSettleMode, SenderSettleMode},
    messaging::{Accepted, DeliveryState},
};
use parking_lot::Mutex;

use crate::engine::{
    Delivery, EngineError, EventEmitter, Message, RawEndpoint, RawEventContext, RawLink, Role,
};

use super::{Command, EndpointState, LoopbackSession};

pub(crate) struct LinkParams {
    pub name: String,
    pub address: Option<String>,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub properties: Option<Fields>,
    pub credit_window: u32,
    pub auto_accept: bool,
}

#[derive(Debug, Default)]
struct Flow {
    credit: u32,
    drain: bool,
}

/// A link on a [`LoopbackSession`]
pub struct LoopbackLink {
    session: Weak<LoopbackSession>,
    channel: u16,
    handle: u32,
    role: Role,
    params: LinkParams,
    events: EventEmitter<RawEventContext>,
    state: Mutex<EndpointState>,
    error: Mutex<Option<EngineError>>,
    flow: Mutex<Flow>,
    unsettled: Mutex<HashMap<u32, Message>>,
}

impl std::fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLink")
            .field("name", &self.params.name)
            .field("role", &self.role)
            .field("handle", &self.handle)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl LoopbackLink {
    pub(crate) fn new(
        session: Weak<LoopbackSession>,
        channel: u16,
        handle: u32,
        role: Role,
        params: LinkParams,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            channel,
            handle,
            role,
            params,
            events: EventEmitter::new(),
            state: Mutex::new(EndpointState::default()),
            error: Mutex::new(None),
            flow: Mutex::new(Flow::default()),
            unsettled: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn session(&self) -> Option<Arc<LoopbackSession>> {
        self.session.upgrade()
    }

    fn command(&self, command: Command) {
        if let Some(session) = self.session.upgrade() {
            session.command(command);
        }
    }

    pub(crate) fn on_remote_attach(&self) {
        self.state.lock().remote_open = true;
    }

    pub(crate) fn on_remote_detach(&self, error: Option<EngineError>) {
        if error.is_some() {
            *self.error.lock() = error;
        }
        self.state.lock().remote_closed = true;
    }

    pub(crate) fn shut(&self) {
        self.state.lock().shut();
    }

    pub(crate) fn forget(&self) {
        if let Some(session) = self.session.upgrade() {
            session.forget_link(self.handle);
        }
    }

    /// The peer issues credit to a sending link
    pub(crate) fn grant(&self, credit: u32) {
        let mut flow = self.flow.lock();
        flow.credit = flow.credit.saturating_add(credit);
    }

    /// Consumes the drain flag, returns whether a drain was requested
    pub(crate) fn drain_pending(&self) -> bool {
        let mut flow = self.flow.lock();
        if flow.drain {
            flow.credit = 0;
            flow.drain = false;
            true
        } else {
            false
        }
    }

    pub(crate) fn on_incoming_transfer(&self, message: Message) -> Delivery {
        let id = self
            .session
            .upgrade()
            .map(|session| session.next_incoming_id())
            .unwrap_or(0);
        {
            let mut flow = self.flow.lock();
            flow.credit = flow.credit.saturating_sub(1);
        }
        let settled = matches!(self.params.snd_settle_mode, SenderSettleMode::Settled);
        if !settled {
            self.unsettled.lock().insert(id, message);
        }
        Delivery {
            id,
            tag: id.to_be_bytes().to_vec(),
            format: 0,
            settled,
            remote_state: None,
        }
    }

    pub(crate) fn after_incoming_transfer(&self, delivery_id: u32) {
        let unsettled = self.unsettled.lock().contains_key(&delivery_id);
        if self.params.auto_accept && unsettled {
            self.update_delivery(delivery_id, DeliveryState::Accepted(Accepted {}), true);
        }

        let window = self.params.credit_window;
        let mut flow = self.flow.lock();
        if window > 0 && flow.credit <= window / 2 {
            flow.credit = window;
        }
    }
}

impl RawEndpoint for LoopbackLink {
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
        self.command(Command::Detach(self.channel, self.handle));
    }

    fn remove(&self) {
        self.shut();
        self.forget();
    }
}

impl RawLink for LoopbackLink {
    fn name(&self) -> &str {
        &self.params.name
    }

    fn role(&self) -> Role {
        self.role
    }

    fn address(&self) -> Option<&str> {
        self.params.address.as_deref()
    }

    fn attach(&self) {
        {
            let mut state = self.state.lock();
            if state.local_open {
                return;
            }
            state.local_open = true;
        }
        if let Role::Receiver = self.role {
            self.flow.lock().credit = self.params.credit_window;
        }
        self.command(Command::Attach(self.channel, self.handle));
    }

    fn credit(&self) -> u32 {
        self.flow.lock().credit
    }

    fn sendable(&self) -> bool {
        self.role == Role::Sender && self.is_open() && self.credit() > 0
    }

    fn send(
        &self,
        message: Message,
        tag: Option<Vec<u8>>,
        format: Option<u32>,
    ) -> Result<Delivery, EngineError> {
        if self.role != Role::Sender || !self.is_open() {
            return Err(EngineError::Protocol(definitions::Error {
                condition: LinkError::DetachForced.into(),
                description: Some(format!("link '{}' is not open", self.params.name)),
                info: None,
            }));
        }
        let session = self.session.upgrade().ok_or_else(|| {
            EngineError::Disconnected(format!("session of '{}' is gone", self.params.name))
        })?;

        let id = session.next_outgoing_id();
        {
            let mut flow = self.flow.lock();
            flow.credit = flow.credit.saturating_sub(1);
        }
        let delivery = Delivery {
            id,
            tag: tag.unwrap_or_else(|| id.to_be_bytes().to_vec()),
            format: format.unwrap_or(0),
            settled: matches!(self.params.snd_settle_mode, SenderSettleMode::Settled),
            remote_state: None,
        };
        self.command(Command::Transfer {
            channel: self.channel,
            handle: self.handle,
            delivery: delivery.clone(),
            message,
        });
        Ok(delivery)
    }

    fn add_credit(&self, credit: u32) {
        self.grant(credit);
        self.command(Command::Flow(self.channel, self.handle));
    }

    fn set_drain(&self, drain: bool) {
        self.flow.lock().drain = drain;
        self.command(Command::Flow(self.channel, self.handle));
    }

    fn is_draining(&self) -> bool {
        self.flow.lock().drain
    }

    fn set_drained(&self, drained: bool) {
        if drained {
            let mut flow = self.flow.lock();
            flow.credit = 0;
            flow.drain = false;
        }
    }

    fn update_delivery(&self, delivery_id: u32, state: DeliveryState, settled: bool) {
        let message = if settled {
            self.unsettled.lock().remove(&delivery_id)
        } else {
            None
        };
        // Released and modified messages go back to the queue
        let requeue = match &state {
            DeliveryState::Released(_) => message,
            DeliveryState::Modified(modified) if modified.undeliverable_here != Some(true) => {
                message
            }
            _ => None,
        };
        self.command(Command::Disposition {
            channel: self.channel,
            handle: self.handle,
            requeue,
        });
    }

    fn snd_settle_mode(&self) -> SenderSettleMode {
        self.params.snd_settle_mode.clone()
    }

    fn rcv_settle_mode(&self) -> ReceiverSettleMode {
        self.params.rcv_settle_mode.clone()
    }

    fn properties(&self) -> Option<Fields> {
        self.params.properties.clone()
    }
}
