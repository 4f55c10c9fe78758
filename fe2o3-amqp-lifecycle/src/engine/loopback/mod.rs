//! An in-memory AMQP 1.0 peer that implements the engine seam.
//!
//! Every connection created by a [`LoopbackEngine`] gets its own driver task.
//! Local calls (`open`, `begin`, `attach`, `send`, ...) update the local state
//! synchronously and hand a command to the driver, which answers it the
//! way a broker would and dispatches the resulting events. The remote peer
//! is scripted through the [`PeerHandle`].

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Weak,
    },
};

use fe2o3_amqp_types::{
    definitions::{self, Fields},
    messaging::DeliveryState,
};
use parking_lot::Mutex;

use super::{Delivery, Engine, EventEmitter, Message, RawConnection, RawEventContext};
use crate::connection::ConnectionOptions;

mod connection;
mod link;
mod session;

pub use connection::LoopbackConnection;
pub use link::LoopbackLink;
pub use session::LoopbackSession;

/// Link credit the peer grants to a sending link right after attaching
pub const DEFAULT_INITIAL_CREDIT: u32 = 100;

/// Performatives the local side sends to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Performative {
    /// Open
    Open,
    /// Begin
    Begin,
    /// Attach
    Attach,
    /// Flow
    Flow,
    /// Transfer
    Transfer,
    /// Disposition
    Disposition,
    /// Detach
    Detach,
    /// End
    End,
    /// Close
    Close,
}

/// How the peer settles the transfers it receives
#[derive(Debug, Clone)]
pub enum Disposition {
    /// Accept and settle
    Accept,

    /// Reject and settle
    Reject(Option<definitions::Error>),

    /// Release and settle
    Release,

    /// Modify and settle
    Modify {
        /// delivery-failed
        delivery_failed: bool,

        /// undeliverable-here
        undeliverable_here: bool,

        /// message-annotations
        message_annotations: Option<Fields>,
    },

    /// Keep the delivery unsettled
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// Open/closed flags of one end point
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EndpointState {
    pub local_open: bool,
    pub local_closed: bool,
    pub remote_open: bool,
    pub remote_closed: bool,
}

impl EndpointState {
    pub fn is_open(&self) -> bool {
        self.local_open && self.remote_open && !self.local_closed && !self.remote_closed
    }

    pub fn is_remote_open(&self) -> bool {
        self.remote_open && !self.remote_closed
    }

    pub fn is_closed(&self) -> bool {
        self.local_closed && self.remote_closed
    }

    /// Both ends are gone without any further handshake
    pub fn shut(&mut self) {
        self.local_closed = true;
        self.remote_closed = true;
    }
}

/// Work handed to a connection driver
#[derive(Debug)]
pub(crate) enum Command {
    Open,
    Close,
    Begin(u16),
    End(u16),
    Attach(u16, u32),
    Detach(u16, u32),
    Transfer {
        channel: u16,
        handle: u32,
        delivery: Delivery,
        message: Message,
    },
    Flow(u16, u32),
    Disposition {
        channel: u16,
        handle: u32,
        requeue: Option<Message>,
    },
    Remove,
    Peer(PeerAction),
}

/// Actions initiated by the scripted peer
#[derive(Debug)]
pub(crate) enum PeerAction {
    End(u16, Option<definitions::Error>),
    Detach(String, Option<definitions::Error>),
    Close(Option<definitions::Error>),
    Disconnect(String),
    GrantCredit(String, u32),
    Serve(String),
}

#[derive(Debug, Default)]
struct Script {
    disposition: Option<Disposition>,
    open_error: Option<definitions::Error>,
    refused: HashMap<String, definitions::Error>,
    fail_after_attach: HashMap<String, definitions::Error>,
    end_error: Option<definitions::Error>,
    detach_error: Option<definitions::Error>,
}

#[derive(Debug)]
pub(crate) struct PeerShared {
    responsive: AtomicBool,
    initial_credit: AtomicU32,
    script: Mutex<Script>,
    received: Mutex<HashMap<Performative, usize>>,
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    connections: Mutex<Vec<Weak<LoopbackConnection>>>,
}

/// Scripts the remote peer of a [`LoopbackEngine`]
#[derive(Debug, Clone)]
pub struct PeerHandle {
    shared: Arc<PeerShared>,
}

impl PeerHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(PeerShared {
                responsive: AtomicBool::new(true),
                initial_credit: AtomicU32::new(DEFAULT_INITIAL_CREDIT),
                script: Mutex::new(Script::default()),
                received: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// An unresponsive peer records every performative but never answers
    pub fn set_responsive(&self, responsive: bool) {
        self.shared.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Credit granted to sending links attached from now on
    pub fn set_initial_credit(&self, credit: u32) {
        self.shared.initial_credit.store(credit, Ordering::SeqCst);
    }

    /// How transfers are settled from now on
    pub fn set_disposition(&self, disposition: Disposition) {
        self.shared.script.lock().disposition = Some(disposition);
    }

    /// Answers the next open with a close carrying `error`
    pub fn refuse_open(&self, error: definitions::Error) {
        self.shared.script.lock().open_error = Some(error);
    }

    /// Refuses every attach to `address`: the peer detaches with `error`
    /// without ever attaching
    pub fn refuse_attach(&self, address: impl Into<String>, error: definitions::Error) {
        self.shared
            .script
            .lock()
            .refused
            .insert(address.into(), error);
    }

    /// Attaches to `address` and immediately detaches with `error`
    pub fn fail_after_attach(&self, address: impl Into<String>, error: definitions::Error) {
        self.shared
            .script
            .lock()
            .fail_after_attach
            .insert(address.into(), error);
    }

    /// Answers the next locally initiated end with `error`
    pub fn answer_end_with_error(&self, error: definitions::Error) {
        self.shared.script.lock().end_error = Some(error);
    }

    /// Answers the next locally initiated detach with `error`
    pub fn answer_detach_with_error(&self, error: definitions::Error) {
        self.shared.script.lock().detach_error = Some(error);
    }

    /// Ends the session on `channel` of every connection
    pub fn end_session(&self, channel: u16, error: Option<definitions::Error>) {
        self.broadcast(|| PeerAction::End(channel, error.clone()));
    }

    /// Detaches the link called `name`
    pub fn detach_link(&self, name: impl Into<String>, error: Option<definitions::Error>) {
        let name = name.into();
        self.broadcast(|| PeerAction::Detach(name.clone(), error.clone()));
    }

    /// Closes every connection
    pub fn close_connections(&self, error: Option<definitions::Error>) {
        self.broadcast(|| PeerAction::Close(error.clone()));
    }

    /// Drops the transport of every connection
    pub fn disconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.broadcast(|| PeerAction::Disconnect(reason.clone()));
    }

    /// Grants `credit` to the sending link called `name`
    pub fn grant_credit(&self, name: impl Into<String>, credit: u32) {
        let name = name.into();
        self.broadcast(|| PeerAction::GrantCredit(name.clone(), credit));
    }

    /// Queues `message` on `address` and serves it to an attached receiver
    pub fn deliver(&self, address: impl Into<String>, message: Message) {
        let address = address.into();
        self.shared
            .queues
            .lock()
            .entry(address.clone())
            .or_default()
            .push_back(message);
        self.broadcast(|| PeerAction::Serve(address.clone()));
    }

    /// Number of messages waiting on `address`
    pub fn queued(&self, address: &str) -> usize {
        self.shared
            .queues
            .lock()
            .get(address)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Number of `performative` frames received from the local side
    pub fn received(&self, performative: Performative) -> usize {
        self.shared
            .received
            .lock()
            .get(&performative)
            .copied()
            .unwrap_or(0)
    }

    fn broadcast(&self, action: impl Fn() -> PeerAction) {
        self.shared.broadcast(action)
    }
}

impl PeerShared {
    pub(crate) fn is_responsive(&self) -> bool {
        self.responsive.load(Ordering::SeqCst)
    }

    pub(crate) fn initial_credit(&self) -> u32 {
        self.initial_credit.load(Ordering::SeqCst)
    }

    pub(crate) fn record(&self, performative: Performative) {
        *self.received.lock().entry(performative).or_insert(0) += 1;
    }

    pub(crate) fn disposition(&self) -> Disposition {
        self.script
            .lock()
            .disposition
            .clone()
            .unwrap_or(Disposition::Accept)
    }

    pub(crate) fn refusal(&self, address: Option<&str>) -> Option<definitions::Error> {
        let address = address?;
        self.script.lock().refused.get(address).cloned()
    }

    pub(crate) fn failure_after_attach(&self, address: Option<&str>) -> Option<definitions::Error> {
        let address = address?;
        self.script.lock().fail_after_attach.get(address).cloned()
    }

    pub(crate) fn take_open_error(&self) -> Option<definitions::Error> {
        self.script.lock().open_error.take()
    }

    pub(crate) fn take_end_error(&self) -> Option<definitions::Error> {
        self.script.lock().end_error.take()
    }

    pub(crate) fn take_detach_error(&self) -> Option<definitions::Error> {
        self.script.lock().detach_error.take()
    }

    pub(crate) fn enqueue(&self, address: &str, message: Message) {
        self.queues
            .lock()
            .entry(address.to_string())
            .or_default()
            .push_back(message);
    }

    pub(crate) fn requeue(&self, address: &str, message: Message) {
        self.queues
            .lock()
            .entry(address.to_string())
            .or_default()
            .push_front(message);
    }

    pub(crate) fn dequeue(&self, address: &str) -> Option<Message> {
        self.queues.lock().get_mut(address)?.pop_front()
    }

    /// Lets every connection serve the receivers attached to `address`
    pub(crate) fn announce(&self, address: &str) {
        self.broadcast(|| PeerAction::Serve(address.to_string()))
    }

    fn broadcast(&self, action: impl Fn() -> PeerAction) {
        let connections: Vec<_> = {
            let mut connections = self.connections.lock();
            connections.retain(|c| c.strong_count() > 0);
            connections.iter().filter_map(Weak::upgrade).collect()
        };
        for connection in connections {
            connection.command(Command::Peer(action()));
        }
    }
}

impl Disposition {
    /// The delivery state reported for a transfer, `None` if it stays unsettled
    pub(crate) fn to_state(&self) -> Option<DeliveryState> {
        use fe2o3_amqp_types::messaging::{Accepted, Modified, Rejected, Released};

        let state = match self {
            Disposition::Accept => DeliveryState::Accepted(Accepted {}),
            Disposition::Reject(error) => DeliveryState::Rejected(Rejected {
                error: error.clone(),
            }),
            Disposition::Release => DeliveryState::Released(Released {}),
            Disposition::Modify {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => DeliveryState::Modified(Modified {
                delivery_failed: Some(*delivery_failed),
                undeliverable_here: Some(*undeliverable_here),
                message_annotations: message_annotations.clone(),
            }),
            Disposition::Hold => return None,
        };
        Some(state)
    }
}

/// An engine whose peer lives in the same process
#[derive(Debug)]
pub struct LoopbackEngine {
    events: Arc<EventEmitter<RawEventContext>>,
    peer: PeerHandle,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    /// Creates an engine with a responsive peer
    pub fn new() -> Self {
        Self {
            events: Arc::new(EventEmitter::new()),
            peer: PeerHandle::new(),
        }
    }

    /// The handle that scripts the peer
    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }
}

impl Engine for LoopbackEngine {
    fn create_connection(
        &self,
        container_id: &str,
        options: &ConnectionOptions,
    ) -> Arc<dyn RawConnection> {
        let connection = LoopbackConnection::spawn(
            container_id,
            options,
            self.events.clone(),
            self.peer.shared.clone(),
        );
        self.peer
            .shared
            .connections
            .lock()
            .push(Arc::downgrade(&connection));
        connection
    }

    fn events(&self) -> &EventEmitter<RawEventContext> {
        &self.events
    }
}
