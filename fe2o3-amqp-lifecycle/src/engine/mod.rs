//! The seam to the event driven AMQP 1.0 protocol engine.
//!
//! The engine owns the wire protocol (framing, SASL, flow control, session
//! multiplexing and link credit) and reports every state transition as a
//! discrete event on the [`EventEmitter`] of the affected object. The traits
//! in this module describe what the lifecycle layer consumes from an engine:
//!
//! - issuing calls (`open`, `begin`, `attach`, `close`, `send`, ...),
//! - subscription to a fixed per-object event vocabulary ([`EventName`]),
//! - state queries (`is_open`, `is_closed`, `is_remote_open`, `sendable`, ...).
//!
//! An engine also has an intrinsic propagation policy: an event emitted on a
//! link without any listener is dispatched on the session, then on the
//! connection, and an error that nobody handles ends up at the engine's own
//! top level [`Engine::events`]. [`loopback::LoopbackEngine`] is an in-memory
//! implementation that behaves like a broker.

use std::{fmt, sync::Arc};

use fe2o3_amqp_types::{
    definitions::{self, Fields, ReceiverSettleMode, SenderSettleMode},
    messaging::{AmqpValue, Body, DeliveryState},
};
use serde_amqp::Value;

use crate::{
    connection::ConnectionOptions,
    link::{ReceiverOptions, SenderOptions},
    session::SessionOptions,
};

pub mod emitter;
pub mod event;
pub mod loopback;

pub use emitter::{EventEmitter, Listener, ListenerId};
pub use event::EventName;

/// The message type carried by the engine
pub type Message = fe2o3_amqp_types::messaging::Message<Body<Value>>;

/// Role of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sending link
    Sender,

    /// Receiving link
    Receiver,
}

/// Error reported by the engine on an event
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// The peer (or the engine) closed an endpoint with an AMQP error
    #[error("Protocol error {:?}", .0)]
    Protocol(definitions::Error),

    /// The transport was lost
    #[error("Disconnected: {0}")]
    Disconnected(String),
}

impl From<definitions::Error> for EngineError {
    fn from(err: definitions::Error) -> Self {
        Self::Protocol(err)
    }
}

/// A snapshot of a delivery handed out by the engine
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery id, unique within the session
    pub id: u32,

    /// Delivery tag
    pub tag: Vec<u8>,

    /// Message format
    pub format: u32,

    /// Whether the delivery is settled
    pub settled: bool,

    /// The delivery state reported by the remote peer
    pub remote_state: Option<DeliveryState>,
}

/// The context the engine passes to every listener
#[derive(Debug, Clone)]
pub struct RawEventContext {
    /// Name of the event
    pub name: EventName,

    /// The connection the event belongs to
    pub connection: Arc<dyn RawConnection>,

    /// The session the event belongs to, if any
    pub session: Option<Arc<dyn RawSession>>,

    /// The sending link the event belongs to, if any
    pub sender: Option<Arc<dyn RawLink>>,

    /// The receiving link the event belongs to, if any
    pub receiver: Option<Arc<dyn RawLink>>,

    /// The delivery the event is about, if any
    pub delivery: Option<Delivery>,

    /// The received message, if any
    pub message: Option<Message>,

    /// The error carried by the event, if any
    pub error: Option<EngineError>,

    /// Whether the engine is going to reconnect after a disconnect
    pub reconnecting: Option<bool>,
}

impl RawEventContext {
    /// A context that only carries the connection
    pub fn new(name: EventName, connection: Arc<dyn RawConnection>) -> Self {
        Self {
            name,
            connection,
            session: None,
            sender: None,
            receiver: None,
            delivery: None,
            message: None,
            error: None,
            reconnecting: None,
        }
    }
}

/// Creates a message with a single amqp-value body section
pub fn value_message(value: impl Into<Value>) -> Message {
    Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: None,
        body: Body::Value(AmqpValue(value.into())),
        footer: None,
    }
}

/// An engine that creates connections
pub trait Engine: fmt::Debug + Send + Sync {
    /// Creates a connection that is not yet opened
    fn create_connection(
        &self,
        container_id: &str,
        options: &ConnectionOptions,
    ) -> Arc<dyn RawConnection>;

    /// Top level emitter that receives events nobody handled on a connection
    fn events(&self) -> &EventEmitter<RawEventContext>;
}

/// Operations shared by every engine object
pub trait RawEndpoint: fmt::Debug + Send + Sync {
    /// The emitter of this object
    fn events(&self) -> &EventEmitter<RawEventContext>;

    /// Both ends are open
    fn is_open(&self) -> bool;

    /// The remote end is open
    fn is_remote_open(&self) -> bool;

    /// Both ends are closed
    fn is_closed(&self) -> bool;

    /// The local end has been closed
    fn is_itself_closed(&self) -> bool;

    /// The error the remote peer closed this object with
    fn error(&self) -> Option<EngineError>;

    /// Starts the closing handshake.
    ///
    /// Implementations must not emit events from within this call.
    fn close(&self, error: Option<definitions::Error>);

    /// Forgets the object without any handshake
    fn remove(&self);
}

/// An engine connection
pub trait RawConnection: RawEndpoint {
    /// Container id used in the open frame
    fn container_id(&self) -> &str;

    /// Starts the opening handshake.
    ///
    /// Implementations must not emit events from within this call.
    fn open(&self);

    /// Allocates a session that is not yet begun
    fn create_session(&self, options: &SessionOptions) -> Arc<dyn RawSession>;

    /// Whether every channel up to the negotiated channel-max is in use
    fn is_session_max_reached(&self) -> bool;
}

/// An engine session
pub trait RawSession: RawEndpoint {
    /// The local channel
    fn local_channel(&self) -> u16;

    /// The remote channel, known once the remote begin is received
    fn remote_channel(&self) -> Option<u16>;

    /// Starts the begin handshake.
    ///
    /// Implementations must not emit events from within this call.
    fn begin(&self);

    /// Allocates a sending link that is not yet attached
    fn create_sender(&self, options: &SenderOptions) -> Arc<dyn RawLink>;

    /// Allocates a receiving link that is not yet attached
    fn create_receiver(&self, options: &ReceiverOptions) -> Arc<dyn RawLink>;
}

/// An engine link
pub trait RawLink: RawEndpoint {
    /// Link name
    fn name(&self) -> &str;

    /// Link role
    fn role(&self) -> Role;

    /// Target address of a sender or source address of a receiver
    fn address(&self) -> Option<&str>;

    /// Starts the attach handshake.
    ///
    /// Implementations must not emit events from within this call.
    fn attach(&self);

    /// Current link credit
    fn credit(&self) -> u32;

    /// Whether a message can be sent right away
    fn sendable(&self) -> bool;

    /// Hands a message to the engine and returns the delivery.
    ///
    /// Implementations must not emit events from within this call.
    fn send(
        &self,
        message: Message,
        tag: Option<Vec<u8>>,
        format: Option<u32>,
    ) -> Result<Delivery, EngineError>;

    /// Issues additional credit on a receiving link
    fn add_credit(&self, credit: u32);

    /// Sets the drain flag on a receiving link
    fn set_drain(&self, drain: bool);

    /// Whether the drain flag is set
    fn is_draining(&self) -> bool;

    /// Reports that a draining sender has used up its credit
    fn set_drained(&self, drained: bool);

    /// Updates the local state of a received delivery
    fn update_delivery(&self, delivery_id: u32, state: DeliveryState, settled: bool);

    /// Sender settle mode
    fn snd_settle_mode(&self) -> SenderSettleMode;

    /// Receiver settle mode
    fn rcv_settle_mode(&self) -> ReceiverSettleMode;

    /// Link properties
    fn properties(&self) -> Option<Fields>;
}
