//! Translation of engine event contexts

use crate::{
    connection::Connection,
    engine::{Delivery, EngineError, EventName, Message, RawEventContext, Role},
    link::{Link, Receiver, Sender},
    session::Session,
};

/// The context passed to listeners registered on a wrapper.
///
/// It carries the same payload as the engine's context with the engine
/// objects replaced by the wrappers of this crate.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Name of the event
    pub name: EventName,

    /// The connection the event belongs to
    pub connection: Connection,

    /// Set when the event was emitted by a session or a link
    pub session: Option<Session>,

    /// Set when the event was emitted by a sending link
    pub sender: Option<Sender>,

    /// Set when the event was emitted by a receiving link
    pub receiver: Option<Receiver>,

    /// The delivery the event is about, if any
    pub delivery: Option<Delivery>,

    /// The received message, if any
    pub message: Option<Message>,

    /// The error carried by the event, if any
    pub error: Option<EngineError>,

    /// Whether the engine is going to reconnect after a disconnect
    pub reconnecting: Option<bool>,
}

/// The wrapper that re-emits an event
#[derive(Debug, Clone, Copy)]
pub(crate) enum Emitter<'a> {
    Connection(&'a Connection),
    Session(&'a Session),
    Link(&'a Link),
}

impl EventContext {
    pub(crate) fn translate(raw: &RawEventContext, emitter: Emitter<'_>) -> Self {
        let (connection, session, sender, receiver) = match emitter {
            Emitter::Connection(connection) => (connection.clone(), None, None, None),
            Emitter::Session(session) => {
                (session.connection().clone(), Some(session.clone()), None, None)
            }
            Emitter::Link(link) => {
                // Only a context that carries a link of the emitter's role is
                // attributed to the emitter
                let sender = match (link.role(), &raw.sender) {
                    (Role::Sender, Some(_)) => Some(Sender::from(link.clone())),
                    _ => None,
                };
                let receiver = match (link.role(), &raw.receiver) {
                    (Role::Receiver, Some(_)) => Some(Receiver::from(link.clone())),
                    _ => None,
                };
                (
                    link.connection().clone(),
                    Some(link.session().clone()),
                    sender,
                    receiver,
                )
            }
        };

        Self {
            name: raw.name,
            connection,
            session,
            sender,
            receiver,
            delivery: raw.delivery.clone(),
            message: raw.message.clone(),
            error: raw.error.clone(),
            reconnecting: raw.reconnecting,
        }
    }
}
