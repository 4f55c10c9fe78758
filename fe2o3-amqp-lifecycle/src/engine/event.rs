//! Event vocabulary of the protocol engine

use std::fmt;

/// Name of an event emitted by the protocol engine.
///
/// The wrappers in this crate re-emit every event under the same name, so the
/// same vocabulary is used on both sides of the seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /* ------------------------------- Connection ------------------------------- */
    /// The remote peer opened the connection
    ConnectionOpen,

    /// The remote peer closed the connection
    ConnectionClose,

    /// The remote peer closed the connection with an error
    ConnectionError,

    /// The engine detected a protocol violation
    ProtocolError,

    /// Generic error that reached the top level
    Error,

    /// The underlying transport was lost
    Disconnected,

    /* --------------------------------- Session -------------------------------- */
    /// The remote peer began the session
    SessionOpen,

    /// The remote peer ended the session
    SessionClose,

    /// The remote peer ended the session with an error
    SessionError,

    /* --------------------------------- Sender --------------------------------- */
    /// The remote peer attached the sending link
    SenderOpen,

    /// The remote peer detached the sending link
    SenderClose,

    /// The remote peer detached the sending link with an error
    SenderError,

    /// The receiver asked the sender to use up its credit
    SenderDraining,

    /// A flow frame was received for the sending link
    SenderFlow,

    /// The sending link has credit
    Sendable,

    /// A delivery was accepted
    Accepted,

    /// A delivery was rejected
    Rejected,

    /// A delivery was released
    Released,

    /// A delivery was modified
    Modified,

    /* -------------------------------- Receiver -------------------------------- */
    /// The remote peer attached the receiving link
    ReceiverOpen,

    /// The remote peer detached the receiving link
    ReceiverClose,

    /// The remote peer detached the receiving link with an error
    ReceiverError,

    /// The sender used up all credit after a drain request
    ReceiverDrained,

    /// A flow frame was received for the receiving link
    ReceiverFlow,

    /// A message arrived on the receiving link
    Message,

    /* --------------------------------- Shared --------------------------------- */
    /// A delivery was settled by the remote peer
    Settled,
}

impl EventName {
    /// Events emitted by a connection
    pub const CONNECTION: &'static [EventName] = &[
        EventName::ConnectionOpen,
        EventName::ConnectionClose,
        EventName::ConnectionError,
        EventName::ProtocolError,
        EventName::Error,
        EventName::Disconnected,
        EventName::Settled,
    ];

    /// Events emitted by a session
    pub const SESSION: &'static [EventName] = &[
        EventName::SessionOpen,
        EventName::SessionClose,
        EventName::SessionError,
        EventName::Settled,
    ];

    /// Events emitted by a sending link
    pub const SENDER: &'static [EventName] = &[
        EventName::Sendable,
        EventName::SenderOpen,
        EventName::SenderDraining,
        EventName::SenderFlow,
        EventName::SenderError,
        EventName::SenderClose,
        EventName::Accepted,
        EventName::Released,
        EventName::Rejected,
        EventName::Modified,
        EventName::Settled,
    ];

    /// Events emitted by a receiving link
    pub const RECEIVER: &'static [EventName] = &[
        EventName::Message,
        EventName::ReceiverOpen,
        EventName::ReceiverDrained,
        EventName::ReceiverFlow,
        EventName::ReceiverError,
        EventName::ReceiverClose,
        EventName::Settled,
    ];

    /// Session error and close events that the engine propagates to the
    /// connection when they are not handled on the session
    pub const SESSION_ERROR_AND_CLOSE: &'static [EventName] =
        &[EventName::SessionError, EventName::SessionClose];

    /// Link error and close events that the engine propagates to the session
    /// when they are not handled on the link
    pub const LINK_ERROR_AND_CLOSE: &'static [EventName] = &[
        EventName::SenderError,
        EventName::SenderClose,
        EventName::ReceiverError,
        EventName::ReceiverClose,
    ];

    /// The wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::ConnectionOpen => "connection_open",
            EventName::ConnectionClose => "connection_close",
            EventName::ConnectionError => "connection_error",
            EventName::ProtocolError => "protocol_error",
            EventName::Error => "error",
            EventName::Disconnected => "disconnected",
            EventName::SessionOpen => "session_open",
            EventName::SessionClose => "session_close",
            EventName::SessionError => "session_error",
            EventName::SenderOpen => "sender_open",
            EventName::SenderClose => "sender_close",
            EventName::SenderError => "sender_error",
            EventName::SenderDraining => "sender_draining",
            EventName::SenderFlow => "sender_flow",
            EventName::Sendable => "sendable",
            EventName::Accepted => "accepted",
            EventName::Rejected => "rejected",
            EventName::Released => "released",
            EventName::Modified => "modified",
            EventName::ReceiverOpen => "receiver_open",
            EventName::ReceiverClose => "receiver_close",
            EventName::ReceiverError => "receiver_error",
            EventName::ReceiverDrained => "receiver_drained",
            EventName::ReceiverFlow => "receiver_flow",
            EventName::Message => "message",
            EventName::Settled => "settled",
        }
    }

    /// Whether the event reports an error.
    ///
    /// Error-shaped events are the ones whose re-emission is held back while a
    /// create or close operation is pending on the emitting entity.
    pub fn is_error(&self) -> bool {
        self.as_str().contains("error")
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::EventName;

    #[test]
    fn error_shaped_names() {
        let errors: Vec<_> = EventName::CONNECTION
            .iter()
            .chain(EventName::SESSION)
            .chain(EventName::SENDER)
            .chain(EventName::RECEIVER)
            .filter(|name| name.is_error())
            .collect();

        assert_eq!(
            errors,
            vec![
                &EventName::ConnectionError,
                &EventName::ProtocolError,
                &EventName::Error,
                &EventName::SessionError,
                &EventName::SenderError,
                &EventName::ReceiverError,
            ]
        );
        assert!(!EventName::Disconnected.is_error());
        assert!(!EventName::SenderClose.is_error());
    }

    #[test]
    fn display_uses_wire_name() {
        assert_eq!(EventName::SenderDraining.to_string(), "sender_draining");
        assert_eq!(EventName::Settled.to_string(), "settled");
    }
}
