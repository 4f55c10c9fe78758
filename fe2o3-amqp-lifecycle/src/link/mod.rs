//! Links: the shared [`Link`] base, [`Sender`], [`Receiver`] and
//! [`AwaitableSender`]

use std::{fmt, sync::Arc};

use fe2o3_amqp_types::definitions::{Fields, ReceiverSettleMode, SenderSettleMode};

use crate::{
    connection::Connection,
    context::{Emitter, EventContext},
    dispatcher::Dispatcher,
    engine::{EngineError, EventEmitter, EventName, RawEventContext, RawLink, Role},
    entity::{self, Entity, EntityCore, Forward},
    error::Error,
    session::Session,
    util::{disconnected, generate_id, rejection, AbortSignal, Operation},
};

mod awaitable_sender;
mod delivery;
mod receiver;
mod sender;

pub use awaitable_sender::{AwaitableSender, SendOptions};
pub use delivery::DeliveryFut;
pub use receiver::Receiver;
pub use sender::Sender;

/// Default credit window of a receiver
pub const DEFAULT_CREDIT_WINDOW: u32 = 500;

/* -------------------------------------------------------------------------- */
/*                                   Options                                  */
/* -------------------------------------------------------------------------- */

/// Options of a sending link
#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Link name. A unique name is generated if not set.
    pub name: String,

    /// Target address
    pub address: Option<String>,

    /// Settlement policy of the sender
    pub snd_settle_mode: SenderSettleMode,

    /// Settlement policy of the receiver
    pub rcv_settle_mode: ReceiverSettleMode,

    /// Link properties
    pub properties: Option<Fields>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            name: generate_id("sender"),
            address: None,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            properties: None,
        }
    }
}

impl SenderOptions {
    /// Set the link name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the target address
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn snd_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.snd_settle_mode = mode;
        self
    }

    pub fn rcv_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.rcv_settle_mode = mode;
        self
    }

    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Options of a receiving link
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Link name. A unique name is generated if not set.
    pub name: String,

    /// Source address
    pub address: Option<String>,

    /// Settlement policy of the sender
    pub snd_settle_mode: SenderSettleMode,

    /// Settlement policy of the receiver
    pub rcv_settle_mode: ReceiverSettleMode,

    /// Link properties
    pub properties: Option<Fields>,

    /// Credit kept available to the sender. Zero disables automatic credit
    /// and [`Receiver::add_credit`] has to be used instead.
    pub credit_window: u32,

    /// Accept every received message right away
    pub auto_accept: bool,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            name: generate_id("receiver"),
            address: None,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            properties: None,
            credit_window: DEFAULT_CREDIT_WINDOW,
            auto_accept: true,
        }
    }
}

impl ReceiverOptions {
    /// Set the link name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the source address
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn snd_settle_mode(mut self, mode: SenderSettleMode) -> Self {
        self.snd_settle_mode = mode;
        self
    }

    pub fn rcv_settle_mode(mut self, mode: ReceiverSettleMode) -> Self {
        self.rcv_settle_mode = mode;
        self
    }

    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn credit_window(mut self, credit_window: u32) -> Self {
        self.credit_window = credit_window;
        self
    }

    pub fn auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }
}

/// Options of [`Link::close`]
#[derive(Debug, Clone)]
pub struct LinkCloseOptions {
    /// Also end the session the link is on. Defaults to `true`.
    pub close_session: bool,

    /// Cancels the close
    pub abort_signal: Option<AbortSignal>,
}

impl Default for LinkCloseOptions {
    fn default() -> Self {
        Self {
            close_session: true,
            abort_signal: None,
        }
    }
}

impl LinkCloseOptions {
    pub fn close_session(mut self, close_session: bool) -> Self {
        self.close_session = close_session;
        self
    }

    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }
}

/* -------------------------------------------------------------------------- */
/*                                    Link                                    */
/* -------------------------------------------------------------------------- */

/// What senders and receivers have in common.
///
/// `Link` is a cheap handle; clones refer to the same link.
#[derive(Clone)]
pub struct Link {
    pub(crate) inner: Arc<LinkInner>,
}

pub(crate) struct LinkInner {
    session: Session,
    raw: Arc<dyn RawLink>,
    core: EntityCore,
}

impl Forward for LinkInner {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn dispatcher(&self) -> &Dispatcher {
        self.session.connection().dispatcher()
    }

    fn translate(inner: &Arc<Self>, raw: &RawEventContext) -> EventContext {
        let link = Link {
            inner: inner.clone(),
        };
        EventContext::translate(raw, Emitter::Link(&link))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name())
            .field("role", &self.role())
            .field("address", &self.address())
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl Entity for Link {
    fn events(&self) -> &EventEmitter<EventContext> {
        &self.inner.core.events
    }
}

/// Event names of one link role
struct RoleEvents {
    open: EventName,
    close: EventName,
    error: EventName,
    what: &'static str,
}

impl RoleEvents {
    fn of(role: Role) -> Self {
        match role {
            Role::Sender => Self {
                open: EventName::SenderOpen,
                close: EventName::SenderClose,
                error: EventName::SenderError,
                what: "sender",
            },
            Role::Receiver => Self {
                open: EventName::ReceiverOpen,
                close: EventName::ReceiverClose,
                error: EventName::ReceiverError,
                what: "receiver",
            },
        }
    }
}

impl Link {
    /// Wraps an engine link and starts forwarding its events
    pub(crate) fn wrap(session: Session, raw: Arc<dyn RawLink>) -> Self {
        let inner = Arc::new(LinkInner {
            session,
            raw,
            core: EntityCore::new(),
        });
        let names = match inner.raw.role() {
            Role::Sender => EventName::SENDER,
            Role::Receiver => EventName::RECEIVER,
        };
        entity::subscribe(&inner, &*inner.raw, names);
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<LinkInner>) -> Self {
        Self { inner }
    }

    /* ---------------------------------- State --------------------------------- */

    /// Link name
    pub fn name(&self) -> &str {
        self.inner.raw.name()
    }

    /// Target address of a sender or source address of a receiver
    pub fn address(&self) -> Option<&str> {
        self.inner.raw.address()
    }

    pub fn role(&self) -> Role {
        self.inner.raw.role()
    }

    /// Current link credit
    pub fn credit(&self) -> u32 {
        self.inner.raw.credit()
    }

    pub fn snd_settle_mode(&self) -> SenderSettleMode {
        self.inner.raw.snd_settle_mode()
    }

    pub fn rcv_settle_mode(&self) -> ReceiverSettleMode {
        self.inner.raw.rcv_settle_mode()
    }

    pub fn properties(&self) -> Option<Fields> {
        self.inner.raw.properties()
    }

    /// The session the link is on
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// The connection the link is on
    pub fn connection(&self) -> &Connection {
        self.inner.session.connection()
    }

    /// The wrapped engine link
    pub fn raw(&self) -> &Arc<dyn RawLink> {
        &self.inner.raw
    }

    /// Both ends are attached and the session is open
    pub fn is_open(&self) -> bool {
        self.inner.session.is_open() && self.inner.raw.is_open()
    }

    /// The remote end is attached
    pub fn is_remote_open(&self) -> bool {
        self.inner.raw.is_remote_open()
    }

    /// Both ends are detached
    pub fn is_closed(&self) -> bool {
        self.inner.raw.is_closed()
    }

    /// The local end has been detached
    pub fn is_itself_closed(&self) -> bool {
        self.inner.raw.is_itself_closed()
    }

    /// The error the peer detached the link with
    pub fn error(&self) -> Option<EngineError> {
        self.inner.raw.error()
    }

    /* --------------------------------- Attach --------------------------------- */

    pub(crate) async fn attach(&self, abort: Option<&AbortSignal>) -> Result<(), Error> {
        let raw = &self.inner.raw;
        let events = RoleEvents::of(self.role());
        let what = events.what;
        let mut op = Operation::new(
            format!("attach the {} '{}'", what, self.name()),
            self.connection().operation_timeout(),
            abort,
            &self.inner.core.pending,
        );
        op.resolve_on(raw, events.open);
        op.reject_on(raw, events.close, move |ctx| rejection(ctx, what));
        op.reject_on(self.connection().raw(), EventName::Disconnected, disconnected);

        let result = op.run(|| raw.attach()).await;
        if let Err(err) = &result {
            if err.is_cancelled() || err.is_timeout() {
                self.abandon();
            }
        }
        result
    }

    /// Detaches a link that was handed to nobody
    fn abandon(&self) {
        if self.is_open() {
            let link = self.clone();
            self.connection().runtime().spawn(async move {
                if let Err(_err) = link.detach(None).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(name = %link.name(), error = ?_err, "failed to close abandoned link");
                    #[cfg(feature = "log")]
                    log::warn!(
                        "failed to close abandoned link {}: {:?}",
                        link.name(),
                        _err
                    );
                }
            });
        } else {
            self.inner.raw.close(None);
        }
    }

    /* ---------------------------------- Close --------------------------------- */

    /// Detaches the link, then ends its session unless
    /// [`LinkCloseOptions::close_session`] is `false`.
    ///
    /// The session is ended even if the detach fails, in which case the
    /// detach error is returned.
    pub async fn close(&self, options: LinkCloseOptions) -> Result<(), Error> {
        let abort = options.abort_signal.as_ref();
        let result = self.detach(abort).await;
        if !options.close_session {
            return result;
        }
        let session_result = self.inner.session.close(abort).await;
        result.and(session_result)
    }

    /// Detaches the link only. Resolves right away if the link is not open.
    pub(crate) async fn detach(&self, abort: Option<&AbortSignal>) -> Result<(), Error> {
        if !self.is_open() {
            return Ok(());
        }

        let raw = &self.inner.raw;
        let events = RoleEvents::of(self.role());
        let what = events.what;
        let mut op = Operation::new(
            format!("detach the {} '{}'", what, self.name()),
            self.connection().operation_timeout(),
            abort,
            &self.inner.core.pending,
        );
        op.resolve_on(raw, events.close);
        op.reject_on(raw, events.error, move |ctx| rejection(ctx, what));
        op.reject_on(self.connection().raw(), EventName::Disconnected, disconnected);

        op.run(|| raw.close(None)).await?;
        entity::unsubscribe(&self.inner.core, &**raw);
        self.inner.session.forget_link(&self.inner);
        Ok(())
    }

    /// Stops forwarding engine events and forgets the link without the
    /// detach handshake
    pub fn remove(&self) {
        entity::unsubscribe(&self.inner.core, &*self.inner.raw);
        self.inner.raw.remove();
        self.inner.session.forget_link(&self.inner);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fe2o3_amqp_types::definitions::{self, AmqpError};
    use tokio_test::{assert_err, assert_ok};

    use crate::{
        connection::{Connection, ConnectionOptions},
        engine::{
            loopback::{LoopbackEngine, Performative},
            Engine, EventName, RawEndpoint, Role,
        },
        error::Error,
        util::AbortSignal,
    };

    use super::{LinkCloseOptions, ReceiverOptions, SenderOptions};

    async fn open_connection(engine: &LoopbackEngine) -> Connection {
        let options = ConnectionOptions::builder()
            .operation_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let raw = engine.create_connection("container", &options);
        let connection = Connection::new(raw, options).unwrap();
        connection.open(None).await.unwrap();
        connection
    }

    #[test]
    fn generated_names_are_unique() {
        let a = SenderOptions::default();
        let b = SenderOptions::default();
        assert_ne!(a.name, b.name);
        assert!(ReceiverOptions::default().name.starts_with("receiver-"));
        assert_eq!(ReceiverOptions::default().credit_window, 500);
    }

    #[tokio::test]
    async fn attach_and_close_with_session() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let sender = connection
            .create_sender(SenderOptions::default().name("s1").address("q1"), None)
            .await
            .unwrap();
        assert_eq!(sender.name(), "s1");
        assert_eq!(sender.address(), Some("q1"));
        assert_eq!(sender.role(), Role::Sender);
        assert!(sender.is_open());
        let session = sender.session().clone();

        assert_ok!(sender.close(LinkCloseOptions::default()).await);
        assert!(!sender.is_open());
        assert!(sender.is_closed());
        assert!(!session.is_open());
        assert_eq!(engine.peer().received(Performative::Detach), 1);
        assert_eq!(engine.peer().received(Performative::End), 1);
        assert_eq!(
            sender.raw().events().listener_count(EventName::SenderClose),
            0
        );
    }

    #[tokio::test]
    async fn close_can_keep_the_session() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let session = connection.create_session(None).await.unwrap();
        let receiver = session
            .create_receiver(ReceiverOptions::default().address("q1"), None)
            .await
            .unwrap();

        let options = LinkCloseOptions::default().close_session(false);
        assert_ok!(receiver.close(options).await);
        assert!(!receiver.is_open());
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn refused_attach_rejects_with_the_peer_error() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let session = connection.create_session(None).await.unwrap();
        let error = definitions::Error {
            condition: AmqpError::NotFound.into(),
            description: Some("no such node".to_string()),
            info: None,
        };
        engine.peer().refuse_attach("missing", error.clone());

        let err = assert_err!(
            session
                .create_sender(SenderOptions::default().address("missing"), None)
                .await
        );
        match err {
            Error::Protocol(e) => assert_eq!(e, error),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn detach_error_rejects_close_but_session_is_ended() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let sender = connection
            .create_sender(SenderOptions::default().address("q1"), None)
            .await
            .unwrap();
        let error = definitions::Error {
            condition: AmqpError::InternalError.into(),
            description: None,
            info: None,
        };
        engine.peer().answer_detach_with_error(error.clone());

        let err = assert_err!(sender.close(LinkCloseOptions::default()).await);
        assert_eq!(err.condition(), Some(&error.condition));
        assert!(!sender.session().is_open());
    }

    #[tokio::test]
    async fn pre_aborted_close_leaves_the_link_attached() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let sender = connection
            .create_sender(SenderOptions::default().address("q1"), None)
            .await
            .unwrap();
        let signal = AbortSignal::new();
        signal.cancel();

        let options = LinkCloseOptions::default().abort_signal(signal);
        let err = assert_err!(sender.close(options).await);
        assert!(err.is_cancelled());
        assert!(sender.is_open());
        assert!(sender.raw().is_remote_open());
        assert_eq!(engine.peer().received(Performative::Detach), 0);
    }
}
