//! Connection wrapper

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use fe2o3_amqp_types::definitions::{self, AmqpError};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::{
    context::{Emitter, EventContext},
    dispatcher::Dispatcher,
    engine::{EngineError, EventEmitter, EventName, RawConnection, RawEventContext},
    entity::{self, Entity, EntityCore, Forward},
    error::{ConfigError, Error},
    link::{AwaitableSender, Receiver, ReceiverOptions, Sender, SenderOptions},
    request_response::RequestResponseLink,
    session::{Session, SessionInner, SessionOptions},
    util::{check_aborted, disconnected, rejection, AbortSignal, Operation},
};

mod builder;
pub use builder::*;

/// A connection to an AMQP 1.0 peer.
///
/// `Connection` is a cheap handle; clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    options: ConnectionOptions,
    raw: Arc<dyn RawConnection>,
    core: EntityCore,
    dispatcher: Dispatcher,
    runtime: Handle,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
}

impl Forward for ConnectionInner {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn translate(inner: &Arc<Self>, raw: &RawEventContext) -> EventContext {
        let connection = Connection {
            inner: inner.clone(),
        };
        EventContext::translate(raw, Emitter::Connection(&connection))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("container_id", &self.container_id())
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl Entity for Connection {
    fn events(&self) -> &EventEmitter<EventContext> {
        &self.inner.core.events
    }
}

impl Connection {
    /// Wraps an engine connection.
    ///
    /// Must be called within a Tokio runtime, which later runs the
    /// connection's background work.
    pub fn new(
        raw: Arc<dyn RawConnection>,
        options: ConnectionOptions,
    ) -> Result<Self, ConfigError> {
        let runtime = Handle::try_current().map_err(|_| ConfigError::MissingRuntime)?;
        let dispatcher = Dispatcher::new(&runtime);
        let inner = Arc::new(ConnectionInner {
            options,
            raw,
            core: EntityCore::new(),
            dispatcher,
            runtime,
            sessions: Mutex::new(Vec::new()),
        });

        // Sessions and links that are not wrapped (or no longer) would
        // otherwise propagate their errors to the engine's top level
        entity::subscribe(&inner, &*inner.raw, EventName::CONNECTION);
        entity::subscribe(&inner, &*inner.raw, EventName::SESSION_ERROR_AND_CLOSE);
        entity::subscribe(&inner, &*inner.raw, EventName::LINK_ERROR_AND_CLOSE);

        Ok(Self { inner })
    }

    /* ---------------------------------- State --------------------------------- */

    /// The connection id
    pub fn id(&self) -> &str {
        &self.inner.options.connection_id
    }

    /// The container id sent in the open frame
    pub fn container_id(&self) -> &str {
        self.inner.raw.container_id()
    }

    /// Options the connection was created with
    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Window every create and close operation has to settle in
    pub fn operation_timeout(&self) -> Duration {
        self.inner.options.operation_timeout
    }

    /// The wrapped engine connection
    pub fn raw(&self) -> &Arc<dyn RawConnection> {
        &self.inner.raw
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Both ends are open
    pub fn is_open(&self) -> bool {
        self.inner.raw.is_open()
    }

    /// The remote end is open
    pub fn is_remote_open(&self) -> bool {
        self.inner.raw.is_remote_open()
    }

    /// Both ends are closed
    pub fn is_closed(&self) -> bool {
        self.inner.raw.is_closed()
    }

    /// The local end has been closed
    pub fn was_close_initiated(&self) -> bool {
        self.inner.raw.is_itself_closed()
    }

    /// The error the peer closed the connection with
    pub fn error(&self) -> Option<EngineError> {
        self.inner.raw.error()
    }

    /// Whether every channel is in use
    pub fn is_session_max_reached(&self) -> bool {
        self.inner.raw.is_session_max_reached()
    }

    /* ---------------------------------- Open ---------------------------------- */

    /// Opens the connection.
    ///
    /// Resolves once the peer's open is received. Resolves right away if the
    /// connection is already open.
    pub async fn open(&self, abort: Option<&AbortSignal>) -> Result<(), Error> {
        if self.is_open() {
            return Ok(());
        }

        let raw = &self.inner.raw;
        let mut op = Operation::new(
            format!("open the connection '{}'", self.id()),
            self.operation_timeout(),
            abort,
            &self.inner.core.pending,
        );
        op.resolve_on(raw, EventName::ConnectionOpen);
        op.reject_on(raw, EventName::ConnectionClose, |ctx| {
            rejection(ctx, "connection")
        });
        op.reject_on(raw, EventName::Disconnected, disconnected);

        let result = op.run(|| raw.open()).await;
        if let Err(err) = &result {
            if err.is_cancelled() || err.is_timeout() {
                self.abandon();
            }
        }
        result
    }

    /// Closes a connection that was handed to nobody
    fn abandon(&self) {
        if self.is_open() {
            let connection = self.clone();
            self.inner.runtime.spawn(async move {
                if let Err(_err) = connection.close(None).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(id = %connection.id(), error = ?_err, "failed to close abandoned connection");
                    #[cfg(feature = "log")]
                    log::warn!(
                        "failed to close abandoned connection {}: {:?}",
                        connection.id(),
                        _err
                    );
                }
            });
        } else {
            self.inner.raw.close(None);
        }
    }

    /* ---------------------------------- Close --------------------------------- */

    /// Closes the connection.
    ///
    /// Resolves right away, without sending a close, if the connection is
    /// not open. The forwarding of engine events stops once the close
    /// completes.
    pub async fn close(&self, abort: Option<&AbortSignal>) -> Result<(), Error> {
        if !self.is_open() {
            return Ok(());
        }

        let raw = &self.inner.raw;
        let mut op = Operation::new(
            format!("close the connection '{}'", self.id()),
            self.operation_timeout(),
            abort,
            &self.inner.core.pending,
        );
        op.resolve_on(raw, EventName::ConnectionClose);
        op.reject_on(raw, EventName::ConnectionError, |ctx| {
            rejection(ctx, "connection")
        });
        op.reject_on(raw, EventName::Disconnected, disconnected);

        op.run(|| raw.close(None)).await?;
        entity::unsubscribe(&self.inner.core, &**raw);
        Ok(())
    }

    /// Stops forwarding engine events and drops the connection without the
    /// closing handshake
    pub fn remove(&self) {
        self.remove_all_sessions();
        entity::unsubscribe(&self.inner.core, &*self.inner.raw);
        self.inner.raw.remove();
    }

    /// Removes every session of this connection
    pub fn remove_all_sessions(&self) {
        let sessions: Vec<_> = std::mem::take(&mut *self.inner.sessions.lock());
        for session in sessions.iter().filter_map(Weak::upgrade) {
            Session::from_inner(session).remove();
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub(crate) fn forget_session(&self, session: &Arc<SessionInner>) {
        self.inner
            .sessions
            .lock()
            .retain(|s| s.strong_count() > 0 && !std::ptr::eq(s.as_ptr(), Arc::as_ptr(session)));
    }

    /* --------------------------------- Session -------------------------------- */

    /// Begins a session with the default options
    pub async fn create_session(&self, abort: Option<&AbortSignal>) -> Result<Session, Error> {
        self.create_session_with(SessionOptions::default(), abort)
            .await
    }

    /// Begins a session
    pub async fn create_session_with(
        &self,
        options: SessionOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<Session, Error> {
        check_aborted(abort, &format!("create a session on '{}'", self.id()))?;
        if self.is_session_max_reached() {
            return Err(Error::Protocol(definitions::Error {
                condition: AmqpError::ResourceLimitExceeded.into(),
                description: Some(format!(
                    "Connection '{}' has no free channel left",
                    self.id()
                )),
                info: None,
            }));
        }

        let raw = self.inner.raw.create_session(&options);
        let session = Session::wrap(self.clone(), raw, options);
        {
            let mut sessions = self.inner.sessions.lock();
            sessions.retain(|s| s.strong_count() > 0);
            sessions.push(Arc::downgrade(&session.inner));
        }
        if let Err(err) = session.begin(abort).await {
            self.forget_session(&session.inner);
            return Err(err);
        }
        Ok(session)
    }

    /* ---------------------------------- Links --------------------------------- */

    /// Creates a sender on a new session
    pub async fn create_sender(
        &self,
        options: SenderOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<Sender, Error> {
        let session = self.create_session(abort).await?;
        match session.create_sender(options, abort).await {
            Ok(sender) => Ok(sender),
            Err(err) => {
                session.abandon();
                Err(err)
            }
        }
    }

    /// Creates an [`AwaitableSender`] on a new session
    pub async fn create_awaitable_sender(
        &self,
        options: SenderOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<AwaitableSender, Error> {
        let session = self.create_session(abort).await?;
        match session.create_awaitable_sender(options, abort).await {
            Ok(sender) => Ok(sender),
            Err(err) => {
                session.abandon();
                Err(err)
            }
        }
    }

    /// Creates a receiver on a new session
    pub async fn create_receiver(
        &self,
        options: ReceiverOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<Receiver, Error> {
        let session = self.create_session(abort).await?;
        match session.create_receiver(options, abort).await {
            Ok(receiver) => Ok(receiver),
            Err(err) => {
                session.abandon();
                Err(err)
            }
        }
    }

    /// Creates a sender and a receiver concurrently on a new session
    pub async fn create_request_response_link(
        &self,
        sender_options: SenderOptions,
        receiver_options: ReceiverOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<RequestResponseLink, Error> {
        RequestResponseLink::create(self, sender_options, receiver_options, abort).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        engine::{
            loopback::{LoopbackEngine, Performative},
            Engine, EventName, RawEndpoint,
        },
        entity::Entity,
        error::ConfigError,
    };

    use super::{Connection, ConnectionOptions};

    #[test]
    fn requires_a_runtime() {
        let engine = LoopbackEngine::new();
        let options = ConnectionOptions::default();
        let raw = engine.create_connection("container", &options);
        let err = Connection::new(raw, options).unwrap_err();
        assert_eq!(err, ConfigError::MissingRuntime);
    }

    #[tokio::test]
    async fn open_and_close() {
        let engine = LoopbackEngine::new();
        let options = ConnectionOptions::builder()
            .connection_id("c1")
            .build()
            .unwrap();
        let raw = engine.create_connection("container", &options);
        let connection = Connection::new(raw.clone(), options).unwrap();
        assert_eq!(connection.id(), "c1");
        assert_eq!(connection.container_id(), "container");

        connection.open(None).await.unwrap();
        assert!(connection.is_open());
        assert!(connection.is_remote_open());

        connection.close(None).await.unwrap();
        assert!(!connection.is_open());
        assert!(connection.is_closed());
        assert!(connection.was_close_initiated());

        // Forwarders are gone, transient listeners never stay
        assert_eq!(raw.events().listener_count(EventName::ConnectionOpen), 0);
        assert_eq!(raw.events().listener_count(EventName::ConnectionClose), 0);
        assert_eq!(engine.peer().received(Performative::Close), 1);
    }

    #[tokio::test]
    async fn wrapper_keeps_one_forwarder_per_event() {
        let engine = LoopbackEngine::new();
        let options = ConnectionOptions::default();
        let raw = engine.create_connection("container", &options);
        let connection = Connection::new(raw.clone(), options).unwrap();
        connection.open(None).await.unwrap();

        for name in EventName::CONNECTION {
            assert_eq!(raw.events().listener_count(*name), 1, "{}", name);
        }
        assert_eq!(raw.events().listener_count(EventName::SessionError), 1);
        assert_eq!(raw.events().listener_count(EventName::SenderError), 1);
        assert_eq!(connection.listener_count(EventName::ConnectionOpen), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_dropped_sessions_are_not_tracked() {
        let engine = LoopbackEngine::new();
        let options = ConnectionOptions::builder()
            .operation_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let raw = engine.create_connection("container", &options);
        let connection = Connection::new(raw, options).unwrap();
        connection.open(None).await.unwrap();

        drop(connection.create_session(None).await.unwrap());
        engine.peer().set_responsive(false);
        let err = connection.create_session(None).await.unwrap_err();
        assert!(err.is_timeout());
        engine.peer().set_responsive(true);

        let _kept = connection.create_session(None).await.unwrap();
        assert_eq!(connection.tracked_sessions(), 1);
    }
}
