//! Session wrapper

use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    connection::Connection,
    context::{Emitter, EventContext},
    dispatcher::Dispatcher,
    engine::{EngineError, EventEmitter, EventName, RawEventContext, RawSession},
    entity::{self, Entity, EntityCore, Forward},
    error::Error,
    link::{
        AwaitableSender, Link, LinkInner, Receiver, ReceiverOptions, Sender, SenderOptions,
    },
    util::{disconnected, rejection, AbortSignal, Operation},
};

/// Default incoming_window and outgoing_window
pub const DEFAULT_WINDOW: u32 = 2048;

/// Options of a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Incoming window announced in the begin frame
    pub incoming_window: u32,

    /// Outgoing window announced in the begin frame
    pub outgoing_window: u32,

    /// Highest link handle that can be used
    pub handle_max: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            handle_max: u32::MAX,
        }
    }
}

impl SessionOptions {
    pub fn incoming_window(mut self, value: u32) -> Self {
        self.incoming_window = value;
        self
    }

    pub fn outgoing_window(mut self, value: u32) -> Self {
        self.outgoing_window = value;
        self
    }

    pub fn handle_max(mut self, value: u32) -> Self {
        self.handle_max = value;
        self
    }
}

/// A session on a [`Connection`].
///
/// `Session` is a cheap handle; clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    connection: Connection,
    raw: Arc<dyn RawSession>,
    options: SessionOptions,
    core: EntityCore,
    links: Mutex<Vec<Weak<LinkInner>>>,
}

impl Forward for SessionInner {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn dispatcher(&self) -> &Dispatcher {
        self.connection.dispatcher()
    }

    fn translate(inner: &Arc<Self>, raw: &RawEventContext) -> EventContext {
        let session = Session {
            inner: inner.clone(),
        };
        EventContext::translate(raw, Emitter::Session(&session))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl Entity for Session {
    fn events(&self) -> &EventEmitter<EventContext> {
        &self.inner.core.events
    }
}

impl Session {
    /// Wraps an engine session and starts forwarding its events
    pub(crate) fn wrap(
        connection: Connection,
        raw: Arc<dyn RawSession>,
        options: SessionOptions,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            connection,
            raw,
            options,
            core: EntityCore::new(),
            links: Mutex::new(Vec::new()),
        });
        entity::subscribe(&inner, &*inner.raw, EventName::SESSION);
        entity::subscribe(&inner, &*inner.raw, EventName::LINK_ERROR_AND_CLOSE);
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /* ---------------------------------- State --------------------------------- */

    /// `<connection-id>-<local-channel>-<remote-channel>`.
    ///
    /// The remote channel reads `pending` until the peer's begin arrives.
    pub fn id(&self) -> String {
        match self.inner.raw.remote_channel() {
            Some(remote) => format!(
                "{}-{}-{}",
                self.inner.connection.id(),
                self.inner.raw.local_channel(),
                remote
            ),
            None => format!(
                "{}-{}-pending",
                self.inner.connection.id(),
                self.inner.raw.local_channel()
            ),
        }
    }

    /// The connection this session belongs to
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Options the session was created with
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    /// The wrapped engine session
    pub fn raw(&self) -> &Arc<dyn RawSession> {
        &self.inner.raw
    }

    /// Both ends are open and so is the connection
    pub fn is_open(&self) -> bool {
        self.inner.connection.is_open() && self.inner.raw.is_open()
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
    pub fn is_itself_closed(&self) -> bool {
        self.inner.raw.is_itself_closed()
    }

    /// The error the peer ended the session with
    pub fn error(&self) -> Option<EngineError> {
        self.inner.raw.error()
    }

    /* ---------------------------------- Begin --------------------------------- */

    pub(crate) async fn begin(&self, abort: Option<&AbortSignal>) -> Result<(), Error> {
        let raw = &self.inner.raw;
        let mut op = Operation::new(
            format!("begin a session on '{}'", self.inner.connection.id()),
            self.inner.connection.operation_timeout(),
            abort,
            &self.inner.core.pending,
        );
        op.resolve_on(raw, EventName::SessionOpen);
        op.reject_on(raw, EventName::SessionClose, |ctx| rejection(ctx, "session"));
        op.reject_on(
            self.inner.connection.raw(),
            EventName::Disconnected,
            disconnected,
        );

        let result = op.run(|| raw.begin()).await;
        if let Err(err) = &result {
            if err.is_cancelled() || err.is_timeout() {
                self.abandon();
            }
        }
        result
    }

    /// Closes a session that was handed to nobody
    pub(crate) fn abandon(&self) {
        if self.is_open() {
            let session = self.clone();
            self.inner.connection.runtime().spawn(async move {
                if let Err(_err) = session.close(None).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(id = %session.id(), error = ?_err, "failed to close abandoned session");
                    #[cfg(feature = "log")]
                    log::warn!(
                        "failed to close abandoned session {}: {:?}",
                        session.id(),
                        _err
                    );
                }
            });
        } else {
            self.inner.raw.close(None);
        }
    }

    /* ---------------------------------- Close --------------------------------- */

    /// Ends the session.
    ///
    /// Resolves right away, without sending an end, if the session is not
    /// open. Rejects with the error the peer ends the session with.
    pub async fn close(&self, abort: Option<&AbortSignal>) -> Result<(), Error> {
        if !self.is_open() {
            return Ok(());
        }

        let raw = &self.inner.raw;
        let mut op = Operation::new(
            format!("end the session '{}'", self.id()),
            self.inner.connection.operation_timeout(),
            abort,
            &self.inner.core.pending,
        );
        op.resolve_on(raw, EventName::SessionClose);
        op.reject_on(raw, EventName::SessionError, |ctx| rejection(ctx, "session"));
        op.reject_on(
            self.inner.connection.raw(),
            EventName::Disconnected,
            disconnected,
        );

        op.run(|| raw.close(None)).await?;
        entity::unsubscribe(&self.inner.core, &**raw);
        self.inner.connection.forget_session(&self.inner);
        Ok(())
    }

    /// Stops forwarding engine events and forgets the session without the
    /// closing handshake
    pub fn remove(&self) {
        let links: Vec<_> = std::mem::take(&mut *self.inner.links.lock());
        for link in links.iter().filter_map(Weak::upgrade) {
            Link::from_inner(link).remove();
        }
        entity::unsubscribe(&self.inner.core, &*self.inner.raw);
        self.inner.raw.remove();
        self.inner.connection.forget_session(&self.inner);
    }

    pub(crate) fn forget_link(&self, link: &Arc<LinkInner>) {
        self.inner
            .links
            .lock()
            .retain(|l| l.strong_count() > 0 && !std::ptr::eq(l.as_ptr(), Arc::as_ptr(link)));
    }

    /* ---------------------------------- Links --------------------------------- */

    /// Attaches a sending link
    pub async fn create_sender(
        &self,
        options: SenderOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<Sender, Error> {
        let raw = self.inner.raw.create_sender(&options);
        let link = self.track(Link::wrap(self.clone(), raw));
        if let Err(err) = link.attach(abort).await {
            self.forget_link(&link.inner);
            return Err(err);
        }
        Ok(Sender::from(link))
    }

    /// Attaches a receiving link
    pub async fn create_receiver(
        &self,
        options: ReceiverOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<Receiver, Error> {
        let raw = self.inner.raw.create_receiver(&options);
        let link = self.track(Link::wrap(self.clone(), raw));
        if let Err(err) = link.attach(abort).await {
            self.forget_link(&link.inner);
            return Err(err);
        }
        Ok(Receiver::from(link))
    }

    /// Attaches a sending link whose sends resolve on the disposition
    pub async fn create_awaitable_sender(
        &self,
        options: SenderOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<AwaitableSender, Error> {
        let sender = self.create_sender(options, abort).await?;
        Ok(AwaitableSender::new(sender))
    }

    fn track(&self, link: Link) -> Link {
        let mut links = self.inner.links.lock();
        links.retain(|l| l.strong_count() > 0);
        links.push(Arc::downgrade(&link.inner));
        drop(links);
        link
    }

    #[cfg(test)]
    pub(crate) fn tracked_links(&self) -> usize {
        self.inner.links.lock().len()
    }
}
