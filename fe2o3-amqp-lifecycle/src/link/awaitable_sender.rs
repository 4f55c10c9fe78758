//! A sender whose sends resolve on the disposition of the delivery

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{Arc, Weak},
    time::Duration,
};

use fe2o3_amqp_types::messaging::DeliveryState;
use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    context::EventContext,
    engine::{Delivery, EventEmitter, EventName, Message, RawEventContext},
    entity::Entity,
    error::{
        CancellationError, ConfigError, Error, FailedOutcome, OperationTimeoutError,
        SendOperationFailedError,
    },
    util::{cancelled, check_aborted, disconnected, rejection, AbortSignal, TransientListeners},
};

use super::{
    delivery::{DeliveryFut, Outcome},
    Link, LinkCloseOptions, Sender,
};

/// Options of [`AwaitableSender::send`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Window the disposition has to arrive in. Defaults to the operation
    /// timeout of the connection.
    pub timeout: Option<Duration>,

    /// Cancels the wait for the disposition
    pub abort_signal: Option<AbortSignal>,

    /// Delivery tag. The engine picks one if not set.
    pub tag: Option<Vec<u8>>,

    /// Message format
    pub format: Option<u32>,
}

impl SendOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    pub fn tag(mut self, tag: impl Into<Vec<u8>>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn format(mut self, format: u32) -> Self {
        self.format = Some(format);
        self
    }
}

/* -------------------------------------------------------------------------- */
/*                                Delivery map                                */
/* -------------------------------------------------------------------------- */

#[derive(Debug)]
struct PendingDelivery {
    resolver: oneshot::Sender<Outcome>,
    timer: JoinHandle<()>,
}

/// Deliveries waiting for their disposition, by delivery id.
///
/// Every transition removes the entry first, so an outcome is delivered at
/// most once whichever of disposition, timer or link failure comes first.
#[derive(Debug, Default)]
struct DeliveryMap {
    entries: Mutex<HashMap<u32, PendingDelivery>>,
}

impl DeliveryMap {
    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// A disposition arrived
    fn settle(&self, delivery_id: u32, outcome: Outcome) -> bool {
        let entry = self.entries.lock().remove(&delivery_id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.resolver.send(outcome);
                true
            }
            None => false,
        }
    }

    /// The timer of the delivery fired
    fn expire(&self, delivery_id: u32, error: Error) {
        let entry = self.entries.lock().remove(&delivery_id);
        if let Some(entry) = entry {
            let _ = entry.resolver.send(Err(error));
        }
    }

    /// Rejects every pending delivery
    fn fail_all(&self, error: &Error) {
        let entries: Vec<_> = self.entries.lock().drain().collect();
        if entries.is_empty() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(count = entries.len(), error = ?error, "failing pending deliveries");
        #[cfg(feature = "log")]
        log::debug!("failing {} pending deliveries: {:?}", entries.len(), error);

        for (_, entry) in entries {
            entry.timer.abort();
            let _ = entry.resolver.send(Err(error.clone()));
        }
    }
}

fn outcome_of(name: EventName, delivery: &Delivery) -> Outcome {
    let failed = |outcome: FailedOutcome| -> Outcome {
        let error = match &delivery.remote_state {
            Some(DeliveryState::Rejected(rejected)) => rejected.error.clone(),
            _ => None,
        };
        Err(SendOperationFailedError {
            delivery_id: delivery.id,
            outcome,
            error,
        }
        .into())
    };
    match name {
        EventName::Rejected => failed(FailedOutcome::Rejected),
        EventName::Released => failed(FailedOutcome::Released),
        EventName::Modified => failed(FailedOutcome::Modified),
        _ => Ok(delivery.clone()),
    }
}

/// A listener that rejects every pending delivery with the error derived
/// from the event
fn fail_all_on(
    deliveries: Weak<DeliveryMap>,
    to_error: fn(&RawEventContext) -> Error,
) -> impl Fn(&RawEventContext) + Send + Sync + 'static {
    move |ctx| {
        if let Some(deliveries) = deliveries.upgrade() {
            deliveries.fail_all(&to_error(ctx));
        }
    }
}

async fn watchdog(
    deliveries: Weak<DeliveryMap>,
    delivery_id: u32,
    action: String,
    timeout: Duration,
    abort: Option<AbortSignal>,
) {
    let error: Error = tokio::select! {
        _ = tokio::time::sleep(timeout) => OperationTimeoutError { action, timeout }.into(),
        _ = cancelled(abort.as_ref()) => CancellationError { action }.into(),
    };
    if let Some(deliveries) = deliveries.upgrade() {
        deliveries.expire(delivery_id, error);
    }
}

/* -------------------------------------------------------------------------- */
/*                               AwaitableSender                              */
/* -------------------------------------------------------------------------- */

/// A [`Sender`] whose [`send`](AwaitableSender::send) resolves once the
/// receiver settles the delivery.
///
/// A pending send fails when its timeout elapses, when its abort signal
/// fires, or when the link, its session or the transport fails first.
#[derive(Debug, Clone)]
pub struct AwaitableSender {
    inner: Arc<AwaitableInner>,
}

#[derive(Debug)]
struct AwaitableInner {
    sender: Sender,
    deliveries: Arc<DeliveryMap>,
    listeners: Mutex<TransientListeners>,
}

impl Deref for AwaitableSender {
    type Target = Link;

    fn deref(&self) -> &Self::Target {
        &self.inner.sender
    }
}

impl Entity for AwaitableSender {
    fn events(&self) -> &EventEmitter<EventContext> {
        self.inner.sender.events()
    }
}

impl AwaitableSender {
    pub(crate) fn new(sender: Sender) -> Self {
        let deliveries = Arc::new(DeliveryMap::default());
        let mut listeners = TransientListeners::default();
        let link = sender.raw().clone();

        for name in [
            EventName::Accepted,
            EventName::Rejected,
            EventName::Released,
            EventName::Modified,
        ] {
            let map = Arc::downgrade(&deliveries);
            listeners.on(&link, name, move |ctx: &RawEventContext| {
                if let (Some(map), Some(delivery)) = (map.upgrade(), &ctx.delivery) {
                    map.settle(delivery.id, outcome_of(name, delivery));
                }
            });
        }

        let map = Arc::downgrade(&deliveries);
        listeners.on(
            &link,
            EventName::SenderError,
            fail_all_on(map.clone(), |ctx| rejection(ctx, "sender")),
        );
        listeners.on(
            &link,
            EventName::SenderClose,
            fail_all_on(map.clone(), |ctx| match &ctx.error {
                Some(error) => error.clone().into(),
                None => Error::Closed("The sender was closed".to_string()),
            }),
        );
        listeners.on(
            sender.session().raw(),
            EventName::SessionError,
            fail_all_on(map.clone(), |ctx| rejection(ctx, "session")),
        );
        listeners.on(
            sender.connection().raw(),
            EventName::Disconnected,
            fail_all_on(map, disconnected),
        );

        Self {
            inner: Arc::new(AwaitableInner {
                sender,
                deliveries,
                listeners: Mutex::new(listeners),
            }),
        }
    }

    /// The plain sender
    pub fn as_sender(&self) -> &Sender {
        &self.inner.sender
    }

    /// Whether a message can be sent right away
    pub fn sendable(&self) -> bool {
        self.inner.sender.sendable()
    }

    /// Number of sends still waiting for their disposition
    pub fn pending_deliveries(&self) -> usize {
        self.inner.deliveries.len()
    }

    /// Sends a message and waits for the receiver to settle it.
    ///
    /// The returned future resolves to the settled [`Delivery`] once the
    /// message is accepted, and fails with a [`SendOperationFailedError`] if
    /// it is rejected, released or modified. Without credit the future fails
    /// right away with an
    /// [`InsufficientCreditError`](crate::error::InsufficientCreditError). A
    /// pre-settled delivery resolves right away.
    pub fn send(&self, message: Message, options: SendOptions) -> DeliveryFut {
        match self.try_send(message, options) {
            Ok(fut) => fut,
            Err(err) => DeliveryFut::ready(Err(err)),
        }
    }

    fn try_send(&self, message: Message, options: SendOptions) -> Result<DeliveryFut, Error> {
        let SendOptions {
            timeout,
            abort_signal,
            tag,
            format,
        } = options;
        let timeout = match timeout {
            Some(timeout) if timeout.is_zero() => return Err(ConfigError::ZeroSendTimeout.into()),
            Some(timeout) => timeout,
            None => self.connection().operation_timeout(),
        };
        let action = format!("send a message on '{}'", self.name());
        check_aborted(abort_signal.as_ref(), &action)?;

        // The entry is in place before any disposition can be looked up
        let mut entries = self.inner.deliveries.entries.lock();
        let delivery = self.inner.sender.send(message, tag, format)?;
        if delivery.settled {
            return Ok(DeliveryFut::ready(Ok(delivery)));
        }

        let (resolver, outcome) = oneshot::channel();
        let timer = self.connection().runtime().spawn(watchdog(
            Arc::downgrade(&self.inner.deliveries),
            delivery.id,
            action,
            timeout,
            abort_signal,
        ));
        entries.insert(delivery.id, PendingDelivery { resolver, timer });
        Ok(DeliveryFut::new(delivery.id, outcome))
    }

    /// Detaches the sender, and its session unless
    /// [`LinkCloseOptions::close_session`] is `false`.
    ///
    /// Sends still pending fail once the sender is detached.
    pub async fn close(&self, options: LinkCloseOptions) -> Result<(), Error> {
        let result = self.inner.sender.close(options).await;
        if !self.is_open() {
            self.inner.listeners.lock().clear();
            self.inner.deliveries.fail_all(&Error::Closed(format!(
                "The sender '{}' was closed",
                self.name()
            )));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fe2o3_amqp_types::definitions::{self, AmqpError, SenderSettleMode};
    use tokio_test::{assert_err, assert_ok};

    use crate::{
        connection::{Connection, ConnectionOptions},
        engine::{
            loopback::{Disposition, LoopbackEngine},
            value_message, Engine, EventName, RawEndpoint, RawSession,
        },
        error::{ConfigError, Error, FailedOutcome},
        link::{LinkCloseOptions, SenderOptions},
        util::AbortSignal,
    };

    use super::{AwaitableSender, SendOptions};

    async fn awaitable_sender(engine: &LoopbackEngine, options: SenderOptions) -> AwaitableSender {
        let connection_options = ConnectionOptions::default();
        let raw = engine.create_connection("container", &connection_options);
        let connection = Connection::new(raw, connection_options).unwrap();
        connection.open(None).await.unwrap();
        connection
            .create_awaitable_sender(options, None)
            .await
            .unwrap()
    }

    fn error(condition: AmqpError) -> definitions::Error {
        definitions::Error {
            condition: condition.into(),
            description: None,
            info: None,
        }
    }

    #[tokio::test]
    async fn accepted_send_resolves_settled() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;

        let fut = sender.send(value_message("hello"), SendOptions::default());
        assert!(fut.delivery_id().is_some());
        assert_eq!(sender.pending_deliveries(), 1);

        let delivery = assert_ok!(fut.await);
        assert!(delivery.settled);
        assert_eq!(sender.pending_deliveries(), 0);
        assert_eq!(engine.peer().queued("q1"), 1);
    }

    #[tokio::test]
    async fn presettled_send_resolves_right_away() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(
            &engine,
            SenderOptions::default()
                .address("q1")
                .snd_settle_mode(SenderSettleMode::Settled),
        )
        .await;
        let delivery = assert_ok!(sender.send(value_message("hello"), SendOptions::default()).await);
        assert!(delivery.settled);
        assert_eq!(sender.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn insufficient_credit_leaves_no_entry() {
        let engine = LoopbackEngine::new();
        engine.peer().set_initial_credit(0);
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        assert!(!sender.sendable());

        let err = assert_err!(sender.send(value_message("hello"), SendOptions::default()).await);
        assert!(matches!(err, Error::InsufficientCredit(_)));
        assert_eq!(sender.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn rejected_send_carries_the_error() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        let rejection = error(AmqpError::PreconditionFailed);
        engine
            .peer()
            .set_disposition(Disposition::Reject(Some(rejection.clone())));

        let err = assert_err!(sender.send(value_message("hello"), SendOptions::default()).await);
        match err {
            Error::SendOperationFailed(err) => {
                assert_eq!(err.outcome, FailedOutcome::Rejected);
                assert_eq!(err.error, Some(rejection));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(engine.peer().queued("q1"), 0);
    }

    #[tokio::test]
    async fn released_send_fails() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        engine.peer().set_disposition(Disposition::Release);

        let err = assert_err!(sender.send(value_message("hello"), SendOptions::default()).await);
        match err {
            Error::SendOperationFailed(err) => {
                assert_eq!(err.outcome, FailedOutcome::Released);
                assert!(err.error.is_none());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unsettled_send_times_out() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        engine.peer().set_disposition(Disposition::Hold);

        let options = SendOptions::default().timeout(Duration::from_secs(3));
        let err = assert_err!(sender.send(value_message("hello"), options).await);
        assert!(err.is_timeout());
        assert_eq!(sender.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        let options = SendOptions::default().timeout(Duration::ZERO);
        let err = assert_err!(sender.send(value_message("hello"), options).await);
        assert!(matches!(err, Error::Config(ConfigError::ZeroSendTimeout)));
    }

    #[tokio::test]
    async fn cancelled_send_removes_the_entry() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        engine.peer().set_disposition(Disposition::Hold);

        let signal = AbortSignal::new();
        let fut = sender.send(
            value_message("hello"),
            SendOptions::default().abort_signal(signal.clone()),
        );
        assert_eq!(sender.pending_deliveries(), 1);
        signal.cancel();
        let err = assert_err!(fut.await);
        assert!(err.is_cancelled());
        assert_eq!(sender.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn link_failure_rejects_every_pending_send() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        engine.peer().set_disposition(Disposition::Hold);

        let first = sender.send(value_message("one"), SendOptions::default());
        let second = sender.send(value_message("two"), SendOptions::default());
        assert_eq!(sender.pending_deliveries(), 2);

        let detach = error(AmqpError::InternalError);
        engine
            .peer()
            .detach_link(sender.name().to_string(), Some(detach.clone()));

        for fut in [first, second] {
            match assert_err!(fut.await) {
                Error::Protocol(e) => assert_eq!(e, detach),
                other => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!(sender.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn session_end_rejects_every_pending_send() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        engine.peer().set_disposition(Disposition::Hold);

        let first = sender.send(value_message("one"), SendOptions::default());
        let second = sender.send(value_message("two"), SendOptions::default());
        assert_eq!(sender.pending_deliveries(), 2);

        let end = error(AmqpError::InternalError);
        engine
            .peer()
            .end_session(sender.session().raw().local_channel(), Some(end.clone()));

        for fut in [first, second] {
            match assert_err!(fut.await) {
                Error::Protocol(e) => assert_eq!(e, end),
                other => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!(sender.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn disconnect_rejects_every_pending_send() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        engine.peer().set_disposition(Disposition::Hold);

        let first = sender.send(value_message("one"), SendOptions::default());
        let second = sender.send(value_message("two"), SendOptions::default());
        engine.peer().disconnect("connection reset by peer");

        for fut in [first, second] {
            let err = assert_err!(fut.await);
            assert!(matches!(err, Error::Disconnected(_)));
        }
        assert_eq!(sender.pending_deliveries(), 0);
    }

    #[tokio::test]
    async fn close_removes_the_correlation_listeners() {
        let engine = LoopbackEngine::new();
        let sender = awaitable_sender(&engine, SenderOptions::default().address("q1")).await;
        assert_eq!(sender.raw().events().listener_count(EventName::Accepted), 2);

        let options = LinkCloseOptions::default().close_session(false);
        assert_ok!(sender.close(options).await);
        assert_eq!(sender.raw().events().listener_count(EventName::Accepted), 0);
    }
}
