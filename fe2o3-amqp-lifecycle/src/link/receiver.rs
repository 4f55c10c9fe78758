//! Receiving link

use std::ops::Deref;

use fe2o3_amqp_types::{
    definitions,
    messaging::{Accepted, DeliveryState, Modified, Rejected, Released},
};

use crate::{
    context::EventContext,
    engine::{Delivery, EventEmitter, EventName},
    entity::Entity,
    error::Error,
    util::{disconnected, rejection, AbortSignal, Operation},
};

use super::Link;

/// A receiving link.
///
/// Received messages are reported through the `message` event. Dereferences
/// to [`Link`] for the state and lifecycle shared with senders.
#[derive(Debug, Clone)]
pub struct Receiver {
    link: Link,
}

impl From<Link> for Receiver {
    fn from(link: Link) -> Self {
        Self { link }
    }
}

impl Deref for Receiver {
    type Target = Link;

    fn deref(&self) -> &Self::Target {
        &self.link
    }
}

impl Entity for Receiver {
    fn events(&self) -> &EventEmitter<EventContext> {
        self.link.events()
    }
}

impl Receiver {
    /* --------------------------------- Credit --------------------------------- */

    /// Issues additional credit to the sender
    pub fn add_credit(&self, credit: u32) {
        self.link.raw().add_credit(credit)
    }

    /// Asks the sender to use up or discard the current credit, without
    /// waiting for it to do so
    pub fn drain_credit(&self) {
        self.link.raw().set_drain(true)
    }

    pub fn set_drain(&self, drain: bool) {
        self.link.raw().set_drain(drain)
    }

    pub fn is_draining(&self) -> bool {
        self.link.raw().is_draining()
    }

    /// Asks the sender to use up or discard the current credit and resolves
    /// once it reports the link drained
    pub async fn drain(&self, abort: Option<&AbortSignal>) -> Result<(), Error> {
        let raw = self.link.raw();
        // Not a create or close, so error events are not held back meanwhile
        let mut op = Operation::uncounted(
            format!("drain the receiver '{}'", self.name()),
            self.connection().operation_timeout(),
            abort,
        );
        op.resolve_on(raw, EventName::ReceiverDrained);
        op.reject_on(raw, EventName::ReceiverClose, |ctx| {
            rejection(ctx, "receiver")
        });
        op.reject_on(self.connection().raw(), EventName::Disconnected, disconnected);
        op.run(|| raw.set_drain(true)).await
    }

    /* ------------------------------- Disposition ------------------------------ */

    /// Accepts and settles a received delivery
    pub fn accept(&self, delivery: &Delivery) {
        self.settle(delivery, DeliveryState::Accepted(Accepted {}))
    }

    /// Rejects and settles a received delivery
    pub fn reject(&self, delivery: &Delivery, error: Option<definitions::Error>) {
        self.settle(delivery, DeliveryState::Rejected(Rejected { error }))
    }

    /// Releases a received delivery so that it can be redelivered
    pub fn release(&self, delivery: &Delivery) {
        self.settle(delivery, DeliveryState::Released(Released {}))
    }

    /// Settles a received delivery as modified
    pub fn modify(&self, delivery: &Delivery, modified: Modified) {
        self.settle(delivery, DeliveryState::Modified(modified))
    }

    fn settle(&self, delivery: &Delivery, state: DeliveryState) {
        if delivery.settled {
            return;
        }
        self.link.raw().update_delivery(delivery.id, state, true)
    }

    /// The underlying link
    pub fn into_link(self) -> Link {
        self.link
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::{
        connection::{Connection, ConnectionOptions},
        engine::{
            loopback::LoopbackEngine, value_message, Engine, EventName, RawEndpoint,
            RawEventContext,
        },
        entity::Entity,
        link::ReceiverOptions,
    };

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

    #[tokio::test]
    async fn queued_messages_are_received() {
        let engine = LoopbackEngine::new();
        engine.peer().deliver("q1", value_message("hello"));
        let connection = open_connection(&engine).await;
        let session = connection.create_session(None).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = session
            .create_receiver(ReceiverOptions::default().address("q1"), None)
            .await
            .unwrap();
        receiver.on(EventName::Message, move |ctx| {
            let _ = tx.send(ctx.message.clone());
        });

        engine.peer().deliver("q1", value_message("world"));
        let message = rx.recv().await.unwrap();
        assert!(message.is_some());
        assert_eq!(engine.peer().queued("q1"), 0);
    }

    #[tokio::test]
    async fn released_messages_go_back_to_the_queue() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let session = connection.create_session(None).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = session
            .create_receiver(
                ReceiverOptions::default()
                    .address("q2")
                    .auto_accept(false)
                    .credit_window(0),
                None,
            )
            .await
            .unwrap();
        receiver.on(EventName::Message, move |ctx| {
            let _ = tx.send(ctx.delivery.clone());
        });

        engine.peer().deliver("q2", value_message("hello"));
        receiver.add_credit(1);
        let delivery = rx.recv().await.unwrap().unwrap();
        assert_eq!(receiver.credit(), 0);

        receiver.release(&delivery);
        receiver.drain(None).await.unwrap();
        assert_eq!(engine.peer().queued("q2"), 1);
    }

    #[tokio::test]
    async fn drain_resolves_once_drained() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let session = connection.create_session(None).await.unwrap();
        let receiver = session
            .create_receiver(ReceiverOptions::default().address("q3"), None)
            .await
            .unwrap();
        assert_eq!(receiver.credit(), 500);

        receiver.drain(None).await.unwrap();
        assert_eq!(receiver.credit(), 0);
        assert!(!receiver.is_draining());
    }

    #[tokio::test]
    async fn pending_drain_does_not_hold_back_errors() {
        let engine = LoopbackEngine::new();
        let connection = open_connection(&engine).await;
        let session = connection.create_session(None).await.unwrap();
        let receiver = session
            .create_receiver(ReceiverOptions::default().address("q4"), None)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.on(EventName::ReceiverError, move |_| {
            let _ = tx.send(());
        });

        let mut drain = tokio_test::task::spawn(receiver.drain(None));
        tokio_test::assert_pending!(drain.poll());

        let mut context =
            RawEventContext::new(EventName::ReceiverError, connection.raw().clone());
        context.session = Some(session.raw().clone());
        context.receiver = Some(receiver.raw().clone());
        receiver.raw().events().emit(EventName::ReceiverError, &context);

        assert!(rx.try_recv().is_ok());
        tokio_test::assert_pending!(drain.poll());
    }
}
