//! Re-emission of engine events on the wrappers

mod common;

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};

use fe2o3_amqp_lifecycle::{
    engine::{value_message, EventName, RawEndpoint, RawSession},
    link::{ReceiverOptions, SenderOptions},
    Entity,
};
use fe2o3_amqp_types::definitions::AmqpError;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn link_error_during_attach_reaches_listeners_after_the_attach_settled() {
    let (engine, connection) = common::connect().await;
    let session = connection.create_session(None).await.unwrap();
    let error = common::amqp_error(AmqpError::InternalError, "detached right away");
    engine.peer().fail_after_attach("q1", error);

    // The peer attaches, then detaches with an error before the attach
    // has been handed to the caller
    let sender = session
        .create_sender(SenderOptions::default().address("q1"), None)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    sender.on(EventName::SenderError, move |ctx| {
        let _ = tx.send(ctx.error.clone());
    });

    let error = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("the deferred error was never emitted")
        .unwrap();
    assert!(error.is_some());
    assert!(!sender.is_open());
}

#[tokio::test]
async fn link_errors_never_reach_the_session_or_the_connection() {
    let (engine, connection) = common::connect().await;
    let unhandled = common::count_unhandled(
        &engine,
        &[
            EventName::Error,
            EventName::SenderError,
            EventName::SenderClose,
            EventName::SessionError,
        ],
    );

    let escalated = Arc::new(AtomicUsize::new(0));
    for name in [EventName::Error, EventName::SenderError] {
        let escalated = escalated.clone();
        connection.on(name, move |_| {
            escalated.fetch_add(1, Ordering::SeqCst);
        });
    }
    let session = connection.create_session(None).await.unwrap();
    {
        let escalated = escalated.clone();
        session.on(EventName::SenderError, move |_| {
            escalated.fetch_add(1, Ordering::SeqCst);
        });
    }

    let sender = session
        .create_sender(SenderOptions::default().address("q1"), None)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    sender.on(EventName::SenderError, move |ctx| {
        let _ = tx.send(ctx.sender.as_ref().map(|s| s.name().to_string()));
    });

    engine.peer().detach_link(
        sender.name().to_string(),
        Some(common::amqp_error(AmqpError::InternalError, "gone")),
    );
    let name = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(name.as_deref(), Some(sender.name()));

    assert_eq!(escalated.load(Ordering::SeqCst), 0);
    assert_eq!(unhandled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_errors_stay_on_the_session() {
    let (engine, connection) = common::connect().await;
    let unhandled = common::count_unhandled(&engine, &[EventName::Error, EventName::SessionError]);
    let escalated = Arc::new(AtomicUsize::new(0));
    {
        let escalated = escalated.clone();
        connection.on(EventName::SessionError, move |_| {
            escalated.fetch_add(1, Ordering::SeqCst);
        });
    }

    let session = connection.create_session(None).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on(EventName::SessionError, move |ctx| {
        let _ = tx.send((ctx.session.is_some(), ctx.sender.is_some()));
    });

    engine.peer().end_session(
        session.raw().local_channel(),
        Some(common::amqp_error(AmqpError::InternalError, "ended")),
    );
    let (has_session, has_sender) = tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(has_session);
    assert!(!has_sender);
    assert!(session.error().is_some());
    assert!(!session.is_open());

    assert_eq!(escalated.load(Ordering::SeqCst), 0);
    assert_eq!(unhandled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn received_messages_carry_the_receiver() {
    let (engine, connection) = common::connect().await;
    let receiver = connection
        .create_receiver(ReceiverOptions::default().address("q1"), None)
        .await
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver.on(EventName::Message, move |ctx| {
        let _ = tx.send((
            ctx.receiver.as_ref().map(|r| r.name().to_string()),
            ctx.sender.is_some(),
            ctx.delivery.clone(),
        ));
    });

    engine
        .peer()
        .deliver("q1", value_message("hello"));
    let (name, has_sender, delivery) = tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name.as_deref(), Some(receiver.name()));
    assert!(!has_sender);
    assert!(delivery.is_some());
}

#[tokio::test]
async fn disconnect_is_reported_on_the_connection() {
    let (engine, connection) = common::connect().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.on(EventName::Disconnected, move |ctx| {
        let _ = tx.send((ctx.reconnecting, ctx.error.clone()));
    });

    engine.peer().disconnect("connection reset by peer");
    let (reconnecting, error) = tokio::time::timeout(WAIT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reconnecting, Some(false));
    assert!(error.is_some());
}

#[tokio::test]
async fn removed_wrappers_stop_forwarding() {
    let (_engine, connection) = common::connect().await;
    let session = connection.create_session(None).await.unwrap();
    let sender = session
        .create_sender(SenderOptions::default().address("q1"), None)
        .await
        .unwrap();
    let raw = sender.raw().clone();
    assert_eq!(raw.events().listener_count(EventName::SenderError), 1);

    sender.remove();
    assert_eq!(raw.events().listener_count(EventName::SenderError), 0);
    assert!(!sender.is_open());

    session.remove();
    assert_eq!(
        session.raw().events().listener_count(EventName::SessionOpen),
        0
    );
}
