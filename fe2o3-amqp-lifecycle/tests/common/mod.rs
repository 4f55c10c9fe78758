//! Shared setup of the integration tests

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use fe2o3_amqp_lifecycle::{
    engine::{loopback::LoopbackEngine, Engine, EventName},
    Connection, ConnectionOptions, Container,
};
use fe2o3_amqp_types::definitions::{self, AmqpError};

/// Operation timeout of the connections created by [`connect`]
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

pub fn options() -> ConnectionOptions {
    ConnectionOptions::builder()
        .operation_timeout(OPERATION_TIMEOUT)
        .build()
        .unwrap()
}

/// A loopback engine and an open connection to its peer
pub async fn connect() -> (Arc<LoopbackEngine>, Connection) {
    let engine = Arc::new(LoopbackEngine::new());
    let container = Container::new("test-container", engine.clone());
    let connection = container.connect(options(), None).await.unwrap();
    (engine, connection)
}

pub fn amqp_error(condition: AmqpError, description: &str) -> definitions::Error {
    definitions::Error {
        condition: condition.into(),
        description: Some(description.to_string()),
        info: None,
    }
}

/// Counts the events nobody handled on the engine's top level emitter
pub fn count_unhandled(engine: &LoopbackEngine, names: &[EventName]) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    for name in names {
        let hits = hits.clone();
        engine.events().on(*name, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    hits
}
