#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Awaitable lifecycle coordination for an event driven AMQP 1.0 protocol
//! engine.
//!
//! The protocol engine (see [`engine`]) reports every state transition as an
//! event. This crate wraps its connections, sessions and links so that
//! opening, beginning, attaching, detaching, ending and closing can be
//! awaited with a timeout and an optional [`AbortSignal`].
//!
//! Every wrapper subscribes to the whole event vocabulary of the object it
//! wraps and re-emits the events, translated into an [`EventContext`], on
//! itself. An error on a link therefore stays on that link and is never
//! propagated to its session, its connection or a generic error handler.
//! Error events are held back while a create or close operation of the same
//! entity is in flight, so the caller awaiting the operation always sees the
//! failure first.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fe2o3_amqp_lifecycle::{
//!     engine::{loopback::LoopbackEngine, value_message},
//!     link::{LinkCloseOptions, SendOptions, SenderOptions},
//!     Container, ConnectionOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fe2o3_amqp_lifecycle::Error> {
//!     let container = Container::new("example", Arc::new(LoopbackEngine::new()));
//!     let connection = container.connect(ConnectionOptions::default(), None).await?;
//!
//!     let session = connection.create_session(None).await?;
//!     let sender = session
//!         .create_awaitable_sender(SenderOptions::default().address("q1"), None)
//!         .await?;
//!     let delivery = sender
//!         .send(value_message("hello"), SendOptions::default())
//!         .await?;
//!     assert!(delivery.settled);
//!
//!     sender.close(LinkCloseOptions::default()).await?;
//!     connection.close(None).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! ```toml
//! default = []
//! ```
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `"tracing"` | enables logging with `tracing` |
//! | `"log"` | enables logging with `log` |

pub mod connection;
pub mod container;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod link;
pub mod request_response;
pub mod session;

mod dispatcher;
mod util;

pub use connection::{Connection, ConnectionOptions};
pub use container::Container;
pub use context::EventContext;
pub use entity::Entity;
pub use error::{
    CancellationError, ConfigError, Error, FailedOutcome, InsufficientCreditError,
    OperationTimeoutError, SendOperationFailedError,
};
pub use link::{AwaitableSender, Link, Receiver, Sender};
pub use request_response::RequestResponseLink;
pub use session::{Session, SessionOptions};
pub use util::AbortSignal;
