//! Container

use std::sync::Arc;

use crate::{
    connection::{Connection, ConnectionOptions},
    engine::Engine,
    error::Error,
    util::{generate_id, AbortSignal},
};

/// An AMQP container: an identity plus the engine that creates its
/// connections
#[derive(Debug, Clone)]
pub struct Container {
    id: String,
    engine: Arc<dyn Engine>,
}

impl Container {
    /// Creates a container with the given id
    pub fn new(id: impl Into<String>, engine: Arc<dyn Engine>) -> Self {
        Self {
            id: id.into(),
            engine,
        }
    }

    /// Creates a container with a generated id
    pub fn with_engine(engine: Arc<dyn Engine>) -> Self {
        Self::new(generate_id("container"), engine)
    }

    /// The container id sent in the open frame of every connection
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The engine connections are created with
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Creates a connection without opening it
    pub fn create_connection(&self, options: ConnectionOptions) -> Result<Connection, Error> {
        let raw = self.engine.create_connection(&self.id, &options);
        let connection = Connection::new(raw, options)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(container = %self.id, connection = %connection.id(), "created connection");
        #[cfg(feature = "log")]
        log::debug!("container {} created connection {}", self.id, connection.id());

        Ok(connection)
    }

    /// Creates a connection and opens it
    pub async fn connect(
        &self,
        options: ConnectionOptions,
        abort: Option<&AbortSignal>,
    ) -> Result<Connection, Error> {
        let connection = self.create_connection(options)?;
        connection.open(abort).await?;
        Ok(connection)
    }
}
