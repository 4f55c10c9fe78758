//! Builder for [`ConnectionOptions`]

use std::time::Duration;

use fe2o3_amqp_types::definitions::Fields;

use crate::{error::ConfigError, util::generate_id};

/// Default window an awaited transition has to happen in
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default max-frame-size
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024;

/// Minimum max-frame-size allowed by the protocol
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Default channel-max
pub const DEFAULT_CHANNEL_MAX: u16 = 255;

/// Default AMQP port
pub const DEFAULT_PORT: u16 = 5672;

/// Options of a connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Identifies the connection in logs and in session ids
    pub connection_id: String,

    /// Host to connect to
    pub hostname: String,

    /// Port to connect to
    pub port: u16,

    /// Window every create and close operation has to settle in
    pub operation_timeout: Duration,

    /// Largest frame the local side accepts
    pub max_frame_size: u32,

    /// Highest channel number that can be used
    pub channel_max: u16,

    /// Idle timeout announced to the peer
    pub idle_timeout: Option<Duration>,

    /// Connection properties
    pub properties: Option<Fields>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Builder::new().into_options()
    }
}

impl ConnectionOptions {
    /// Creates a builder for [`ConnectionOptions`]
    pub fn builder() -> Builder {
        Builder::new()
    }
}

/// Builder for [`ConnectionOptions`]
#[derive(Debug, Clone)]
pub struct Builder {
    /// Connection id. A unique id is generated if not set.
    pub connection_id: Option<String>,

    /// Host to connect to
    pub hostname: String,

    /// Port to connect to
    pub port: u16,

    /// Window every create and close operation has to settle in
    pub operation_timeout: Duration,

    /// Largest frame the local side accepts
    pub max_frame_size: u32,

    /// Highest channel number that can be used
    pub channel_max: u16,

    /// Idle timeout announced to the peer
    pub idle_timeout: Option<Duration>,

    /// Connection properties
    pub properties: Option<Fields>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a builder with the default options
    pub fn new() -> Self {
        Self {
            connection_id: None,
            hostname: String::from("localhost"),
            port: DEFAULT_PORT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            idle_timeout: None,
            properties: None,
        }
    }

    /// Set the connection id
    pub fn connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    /// Set the hostname
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the operation timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the max-frame-size
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set the channel-max
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Set the connection properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Validates the options
    pub fn build(self) -> Result<ConnectionOptions, ConfigError> {
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::ZeroOperationTimeout);
        }
        if self.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(ConfigError::MaxFrameSizeTooSmall(self.max_frame_size));
        }
        Ok(self.into_options())
    }

    fn into_options(self) -> ConnectionOptions {
        ConnectionOptions {
            connection_id: self
                .connection_id
                .unwrap_or_else(|| generate_id("connection")),
            hostname: self.hostname,
            port: self.port,
            operation_timeout: self.operation_timeout,
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_timeout: self.idle_timeout,
            properties: self.properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::assert_err;

    use crate::error::ConfigError;

    use super::{ConnectionOptions, DEFAULT_OPERATION_TIMEOUT};

    #[test]
    fn defaults() {
        let options = ConnectionOptions::builder().build().unwrap();
        assert_eq!(options.hostname, "localhost");
        assert_eq!(options.port, 5672);
        assert_eq!(options.operation_timeout, DEFAULT_OPERATION_TIMEOUT);
        assert!(options.connection_id.starts_with("connection-"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = ConnectionOptions::default();
        let b = ConnectionOptions::default();
        assert_ne!(a.connection_id, b.connection_id);
    }

    #[test]
    fn zero_operation_timeout_is_rejected() {
        let err = assert_err!(ConnectionOptions::builder()
            .operation_timeout(Duration::ZERO)
            .build());
        assert_eq!(err, ConfigError::ZeroOperationTimeout);
    }

    #[test]
    fn tiny_frames_are_rejected() {
        let err = assert_err!(ConnectionOptions::builder().max_frame_size(100).build());
        assert_eq!(err, ConfigError::MaxFrameSizeTooSmall(100));
    }

    #[test]
    fn explicit_id_is_kept() {
        let options = ConnectionOptions::builder()
            .connection_id("c1")
            .hostname("broker")
            .port(5671)
            .build()
            .unwrap();
        assert_eq!(options.connection_id, "c1");
        assert_eq!(options.hostname, "broker");
        assert_eq!(options.port, 5671);
    }
}
