//! # wavesock: server-side WebSocket over tokio
//!
//! An RFC 6455 WebSocket server: HTTP upgrade handshake with subprotocol
//! negotiation, the frame codec, and a per-connection concurrency structure
//! that runs the inbound frame loop, the outbound frame loop, and the
//! application handler together and tears all of them down consistently on
//! the first failure. The server tracks every live connection and supports
//! coordinated shutdown of all of them.
//!
//! Application logic lives behind the negotiated subprotocol: a handler is
//! a function that receives the consumer end of the inbound payload queue
//! and the producer end of the outbound payload queue. The queues are
//! bounded; a full queue suspends the producer, which is how backpressure
//! reaches the peer.
//!
//! ## Example
//!
//! ```ignore
//! use wavesock::{Config, Server};
//!
//! let server = Server::new(Config::default());
//! server.register_handler("echo", |mut reader, writer| async move {
//!     while let Some(payload) = reader.recv().await {
//!         writer.send(payload).await?;
//!     }
//!     Ok(())
//! });
//! server.listen("127.0.0.1:8080".parse().unwrap()).await?;
//! // ... later
//! server.stop().await;
//! ```

pub mod channel;
mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod server;

pub use channel::{MessageReader, MessageWriter};
pub use error::{Error, Result};
pub use frame::{encode_frame, Frame, FrameHeader, FrameParser, OpCode};
pub use server::{Handler, ListenOptions, Server};

/// WebSocket GUID for the handshake accept computation (RFC 6455)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload that fits the 2-byte header form
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload that fits the 4-byte header form (16-bit length)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Configuration for WebSocket connections
///
/// # Example
///
/// ```
/// use wavesock::Config;
///
/// let config = Config::builder()
///     .max_frame_size(1024 * 1024)
///     .queue_capacity(32)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum accepted frame payload size (default: 16MB)
    pub max_frame_size: usize,
    /// Capacity of the inbound and outbound payload queues (default: 64)
    pub queue_capacity: usize,
    /// Initial capacity of the per-connection read buffer (default: 8KB)
    pub read_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            queue_capacity: 64,
            read_buffer_size: 8 * 1024,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the maximum accepted frame payload size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the capacity of the inbound and outbound payload queues
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the initial capacity of the per-connection read buffer
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{MessageReader, MessageWriter};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::server::{ListenOptions, Server};
    pub use crate::Config;
}
