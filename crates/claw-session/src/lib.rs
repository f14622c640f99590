//! Identity-bound WebSocket session client.
//!
//! Maintains one live connection per process, keyed by a caller-supplied
//! identity. Unexpected closes are retried with exponential backoff; every
//! connection event is fanned out to registered handlers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use claw_session::{ConnectionEvent, ConnectionManager, SessionConfig};
//!
//! # async fn run() {
//! let manager = ConnectionManager::with_websocket(&SessionConfig::default());
//! manager.handlers().add(Arc::new(|event: &ConnectionEvent| -> anyhow::Result<()> {
//!     println!("{}", event.kind());
//!     Ok(())
//! }));
//! manager.connect("user-42");
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod logging;
pub mod manager;
pub mod reconnect;
pub mod state;
pub mod transport;
pub mod ws;

pub use config::{EndpointConfig, LogFormat, LoggingConfig, SessionConfig};
pub use error::{SessionError, TransportError};
pub use events::ConnectionEvent;
pub use handlers::{ConnectionHandler, HandlerRegistry};
pub use manager::ConnectionManager;
pub use reconnect::{ReconnectConfig, ReconnectScheduler};
pub use state::{ConnectionState, ConnectionStatus, Identity};
pub use transport::{CloseInfo, Connector, Transport, TransportEvent, TransportEvents};
pub use ws::WsConnector;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
