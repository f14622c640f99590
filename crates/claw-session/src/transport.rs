//! Transport abstraction.
//!
//! A transport is a single duplex, message-framed connection. It is created
//! by a [`Connector`] and reports its lifecycle through the
//! [`TransportEvents`] handle it is given at construction. For any one
//! transport the expected order is open, then zero or more messages, then
//! close; an error may be reported shortly before the close.

use std::fmt;
use std::sync::Weak;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TransportError;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Details of a transport close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseInfo {
    /// Close code.
    pub code: u16,
    /// Close reason, possibly empty.
    pub reason: String,
    /// Whether the closing handshake completed.
    pub was_clean: bool,
}

impl CloseInfo {
    /// A close initiated by this side with a normal closure code.
    #[must_use]
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// A connection that dropped without a closing handshake.
    #[must_use]
    pub fn abnormal() -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: String::new(),
            was_clean: false,
        }
    }
}

/// A live connection handle.
pub trait Transport: Send {
    /// Queue a text frame for delivery.
    fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close the connection. Must not block.
    fn close(&mut self, code: u16, reason: &str);
}

/// Factory for transports.
pub trait Connector: Send + Sync {
    /// Construct a transport targeting `url`.
    ///
    /// Construction must not block; opening happens in the background and is
    /// reported through `events`. Events must not be emitted from inside this
    /// call. An `Err` means no transport exists and no events will follow.
    ///
    /// Events may be emitted from any thread. Handlers see them in the order
    /// the receiver accepted them, interleaved with events caused by API
    /// calls; an emit may return before its handlers have run.
    fn open(
        &self,
        url: &Url,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Raw transport notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection opened.
    Open,
    /// Text frame received.
    Message(String),
    /// Connection closed.
    Close(CloseInfo),
    /// Transport-level error; a close follows.
    Error(TransportError),
}

/// Receiver side of [`TransportEvents`].
pub trait TransportEventSink: Send + Sync {
    /// Handle an event from the transport identified by `generation`.
    fn on_transport_event(&self, generation: u64, event: TransportEvent);
}

/// Callback handle a transport uses to report its lifecycle.
///
/// Every handle is tagged with the generation of the connection it belongs
/// to, so the receiver can drop events from superseded transports. The
/// receiver is held weakly; once it is gone, events are discarded.
#[derive(Clone)]
pub struct TransportEvents {
    generation: u64,
    sink: Weak<dyn TransportEventSink>,
}

impl TransportEvents {
    /// Create a handle reporting to `sink` for connection `generation`.
    #[must_use]
    pub const fn new(generation: u64, sink: Weak<dyn TransportEventSink>) -> Self {
        Self { generation, sink }
    }

    /// Generation this handle reports for.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the connection opened.
    pub fn opened(&self) {
        self.emit(TransportEvent::Open);
    }

    /// Report an inbound text frame.
    pub fn message(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Message(text.into()));
    }

    /// Report that the connection closed.
    pub fn closed(&self, info: CloseInfo) {
        self.emit(TransportEvent::Close(info));
    }

    /// Report a transport error.
    pub fn error(&self, err: TransportError) {
        self.emit(TransportEvent::Error(err));
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_transport_event(self.generation, event);
        }
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
