//! Vendor-neutral streaming transports.
//!
//! Two interchangeable strategies deliver a vendor's JSON event stream behind
//! [`EventTransport`]: HTTP with `text/event-stream` decoding and retry
//! ([`SseTransport`]), and pooled WebSockets keyed by session id
//! ([`WebSocketTransport`]). [`FallbackTransport`] composes them for callers
//! that prefer a socket but accept SSE when the socket never connects.
//!
//! Request shaping and event interpretation belong to the provider adapters;
//! this crate only moves JSON values and classifies failures.

pub mod cancel;
pub mod error;
pub mod http;
pub mod retry;
pub mod sse;
pub mod transport;
pub mod websocket;

pub use cancel::{await_or_cancel, is_cancelled, CancelSignal};
pub use error::{parse_error_message, vendor_error_message, TransportError};
pub use http::SseTransport;
pub use retry::{is_retryable_http_error, RetryPolicy};
pub use sse::SseDecoder;
pub use transport::{EventHandler, EventTransport, FallbackTransport, TransportRequest};
pub use websocket::{
    websocket_url, TungsteniteConnector, WebSocketPool, WebSocketTransport, WsConnection,
    WsConnector, WsIncoming, WsLease,
};
