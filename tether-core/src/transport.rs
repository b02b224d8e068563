//! Transport seam.
//!
//! The engine is transport-agnostic: HTTP, OBEX or anything else that can
//! move one content-typed byte blob at a time. A transport also advertises
//! its maximum message size and whether the binary (WbXML) wire form is in
//! use; both feed outbound size budgeting.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failed(String),
    #[error("timed out waiting for remote device")]
    Timeout,
    #[error("connection closed by remote device")]
    Closed,
    #[error("session rejected by remote device")]
    Rejected,
    #[error("received data with unsupported content type: {0}")]
    InvalidContentType(String),
}

/// Connection-level events a transport may surface out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionOpened,
    ConnectionClosed,
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionAborted,
    DataSent,
    DataInvalidContentType,
    DataInvalidContent,
    SessionRejected,
}

/// One received wire message, still encoded.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Byte-moving boundary of the engine.
#[async_trait]
pub trait Transport: Send {
    /// Prepare the transport for a session (open connections, listeners).
    async fn init(&mut self) -> Result<(), TransportError>;

    /// Tear the transport down. Further sends or receives fail.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Send one encoded message.
    async fn send(&mut self, data: &[u8], content_type: &str) -> Result<(), TransportError>;

    /// Await the next inbound message.
    async fn receive(&mut self) -> Result<TransportMessage, TransportError>;

    /// Largest message this transport can carry, in bytes.
    fn max_message_size(&self) -> u64;

    /// Whether the binary (WbXML) wire form is in use.
    fn uses_wbxml(&self) -> bool;
}
