//! Error taxonomy for the transport, protocol and request layers.
//!
//! Orchestration code (proxy managers, launcher, CLI) uses `anyhow`; these
//! typed errors cover the seams where callers need to tell faults apart.

use std::io;

use crate::core::message::MessageType;
use crate::core::operation::OperationKind;

/// Faults raised by the framed channel and the communication server.
#[derive(Debug, thiserror::Error)]
pub enum CommunicationError {
    #[error("unable to send data over channel: {0}")]
    Send(#[source] io::Error),

    #[error("unable to read data from channel: {0}")]
    Receive(#[source] io::Error),

    #[error("connection closed by remote peer")]
    PeerClosed,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unable to listen for test host connection: {0}")]
    Listen(#[source] io::Error),

    #[error("server is already listening")]
    AlreadyListening,

    #[error("channel has been disposed")]
    Disposed,
}

/// Faults raised while encoding or decoding envelopes and payloads.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message {0} carries no payload")]
    MissingPayload(MessageType),
}

/// Errors returned synchronously by the request sender API.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("no test host is connected")]
    NotConnected,

    #[error("a {0} operation is already in progress")]
    OperationInProgress(OperationKind),

    #[error("invalid criteria: {0}")]
    InvalidCriteria(&'static str),

    #[error("invalid connection string {0:?}")]
    InvalidConnectionString(String),

    #[error("request sender has been disposed")]
    Disposed,
}
