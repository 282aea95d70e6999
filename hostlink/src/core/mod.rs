//! Deterministic protocol logic shared by the runner and the test host.
//!
//! Core modules are free of I/O. They define the message kinds, payload
//! shapes, envelope encoding and operation bookkeeping, and are fully testable
//! in isolation.

pub mod message;
pub mod operation;
pub mod serializer;
pub mod timespan;
pub mod types;
