//! Runner side of a test host orchestration protocol.
//!
//! A runner launches a test host process, accepts its connection on a loopback
//! socket and drives it through discovery and execution operations, receiving
//! streamed progress and exactly one completion per operation.
//!
//! - **[`core`]**: Message kinds, payload shapes, the JSON envelope serializer
//!   and operation bookkeeping. No I/O.
//! - **[`io`]**: Framed channel, socket server, worker-side client, processes
//!   and configuration.
//! - **[`sender`]**: The session state machine over one connection.
//! - **[`proxy`]**: Launch-connect-initialize orchestration for discovery and
//!   execution, optionally with data collection.

pub mod core;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod proxy;
pub mod sender;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
