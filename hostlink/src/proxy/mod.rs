//! Proxy managers: launch a test host and drive one operation through it.

pub mod data_collection;
pub mod discovery;
pub mod execution;
pub mod operation;
