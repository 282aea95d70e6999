//! Side-effecting pieces: sockets, processes, files.

pub mod channel;
pub mod client;
pub mod config;
pub mod process;
pub mod server;
pub mod test_host;
