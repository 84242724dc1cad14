//! Network transport for the mixnode.

pub mod tcp;

pub use tcp::{TcpClient, TcpServer};
