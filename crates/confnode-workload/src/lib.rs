//! Wire protocol between a confidential compute node and its workload.
//!
//! Newline-delimited JSON over a Unix socket, one connection per job. The
//! node connects and sends [`protocol::NodeMessage::Hello`]; after that both
//! sides stream messages independently.

pub mod client;
pub mod listener;
pub mod protocol;
