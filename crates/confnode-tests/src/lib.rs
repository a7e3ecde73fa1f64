//! Integration test helpers: real daemons on random ports, scripted
//! workloads on Unix sockets, and a requester that speaks the client side
//! of the encrypted protocol.

pub mod harness;
