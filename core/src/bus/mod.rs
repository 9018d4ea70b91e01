//! Request/reply message bus: a single server paired 1:1 with per-client
//! request sockets, framed as 4-byte-length-prefixed JSON.

mod client;
mod server;
mod wire;

pub use client::BusClient;
pub use server::{BusServer, HandlerFn, HandlerResult};
pub use wire::{Address, Message};
