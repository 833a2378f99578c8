//! Framed TCP bus bridge: length-prefixed framing, wire codec, loop
//! suppression, and the client/server connection lifecycles.

pub mod bridge;
pub mod client;
mod conn;
pub mod framing;
pub mod server;
pub mod wire;

#[cfg(test)]
mod integration_tests;

pub use bridge::{OutboundHandler, SeenFromTcp, inbound_publisher};
pub use client::{RECONNECT_DELAY, TcpBusClient};
pub use framing::{DEFAULT_MAX_FRAME, FrameAccumulator, TransportError, frame};
pub use server::TcpBusServer;
pub use wire::{WirePacket, decode_message, encode_message};
