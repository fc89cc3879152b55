//! Peer-to-peer transfer: framing, the signed hello exchange, the outbound
//! connection state machine and the inbound server.

pub mod connection;
pub mod handshake;
pub mod message;
pub mod server;

pub use connection::{ChunkPayload, ConnectionState, PeerConnection};
pub use server::{PeerServer, ServingSession};
