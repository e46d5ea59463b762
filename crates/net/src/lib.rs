pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod event;
pub mod protocol;
pub mod queue;
pub mod sequence;
pub mod server;
pub mod transport;

pub use client::ClientSession;
pub use config::NetConfig;
pub use error::NetError;
pub use event::{Event, EventDelivery};
pub use protocol::{
    ConnectionId, ConnectionSecret, ConnectionState, Endpoint, MAX_APP_COMMAND, MAX_DATAGRAM_SIZE,
};
pub use queue::{BoundedQueue, OutboundPacket};
pub use sequence::SequenceWindow;
pub use server::NetServer;
pub use transport::{DatagramSocket, StreamTransport};
