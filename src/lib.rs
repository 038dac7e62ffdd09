mod acceptor;
mod channel;
mod connections;
mod error;
mod settings;
mod wire;

pub use acceptor::Acceptor;
pub use channel::{
    connect, Channel, ChannelHooks, MessageHandler, StopHandler, TcpChannel,
};
pub use connections::{Connections, TcpConnections};
pub use error::NetworkError;
pub use settings::{
    NetworkSettings, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_LISTEN_PORT, DEFAULT_PROTOCOL_MAXIMUM,
};
pub use wire::{checksum, max_payload, Heading, HEADING_SIZE, WITNESS_PROTOCOL_VERSION};
