//! TCP-specific channels.

use super::{Channel, ChannelHooks};
use crate::error::NetworkError;
use crate::settings::NetworkSettings;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A channel over Tokio's split TCP stream halves.
pub type TcpChannel = Channel<OwnedReadHalf, OwnedWriteHalf>;

/// Generate a nonzero 64-bit channel nonce.
///
/// Reasonably unique without requiring a `rand` crate. Not
/// cryptographically secure, but the nonce only serves the p2p protocol's
/// connection loop detection.
fn generate_nonce() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();

    // Mix in the process ID for additional entropy.
    let pid = process::id() as u64;

    let nonce = now ^ pid.rotate_left(32);
    if nonce == 0 {
        1
    } else {
        nonce
    }
}

/// Configure a TCP stream for bitcoin p2p usage.
///
/// Sets TCP_NODELAY: the protocol exchanges many small messages where
/// latency matters more than bandwidth efficiency.
fn configure_tcp_stream(stream: &TcpStream) -> Result<(), NetworkError> {
    stream.set_nodelay(true)?;
    Ok(())
}

impl TcpChannel {
    /// Wrap an established TCP stream in an idle channel.
    ///
    /// The peer's authority is captured from the stream and a fresh nonce
    /// is drawn. Used by the acceptor for inbound sockets; also the entry
    /// point for streams dialed by other means.
    pub fn from_stream(
        stream: TcpStream,
        settings: &NetworkSettings,
        hooks: Option<Arc<dyn ChannelHooks>>,
    ) -> Result<Arc<Self>, NetworkError> {
        configure_tcp_stream(&stream)?;
        let authority = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Arc::new(Channel::new(
            settings,
            authority,
            generate_nonce(),
            reader,
            writer,
            hooks,
        )))
    }
}

/// Establish an outbound TCP connection and wrap it in an idle channel.
///
/// The attempt is bounded by the settings' connection timeout. The
/// returned channel has not been started.
pub async fn connect(
    authority: SocketAddr,
    settings: &NetworkSettings,
    hooks: Option<Arc<dyn ChannelHooks>>,
) -> Result<Arc<TcpChannel>, NetworkError> {
    match tokio::time::timeout(settings.connection_timeout, TcpStream::connect(authority)).await {
        Ok(Ok(stream)) => TcpChannel::from_stream(stream, settings, hooks),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connection attempt timed out",
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_is_nonzero() {
        for _ in 0..16 {
            assert_ne!(generate_nonce(), 0);
        }
    }
}
