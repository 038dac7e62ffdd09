//! Bitcoin p2p channel proxy.
//!
//! A [`Channel`] owns one full duplex byte stream to a remote peer. Its
//! read loop frames each message as heading plus payload, validates magic,
//! size and checksum, and hands parsed messages to per-command subscribers.
//! Sends are serialized on the caller's task and funnelled through the
//! write half in call order. A channel stops exactly once, on the first
//! terminal read error or an external [`Channel::stop`].
//!
//! # Examples
//!
//! Dialing a peer and watching for pongs.
//!
//! ```no_run
//! use bitcoin_peers_channel::{connect, NetworkSettings};
//! use bitcoin::p2p::message::NetworkMessage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = NetworkSettings::default();
//! let channel = connect("127.0.0.1:8333".parse()?, &settings, None).await?;
//!
//! // Subscriptions registered before start never miss a message.
//! channel.subscribe(NetworkMessage::Pong(0).command(), |result| {
//!     if let Ok(NetworkMessage::Pong(nonce)) = result {
//!         println!("pong {nonce}");
//!     }
//! });
//! channel.start()?;
//!
//! channel.send(NetworkMessage::Ping(42)).await?;
//! # Ok(())
//! # }
//! ```

mod reader;
mod subscribers;
mod tcp;

pub use tcp::{connect, TcpChannel};

use crate::error::NetworkError;
use crate::settings::NetworkSettings;
use bitcoin::consensus::encode;
use bitcoin::p2p::message::{CommandString, NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use log::debug;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use subscribers::{MessageSubscribers, StopSubscribers};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

/// Handler invoked for each parsed message of a subscribed command, then a
/// final time with `ChannelStopped` when the channel stops.
pub type MessageHandler = Box<dyn FnMut(Result<&NetworkMessage, NetworkError>) + Send>;

/// Handler invoked exactly once with the channel's terminal code.
pub type StopHandler = Box<dyn FnOnce(NetworkError) + Send>;

/// Hooks for the timer layers that run above a channel.
///
/// [`ChannelHooks::on_activity`] fires after every completed read and every
/// successful dispatch, feeding inactivity and keepalive timers.
/// [`ChannelHooks::on_stopping`] fires during the stop sequence so
/// outstanding timers can be cancelled.
pub trait ChannelHooks: Send + Sync {
    /// The read loop made progress.
    fn on_activity(&self) {}

    /// The channel is stopping; cancel timers now.
    fn on_stopping(&self) {}
}

/// Manages all socket communication for one peer, thread safe.
///
/// The type is generic over the stream halves so tests can drive it with
/// in-memory pipes; [`TcpChannel`] binds it to Tokio's TCP split halves.
pub struct Channel<R, W> {
    /// Magic stamped on outgoing frames and demanded of incoming ones.
    magic: Magic,
    /// Remote endpoint, captured at construction.
    authority: SocketAddr,
    /// Self chosen value for loopback connection detection, nonzero.
    nonce: u64,
    /// Upper version bound; sizes the frame buffer.
    protocol_maximum: u32,
    /// Negotiated protocol version, narrowed monotonically from the maximum.
    version: AtomicU32,
    started: AtomicBool,
    stopped: AtomicBool,
    /// Read half, taken by the read loop task on start.
    reader: Mutex<Option<R>>,
    /// Write half; the FIFO lock orders concurrent sends.
    writer: Mutex<Option<W>>,
    message_subscribers: MessageSubscribers,
    stop_subscribers: StopSubscribers,
    hooks: Option<Arc<dyn ChannelHooks>>,
    /// Signals the read loop task that stop was requested.
    shutdown: watch::Sender<bool>,
}

impl<R, W> Channel<R, W> {
    /// Create a channel in the idle state around an established stream.
    pub fn new(
        settings: &NetworkSettings,
        authority: SocketAddr,
        nonce: u64,
        reader: R,
        writer: W,
        hooks: Option<Arc<dyn ChannelHooks>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            magic: settings.network_magic,
            authority,
            nonce,
            protocol_maximum: settings.protocol_maximum,
            version: AtomicU32::new(settings.protocol_maximum),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            message_subscribers: MessageSubscribers::new(),
            stop_subscribers: StopSubscribers::new(),
            hooks,
            shutdown,
        }
    }

    /// The authority of the far end of this socket.
    pub fn authority(&self) -> SocketAddr {
        self.authority
    }

    /// The nonce identifying this channel for loopback detection.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The negotiated protocol version of this socket.
    ///
    /// The value should be the lesser of own maximum and peer version.
    pub fn negotiated_version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Narrow the negotiated version once the peer's version is known.
    ///
    /// The version only decreases; attempts to raise it are ignored.
    pub fn set_negotiated_version(&self, value: u32) {
        self.version.fetch_min(value, Ordering::AcqRel);
    }

    /// Whether the channel has stopped (or has not started yet).
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Subscribe to messages of the given command on this channel.
    ///
    /// Handlers fire in registration order for every parsed message of the
    /// command, and once with `ChannelStopped` when the channel stops, at
    /// which point they are dropped. Handlers run on the channel's read
    /// task and must not block.
    pub fn subscribe<F>(&self, command: CommandString, handler: F)
    where
        F: FnMut(Result<&NetworkMessage, NetworkError>) + Send + 'static,
    {
        self.message_subscribers
            .subscribe(command.to_string(), Box::new(handler));
    }

    /// Subscribe to the stop event.
    ///
    /// The handler fires exactly once with the terminal code, immediately
    /// if the channel has already stopped.
    pub fn subscribe_stop<F>(&self, handler: F)
    where
        F: FnOnce(NetworkError) + Send + 'static,
    {
        self.stop_subscribers.subscribe(Box::new(handler));
    }

    /// Stop reading and sending on this socket.
    ///
    /// Idempotent and callable from any thread. Each step is independently
    /// thread safe; no lock spans the sequence.
    pub fn stop(&self, ec: NetworkError) {
        self.stopped.store(true, Ordering::Release);

        // Close both tables to new registrations, then notify. Message
        // handlers receive the generic stop code, stop handlers the
        // terminal one.
        self.message_subscribers.stop();
        let first = self.stop_subscribers.stop(ec);

        // Give the timer layer one opportunity to cancel.
        if first {
            if let Some(hooks) = &self.hooks {
                hooks.on_stopping();
            }
        }

        // Wakes the read loop task, which tears the socket down.
        self.shutdown.send_replace(true);
    }

    fn activity(&self) {
        if let Some(hooks) = &self.hooks {
            hooks.on_activity();
        }
    }
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Begin the read loop, transitioning the channel from idle to running.
    ///
    /// Fails with `OperationFailed` if the channel has ever been started.
    /// Register subscriptions before calling this; the read loop may begin
    /// delivering messages as soon as it is spawned.
    pub fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::OperationFailed);
        }

        // A stop issued while still idle is terminal all the same.
        if *self.shutdown.borrow() {
            return Err(NetworkError::ChannelStopped);
        }

        // Uncontended by construction: only the first start reaches this.
        let reader = match self.reader.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(reader) = reader else {
            return Err(NetworkError::OperationFailed);
        };

        self.stopped.store(false, Ordering::Release);
        let channel = Arc::clone(self);
        tokio::spawn(reader::run(channel, reader));
        Ok(())
    }

    /// Send a message on the socket.
    ///
    /// Serialization happens on the caller's task; the write itself queues
    /// behind any send already in flight, so program order is wire order.
    /// Completes with `ChannelStopped` if the channel stopped before the
    /// write was dispatched. A failed send reports its error without
    /// stopping the channel.
    pub async fn send(&self, message: NetworkMessage) -> Result<(), NetworkError> {
        if self.stopped() {
            return Err(NetworkError::ChannelStopped);
        }

        let command = message.command();
        let data = encode::serialize(&RawNetworkMessage::new(self.magic, message));
        debug!(
            "Sending {command} to [{}] ({} bytes)",
            self.authority,
            data.len()
        );

        let mut slot = self.writer.lock().await;
        // The channel may have stopped while waiting for the writer.
        if self.stopped() {
            return Err(NetworkError::ChannelStopped);
        }
        match slot.as_mut() {
            Some(writer) => {
                writer.write_all(&data).await?;
                writer.flush().await?;
                Ok(())
            }
            None => Err(NetworkError::ChannelStopped),
        }
    }
}

impl<R, W> fmt::Debug for Channel<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("authority", &self.authority)
            .field("nonce", &self.nonce)
            .field("version", &self.negotiated_version())
            .field("stopped", &self.stopped())
            .finish()
    }
}

impl<R, W> fmt::Display for Channel<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel [{}]", self.authority)
    }
}
