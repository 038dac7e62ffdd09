//! Inbound connection acceptor.
//!
//! Binds a listening TCP socket and produces a freshly constructed channel
//! for each accepted connection, until stopped.

use crate::channel::{ChannelHooks, TcpChannel};
use crate::error::NetworkError;
use crate::settings::NetworkSettings;
use log::{debug, info};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;

const LISTEN_BACKLOG: u32 = 1024;

/// Creates inbound socket connections, thread and lock safe.
pub struct Acceptor {
    settings: NetworkSettings,
    listener: Mutex<Option<Arc<TcpListener>>>,
    stopped: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl Acceptor {
    /// Construct an unbound acceptor.
    pub fn new(settings: NetworkSettings) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            settings,
            listener: Mutex::new(None),
            stopped: AtomicBool::new(false),
            cancel,
        }
    }

    /// Whether the acceptor has been stopped.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<TcpListener>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the listener on the specified port.
    ///
    /// Binds with address reuse, on the IPv6 or IPv4 wildcard per the
    /// settings. An acceptor binds at most once; `OperationFailed` on a
    /// rebind, `ServiceStopped` after stop.
    pub fn listen(&self, port: u16) -> Result<(), NetworkError> {
        if self.stopped() {
            return Err(NetworkError::ServiceStopped);
        }

        let mut slot = self.slot();
        if slot.is_some() {
            return Err(NetworkError::OperationFailed);
        }

        let (socket, address): (TcpSocket, SocketAddr) = if self.settings.enable_ipv6 {
            (TcpSocket::new_v6()?, (Ipv6Addr::UNSPECIFIED, port).into())
        } else {
            (TcpSocket::new_v4()?, (Ipv4Addr::UNSPECIFIED, port).into())
        };
        socket.set_reuseaddr(true)?;
        socket.bind(address)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        info!("Listening on {}", listener.local_addr()?);
        *slot = Some(Arc::new(listener));
        Ok(())
    }

    /// The bound address of the listener.
    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        match self.slot().as_ref() {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(NetworkError::OperationFailed),
        }
    }

    /// Accept the next connection available as an idle channel.
    ///
    /// Completes with `ServiceStopped` once [`Acceptor::stop`] is called,
    /// including for accepts already pending. A transport error fails the
    /// single accept, not the acceptor.
    pub async fn accept(
        &self,
        hooks: Option<Arc<dyn ChannelHooks>>,
    ) -> Result<Arc<TcpChannel>, NetworkError> {
        // Subscribing before the stop probe closes the race with a
        // concurrent stop: either the probe sees it, or changed() fires.
        let mut cancel = self.cancel.subscribe();
        if self.stopped() {
            return Err(NetworkError::ServiceStopped);
        }
        let listener = match self.slot().as_ref() {
            Some(listener) => Arc::clone(listener),
            None => return Err(NetworkError::OperationFailed),
        };

        tokio::select! {
            _ = cancel.changed() => Err(NetworkError::ServiceStopped),
            accepted = listener.accept() => match accepted {
                Ok((stream, authority)) => {
                    debug!("Accepted connection from [{authority}]");
                    TcpChannel::from_stream(stream, &self.settings, hooks)
                }
                Err(err) => Err(err.into()),
            }
        }
    }

    /// Cancel the listener and all outstanding accept attempts. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cancel.send_replace(true);
        self.slot().take();
    }
}
