//! Connection registry.
//!
//! A thread safe set of channels enforcing uniqueness by peer authority
//! and by channel nonce, with a fan-out stop that terminates every member
//! exactly once. Matching nonces reveal a connection back to ourselves, so
//! nonce collisions are treated the same as address collisions.

use crate::channel::Channel;
use crate::error::NetworkError;
use crate::settings::NetworkSettings;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A registry of TCP channels.
pub type TcpConnections = Connections<
    tokio::net::tcp::OwnedReadHalf,
    tokio::net::tcp::OwnedWriteHalf,
>;

/// Tracks the live channels of a node, thread and lock safe.
pub struct Connections<R, W> {
    inner: RwLock<Members<R, W>>,
}

struct Members<R, W> {
    stopped: bool,
    channels: Vec<Arc<Channel<R, W>>>,
}

impl<R, W> Connections<R, W> {
    /// Create an empty registry sized from the settings' connection counts.
    pub fn new(settings: &NetworkSettings) -> Self {
        let capacity =
            settings.inbound_connections + settings.outbound_connections + settings.peers.len();
        Self {
            inner: RwLock::new(Members {
                stopped: false,
                channels: Vec::with_capacity(capacity),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Members<R, W>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Members<R, W>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a channel unless a member already uses its authority or nonce.
    ///
    /// Fails with `ServiceStopped` once the registry has stopped and
    /// `AddressInUse` on either collision.
    pub fn store(&self, channel: Arc<Channel<R, W>>) -> Result<(), NetworkError> {
        let mut members = self.write();
        if members.stopped {
            return Err(NetworkError::ServiceStopped);
        }
        let duplicate = members.channels.iter().any(|entry| {
            entry.authority() == channel.authority() || entry.nonce() == channel.nonce()
        });
        if duplicate {
            return Err(NetworkError::AddressInUse);
        }
        members.channels.push(channel);
        Ok(())
    }

    /// Remove a channel by identity.
    ///
    /// Fails with `NotFound` when the channel is not a member, which makes
    /// repeated removal safe.
    pub fn remove(&self, channel: &Arc<Channel<R, W>>) -> Result<(), NetworkError> {
        let mut members = self.write();
        match members
            .channels
            .iter()
            .position(|entry| Arc::ptr_eq(entry, channel))
        {
            Some(index) => {
                members.channels.remove(index);
                Ok(())
            }
            None => Err(NetworkError::NotFound),
        }
    }

    /// Whether any member is connected to the given authority.
    pub fn exists(&self, authority: SocketAddr) -> bool {
        self.read()
            .channels
            .iter()
            .any(|entry| entry.authority() == authority)
    }

    /// Number of member channels.
    pub fn count(&self) -> usize {
        self.read().channels.len()
    }

    /// Stop every member with the given code and freeze the membership.
    ///
    /// Idempotent. The member list is snapshotted and the lock released
    /// before any channel is stopped: stop handlers call straight back
    /// into [`Connections::remove`].
    pub fn stop(&self, ec: NetworkError) {
        let channels = {
            let mut members = self.write();
            if members.stopped {
                return;
            }
            members.stopped = true;
            members.channels.clone()
        };
        for channel in channels {
            channel.stop(ec.clone());
        }
    }
}
