//! Subscriber tables for channel message and stop events.
//!
//! Both tables close exactly once: after [`MessageSubscribers::stop`] or
//! [`StopSubscribers::stop`] every registered handler has been notified and
//! dropped, and later registrations are notified immediately. Dropping the
//! handlers at stop is what breaks the reference cycle between a channel
//! and subscribers that captured a handle back to it.

use super::{MessageHandler, StopHandler};
use crate::error::NetworkError;
use bitcoin::p2p::message::NetworkMessage;
use std::collections::HashMap;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Per-command message handler table.
pub(super) struct MessageSubscribers {
    inner: Mutex<MessageTable>,
}

struct MessageTable {
    stopped: bool,
    handlers: HashMap<String, Vec<MessageHandler>>,
}

impl MessageSubscribers {
    pub(super) fn new() -> Self {
        Self {
            inner: Mutex::new(MessageTable {
                stopped: false,
                handlers: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MessageTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for one command.
    ///
    /// If the table has already stopped the handler is invoked at once
    /// with `ChannelStopped` and discarded.
    pub(super) fn subscribe(&self, command: String, handler: MessageHandler) {
        let mut handler = handler;
        {
            let mut table = self.lock();
            if !table.stopped {
                table.handlers.entry(command).or_default().push(handler);
                return;
            }
        }
        handler(Err(NetworkError::ChannelStopped));
    }

    /// Deliver a parsed message to every handler of its command, in
    /// registration order.
    ///
    /// Handlers run outside the table lock so they may register further
    /// subscriptions.
    pub(super) fn dispatch(&self, message: &NetworkMessage) {
        let key = message.command().to_string();
        let mut current = {
            let mut table = self.lock();
            if table.stopped {
                return;
            }
            match table.handlers.get_mut(&key) {
                Some(handlers) => mem::take(handlers),
                None => return,
            }
        };

        for handler in &mut current {
            handler(Ok(message));
        }

        let mut table = self.lock();
        if table.stopped {
            // A concurrent stop drained the table while this batch was in
            // flight; it still owes these handlers their final call.
            drop(table);
            for mut handler in current {
                handler(Err(NetworkError::ChannelStopped));
            }
            return;
        }

        // Handlers registered during dispatch go behind the ones taken out.
        let entry = table.handlers.entry(key).or_default();
        let newer = mem::take(entry);
        *entry = current;
        entry.extend(newer);
    }

    /// Close the table and notify every handler once with `ChannelStopped`.
    pub(super) fn stop(&self) {
        let drained = {
            let mut table = self.lock();
            table.stopped = true;
            mem::take(&mut table.handlers)
        };
        for handlers in drained.into_values() {
            for mut handler in handlers {
                handler(Err(NetworkError::ChannelStopped));
            }
        }
    }
}

/// One-shot stop handler list.
pub(super) struct StopSubscribers {
    inner: Mutex<StopTable>,
}

struct StopTable {
    stopped: bool,
    handlers: Vec<StopHandler>,
}

impl StopSubscribers {
    pub(super) fn new() -> Self {
        Self {
            inner: Mutex::new(StopTable {
                stopped: false,
                handlers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StopTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for the terminal code.
    ///
    /// If the channel already stopped the handler is invoked at once with
    /// `ChannelStopped`.
    pub(super) fn subscribe(&self, handler: StopHandler) {
        {
            let mut table = self.lock();
            if !table.stopped {
                table.handlers.push(handler);
                return;
            }
        }
        handler(NetworkError::ChannelStopped);
    }

    /// Close the list and deliver the terminal code to every handler once.
    ///
    /// Returns whether this call performed the close, so the caller can
    /// run its own once-only stop work.
    pub(super) fn stop(&self, ec: NetworkError) -> bool {
        let (first, drained) = {
            let mut table = self.lock();
            let first = !table.stopped;
            table.stopped = true;
            (first, mem::take(&mut table.handlers))
        };
        for handler in drained {
            handler(ec.clone());
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ping() -> NetworkMessage {
        NetworkMessage::Ping(1)
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let subscribers = MessageSubscribers::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = Arc::clone(&order);
            subscribers.subscribe(
                "ping".to_string(),
                Box::new(move |result| {
                    assert!(result.is_ok());
                    order.lock().unwrap().push(tag);
                }),
            );
        }

        subscribers.dispatch(&ping());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        // Order survives a second dispatch after the take-and-restore.
        subscribers.dispatch(&ping());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_dispatch_only_matching_command() {
        let subscribers = MessageSubscribers::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&calls);
        subscribers.subscribe(
            "pong".to_string(),
            Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        subscribers.dispatch(&ping());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        subscribers.dispatch(&NetworkMessage::Pong(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_notifies_each_handler_once() {
        let subscribers = MessageSubscribers::new();
        let stops = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let stops = Arc::clone(&stops);
            subscribers.subscribe(
                "ping".to_string(),
                Box::new(move |result| {
                    assert!(matches!(result, Err(NetworkError::ChannelStopped)));
                    stops.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        subscribers.stop();
        subscribers.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 2);

        // Nothing is delivered after stop.
        subscribers.dispatch(&ping());
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_after_stop_notified_immediately() {
        let subscribers = MessageSubscribers::new();
        subscribers.stop();

        let stopped = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&stopped);
        subscribers.subscribe(
            "ping".to_string(),
            Box::new(move |result| {
                assert!(matches!(result, Err(NetworkError::ChannelStopped)));
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let subscribers = Arc::new(MessageSubscribers::new());
        let late_calls = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&subscribers);
        let late = Arc::clone(&late_calls);
        subscribers.subscribe(
            "ping".to_string(),
            Box::new(move |_| {
                let late = Arc::clone(&late);
                inner.subscribe(
                    "pong".to_string(),
                    Box::new(move |_| {
                        late.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        subscribers.dispatch(&ping());
        subscribers.dispatch(&NetworkMessage::Pong(9));
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_subscribers_deliver_terminal_code_once() {
        let subscribers = StopSubscribers::new();
        let codes = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let codes = Arc::clone(&codes);
            subscribers.subscribe(Box::new(move |ec| {
                codes.lock().unwrap().push(ec);
            }));
        }

        subscribers.stop(NetworkError::BadStream);
        subscribers.stop(NetworkError::ServiceStopped);

        let codes = codes.lock().unwrap();
        assert_eq!(codes.len(), 2);
        assert!(codes
            .iter()
            .all(|ec| matches!(ec, NetworkError::BadStream)));
    }

    #[test]
    fn test_stop_subscribe_after_stop() {
        let subscribers = StopSubscribers::new();
        subscribers.stop(NetworkError::BadStream);

        let called = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&called);
        subscribers.subscribe(Box::new(move |ec| {
            assert!(matches!(ec, NetworkError::ChannelStopped));
            count.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }
}
