//! Notifications published by the event monitor.
//!
//! Consumers either register a handler with [`EventHub::on_event`] (called
//! synchronously on the monitor thread) or take a channel with
//! [`EventHub::subscribe`] and consume events from async code.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;

use super::error::CommError;
use super::status::ModemStatus;

/// One notification from the monitor thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    ByteReceived(u8),
    TransmitComplete,
    Break,
    /// `changed` flags the lines that moved, `current` is the live level of
    /// all of them.
    StatusChanged {
        changed: ModemStatus,
        current: ModemStatus,
    },
    /// The monitor stopped on an error; the same error is replayed once on
    /// the next foreground call.
    ThreadFault(CommError),
}

pub type EventHandler = Arc<dyn Fn(&SerialEvent) + Send + Sync>;

/// Fan-out point for [`SerialEvent`]s.
#[derive(Default)]
pub struct EventHub {
    handlers: RwLock<Vec<EventHandler>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SerialEvent>>>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. It runs on the monitor thread, so it should be
    /// quick; it may call back into the session.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Open a channel receiving every subsequent event. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SerialEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn listener_count(&self) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).len();
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count();
        handlers + subscribers
    }

    /// Deliver `event` to every listener. A no-op when nobody listens.
    pub(crate) fn emit(&self, event: SerialEvent) {
        // Handlers run without the registry lock so they can register more.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &handlers {
            handler(&event);
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
