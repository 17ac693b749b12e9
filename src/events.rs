//! Event handlers and their dispatch.
//!
//! Every event slot is optional. Events for an unset slot are dropped (and
//! logged at `debug`). Handlers never run inside the call that triggered
//! them: the dispatcher queues each invocation onto a single task per
//! connection or listener, so handlers run later, one at a time, in the order
//! their events occured.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::Error;
use crate::message::MessageContext;

/// Handler for events carrying a connection (`ready`, `connection_received`).
pub type ConnectionHandler = Arc<dyn Fn(Connection) + Send + Sync>;

/// Handler for `initiate_error`.
pub type InitiateErrorHandler = Arc<dyn Fn(Connection, Error) + Send + Sync>;

/// Handler for error events without a connection payload.
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Handler for events without a payload (`stopped`, `closed`).
pub type NotifyHandler = Arc<dyn Fn() + Send + Sync>;

/// Handler for `sent`.
pub type SentHandler = Arc<dyn Fn(u64) + Send + Sync>;

/// Handler for `send_error`.
pub type SendErrorHandler = Arc<dyn Fn(u64, Error) + Send + Sync>;

/// Handler for `received`: data, context, connection.
pub type ReceivedHandler = Arc<dyn Fn(Bytes, MessageContext, Connection) + Send + Sync>;

/// Handler for `received_partial`: data, context, end of message, connection.
pub type ReceivedPartialHandler =
    Arc<dyn Fn(Bytes, MessageContext, bool, Connection) + Send + Sync>;

/// The set of optional handlers for a connection or listener.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) ready: Option<ConnectionHandler>,
    pub(crate) initiate_error: Option<InitiateErrorHandler>,
    pub(crate) connection_received: Option<ConnectionHandler>,
    pub(crate) listen_error: Option<ErrorHandler>,
    pub(crate) stopped: Option<NotifyHandler>,
    pub(crate) sent: Option<SentHandler>,
    pub(crate) send_error: Option<SendErrorHandler>,
    pub(crate) received: Option<ReceivedHandler>,
    pub(crate) received_partial: Option<ReceivedPartialHandler>,
    pub(crate) receive_error: Option<ErrorHandler>,
    pub(crate) connection_error: Option<ErrorHandler>,
    pub(crate) closed: Option<NotifyHandler>,
}

impl EventHandlers {
    /// The handlers a new connection takes over from its preconnection:
    /// establishment and listening events only. Data and close handlers are
    /// set on the connection itself.
    pub(crate) fn inherited(&self) -> Self {
        Self {
            ready: self.ready.clone(),
            initiate_error: self.initiate_error.clone(),
            connection_received: self.connection_received.clone(),
            listen_error: self.listen_error.clone(),
            stopped: self.stopped.clone(),
            ..Default::default()
        }
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("ready", &self.ready.is_some())
            .field("initiate_error", &self.initiate_error.is_some())
            .field("connection_received", &self.connection_received.is_some())
            .field("listen_error", &self.listen_error.is_some())
            .field("stopped", &self.stopped.is_some())
            .field("sent", &self.sent.is_some())
            .field("send_error", &self.send_error.is_some())
            .field("received", &self.received.is_some())
            .field("received_partial", &self.received_partial.is_some())
            .field("receive_error", &self.receive_error.is_some())
            .field("connection_error", &self.connection_error.is_some())
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

type Event = Box<dyn FnOnce() + Send>;

/// Holds the handlers and schedules their invocation.
pub(crate) struct EventDispatcher {
    handlers: Mutex<EventHandlers>,
    queue: mpsc::UnboundedSender<Event>,
    idle: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &*self.handlers.lock())
            .finish()
    }
}

macro_rules! fire {
    ($self:ident.$slot:ident($($arg:expr),*)) => {{
        let handler = $self.handlers.lock().$slot.clone();
        match handler {
            Some(handler) => $self.schedule(Box::new(move || handler($($arg),*))),
            None => tracing::debug!(event = stringify!($slot), "no handler set, dropping event"),
        }
    }};
}

impl EventDispatcher {
    pub(crate) fn new(handlers: EventHandlers) -> Self {
        let (queue, idle) = mpsc::unbounded_channel();
        Self {
            handlers: Mutex::new(handlers),
            queue,
            idle: Mutex::new(Some(idle)),
        }
    }

    pub(crate) fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut EventHandlers),
    {
        f(&mut self.handlers.lock());
    }

    pub(crate) fn handlers(&self) -> EventHandlers {
        self.handlers.lock().clone()
    }

    fn schedule(&self, event: Event) {
        // The drain task starts with the first event so that dispatchers can
        // be built outside of a runtime.
        if let Some(mut events) = self.idle.lock().take() {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    event();
                }
            });
        }

        if self.queue.send(event).is_err() {
            tracing::debug!("event queue closed, dropping event");
        }
    }

    pub(crate) fn ready(&self, connection: Connection) {
        fire!(self.ready(connection))
    }

    pub(crate) fn initiate_error(&self, connection: Connection, error: Error) {
        if self.handlers.lock().initiate_error.is_none() {
            tracing::debug!(%error, "initiate error dropped");
        }
        fire!(self.initiate_error(connection, error))
    }

    pub(crate) fn connection_received(&self, connection: Connection) {
        fire!(self.connection_received(connection))
    }

    pub(crate) fn listen_error(&self, error: Error) {
        if self.handlers.lock().listen_error.is_none() {
            tracing::debug!(%error, "listen error dropped");
        }
        fire!(self.listen_error(error))
    }

    pub(crate) fn stopped(&self) {
        fire!(self.stopped())
    }

    pub(crate) fn sent(&self, seq: u64) {
        fire!(self.sent(seq))
    }

    pub(crate) fn send_error(&self, seq: u64, error: Error) {
        if self.handlers.lock().send_error.is_none() {
            tracing::debug!(seq, %error, "send error dropped");
        }
        fire!(self.send_error(seq, error))
    }

    pub(crate) fn received(&self, data: Bytes, context: MessageContext, connection: Connection) {
        fire!(self.received(data, context, connection))
    }

    pub(crate) fn received_partial(
        &self,
        data: Bytes,
        context: MessageContext,
        end_of_message: bool,
        connection: Connection,
    ) {
        fire!(self.received_partial(data, context, end_of_message, connection))
    }

    pub(crate) fn receive_error(&self, error: Error) {
        if self.handlers.lock().receive_error.is_none() {
            tracing::debug!(%error, "receive error dropped");
        }
        fire!(self.receive_error(error))
    }

    pub(crate) fn connection_error(&self, error: Error) {
        if self.handlers.lock().connection_error.is_none() {
            tracing::debug!(%error, "connection error dropped");
        }
        fire!(self.connection_error(error))
    }

    pub(crate) fn closed(&self) {
        fire!(self.closed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn handlers_run_later_and_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handlers = EventHandlers::default();
        handlers.sent = Some(Arc::new(move |seq| {
            tx.send(seq).unwrap();
        }));

        let dispatcher = EventDispatcher::new(handlers);
        dispatcher.sent(1);
        dispatcher.sent(2);
        dispatcher.sent(3);

        // Nothing runs synchronously.
        assert!(rx.try_recv().is_err());

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn unset_handler_drops_event() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = EventDispatcher::new(EventHandlers::default());
        dispatcher.stopped();
        dispatcher.listen_error(Error::listen("nothing bound"));

        let counter = calls.clone();
        dispatcher.update(|handlers| {
            handlers.stopped = Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        dispatcher.update(|handlers| {
            handlers.closed = Some(Arc::new(move || {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }));
        });
        dispatcher.stopped();
        dispatcher.closed();
        rx.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inherited_keeps_only_establishment_handlers() {
        let handlers = EventHandlers {
            ready: Some(Arc::new(|_| {})),
            stopped: Some(Arc::new(|| {})),
            closed: Some(Arc::new(|| {})),
            sent: Some(Arc::new(|_| {})),
            ..Default::default()
        };

        let inherited = handlers.inherited();
        assert!(inherited.ready.is_some());
        assert!(inherited.stopped.is_some());
        assert!(inherited.closed.is_none());
        assert!(inherited.sent.is_none());
    }
}
