//! Transport sessions.
//!
//! A session is the established transport under a connection: a byte stream
//! or a datagram socket, plus the receive buffer and queue of pending
//! receive requests for it. Writes go through a per-session writer task so
//! they reach the network in the order they were issued. Reads are done by a
//! reader task which hands everything to the connection. The reader owns a
//! handle to its connection, so a connection nobody else holds stays open
//! until it is closed or its transport ends.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt as _, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::Instrument as _;

use crate::config::ConnectionConfig;
use crate::connection::{Connection, WeakConnection};
use crate::error::Error;
use crate::message::{MessageContext, ReceiveRequest};
use crate::multicast::MulticastMembership;
use crate::properties::Protocol;
use crate::BoxFuture;

pub(crate) mod datagram;
pub(crate) mod receive;
pub(crate) mod stream;

use self::datagram::DatagramSocket;
use self::receive::{DatagramBuffer, Delivery, ReceiveBuffer as _, ReceiveQueue, StreamBuffer};
use self::stream::StreamIo;

/// Input from the network.
#[derive(Debug)]
pub(crate) enum Incoming {
    Data(Bytes),
    Eof,
}

/// A connected transport which has not been turned into a session yet.
#[derive(Debug)]
pub(crate) enum Transport {
    Stream(StreamIo),
    Datagram(DatagramSocket),
}

/// The outcome of a successful attempt.
#[derive(Debug)]
pub(crate) struct Established {
    pub(crate) transport: Transport,
    pub(crate) protocol: Protocol,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: SocketAddr,

    /// Group membership held by a multicast receiver.
    pub(crate) membership: Option<MulticastMembership>,
}

enum Command {
    Write {
        seq: u64,
        data: Bytes,
    },
    Raw {
        data: Bytes,
        ack: oneshot::Sender<io::Result<()>>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

enum SessionKind {
    Stream(Mutex<ReceiveQueue<StreamBuffer>>),
    Datagram(Mutex<ReceiveQueue<DatagramBuffer>>),
}

macro_rules! with_queue {
    ($session:ident, |$queue:ident| $body:expr) => {
        match &$session.kind {
            SessionKind::Stream(queue) => {
                #[allow(unused_mut)]
                let mut $queue = queue.lock();
                $body
            }
            SessionKind::Datagram(queue) => {
                #[allow(unused_mut)]
                let mut $queue = queue.lock();
                $body
            }
        }
    };
}

/// The active transport of a connection.
pub(crate) struct TransportSession {
    protocol: Protocol,
    local: Option<SocketAddr>,
    remote: SocketAddr,
    secure: bool,
    kind: SessionKind,
    commands: mpsc::UnboundedSender<Command>,
    reader: Mutex<Option<AbortHandle>>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("protocol", &self.protocol)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("secure", &self.secure)
            .finish()
    }
}

/// The reader and writer of a session, to be spawned once the session is
/// installed on its connection.
pub(crate) struct SessionDriver {
    reader: Option<BoxFuture<'static, ()>>,
    writer: BoxFuture<'static, ()>,
}

impl fmt::Debug for SessionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDriver")
            .field("reader", &self.reader.is_some())
            .finish()
    }
}

impl TransportSession {
    /// Build a session around an established transport.
    ///
    /// Nothing runs until [`TransportSession::run`] is called with the
    /// returned driver, so the session can be installed before any data
    /// arrives.
    pub(crate) fn new(
        established: Established,
        connection: &Connection,
        config: &ConnectionConfig,
    ) -> (Self, SessionDriver) {
        let (commands, rx) = mpsc::unbounded_channel();

        let (kind, sink, reader, secure) =
            match established.transport {
                Transport::Stream(io) => {
                    let secure = io.is_secure();
                    let (read, write) = tokio::io::split(io);
                    let reader: BoxFuture<'static, ()> = Box::pin(stream::read_loop(
                        read,
                        connection.clone(),
                        config.read_chunk_size,
                    ));
                    (
                        SessionKind::Stream(Mutex::new(ReceiveQueue::new(StreamBuffer::new()))),
                        Sink::Stream(write),
                        Some(reader),
                        secure,
                    )
                }
                Transport::Datagram(socket) => {
                    let reader: Option<BoxFuture<'static, ()>> = match &socket {
                        DatagramSocket::Owned(socket) => Some(Box::pin(datagram::read_loop(
                            socket.clone(),
                            connection.clone(),
                            config.max_datagram_size,
                        ))),
                        // The listener reads for shared sockets.
                        DatagramSocket::Shared { .. } => None,
                    };
                    (
                        SessionKind::Datagram(Mutex::new(ReceiveQueue::new(DatagramBuffer::new()))),
                        Sink::Datagram(socket),
                        reader,
                        false,
                    )
                }
            };

        let session = Self {
            protocol: established.protocol,
            local: established.local,
            remote: established.remote,
            secure,
            kind,
            commands,
            reader: Mutex::new(None),
        };

        let driver = SessionDriver {
            reader,
            writer: Box::pin(write_loop(sink, rx, connection.downgrade())),
        };

        (session, driver)
    }

    /// Spawn the session's reader and writer.
    pub(crate) fn run(&self, driver: SessionDriver) {
        let span = tracing::debug_span!(
            "session",
            protocol = %self.protocol,
            remote = %self.remote,
            secure = self.secure
        );

        tokio::spawn(driver.writer.instrument(span.clone()));
        if let Some(reader) = driver.reader {
            let handle = tokio::spawn(reader.instrument(span)).abort_handle();
            *self.reader.lock() = Some(handle);
        }
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn context(&self) -> MessageContext {
        MessageContext::new(self.local, Some(self.remote))
    }

    /// Queue a message for the writer. The writer reports the outcome.
    pub(crate) fn send(&self, seq: u64, data: Bytes) -> io::Result<()> {
        self.commands
            .send(Command::Write { seq, data })
            .map_err(|_| closed())
    }

    /// Write bytes on behalf of a framer, in order with queued messages.
    pub(crate) async fn write_raw(&self, data: Bytes) -> io::Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Raw { data, ack })
            .map_err(|_| closed())?;
        done.await.map_err(|_| closed())?
    }

    /// Queue a receive request and hand any deliveries it made possible to
    /// `deliver`.
    ///
    /// `deliver` runs with the queue locked, so deliveries from concurrent
    /// callers are passed on in the order their requests were served.
    pub(crate) fn receive<F>(&self, request: ReceiveRequest, deliver: F)
    where
        F: FnOnce(Vec<Delivery>),
    {
        with_queue!(self, |queue| deliver(queue.push(request)))
    }

    /// Buffer network input and hand the deliveries it made possible to
    /// `deliver`, with the queue locked.
    pub(crate) fn ingest<F>(&self, incoming: Incoming, deliver: F)
    where
        F: FnOnce(Vec<Delivery>),
    {
        match (&self.kind, incoming) {
            (SessionKind::Stream(queue), Incoming::Data(data)) => {
                let mut queue = queue.lock();
                deliver(queue.fill(|buffer| buffer.extend(&data)));
            }
            (SessionKind::Stream(queue), Incoming::Eof) => {
                let mut queue = queue.lock();
                deliver(queue.fill(|buffer| buffer.set_eof()));
            }
            (SessionKind::Datagram(queue), Incoming::Data(data)) => {
                let mut queue = queue.lock();
                deliver(queue.fill(|buffer| buffer.push(data)));
            }
            (SessionKind::Datagram(_), Incoming::Eof) => {}
        }
    }

    pub(crate) fn has_data(&self) -> bool {
        with_queue!(self, |queue| queue.buffer().has_data())
    }

    pub(crate) fn snapshot(&self) -> Bytes {
        with_queue!(self, |queue| queue.buffer().snapshot())
    }

    pub(crate) fn advance(&self, n: usize) {
        with_queue!(self, |queue| queue.buffer_mut().advance(n))
    }

    /// Flush queued writes, then release the transport.
    pub(crate) async fn close(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session is closed")
}

enum Sink {
    Stream(WriteHalf<StreamIo>),
    Datagram(DatagramSocket),
}

impl Sink {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Stream(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Self::Datagram(socket) => socket.send(data).await,
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Self::Stream(stream) => {
                if let Err(error) = stream.shutdown().await {
                    tracing::trace!(%error, "stream shutdown");
                }
            }
            Self::Datagram(socket) => socket.detach(),
        }
    }
}

async fn write_loop(
    mut sink: Sink,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connection: WeakConnection,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Write { seq, data } => {
                let result = sink.write(&data).await;
                let Some(connection) = connection.upgrade() else {
                    continue;
                };
                match result {
                    Ok(()) => {
                        tracing::trace!(seq, bytes = data.len(), "sent");
                        connection.events().sent(seq);
                    }
                    Err(error) => {
                        tracing::debug!(seq, %error, "send failed");
                        connection.events().send_error(seq, Error::send(error));
                    }
                }
            }
            Command::Raw { data, ack } => {
                let _ = ack.send(sink.write(&data).await);
            }
            Command::Close { ack } => {
                sink.shutdown().await;
                let _ = ack.send(());
                return;
            }
        }
    }

    sink.shutdown().await;
}
