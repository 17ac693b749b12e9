//! Byte stream transports: plain TCP, or TCP under TLS on either side.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, ReadBuf, ReadHalf};
use tokio::net::TcpStream;

use super::Incoming;
use crate::connection::Connection;

/// Dispatching wrapper over the stream types a session can run on.
#[pin_project(project = StreamIoProjection)]
pub(crate) enum StreamIo {
    /// Plain TCP.
    Tcp(#[pin] TcpStream),

    /// TLS, where this side connected.
    TlsClient(#[pin] tokio_rustls::client::TlsStream<TcpStream>),

    /// TLS, where this side accepted.
    TlsServer(#[pin] tokio_rustls::server::TlsStream<TcpStream>),
}

impl fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(stream) => f.debug_tuple("Tcp").field(stream).finish(),
            Self::TlsClient(stream) => f.debug_tuple("TlsClient").field(stream.get_ref().0).finish(),
            Self::TlsServer(stream) => f.debug_tuple("TlsServer").field(stream.get_ref().0).finish(),
        }
    }
}

macro_rules! dispatch {
    ($driver:ident.$method:ident($($args:expr),*)) => {
        match $driver.project() {
            StreamIoProjection::Tcp(stream) => stream.$method($($args),*),
            StreamIoProjection::TlsClient(stream) => stream.$method($($args),*),
            StreamIoProjection::TlsServer(stream) => stream.$method($($args),*),
        }
    };
}

impl StreamIo {
    /// Whether a TLS session runs on top of the TCP stream.
    pub(crate) fn is_secure(&self) -> bool {
        !matches!(self, Self::Tcp(_))
    }
}

impl From<TcpStream> for StreamIo {
    fn from(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }
}

impl From<tokio_rustls::client::TlsStream<TcpStream>> for StreamIo {
    fn from(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        Self::TlsClient(stream)
    }
}

impl From<tokio_rustls::server::TlsStream<TcpStream>> for StreamIo {
    fn from(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        Self::TlsServer(stream)
    }
}

impl AsyncRead for StreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch!(self.poll_read(cx, buf))
    }
}

impl AsyncWrite for StreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        dispatch!(self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        dispatch!(self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        dispatch!(self.poll_shutdown(cx))
    }
}

/// Read from the stream until end of stream or an error, handing every chunk
/// to the connection. Aborted when the connection closes.
pub(super) async fn read_loop(
    mut reader: ReadHalf<StreamIo>,
    connection: Connection,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::trace!("end of stream");
                connection.ingest(Incoming::Eof);
                return;
            }
            Ok(n) => {
                tracing::trace!(bytes = n, "stream data");
                connection.ingest(Incoming::Data(Bytes::copy_from_slice(&buf[..n])));
            }
            Err(error) => {
                tracing::debug!(%error, "stream read failed");
                connection.fault(error);
                return;
            }
        }
    }
}
