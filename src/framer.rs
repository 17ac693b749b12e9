//! Message framers.
//!
//! A framer sits between the application's messages and the transport's
//! bytes. When one is attached to a connection, sends are handed to
//! [`Framer::handle_new_sent_message`] instead of being written directly, and
//! every arrival of data calls [`Framer::handle_received_data`] once per open
//! receive request. The framer then uses the connection's framer-facing
//! methods ([`Connection::write_raw`], [`Connection::parse`],
//! [`Connection::advance_receive_cursor`] and [`Connection::deliver`]) to move
//! bytes in and messages out.
//!
//! The encoding itself is entirely up to the framer.

use bytes::Bytes;

use crate::connection::Connection;
use crate::message::MessageContext;
use crate::{BoxError, BoxFuture};

/// Encoding and decoding of messages on top of a transport.
pub trait Framer: Send + Sync + 'static {
    /// Called once per connection, before `ready` fires, so the framer can run
    /// its own handshake. A failure aborts establishment.
    fn handle_start<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, Result<(), BoxError>>;

    /// Encode and write one outgoing message. Success fires `sent` for the
    /// message's sequence number, failure fires `send_error`.
    fn handle_new_sent_message<'a>(
        &'a self,
        connection: &'a Connection,
        data: Bytes,
        context: MessageContext,
        end_of_message: bool,
    ) -> BoxFuture<'a, Result<(), BoxError>>;

    /// New bytes arrived while a receive request is open. Failures are
    /// reported through `receive_error`.
    fn handle_received_data<'a>(
        &'a self,
        connection: &'a Connection,
    ) -> BoxFuture<'a, Result<(), BoxError>>;
}
