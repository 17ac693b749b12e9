//! Receive buffers and the FIFO queue of pending receive requests.
//!
//! Data only enters a buffer from the network and only leaves it through a
//! delivery (or a framer advancing the cursor). Requests are served strictly
//! in the order they were made: a request at the front of the queue that
//! cannot be satisfied yet holds back every request behind it.

use std::collections::VecDeque;

use bytes::{Buf as _, Bytes, BytesMut};

use crate::message::ReceiveRequest;

/// One completed receive request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub(crate) data: Bytes,

    /// Whether this completes a message (`received`) or is only part of one
    /// (`received_partial`).
    pub(crate) complete: bool,
}

impl Delivery {
    fn complete(data: Bytes) -> Self {
        Self {
            data,
            complete: true,
        }
    }

    fn partial(data: Bytes) -> Self {
        Self {
            data,
            complete: false,
        }
    }
}

/// Storage for data that arrived but was not delivered yet.
pub(crate) trait ReceiveBuffer {
    /// Take a delivery for `request`, if the buffered data satisfies it.
    fn try_take(&mut self, request: &ReceiveRequest) -> Option<Delivery>;

    /// The bytes a framer would parse next, without consuming them.
    fn snapshot(&self) -> Bytes;

    /// Discard up to `n` bytes from the front.
    fn advance(&mut self, n: usize);

    /// Whether anything is buffered.
    fn has_data(&self) -> bool;
}

/// A growing byte buffer for stream sessions.
#[derive(Debug, Default)]
pub(crate) struct StreamBuffer {
    buf: BytesMut,
    eof: bool,

    /// The message ending at end of stream was handed out. Nothing more will
    /// ever arrive, so later requests stay pending.
    finished: bool,
}

impl StreamBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The peer finished sending. The next request is satisfied with whatever
    /// is left, completing the message.
    pub(crate) fn set_eof(&mut self) {
        self.eof = true;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

impl ReceiveBuffer for StreamBuffer {
    fn try_take(&mut self, request: &ReceiveRequest) -> Option<Delivery> {
        if self.finished {
            return None;
        }

        let len = self.buf.len();
        let satisfied = (len > 0 && len >= request.min()) || self.eof;
        if !satisfied {
            return None;
        }

        let take = match request.max_length {
            Some(max) if len > max => max,
            _ => len,
        };

        let data = self.buf.split_to(take).freeze();
        if self.eof && self.buf.is_empty() {
            self.finished = true;
            Some(Delivery::complete(data))
        } else {
            Some(Delivery::partial(data))
        }
    }

    fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    fn advance(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    fn has_data(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// A queue of whole datagrams for datagram sessions.
#[derive(Debug, Default)]
pub(crate) struct DatagramBuffer {
    datagrams: VecDeque<Bytes>,
}

impl DatagramBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, datagram: Bytes) {
        self.datagrams.push_back(datagram);
    }
}

impl ReceiveBuffer for DatagramBuffer {
    fn try_take(&mut self, _request: &ReceiveRequest) -> Option<Delivery> {
        // Datagrams are never split or merged, so the bounds do not apply.
        self.datagrams.pop_front().map(Delivery::complete)
    }

    fn snapshot(&self) -> Bytes {
        self.datagrams.front().cloned().unwrap_or_default()
    }

    fn advance(&mut self, n: usize) {
        if let Some(front) = self.datagrams.front_mut() {
            if n >= front.len() {
                self.datagrams.pop_front();
            } else {
                front.advance(n);
            }
        }
    }

    fn has_data(&self) -> bool {
        !self.datagrams.is_empty()
    }
}

/// A receive buffer with its queue of waiting requests.
#[derive(Debug, Default)]
pub(crate) struct ReceiveQueue<B> {
    buffer: B,
    pending: VecDeque<ReceiveRequest>,
}

impl<B: ReceiveBuffer> ReceiveQueue<B> {
    pub(crate) fn new(buffer: B) -> Self {
        Self {
            buffer,
            pending: VecDeque::new(),
        }
    }

    /// Queue a request and return whatever deliveries are now possible.
    pub(crate) fn push(&mut self, request: ReceiveRequest) -> Vec<Delivery> {
        self.pending.push_back(request);
        self.service()
    }

    /// Modify the buffer, then serve waiting requests.
    pub(crate) fn fill<F>(&mut self, f: F) -> Vec<Delivery>
    where
        F: FnOnce(&mut B),
    {
        f(&mut self.buffer);
        self.service()
    }

    /// Resolve requests from the front of the queue for as long as the front
    /// one can be satisfied.
    pub(crate) fn service(&mut self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while let Some(request) = self.pending.front() {
            match self.buffer.try_take(request) {
                Some(delivery) => {
                    self.pending.pop_front();
                    deliveries.push(delivery);
                }
                None => break,
            }
        }
        deliveries
    }

    pub(crate) fn buffer(&self) -> &B {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> ReceiveQueue<StreamBuffer> {
        ReceiveQueue::new(StreamBuffer::new())
    }

    #[test]
    fn partial_waits_for_min_incomplete_length() {
        let mut queue = stream();
        let request = ReceiveRequest::new().with_min_incomplete_length(5);

        assert!(queue.push(request).is_empty());
        assert!(queue.fill(|buf| buf.extend(b"he")).is_empty());

        let deliveries = queue.fill(|buf| buf.extend(b"llo"));
        assert_eq!(
            deliveries,
            vec![Delivery::partial(Bytes::from_static(b"hello"))]
        );
        assert_eq!(queue.buffer().len(), 0);
    }

    #[test]
    fn eof_completes_the_message() {
        let mut queue = stream();
        queue.fill(|buf| buf.extend(b"bye"));

        assert!(queue.push(ReceiveRequest::new()).is_empty());
        let deliveries = queue.fill(|buf| buf.set_eof());
        assert_eq!(deliveries, vec![Delivery::complete(Bytes::from_static(b"bye"))]);
    }

    #[test]
    fn end_of_stream_completes_only_once() {
        let mut queue = stream();
        queue.fill(|buf| buf.set_eof());

        assert_eq!(
            queue.push(ReceiveRequest::new()),
            vec![Delivery::complete(Bytes::new())]
        );
        for _ in 0..5 {
            assert!(queue.push(ReceiveRequest::new()).is_empty());
        }
        assert_eq!(queue.pending(), 5);
        assert!(queue.fill(|buf| buf.set_eof()).is_empty());
    }

    #[test]
    fn empty_buffer_does_not_satisfy_zero_minimum() {
        let mut queue = stream();
        let request = ReceiveRequest::new().with_min_incomplete_length(0);
        assert!(queue.push(request).is_empty());
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn max_length_splits_and_keeps_the_rest() {
        let mut queue = stream();
        queue.fill(|buf| buf.extend(b"abcdefgh"));

        let request = ReceiveRequest::new()
            .with_min_incomplete_length(1)
            .with_max_length(3);
        assert_eq!(
            queue.push(request),
            vec![Delivery::partial(Bytes::from_static(b"abc"))]
        );
        assert_eq!(queue.buffer().len(), 5);

        queue.fill(|buf| buf.set_eof());
        assert_eq!(
            queue.push(request),
            vec![Delivery::partial(Bytes::from_static(b"def"))]
        );
        assert_eq!(
            queue.push(request),
            vec![Delivery::complete(Bytes::from_static(b"gh"))]
        );
    }

    #[test]
    fn requests_are_served_in_order() {
        let mut queue = stream();
        let first = ReceiveRequest::new().with_min_incomplete_length(4);
        let second = ReceiveRequest::new().with_min_incomplete_length(1);

        assert!(queue.push(first).is_empty());
        // The second request could be satisfied, but the first holds it back.
        assert!(queue.push(second).is_empty());
        assert!(queue.fill(|buf| buf.extend(b"ab")).is_empty());

        let deliveries = queue.fill(|buf| buf.extend(b"cdef"));
        assert_eq!(
            deliveries,
            vec![Delivery::partial(Bytes::from_static(b"abcdef"))]
        );
        assert_eq!(queue.pending(), 1);

        let deliveries = queue.fill(|buf| buf.extend(b"g"));
        assert_eq!(deliveries, vec![Delivery::partial(Bytes::from_static(b"g"))]);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn datagrams_are_delivered_whole() {
        let mut queue = ReceiveQueue::new(DatagramBuffer::new());
        queue.fill(|buf| buf.push(Bytes::from_static(b"first datagram")));
        queue.fill(|buf| buf.push(Bytes::from_static(b"second")));

        let request = ReceiveRequest::new()
            .with_min_incomplete_length(100)
            .with_max_length(2);
        assert_eq!(
            queue.push(request),
            vec![Delivery::complete(Bytes::from_static(b"first datagram"))]
        );
        assert_eq!(
            queue.push(ReceiveRequest::new()),
            vec![Delivery::complete(Bytes::from_static(b"second"))]
        );
        assert!(queue.push(ReceiveRequest::new()).is_empty());
    }

    #[test]
    fn framer_cursor_consumes_the_front() {
        let mut buffer = StreamBuffer::new();
        buffer.extend(b"4:abcd");
        assert_eq!(buffer.snapshot(), Bytes::from_static(b"4:abcd"));
        buffer.advance(2);
        assert_eq!(buffer.snapshot(), Bytes::from_static(b"abcd"));
        buffer.advance(100);
        assert!(!buffer.has_data());

        let mut datagrams = DatagramBuffer::new();
        datagrams.push(Bytes::from_static(b"one"));
        datagrams.push(Bytes::from_static(b"two"));
        datagrams.advance(1);
        assert_eq!(datagrams.snapshot(), Bytes::from_static(b"ne"));
        datagrams.advance(2);
        assert_eq!(datagrams.snapshot(), Bytes::from_static(b"two"));
    }
}
