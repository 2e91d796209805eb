//! The SP message buffer.
//!
//! A [`Message`] is one logical SP datagram: a body region carrying the
//! application payload, and a header region that protocol policies use for
//! routing state (backtrace hops, request ids). Both regions grow and
//! shrink independently. On the wire the header is transmitted immediately
//! ahead of the body and the framed length covers both.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A refcount-free owned message; ownership moves through AIO and queue
/// slots, so a message belongs to at most one holder at a time. `clone`
/// is a deep copy.
#[derive(Default, Clone)]
pub struct Message {
    header: BytesMut,
    body: BytesMut,
}

impl Message {
    /// Creates an empty message.
    pub fn new() -> Message {
        Message::default()
    }

    /// Creates a message whose body has room for `cap` bytes.
    pub fn with_capacity(cap: usize) -> Message {
        Message {
            header: BytesMut::new(),
            body: BytesMut::with_capacity(cap),
        }
    }

    /// Creates a message with the given body contents.
    pub fn from_body(body: impl AsRef<[u8]>) -> Message {
        let mut msg = Message::new();
        msg.append(body.as_ref());
        msg
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Total framed length: header plus body.
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends bytes to the end of the body.
    pub fn append(&mut self, bytes: &[u8]) {
        self.body.put_slice(bytes);
    }

    /// Prepends bytes ahead of the body.
    pub fn insert(&mut self, bytes: &[u8]) {
        let mut merged = BytesMut::with_capacity(bytes.len() + self.body.len());
        merged.put_slice(bytes);
        merged.put_slice(&self.body);
        self.body = merged;
    }

    /// Removes `n` bytes from the front of the body. Removes the whole
    /// body if it is shorter than `n`.
    pub fn trim(&mut self, n: usize) {
        let n = n.min(self.body.len());
        self.body.advance(n);
    }

    /// Removes `n` bytes from the end of the body.
    pub fn chop(&mut self, n: usize) {
        let keep = self.body.len().saturating_sub(n);
        self.body.truncate(keep);
    }

    /// Appends bytes to the end of the header.
    pub fn header_append(&mut self, bytes: &[u8]) {
        self.header.put_slice(bytes);
    }

    /// Prepends bytes ahead of the header.
    pub fn header_insert(&mut self, bytes: &[u8]) {
        let mut merged = BytesMut::with_capacity(bytes.len() + self.header.len());
        merged.put_slice(bytes);
        merged.put_slice(&self.header);
        self.header = merged;
    }

    /// Removes `n` bytes from the front of the header.
    pub fn header_trim(&mut self, n: usize) {
        let n = n.min(self.header.len());
        self.header.advance(n);
    }

    /// Drops the header contents entirely.
    pub fn header_clear(&mut self) {
        self.header.clear();
    }

    pub fn clear(&mut self) {
        self.header.clear();
        self.body.clear();
    }

    /// Splits the message into frozen header and body segments for
    /// vectored transmission, consuming it.
    pub(crate) fn into_segments(mut self) -> (Bytes, Bytes) {
        (self.header.split().freeze(), self.body.split().freeze())
    }

    /// Takes ownership of a received payload as the message body.
    pub(crate) fn from_recv(body: BytesMut) -> Message {
        Message {
            header: BytesMut::new(),
            body,
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header.len())
            .field("body", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_editing() {
        let mut m = Message::new();
        m.append(b"world");
        m.insert(b"hello ");
        assert_eq!(m.body(), b"hello world");
        m.trim(6);
        assert_eq!(m.body(), b"world");
        m.chop(4);
        assert_eq!(m.body(), b"w");
    }

    #[test]
    fn header_is_separate() {
        let mut m = Message::from_body(b"payload");
        m.header_append(&[0x00, 0x00, 0x00, 0x81]);
        assert_eq!(m.header().len(), 4);
        assert_eq!(m.body(), b"payload");
        assert_eq!(m.len(), 11);
        m.header_trim(2);
        assert_eq!(m.header(), &[0x00, 0x81]);
    }

    #[test]
    fn trim_past_end_is_clamped() {
        let mut m = Message::from_body(b"abc");
        m.trim(10);
        assert!(m.is_empty());
        m.chop(10);
        assert!(m.is_empty());
    }

    #[test]
    fn segments_cover_header_then_body() {
        let mut m = Message::from_body(b"body");
        m.header_append(b"hd");
        let (h, b) = m.into_segments();
        assert_eq!(&h[..], b"hd");
        assert_eq!(&b[..], b"body");
    }
}
