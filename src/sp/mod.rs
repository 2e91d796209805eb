//! SP protocol identity and the message-stream seam.
//!
//! The concrete pattern policies (REQ/REP, PUB/SUB, ...) live outside
//! this crate; the core knows protocols by their 16-bit ids, validates
//! peers during negotiation, and calls the policy's pipe hooks at the
//! right lifecycle points.

pub(crate) mod framing;

use std::sync::Arc;

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeStats};
use crate::stream::PropValue;

/// Well-known SP pattern ids.
pub mod proto_id {
    pub const PAIR: u16 = 0x10;
    pub const PUB: u16 = 0x20;
    pub const SUB: u16 = 0x21;
    pub const REQ: u16 = 0x30;
    pub const REP: u16 = 0x31;
    pub const PUSH: u16 = 0x50;
    pub const PULL: u16 = 0x51;
    pub const SURVEYOR: u16 = 0x62;
    pub const RESPONDENT: u16 = 0x63;
    pub const BUS: u16 = 0x70;
}

/// Identity of a pattern endpoint: this side's id and the id it expects
/// from peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub self_id: u16,
    pub self_name: &'static str,
    pub peer_id: u16,
    pub peer_name: &'static str,
}

impl ProtocolInfo {
    pub const fn new(
        self_id: u16,
        self_name: &'static str,
        peer_id: u16,
        peer_name: &'static str,
    ) -> ProtocolInfo {
        ProtocolInfo {
            self_id,
            self_name,
            peer_id,
            peer_name,
        }
    }
}

/// Pattern policy hooks. The socket core drives these around the pipe
/// lifecycle; everything else about a pattern is its own business.
pub trait Protocol: Send + Sync + 'static {
    fn info(&self) -> ProtocolInfo;

    /// Pipe allocated, not yet negotiated. An error tears the pipe down.
    fn pipe_init(&self, _pipe: &Pipe) -> Result<()> {
        Ok(())
    }

    /// Pipe negotiated and validated. An error rejects the pipe.
    fn pipe_start(&self, _pipe: &Pipe) -> Result<()> {
        Ok(())
    }

    /// Pipe is closing; stop using it.
    fn pipe_close(&self, _pipe: &Pipe) {}

    /// Pipe fully quiesced; drop any references to it.
    fn pipe_stop(&self, _pipe: &Pipe) {}
}

/// The message-oriented transport under a pipe: negotiation plus framed
/// whole-message send/receive over some byte channel.
pub(crate) trait MsgStream: Send + Sync {
    /// Drives the SP negotiation; the AIO carries the deadline.
    fn negotiate(&self, aio: &Aio);
    /// Sends the AIO's attached message.
    fn send(&self, aio: &Aio);
    /// Receives one message, delivered through the AIO's message slot.
    fn recv(&self, aio: &Aio);
    fn close(&self);
    fn stop(&self);
    /// Peer protocol id learned during negotiation.
    fn peer_proto(&self) -> u16;
    fn set_recvmax(&self, max: usize);
    fn set_stats(&self, stats: Arc<PipeStats>);
    fn get(&self, name: &str) -> Result<PropValue>;
}

/// Length of the negotiation header.
pub(crate) const NEG_LEN: usize = 8;

/// Builds the 8-byte negotiation header for a protocol id.
pub(crate) fn neg_header(proto: u16) -> [u8; NEG_LEN] {
    let id = proto.to_be_bytes();
    [0x00, b'S', b'P', 0x00, id[0], id[1], 0x00, 0x00]
}

/// Validates a received negotiation header byte-for-byte and extracts
/// the peer's protocol id.
pub(crate) fn parse_neg_header(buf: &[u8]) -> Result<u16> {
    if buf.len() != NEG_LEN {
        return Err(Error::ProtocolError);
    }
    if buf[0] != 0x00 || buf[1] != b'S' || buf[2] != b'P' || buf[3] != 0x00 {
        return Err(Error::ProtocolError);
    }
    if buf[6] != 0x00 || buf[7] != 0x00 {
        return Err(Error::ProtocolError);
    }
    Ok(u16::from_be_bytes([buf[4], buf[5]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_wire_image() {
        assert_eq!(
            neg_header(proto_id::REQ),
            [0x00, 0x53, 0x50, 0x00, 0x00, 0x30, 0x00, 0x00]
        );
        assert_eq!(
            neg_header(proto_id::PUB),
            [0x00, 0x53, 0x50, 0x00, 0x00, 0x20, 0x00, 0x00]
        );
    }

    #[test]
    fn header_round_trip() {
        for id in [
            proto_id::PAIR,
            proto_id::SUB,
            proto_id::SURVEYOR,
            proto_id::BUS,
        ] {
            assert_eq!(parse_neg_header(&neg_header(id)).unwrap(), id);
        }
    }

    #[test]
    fn header_literal_mismatch_rejected() {
        let mut h = neg_header(proto_id::REQ);
        h[1] = b'Q';
        assert_eq!(parse_neg_header(&h), Err(Error::ProtocolError));

        let mut h = neg_header(proto_id::REQ);
        h[7] = 0x01;
        assert_eq!(parse_neg_header(&h), Err(Error::ProtocolError));

        assert_eq!(parse_neg_header(&[0; 4]), Err(Error::ProtocolError));
    }
}
