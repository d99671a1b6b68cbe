//! Segment framing: flag decoding, the common-header well-formedness check, and builders for
//! the control and data segments a session emits.
//!
//! Builders return *unstamped* segments: the flags byte, header length and any variant bytes
//! (SYN config record, EAK slot list) are in place, while sequence number, acknowledgement
//! number and checksum are assigned by the session's send path immediately before the
//! datagram hits the wire.

use crate::config::SessionConfig;
use bytes::BytesMut;

pub const FLAG_SYN: u8 = 0x80;
pub const FLAG_ACK: u8 = 0x40;
pub const FLAG_EAK: u8 = 0x20;
pub const FLAG_RST: u8 = 0x10;
pub const FLAG_NUL: u8 = 0x08;
pub const FLAG_CHK: u8 = 0x04;
pub const FLAG_TCS: u8 = 0x02;

/// Offset of the header-length byte.
pub const OFFS_HEADER_LEN: usize = 1;
/// Offset of the sequence number.
pub const OFFS_SEQUENCE_NUMBER: usize = 2;
/// Offset of the acknowledgement number (valid iff ACK is set).
pub const OFFS_ACK_NUMBER: usize = 3;
/// Offset of the variant part (SYN config / EAK list / TCS adjust).
pub const OFFS_VARIANT: usize = 4;

/// Header length of segments without a variant part.
const PLAIN_HEADER_LEN: usize = 6;
/// Header length of a SYN: common header + 22-byte config record + checksum.
const SYN_HEADER_LEN: usize = 6 + SessionConfig::SERIALIZED_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentFlags {
    pub syn: bool,
    pub ack: bool,
    pub eak: bool,
    pub rst: bool,
    pub nul: bool,
    pub chk: bool,
    pub tcs: bool,
}

impl SegmentFlags {
    pub fn from_byte(byte: u8) -> SegmentFlags {
        SegmentFlags {
            syn: byte & FLAG_SYN != 0,
            ack: byte & FLAG_ACK != 0,
            eak: byte & FLAG_EAK != 0,
            rst: byte & FLAG_RST != 0,
            nul: byte & FLAG_NUL != 0,
            chk: byte & FLAG_CHK != 0,
            tcs: byte & FLAG_TCS != 0,
        }
    }

    /// The common-header invariant: exactly one role bit (SYN, EAK, RST, NUL, TCS - or ACK
    /// standing alone), and EAK/NUL only in combination with ACK. CHK and the reserved bit
    /// do not participate.
    pub fn is_well_formed(&self) -> bool {
        let mut role_count = 0u32;
        if self.syn {
            role_count += 1;
        }
        if self.eak {
            role_count += 1;
        }
        if self.rst {
            role_count += 1;
        }
        if self.nul {
            role_count += 1;
        }
        if self.tcs {
            role_count += 1;
        }
        if role_count == 0 && self.ack {
            role_count += 1;
        }
        if (self.eak || self.nul) && !self.ack {
            return false;
        }
        role_count == 1
    }
}

/// Does this raw datagram open with the SYN bit? Used by the demultiplexer before any
/// per-session validation.
pub fn is_syn(buf: &[u8]) -> bool {
    !buf.is_empty() && buf[0] & FLAG_SYN != 0
}

/// Does this raw datagram open with the RST bit?
pub fn is_rst(buf: &[u8]) -> bool {
    !buf.is_empty() && buf[0] & FLAG_RST != 0
}

fn framed(flags: u8, header_len: usize, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::zeroed(header_len + payload_len);
    buf[0] = flags;
    buf[OFFS_HEADER_LEN] = header_len as u8;
    buf
}

/// A SYN (or SYN+ACK) carrying the local configuration proposal.
pub fn syn(config: &SessionConfig, ack: bool) -> BytesMut {
    let mut buf = framed(if ack { FLAG_SYN | FLAG_ACK } else { FLAG_SYN }, SYN_HEADER_LEN, 0);
    config
        .serialize_into(&mut buf[OFFS_VARIANT..SYN_HEADER_LEN - 2])
        .expect("SYN header reserves exactly one config record");
    buf
}

/// A bare cumulative acknowledgement.
pub fn ack() -> BytesMut {
    framed(FLAG_ACK, PLAIN_HEADER_LEN, 0)
}

/// An ACK segment carrying application payload after the 6-byte header.
pub fn data(payload: &[u8]) -> BytesMut {
    let mut buf = framed(FLAG_ACK, PLAIN_HEADER_LEN, payload.len());
    buf[PLAIN_HEADER_LEN..].copy_from_slice(payload);
    buf
}

/// An abrupt-teardown segment.
pub fn rst() -> BytesMut {
    framed(FLAG_RST, PLAIN_HEADER_LEN, 0)
}

/// A keep-alive segment.
pub fn nul() -> BytesMut {
    framed(FLAG_NUL | FLAG_ACK, PLAIN_HEADER_LEN, 0)
}

/// An extended acknowledgement listing individually received out-of-order slots. The list is
/// capped so the one-byte header length cannot wrap.
pub fn eak(slots: &[u8]) -> BytesMut {
    let listed = slots.len().min(u8::MAX as usize - PLAIN_HEADER_LEN);
    let mut buf = framed(FLAG_EAK | FLAG_ACK, PLAIN_HEADER_LEN + listed, 0);
    buf[OFFS_VARIANT..OFFS_VARIANT + listed].copy_from_slice(&slots[..listed]);
    buf
}

/// One in-order datagram as delivered to the application: the raw segment bytes, with the
/// payload exposed from the end of the header onwards.
#[derive(Debug, PartialEq, Eq)]
pub struct ReceivedSegment {
    data: BytesMut,
}

impl ReceivedSegment {
    pub(crate) fn new(data: BytesMut) -> ReceivedSegment {
        ReceivedSegment { data }
    }

    pub fn flags(&self) -> u8 {
        self.data[0]
    }

    pub fn header_len(&self) -> usize {
        self.data[OFFS_HEADER_LEN] as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_len()..]
    }

    /// Carries application bytes beyond the header. Only such segments are handed to the
    /// application.
    pub(crate) fn has_payload(&self) -> bool {
        self.data.len() > 2 && self.data.len() > self.header_len()
    }

    pub(crate) fn into_inner(self) -> BytesMut {
        self.data
    }
}
