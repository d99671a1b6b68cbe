use crate::error::RudpError;
use bytes::{Buf, BufMut};
use std::ops::BitAndAssign;
use std::time::Duration;

/// The negotiable parameters of a session, exchanged inside SYN segments as a fixed 22-byte
/// record and merged pointwise so both ends settle on the same minima.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound the peer may keep outstanding (unacknowledged) towards us.
    pub max_out_of_standing_segs: u8,
    pub option_flags: u8,
    /// Upper bound for a whole datagram, header included.
    pub maximum_segment_size: u16,
    pub retransmission_timeout_ms: u16,
    pub cumulative_ack_timeout_ms: u16,
    pub null_segment_timeout_ms: u16,
    pub transfer_state_timeout_ms: u16,
    pub max_retrans: u8,
    pub max_cum_ack: u8,
    pub max_out_of_seq: u8,
    pub max_auto_reset: u8,
    pub connection_identifier: u32,
}

impl SessionConfig {
    pub const SERIALIZED_LEN: usize = 22;
    const MARKER: u8 = 0x10;

    /// Default parameters with a freshly drawn connection identifier.
    pub fn new() -> SessionConfig {
        SessionConfig {
            max_out_of_standing_segs: 64,
            option_flags: 0x02,
            maximum_segment_size: 1350,
            retransmission_timeout_ms: 1000,
            cumulative_ack_timeout_ms: 500,
            null_segment_timeout_ms: 1000,
            transfer_state_timeout_ms: 1000,
            max_retrans: 3,
            max_cum_ack: 32,
            max_out_of_seq: 32,
            max_auto_reset: 0,
            connection_identifier: rand::random(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<SessionConfig, RudpError> {
        if data.len() != Self::SERIALIZED_LEN {
            return Err(RudpError::BadConfig);
        }
        let mut buf = data;
        if buf.get_u8() != Self::MARKER {
            return Err(RudpError::BadConfig);
        }
        let max_out_of_standing_segs = buf.get_u8();
        let option_flags = buf.get_u8();
        buf.advance(1); // reserved
        Ok(SessionConfig {
            max_out_of_standing_segs,
            option_flags,
            maximum_segment_size: buf.get_u16(),
            retransmission_timeout_ms: buf.get_u16(),
            cumulative_ack_timeout_ms: buf.get_u16(),
            null_segment_timeout_ms: buf.get_u16(),
            transfer_state_timeout_ms: buf.get_u16(),
            max_retrans: buf.get_u8(),
            max_cum_ack: buf.get_u8(),
            max_out_of_seq: buf.get_u8(),
            max_auto_reset: buf.get_u8(),
            connection_identifier: buf.get_u32(),
        })
    }

    pub fn serialize_into(&self, target: &mut [u8]) -> Result<(), RudpError> {
        if target.len() != Self::SERIALIZED_LEN {
            return Err(RudpError::CannotSerializeConfig);
        }
        let mut buf = target;
        buf.put_u8(Self::MARKER);
        buf.put_u8(self.max_out_of_standing_segs);
        buf.put_u8(self.option_flags);
        buf.put_u8(0x00); // reserved
        buf.put_u16(self.maximum_segment_size);
        buf.put_u16(self.retransmission_timeout_ms);
        buf.put_u16(self.cumulative_ack_timeout_ms);
        buf.put_u16(self.null_segment_timeout_ms);
        buf.put_u16(self.transfer_state_timeout_ms);
        buf.put_u8(self.max_retrans);
        buf.put_u8(self.max_cum_ack);
        buf.put_u8(self.max_out_of_seq);
        buf.put_u8(self.max_auto_reset);
        buf.put_u32(self.connection_identifier);
        Ok(())
    }

    pub fn retransmission_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.retransmission_timeout_ms))
    }

    pub fn cumulative_ack_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.cumulative_ack_timeout_ms))
    }

    pub fn null_segment_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.null_segment_timeout_ms))
    }

    pub fn transfer_state_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.transfer_state_timeout_ms))
    }
}

/// Pointwise "minimise" merge used during SYN negotiation: timeouts and retry/ack limits are
/// lowered to the smaller of the two proposals. Window size, option flags, segment size and
/// the connection identifier are not negotiated this way and stay untouched.
impl BitAndAssign for SessionConfig {
    fn bitand_assign(&mut self, rhs: SessionConfig) {
        self.retransmission_timeout_ms = self.retransmission_timeout_ms.min(rhs.retransmission_timeout_ms);
        self.cumulative_ack_timeout_ms = self.cumulative_ack_timeout_ms.min(rhs.cumulative_ack_timeout_ms);
        self.null_segment_timeout_ms = self.null_segment_timeout_ms.min(rhs.null_segment_timeout_ms);
        self.transfer_state_timeout_ms = self.transfer_state_timeout_ms.min(rhs.transfer_state_timeout_ms);
        self.max_retrans = self.max_retrans.min(rhs.max_retrans);
        self.max_cum_ack = self.max_cum_ack.min(rhs.max_cum_ack);
        self.max_out_of_seq = self.max_out_of_seq.min(rhs.max_out_of_seq);
        self.max_auto_reset = self.max_auto_reset.min(rhs.max_auto_reset);
    }
}
