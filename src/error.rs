use thiserror::Error;

/// Protocol-level error kinds. The receive path surfaces framing problems as
/// [`RudpError::InvalidPacket`]; the demultiplexer treats any error from a session as
/// log-and-continue so one misbehaving peer cannot stall the receive loop.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RudpError {
    /// A session configuration record had the wrong length or marker byte.
    #[error("malformed session config record")]
    BadConfig,

    /// A session configuration was serialized into a buffer of the wrong length.
    #[error("session config serialization target must be exactly 22 bytes")]
    CannotSerializeConfig,

    /// Inconsistent role bits, header length out of range, checksum mismatch, out-of-window
    /// acknowledgement number, or an unexpected SYN on an established server session.
    #[error("invalid packet")]
    InvalidPacket,

    /// An acknowledgement number outside the send window, for callers that distinguish it
    /// from general framing errors. Within the receive pipeline this is reported as
    /// [`RudpError::InvalidPacket`].
    #[error("acknowledgement number outside the send window")]
    InvalidAck,

    /// The send window is full. Currently latent: the send path enqueues onto the pending
    /// queue instead of failing.
    #[error("send buffer full")]
    SendBufferFull,
}
