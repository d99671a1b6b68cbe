//! A reliable UDP (RUDP) transport: connection-oriented, in-order, acknowledged delivery of
//! discrete segments layered directly on unreliable datagrams.
//!
//! ## Design goals
//!
//! * One listening UDP socket per endpoint handles all connections
//!   * concurrent sessions are demultiplexed by peer address
//!   * the application addresses an established connection by an opaque 32-bit identifier
//! * The abstraction is sending / receiving *segments* (defined-length chunks of data as
//!   opposed to a byte stream)
//! * Delivery to the application is strictly in-order per session; gaps are buffered until
//!   filled, duplicates are dropped
//! * Acknowledgement is cumulative by default, with delayed acks piggybacked on outgoing
//!   traffic, and selective (extended) acks under out-of-order pressure
//! * Unacknowledged segments are retransmitted on a per-segment timer, a bounded number of
//!   times; exhaustion tears the session down rather than stalling forever
//! * Connections are kept alive by content-free null segments from the initiating side, and
//!   a receive position can be resynchronized after suspected loss of state
//! * Session parameters (timeouts, window and retry limits) are proposed in the opening
//!   handshake and merged pointwise so both ends agree on the minima
//! * No congestion control beyond a fixed outstanding-segment limit, no cryptography, no
//!   fragmentation - segments are bounded by the negotiated maximum segment size
//!
//! ## Header
//!
//! Segment header (the UDP payload) - all numbers in network byte order (BE):
//! ```ascii
//! 0:  flags (8 bits):
//!     * bit 7: SYN - opens a session, carries a configuration record
//!     * bit 6: ACK - the acknowledgement number field is valid
//!     * bit 5: EAK - extended ack; the variant part lists received-out-of-order
//!              sequence numbers
//!     * bit 4: RST - abrupt teardown
//!     * bit 3: NUL - keep-alive, content-free
//!     * bit 2: CHK - checksum covers the whole datagram (set iff payload present,
//!              otherwise it covers the header only)
//!     * bit 1: TCS - transfer connection state; the variant part carries a one-byte
//!              ring adjustment
//!     * bit 0: reserved
//! 1:  header length in bytes
//! 2:  sequence number of this segment
//! 3:  acknowledgement number (valid iff ACK)
//! 4..H-3: variant part (SYN config record / EAK sequence number list / TCS adjust)
//! H-2: checksum (one's-complement internet checksum; its own bytes count as zero)
//! ```
//!
//! Application payload, if any, follows the header to the end of the datagram.
//!
//! Exactly one role bit (SYN, EAK, RST, NUL, TCS - or ACK standing alone) may be set per
//! segment; EAK and NUL additionally require ACK. Sequence numbers are 8 bit and wrap, so
//! both rings are 256 slots and all window arithmetic is modulo 256.
//!
//! ## Lifecycle
//!
//! A session is created in `Initial` on receipt of a SYN from a new peer (passive side) or
//! on [`server::RudpServer::connect`] (initiating side), and is `Opened` after the SYN
//! exchange. A passive side whose peer goes silent moves to `Broken` and waits for
//! transfer-state recovery; `Closed` is reached on RST (either direction) or retransmission
//! exhaustion, after which the owning demultiplexer forgets the session and runs its
//! close hook.

pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod error;
pub mod segment;
pub mod send_pipeline;
pub mod server;
pub mod session;
