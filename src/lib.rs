//! A DCCP (Datagram Congestion Control Protocol, RFC 4340) transport core: unreliable datagrams
//!  on top of a connection with a handshake, acknowledgements and pluggable congestion control.
//!
//! ## Scope
//!
//! * Segments are encoded and decoded here, including the Internet checksum over a configurable
//!   coverage; the IP pseudo-header is left to the layer below
//! * Each connection is a synchronous state machine ([`connection::Connection`]) that is fed
//!   inbound segments, application calls and timer expiries, and emits segments through a
//!   [`transmit::SegmentTransmit`]. [`driver`] runs connections on tokio.
//! * Data is never retransmitted. Handshake and teardown segments are, with exponential backoff.
//! * Congestion control algorithms are registered by CCID and negotiated per direction; the
//!   algorithms themselves live outside of this crate
//! * Feature negotiation covers CCID, short sequence numbers, sequence window, ack ratio and
//!   Ack Vector
//!
//! ## Generic header
//!
//! ```ascii
//!  0: source port (u16)
//!  2: destination port (u16)
//!  4: data offset: header length in 32-bit words, including options (u8)
//!  5: CCVal (4 bits) | checksum coverage (4 bits)
//!  6: checksum (u16)
//!  8: reserved (3 bits) | packet type (4 bits) | X: extended sequence numbers (1 bit)
//!  9: X=1: reserved (u8), sequence number (u48)
//!     X=0: sequence number (u24)
//! ```
//!
//! The generic header is followed by the packet type's extension header (acknowledgement number,
//!  service code, reset reason), options padded to a word boundary, and payload.
//!
//! Sequence numbers are 48 bit and compared modulo 2^48. Short (24 bit) sequence numbers are
//!  expanded against a reference captured during the handshake.

pub mod ack_vector;
pub mod checksum;
pub mod config;
pub mod congestion_control;
pub mod connection;
pub mod driver;
pub mod error;
pub mod feature_negotiation;
pub mod options;
mod output;
pub mod packet_header;
pub mod seq;
pub mod stats;
pub mod timers;
pub mod transmit;
