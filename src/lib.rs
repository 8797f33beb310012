//! Reliable, authenticated message transport over UDP speaking the Frpg2
//! wire protocol.
//!
//! The crate is a four-layer stack; this library implements the middle two
//! layers and treats the others as collaborators:
//!
//! 1. *Datagram endpoint* (external): a bound, non-blocking UDP socket
//!    behind the [`udp_stream::DatagramSocket`] trait.
//! 2. *Authenticated packet layer* ([`udp_stream`]): CWC-AES encryption and
//!    verification of every datagram, plus the connection-prefix block that
//!    leads the first frame of a stream.
//! 3. *Reliable stream layer* ([`reliable_stream`]): a small TCP-like state
//!    machine with ordered delivery, a bounded in-flight window,
//!    retransmission and graceful teardown.
//! 4. *Message layer* (external): adapts application messages to and from
//!    the reliable stream's byte payloads.
//!
//! ## Wire format
//!
//! Each UDP payload is an optional cleartext connection prefix followed by
//! one encrypted frame:
//!
//! ```ascii
//!  0: nonce (11 bytes) - fresh per packet, doubles as the AAD; the first
//!                        byte is pinned to the framing magic
//! 11: tag (16 bytes)   - CWC authentication tag
//! 27: ciphertext       - encrypted reliable frame
//! ```
//!
//! The decrypted reliable frame:
//!
//! ```ascii
//!  0: magic (2 bytes, F5 02)
//!  2: local ack counter (24-bit BE)
//!  5: remote ack counter (24-bit BE)
//!  8: opcode (u8)
//!  9: unknown (u8) - carried, not interpreted
//! 10: payload
//! ```
//!
//! The first datagram of a stream leads with a cleartext 25-byte block
//! carrying the peer identity twice in NUL-terminated fixed-width fields;
//! receivers detect it by the first raw byte differing from the framing
//! magic and strip it before decrypting the rest.
//!
//! ## Protocol
//!
//! Streams handshake with SYN / SYN_ACK / ACK, exchange DAT / DAT_ACK
//! frames carrying opaque payloads, answer HBT heartbeats, and close with
//! FIN / FIN_ACK bounded by a deadline. DAT, DAT_ACK and FIN_ACK are
//! *sequenced*: they occupy a slot in the 24-bit wrapping sequence space,
//! are buffered until acknowledged and retransmitted when overdue. All
//! other opcodes are fire-and-forget. Out-of-order arrivals wait in a
//! reorder buffer so the consumer always sees payloads in send order.
//!
//! A stream advances only inside [`reliable_stream::ReliableStream::pump`];
//! there are no internal threads or locks. All failures are sticky: a
//! stream that saw a crypto, framing, protocol or transport error keeps
//! reporting it until torn down.

pub mod config;
pub mod cwc;
pub mod error;
pub mod packet;
pub mod packet_header;
pub mod reliable_stream;
pub mod sequence;
pub mod time;
pub mod udp_stream;

pub use config::StreamConfig;
pub use error::StreamError;
pub use packet::ReliablePacket;
pub use packet_header::Opcode;
pub use reliable_stream::{ReliableStream, StreamState};
