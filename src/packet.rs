use bytes::{BufMut, BytesMut};

use crate::error::{Result, StreamError};
use crate::packet_header::{Opcode, PacketHeader};

/// Constant SYN payload block. The bytes are opaque handshake parameters
/// captured from reference traffic; peers echo them without interpretation.
pub const SYN_PAYLOAD: [u8; 8] = [0x12, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Constant SYN_ACK payload block, likewise captured verbatim.
pub const SYN_ACK_PAYLOAD: [u8; 8] = [0x12, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// One reliable-stream packet: header, opaque payload, and the monotonic
/// second at which it was enqueued (drives retransmission aging).
#[derive(Debug, Clone, PartialEq)]
pub struct ReliablePacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
    pub send_time: f64,
}

impl ReliablePacket {
    pub fn new(opcode: Opcode) -> ReliablePacket {
        ReliablePacket {
            header: PacketHeader::new(opcode),
            payload: Vec::new(),
            send_time: 0.0,
        }
    }

    /// Packet with `Unset` opcode carrying application bytes; the stream
    /// resolves the opcode and counters at enqueue time.
    pub fn data(payload: Vec<u8>) -> ReliablePacket {
        ReliablePacket {
            header: PacketHeader::new(Opcode::Unset),
            payload,
            send_time: 0.0,
        }
    }

    pub fn with_payload(opcode: Opcode, payload: Vec<u8>) -> ReliablePacket {
        ReliablePacket {
            header: PacketHeader::new(opcode),
            payload,
            send_time: 0.0,
        }
    }

    /// Human-readable dump of the header and, for non-data opcodes, the
    /// payload bytes. Diagnostics only, never parsed.
    #[cfg(feature = "disassembly")]
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;

        let (local, remote) = self.header.get_ack_counters();
        let mut out = String::from("Reliable-Packet:\n");
        let _ = writeln!(out, "\t{:<12} = {:?}", "opcode", self.header.opcode);
        let _ = writeln!(out, "\t{:<12} = {}", "local_ack", local);
        let _ = writeln!(out, "\t{:<12} = {}", "remote_ack", remote);
        let _ = writeln!(out, "\t{:<12} = {}", "unknown_1", self.header.unknown_1);

        if !matches!(self.header.opcode, Opcode::Dat | Opcode::DatAck) {
            let _ = writeln!(out, "Packet Payload:");
            let mut line = String::from("\t");
            for byte in &self.payload {
                let _ = write!(line, "{byte:02x} ");
            }
            let _ = writeln!(out, "{}", line.trim_end());
        }
        out
    }
}

/// Width of the first peer-identity field, NUL terminator included.
const PEER_ID_FIELD_LEN: usize = 17;

/// Width of the duplicated identity field; the reference truncates the copy
/// to fit.
const PEER_ID_COPY_FIELD_LEN: usize = 8;

/// Serialized length of the connection-prefix block.
pub const INITIAL_DATA_LEN: usize = PEER_ID_FIELD_LEN + PEER_ID_COPY_FIELD_LEN;

/// The 25-byte connection-prefix block carried ahead of the first reliable
/// frame of a stream: the peer identity written twice into NUL-terminated
/// fixed-width fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialData {
    peer_id: String,
}

impl InitialData {
    pub fn new(peer_id: &str) -> InitialData {
        InitialData {
            peer_id: peer_id.to_owned(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let bytes = self.peer_id.as_bytes();
        put_fixed_field(buf, bytes, PEER_ID_FIELD_LEN);
        put_fixed_field(buf, bytes, PEER_ID_COPY_FIELD_LEN);
    }

    pub fn deser(block: &[u8]) -> Result<InitialData> {
        if block.len() < INITIAL_DATA_LEN {
            return Err(StreamError::framing(format!(
                "initial-data block of {} bytes is shorter than {INITIAL_DATA_LEN}",
                block.len()
            )));
        }

        let field = &block[..PEER_ID_FIELD_LEN];
        let id_len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let peer_id = String::from_utf8_lossy(&field[..id_len]).into_owned();
        Ok(InitialData { peer_id })
    }
}

/// Write `value` NUL-terminated into a zero-padded field of `width` bytes,
/// truncating if it does not fit.
fn put_fixed_field(buf: &mut BytesMut, value: &[u8], width: usize) {
    let take = value.len().min(width - 1);
    buf.put_slice(&value[..take]);
    buf.put_bytes(0, width - take);
}
