use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, StreamError};
use crate::sequence::MAX_ACK_VALUE;

/// First two bytes of every reliable frame.
pub const RELIABLE_MAGIC: [u8; 2] = [0xF5, 0x02];

/// Serialized header length: magic, two packed 24-bit counters, opcode,
/// trailing unknown byte.
pub const HEADER_LEN: usize = 10;

/// Reliable-stream opcodes with their wire values.
///
/// `Unset` is a sender-side placeholder resolved to `Dat` or `DatAck` at
/// enqueue time; it never appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Unset = 0x00,
    Syn = 0x02,
    Dat = 0x03,
    Hbt = 0x05,
    Fin = 0x06,
    Rst = 0x07,
    SynAck = 0x12,
    Ack = 0x31,
    Rack = 0x32,
    DatAck = 0x33,
    FinAck = 0x62,
}

impl Opcode {
    /// Sequenced opcodes occupy a slot in the local sequence space, travel
    /// through the send queue and are retransmitted until acknowledged.
    /// Everything else is fire-and-forget.
    pub fn is_sequenced(self) -> bool {
        matches!(self, Opcode::Dat | Opcode::DatAck | Opcode::FinAck)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = StreamError;

    fn try_from(value: u8) -> Result<Opcode> {
        match value {
            0x00 => Ok(Opcode::Unset),
            0x02 => Ok(Opcode::Syn),
            0x03 => Ok(Opcode::Dat),
            0x05 => Ok(Opcode::Hbt),
            0x06 => Ok(Opcode::Fin),
            0x07 => Ok(Opcode::Rst),
            0x12 => Ok(Opcode::SynAck),
            0x31 => Ok(Opcode::Ack),
            0x32 => Ok(Opcode::Rack),
            0x33 => Ok(Opcode::DatAck),
            0x62 => Ok(Opcode::FinAck),
            other => Err(StreamError::protocol(format!(
                "unknown reliable opcode 0x{other:02x}"
            ))),
        }
    }
}

/// The fixed reliable frame header.
///
/// The two acknowledgement counters are packed as 24-bit big-endian values;
/// [`PacketHeader::get_ack_counters`] / [`PacketHeader::set_ack_counters`]
/// hide the packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    local_ack: u32,
    remote_ack: u32,
    pub opcode: Opcode,
    /// Present in every reference frame; meaning unknown. Preserved on
    /// forward and return paths, otherwise ignored.
    pub unknown_1: u8,
}

impl PacketHeader {
    pub fn new(opcode: Opcode) -> PacketHeader {
        PacketHeader {
            local_ack: 0,
            remote_ack: 0,
            opcode,
            unknown_1: 0,
        }
    }

    pub fn get_ack_counters(&self) -> (u32, u32) {
        (self.local_ack, self.remote_ack)
    }

    pub fn set_ack_counters(&mut self, local: u32, remote: u32) {
        debug_assert!(local <= MAX_ACK_VALUE && remote <= MAX_ACK_VALUE);
        self.local_ack = local & MAX_ACK_VALUE;
        self.remote_ack = remote & MAX_ACK_VALUE;
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.opcode != Opcode::Unset);

        buf.put_slice(&RELIABLE_MAGIC);
        buf.put_uint(self.local_ack as u64, 3);
        buf.put_uint(self.remote_ack as u64, 3);
        buf.put_u8(self.opcode as u8);
        buf.put_u8(self.unknown_1);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader> {
        if buf.remaining() < HEADER_LEN {
            return Err(StreamError::framing(format!(
                "payload of {} bytes is shorter than the {HEADER_LEN} byte reliable header",
                buf.remaining()
            )));
        }

        let magic = [buf.get_u8(), buf.get_u8()];
        if magic != RELIABLE_MAGIC {
            return Err(StreamError::framing(format!(
                "reliable magic mismatch, got {magic:02x?}"
            )));
        }

        let local_ack = buf.get_uint(3) as u32;
        let remote_ack = buf.get_uint(3) as u32;
        let opcode = Opcode::try_from(buf.get_u8())?;
        if opcode == Opcode::Unset {
            return Err(StreamError::protocol("Unset opcode on the wire"));
        }
        let unknown_1 = buf.get_u8();

        Ok(PacketHeader {
            local_ack,
            remote_ack,
            opcode,
            unknown_1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Opcode::Syn, 1, 0)]
    #[case(Opcode::SynAck, 1, 1)]
    #[case(Opcode::Ack, 0, 1)]
    #[case(Opcode::Dat, 12345, 678)]
    #[case(Opcode::DatAck, MAX_ACK_VALUE, MAX_ACK_VALUE)]
    #[case(Opcode::Hbt, 0, MAX_ACK_VALUE - 1)]
    #[case(Opcode::Fin, 99, 0)]
    #[case(Opcode::FinAck, 100, 99)]
    #[case(Opcode::Rst, 0, 0)]
    #[case(Opcode::Rack, 0, 7)]
    fn test_ser_deser_round_trip(#[case] opcode: Opcode, #[case] local: u32, #[case] remote: u32) {
        let mut original = PacketHeader::new(opcode);
        original.set_ack_counters(local, remote);
        original.unknown_1 = 0x5a;

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..2], &RELIABLE_MAGIC);

        let mut slice: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_wire_layout_is_fixed() {
        let mut header = PacketHeader::new(Opcode::Dat);
        header.set_ack_counters(0x010203, 0x040506);

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[0xF5, 0x02, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x03, 0x00]
        );
    }

    #[test]
    fn test_deser_rejects_bad_magic() {
        let bytes = [0xF5u8, 0x03, 0, 0, 1, 0, 0, 0, 0x03, 0];
        let result = PacketHeader::deser(&mut bytes.as_slice());
        assert!(matches!(result, Err(StreamError::Framing(_))));
    }

    #[test]
    fn test_deser_rejects_short_input() {
        let bytes = [0xF5u8, 0x02, 0, 0, 1];
        let result = PacketHeader::deser(&mut bytes.as_slice());
        assert!(matches!(result, Err(StreamError::Framing(_))));
    }

    #[test]
    fn test_deser_rejects_unknown_opcode() {
        let bytes = [0xF5u8, 0x02, 0, 0, 1, 0, 0, 0, 0x44, 0];
        let result = PacketHeader::deser(&mut bytes.as_slice());
        assert!(matches!(result, Err(StreamError::Protocol(_))));
    }

    #[test]
    fn test_deser_rejects_unset_opcode() {
        let bytes = [0xF5u8, 0x02, 0, 0, 1, 0, 0, 0, 0x00, 0];
        let result = PacketHeader::deser(&mut bytes.as_slice());
        assert!(matches!(result, Err(StreamError::Protocol(_))));
    }

    #[rstest]
    #[case(Opcode::Dat, true)]
    #[case(Opcode::DatAck, true)]
    #[case(Opcode::FinAck, true)]
    #[case(Opcode::Syn, false)]
    #[case(Opcode::SynAck, false)]
    #[case(Opcode::Ack, false)]
    #[case(Opcode::Hbt, false)]
    #[case(Opcode::Fin, false)]
    #[case(Opcode::Rst, false)]
    #[case(Opcode::Rack, false)]
    #[case(Opcode::Unset, false)]
    fn test_sequenced_opcodes(#[case] opcode: Opcode, #[case] sequenced: bool) {
        assert_eq!(opcode.is_sequenced(), sequenced);
    }
}
