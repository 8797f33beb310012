//! Authenticated datagram layer.
//!
//! Translates between raw UDP datagrams and authenticated packet payloads:
//! every outbound payload is CWC-encrypted into a single datagram, every
//! inbound datagram is decrypted and checked for the reliable framing magic.
//! The optional 25-byte connection-prefix block travels in cleartext ahead
//! of the encrypted frame and is stripped (and logged) here. Encrypted
//! frames always lead with the framing byte (the nonce's first byte is
//! pinned to it), so a receiver can tell them apart from a prefixed
//! datagram by looking at the first raw byte.
//!
//! Datagram boundaries are preserved; this layer never coalesces or
//! reassembles.

use std::io;
use std::net::UdpSocket;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
#[cfg(test)]
use mockall::automock;
use rand::RngCore;
use tracing::{debug, trace};

use crate::cwc::{CwcCipher, ENVELOPE_LEN, NONCE_LEN};
use crate::error::{Result, StreamError};
use crate::packet::{InitialData, INITIAL_DATA_LEN};
use crate::packet_header::RELIABLE_MAGIC;

/// Largest datagram this layer will read. The transport assumes every framed
/// payload fits a single datagram.
pub const MAX_DATAGRAM_LEN: usize = 2048;

/// Non-blocking datagram endpoint, shared between streams via `Arc`.
///
/// Mirrors the narrow socket seam the rest of the crate is tested through:
/// `recv_datagram` returns `Ok(None)` when no datagram is waiting.
#[cfg_attr(test, automock)]
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<()>;

    fn recv_datagram(&self) -> io::Result<Option<Vec<u8>>>;
}

/// A connected `UdpSocket` in non-blocking mode is the production endpoint.
impl DatagramSocket for UdpSocket {
    fn send_datagram(&self, buf: &[u8]) -> io::Result<()> {
        self.send(buf).map(|_| ())
    }

    fn recv_datagram(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        match self.recv(&mut buf) {
            Ok(len) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// One authenticated packet: the decrypted payload plus whether a
/// connection-prefix block preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub payload: Vec<u8>,
    pub has_connection_prefix: bool,
}

/// Packet-level framing over a shared datagram endpoint.
///
/// Owns its cipher context exclusively; the endpoint handle outlives the
/// stream and may be multiplexed by the owner.
pub struct UdpPacketStream {
    socket: Arc<dyn DatagramSocket>,
    cipher: CwcCipher,
    in_error: Option<StreamError>,
}

impl UdpPacketStream {
    pub fn new(socket: Arc<dyn DatagramSocket>, cwc_key: &[u8]) -> Result<UdpPacketStream> {
        Ok(UdpPacketStream {
            socket,
            cipher: CwcCipher::new(cwc_key)?,
            in_error: None,
        })
    }

    /// Encrypt `payload` and emit it as one datagram, led by the cleartext
    /// connection block when requested.
    pub fn send(&mut self, payload: &[u8], connection_prefix: Option<&str>) -> Result<()> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        // encrypted frames lead with the framing byte so receivers can tell
        // them apart from a cleartext identity block
        nonce[0] = RELIABLE_MAGIC[0];

        let mut datagram =
            BytesMut::with_capacity(INITIAL_DATA_LEN + ENVELOPE_LEN + payload.len());
        if let Some(peer_id) = connection_prefix {
            InitialData::new(peer_id).ser(&mut datagram);
        }
        datagram.put_slice(&self.cipher.encrypt_with_nonce(&nonce, payload));

        trace!("sending datagram of {} bytes", datagram.len());
        if let Err(e) = self.socket.send_datagram(&datagram) {
            return Err(self.fail(StreamError::transport(format!("datagram send failed: {e}"))));
        }
        Ok(())
    }

    /// Pull one datagram, strip a detected cleartext connection-prefix
    /// block, and decrypt the remainder. `Ok(None)` when the endpoint has
    /// nothing waiting.
    pub fn recv(&mut self) -> Result<Option<UdpPacket>> {
        let mut datagram = match self.socket.recv_datagram() {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return Ok(None),
            Err(e) => {
                return Err(self.fail(StreamError::transport(format!(
                    "datagram receive failed: {e}"
                ))))
            }
        };
        trace!("received datagram of {} bytes", datagram.len());

        // the first datagram of a stream leads with an unencrypted identity
        // block; everything else starts with the pinned framing byte
        let mut has_connection_prefix = false;
        if datagram.len() > INITIAL_DATA_LEN && datagram[0] != 0xF5 && datagram[0] != 0x25 {
            let initial = match InitialData::deser(&datagram[..INITIAL_DATA_LEN]) {
                Ok(initial) => initial,
                Err(e) => return Err(self.fail(e)),
            };
            debug!("initial connection data received, peer-id: {}", initial.peer_id());
            datagram.drain(..INITIAL_DATA_LEN);
            has_connection_prefix = true;
        }

        let payload = match self.cipher.decrypt(&datagram) {
            Ok(payload) => payload,
            Err(e) => return Err(self.fail(e)),
        };

        if payload.len() < RELIABLE_MAGIC.len() || payload[..2] != RELIABLE_MAGIC {
            return Err(self.fail(StreamError::framing(
                "decrypted payload does not start with reliable magic",
            )));
        }

        Ok(Some(UdpPacket {
            payload,
            has_connection_prefix,
        }))
    }

    /// Terminal once any send or receive failed; the error is sticky.
    pub fn pump(&mut self) -> Result<()> {
        match &self.in_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        if self.in_error.is_none() {
            self.in_error = Some(err.clone());
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_header::{Opcode, PacketHeader};

    const ZERO_KEY: [u8; 16] = [0u8; 16];

    /// A reliable frame as the stream would emit it: header plus body.
    fn reliable_frame() -> Vec<u8> {
        let mut header = PacketHeader::new(Opcode::Dat);
        header.set_ack_counters(2, 1);
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf.put_slice(b"hello");
        buf.to_vec()
    }

    fn peer_cipher() -> CwcCipher {
        CwcCipher::new(&ZERO_KEY).unwrap()
    }

    /// Encrypt a frame the way the stream frames outbound traffic, with the
    /// leading nonce byte pinned to the framing magic.
    fn encrypt_frame(plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0x5au8; NONCE_LEN];
        nonce[0] = RELIABLE_MAGIC[0];
        peer_cipher().encrypt_with_nonce(&nonce, plaintext)
    }

    #[test]
    fn test_send_produces_decryptable_datagram() {
        let mut socket = MockDatagramSocket::new();
        let frame = reliable_frame();
        let expected = frame.clone();
        socket
            .expect_send_datagram()
            .withf(move |datagram| {
                datagram[0] == RELIABLE_MAGIC[0]
                    && peer_cipher().decrypt(datagram).unwrap() == expected
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut stream = UdpPacketStream::new(Arc::new(socket), &ZERO_KEY).unwrap();
        stream.send(&frame, None).unwrap();
        assert!(stream.pump().is_ok());
    }

    #[test]
    fn test_send_with_prefix_leads_with_cleartext_initial_data() {
        let mut socket = MockDatagramSocket::new();
        let frame = reliable_frame();
        let expected = frame.clone();
        socket
            .expect_send_datagram()
            .withf(move |datagram| {
                // the identity block is readable without the key, only the
                // remainder is a CWC frame
                let initial = InitialData::deser(&datagram[..INITIAL_DATA_LEN]).unwrap();
                initial.peer_id() == "peer-A"
                    && peer_cipher().decrypt(&datagram[INITIAL_DATA_LEN..]).unwrap() == expected
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut stream = UdpPacketStream::new(Arc::new(socket), &ZERO_KEY).unwrap();
        stream.send(&frame, Some("peer-A")).unwrap();
    }

    #[test]
    fn test_recv_plain_frame() {
        let frame = reliable_frame();
        let datagram = encrypt_frame(&frame);

        let mut socket = MockDatagramSocket::new();
        socket
            .expect_recv_datagram()
            .times(1)
            .return_once(move || Ok(Some(datagram)));

        let mut stream = UdpPacketStream::new(Arc::new(socket), &ZERO_KEY).unwrap();
        let packet = stream.recv().unwrap().unwrap();
        assert_eq!(packet.payload, frame);
        assert!(!packet.has_connection_prefix);
    }

    #[test]
    fn test_recv_strips_cleartext_connection_prefix() {
        let frame = reliable_frame();
        let mut datagram = BytesMut::new();
        InitialData::new("peer-A").ser(&mut datagram);
        datagram.put_slice(&encrypt_frame(&frame));
        let datagram = datagram.to_vec();

        let mut socket = MockDatagramSocket::new();
        socket
            .expect_recv_datagram()
            .times(1)
            .return_once(move || Ok(Some(datagram)));

        let mut stream = UdpPacketStream::new(Arc::new(socket), &ZERO_KEY).unwrap();
        let packet = stream.recv().unwrap().unwrap();
        assert_eq!(packet.payload, frame);
        assert!(packet.has_connection_prefix);
    }

    #[test]
    fn test_recv_without_pending_datagram() {
        let mut socket = MockDatagramSocket::new();
        socket.expect_recv_datagram().returning(|| Ok(None));

        let mut stream = UdpPacketStream::new(Arc::new(socket), &ZERO_KEY).unwrap();
        assert_eq!(stream.recv().unwrap(), None);
    }

    #[test]
    fn test_undecryptable_datagram_is_sticky_crypto_error() {
        let mut socket = MockDatagramSocket::new();
        socket
            .expect_recv_datagram()
            .returning(|| Ok(Some(vec![0x11; 64])));

        let mut stream = UdpPacketStream::new(Arc::new(socket), &ZERO_KEY).unwrap();
        assert!(matches!(stream.recv(), Err(StreamError::Crypto(_))));
        assert!(matches!(stream.pump(), Err(StreamError::Crypto(_))));
    }

    #[test]
    fn test_missing_magic_is_framing_error() {
        let datagram = encrypt_frame(b"not a reliable frame");

        let mut socket = MockDatagramSocket::new();
        socket
            .expect_recv_datagram()
            .return_once(move || Ok(Some(datagram)));

        let mut stream = UdpPacketStream::new(Arc::new(socket), &ZERO_KEY).unwrap();
        assert!(matches!(stream.recv(), Err(StreamError::Framing(_))));
        assert!(stream.pump().is_err());
    }

    #[test]
    fn test_socket_error_is_transport_error() {
        let mut socket = MockDatagramSocket::new();
        socket
            .expect_recv_datagram()
            .returning(|| Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone")));

        let mut stream = UdpPacketStream::new(Arc::new(socket), &ZERO_KEY).unwrap();
        assert!(matches!(stream.recv(), Err(StreamError::Transport(_))));
        assert!(matches!(stream.pump(), Err(StreamError::Transport(_))));
    }
}
