//! Reliable stream layered over the authenticated datagram stream.
//!
//! Implements the TCP-like handshake (SYN / SYN_ACK / ACK), ordered data
//! delivery with a pending reorder buffer, a bounded in-flight window with
//! single-packet retransmission, heartbeats, and graceful teardown
//! (FIN / FIN_ACK) with a close deadline.
//!
//! A stream is owned by exactly one scheduling context and advances only
//! inside [`ReliableStream::pump`]; there is no internal locking and no
//! blocking beyond what the non-blocking datagram endpoint does.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::packet::{ReliablePacket, SYN_ACK_PAYLOAD, SYN_PAYLOAD};
use crate::packet_header::{Opcode, PacketHeader, HEADER_LEN};
use crate::sequence::{self, START_SEQUENCE_INDEX};
use crate::time::TimeSource;
use crate::udp_stream::{DatagramSocket, UdpPacket, UdpPacketStream};

/// Connection lifecycle states.
///
/// Both sides start in `Listening`; `connect` moves the initiating side to
/// `Connecting`. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Listening,
    Connecting,
    SynReceived,
    Established,
    Closing,
    Closed,
}

/// A reliable, ordered, authenticated packet stream over UDP.
pub struct ReliableStream {
    config: StreamConfig,
    clock: Arc<dyn TimeSource>,
    udp: UdpPacketStream,
    peer_id: String,

    state: StreamState,
    in_error: Option<StreamError>,

    /// Next local outbound sequence number.
    sequence_index: u32,
    /// Highest local sequence number the peer has acknowledged.
    sequence_index_acked: u32,
    /// Last contiguous remote sequence number processed.
    remote_sequence_index: u32,
    /// Last remote sequence number an ACK went out for.
    remote_sequence_index_acked: u32,

    send_queue: VecDeque<ReliablePacket>,
    retransmit_buffer: Vec<ReliablePacket>,
    /// Out-of-order arrivals parked until the gap fills, kept sorted by
    /// forward distance from the next expected remote sequence number.
    pending_receive_queue: Vec<ReliablePacket>,
    receive_queue: VecDeque<ReliablePacket>,

    /// Remote sequence numbers acknowledged by riding on an outbound DAT_ACK.
    dat_ack_responses: FxHashSet<u32>,
    /// Remote sends that announced themselves as expecting a DAT_ACK reply.
    expected_dat_ack_responses: FxHashSet<u32>,

    last_packet_received_time: f64,
    last_ack_send_time: f64,
    resend_syn_timer: f64,
    close_timer: f64,

    is_retransmitting: bool,
    retransmitting_index: u32,
    retransmission_timer: f64,
    retransmit_packet: Option<ReliablePacket>,
}

impl ReliableStream {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        cwc_key: &[u8],
        config: StreamConfig,
        clock: Arc<dyn TimeSource>,
    ) -> anyhow::Result<ReliableStream> {
        config.validate()?;

        let now = clock.now_seconds();
        Ok(ReliableStream {
            udp: UdpPacketStream::new(socket, cwc_key)?,
            config,
            clock,
            peer_id: String::new(),
            state: StreamState::Listening,
            in_error: None,
            sequence_index: START_SEQUENCE_INDEX,
            sequence_index_acked: 0,
            remote_sequence_index: 0,
            remote_sequence_index_acked: 0,
            send_queue: VecDeque::new(),
            retransmit_buffer: Vec::new(),
            pending_receive_queue: Vec::new(),
            receive_queue: VecDeque::new(),
            dat_ack_responses: FxHashSet::default(),
            expected_dat_ack_responses: FxHashSet::default(),
            last_packet_received_time: now,
            last_ack_send_time: 0.0,
            resend_syn_timer: 0.0,
            close_timer: 0.0,
            is_retransmitting: false,
            retransmitting_index: 0,
            retransmission_timer: 0.0,
            retransmit_packet: None,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Seconds since the last successfully decoded packet. The layer above
    /// applies its own idle cutoff (`StreamConfig::client_timeout`) to this.
    pub fn seconds_since_last_packet(&self) -> f64 {
        self.clock.now_seconds() - self.last_packet_received_time
    }

    /// Begin the handshake towards a listening peer.
    pub fn connect(&mut self, peer_id: &str) -> Result<()> {
        debug!("connecting to peer {}", peer_id);

        self.state = StreamState::Connecting;
        self.peer_id = peer_id.to_owned();
        self.resend_syn_timer = self.clock.now_seconds();

        self.send_syn()
    }

    /// Begin a graceful close. Only acts on an established stream; repeated
    /// calls are equivalent to one.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.state == StreamState::Established {
            self.send_fin()?;
        }
        Ok(())
    }

    /// Enqueue (or, for control opcodes, immediately emit) one packet.
    ///
    /// An `Unset` opcode is resolved here: the packet gets the next local
    /// sequence number and becomes a DAT_ACK when it can carry a pending
    /// remote acknowledgement, a plain DAT otherwise. Sends during teardown
    /// are silently swallowed.
    pub fn send(&mut self, packet: ReliablePacket) -> Result<()> {
        if let Some(err) = &self.in_error {
            return Err(err.clone());
        }
        if self.state == StreamState::Closing {
            return Ok(());
        }

        if packet.header.opcode == Opcode::Unset || packet.header.opcode.is_sequenced() {
            let mut packet = packet;
            packet.send_time = self.clock.now_seconds();

            if packet.header.opcode == Opcode::Unset {
                let (_, remote) = packet.header.get_ack_counters();
                packet.header.set_ack_counters(self.sequence_index, remote);

                if remote > 0 {
                    packet.header.opcode = Opcode::DatAck;
                    self.dat_ack_responses.insert(remote);
                    self.remote_sequence_index_acked = remote;
                } else {
                    packet.header.opcode = Opcode::Dat;
                }
            }

            self.sequence_index = sequence::next(self.sequence_index, self.config.max_ack_value);

            if self.send_queue.len() >= self.config.max_pending_packets {
                return Err(self.record(StreamError::protocol("send queue overflow")));
            }
            self.send_queue.push_back(packet);
            Ok(())
        } else {
            self.send_raw(&packet)
                .map_err(|err| self.record(err))
        }
    }

    /// Pop the next in-order delivered packet, if any.
    pub fn recv(&mut self) -> Option<ReliablePacket> {
        self.receive_queue.pop_front()
    }

    /// Consumer notification that the message carried in `ack_sequence` has
    /// been processed, releasing the matching acknowledgement.
    pub fn handled_packet(&mut self, ack_sequence: u32) -> Result<()> {
        if self.dat_ack_responses.remove(&ack_sequence) {
            // the acknowledgement already rode out on a DAT_ACK
            return Ok(());
        }

        // The bookkeeping knows whether the peer expects a DAT_ACK reply
        // here, but reference traffic always answers with a bare ACK.
        self.expected_dat_ack_responses.remove(&ack_sequence);
        self.send_ack(ack_sequence)
    }

    /// Advance the stream: drain the socket, deliver what is deliverable,
    /// retransmit what is overdue, flush the send window.
    ///
    /// Returns `Err` once the stream is terminal; all failures are sticky,
    /// and a completed graceful close keeps reporting [`StreamError::Closed`].
    pub fn pump(&mut self) -> Result<()> {
        if let Some(err) = &self.in_error {
            return Err(err.clone());
        }

        match self.pump_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                if err != StreamError::Closed {
                    warn!("stream entering error state: {}", err);
                    self.record(err.clone());
                }
                Err(err)
            }
        }
    }

    fn pump_inner(&mut self) -> Result<()> {
        // a graceful close completes once everything queued has gone out
        if self.state == StreamState::Closing && self.send_queue.is_empty() {
            debug!("connection closed");
            self.state = StreamState::Closed;
        }

        if self.state == StreamState::Closed {
            self.reset();
            return Err(StreamError::Closed);
        }

        self.udp.pump()?;

        // periodic SYN re-send; doubles as a NAT hole punch
        if self.state == StreamState::Connecting {
            let now = self.clock.now_seconds();
            if now - self.resend_syn_timer > self.config.resend_syn_interval {
                self.send_syn()?;
                self.resend_syn_timer = now;
            }
        }

        // give up on a graceful close that takes too long
        if self.close_timer > 0.0 && self.state == StreamState::Closing {
            let elapsed = self.clock.now_seconds() - self.close_timer;
            if elapsed > self.config.connection_close_timeout {
                debug!("graceful close took too long, assuming connection terminated");
                self.state = StreamState::Closed;
                return Err(StreamError::Closed);
            }
        }

        self.handle_incoming()?;
        self.handle_outgoing()
    }

    fn handle_incoming(&mut self) -> Result<()> {
        // accept everything currently waiting on the socket
        loop {
            let udp_packet = match self.udp.recv()? {
                Some(udp_packet) => udp_packet,
                None => break,
            };
            let packet = Self::decode_reliable_packet(&udp_packet)?;
            self.handle_incoming_packet(packet)?;
        }

        // apply as much of the pending queue as is now in sequence
        while let Some(head) = self.pending_receive_queue.first() {
            let (local, _) = head.header.get_ack_counters();
            if local != self.next_remote_sequence_index() {
                break;
            }

            trace!("processing next packet in sequence, {}", local);
            let packet = self.pending_receive_queue.remove(0);
            self.process_packet(packet)?;
            self.remote_sequence_index =
                sequence::next(self.remote_sequence_index, self.config.max_ack_value);
        }
        Ok(())
    }

    fn handle_incoming_packet(&mut self, packet: ReliablePacket) -> Result<()> {
        self.last_packet_received_time = self.clock.now_seconds();

        #[cfg(feature = "disassembly")]
        trace!("\n<< RECV\n{}", packet.disassemble());

        if !packet.header.opcode.is_sequenced() {
            return self.process_packet(packet);
        }

        if self.state != StreamState::Established {
            return Err(StreamError::protocol(format!(
                "sequenced {:?} received in state {:?}",
                packet.header.opcode, self.state
            )));
        }

        let max_ack = self.config.max_ack_value;
        let next_expected = self.next_remote_sequence_index();
        let (local, _) = packet.header.get_ack_counters();
        let gap = sequence::distance(next_expected, local, max_ack);

        let already_delivered = gap >= max_ack / 2;
        let already_pending = self
            .pending_receive_queue
            .iter()
            .any(|pending| pending.header.get_ack_counters().0 == local);

        if already_delivered || already_pending {
            // duplicate - the peer may be retransmitting because our ACK
            // got lost, so answer it again, throttled
            if self.can_resend_ack() {
                debug!("re-sending ack for duplicate packet {}", local);
                let acked = self.remote_sequence_index_acked;
                self.send_ack(acked)?;
            }
            return Ok(());
        }

        if gap > 0 && self.can_resend_ack() {
            debug!(
                "out-of-order packet {} ahead of {}, nudging peer with last ack",
                local, next_expected
            );
            let acked = self.remote_sequence_index_acked;
            self.send_ack(acked)?;
        }

        if self.pending_receive_queue.len() >= self.config.max_pending_packets {
            return Err(StreamError::protocol("pending receive queue overflow"));
        }
        let position = self.pending_receive_queue.partition_point(|pending| {
            sequence::distance(next_expected, pending.header.get_ack_counters().0, max_ack) < gap
        });
        self.pending_receive_queue.insert(position, packet);
        Ok(())
    }

    fn process_packet(&mut self, packet: ReliablePacket) -> Result<()> {
        match packet.header.opcode {
            Opcode::Syn => self.handle_syn(&packet),
            Opcode::SynAck => self.handle_syn_ack(&packet),
            Opcode::Dat => self.handle_dat(packet),
            Opcode::Hbt => self.handle_hbt(&packet),
            Opcode::Fin => self.handle_fin(&packet),
            Opcode::Rst => self.handle_rst(),
            Opcode::Ack => self.handle_ack(&packet),
            Opcode::Rack => self.handle_rack(),
            Opcode::DatAck => self.handle_dat_ack(packet),
            Opcode::FinAck => self.handle_fin_ack(),
            Opcode::Unset => Err(StreamError::protocol("Unset opcode reached dispatch")),
        }
    }

    fn handle_syn(&mut self, packet: &ReliablePacket) -> Result<()> {
        debug!("received SYN, answering handshake");
        self.state = StreamState::SynReceived;

        let (in_local, _) = packet.header.get_ack_counters();
        self.send_syn_ack(in_local)?;
        // the peer expects a bare ACK immediately after the SYN_ACK
        self.send_ack(in_local)
    }

    fn handle_syn_ack(&mut self, packet: &ReliablePacket) -> Result<()> {
        debug!("received SYN_ACK, answering handshake");
        self.state = StreamState::SynReceived;

        let (in_local, _) = packet.header.get_ack_counters();
        self.remote_sequence_index = in_local;
        self.send_ack(in_local)?;

        // SYN_ACK occupies a sequence slot without travelling the sequenced
        // send path, so the counter advances here
        self.sequence_index = sequence::next(self.sequence_index, self.config.max_ack_value);
        Ok(())
    }

    fn handle_ack(&mut self, packet: &ReliablePacket) -> Result<()> {
        if self.state == StreamState::SynReceived {
            debug!("received handshake ACK, connection established");
            self.state = StreamState::Established;
        }

        let (_, in_remote) = packet.header.get_ack_counters();
        self.sequence_index_acked = sequence::advance_ack(
            self.sequence_index_acked,
            in_remote,
            self.config.max_ack_value,
        );
        Ok(())
    }

    fn handle_hbt(&mut self, packet: &ReliablePacket) -> Result<()> {
        let (_, in_remote) = packet.header.get_ack_counters();
        self.sequence_index_acked = sequence::advance_ack(
            self.sequence_index_acked,
            in_remote,
            self.config.max_ack_value,
        );
        self.send_hbt()
    }

    fn handle_dat(&mut self, packet: ReliablePacket) -> Result<()> {
        let (in_local, _) = packet.header.get_ack_counters();
        self.expected_dat_ack_responses.insert(in_local);

        if self.receive_queue.len() >= self.config.max_pending_packets {
            return Err(StreamError::protocol("receive queue overflow"));
        }
        self.receive_queue.push_back(packet);

        self.send_ack(in_local)
    }

    fn handle_dat_ack(&mut self, packet: ReliablePacket) -> Result<()> {
        let (in_local, in_remote) = packet.header.get_ack_counters();
        self.sequence_index_acked = sequence::advance_ack(
            self.sequence_index_acked,
            in_remote,
            self.config.max_ack_value,
        );

        self.send_ack(in_local)?;

        if self.receive_queue.len() >= self.config.max_pending_packets {
            return Err(StreamError::protocol("receive queue overflow"));
        }
        self.receive_queue.push_back(packet);
        Ok(())
    }

    fn handle_fin(&mut self, packet: &ReliablePacket) -> Result<()> {
        debug!("received FIN, closing");
        let (in_local, _) = packet.header.get_ack_counters();
        self.send_fin_ack(in_local)?;
        self.state = StreamState::Closing;
        Ok(())
    }

    fn handle_fin_ack(&mut self) -> Result<()> {
        // not straight to Closed - the queues drain first
        self.state = StreamState::Closing;
        Ok(())
    }

    fn handle_rst(&mut self) -> Result<()> {
        debug!("received RST, resetting stream");
        self.state = StreamState::Listening;
        self.reset();
        Ok(())
    }

    fn handle_rack(&mut self) -> Result<()> {
        debug!("received RACK - ignoring");
        Ok(())
    }

    fn handle_outgoing(&mut self) -> Result<()> {
        let max_ack = self.config.max_ack_value;
        let acked = self.sequence_index_acked;

        // trim in-flight packets the peer has acknowledged
        self.retransmit_buffer.retain(|packet| {
            let (local, _) = packet.header.get_ack_counters();
            !sequence::is_acknowledged(local, acked, max_ack)
        });

        let now = self.clock.now_seconds();
        if !self.is_retransmitting {
            let aged = self
                .retransmit_buffer
                .iter()
                .filter(|packet| now - packet.send_time > self.config.retransmit_interval)
                .cloned()
                .collect::<Vec<_>>();
            for packet in aged {
                let (local, _) = packet.header.get_ack_counters();
                debug!("starting retransmit of unacknowledged packet {}", local);

                self.send_raw(&packet)?;
                self.is_retransmitting = true;
                self.retransmitting_index = local;
                self.retransmission_timer = now;
                self.retransmit_packet = Some(packet);
            }
        } else if sequence::is_acknowledged(self.retransmitting_index, acked, max_ack) {
            debug!("recovered from retransmit");
            self.is_retransmitting = false;
            self.retransmit_packet = None;
        } else if now - self.retransmission_timer > self.config.retransmit_cycle_interval {
            debug!("re-sending retransmission packet {}", self.retransmitting_index);
            self.retransmission_timer = now;
            if let Some(packet) = self.retransmit_packet.clone() {
                self.send_raw(&packet)?;
            }
        }

        // move fresh packets into flight while the window has room
        while !self.is_retransmitting
            && self.retransmit_buffer.len() < self.config.max_packets_in_flight
        {
            let Some(packet) = self.send_queue.pop_front() else {
                break;
            };
            self.send_raw(&packet)?;
            self.retransmit_buffer.push(packet);
        }
        Ok(())
    }

    fn send_syn(&mut self) -> Result<()> {
        let mut syn = ReliablePacket::with_payload(Opcode::Syn, SYN_PAYLOAD.to_vec());
        syn.header.set_ack_counters(self.sequence_index, 0);
        self.send(syn)
    }

    fn send_syn_ack(&mut self, remote_index: u32) -> Result<()> {
        let mut syn_ack = ReliablePacket::with_payload(Opcode::SynAck, SYN_ACK_PAYLOAD.to_vec());
        syn_ack.header.set_ack_counters(self.sequence_index, remote_index);
        self.send(syn_ack)?;

        self.remote_sequence_index = remote_index;
        // SYN_ACK occupies a sequence slot without travelling the sequenced
        // send path, so the counter advances here
        self.sequence_index = sequence::next(self.sequence_index, self.config.max_ack_value);
        Ok(())
    }

    fn send_ack(&mut self, remote_index: u32) -> Result<()> {
        let mut ack = ReliablePacket::new(Opcode::Ack);
        ack.header.set_ack_counters(0, remote_index);
        self.send(ack)?;

        self.remote_sequence_index_acked = remote_index;
        self.last_ack_send_time = self.clock.now_seconds();
        Ok(())
    }

    fn send_fin_ack(&mut self, remote_index: u32) -> Result<()> {
        let mut fin_ack = ReliablePacket::new(Opcode::FinAck);
        fin_ack.header.set_ack_counters(self.sequence_index, remote_index);
        self.send(fin_ack)
    }

    fn send_fin(&mut self) -> Result<()> {
        let mut fin = ReliablePacket::new(Opcode::Fin);
        fin.header.set_ack_counters(self.sequence_index, 0);
        self.send(fin)?;

        self.state = StreamState::Closing;
        self.close_timer = self.clock.now_seconds();
        Ok(())
    }

    fn send_hbt(&mut self) -> Result<()> {
        let mut hbt = ReliablePacket::new(Opcode::Hbt);
        hbt.header.set_ack_counters(0, self.remote_sequence_index_acked);
        self.send(hbt)
    }

    /// Frame and emit one packet, bypassing the queues.
    fn send_raw(&mut self, packet: &ReliablePacket) -> Result<()> {
        if packet.header.opcode == Opcode::Unset {
            return Err(StreamError::protocol("attempted to send Unset opcode"));
        }

        #[cfg(feature = "disassembly")]
        trace!("\n>> SENT\n{}", packet.disassemble());

        let mut frame = BytesMut::with_capacity(HEADER_LEN + packet.payload.len());
        packet.header.ser(&mut frame);
        frame.put_slice(&packet.payload);

        // the first datagram of a connection leads with the identity block
        let prefix = if packet.header.opcode == Opcode::Syn {
            Some(self.peer_id.as_str())
        } else {
            None
        };
        self.udp.send(&frame, prefix)
    }

    fn decode_reliable_packet(udp_packet: &UdpPacket) -> Result<ReliablePacket> {
        let mut buf: &[u8] = &udp_packet.payload;
        let header = PacketHeader::deser(&mut buf)?;
        Ok(ReliablePacket {
            header,
            payload: buf.to_vec(),
            send_time: 0.0,
        })
    }

    fn next_remote_sequence_index(&self) -> u32 {
        sequence::next(self.remote_sequence_index, self.config.max_ack_value)
    }

    fn can_resend_ack(&self) -> bool {
        self.clock.now_seconds() - self.last_ack_send_time > self.config.min_time_between_resend_ack
    }

    fn record(&mut self, err: StreamError) -> StreamError {
        if self.in_error.is_none() {
            self.in_error = Some(err.clone());
        }
        err
    }

    fn reset(&mut self) {
        self.sequence_index = START_SEQUENCE_INDEX;
        self.sequence_index_acked = 0;
        self.remote_sequence_index = 0;
        self.remote_sequence_index_acked = 0;

        self.send_queue.clear();
        self.retransmit_buffer.clear();
        self.pending_receive_queue.clear();
        self.receive_queue.clear();
        self.dat_ack_responses.clear();
        self.expected_dat_ack_responses.clear();

        self.is_retransmitting = false;
        self.retransmitting_index = 0;
        self.retransmit_packet = None;
        self.close_timer = 0.0;
    }
}
