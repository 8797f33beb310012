use anyhow::bail;

use crate::sequence::MAX_ACK_VALUE;

/// Seconds an in-flight packet may go unacknowledged before the stream
/// enters retransmit mode.
pub const RETRANSMIT_INTERVAL: f64 = 1.0;

/// Seconds between re-sends of the packet currently being retransmitted.
pub const RETRANSMIT_CYCLE_INTERVAL: f64 = 0.3;

/// Seconds between SYN re-sends while connecting. The periodic resend doubles
/// as a NAT hole-punch.
pub const RESEND_SYN_INTERVAL: f64 = 0.6;

/// Throttle for re-acknowledging duplicate or out-of-order packets.
pub const MIN_TIME_BETWEEN_RESEND_ACK: f64 = 0.3;

/// Upper bound on unacknowledged sequenced packets.
pub const MAX_PACKETS_IN_FLIGHT: usize = 16;

/// Seconds a graceful close may take before the stream is forced shut.
pub const CONNECTION_CLOSE_TIMEOUT: f64 = 3.0;

/// Idle cutoff the layer above applies to `seconds_since_last_packet`.
pub const CLIENT_TIMEOUT: f64 = 30.0;

/// Default cap on any single stream-owned queue.
pub const MAX_PENDING_PACKETS: usize = 4096;

/// Per-stream tunables.
///
/// The defaults match the reference protocol; tests shrink `max_ack_value`
/// to exercise sequence wrap-around cheaply.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Modulus of the sequence space. The wire encoding is 24 bits, so this
    /// must never exceed [`MAX_ACK_VALUE`].
    pub max_ack_value: u32,
    pub retransmit_interval: f64,
    pub retransmit_cycle_interval: f64,
    pub resend_syn_interval: f64,
    pub min_time_between_resend_ack: f64,
    pub max_packets_in_flight: usize,
    pub connection_close_timeout: f64,
    pub client_timeout: f64,
    /// Streams are dropped to an error state when a send, pending-receive or
    /// receive queue grows past this, rather than buffering without bound.
    pub max_pending_packets: usize,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            max_ack_value: MAX_ACK_VALUE,
            retransmit_interval: RETRANSMIT_INTERVAL,
            retransmit_cycle_interval: RETRANSMIT_CYCLE_INTERVAL,
            resend_syn_interval: RESEND_SYN_INTERVAL,
            min_time_between_resend_ack: MIN_TIME_BETWEEN_RESEND_ACK,
            max_packets_in_flight: MAX_PACKETS_IN_FLIGHT,
            connection_close_timeout: CONNECTION_CLOSE_TIMEOUT,
            client_timeout: CLIENT_TIMEOUT,
            max_pending_packets: MAX_PENDING_PACKETS,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_ack_value < 8 || self.max_ack_value > MAX_ACK_VALUE {
            bail!(
                "max_ack_value must be in 8..={}, was {}",
                MAX_ACK_VALUE,
                self.max_ack_value
            );
        }
        if self.max_packets_in_flight == 0 {
            bail!("max_packets_in_flight must be at least 1");
        }
        if self.max_packets_in_flight as u32 >= self.max_ack_value / 4 {
            bail!("max_packets_in_flight must be well below the ack space to keep wrap comparisons unambiguous");
        }
        if self.max_pending_packets == 0 {
            bail!("max_pending_packets must be at least 1");
        }
        Ok(())
    }
}
