//! Sequence-counter arithmetic for the 24-bit ack space.
//!
//! Counters live in `0..max_ack` and wrap. The wire encodes them as 24-bit
//! big-endian values, so the production modulus is [`MAX_ACK_VALUE`]; tests
//! shrink the modulus to exercise wrap-around without sending millions of
//! packets.
//!
//! The acknowledgement comparisons preserve the protocol's observable
//! decision boundary: a candidate in the bottom quarter of the space is
//! treated as having wrapped past a reference in the top quarter. The
//! heuristic lives in exactly one place instead of being inlined at every
//! comparison site.

/// Largest value the 24-bit wire encoding can carry; counters are taken
/// modulo this.
pub const MAX_ACK_VALUE: u32 = (1 << 24) - 1;
pub const MAX_ACK_VALUE_TOP_QUART: u32 = MAX_ACK_VALUE / 4 * 3;
pub const MAX_ACK_VALUE_BOTTOM_QUART: u32 = MAX_ACK_VALUE / 4;

/// First sequence number a fresh stream assigns.
pub const START_SEQUENCE_INDEX: u32 = 1;

/// Next counter value, wrapping at `max_ack`.
pub fn next(seq: u32, max_ack: u32) -> u32 {
    (seq + 1) % max_ack
}

/// True when `candidate` should be read as having wrapped past `reference`.
pub fn has_wrapped(reference: u32, candidate: u32, max_ack: u32) -> bool {
    reference >= max_ack / 4 * 3 && candidate < max_ack / 4
}

/// Merge an incoming acknowledgement into the current high-water mark.
pub fn advance_ack(current: u32, incoming: u32, max_ack: u32) -> u32 {
    if has_wrapped(current, incoming, max_ack) {
        incoming
    } else {
        current.max(incoming)
    }
}

/// Does `acked` cover `seq`, accounting for wrap-around?
pub fn is_acknowledged(seq: u32, acked: u32, max_ack: u32) -> bool {
    seq <= acked || has_wrapped(seq, acked, max_ack)
}

/// Forward distance from `from` to `to` through the wrapping space.
pub fn distance(from: u32, to: u32, max_ack: u32) -> u32 {
    (to + max_ack - from) % max_ack
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(MAX_ACK_VALUE - 2, MAX_ACK_VALUE - 1)]
    #[case(MAX_ACK_VALUE - 1, 0)]
    fn test_next_wraps(#[case] seq: u32, #[case] expected: u32) {
        assert_eq!(next(seq, MAX_ACK_VALUE), expected);
    }

    #[rstest]
    #[case::natural_order(5, 9, 9)]
    #[case::old_ack_ignored(9, 5, 9)]
    #[case::equal(7, 7, 7)]
    #[case::wrapped(MAX_ACK_VALUE_TOP_QUART + 1, 3, 3)]
    #[case::top_but_candidate_not_bottom(MAX_ACK_VALUE_TOP_QUART + 1, MAX_ACK_VALUE_BOTTOM_QUART, MAX_ACK_VALUE_TOP_QUART + 1)]
    #[case::bottom_candidate_but_not_top(MAX_ACK_VALUE_TOP_QUART - 1, 3, MAX_ACK_VALUE_TOP_QUART - 1)]
    fn test_advance_ack(#[case] current: u32, #[case] incoming: u32, #[case] expected: u32) {
        assert_eq!(advance_ack(current, incoming, MAX_ACK_VALUE), expected);
    }

    #[rstest]
    #[case::below(3, 7, true)]
    #[case::equal(7, 7, true)]
    #[case::above(8, 7, false)]
    #[case::wrapped_ack(MAX_ACK_VALUE_TOP_QUART + 5, 2, true)]
    #[case::not_wrapped(MAX_ACK_VALUE_TOP_QUART - 1, MAX_ACK_VALUE_BOTTOM_QUART + 1, false)]
    fn test_is_acknowledged(#[case] seq: u32, #[case] acked: u32, #[case] expected: bool) {
        assert_eq!(is_acknowledged(seq, acked, MAX_ACK_VALUE), expected);
    }

    #[rstest]
    #[case(2, 2, 0)]
    #[case(2, 5, 3)]
    #[case(14, 2, 4)] // wraps through 15, 0, 1
    #[case(2, 1, 15)]
    fn test_distance_small_space(#[case] from: u32, #[case] to: u32, #[case] expected: u32) {
        assert_eq!(distance(from, to, 16), expected);
    }

    #[test]
    fn test_quart_boundaries_follow_modulus() {
        // shrunk modulus used by wrap tests elsewhere
        assert!(has_wrapped(12, 3, 16));
        assert!(!has_wrapped(11, 3, 16));
        assert!(!has_wrapped(12, 4, 16));
    }
}
