//! Sequence-number algebra for partner send/receive tracking (spec.md §4.3).
//!
//! A sequence number is a 16-bit value split into a session number (the high
//! `session_bits` bits) and a counter (the remaining low bits, which wrap).
//! Comparisons between two sequence numbers are only meaningful within the
//! counter field; the session number exists purely to make stale, pre-reset
//! traffic statistically unmatchable after a partner cleanup.

/// Disconnect scrambling constants from the reference implementation.
///
/// These are not cryptographic. They are deliberate, fixed bit patterns that
/// scatter in-flight sequence numbers across a session change so that a
/// packet from a stale session is exceedingly unlikely to collide with a
/// fresh one. Treated as a fixed part of the wire contract (spec.md §9).
pub const DISCONNECT_XOR_MATCH: u16 = 0xb0f0;
pub const DISCONNECT_XOR_FRAG: u16 = 0xcf0f;

/// Returns the bitmask covering the high `session_bits` bits of a sequence
/// number.
fn session_mask(session_bits: u32) -> u16 {
    debug_assert!(session_bits > 0 && session_bits < 16);
    !0u16 << (16 - session_bits)
}

/// Returns the bitmask covering the low counter bits of a sequence number.
fn counter_mask(session_bits: u32) -> u16 {
    !session_mask(session_bits)
}

/// Extracts the counter portion of a sequence number, masking out the
/// session bits.
pub fn counter(seq: u16, session_bits: u32) -> u16 {
    seq & counter_mask(session_bits)
}

/// Extracts the session number, right-shifted down to its own small integer
/// so two session numbers can be compared directly.
pub fn session_number(seq: u16, session_bits: u32) -> u16 {
    (seq & session_mask(session_bits)) >> (16 - session_bits)
}

/// The quantity a single session bump adds to a sequence number, i.e. one
/// unit in the session field.
pub fn session_one(session_bits: u32) -> u16 {
    1u16 << (16 - session_bits)
}

/// Resets the counter field to zero while preserving the session number.
///
/// This is used whenever a partner's receive sequence state must be forced
/// back to its wire-defined starting point without bumping the session
/// (e.g. the first connect request/reply from a never-before-seen partner
/// instance).
pub fn reset(seq: u16, session_bits: u32) -> u16 {
    seq & session_mask(session_bits)
}

/// Compares two sequence numbers within the counter field only, returning
/// the signed distance `a - b` as if the counter had infinite range (i.e.
/// modular/wrapping comparison, ala TCP sequence number arithmetic).
///
/// A positive result means `a` is ahead of `b`; negative means behind.
pub fn counter_distance(a: u16, b: u16, session_bits: u32) -> i32 {
    let bits = 16 - session_bits;
    let mask = (1u32 << bits) - 1;
    let a = u32::from(counter(a, session_bits));
    let b = u32::from(counter(b, session_bits));
    let diff = (a.wrapping_sub(b)) & mask;
    if diff > mask / 2 {
        diff as i32 - (mask as i32 + 1)
    } else {
        diff as i32
    }
}

/// `a <= b` in the modular counter space.
pub fn counter_le(a: u16, b: u16, session_bits: u32) -> bool {
    counter_distance(a, b, session_bits) <= 0
}

/// Applies the disconnect XOR scramble and bumps the session number by one
/// unit on both receive sequence counters (spec.md §4.3, §4.4 step 10).
pub fn disconnect_scramble(
    next_match_recv_seq: u16,
    next_frag_recv_seq: u16,
    session_bits: u32,
) -> (u16, u16) {
    let one = session_one(session_bits);
    let match_seq = (next_match_recv_seq ^ counter(DISCONNECT_XOR_MATCH, session_bits))
        .wrapping_add(one);
    let frag_seq =
        (next_frag_recv_seq ^ counter(DISCONNECT_XOR_FRAG, session_bits)).wrapping_add(one);
    (match_seq, frag_seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BITS: u32 = 6;

    #[test]
    fn reset_preserves_session_number() {
        let seq = (3u16 << (16 - BITS)) | 0x2a;
        let reset_seq = reset(seq, BITS);
        assert_eq!(session_number(reset_seq, BITS), 3);
        assert_eq!(counter(reset_seq, BITS), 0);
    }

    #[test]
    fn counter_wraps() {
        let max_counter = (1u16 << (16 - BITS)) - 1;
        let a = max_counter;
        let b = 0;
        // a is one step behind b, having just wrapped
        assert_eq!(counter_distance(b, a, BITS), 1);
        assert!(counter_le(a, b, BITS) || a == b);
    }

    #[test]
    fn disconnect_scramble_bumps_session_and_is_idempotent_in_shape() {
        let (m1, f1) = disconnect_scramble(0, 0, BITS);
        assert_eq!(session_number(m1, BITS), 1);
        assert_eq!(session_number(f1, BITS), 1);
        let (m2, f2) = disconnect_scramble(m1, f1, BITS);
        assert_eq!(session_number(m2, BITS), 2);
        assert_eq!(session_number(f2, BITS), 2);
    }
}
