//! End-to-end encryption: identity/ephemeral keys, the ephemeral key
//! exchange (CS-C/CS-S), and the Encrypted Channel built on top of it.

pub mod channel;
pub mod exchange;
pub mod keys;

use subtle::ConstantTimeEq;

/// Constant-time byte-slice equality, used for the broker's challenge check
/// and the allowlist membership check so neither leaks timing information
/// about where (or whether) a match occurred.
///
/// Slices of different length are unequal; the length comparison itself is
/// not constant-time, but both inputs here are always fixed-size (challenge
/// bytes, public keys), so no secret-dependent length ever reaches this
/// check.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_slices_match() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn different_slices_do_not_match() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn different_lengths_do_not_match() {
        assert!(!constant_time_eq(b"short", b"longer value"));
    }
}
