use std::convert::TryFrom;

use md5;

/// One deterministic step of an OTP chain.
///
/// Implementations must be pure: the same input always produces the same output on every host.
pub trait RoundFunction: Send + Sync {
    fn digest(&self, value: u64) -> u64;

    /// Applies `digest` `rounds` times. `chain(v, 0) == v`.
    fn chain(&self, seed: u64, rounds: u64) -> u64 {
        let mut value = seed;
        for _ in 0..rounds {
            value = self.digest(value);
        }
        value
    }
}

/// The OTP-MD5 round from RFC 2289
///
/// The 64-bit value is hashed as its 8 little-endian bytes and the 128-bit MD5 digest is folded
/// back down to 64 bits by XORing its two little-endian halves. For example, folding the digest of
/// eight zero bytes:
///
/// $ printf '\0\0\0\0\0\0\0\0' | md5sum
///
/// 7dea362b3fac8e00956a4952a3d4f474  -
///
/// gives 0x747a789c797f80e8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Md5Fold;

impl RoundFunction for Md5Fold {
    #[inline]
    fn digest(&self, value: u64) -> u64 {
        fold(md5::compute(value.to_le_bytes()))
    }
}

fn fold(digest: md5::Digest) -> u64 {
    let bytes = digest.0;
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&bytes[..8]);
    high.copy_from_slice(&bytes[8..]);
    u64::from_le_bytes(low) ^ u64::from_le_bytes(high)
}

pub fn digest(value: u64) -> u64 {
    Md5Fold.digest(value)
}

pub fn chain(seed: u64, rounds: u64) -> u64 {
    Md5Fold.chain(seed, rounds)
}

/// Computes the OTP for `salt` and `passphrase` at sequence number `rounds`.
///
/// RFC 2289 lowercases the seed before hashing; callers that need that behaviour lowercase it
/// themselves since table tooling hashes the salt verbatim.
pub fn create(salt: &str, passphrase: &str, rounds: u64) -> u64 {
    let mut input = String::with_capacity(salt.len() + passphrase.len());
    input.push_str(salt);
    input.push_str(passphrase);
    chain(fold(md5::compute(input.as_bytes())), rounds)
}

/// Renders a chain value in RFC 2289 display order (its little-endian bytes as hex).
pub fn to_hex(value: u64) -> String {
    format!("{:016x}", value.swap_bytes())
}

/// Inverse of `to_hex`. Accepts exactly 16 hex digits of either case.
pub fn from_hex(text: &str) -> Option<u64> {
    if text.len() != 16 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(text, 16).ok().map(u64::swap_bytes)
}

/// Rounds per dispatch never exceed `u32::MAX`; this narrows a remaining round count.
pub(crate) fn dispatch_rounds(remaining: u64, limit: u32) -> u32 {
    u32::try_from(remaining).map_or(limit, |r| r.min(limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_of_zero_is_pinned() {
        assert_eq!(digest(0), 0x747a_789c_797f_80e8);
        assert_eq!(digest(digest(0)), 0x477f_28c5_89c6_f6cb);
    }

    #[test]
    fn rfc2289_md5_vectors() {
        assert_eq!(to_hex(create("test", "This is a test.", 0)), "9e876134d90499dd");
        assert_eq!(to_hex(create("test", "This is a test.", 1)), "7965e05436f5029f");
        assert_eq!(to_hex(create("test", "This is a test.", 99)), "50fe1962c4965880");
    }

    #[test]
    fn hex_round_trips_in_display_order() {
        let value = create("test", "This is a test.", 0);
        assert_eq!(value, 0xdd99_04d9_3461_879e);
        assert_eq!(from_hex("9E876134D90499DD"), Some(value));
        assert_eq!(from_hex("9e876134d90499d"), None);
        assert_eq!(from_hex("9e876134d90499dz"), None);
    }

    #[test]
    fn dispatch_rounds_clamps_to_limit() {
        assert_eq!(dispatch_rounds(5, 1024), 5);
        assert_eq!(dispatch_rounds(4096, 1024), 1024);
        assert_eq!(dispatch_rounds(u64::MAX, 7), 7);
    }

    proptest! {
        #[test]
        fn chain_zero_is_identity(v in any::<u64>()) {
            prop_assert_eq!(chain(v, 0), v);
        }

        #[test]
        fn chain_composes(v in any::<u64>(), a in 0u64..40, b in 0u64..40) {
            prop_assert_eq!(chain(v, a + b), chain(chain(v, a), b));
        }

        #[test]
        fn double_digest_is_chain_two(v in any::<u64>()) {
            prop_assert_eq!(digest(digest(v)), chain(v, 2));
        }
    }
}
