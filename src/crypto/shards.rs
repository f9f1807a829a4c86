//! Embedded key factors.
//!
//! Three independent shards, each stored under its own mask. None of them is a
//! key on its own and they are only ever unmasked into zeroizing buffers.

use zeroize::Zeroizing;

const SHARD_A_MASK: u8 = 0x5a;
const SHARD_A: [u8; 16] = [
    0x0b, 0x3f, 0x8e, 0x71, 0x2c, 0xd4, 0x69, 0x10, 0xa7, 0x5e, 0xf2, 0x33, 0x98, 0x46, 0xcb, 0x07,
];

// Rolling mask: byte i is masked with (i * 37 + 11).
const SHARD_B: [u8; 16] = [
    0x6e, 0x91, 0x2f, 0xd8, 0x44, 0xb3, 0x1a, 0xe5, 0x7c, 0x03, 0xaf, 0x58, 0xc6, 0x2d, 0x90, 0x7b,
];

const SALT_MASK: [u8; 4] = [0xc3, 0x1e, 0x77, 0xa9];
const SALT_SHARD: [u8; 16] = [
    0x93, 0x4f, 0x21, 0xfc, 0x08, 0xb6, 0x5d, 0xe2, 0x37, 0x8a, 0xd1, 0x64, 0x1f, 0xc8, 0x72, 0xae,
];

pub(crate) struct KeyShards {
    pub(crate) a: Zeroizing<Vec<u8>>,
    pub(crate) b: Zeroizing<Vec<u8>>,
    pub(crate) salt: Zeroizing<Vec<u8>>,
}

impl KeyShards {
    pub(crate) fn embedded() -> Self {
        let a = SHARD_A.iter().map(|b| b ^ SHARD_A_MASK).collect();
        let b = SHARD_B
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ ((i as u8).wrapping_mul(37).wrapping_add(11)))
            .collect();
        let salt = SALT_SHARD
            .iter()
            .zip(SALT_MASK.iter().cycle())
            .map(|(b, m)| b ^ m)
            .collect();
        Self {
            a: Zeroizing::new(a),
            b: Zeroizing::new(b),
            salt: Zeroizing::new(salt),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(a: &[u8], b: &[u8], salt: &[u8]) -> Self {
        Self {
            a: Zeroizing::new(a.to_vec()),
            b: Zeroizing::new(b.to_vec()),
            salt: Zeroizing::new(salt.to_vec()),
        }
    }

    pub(crate) fn missing_factor(&self) -> Option<&'static str> {
        if self.a.is_empty() {
            Some("shard-a")
        } else if self.b.is_empty() {
            Some("shard-b")
        } else if self.salt.is_empty() {
            Some("salt-shard")
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_shards_are_distinct() {
        let shards = KeyShards::embedded();
        assert_eq!(shards.a.len(), 16);
        assert_ne!(shards.a.as_slice(), shards.b.as_slice());
        assert_ne!(shards.a.as_slice(), shards.salt.as_slice());
        assert!(shards.missing_factor().is_none());
    }

    #[test]
    fn test_unmasking_is_not_identity() {
        let shards = KeyShards::embedded();
        assert_ne!(shards.a.as_slice(), &SHARD_A[..]);
        assert_ne!(shards.salt.as_slice(), &SALT_SHARD[..]);
    }
}
