//! Encrypted URL fragments.
//!
//! A bootstrap URL is cut into pieces, each piece encrypted under its own
//! segment key and stored in a slot chosen by a permutation table. Only the
//! right table and key rebuild a string that passes URL validation.
//!
//! # Segment keys
//! `s0 = SHA-256(key)`, and before logical position `i` the chain advances
//! `s = SHA-256(s)`. The segment key is `HMAC-SHA256(key, s)` and keys a
//! BLAKE3 XOF keystream that is XORed over the piece.
//!
//! Pieces carry no tag. A wrong order or key yields garbage that fails
//! validation as a whole.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{hmac_sha256, sha256};

const MIN_URL_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    /// Reassembled output is not a usable URL, or the input cannot be read.
    #[error("Fragment validation failed: {0}")]
    Validation(&'static str),
    /// The order table is not a permutation of the fragment slots.
    #[error("Order table is not a permutation of {0} slots")]
    InvalidOrder(usize),
}

/// One encrypted piece, stored in slot `order_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlFragment {
    pub ciphertext_hex: String,
    pub order_index: usize,
}

/// Everything needed to rebuild one URL, apart from the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentSet {
    pub fragments: Vec<UrlFragment>,
    pub order: Vec<usize>,
}

/// Cheap plausibility check applied to every reassembled URL.
pub fn is_plausible_url(candidate: &str) -> bool {
    (candidate.starts_with("http://") || candidate.starts_with("https://"))
        && candidate.len() > MIN_URL_LEN
        && candidate.contains('.')
}

struct SegmentKeys {
    key: Zeroizing<Vec<u8>>,
    chain: Zeroizing<[u8; 32]>,
}

impl SegmentKeys {
    fn new(key: &[u8]) -> Self {
        Self {
            key: Zeroizing::new(key.to_vec()),
            chain: Zeroizing::new(sha256(key)),
        }
    }

    fn next_key(&mut self) -> Zeroizing<[u8; 32]> {
        *self.chain = sha256(self.chain.as_slice());
        Zeroizing::new(hmac_sha256(&self.key, self.chain.as_slice()))
    }
}

fn apply_keystream(key: &[u8; 32], data: &mut [u8]) {
    let mut keystream = Zeroizing::new(vec![0u8; data.len()]);
    blake3::Hasher::new_keyed(key).finalize_xof().fill(&mut keystream);
    for (byte, k) in data.iter_mut().zip(keystream.iter()) {
        *byte ^= k;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FragmentAssembler;

impl FragmentAssembler {
    pub fn new() -> Self {
        Self
    }

    pub fn assemble_set(&self, set: &FragmentSet, key: &[u8]) -> Result<String, FragmentError> {
        self.assemble(&set.fragments, &set.order, key)
    }

    /// Rebuilds the URL. Position `i` reads slot `order[i] mod N`.
    pub fn assemble(
        &self,
        fragments: &[UrlFragment],
        order: &[usize],
        key: &[u8],
    ) -> Result<String, FragmentError> {
        if fragments.is_empty() || order.is_empty() {
            return Err(FragmentError::Validation("no fragments"));
        }
        if key.is_empty() {
            return Err(FragmentError::Validation("empty key"));
        }

        let mut slots: Vec<&UrlFragment> = fragments.iter().collect();
        slots.sort_by_key(|f| f.order_index);

        let mut keys = SegmentKeys::new(key);
        let mut assembled = Zeroizing::new(Vec::new());
        for &slot in order {
            let fragment = slots[slot % slots.len()];
            let mut piece = Zeroizing::new(
                hex::decode(fragment.ciphertext_hex.trim())
                    .map_err(|_| FragmentError::Validation("fragment is not hex"))?,
            );
            let segment_key = keys.next_key();
            apply_keystream(&segment_key, &mut piece);
            assembled.extend_from_slice(&piece);
        }

        let url = std::str::from_utf8(&assembled)
            .map_err(|_| FragmentError::Validation("not utf-8"))?;
        if !is_plausible_url(url) {
            return Err(FragmentError::Validation("not a url"));
        }
        Ok(url.to_string())
    }

    /// Cuts `url` into `pieces` and encrypts piece `i` into slot `order[i]`.
    ///
    /// Unlike assembly, sealing requires `order` to be an exact permutation
    /// of `0..pieces`.
    pub fn split(
        &self,
        url: &str,
        pieces: usize,
        order: &[usize],
        key: &[u8],
    ) -> Result<FragmentSet, FragmentError> {
        if !is_plausible_url(url) {
            return Err(FragmentError::Validation("not a url"));
        }
        if key.is_empty() {
            return Err(FragmentError::Validation("empty key"));
        }
        if pieces == 0 || pieces > url.len() || !is_permutation(order, pieces) {
            return Err(FragmentError::InvalidOrder(pieces));
        }

        let bytes = url.as_bytes();
        let mut slots: Vec<Option<UrlFragment>> = vec![None; pieces];
        let mut keys = SegmentKeys::new(key);
        for (position, &slot) in order.iter().enumerate() {
            let start = position * bytes.len() / pieces;
            let end = (position + 1) * bytes.len() / pieces;
            let mut piece = Zeroizing::new(bytes[start..end].to_vec());
            let segment_key = keys.next_key();
            apply_keystream(&segment_key, &mut piece);
            slots[slot] = Some(UrlFragment {
                ciphertext_hex: hex::encode(piece.as_slice()),
                order_index: slot,
            });
        }

        Ok(FragmentSet {
            fragments: slots.into_iter().flatten().collect(),
            order: order.to_vec(),
        })
    }

    /// Seals with a freshly shuffled order table.
    pub fn split_shuffled(&self, url: &str, pieces: usize, key: &[u8]) -> Result<FragmentSet, FragmentError> {
        let mut order: Vec<usize> = (0..pieces).collect();
        order.shuffle(&mut rand::thread_rng());
        self.split(url, pieces, &order, key)
    }

    /// A well-formed URL that leads nowhere interesting.
    pub fn fabricated_endpoint(&self) -> String {
        const HOSTS: [&str; 4] = [
            "https://example.com",
            "https://cdn.example.org",
            "https://static.example.net",
            "https://assets.example.com",
        ];
        const PATHS: [&str; 3] = ["resources", "static/config", "data"];
        let mut rng = rand::thread_rng();
        let host = HOSTS.choose(&mut rng).copied().unwrap_or(HOSTS[0]);
        let path = PATHS.choose(&mut rng).copied().unwrap_or(PATHS[0]);
        format!("{}/{}/config_{}.json", host, path, rng.gen_range(1..1000))
    }
}

fn is_permutation(order: &[usize], n: usize) -> bool {
    if order.len() != n {
        return false;
    }
    let mut seen = vec![false; n];
    for &i in order {
        if i >= n || seen[i] {
            return false;
        }
        seen[i] = true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://bootstrap.cfg-mirror.net/v2/manifest.json";
    const KEY: [u8; 32] = [0x42; 32];
    const ORDER: [usize; 8] = [3, 1, 5, 0, 7, 2, 6, 4];

    #[test]
    fn test_reconstruct_with_permutation() {
        let asm = FragmentAssembler::new();
        let set = asm.split(URL, 8, &ORDER, &KEY).unwrap();
        assert_eq!(set.fragments.len(), 8);
        assert_eq!(asm.assemble_set(&set, &KEY).unwrap(), URL);
    }

    #[test]
    fn test_identity_order_fails_validation() {
        let asm = FragmentAssembler::new();
        let set = asm.split(URL, 8, &ORDER, &KEY).unwrap();
        let identity: Vec<usize> = (0..8).collect();
        assert!(matches!(
            asm.assemble(&set.fragments, &identity, &KEY),
            Err(FragmentError::Validation(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails_validation() {
        let asm = FragmentAssembler::new();
        let set = asm.split(URL, 8, &ORDER, &KEY).unwrap();
        assert!(matches!(asm.assemble_set(&set, &[0x43; 32]), Err(FragmentError::Validation(_))));
    }

    #[test]
    fn test_fragment_storage_order_does_not_matter() {
        let asm = FragmentAssembler::new();
        let mut set = asm.split(URL, 8, &ORDER, &KEY).unwrap();
        set.fragments.reverse();
        assert_eq!(asm.assemble_set(&set, &KEY).unwrap(), URL);
    }

    #[test]
    fn test_split_rejects_non_permutation() {
        let asm = FragmentAssembler::new();
        assert_eq!(asm.split(URL, 3, &[0, 0, 1], &KEY), Err(FragmentError::InvalidOrder(3)));
        assert_eq!(asm.split(URL, 3, &[0, 1], &KEY), Err(FragmentError::InvalidOrder(3)));
        assert_eq!(asm.split(URL, 3, &[0, 1, 3], &KEY), Err(FragmentError::InvalidOrder(3)));
        assert!(matches!(asm.split("ftp://x", 1, &[0], &KEY), Err(FragmentError::Validation(_))));
    }

    #[test]
    fn test_bad_input_is_validation() {
        let asm = FragmentAssembler::new();
        assert!(matches!(asm.assemble(&[], &[0], &KEY), Err(FragmentError::Validation(_))));
        let bogus = [UrlFragment { ciphertext_hex: "zz".into(), order_index: 0 }];
        assert!(matches!(asm.assemble(&bogus, &[0], &KEY), Err(FragmentError::Validation(_))));
    }

    #[test]
    fn test_shuffled_round_trip() {
        let asm = FragmentAssembler::new();
        let set = asm.split_shuffled(URL, 5, &KEY).unwrap();
        assert_eq!(asm.assemble_set(&set, &KEY).unwrap(), URL);
    }

    #[test]
    fn test_url_validator() {
        assert!(is_plausible_url("https://a.example"));
        assert!(is_plausible_url("http://cfg.io/x"));
        assert!(!is_plausible_url("https://ab"));
        assert!(!is_plausible_url("https://localhost"));
        assert!(!is_plausible_url("gopher://example.com"));
    }

    #[test]
    fn test_fabricated_endpoint_is_plausible() {
        let asm = FragmentAssembler::new();
        for _ in 0..20 {
            assert!(is_plausible_url(&asm.fabricated_endpoint()));
        }
    }
}
