//! Short, collision-resistant identifiers for event names.

use uuid::Uuid;

/// Lowercase alphanumerics only: the ids end up inside object names, which
/// must be valid DNS-1123 subdomains.
pub const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub const DEFAULT_LEN: usize = 10;

/// Generator for short event-name suffixes.
///
/// Each call draws fresh entropy from a v4 uuid, so process restarts never
/// replay a sequence. Ten characters over a 36-symbol alphabet is ~51 bits:
/// collisions within one cluster's event volume are rare enough that the
/// write path is left to surface them as a store conflict.
#[derive(Debug, Clone)]
pub struct ShortId {
    len: usize,
}

impl Default for ShortId {
    fn default() -> Self {
        Self::new(DEFAULT_LEN)
    }
}

impl ShortId {
    pub fn new(len: usize) -> Self {
        Self { len: len.max(1) }
    }

    pub fn generate(&self) -> String {
        let mut bits = Uuid::new_v4().as_u128();
        let mut out = String::with_capacity(self.len);
        for _ in 0..self.len {
            let idx = (bits % ALPHABET.len() as u128) as usize;
            out.push(ALPHABET[idx] as char);
            bits /= ALPHABET.len() as u128;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_dns_safe_and_sized() {
        let sid = ShortId::default();
        for _ in 0..1000 {
            let id = sid.generate();
            assert_eq!(id.len(), DEFAULT_LEN);
            assert!(id.bytes().all(|b| ALPHABET.contains(&b)), "id={}", id);
        }
    }

    #[test]
    fn no_repeats_over_a_large_run() {
        let sid = ShortId::default();
        let mut seen = HashSet::with_capacity(100_000);
        for _ in 0..100_000 {
            assert!(seen.insert(sid.generate()), "short id collision");
        }
    }

    #[test]
    fn length_is_clamped_to_at_least_one() {
        let sid = ShortId::new(0);
        assert_eq!(sid.generate().len(), 1);
    }
}
