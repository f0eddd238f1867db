//! Nonce minting (§4.5, §9): a 64-character printable-ASCII secret drawn
//! from a cryptographically secure RNG. The original program used Python's
//! non-cryptographic `random.choice`; spec.md's Open Questions section
//! requires unpredictability here since the nonce is effectively a
//! capability token, so this uses `rand::rngs::OsRng` instead.

use rand::Rng;

const NONCE_LEN: usize = 64;

/// The alphabet matches Python's `string.printable` minus whitespace
/// control characters, which would be ambiguous over a line-oriented wire
/// protocol that has no framing. Printable, non-whitespace ASCII only.
const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Draws a 64-character nonce, retrying (per spec.md §4.5/§9) as long as
/// `collides` reports the candidate is already in use.
pub fn mint(mut collides: impl FnMut(&str) -> bool) -> String {
    let mut rng = rand::rngs::OsRng;
    loop {
        let candidate: String = (0..NONCE_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        if !collides(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn mints_64_printable_ascii_chars() {
        let token = mint(|_| false);
        assert_eq!(token.len(), NONCE_LEN);
        assert!(token.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn retries_on_collision() {
        let mut calls = 0;
        let token = mint(|_| {
            calls += 1;
            calls <= 3
        });
        assert_eq!(token.len(), NONCE_LEN);
        assert_eq!(calls, 4);
    }

    #[test]
    fn many_mints_are_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(mint(|_| false));
        }
        assert_eq!(seen.len(), 200);
    }
}
