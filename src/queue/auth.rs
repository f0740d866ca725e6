// Every process that joins a run holds the same pre-shared key. The registry
// proves nothing about itself: the TLS layer only encrypts, and trust comes
// from the peer answering a fresh random challenge with a MAC keyed by the
// shared secret. Anyone holding the key may enqueue and dequeue freely.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

const KEY_CONTEXT: &str = "nbm queue registry 2019-06 challenge key";

/// A fresh random challenge for the connecting peer.
#[derive(Archive, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Challenge(pub [u8; 32]);

impl Challenge {
    pub fn new() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Challenge(..)")
    }
}

/// MAC key derived from the configured secret string.
#[derive(Clone)]
pub struct SharedSecret {
    key: [u8; 32],
}

impl SharedSecret {
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
        }
    }

    /// The answer a peer holding the secret gives to `challenge`.
    pub fn answer(&self, challenge: &Challenge) -> [u8; 32] {
        *blake3::keyed_hash(&self.key, &challenge.0).as_bytes()
    }

    /// Constant-time check of a peer's answer.
    pub fn verify(&self, challenge: &Challenge, proof: [u8; 32]) -> bool {
        blake3::keyed_hash(&self.key, &challenge.0) == blake3::Hash::from(proof)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_verify_only_under_the_same_secret() {
        let ours = SharedSecret::new("correct horse");
        let theirs = SharedSecret::new("battery staple");
        let challenge = Challenge::new();
        assert!(ours.verify(&challenge, ours.answer(&challenge)));
        assert!(!ours.verify(&challenge, theirs.answer(&challenge)));
    }

    #[test]
    fn answers_are_bound_to_the_challenge() {
        let secret = SharedSecret::new("k");
        let first = Challenge::new();
        let second = Challenge::new();
        assert!(!secret.verify(&second, secret.answer(&first)));
    }
}
