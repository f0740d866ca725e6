//! Configuration digests. The master stamps one on every directive and a
//! servant only runs work planned against the configuration it loaded.

use std::fmt;

use serde::Serialize;

use crate::error::Result;

pub type Digest = [u8; 32];

/// Bytes shown in log lines; enough to tell two configurations apart.
const SHORT_LEN: usize = 6;

/// `blake3` over the canonical JSON form of `value`.
pub fn of_json<T: Serialize>(value: &T) -> Result<Digest> {
    Ok(*blake3::hash(&serde_json::to_vec(value)?).as_bytes())
}

/// The leading bytes of a digest as lower-case hex.
pub struct Short<'a>(&'a Digest);

pub fn short(digest: &Digest) -> Short<'_> {
    Short(digest)
}

impl fmt::Display for Short<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0[..SHORT_LEN]
            .iter()
            .try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl fmt::Debug for Short<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
