//! Content addressing for pipeline stages.
//!
//! An [`Identifier`] is a SHA-256 hash over the SHA-256 digests of each input,
//! so `["ab", "c"]` and `["a", "bc"]` never collide the way a hash of the joined
//! string would.

use serde::{Deserialize, Serialize};
use sha2::digest::Output;
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque 32-byte digest naming a stage output or an ordered list of inputs
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier([u8; 32]);

impl Identifier {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh identifier for sequences that carry none
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let digest: Output<Sha256> = self.0.into();
        format!("{:x}", digest)
    }
}

impl AsRef<[u8]> for Identifier {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", &self.to_hex()[..12])
    }
}

/// Hash-of-hashes over an ordered list of inputs.
///
/// Strings are hashed as their UTF-8 bytes.
pub fn fingerprint<I, B>(inputs: I) -> Identifier
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut outer = Sha256::new();
    for input in inputs {
        outer.update(Sha256::digest(input.as_ref()));
    }
    Identifier(outer.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint(["name", "0"]), fingerprint(["name", "0"]));
    }

    #[test]
    fn test_fingerprint_respects_boundaries() {
        assert_ne!(fingerprint(["ab", "c"]), fingerprint(["a", "bc"]));
        assert_ne!(fingerprint(["abc"]), fingerprint(["ab", "c"]));
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        assert_ne!(fingerprint(["x", "y"]), fingerprint(["y", "x"]));
    }

    #[test]
    fn test_single_element_change_changes_identifier() {
        let base: [&[u8]; 3] = [b"stage", b"1", &[0, 1, 2]];
        let changed: [&[u8]; 3] = [b"stage", b"1", &[0, 1, 3]];
        assert_ne!(fingerprint(base), fingerprint(changed));
    }

    #[test]
    fn test_empty_list_differs_from_empty_string() {
        assert_ne!(fingerprint(Vec::<&str>::new()), fingerprint([""]));
    }

    #[test]
    fn test_identifier_feeds_back_as_input() {
        let upstream = fingerprint(["raw"]);
        let downstream = fingerprint([upstream, fingerprint(["coeffs"])]);
        assert_ne!(downstream, upstream);
        assert_eq!(upstream.to_hex().len(), 64);
        assert_eq!(
            Identifier::from_bytes([0xab; 32]).to_hex(),
            "ab".repeat(32)
        );
        assert_eq!(upstream.to_string(), upstream.to_hex());
    }

    #[test]
    fn test_random_identifiers_differ() {
        assert_ne!(Identifier::random(), Identifier::random());
    }
}
