/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Stable content hashes used as identity for rules, sources and targets.

use std::fmt;
use std::fmt::Display;

use sha2::Digest;
use sha2::Sha256;

/// Fixed-length digest over a canonical serialisation. Equal inputs always
/// produce equal fingerprints, so a fingerprint can stand in for the value
/// itself during deduplication and renaming.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fingerprint of a single string, e.g. an opts value being folded
    /// into a rule name.
    pub fn of_text(tag: &str, text: &str) -> Fingerprint {
        let mut hasher = FingerprintHasher::new(tag);
        hasher.text(text);
        hasher.finish()
    }
}

impl Display for Fingerprint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Incremental canonical hasher. Every field is written length-prefixed so
/// that `["ab", "c"]` and `["a", "bc"]` cannot collide.
pub struct FingerprintHasher {
    sha: Sha256,
}

impl FingerprintHasher {
    pub fn new(tag: &str) -> FingerprintHasher {
        let mut hasher = FingerprintHasher { sha: Sha256::new() };
        hasher.text(tag);
        hasher
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.sha.update((bytes.len() as u64).to_be_bytes());
        self.sha.update(bytes);
    }

    pub fn text(&mut self, value: &str) {
        self.bytes(value.as_bytes());
    }

    pub fn opt_text(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.text("some");
                self.text(value);
            }
            None => self.text("none"),
        }
    }

    pub fn pair(&mut self, key: &str, value: &str) {
        self.text(key);
        self.text(value);
    }

    pub fn fingerprint(&mut self, fp: &Fingerprint) {
        self.text(fp.as_str());
    }

    pub fn finish(self) -> Fingerprint {
        let digest = self.sha.finalize();
        let mut out = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            out.push_str(&format!("{:02x}", byte));
        }
        Fingerprint(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_input_equal_fingerprint() {
        let a = Fingerprint::of_text("opts", "-O3 -g");
        let b = Fingerprint::of_text("opts", "-O3 -g");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn field_boundaries_matter() {
        let mut a = FingerprintHasher::new("t");
        a.text("ab");
        a.text("c");
        let mut b = FingerprintHasher::new("t");
        b.text("a");
        b.text("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn tag_distinguishes_kinds() {
        assert_ne!(
            Fingerprint::of_text("file", "x"),
            Fingerprint::of_text("target", "x")
        );
    }
}
