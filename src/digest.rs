// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use ring::digest::{Context, Digest, SHA256};

/// Streaming hasher for whole-partition digests. The algorithm is fixed to
/// SHA-256 to match the per-partition digests shipped in update manifests.
pub struct Hasher {
    context: Context,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            context: Context::new(&SHA256),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.context.update(data);
    }

    /// Consume the hasher and return the final digest. Digests are compared
    /// byte-for-byte against manifest values.
    pub fn finalize(self) -> Digest {
        self.context.finish()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Hasher;

    const FOOBAR_SHA256: [u8; 32] = [
        0xc3, 0xab, 0x8f, 0xf1, 0x37, 0x20, 0xe8, 0xad, 0x90, 0x47, 0xdd, 0x39, 0x46, 0x6b, 0x3c,
        0x89, 0x74, 0xe5, 0x92, 0xc2, 0xfa, 0x38, 0x3d, 0x4a, 0x39, 0x60, 0x71, 0x4c, 0xae, 0xf0,
        0xc4, 0xf2,
    ];

    #[test]
    fn streaming_matches_one_shot() {
        let mut hasher = Hasher::new();
        hasher.update(b"foo");
        hasher.update(b"");
        hasher.update(b"bar");
        assert_eq!(hasher.finalize().as_ref(), FOOBAR_SHA256);

        let one_shot = ring::digest::digest(&ring::digest::SHA256, b"foobar");
        assert_eq!(one_shot.as_ref(), FOOBAR_SHA256);
    }
}
