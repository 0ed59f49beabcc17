// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, mem, ops::Range};

use num_traits::ToPrimitive;
use ring::digest::{Algorithm, Context};
use thiserror::Error;

use crate::util;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hashing algorithm not supported: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("Expected {expected} bytes of input data, but {actual} were fed")]
    TooMuchData { expected: u64, actual: u64 },
    #[error("Expected {expected} bytes of input data, but only {actual} were fed")]
    MissingData { expected: u64, actual: u64 },
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
}

type Result<T> = std::result::Result<T, Error>;

/// Look up the digest implementation for an algorithm name from an update
/// manifest.
pub fn ring_algorithm(name: &str) -> Result<&'static Algorithm> {
    match name {
        "sha256" => Ok(&ring::digest::SHA256),
        "sha512" => Ok(&ring::digest::SHA512),
        _ => Err(Error::UnsupportedHashAlgorithm(name.to_owned())),
    }
}

/// Compute the list of offset ranges that each level occupies in the hash
/// tree data. The items are returned with the bottom level's offsets first in
/// the list. Note that the bottom level is stored at the end of the hash tree
/// data.
fn compute_level_offsets(
    block_size: u32,
    algorithm: &'static Algorithm,
    image_size: u64,
) -> Result<Vec<Range<usize>>> {
    let digest_size = algorithm.output_len().next_power_of_two();
    let mut ranges = vec![];
    let mut level_size = image_size;

    while level_size > u64::from(block_size) {
        let blocks = level_size.div_ceil(u64::from(block_size));
        level_size = blocks
            .checked_mul(digest_size as u64)
            .and_then(|s| util::round_up(s, u64::from(block_size)))
            .ok_or_else(|| Error::FieldOutOfBounds("level_size"))?;

        // Depending on the chosen block size, the original image size could
        // overflow a usize without the first level's size doing the same.
        let level_size_usize = level_size
            .to_usize()
            .ok_or_else(|| Error::FieldOutOfBounds("level_size"))?;

        ranges.push(0..level_size_usize);
    }

    // The hash tree puts the leaves at the end.
    let mut offset = 0;
    for range in ranges.iter_mut().rev() {
        let level_size = range.end - range.start;
        range.start += offset;
        range.end += offset;
        offset += level_size;
    }

    Ok(ranges)
}

/// Hash one completed level into the level above it. Level data is always a
/// multiple of the block size; the trailing zeros from padding are hashed
/// like any other bytes.
fn hash_level(salted_context: &Context, input: &[u8], block_size: usize, level_data: &mut [u8]) {
    let algorithm = salted_context.algorithm();
    let digest_padding = algorithm.output_len().next_power_of_two() - algorithm.output_len();
    let mut level_data = level_data;

    for block in input.chunks(block_size) {
        let mut context = salted_context.clone();
        context.update(block);

        let digest = context.finish();

        level_data[..digest.as_ref().len()].copy_from_slice(digest.as_ref());
        level_data = &mut level_data[digest.as_ref().len()..];

        level_data[..digest_padding].fill(0);
        level_data = &mut level_data[digest_padding..];
    }
}

/// A completed hash tree: the root digest and the serialized tree levels,
/// upper levels first.
#[derive(Debug)]
pub struct HashTree {
    pub root_digest: Vec<u8>,
    pub data: Vec<u8>,
}

/// Incrementally builds a dm-verity hash tree from input data that arrives in
/// order, without re-reading any of it. The leaf level is filled as data is
/// fed; [`Self::finish`] derives the upper levels from the leaves alone, so
/// peak memory is bounded by the size of the serialized tree.
pub struct HashTreeBuilder {
    block_size: usize,
    data_size: u64,
    data_fed: u64,
    salted_context: Context,
    level_offsets: Vec<Range<usize>>,
    tree: Vec<u8>,
    leaf_pos: usize,
    block_context: Context,
    block_filled: usize,
}

impl fmt::Debug for HashTreeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTreeBuilder")
            .field("block_size", &self.block_size)
            .field("data_size", &self.data_size)
            .field("data_fed", &self.data_fed)
            .field("level_offsets", &self.level_offsets)
            .field("tree", &self.tree)
            .field("leaf_pos", &self.leaf_pos)
            .field("block_filled", &self.block_filled)
            .finish_non_exhaustive()
    }
}

impl HashTreeBuilder {
    pub fn new(
        block_size: u32,
        algorithm: &'static Algorithm,
        salt: &[u8],
        data_size: u64,
    ) -> Result<Self> {
        // A level must shrink as the tree is climbed or else it never
        // converges to a root.
        let digest_size = algorithm.output_len().next_power_of_two();
        if block_size == 0 || (block_size as usize) < 2 * digest_size {
            return Err(Error::FieldOutOfBounds("block_size"));
        }

        let mut salted_context = Context::new(algorithm);
        salted_context.update(salt);

        let level_offsets = compute_level_offsets(block_size, algorithm, data_size)?;
        let tree_size = level_offsets.first().map(|r| r.end).unwrap_or(0);
        let leaf_pos = level_offsets.first().map(|r| r.start).unwrap_or(0);

        let block_context = salted_context.clone();

        Ok(Self {
            block_size: block_size as usize,
            data_size,
            data_fed: 0,
            salted_context,
            level_offsets,
            tree: vec![0u8; tree_size],
            leaf_pos,
            block_context,
            block_filled: 0,
        })
    }

    /// Size of the serialized tree for the given parameters. Data no larger
    /// than one block has no tree at all.
    pub fn calculate_size(
        block_size: u32,
        algorithm: &'static Algorithm,
        data_size: u64,
    ) -> Result<u64> {
        let offsets = compute_level_offsets(block_size, algorithm, data_size)?;

        Ok(offsets.first().map(|r| r.end).unwrap_or(0) as u64)
    }

    /// Finish the digest of the current block and append it to the leaf
    /// level. Each tree node is padded to a power of two.
    fn push_digest(&mut self) {
        let algorithm = self.salted_context.algorithm();
        let digest_padding = algorithm.output_len().next_power_of_two() - algorithm.output_len();

        let context = mem::replace(&mut self.block_context, self.salted_context.clone());
        let digest = context.finish();

        self.tree[self.leaf_pos..self.leaf_pos + digest.as_ref().len()]
            .copy_from_slice(digest.as_ref());
        // The padding bytes were zero-initialized.
        self.leaf_pos += digest.as_ref().len() + digest_padding;
    }

    /// Feed the next chunk of input data. Chunks are processed in order; the
    /// total must eventually equal the data size given to [`Self::new`].
    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        let data_fed = self.data_fed + data.len() as u64;
        if data_fed > self.data_size {
            return Err(Error::TooMuchData {
                expected: self.data_size,
                actual: data_fed,
            });
        }
        self.data_fed = data_fed;

        if self.level_offsets.is_empty() {
            // Input no larger than one block is hashed directly, unpadded.
            self.block_context.update(data);
            return Ok(());
        }

        while !data.is_empty() {
            let n = data.len().min(self.block_size - self.block_filled);
            self.block_context.update(&data[..n]);
            self.block_filled += n;
            data = &data[n..];

            if self.block_filled == self.block_size {
                self.push_digest();
                self.block_filled = 0;
            }
        }

        Ok(())
    }

    /// Build the upper levels from the completed leaf level and return the
    /// tree.
    pub fn finish(mut self) -> Result<HashTree> {
        if self.data_fed != self.data_size {
            return Err(Error::MissingData {
                expected: self.data_size,
                actual: self.data_fed,
            });
        }

        if self.level_offsets.is_empty() {
            let root_digest = self.block_context.finish().as_ref().to_vec();

            return Ok(HashTree {
                root_digest,
                data: self.tree,
            });
        }

        // An undersized final block is hashed as if zero-padded to the full
        // block size.
        if self.block_filled > 0 {
            let mut remain = self.block_size - self.block_filled;
            while remain > 0 {
                let n = remain.min(util::ZEROS.len());
                self.block_context.update(&util::ZEROS[..n]);
                remain -= n;
            }

            self.push_digest();
            self.block_filled = 0;
        }

        // Hash each level into the one above it. The leaf level sits at the
        // end of the tree data, so every level reads from the region directly
        // after its own.
        for i in 1..self.level_offsets.len() {
            let level_range = self.level_offsets[i].clone();
            let prev_range = self.level_offsets[i - 1].clone();
            let prev_size = prev_range.end - prev_range.start;

            let (front, back) = self.tree.split_at_mut(level_range.end);
            let level_data = &mut front[level_range];
            let prev_data = &back[..prev_size];

            hash_level(&self.salted_context, prev_data, self.block_size, level_data);
        }

        let mut context = self.salted_context.clone();
        context.update(&self.tree[self.level_offsets.last().unwrap().clone()]);
        let root_digest = context.finish().as_ref().to_vec();

        Ok(HashTree {
            root_digest,
            data: self.tree,
        })
    }
}
