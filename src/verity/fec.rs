/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io::{self, SeekFrom},
    sync::atomic::AtomicBool,
};

use num_traits::ToPrimitive;
use thiserror::Error;

use crate::{
    stream::{self, ReadWriteSeek},
    verity::rs,
};

// Not to be confused with the 4096-byte verity block size.
const RS_BLOCK_SIZE: u32 = 255;

#[derive(Debug, Error)]
pub enum Error {
    #[error("FEC with parity byte count of {0} is not supported")]
    UnsupportedParity(u32),
    #[error("Cannot calculate FEC for empty data")]
    InputEmpty,
    #[error("Input size ({input}) is not a multiple of FEC block size ({block})")]
    NotBlockAligned { input: u64, block: u32 },
    #[error("FEC should have size {expected} for input size {input}, but has size {actual}")]
    InvalidFecSize {
        input: u64,
        expected: u64,
        actual: u64,
    },
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A small wrapper around a byte array to represent a single Reed-Solomon
/// codeword for any `RS(255, K)`.
struct Codeword {
    data: [u8; 255],
    rs_k: u8,
}

impl Codeword {
    fn new(rs_k: u8) -> Self {
        Self {
            data: [0u8; 255],
            rs_k,
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..usize::from(self.rs_k)]
    }

    fn parity(&self) -> &[u8] {
        &self.data[usize::from(self.rs_k)..]
    }

    fn parity_mut(&mut self) -> &mut [u8] {
        &mut self.data[usize::from(self.rs_k)..]
    }

    fn all(&self) -> &[u8] {
        &self.data
    }

    fn all_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A type for generating FEC parity data over a region of a partition and
/// writing it to its reserved range on the same descriptor. The
/// implementation uses dm-verity's interleaving access pattern.
///
/// The interleaving access pattern can be visualized by placing the region
/// offsets in a two-dimensional grid, `rs_k` rows tall, where row-by-row
/// traversal is a sequential read of the region. Each column forms the data
/// portion of one RS codeword, and the grid is `rounds` blocks wide. Offsets
/// that fall outside of the region are treated as if they contain `\0`.
///
/// Encoding is performed one round at a time so that peak memory stays at one
/// `rs_k x block_size` grid regardless of the region size.
#[derive(Debug)]
pub struct FecEncoder {
    data_offset: u64,
    data_size: u64,
    fec_offset: u64,
    block_size: u32,
    rs_k: u8,
    rounds: u64,
}

impl FecEncoder {
    pub fn new(
        data_offset: u64,
        data_size: u64,
        fec_offset: u64,
        fec_size: u64,
        fec_roots: u32,
        block_size: u32,
    ) -> Result<Self> {
        if data_size == 0 {
            return Err(Error::InputEmpty);
        } else if data_size % u64::from(block_size) != 0 {
            return Err(Error::NotBlockAligned {
                input: data_size,
                block: block_size,
            });
        }

        let roots = fec_roots
            .to_u8()
            .filter(|r| *r > 0 && u32::from(*r) < RS_BLOCK_SIZE)
            .ok_or(Error::UnsupportedParity(fec_roots))?;
        let rs_k = RS_BLOCK_SIZE as u8 - roots;
        if !rs::FN_ENCODE.contains_key(&rs_k) {
            return Err(Error::UnsupportedParity(fec_roots));
        }

        let blocks = data_size.div_ceil(u64::from(block_size));
        let rounds = blocks.div_ceil(u64::from(rs_k));

        let expected_fec_size = rounds
            .checked_mul(u64::from(roots))
            .and_then(|s| s.checked_mul(u64::from(block_size)))
            .ok_or_else(|| Error::FieldOutOfBounds("fec_size"))?;
        if expected_fec_size != fec_size {
            return Err(Error::InvalidFecSize {
                input: data_size,
                expected: expected_fec_size,
                actual: fec_size,
            });
        }

        // Check upfront so the per-round grid allocation cannot overflow.
        usize::from(rs_k)
            .checked_mul(block_size as usize)
            .ok_or_else(|| Error::FieldOutOfBounds("block_size"))?;

        Ok(Self {
            data_offset,
            data_size,
            fec_offset,
            block_size,
            rs_k,
            rounds,
        })
    }

    /// Get the number of parity bytes per codeword.
    #[inline]
    fn parity(&self) -> u8 {
        RS_BLOCK_SIZE as u8 - self.rs_k
    }

    /// Get the region offset backing the specified `offset` in the
    /// interleaved view.
    fn backing_offset(&self, offset: u64) -> u64 {
        let rs_k = u64::from(self.rs_k);

        offset / rs_k + offset % rs_k * self.rounds * u64::from(self.block_size)
    }

    /// Read a raw sequential block of the region, starting at offset `offset`
    /// in the interleaved view. This reads a horizontal block-aligned slice
    /// in the offset grid.
    fn read_seq_block(
        &self,
        device: &mut dyn ReadWriteSeek,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let backing_offset = self.backing_offset(offset);

        // Out of bounds offsets are treated as if they contain zeros.
        if backing_offset >= self.data_size {
            buf.fill(0);
        } else {
            device.seek(SeekFrom::Start(self.data_offset + backing_offset))?;
            device.read_exact(buf)?;
        }

        Ok(())
    }

    /// Read the nth round of the region. The data is laid out sequentially
    /// (row-by-row).
    fn read_round(&self, device: &mut dyn ReadWriteSeek, round: u64, grid: &mut [u8]) -> io::Result<()> {
        for row in 0..self.rs_k {
            let interleaved_offset =
                round * u64::from(self.rs_k) * u64::from(self.block_size) + u64::from(row);
            let row_start = usize::from(row) * self.block_size as usize;
            let row_end = row_start + self.block_size as usize;

            self.read_seq_block(device, interleaved_offset, &mut grid[row_start..row_end])?;
        }

        Ok(())
    }

    /// Get the nth RS codeword from a round's grid.
    fn get_codeword(&self, grid: &[u8], column: usize) -> Codeword {
        let mut codeword = Codeword::new(self.rs_k);
        let data = codeword.data_mut();

        for row in 0..usize::from(self.rs_k) {
            data[row] = grid[row * self.block_size as usize + column];
        }

        codeword
    }

    /// Encode every round, writing the parity data to the FEC range. The
    /// device's read position is unspecified afterwards.
    pub fn encode(&self, device: &mut dyn ReadWriteSeek, cancel_signal: &AtomicBool) -> Result<()> {
        let encode = rs::FN_ENCODE[&self.rs_k];
        let parity = usize::from(self.parity());
        let mut grid = vec![0u8; usize::from(self.rs_k) * self.block_size as usize];
        let mut fec = vec![0u8; parity * self.block_size as usize];
        let mut fec_offset = self.fec_offset;

        for round in 0..self.rounds {
            stream::check_cancel(cancel_signal)?;

            self.read_round(device, round, &mut grid)?;

            for (column, buf) in fec.chunks_exact_mut(parity).enumerate() {
                let mut codeword = self.get_codeword(&grid, column);
                encode(codeword.all_mut());
                buf.copy_from_slice(codeword.parity());
            }

            device.seek(SeekFrom::Start(fec_offset))?;
            device.write_all(&fec)?;
            fec_offset += fec.len() as u64;
        }

        device.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Seek, Write},
        sync::atomic::{AtomicBool, Ordering},
    };

    use assert_matches::assert_matches;
    use rand::RngCore;

    use crate::stream::SharedCursor;

    use super::*;

    #[test]
    fn parameter_validation() {
        assert_matches!(FecEncoder::new(0, 0, 0, 0, 2, 4), Err(Error::InputEmpty));
        assert_matches!(
            FecEncoder::new(0, 1023, 1024, 512, 2, 256),
            Err(Error::NotBlockAligned { .. })
        );
        assert_matches!(
            FecEncoder::new(0, 1024, 1024, 512, 0, 256),
            Err(Error::UnsupportedParity(0))
        );
        assert_matches!(
            FecEncoder::new(0, 1024, 1024, 512, 25, 256),
            Err(Error::UnsupportedParity(25))
        );
        assert_matches!(
            FecEncoder::new(0, 1024, 1024, 513, 2, 256),
            Err(Error::InvalidFecSize { expected: 512, actual: 513, .. })
        );

        let fec = FecEncoder::new(0, 1024, 1024, 512, 2, 256).unwrap();
        assert_eq!(fec.rounds, 1);

        // Data spanning multiple rounds without filling the grid.
        let size = 253u64 * 4 * 3 - 4;
        let fec = FecEncoder::new(0, size, size, 3 * 2 * 4, 2, 4).unwrap();
        assert_eq!(fec.rounds, 3);
    }

    /// Re-read every codeword of the encoded region and check its parity with
    /// the generated RS tables.
    fn assert_codewords(fec: &FecEncoder, device: &mut SharedCursor, expect_correct: bool) {
        let is_correct = rs::FN_IS_CORRECT[&fec.rs_k];
        let parity = usize::from(fec.parity());
        let mut grid = vec![0u8; usize::from(fec.rs_k) * fec.block_size as usize];
        let mut all_correct = true;

        for round in 0..fec.rounds {
            fec.read_round(device, round, &mut grid).unwrap();

            let mut fec_data = vec![0u8; parity * fec.block_size as usize];
            device
                .seek(SeekFrom::Start(
                    fec.fec_offset + round * fec_data.len() as u64,
                ))
                .unwrap();
            device.read_exact(&mut fec_data).unwrap();

            for (column, parity_data) in fec_data.chunks_exact(parity).enumerate() {
                let mut codeword = fec.get_codeword(&grid, column);
                codeword.parity_mut().copy_from_slice(parity_data);
                all_correct &= is_correct(codeword.all());
            }
        }

        assert_eq!(all_correct, expect_correct);
    }

    #[test]
    fn encode_produces_valid_codewords() {
        let cancel_signal = AtomicBool::new(false);

        // Three rounds with a partially filled grid to exercise the
        // out-of-bounds-is-zero behavior.
        let block_size = 4u32;
        let rs_k = 253u64;
        let data_size = rs_k * u64::from(block_size) * 3 - u64::from(block_size);
        let fec_size = 3 * 2 * u64::from(block_size);

        let mut device = SharedCursor::new();
        let mut data = vec![0u8; data_size as usize];
        rand::thread_rng().fill_bytes(&mut data);
        device.write_all(&data).unwrap();

        let fec = FecEncoder::new(0, data_size, data_size, fec_size, 2, block_size).unwrap();
        fec.encode(&mut device, &cancel_signal).unwrap();

        assert_codewords(&fec, &mut device, true);

        // A corrupted data byte must invalidate some codeword.
        let mut corrupt = device.clone();
        corrupt.seek(SeekFrom::Start(17)).unwrap();
        let mut byte = [0u8; 1];
        corrupt.read_exact(&mut byte).unwrap();
        byte[0] = byte[0].wrapping_add(1);
        corrupt.seek(SeekFrom::Start(17)).unwrap();
        corrupt.write_all(&byte).unwrap();

        assert_codewords(&fec, &mut corrupt, false);
    }

    #[test]
    fn zero_data_has_zero_parity() {
        // RS is linear, so the parity of all-zero data is all zeros.
        let cancel_signal = AtomicBool::new(false);
        let data_size = 1024u64;
        let fec_size = 512u64;

        let mut device = SharedCursor::new();
        device.write_all(&vec![0u8; data_size as usize]).unwrap();

        let fec = FecEncoder::new(0, data_size, data_size, fec_size, 2, 256).unwrap();
        fec.encode(&mut device, &cancel_signal).unwrap();

        let mut fec_data = vec![0u8; fec_size as usize];
        device.seek(SeekFrom::Start(data_size)).unwrap();
        device.read_exact(&mut fec_data).unwrap();
        assert!(fec_data.iter().all(|b| *b == 0));
    }

    #[test]
    fn encode_is_cancellable() {
        let cancel_signal = AtomicBool::new(false);

        let mut device = SharedCursor::new();
        device.write_all(&[0u8; 1024]).unwrap();

        let fec = FecEncoder::new(0, 1024, 1024, 512, 2, 256).unwrap();

        cancel_signal.store(true, Ordering::SeqCst);
        let err = fec.encode(&mut device, &cancel_signal).unwrap_err();
        assert_matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::Interrupted);
    }
}
