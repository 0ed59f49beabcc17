// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Construction of dm-verity metadata for a partition whose filesystem data
//! has already been written: the Merkle hash tree over the filesystem region
//! and the Reed-Solomon FEC parity over filesystem plus tree. Both are
//! written back into their reserved ranges on the partition itself.

pub mod fec;
pub mod hashtree;
mod rs;

use std::{
    io::{self, SeekFrom},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    plan::Partition,
    stream::{ReadWriteSeek, WriteZerosExt},
    verity::{fec::FecEncoder, hashtree::HashTreeBuilder},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Sequential read expected at offset {expected}, but got {actual}")]
    NonSequentialUpdate { expected: u64, actual: u64 },
    #[error("Read up to {actual} bytes, but everything before {expected} is needed")]
    IncompleteData { expected: u64, actual: u64 },
    #[error("Hash tree needs {needed} bytes, but only {reserved} are reserved")]
    TreeTooLarge { needed: u64, reserved: u64 },
    #[error("Hash tree error")]
    HashTree(#[from] hashtree::Error),
    #[error("FEC error")]
    Fec(#[from] fec::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Incrementally computes and persists verity metadata for one partition.
///
/// The caller streams the filesystem region through [`Self::update`] in
/// order, then calls [`Self::finalize`] exactly once with a descriptor that
/// can read and write the partition. Finalize leaves the descriptor's read
/// position unspecified; the caller must re-seek.
#[derive(Debug)]
pub struct VerityWriter {
    hash_tree_offset: u64,
    hash_tree_size: u64,
    hash_tree_data_offset: u64,
    hash_tree_data_size: u64,
    builder: Option<HashTreeBuilder>,
    fec: Option<FecEncoder>,
    total_offset: u64,
}

impl VerityWriter {
    /// Set up tree and FEC computation from the partition's verity layout.
    /// Partitions with neither a hash tree nor FEC have nothing to write and
    /// don't need a writer.
    pub fn new(partition: &Partition) -> Result<Self> {
        let builder = if partition.hash_tree_size > 0 {
            let algorithm = hashtree::ring_algorithm(&partition.hash_tree_algorithm)?;

            let needed = HashTreeBuilder::calculate_size(
                partition.block_size,
                algorithm,
                partition.hash_tree_data_size,
            )?;
            if needed > partition.hash_tree_size {
                return Err(Error::TreeTooLarge {
                    needed,
                    reserved: partition.hash_tree_size,
                });
            }

            Some(HashTreeBuilder::new(
                partition.block_size,
                algorithm,
                &partition.hash_tree_salt,
                partition.hash_tree_data_size,
            )?)
        } else {
            None
        };

        let fec = if partition.fec_size > 0 {
            Some(FecEncoder::new(
                partition.fec_data_offset,
                partition.fec_data_size,
                partition.fec_offset,
                partition.fec_size,
                partition.fec_roots,
                partition.block_size,
            )?)
        } else {
            None
        };

        Ok(Self {
            hash_tree_offset: partition.hash_tree_offset,
            hash_tree_size: partition.hash_tree_size,
            hash_tree_data_offset: partition.hash_tree_data_offset,
            hash_tree_data_size: partition.hash_tree_data_size,
            builder,
            fec,
            total_offset: 0,
        })
    }

    /// Feed the next chunk of the filesystem region. `offset` is the
    /// absolute partition offset of `data`; chunks must arrive contiguously
    /// starting at 0. Only the slice that overlaps the hash tree's data
    /// window goes into the tree.
    pub fn update(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset != self.total_offset {
            return Err(Error::NonSequentialUpdate {
                expected: self.total_offset,
                actual: offset,
            });
        }

        let end = offset + data.len() as u64;

        if let Some(builder) = &mut self.builder {
            let data_end = self.hash_tree_data_offset + self.hash_tree_data_size;
            if end > data_end {
                warn!(
                    "Reading past the hash tree data end ({end} > {data_end}); the partition \
                     digest may come out wrong",
                );
            }

            let from = offset.max(self.hash_tree_data_offset);
            let to = end.min(data_end);
            if from < to {
                let skip = (from - offset) as usize;
                let take = (to - from) as usize;
                builder.update(&data[skip..skip + take])?;
            }
        }

        self.total_offset = end;

        Ok(())
    }

    /// Write the hash tree and FEC data to the partition. The hash tree's
    /// reserved range is zero-padded past the end of the serialized tree so
    /// the partition contents are fully determined by the filesystem data.
    pub fn finalize(
        mut self,
        device: &mut dyn ReadWriteSeek,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let data_end = self.hash_tree_data_offset + self.hash_tree_data_size;
        if self.total_offset < data_end {
            return Err(Error::IncompleteData {
                expected: data_end,
                actual: self.total_offset,
            });
        }

        if let Some(builder) = self.builder.take() {
            let tree = builder.finish()?;

            info!(
                "Writing hash tree ({} of {} reserved bytes) at offset {}",
                tree.data.len(),
                self.hash_tree_size,
                self.hash_tree_offset,
            );
            debug!("Hash tree root digest: {}", hex::encode(&tree.root_digest));

            device.seek(SeekFrom::Start(self.hash_tree_offset))?;
            device.write_all(&tree.data)?;
            device.write_zeros_exact(self.hash_tree_size - tree.data.len() as u64)?;
        }

        if let Some(fec) = &self.fec {
            info!("Writing FEC data");
            fec.encode(device, cancel_signal)?;
        }

        device.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Seek, Write},
        sync::atomic::AtomicBool,
    };

    use assert_matches::assert_matches;

    use crate::stream::SharedCursor;

    use super::*;

    fn verity_partition() -> Partition {
        Partition {
            target_size: 8192,
            hash_tree_data_offset: 0,
            hash_tree_data_size: 4096,
            hash_tree_offset: 4096,
            hash_tree_size: 4096,
            block_size: 1024,
            ..Partition::new("system")
        }
    }

    #[test]
    fn rejects_undersized_tree_region() {
        let mut partition = verity_partition();
        partition.hash_tree_data_size = 1024 * 1024;

        assert_matches!(
            VerityWriter::new(&partition),
            Err(Error::TreeTooLarge { .. })
        );
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let mut partition = verity_partition();
        partition.hash_tree_algorithm = "crc32".to_owned();

        assert_matches!(VerityWriter::new(&partition), Err(Error::HashTree(_)));
    }

    #[test]
    fn updates_must_be_sequential() {
        let mut writer = VerityWriter::new(&verity_partition()).unwrap();

        writer.update(0, &[0u8; 1024]).unwrap();
        assert_matches!(
            writer.update(2048, &[0u8; 1024]),
            Err(Error::NonSequentialUpdate { expected: 1024, actual: 2048 })
        );
        writer.update(1024, &[0u8; 1024]).unwrap();
    }

    #[test]
    fn finalize_requires_all_tree_data() {
        let cancel_signal = AtomicBool::new(false);
        let mut writer = VerityWriter::new(&verity_partition()).unwrap();
        writer.update(0, &[0u8; 1024]).unwrap();

        let mut device = SharedCursor::new();
        assert_matches!(
            writer.finalize(&mut device, &cancel_signal),
            Err(Error::IncompleteData { expected: 4096, actual: 1024 })
        );
    }

    #[test]
    fn writes_tree_and_pads_reserved_range() {
        let cancel_signal = AtomicBool::new(false);
        let partition = verity_partition();

        let data = vec![0xabu8; 4096];

        let mut device = SharedCursor::new();
        device.write_all(&data).unwrap();
        // Junk in the reserved range must get overwritten.
        device.write_all(&[0x5au8; 4096]).unwrap();

        let mut writer = VerityWriter::new(&partition).unwrap();
        writer.update(0, &data).unwrap();
        writer.finalize(&mut device, &cancel_signal).unwrap();

        let expected_tree = {
            let mut builder = HashTreeBuilder::new(
                partition.block_size,
                &ring::digest::SHA256,
                &partition.hash_tree_salt,
                partition.hash_tree_data_size,
            )
            .unwrap();
            builder.update(&data).unwrap();
            builder.finish().unwrap()
        };
        assert_eq!(expected_tree.data.len(), 1024);

        let mut contents = Vec::new();
        device.rewind().unwrap();
        device.read_to_end(&mut contents).unwrap();

        assert_eq!(&contents[..4096], &data[..]);
        assert_eq!(&contents[4096..5120], &expected_tree.data[..]);
        assert!(contents[5120..8192].iter().all(|b| *b == 0));
    }

    #[test]
    fn writes_fec_over_data_and_tree() {
        let cancel_signal = AtomicBool::new(false);

        let mut partition = verity_partition();
        partition.hash_tree_size = 1024;
        partition.fec_data_offset = 0;
        partition.fec_data_size = 5120;
        partition.fec_offset = 5120;
        partition.fec_size = 2048;
        partition.target_size = 7168;

        let data = vec![0x17u8; 4096];

        let mut device = SharedCursor::new();
        device.write_all(&data).unwrap();
        device.write_all(&[0xffu8; 3072]).unwrap();

        let mut writer = VerityWriter::new(&partition).unwrap();
        writer.update(0, &data).unwrap();
        writer.finalize(&mut device, &cancel_signal).unwrap();

        // The parity must cover the written tree, not the junk it replaced.
        let expected_fec = {
            let mut reference = SharedCursor::new();
            let mut contents = vec![0u8; 5120];
            device.rewind().unwrap();
            device.read_exact(&mut contents).unwrap();
            reference.write_all(&contents).unwrap();

            let encoder = FecEncoder::new(0, 5120, 5120, 2048, 2, 1024).unwrap();
            encoder.encode(&mut reference, &cancel_signal).unwrap();

            let mut fec_data = vec![0u8; 2048];
            reference.seek(std::io::SeekFrom::Start(5120)).unwrap();
            reference.read_exact(&mut fec_data).unwrap();
            fec_data
        };

        let mut fec_data = vec![0u8; 2048];
        device.seek(std::io::SeekFrom::Start(5120)).unwrap();
        device.read_exact(&mut fec_data).unwrap();
        assert_eq!(fec_data, expected_fec);
    }
}
