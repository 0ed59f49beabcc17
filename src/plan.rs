// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::HashSet, fmt, path::PathBuf};

use thiserror::Error;

use crate::util::NumBytes;

/// Identifier of a bootable slot (A/B). Opaque to this crate; it is only
/// passed through to the dynamic partition layer.
pub type Slot = u32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Partition name is empty or duplicated: {0:?}")]
    InvalidName(String),
    #[error(
        "Partition {name}: hash tree at {hash_tree_offset:#x} must not come after FEC at {fec_offset:#x}"
    )]
    HashTreeAfterFec {
        name: String,
        hash_tree_offset: u64,
        fec_offset: u64,
    },
    #[error(
        "Partition {name}: {region} region at {offset:#x}+{size:#x} exceeds partition size {partition_size:#x}"
    )]
    RegionOutOfBounds {
        name: String,
        region: &'static str,
        offset: u64,
        size: u64,
        partition_size: u64,
    },
    #[error("Partition {name}: delta payload requires a source device and size")]
    MissingSource { name: String },
    #[error("Partition {name}: expected target digest is missing")]
    MissingTargetHash { name: String },
}

type Result<T> = std::result::Result<T, Error>;

/// Per-partition slice of an install plan: where to find the source and
/// target devices, their sizes, the expected digests, and the layout of the
/// verity metadata regions within the target.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,

    /// Device path of the partition in the source slot. Absent for full
    /// payloads and for partitions that are never read back.
    pub source_path: Option<PathBuf>,
    pub source_size: u64,
    /// Expected digest of the source partition. Empty denotes a full payload
    /// (there is no source state to fall back to).
    pub source_hash: Vec<u8>,

    /// Device path of the partition in the target slot.
    pub target_path: Option<PathBuf>,
    pub target_size: u64,
    pub target_hash: Vec<u8>,

    /// Path used to read the target through the snapshot daemon when the
    /// partition is dynamic and verity is not being written.
    pub readonly_target_path: Option<PathBuf>,

    /// Verity block size for both the hash tree and FEC.
    pub block_size: u32,

    /// Byte window of the target that the hash tree covers.
    pub hash_tree_data_offset: u64,
    pub hash_tree_data_size: u64,
    /// Reserved range for the hash tree itself.
    pub hash_tree_offset: u64,
    pub hash_tree_size: u64,
    pub hash_tree_algorithm: String,
    pub hash_tree_salt: Vec<u8>,

    /// Byte window of the target that FEC covers (filesystem plus hash tree).
    pub fec_data_offset: u64,
    pub fec_data_size: u64,
    /// Reserved range for the FEC parity data.
    pub fec_offset: u64,
    pub fec_size: u64,
    /// Parity bytes per 255-byte Reed-Solomon codeword.
    pub fec_roots: u32,
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("source_path", &self.source_path)
            .field("source_size", &self.source_size)
            .field("source_hash", &hex::encode(&self.source_hash))
            .field("target_path", &self.target_path)
            .field("target_size", &self.target_size)
            .field("target_hash", &hex::encode(&self.target_hash))
            .field("hash_tree", &NumBytes(self.hash_tree_size))
            .field("fec", &NumBytes(self.fec_size))
            .finish_non_exhaustive()
    }
}

impl Partition {
    /// Create a partition entry with the default verity parameters and
    /// everything else empty.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            block_size: 4096,
            hash_tree_algorithm: "sha256".to_owned(),
            fec_roots: 2,
            ..Default::default()
        }
    }

    /// End of the filesystem data region within a partition extent of the
    /// given size. Everything at or past this offset is verity metadata (or
    /// footer) and must not be read until the metadata has been written.
    pub fn filesystem_data_end(&self, partition_size: u64) -> u64 {
        let mut end = partition_size;
        if self.hash_tree_offset > 0 {
            end = end.min(self.hash_tree_offset);
        }
        if self.fec_offset > 0 {
            end = end.min(self.fec_offset);
        }
        end
    }
}

/// Everything the verify stage needs to know about an update that has just
/// been applied. The plan is treated as immutable and, on success, forwarded
/// downstream unchanged.
#[derive(Clone, Debug, Default)]
pub struct InstallPlan {
    pub source_slot: Slot,
    pub target_slot: Slot,
    /// When true, verity metadata for target partitions is produced during
    /// verification instead of being shipped in the payload.
    pub write_verity: bool,
    /// Partitions in verification order.
    pub partitions: Vec<Partition>,
    /// Dynamic partitions the update did not touch. Their extents must match
    /// across slots, but their contents are not re-hashed.
    pub untouched_dynamic_partitions: Vec<String>,
}

impl InstallPlan {
    /// Check the structural invariants the verifier relies on. A plan that
    /// fails validation is rejected before any device I/O happens.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for partition in &self.partitions {
            if partition.name.is_empty() || !names.insert(partition.name.as_str()) {
                return Err(Error::InvalidName(partition.name.clone()));
            }

            if partition.hash_tree_offset > 0
                && partition.fec_offset > 0
                && partition.hash_tree_offset > partition.fec_offset
            {
                return Err(Error::HashTreeAfterFec {
                    name: partition.name.clone(),
                    hash_tree_offset: partition.hash_tree_offset,
                    fec_offset: partition.fec_offset,
                });
            }

            let regions = [
                ("hash tree", partition.hash_tree_offset, partition.hash_tree_size),
                ("FEC", partition.fec_offset, partition.fec_size),
            ];
            for (region, offset, size) in regions {
                if size == 0 {
                    continue;
                }

                let in_bounds = offset
                    .checked_add(size)
                    .is_some_and(|end| end <= partition.target_size);
                if !in_bounds {
                    return Err(Error::RegionOutOfBounds {
                        name: partition.name.clone(),
                        region,
                        offset,
                        size,
                        partition_size: partition.target_size,
                    });
                }
            }

            if !partition.source_hash.is_empty()
                && (partition.source_size == 0 || partition.source_path.is_none())
            {
                return Err(Error::MissingSource {
                    name: partition.name.clone(),
                });
            }

            if partition.target_size > 0 && partition.target_hash.is_empty() {
                return Err(Error::MissingTargetHash {
                    name: partition.name.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn valid_partition() -> Partition {
        Partition {
            target_path: Some("/dev/block/system_b".into()),
            target_size: 8192,
            target_hash: vec![0xaa; 32],
            ..Partition::new("system")
        }
    }

    #[test]
    fn validate_accepts_plain_plan() {
        let plan = InstallPlan {
            partitions: vec![valid_partition()],
            ..Default::default()
        };
        plan.validate().unwrap();
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let plan = InstallPlan {
            partitions: vec![valid_partition(), valid_partition()],
            ..Default::default()
        };
        assert_matches!(plan.validate(), Err(Error::InvalidName(_)));

        let plan = InstallPlan {
            partitions: vec![Partition::new("")],
            ..Default::default()
        };
        assert_matches!(plan.validate(), Err(Error::InvalidName(_)));
    }

    #[test]
    fn validate_rejects_hash_tree_after_fec() {
        let mut partition = valid_partition();
        partition.hash_tree_offset = 6144;
        partition.hash_tree_size = 1024;
        partition.fec_offset = 4096;
        partition.fec_size = 1024;

        let plan = InstallPlan {
            partitions: vec![partition],
            ..Default::default()
        };
        assert_matches!(plan.validate(), Err(Error::HashTreeAfterFec { .. }));
    }

    #[test]
    fn validate_rejects_out_of_bounds_regions() {
        let mut partition = valid_partition();
        partition.hash_tree_offset = 4096;
        partition.hash_tree_size = 8192;

        let plan = InstallPlan {
            partitions: vec![partition],
            ..Default::default()
        };
        assert_matches!(
            plan.validate(),
            Err(Error::RegionOutOfBounds { region: "hash tree", .. })
        );

        let mut partition = valid_partition();
        partition.fec_offset = u64::MAX;
        partition.fec_size = 4096;

        let plan = InstallPlan {
            partitions: vec![partition],
            ..Default::default()
        };
        assert_matches!(
            plan.validate(),
            Err(Error::RegionOutOfBounds { region: "FEC", .. })
        );
    }

    #[test]
    fn validate_rejects_delta_without_source() {
        let mut partition = valid_partition();
        partition.source_hash = vec![0xbb; 32];

        let plan = InstallPlan {
            partitions: vec![partition],
            ..Default::default()
        };
        assert_matches!(plan.validate(), Err(Error::MissingSource { .. }));
    }

    #[test]
    fn validate_rejects_missing_target_hash() {
        let mut partition = valid_partition();
        partition.target_hash.clear();

        let plan = InstallPlan {
            partitions: vec![partition],
            ..Default::default()
        };
        assert_matches!(plan.validate(), Err(Error::MissingTargetHash { .. }));
    }

    #[test]
    fn filesystem_data_end() {
        let mut partition = valid_partition();
        assert_eq!(partition.filesystem_data_end(8192), 8192);

        partition.hash_tree_offset = 4096;
        assert_eq!(partition.filesystem_data_end(8192), 4096);

        partition.fec_offset = 6144;
        assert_eq!(partition.filesystem_data_end(8192), 4096);

        partition.hash_tree_offset = 0;
        assert_eq!(partition.filesystem_data_end(8192), 6144);

        // The source extent may be smaller than the metadata offsets.
        assert_eq!(partition.filesystem_data_end(4096), 4096);
    }
}
