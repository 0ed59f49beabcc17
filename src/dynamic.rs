// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use crate::{plan::Slot, stream::ReadWriteSeek};

/// Interface to the volume manager and snapshot daemon that back dynamic
/// partitions. Mapping state is process-wide: the verifier only touches it at
/// partition boundaries and unmaps on exit when it mapped for a read pass.
///
/// All operations are synchronous. Failures surface as `false` or `None` and
/// abort verification.
pub trait DynamicPartitionControl {
    /// Whether the current update reads and writes dynamic partitions through
    /// compressed snapshots (virtual A/B).
    fn update_uses_snapshot_compression(&self) -> bool;

    fn is_dynamic_partition(&self, name: &str, slot: Slot) -> bool;

    fn map_all_partitions(&self) -> bool;

    fn unmap_all_partitions(&self) -> bool;

    /// Open a descriptor that reads the target partition's contents through
    /// the copy-on-write layer, without requiring the snapshot devices to be
    /// mapped.
    fn open_cow_reader(
        &self,
        name: &str,
        source_path: Option<&Path>,
        read_only: bool,
    ) -> Option<Box<dyn ReadWriteSeek>>;

    /// Check that the named partitions occupy identical extents in both
    /// slots. Used for dynamic partitions the update left untouched.
    fn verify_extents_for_untouched_partitions(
        &self,
        source_slot: Slot,
        target_slot: Slot,
        partitions: &[String],
    ) -> bool;
}

/// Implementation for devices without dynamic partitions. Mapping operations
/// succeed trivially and there is never anything to read through a snapshot.
pub struct StubDynamicPartitionControl;

impl DynamicPartitionControl for StubDynamicPartitionControl {
    fn update_uses_snapshot_compression(&self) -> bool {
        false
    }

    fn is_dynamic_partition(&self, _name: &str, _slot: Slot) -> bool {
        false
    }

    fn map_all_partitions(&self) -> bool {
        true
    }

    fn unmap_all_partitions(&self) -> bool {
        true
    }

    fn open_cow_reader(
        &self,
        _name: &str,
        _source_path: Option<&Path>,
        _read_only: bool,
    ) -> Option<Box<dyn ReadWriteSeek>> {
        None
    }

    fn verify_extents_for_untouched_partitions(
        &self,
        _source_slot: Slot,
        _target_slot: Slot,
        _partitions: &[String],
    ) -> bool {
        true
    }
}
