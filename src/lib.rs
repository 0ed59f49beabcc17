/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Post-install filesystem verification for A/B OTA updates on block-device
//! based systems. After an update payload has been applied, this crate
//! re-reads every target partition, computes a digest over its entire
//! extent, and compares it against the digest from the update manifest. For
//! partitions protected by dm-verity whose metadata was not shipped in the
//! payload, the hash tree and FEC data are built and written in the middle
//! of that read pass.
//!
//! The crate is a library with no outer surface of its own: plans come from
//! the payload-application stage, devices are plain block device paths, and
//! the dynamic-partition and scheduling seams are injected as traits.

pub mod blockdev;
pub mod digest;
pub mod dynamic;
pub mod plan;
pub mod scheduler;
pub mod stream;
pub mod util;
pub mod verifier;
pub mod verity;
