// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Post-install verification of every partition an update wrote.
//!
//! On a partition with verity enabled, the expected layout is:
//!
//! ```text
//! +------------------------------+
//! |    normal filesystem data    |  (the vast majority of the space)
//! +------------------------------+
//! |          hash tree           |  (~0.8%, eg. 16 MiB for a 2 GiB image)
//! +------------------------------+
//! |           FEC data           |  (~0.8%)
//! +------------------------------+
//! |            footer            |
//! +------------------------------+
//! ```
//!
//! When the payload did not ship the verity metadata, only the filesystem
//! data exists on disk at this point and the hash tree and FEC have to be
//! built here, in the middle of hashing: reading must stop at the start of
//! the hash tree, wait until both regions have been written, and only then
//! continue through the remainder of the partition. Otherwise the digest
//! would be computed over stale bytes.
//!
//! Each partition is verified in at most two passes: the freshly written
//! target first and, only if the target digest mismatches on a delta update,
//! the source partition, to tell a corrupted delivery apart from a device
//! that was never in the state the delta was generated for.

use std::{
    cell::RefCell,
    io::{Read, Seek, SeekFrom},
    path::Path,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, error, info};

use crate::{
    blockdev::BlockDevice,
    digest::Hasher,
    dynamic::DynamicPartitionControl,
    plan::InstallPlan,
    scheduler::{TaskId, TaskQueue},
    stream::ReadWriteSeek,
    verity::VerityWriter,
};

/// Fixed size of the streaming read buffer. One buffer is live at a time and
/// none of it escapes into the task queue, so this bounds the verifier's
/// memory use regardless of partition sizes.
const READ_BUFFER_SIZE: usize = 128 * 1024;

/// Terminal failure kinds, as the rest of the update engine distinguishes
/// them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The target partition's digest mismatched and either there is no
    /// source to compare against (full payload) or the source still matches.
    /// Either way, the newly written data is bad.
    NewRootfsVerification,
    /// Both the target and the source digests mismatched: the delta was
    /// generated for a device in a different state.
    DownloadStateInitialization,
    /// Device I/O failed, a device path could not be determined, the extents
    /// of untouched dynamic partitions diverged between slots, or writing
    /// verity metadata failed at the I/O stage.
    FilesystemVerifier,
    /// Setting up or feeding the verity computation failed.
    VerityCalculation,
    /// Digest bookkeeping or read scheduling failed, or verification was
    /// cancelled mid-flight.
    Internal,
}

/// Receives progress and the single terminal outcome of a verification run.
///
/// Callbacks are invoked while the verifier is stepping, so implementations
/// must not call back into it; to abort from a callback, set the shared
/// cancel signal instead.
pub trait VerifyDelegate {
    /// Overall progress in `[0.0, 1.0]`. Values are non-decreasing and reach
    /// exactly 1.0 when a terminal outcome is emitted.
    fn on_progress(&mut self, _progress: f64) {}

    /// Exactly one terminal outcome per run, unless the run was cancelled,
    /// in which case no outcome is emitted at all. On success the install
    /// plan is handed back unchanged for the next stage.
    fn on_complete(&mut self, result: Result<InstallPlan, ErrorCode>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VerifierStep {
    VerifyTarget,
    VerifySource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Streaming `[0, filesystem_data_end)`, feeding hasher and verity.
    Filesystem,
    /// Streaming `[filesystem_data_end, partition_size)`, hasher only. Only
    /// entered once verity metadata is on disk.
    Metadata,
}

enum StepOutcome {
    MoreData,
    PartitionDone,
}

/// State machine that re-reads every partition the update touched and checks
/// its digest against the install plan, building verity metadata along the
/// way when the payload did not carry it.
///
/// Work proceeds one buffer-sized chunk per scheduled task so that a
/// cancellation is honored within one chunk of I/O.
pub struct FilesystemVerifier {
    plan: InstallPlan,
    dynamic_control: Rc<dyn DynamicPartitionControl>,
    queue: Rc<TaskQueue>,
    delegate: Box<dyn VerifyDelegate>,
    cancel_signal: Arc<AtomicBool>,

    partition_index: usize,
    step: VerifierStep,
    phase: Phase,
    device: Option<Box<dyn ReadWriteSeek>>,
    buffer: Vec<u8>,
    hasher: Option<Hasher>,
    verity_writer: Option<VerityWriter>,
    offset: u64,
    partition_size: u64,
    filesystem_data_end: u64,
    pending_task: Option<TaskId>,
    last_progress: f64,
    completed: bool,
}

impl FilesystemVerifier {
    pub fn new(
        plan: InstallPlan,
        dynamic_control: Rc<dyn DynamicPartitionControl>,
        queue: Rc<TaskQueue>,
        delegate: Box<dyn VerifyDelegate>,
        cancel_signal: Arc<AtomicBool>,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            plan,
            dynamic_control,
            queue,
            delegate,
            cancel_signal,
            partition_index: 0,
            step: VerifierStep::VerifyTarget,
            phase: Phase::Filesystem,
            device: None,
            buffer: Vec::new(),
            hasher: None,
            verity_writer: None,
            offset: 0,
            partition_size: 0,
            filesystem_data_end: 0,
            pending_task: None,
            last_progress: 0.0,
            completed: false,
        }))
    }

    /// Begin verification. Progress and the terminal outcome arrive through
    /// the delegate while the task queue is pumped.
    pub fn start(this: &Rc<RefCell<Self>>) {
        {
            let mut v = this.borrow_mut();

            if let Err(e) = v.plan.validate() {
                error!("Rejecting install plan: {e}");
                v.cleanup(Err(ErrorCode::FilesystemVerifier));
                return;
            }

            debug!("Verifying install plan: {:?}", v.plan);

            if v.plan.partitions.is_empty() {
                info!("No partitions to verify");
                v.cleanup(Ok(()));
                return;
            }
        }

        Self::start_partition(this);
    }

    /// Abort the run. The pending read task is dropped, resources are
    /// released, and no terminal outcome is emitted. Must not be called from
    /// delegate callbacks; those should set the cancel signal instead.
    pub fn cancel(this: &Rc<RefCell<Self>>) {
        let mut v = this.borrow_mut();

        v.cancel_signal.store(true, Ordering::SeqCst);
        if let Some(id) = v.pending_task.take() {
            v.queue.cancel(id);
        }

        v.cleanup(Err(ErrorCode::Internal));
    }

    /// Convenience wrapper that verifies `plan` to completion on an internal
    /// task queue. Returns `Err(ErrorCode::Internal)` if the run was
    /// cancelled through `cancel_signal` before reaching an outcome.
    pub fn run(
        plan: InstallPlan,
        dynamic_control: Rc<dyn DynamicPartitionControl>,
        cancel_signal: Arc<AtomicBool>,
    ) -> Result<InstallPlan, ErrorCode> {
        struct Recorder(Rc<RefCell<Option<Result<InstallPlan, ErrorCode>>>>);

        impl VerifyDelegate for Recorder {
            fn on_complete(&mut self, result: Result<InstallPlan, ErrorCode>) {
                *self.0.borrow_mut() = Some(result);
            }
        }

        let outcome = Rc::new(RefCell::new(None));
        let queue = TaskQueue::new();
        let verifier = Self::new(
            plan,
            dynamic_control,
            Rc::clone(&queue),
            Box::new(Recorder(Rc::clone(&outcome))),
            cancel_signal,
        );

        Self::start(&verifier);
        queue.run_until_idle();

        let result = outcome.borrow_mut().take();
        result.unwrap_or(Err(ErrorCode::Internal))
    }

    fn cancelled(&self) -> bool {
        self.cancel_signal.load(Ordering::SeqCst)
    }

    fn should_write_verity(&self) -> bool {
        let partition = &self.plan.partitions[self.partition_index];

        self.step == VerifierStep::VerifyTarget
            && self.plan.write_verity
            && (partition.hash_tree_size > 0 || partition.fec_size > 0)
    }

    fn update_progress(&mut self, progress: f64) {
        // The raw formula regresses when a partition is re-read for the
        // source check, so only ratchet upwards.
        if progress > self.last_progress {
            self.last_progress = progress;
            self.delegate.on_progress(progress);
        }
    }

    /// Release per-partition resources and, unless cancelled, emit the
    /// terminal outcome. Safe to call more than once; only the first
    /// non-cancelled call completes the run.
    fn cleanup(&mut self, result: Result<(), ErrorCode>) {
        self.device = None;
        self.buffer = Vec::new();
        self.hasher = None;
        self.verity_writer = None;

        // Partitions were mapped only so the read pass observes the
        // snapshot daemon's view; don't leak the mapping past this stage.
        if !self.plan.write_verity && self.dynamic_control.update_uses_snapshot_compression() {
            info!("Not writing verity; unmapping all dynamic partitions");
            self.dynamic_control.unmap_all_partitions();
        }

        if self.cancelled() || self.completed {
            return;
        }
        self.completed = true;

        self.update_progress(1.0);
        let outcome = result.map(|()| self.plan.clone());
        self.delegate.on_complete(outcome);
    }

    /// Open `path` directly as a block device, writable only if verity data
    /// will be written through it.
    fn open_device(&mut self, path: &Path) -> bool {
        let writable = self.should_write_verity();

        match BlockDevice::open(path, writable) {
            Ok(device) => {
                self.device = Some(Box::new(device));
                true
            }
            Err(e) => {
                error!("Unable to open {path:?} for reading: {e}");
                false
            }
        }
    }

    /// Open the target of a dynamic partition while snapshot compression is
    /// in use. With verity writes pending, the copy-on-write reader provides
    /// the merged view; otherwise all partitions are remapped so the read
    /// goes through a freshly spun-up snapshot daemon, exactly like the
    /// reads the device will issue at boot.
    fn open_snapshot_device(&mut self) -> bool {
        let partition = &self.plan.partitions[self.partition_index];
        let name = partition.name.clone();
        let source_path = partition.source_path.clone();
        let readonly_target_path = partition.readonly_target_path.clone();
        self.partition_size = partition.target_size;

        if !self.should_write_verity() {
            // If verity was written on an earlier run, those writes are not
            // visible to a previously started snapshot daemon. Unmap and
            // remap to re-spin it before reading.
            self.dynamic_control.unmap_all_partitions();
            if !self.dynamic_control.map_all_partitions() {
                error!("Failed to map all partitions");
                return false;
            }

            let Some(path) = readonly_target_path else {
                error!("Partition {name} has no snapshot read path");
                return false;
            };

            return self.open_device(&path);
        }

        match self
            .dynamic_control
            .open_cow_reader(&name, source_path.as_deref(), true)
        {
            Some(device) => {
                self.device = Some(device);
                true
            }
            None => {
                error!("Opening COW reader for {name} (source {source_path:?}) failed");
                false
            }
        }
    }

    /// Set up hashing for the current partition and schedule the first read,
    /// or finish the run when no partitions remain. Zero-sized partitions
    /// without a device path are skipped here.
    fn start_partition(this: &Rc<RefCell<Self>>) {
        let mut v = this.borrow_mut();

        loop {
            if v.partition_index == v.plan.partitions.len() {
                if !v.plan.untouched_dynamic_partitions.is_empty() {
                    info!(
                        "Verifying extents of untouched dynamic partitions {:?}",
                        v.plan.untouched_dynamic_partitions,
                    );
                    if !v.dynamic_control.verify_extents_for_untouched_partitions(
                        v.plan.source_slot,
                        v.plan.target_slot,
                        &v.plan.untouched_dynamic_partitions,
                    ) {
                        v.cleanup(Err(ErrorCode::FilesystemVerifier));
                        return;
                    }
                }

                v.cleanup(Ok(()));
                return;
            }

            let (name, part_path, partition_size) = {
                let partition = &v.plan.partitions[v.partition_index];
                let (path, size) = match v.step {
                    VerifierStep::VerifySource => {
                        (partition.source_path.clone(), partition.source_size)
                    }
                    VerifierStep::VerifyTarget => {
                        (partition.target_path.clone(), partition.target_size)
                    }
                };
                (partition.name.clone(), path, size)
            };
            v.partition_size = partition_size;

            info!(
                "Hashing partition {} ({}) on device {:?}",
                v.partition_index, name, part_path,
            );

            let opened = {
                let use_snapshot = {
                    let partition = &v.plan.partitions[v.partition_index];
                    v.dynamic_control.update_uses_snapshot_compression()
                        && v.step == VerifierStep::VerifyTarget
                        && v.dynamic_control
                            .is_dynamic_partition(&partition.name, v.plan.target_slot)
                };

                if use_snapshot {
                    v.open_snapshot_device()
                } else {
                    match &part_path {
                        None => {
                            if partition_size == 0 {
                                info!(
                                    "Skipping partition {} ({}) because size is 0",
                                    v.partition_index, name,
                                );
                                v.partition_index += 1;
                                continue;
                            }

                            error!(
                                "Cannot hash partition {} ({}) because its device path cannot \
                                 be determined",
                                v.partition_index, name,
                            );
                            v.cleanup(Err(ErrorCode::FilesystemVerifier));
                            return;
                        }
                        Some(path) => v.open_device(path),
                    }
                }
            };

            if !opened {
                v.cleanup(Err(ErrorCode::FilesystemVerifier));
                return;
            }

            v.buffer.resize(READ_BUFFER_SIZE, 0);
            v.hasher = Some(Hasher::new());
            v.offset = 0;
            v.phase = Phase::Filesystem;
            v.filesystem_data_end = {
                let partition = &v.plan.partitions[v.partition_index];
                partition.filesystem_data_end(v.partition_size)
            };

            if v.should_write_verity() {
                let writer = {
                    let partition = &v.plan.partitions[v.partition_index];
                    VerityWriter::new(partition)
                };
                match writer {
                    Ok(writer) => {
                        info!("Verity writes enabled on partition {name}");
                        v.verity_writer = Some(writer);
                    }
                    Err(e) => {
                        error!("Failed to initialize verity writer for {name}: {e}");
                        v.cleanup(Err(ErrorCode::VerityCalculation));
                        return;
                    }
                }
            } else {
                info!("Verity writes disabled on partition {name}");
            }

            drop(v);
            Self::schedule_step(this);
            return;
        }
    }

    /// Post the next cooperative unit of work. At most one task is pending
    /// per verifier.
    fn schedule_step(this: &Rc<RefCell<Self>>) {
        let task = {
            let this = Rc::clone(this);
            Box::new(move || Self::step(&this))
        };

        let mut v = this.borrow_mut();
        let id = v.queue.post(task);
        v.pending_task = Some(id);
    }

    fn step(this: &Rc<RefCell<Self>>) {
        enum Next {
            Continue,
            FinishPartition,
            Stop,
        }

        let next = {
            let mut v = this.borrow_mut();
            v.pending_task = None;

            if v.cancelled() {
                v.cleanup(Err(ErrorCode::Internal));
                Next::Stop
            } else {
                match v.step_once() {
                    Ok(StepOutcome::MoreData) => Next::Continue,
                    Ok(StepOutcome::PartitionDone) => Next::FinishPartition,
                    Err(code) => {
                        v.cleanup(Err(code));
                        Next::Stop
                    }
                }
            }
        };

        match next {
            Next::Continue => Self::schedule_step(this),
            Next::FinishPartition => Self::finish_partition(this),
            Next::Stop => {}
        }
    }

    /// Read and hash one chunk, transitioning from the filesystem region to
    /// the metadata region when the boundary is reached.
    fn step_once(&mut self) -> Result<StepOutcome, ErrorCode> {
        if self.phase == Phase::Filesystem && self.offset == self.filesystem_data_end {
            self.write_verity_and_rewind()?;
        }

        if self.offset == self.partition_size {
            return Ok(StepOutcome::PartitionDone);
        }

        let region_end = match self.phase {
            Phase::Filesystem => self.filesystem_data_end,
            Phase::Metadata => self.partition_size,
        };
        let to_read = (region_end - self.offset).min(self.buffer.len() as u64) as usize;

        let Some(device) = self.device.as_mut() else {
            return Err(ErrorCode::Internal);
        };

        if let Err(e) = device.seek(SeekFrom::Start(self.offset)) {
            error!("Unable to seek to offset {}: {e}", self.offset);
            return Err(ErrorCode::FilesystemVerifier);
        }

        let n = match device.read(&mut self.buffer[..to_read]) {
            Ok(n) => n,
            Err(e) => match self.phase {
                Phase::Filesystem => {
                    error!("Unable to read filesystem data: {e}");
                    return Err(ErrorCode::Internal);
                }
                Phase::Metadata => {
                    error!("Failed to read verity metadata: {e}");
                    return Err(ErrorCode::FilesystemVerifier);
                }
            },
        };
        if n == 0 {
            error!(
                "Failed to read the remaining {} bytes from partition {}",
                self.partition_size - self.offset,
                self.plan.partitions[self.partition_index].name,
            );
            return Err(ErrorCode::FilesystemVerifier);
        }

        let Some(hasher) = self.hasher.as_mut() else {
            return Err(ErrorCode::Internal);
        };
        hasher.update(&self.buffer[..n]);

        if self.phase == Phase::Filesystem {
            if let Some(writer) = self.verity_writer.as_mut() {
                if let Err(e) = writer.update(self.offset, &self.buffer[..n]) {
                    error!("Unable to update verity data: {e}");
                    return Err(ErrorCode::VerityCalculation);
                }
            }
        }

        let progress = (self.offset as f64 / self.partition_size as f64
            + self.partition_index as f64)
            / self.plan.partitions.len() as f64;
        self.update_progress(progress);

        self.offset += n as u64;

        Ok(StepOutcome::MoreData)
    }

    /// The filesystem region is fully read: flush verity metadata to the
    /// device, then position for the metadata sweep. Nothing at or past
    /// `filesystem_data_end` may be read before this returns.
    fn write_verity_and_rewind(&mut self) -> Result<(), ErrorCode> {
        if let Some(writer) = self.verity_writer.take() {
            let Some(device) = self.device.as_mut() else {
                return Err(ErrorCode::Internal);
            };

            if let Err(e) = writer.finalize(&mut **device, &self.cancel_signal) {
                error!("Failed to write verity hash tree and FEC data: {e}");
                return Err(ErrorCode::FilesystemVerifier);
            }
        }

        // The descriptor was handed to the verity writer, so its position is
        // unspecified now. The per-chunk seek in step_once() repositions it.
        self.phase = Phase::Metadata;

        Ok(())
    }

    /// Compare the finished digest against the expected one and transition
    /// the state machine.
    fn finish_partition(this: &Rc<RefCell<Self>>) {
        let mut v = this.borrow_mut();

        let Some(hasher) = v.hasher.take() else {
            v.cleanup(Err(ErrorCode::Internal));
            return;
        };
        let digest = hasher.finalize();

        // The descriptor and buffer are released before the next partition
        // starts any I/O.
        v.device = None;
        v.buffer = Vec::new();

        let (name, expected_source_hash, expected_target_hash, source_path, source_size) = {
            let partition = &v.plan.partitions[v.partition_index];
            (
                partition.name.clone(),
                partition.source_hash.clone(),
                partition.target_hash.clone(),
                partition.source_path.clone(),
                partition.source_size,
            )
        };

        debug!("Hash of {name}: {}", hex::encode(digest.as_ref()));

        match v.step {
            VerifierStep::VerifyTarget => {
                if digest.as_ref() != expected_target_hash.as_slice() {
                    error!("New '{name}' partition verification failed");

                    if expected_source_hash.is_empty() {
                        // Full payload; there is no source state to compare
                        // against.
                        v.cleanup(Err(ErrorCode::NewRootfsVerification));
                        return;
                    }

                    // Re-read the source partition before giving up, to find
                    // out whether the device was ever in the state this
                    // delta applies to.
                    v.step = VerifierStep::VerifySource;
                } else {
                    v.partition_index += 1;
                }
            }
            VerifierStep::VerifySource => {
                if digest.as_ref() != expected_source_hash.as_slice() {
                    error!(
                        "Old '{name}' partition verification failed. This is a server-side \
                         error: the delta expects a source {name} with digest {}, but the \
                         one present hashes to {}",
                        hex::encode(&expected_source_hash),
                        hex::encode(digest.as_ref()),
                    );
                    if let Some(path) = &source_path {
                        info!(
                            "To reproduce: dd if={} bs=1M count={source_size} \
                             iflag=count_bytes 2>/dev/null | openssl dgst -sha256",
                            path.display(),
                        );
                    }

                    v.cleanup(Err(ErrorCode::DownloadStateInitialization));
                    return;
                }

                // The source still matches, so the target really is bad. The
                // remaining partitions no longer matter.
                v.cleanup(Err(ErrorCode::NewRootfsVerification));
                return;
            }
        }

        drop(v);
        Self::start_partition(this);
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc, sync::Arc, sync::atomic::AtomicBool};

    use crate::dynamic::StubDynamicPartitionControl;

    use super::*;

    #[test]
    fn empty_plan_succeeds() {
        let plan = InstallPlan::default();
        let result = FilesystemVerifier::run(
            plan,
            Rc::new(StubDynamicPartitionControl),
            Arc::new(AtomicBool::new(false)),
        );
        result.unwrap();
    }

    #[test]
    fn invalid_plan_is_rejected_before_io() {
        let plan = InstallPlan {
            partitions: vec![crate::plan::Partition::new("")],
            ..Default::default()
        };
        let result = FilesystemVerifier::run(
            plan,
            Rc::new(StubDynamicPartitionControl),
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(result.unwrap_err(), ErrorCode::FilesystemVerifier);
    }

    #[test]
    fn one_terminal_outcome_even_if_cancelled_late() {
        struct CountingDelegate(Rc<RefCell<usize>>);

        impl VerifyDelegate for CountingDelegate {
            fn on_complete(&mut self, _result: Result<InstallPlan, ErrorCode>) {
                *self.0.borrow_mut() += 1;
            }
        }

        let completions = Rc::new(RefCell::new(0));
        let queue = TaskQueue::new();
        let verifier = FilesystemVerifier::new(
            InstallPlan::default(),
            Rc::new(StubDynamicPartitionControl),
            Rc::clone(&queue),
            Box::new(CountingDelegate(Rc::clone(&completions))),
            Arc::new(AtomicBool::new(false)),
        );

        FilesystemVerifier::start(&verifier);
        queue.run_until_idle();
        FilesystemVerifier::cancel(&verifier);

        assert_eq!(*completions.borrow(), 1);
    }
}
