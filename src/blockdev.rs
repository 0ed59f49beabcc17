// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::warn;

/// Toggle the kernel's read-only flag on a block device. The flag affects
/// future opens, so this must run before the device is opened for writing.
#[cfg(target_os = "linux")]
fn set_device_readonly(path: &Path, readonly: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // BLKROSET from <linux/fs.h>: _IO(0x12, 93).
    const BLKROSET: libc::c_ulong = 0x125d;

    let file = File::open(path)?;
    let value: libc::c_int = readonly.into();
    // SAFETY: BLKROSET reads a single c_int from the pointer and the fd stays
    // open for the duration of the call.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKROSET as _, &value) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_device_readonly(_path: &Path, _readonly: bool) -> io::Result<()> {
    Ok(())
}

/// A partition opened as a block device. A single [`Read::read`] call behaves
/// as one logical positioned read: interrupted reads are retried and short
/// reads are resumed, so the result is only smaller than the buffer at EOF.
#[derive(Debug)]
pub struct BlockDevice {
    file: File,
    path: PathBuf,
}

impl BlockDevice {
    /// Open the device at `path`. The kernel read-only flag is flipped to
    /// match `writable` first; not every kernel exposes the control, so a
    /// failure there is only warned about.
    pub fn open(path: &Path, writable: bool) -> io::Result<Self> {
        if let Err(e) = set_device_readonly(path, !writable) {
            warn!(
                "Failed to set block device {path:?} as {}: {e}",
                if writable { "writable" } else { "read-only" },
            );
        }

        let file = OpenOptions::new().read(true).write(writable).open(path)?;

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for BlockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;

        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(filled)
    }
}

impl Write for BlockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.file.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for BlockDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
