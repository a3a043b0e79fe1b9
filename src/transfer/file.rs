//! Pre-sized, memory-mapped receiver files (spec §4.5.3, §6.4).
//!
//! Grounded on the original implementation's `fallocate`/`OpenFile` pair:
//! a freshly-created file is pre-sized to its declared length before being
//! mapped, so later chunk writes are plain `memcpy`s into an
//! already-allocated region instead of growing the file incrementally.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::EngineError;

#[cfg(unix)]
fn fallocate(file: &File, size: u64) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    if size == 0 {
        return Ok(());
    }
    // SAFETY: `file` outlives the call and its fd is valid for its duration.
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, size as libc::off_t) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Portable fallback when the platform has no `fallocate`: `set_len` grows
/// the file (sparse, effectively zero-filled) to the declared size.
#[cfg(not(unix))]
fn fallocate(file: &File, size: u64) -> std::io::Result<()> {
    file.set_len(size)
}

/// Opens `path` for receiving, pre-sizing it to `size` bytes if it doesn't
/// already exist, and returns a read-write memory map of the whole file —
/// or `None` for a declared size of 0, since memmap2 refuses to map a
/// zero-length file and there is nothing to write through it anyway. The
/// file itself is still created (or left alone if it already existed), and
/// is left at exactly 0 bytes (spec §6.4: files are "truncated/allocated to
/// the declared size").
///
/// Permissions on the created file are the platform default (0o644 on
/// Unix); matching the sender's permissions is explicitly out of scope.
pub fn open_for_receive(path: &Path, size: u64) -> Result<Option<MmapMut>, EngineError> {
    let existed = path.exists();
    let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
    if !existed {
        fallocate(&file, size)?;
    }
    if size == 0 {
        return Ok(None);
    }
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok(Some(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pre_sizes_new_file_to_declared_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let map = open_for_receive(&path, 4096).unwrap().unwrap();
        assert_eq!(map.len(), 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }

    #[test]
    fn reopening_existing_file_does_not_resize() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, vec![7u8; 10]).unwrap();
        let map = open_for_receive(&path, 10).unwrap().unwrap();
        assert_eq!(&map[..], &[7u8; 10][..]);
    }

    #[test]
    fn zero_size_file_is_not_mapped_and_left_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        let map = open_for_receive(&path, 0).unwrap();
        assert!(map.is_none());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
