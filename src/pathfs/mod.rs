// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A filesystem API that uses paths rather than inodes.
//!
//! User code implements [`PathFilesystem`] and [`PathFile`] in terms of relative path
//! strings; the [`PathFileSystemConnector`] tracks the inode/path correspondence the
//! kernel expects, including lookup counts, hard links, renames and sub-mounts.
//!
//! A minimal file system should have at least a functional `get_attr` method.
//! Typically, each call happens on its own thread, so take care to make the file
//! system thread-safe.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::abi::fuse_abi::{Attr, Kstatfs};
use crate::api::filesystem::Context;

mod connector;
mod dir;
mod handle;
mod inode;
mod loopback;

pub use connector::PathFileSystemConnector;
pub use dir::DirHandle;
pub use handle::HandleMap;
pub use loopback::LoopbackFs;

/// Replace the owner of every attribute reported to the kernel.
#[derive(Debug, Copy, Clone)]
pub struct Owner {
    /// User id stamped into every attribute reply.
    pub uid: u32,
    /// Group id stamped into every attribute reply.
    pub gid: u32,
}

impl Owner {
    /// The uid/gid of the current process.
    pub fn current() -> Owner {
        // Trivially safe, these syscalls never fail.
        unsafe {
            Owner {
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }
}

/// Per-mount options of a path filesystem.
#[derive(Debug, Clone)]
pub struct FileSystemOptions {
    /// How long the kernel may cache directory entries.
    pub entry_timeout: Duration,
    /// How long the kernel may cache attributes.
    pub attr_timeout: Duration,
    /// How long the kernel may cache the non-existence of a name. Zero disables
    /// negative caching.
    pub negative_timeout: Duration,
    /// If set, replace all uids/gids in attribute replies with the given owner.
    pub owner: Option<Owner>,
    /// If set, drop the verification bits from node ids and handles. This keeps inode
    /// numbers below 2^31, which 32-bit `stat()` callers require, at the price of not
    /// detecting stale handles.
    pub skip_check_handles: bool,
}

impl Default for FileSystemOptions {
    // The default copied from libfuse: (1s, 1s, 0s).
    fn default() -> Self {
        FileSystemOptions {
            entry_timeout: Duration::from_secs(1),
            attr_timeout: Duration::from_secs(1),
            negative_timeout: Duration::from_secs(0),
            owner: None,
            skip_check_handles: false,
        }
    }
}

/// A directory entry produced by a path filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    /// File name within the directory.
    pub name: String,
    /// Full mode bits; only the file type bits are reported to the kernel.
    pub mode: u32,
}

/// A lazy, finite stream of directory entries.
pub type DirStream = Box<dyn Iterator<Item = DirEntry> + Send>;

fn enosys<T>() -> io::Result<T> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// A file object returned from [`PathFilesystem::open`] and [`PathFilesystem::create`].
///
/// Optional operations default to returning `ENOSYS`.
#[allow(unused_variables)]
pub trait PathFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`, returning the number of bytes read.
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        enosys()
    }

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        enosys()
    }

    /// Truncate the file to `size` bytes.
    fn truncate(&self, size: u64) -> io::Result<()> {
        enosys()
    }

    /// Attributes of the open file.
    fn get_attr(&self) -> io::Result<Attr> {
        enosys()
    }

    /// Change the mode bits of the open file.
    fn chmod(&self, mode: u32) -> io::Result<()> {
        enosys()
    }

    /// Change the owner of the open file.
    fn chown(&self, uid: u32, gid: u32) -> io::Result<()> {
        enosys()
    }

    /// Change the timestamps of the open file, nanosecond precision.
    fn utimens(&self, atime_ns: u64, mtime_ns: u64) -> io::Result<()> {
        enosys()
    }

    /// Called on each close(2) of the opened file.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Synchronize the file contents.
    fn fsync(&self, datasync: bool) -> io::Result<()> {
        Ok(())
    }

    /// The last reference to the open file is gone.
    fn release(&self) {}
}

/// The path-oriented filesystem contract.
///
/// All paths are relative to the filesystem root and never start with `/`; the root
/// itself is the empty string. Operations that this filesystem does not support
/// default to returning `ENOSYS`.
#[allow(unused_variables)]
pub trait PathFilesystem: Send + Sync {
    /// Used for pretty printing.
    fn name(&self) -> String {
        "pathfs".to_string()
    }

    /// Attributes of `path`. The one operation a useful filesystem must implement.
    fn get_attr(&self, path: &str, ctx: &Context) -> io::Result<Attr>;

    /// Change permission bits. Should update ctime too.
    fn chmod(&self, path: &str, mode: u32, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Change the owner. Should update ctime too.
    fn chown(&self, path: &str, uid: u32, gid: u32, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Change timestamps, nanosecond precision.
    fn utimens(&self, path: &str, atime_ns: u64, mtime_ns: u64, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Truncate `path` to `size` bytes.
    fn truncate(&self, path: &str, size: u64, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Check access permissions.
    fn access(&self, path: &str, mask: u32, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Create a hard link `new_path` to `old_path`.
    fn link(&self, old_path: &str, new_path: &str, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Create a directory.
    fn mkdir(&self, path: &str, mode: u32, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Create a file node.
    fn mknod(&self, path: &str, mode: u32, rdev: u32, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Rename a file or directory.
    fn rename(&self, old_path: &str, new_path: &str, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Remove a directory.
    fn rmdir(&self, path: &str, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Remove a file.
    fn unlink(&self, path: &str, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Create a symlink at `path` pointing to `target`.
    fn symlink(&self, target: &str, path: &str, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Read the target of a symlink.
    fn readlink(&self, path: &str, ctx: &Context) -> io::Result<String> {
        enosys()
    }

    /// Open a file. If opening for writing, the file's mtime should be updated too.
    fn open(&self, path: &str, flags: u32, ctx: &Context) -> io::Result<Arc<dyn PathFile>> {
        enosys()
    }

    /// Create and open a file.
    fn create(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
        ctx: &Context,
    ) -> io::Result<Arc<dyn PathFile>> {
        enosys()
    }

    /// Open a directory, returning a lazy entry stream.
    fn open_dir(&self, path: &str, ctx: &Context) -> io::Result<DirStream> {
        enosys()
    }

    /// Called when a file opened for read/write is flushed, after the file object's
    /// own flush.
    fn flush(&self, path: &str) -> io::Result<()> {
        Ok(())
    }

    /// Filesystem statistics.
    fn statfs(&self, path: &str) -> io::Result<Kstatfs> {
        enosys()
    }

    /// Get an extended attribute.
    fn get_xattr(&self, path: &str, name: &str, ctx: &Context) -> io::Result<Vec<u8>> {
        enosys()
    }

    /// Set an extended attribute.
    fn set_xattr(
        &self,
        path: &str,
        name: &str,
        value: &[u8],
        flags: u32,
        ctx: &Context,
    ) -> io::Result<()> {
        enosys()
    }

    /// List extended attribute names.
    fn list_xattr(&self, path: &str, ctx: &Context) -> io::Result<Vec<String>> {
        enosys()
    }

    /// Remove an extended attribute.
    fn remove_xattr(&self, path: &str, name: &str, ctx: &Context) -> io::Result<()> {
        enosys()
    }

    /// Called after the filesystem was attached to a connector.
    fn on_mount(&self, connector: &Arc<PathFileSystemConnector>) {}

    /// Called after the filesystem was detached from its connector.
    fn on_unmount(&self) {}

    /// Drop any internal caches the filesystem keeps.
    fn drop_caches(&self) {}
}

/// A file that swallows writes and reports no content, in the manner of /dev/null.
pub struct DevNullFile;

impl PathFile for DevNullFile {
    fn read(&self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
        Ok(0)
    }

    fn write(&self, data: &[u8], _offset: u64) -> io::Result<usize> {
        Ok(data.len())
    }

    fn truncate(&self, _size: u64) -> io::Result<()> {
        Ok(())
    }

    fn get_attr(&self) -> io::Result<Attr> {
        let mut attr = Attr::default();
        attr.mode = libc::S_IFREG | 0o666;
        Ok(attr)
    }
}

/// A read-only file serving a static byte string.
pub struct StaticFile {
    data: Vec<u8>,
}

impl StaticFile {
    /// Wrap `data` into a read-only file object.
    pub fn new(data: Vec<u8>) -> StaticFile {
        StaticFile { data }
    }
}

impl PathFile for StaticFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let data = &self.data[offset as usize..];
        let count = std::cmp::min(buf.len(), data.len());
        buf[..count].copy_from_slice(&data[..count]);
        Ok(count)
    }

    fn get_attr(&self) -> io::Result<Attr> {
        let mut attr = Attr::default();
        attr.mode = libc::S_IFREG | 0o444;
        attr.size = self.data.len() as u64;
        Ok(attr)
    }
}

/// Block size used when materializing file contents across filesystems.
pub const COPY_BLOCK_SIZE: usize = 128 * 1024;

/// Copy a regular file from `src_fs` to `dst_fs` in [`COPY_BLOCK_SIZE`] blocks.
///
/// The destination is created with `O_TRUNC | O_WRONLY` and the given mode.
pub fn copy_file(
    src_fs: &dyn PathFilesystem,
    dst_fs: &dyn PathFilesystem,
    src_path: &str,
    dst_path: &str,
    mode: u32,
    ctx: &Context,
) -> io::Result<()> {
    let src = src_fs.open(src_path, libc::O_RDONLY as u32, ctx)?;
    let dst = dst_fs.create(
        dst_path,
        (libc::O_WRONLY | libc::O_TRUNC) as u32,
        mode & 0o7777,
        ctx,
    )?;

    let mut buf = vec![0u8; COPY_BLOCK_SIZE];
    let mut offset = 0u64;
    loop {
        let count = src.read(&mut buf, offset)?;
        if count == 0 {
            break;
        }
        let mut written = 0;
        while written < count {
            let n = dst.write(&buf[written..count], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole block",
                ));
            }
            written += n;
        }
        offset += count as u64;
    }
    dst.flush()?;
    dst.release();
    src.release();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_file() {
        let f = StaticFile::new(b"hello world".to_vec());
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(f.read(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(f.read(&mut buf, 11).unwrap(), 0);
        assert_eq!(f.get_attr().unwrap().size, 11);
    }

    #[test]
    fn test_dev_null_file() {
        let f = DevNullFile;
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf, 0).unwrap(), 0);
        assert_eq!(f.write(b"data", 0).unwrap(), 4);
    }
}
