// Copyright (C) 2023 Ant Group. All rights reserved.
// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! The raw filesystem driver API.
//!
//! The `FileSystem` trait is the contract between the API server and filesystem
//! drivers. Its vocabulary is the FUSE wire protocol: inode numbers, opaque file
//! handles and per-opcode argument structs. Implementations that would rather think
//! in path names should use the path layer instead, which adapts a path-oriented
//! filesystem onto this trait.

use std::ffi::CStr;
use std::io;
use std::time::Duration;

use crate::abi::fuse_abi::{Attr, EntryOut, IoctlOut, Kstatfs, SetattrIn};

pub use crate::abi::fuse_abi::{FsOptions, OpenOptions, SetattrValid, ROOT_ID};

/// Information about a path in the file system.
#[derive(Copy, Clone, Debug)]
pub struct Context {
    /// The user ID of the calling process.
    pub uid: u32,
    /// The group ID of the calling process.
    pub gid: u32,
    /// The thread group ID of the calling process.
    pub pid: u32,
}

impl Context {
    /// A context with no credentials, used for server-internal operations.
    pub fn root() -> Self {
        Context {
            uid: 0,
            gid: 0,
            pid: 0,
        }
    }
}

impl From<&crate::abi::fuse_abi::InHeader> for Context {
    fn from(source: &crate::abi::fuse_abi::InHeader) -> Self {
        Context {
            uid: source.uid,
            gid: source.gid,
            pid: source.pid,
        }
    }
}

/// An entry reported to the kernel in reply to LOOKUP and the entry-producing
/// mutations.
#[derive(Copy, Clone, Debug)]
pub struct Entry {
    /// An `Inode` that uniquely identifies this path. During `lookup`, setting this to `0`
    /// means a negative entry: the kernel caches the non-existence for
    /// `entry_timeout`.
    pub inode: u64,
    /// The generation number for this `Entry`. Typically used for network file systems.
    /// An `inode` / `generation` pair must be unique over the lifetime of the file system.
    pub generation: u64,
    /// Inode attributes. Even if `attr_timeout` is zero, `attr` must be correct.
    pub attr: Attr,
    /// How long the values in `attr` should be considered valid.
    pub attr_timeout: Duration,
    /// How long the name associated with this `Entry` should be considered valid.
    pub entry_timeout: Duration,
}

impl Entry {
    /// A negative entry cached by the kernel for `timeout`.
    pub fn negative(timeout: Duration) -> Entry {
        Entry {
            inode: 0,
            generation: 0,
            attr: Attr::default(),
            attr_timeout: Duration::from_secs(0),
            entry_timeout: timeout,
        }
    }
}

impl From<Entry> for EntryOut {
    fn from(entry: Entry) -> EntryOut {
        EntryOut {
            nodeid: entry.inode,
            generation: entry.generation,
            entry_valid: entry.entry_timeout.as_secs(),
            attr_valid: entry.attr_timeout.as_secs(),
            entry_valid_nsec: entry.entry_timeout.subsec_nanos(),
            attr_valid_nsec: entry.attr_timeout.subsec_nanos(),
            attr: entry.attr,
        }
    }
}

/// A single directory entry returned by `readdir`.
#[derive(Copy, Clone, Debug)]
pub struct DirEntry<'a> {
    /// The inode number for this entry, usually `FUSE_UNKNOWN_INO`: the kernel follows
    /// up with a LOOKUP when it needs the real inode.
    pub ino: u64,
    /// Any non-zero value that the kernel can use to identify the current point in the
    /// directory entry stream. Does not need to be the actual physical position. A
    /// value of `0` is reserved to mean "from the beginning" and must never be used.
    pub offset: u64,
    /// The type of this directory entry, `libc::DT_*` values.
    pub type_: u32,
    /// The name of this directory entry.
    pub name: &'a [u8],
}

/// A reply to a `getxattr` request.
pub enum GetxattrReply {
    /// The value of the requested extended attribute.
    Value(Vec<u8>),
    /// The size of the buffer needed to hold the value. Returned when the `size`
    /// parameter is zero.
    Count(u32),
}

/// A reply to a `listxattr` request.
pub enum ListxattrReply {
    /// The names of all the extended attributes, each terminated by a nul byte.
    Names(Vec<u8>),
    /// The size of the buffer needed to hold the name list. Returned when the `size`
    /// parameter is zero.
    Count(u32),
}

fn enosys<T>() -> io::Result<T> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// The main trait to implement a userspace filesystem against the FUSE wire protocol.
///
/// Optional operations default to returning `ENOSYS`, which the kernel interprets as
/// "not implemented" and may stop issuing.
#[allow(unused_variables)]
pub trait FileSystem {
    /// Initialize the filesystem.
    ///
    /// `capable` describes the features the kernel offers; the returned set is the
    /// features the filesystem wants enabled.
    fn init(&self, capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    /// Gracefully shut the filesystem down, after the last reply was written.
    fn destroy(&self) {}

    /// Look up a directory entry by name and get its attributes.
    fn lookup(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<Entry> {
        enosys()
    }

    /// Forget about `count` lookups of an inode.
    ///
    /// Called when the kernel removes the inode from its internal caches. There is no
    /// reply.
    fn forget(&self, ctx: Context, inode: u64, count: u64) {}

    /// Forget about multiple inodes at once.
    fn batch_forget(&self, ctx: Context, requests: Vec<(u64, u64)>) {
        for (inode, count) in requests {
            self.forget(ctx, inode, count);
        }
    }

    /// Get attributes for a file or directory.
    ///
    /// `handle` is set when the kernel supplied a file handle; implementations should
    /// prefer it over the inode in that case.
    fn getattr(&self, ctx: Context, inode: u64, handle: Option<u64>) -> io::Result<(Attr, Duration)> {
        enosys()
    }

    /// Set attributes for a file or directory.
    ///
    /// `valid` describes which fields of `attr` carry values to apply.
    fn setattr(
        &self,
        ctx: Context,
        inode: u64,
        attr: SetattrIn,
        handle: Option<u64>,
        valid: SetattrValid,
    ) -> io::Result<(Attr, Duration)> {
        enosys()
    }

    /// Read a symbolic link.
    fn readlink(&self, ctx: Context, inode: u64) -> io::Result<Vec<u8>> {
        enosys()
    }

    /// Create a symbolic link.
    fn symlink(&self, ctx: Context, linkname: &CStr, parent: u64, name: &CStr) -> io::Result<Entry> {
        enosys()
    }

    /// Create a file node (regular file, device, fifo or socket).
    fn mknod(
        &self,
        ctx: Context,
        parent: u64,
        name: &CStr,
        mode: u32,
        rdev: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        enosys()
    }

    /// Create a directory.
    fn mkdir(&self, ctx: Context, parent: u64, name: &CStr, mode: u32, umask: u32) -> io::Result<Entry> {
        enosys()
    }

    /// Remove a file.
    fn unlink(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<()> {
        enosys()
    }

    /// Remove a directory.
    fn rmdir(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<()> {
        enosys()
    }

    /// Rename a file or directory.
    fn rename(
        &self,
        ctx: Context,
        olddir: u64,
        oldname: &CStr,
        newdir: u64,
        newname: &CStr,
    ) -> io::Result<()> {
        enosys()
    }

    /// Create a hard link.
    fn link(&self, ctx: Context, inode: u64, newparent: u64, newname: &CStr) -> io::Result<Entry> {
        enosys()
    }

    /// Open a file, returning an opaque handle and the open flags sent back to the
    /// kernel.
    fn open(&self, ctx: Context, inode: u64, flags: u32) -> io::Result<(Option<u64>, OpenOptions)> {
        // ENOSYS means "no open needed" to the kernel, which stops sending open
        // and release for this filesystem.
        enosys()
    }

    /// Create and open a file.
    fn create(
        &self,
        ctx: Context,
        parent: u64,
        name: &CStr,
        mode: u32,
        flags: u32,
        umask: u32,
    ) -> io::Result<(Entry, Option<u64>, OpenOptions)> {
        enosys()
    }

    /// Read data from a file into `w`, up to `size` bytes at `offset`.
    fn read(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        w: &mut dyn io::Write,
        size: u32,
        offset: u64,
        lock_owner: Option<u64>,
        flags: u32,
    ) -> io::Result<usize> {
        enosys()
    }

    /// Write `data` to a file at `offset`.
    fn write(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        data: &[u8],
        offset: u64,
        lock_owner: Option<u64>,
        delayed_write: bool,
        flags: u32,
    ) -> io::Result<usize> {
        enosys()
    }

    /// Flush the contents of a file on each close(2) of the opened file.
    fn flush(&self, ctx: Context, inode: u64, handle: u64, lock_owner: u64) -> io::Result<()> {
        enosys()
    }

    /// Synchronize file contents.
    fn fsync(&self, ctx: Context, inode: u64, datasync: bool, handle: u64) -> io::Result<()> {
        enosys()
    }

    /// Release an open file, once there are no more references to it.
    fn release(
        &self,
        ctx: Context,
        inode: u64,
        flags: u32,
        handle: u64,
        flush: bool,
        flock_release: bool,
        lock_owner: Option<u64>,
    ) -> io::Result<()> {
        enosys()
    }

    /// Get filesystem statistics.
    fn statfs(&self, ctx: Context, inode: u64) -> io::Result<Kstatfs> {
        // Safe to return the default: zeroes mean "not supported" to the kernel.
        let mut st = Kstatfs::default();
        st.namelen = 255;
        st.bsize = 512;
        Ok(st)
    }

    /// Open a directory.
    fn opendir(&self, ctx: Context, inode: u64, flags: u32) -> io::Result<(Option<u64>, OpenOptions)> {
        // Same contract as open: ENOSYS means opendir is not needed.
        enosys()
    }

    /// Read the next batch of directory entries.
    ///
    /// `add_entry` serializes one entry into the reply and returns the space it
    /// consumed, or `0` when the entry does not fit the remaining `size` budget; the
    /// implementation must then stop and keep the entry for the next call.
    fn readdir(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        enosys()
    }

    /// Release an open directory.
    fn releasedir(&self, ctx: Context, inode: u64, flags: u32, handle: u64) -> io::Result<()> {
        enosys()
    }

    /// Synchronize the contents of a directory.
    fn fsyncdir(&self, ctx: Context, inode: u64, datasync: bool, handle: u64) -> io::Result<()> {
        enosys()
    }

    /// Check file access permissions.
    fn access(&self, ctx: Context, inode: u64, mask: u32) -> io::Result<()> {
        enosys()
    }

    /// Set an extended attribute.
    fn setxattr(&self, ctx: Context, inode: u64, name: &CStr, value: &[u8], flags: u32) -> io::Result<()> {
        enosys()
    }

    /// Get an extended attribute.
    fn getxattr(&self, ctx: Context, inode: u64, name: &CStr, size: u32) -> io::Result<GetxattrReply> {
        enosys()
    }

    /// List extended attribute names.
    fn listxattr(&self, ctx: Context, inode: u64, size: u32) -> io::Result<ListxattrReply> {
        enosys()
    }

    /// Remove an extended attribute.
    fn removexattr(&self, ctx: Context, inode: u64, name: &CStr) -> io::Result<()> {
        enosys()
    }

    /// Ioctl on a file or directory.
    fn ioctl(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        flags: u32,
        cmd: u32,
        arg: u64,
        in_size: u32,
        out_size: u32,
    ) -> io::Result<(IoctlOut, Vec<u8>)> {
        enosys()
    }

    /// Map a block index within a file to a block index within the backing device.
    fn bmap(&self, ctx: Context, inode: u64, block: u64, blocksize: u32) -> io::Result<u64> {
        enosys()
    }

    /// Poll for IO readiness.
    fn poll(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        khandle: u64,
        flags: u32,
        events: u32,
    ) -> io::Result<u32> {
        enosys()
    }

    /// Observe an INTERRUPT for the in-flight request `unique`.
    ///
    /// Abandoning the targeted request is best effort: the interrupt may arrive
    /// before, during or after the handler body. There is no reply.
    fn interrupt(&self, ctx: Context, unique: u64) {}
}

// A shared filesystem serves requests like the filesystem itself, so a connector can
// live both inside a server and in the hands of the code mounting sub-filesystems.
impl<F: FileSystem + ?Sized> FileSystem for std::sync::Arc<F> {
    fn init(&self, capable: FsOptions) -> io::Result<FsOptions> {
        (**self).init(capable)
    }

    fn destroy(&self) {
        (**self).destroy()
    }

    fn lookup(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<Entry> {
        (**self).lookup(ctx, parent, name)
    }

    fn forget(&self, ctx: Context, inode: u64, count: u64) {
        (**self).forget(ctx, inode, count)
    }

    fn batch_forget(&self, ctx: Context, requests: Vec<(u64, u64)>) {
        (**self).batch_forget(ctx, requests)
    }

    fn getattr(&self, ctx: Context, inode: u64, handle: Option<u64>) -> io::Result<(Attr, Duration)> {
        (**self).getattr(ctx, inode, handle)
    }

    fn setattr(
        &self,
        ctx: Context,
        inode: u64,
        attr: SetattrIn,
        handle: Option<u64>,
        valid: SetattrValid,
    ) -> io::Result<(Attr, Duration)> {
        (**self).setattr(ctx, inode, attr, handle, valid)
    }

    fn readlink(&self, ctx: Context, inode: u64) -> io::Result<Vec<u8>> {
        (**self).readlink(ctx, inode)
    }

    fn symlink(&self, ctx: Context, linkname: &CStr, parent: u64, name: &CStr) -> io::Result<Entry> {
        (**self).symlink(ctx, linkname, parent, name)
    }

    fn mknod(
        &self,
        ctx: Context,
        parent: u64,
        name: &CStr,
        mode: u32,
        rdev: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        (**self).mknod(ctx, parent, name, mode, rdev, umask)
    }

    fn mkdir(&self, ctx: Context, parent: u64, name: &CStr, mode: u32, umask: u32) -> io::Result<Entry> {
        (**self).mkdir(ctx, parent, name, mode, umask)
    }

    fn unlink(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<()> {
        (**self).unlink(ctx, parent, name)
    }

    fn rmdir(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<()> {
        (**self).rmdir(ctx, parent, name)
    }

    fn rename(
        &self,
        ctx: Context,
        olddir: u64,
        oldname: &CStr,
        newdir: u64,
        newname: &CStr,
    ) -> io::Result<()> {
        (**self).rename(ctx, olddir, oldname, newdir, newname)
    }

    fn link(&self, ctx: Context, inode: u64, newparent: u64, newname: &CStr) -> io::Result<Entry> {
        (**self).link(ctx, inode, newparent, newname)
    }

    fn open(&self, ctx: Context, inode: u64, flags: u32) -> io::Result<(Option<u64>, OpenOptions)> {
        (**self).open(ctx, inode, flags)
    }

    fn create(
        &self,
        ctx: Context,
        parent: u64,
        name: &CStr,
        mode: u32,
        flags: u32,
        umask: u32,
    ) -> io::Result<(Entry, Option<u64>, OpenOptions)> {
        (**self).create(ctx, parent, name, mode, flags, umask)
    }

    fn read(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        w: &mut dyn io::Write,
        size: u32,
        offset: u64,
        lock_owner: Option<u64>,
        flags: u32,
    ) -> io::Result<usize> {
        (**self).read(ctx, inode, handle, w, size, offset, lock_owner, flags)
    }

    fn write(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        data: &[u8],
        offset: u64,
        lock_owner: Option<u64>,
        delayed_write: bool,
        flags: u32,
    ) -> io::Result<usize> {
        (**self).write(ctx, inode, handle, data, offset, lock_owner, delayed_write, flags)
    }

    fn flush(&self, ctx: Context, inode: u64, handle: u64, lock_owner: u64) -> io::Result<()> {
        (**self).flush(ctx, inode, handle, lock_owner)
    }

    fn fsync(&self, ctx: Context, inode: u64, datasync: bool, handle: u64) -> io::Result<()> {
        (**self).fsync(ctx, inode, datasync, handle)
    }

    fn release(
        &self,
        ctx: Context,
        inode: u64,
        flags: u32,
        handle: u64,
        flush: bool,
        flock_release: bool,
        lock_owner: Option<u64>,
    ) -> io::Result<()> {
        (**self).release(ctx, inode, flags, handle, flush, flock_release, lock_owner)
    }

    fn statfs(&self, ctx: Context, inode: u64) -> io::Result<Kstatfs> {
        (**self).statfs(ctx, inode)
    }

    fn opendir(&self, ctx: Context, inode: u64, flags: u32) -> io::Result<(Option<u64>, OpenOptions)> {
        (**self).opendir(ctx, inode, flags)
    }

    fn readdir(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        (**self).readdir(ctx, inode, handle, size, offset, add_entry)
    }

    fn releasedir(&self, ctx: Context, inode: u64, flags: u32, handle: u64) -> io::Result<()> {
        (**self).releasedir(ctx, inode, flags, handle)
    }

    fn fsyncdir(&self, ctx: Context, inode: u64, datasync: bool, handle: u64) -> io::Result<()> {
        (**self).fsyncdir(ctx, inode, datasync, handle)
    }

    fn access(&self, ctx: Context, inode: u64, mask: u32) -> io::Result<()> {
        (**self).access(ctx, inode, mask)
    }

    fn setxattr(&self, ctx: Context, inode: u64, name: &CStr, value: &[u8], flags: u32) -> io::Result<()> {
        (**self).setxattr(ctx, inode, name, value, flags)
    }

    fn getxattr(&self, ctx: Context, inode: u64, name: &CStr, size: u32) -> io::Result<GetxattrReply> {
        (**self).getxattr(ctx, inode, name, size)
    }

    fn listxattr(&self, ctx: Context, inode: u64, size: u32) -> io::Result<ListxattrReply> {
        (**self).listxattr(ctx, inode, size)
    }

    fn removexattr(&self, ctx: Context, inode: u64, name: &CStr) -> io::Result<()> {
        (**self).removexattr(ctx, inode, name)
    }

    fn ioctl(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        flags: u32,
        cmd: u32,
        arg: u64,
        in_size: u32,
        out_size: u32,
    ) -> io::Result<(IoctlOut, Vec<u8>)> {
        (**self).ioctl(ctx, inode, handle, flags, cmd, arg, in_size, out_size)
    }

    fn bmap(&self, ctx: Context, inode: u64, block: u64, blocksize: u32) -> io::Result<u64> {
        (**self).bmap(ctx, inode, block, blocksize)
    }

    fn poll(
        &self,
        ctx: Context,
        inode: u64,
        handle: u64,
        khandle: u64,
        flags: u32,
        events: u32,
    ) -> io::Result<u32> {
        (**self).poll(ctx, inode, handle, khandle, flags, events)
    }

    fn interrupt(&self, ctx: Context, unique: u64) {
        (**self).interrupt(ctx, unique)
    }
}
