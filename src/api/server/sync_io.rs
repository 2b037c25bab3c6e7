// Copyright (C) 2023 Ant Group. All rights reserved.
// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

use std::io::{self, Write};
use std::mem::size_of;
use std::sync::Arc;
use std::time::Duration;

use vm_memory::ByteValued;

use super::{Server, ServerUtil, ServerVersion, DIRENT_PADDING, MAX_BUFFER_SIZE};
use crate::abi::fuse_abi::*;
use crate::api::filesystem::{Context, DirEntry, FileSystem, GetxattrReply, ListxattrReply};
use crate::transport::{Reader, Writer};
use crate::{bytes_to_cstr, encode_io_error_kind, Error, Result};

impl<F: FileSystem + Sync> Server<F> {
    /// Main entrance to handle requests from the transport layer.
    ///
    /// It parses the request according to the Fuse ABI, invokes the filesystem driver
    /// to serve the request, and eventually sends back the result to the transport
    /// layer. Protocol level failures never reach the driver: an unknown opcode is
    /// answered with `ENOSYS` and an underlength payload with `EIO`.
    #[allow(clippy::cognitive_complexity)]
    pub fn handle_message(&self, mut r: Reader, w: Writer) -> Result<usize> {
        let in_header: InHeader = r.read_obj().map_err(Error::DecodeMessage)?;
        if in_header.len > MAX_BUFFER_SIZE {
            return reply_error_explicit(
                io::Error::from_raw_os_error(libc::ENOMEM),
                in_header.unique,
                w,
            );
        }

        let info = opcode_info(in_header.opcode);
        trace!("fuse: new req {}: {:?}", info.name, in_header);

        if Opcode::from(in_header.opcode) == Opcode::MaxOpcode {
            return reply_error(
                io::Error::from_raw_os_error(libc::ENOSYS),
                in_header.unique,
                w,
            );
        }
        if r.available_bytes() < info.in_size {
            warn!(
                "fuse: short payload for {}: {} < {}",
                info.name,
                r.available_bytes(),
                info.in_size
            );
            return reply_error(
                io::Error::from_raw_os_error(libc::EIO),
                in_header.unique,
                w,
            );
        }

        match Opcode::from(in_header.opcode) {
            Opcode::Lookup => self.lookup(&in_header, r, w),
            Opcode::Forget => self.forget(&in_header, r), // No reply.
            Opcode::Getattr => self.getattr(&in_header, r, w),
            Opcode::Setattr => self.setattr(&in_header, r, w),
            Opcode::Readlink => self.readlink(&in_header, w),
            Opcode::Symlink => self.symlink(&in_header, r, w),
            Opcode::Mknod => self.mknod(&in_header, r, w),
            Opcode::Mkdir => self.mkdir(&in_header, r, w),
            Opcode::Unlink => self.unlink(&in_header, r, w),
            Opcode::Rmdir => self.rmdir(&in_header, r, w),
            Opcode::Rename => self.rename(&in_header, r, w),
            Opcode::Link => self.link(&in_header, r, w),
            Opcode::Open => self.open(&in_header, r, w),
            Opcode::Read => self.read(&in_header, r, w),
            Opcode::Write => self.write(&in_header, r, w),
            Opcode::Statfs => self.statfs(&in_header, w),
            Opcode::Release => self.release(&in_header, r, w),
            Opcode::Fsync => self.fsync(&in_header, r, w),
            Opcode::Setxattr => self.setxattr(&in_header, r, w),
            Opcode::Getxattr => self.getxattr(&in_header, r, w),
            Opcode::Listxattr => self.listxattr(&in_header, r, w),
            Opcode::Removexattr => self.removexattr(&in_header, r, w),
            Opcode::Flush => self.flush(&in_header, r, w),
            Opcode::Init => self.init(&in_header, r, w),
            Opcode::Opendir => self.opendir(&in_header, r, w),
            Opcode::Readdir => self.readdir(&in_header, r, w),
            Opcode::Releasedir => self.releasedir(&in_header, r, w),
            Opcode::Fsyncdir => self.fsyncdir(&in_header, r, w),
            Opcode::Access => self.access(&in_header, r, w),
            Opcode::Create => self.create(&in_header, r, w),
            Opcode::Interrupt => self.interrupt(&in_header, r),
            Opcode::Bmap => self.bmap(&in_header, r, w),
            Opcode::Destroy => self.destroy(),
            Opcode::Ioctl => self.ioctl(&in_header, r, w),
            Opcode::Poll => self.poll(&in_header, r, w),
            Opcode::BatchForget => self.batch_forget(&in_header, r, w),
            // Remaining known opcodes (lock management, notify replies) are not served.
            _ => reply_error(
                io::Error::from_raw_os_error(libc::ENOSYS),
                in_header.unique,
                w,
            ),
        }
    }

    fn lookup(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let buf = ServerUtil::get_message_body(&mut r, in_header, 0)?;
        let name = bytes_to_cstr(buf.as_ref())?;
        let version = self.vers.load();
        let result = self
            .fs
            .lookup(Context::from(in_header), in_header.nodeid, name);

        match result {
            // before ABI 7.4 inode == 0 was invalid, only ENOENT means negative dentry
            Ok(entry)
                if version.minor < KERNEL_MINOR_VERSION_LOOKUP_NEGATIVE_ENTRY_ZERO
                    && entry.inode == 0 =>
            {
                reply_error(
                    io::Error::from_raw_os_error(libc::ENOENT),
                    in_header.unique,
                    w,
                )
            }
            Ok(entry) => reply_ok(Some(EntryOut::from(entry)), None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn forget(&self, in_header: &InHeader, mut r: Reader) -> Result<usize> {
        let ForgetIn { nlookup } = r.read_obj().map_err(Error::DecodeMessage)?;

        self.fs
            .forget(Context::from(in_header), in_header.nodeid, nlookup);

        // There is no reply for forget messages.
        Ok(0)
    }

    fn getattr(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let GetattrIn { flags, fh, .. } = r.read_obj().map_err(Error::DecodeMessage)?;
        let handle = if (flags & GETATTR_FH) != 0 {
            Some(fh)
        } else {
            None
        };
        let result = self
            .fs
            .getattr(Context::from(in_header), in_header.nodeid, handle);

        handle_attr_result(in_header, w, result)
    }

    fn setattr(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let setattr_in: SetattrIn = r.read_obj().map_err(Error::DecodeMessage)?;
        let handle = if setattr_in.valid & FATTR_FH != 0 {
            Some(setattr_in.fh)
        } else {
            None
        };
        let valid = SetattrValid::from_bits_truncate(setattr_in.valid);
        let result = self.fs.setattr(
            Context::from(in_header),
            in_header.nodeid,
            setattr_in,
            handle,
            valid,
        );

        handle_attr_result(in_header, w, result)
    }

    pub(super) fn readlink(&self, in_header: &InHeader, w: Writer) -> Result<usize> {
        match self
            .fs
            .readlink(Context::from(in_header), in_header.nodeid)
        {
            Ok(linkname) => {
                // We need to disambiguate the option type here even though it is `None`.
                reply_ok(None::<u8>, Some(&linkname), in_header.unique, w)
            }
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn symlink(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let buf = ServerUtil::get_message_body(&mut r, in_header, 0)?;
        // The name and linkname are encoded one after another and separated by a nul character.
        let (name, linkname) = ServerUtil::extract_two_cstrs(&buf)?;

        match self.fs.symlink(
            Context::from(in_header),
            linkname,
            in_header.nodeid,
            name,
        ) {
            Ok(entry) => reply_ok(Some(EntryOut::from(entry)), None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn mknod(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let MknodIn {
            mode, rdev, umask, ..
        } = r.read_obj().map_err(Error::DecodeMessage)?;
        let buf = ServerUtil::get_message_body(&mut r, in_header, size_of::<MknodIn>())?;
        let name = bytes_to_cstr(buf.as_ref())?;

        match self.fs.mknod(
            Context::from(in_header),
            in_header.nodeid,
            name,
            mode,
            rdev,
            umask,
        ) {
            Ok(entry) => reply_ok(Some(EntryOut::from(entry)), None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn mkdir(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let MkdirIn { mode, umask } = r.read_obj().map_err(Error::DecodeMessage)?;
        let buf = ServerUtil::get_message_body(&mut r, in_header, size_of::<MkdirIn>())?;
        let name = bytes_to_cstr(buf.as_ref())?;

        match self.fs.mkdir(
            Context::from(in_header),
            in_header.nodeid,
            name,
            mode,
            umask,
        ) {
            Ok(entry) => reply_ok(Some(EntryOut::from(entry)), None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn unlink(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let buf = ServerUtil::get_message_body(&mut r, in_header, 0)?;
        let name = bytes_to_cstr(buf.as_ref())?;

        match self
            .fs
            .unlink(Context::from(in_header), in_header.nodeid, name)
        {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn rmdir(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let buf = ServerUtil::get_message_body(&mut r, in_header, 0)?;
        let name = bytes_to_cstr(buf.as_ref())?;

        match self
            .fs
            .rmdir(Context::from(in_header), in_header.nodeid, name)
        {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn rename(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let RenameIn { newdir } = r.read_obj().map_err(Error::DecodeMessage)?;
        let buf = ServerUtil::get_message_body(&mut r, in_header, size_of::<RenameIn>())?;
        let (oldname, newname) = ServerUtil::extract_two_cstrs(&buf)?;

        match self.fs.rename(
            Context::from(in_header),
            in_header.nodeid,
            oldname,
            newdir,
            newname,
        ) {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn link(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let LinkIn { oldnodeid } = r.read_obj().map_err(Error::DecodeMessage)?;
        let buf = ServerUtil::get_message_body(&mut r, in_header, size_of::<LinkIn>())?;
        let name = bytes_to_cstr(buf.as_ref())?;

        match self.fs.link(
            Context::from(in_header),
            oldnodeid,
            in_header.nodeid,
            name,
        ) {
            Ok(entry) => reply_ok(Some(EntryOut::from(entry)), None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    fn open(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let OpenIn { flags, .. } = r.read_obj().map_err(Error::DecodeMessage)?;

        match self
            .fs
            .open(Context::from(in_header), in_header.nodeid, flags)
        {
            Ok((handle, opts)) => {
                let out = OpenOut {
                    fh: handle.unwrap_or(0),
                    open_flags: opts.bits(),
                    ..Default::default()
                };

                reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    fn read(&self, in_header: &InHeader, mut r: Reader, mut w: Writer) -> Result<usize> {
        let ReadIn {
            fh,
            offset,
            size,
            read_flags,
            lock_owner,
            flags,
            ..
        } = r.read_obj().map_err(Error::DecodeMessage)?;

        if size > MAX_BUFFER_SIZE {
            return reply_error_explicit(
                io::Error::from_raw_os_error(libc::ENOMEM),
                in_header.unique,
                w,
            );
        }

        let owner = if read_flags & READ_LOCKOWNER != 0 {
            Some(lock_owner)
        } else {
            None
        };

        // Split the writer into 2 pieces: one for the `OutHeader` and the rest for the data.
        let mut data_writer = match w.split_at(size_of::<OutHeader>()) {
            Ok(v) => v,
            Err(_e) => return Err(Error::InvalidHeaderLength),
        };

        match self.fs.read(
            Context::from(in_header),
            in_header.nodeid,
            fh,
            &mut data_writer,
            size,
            offset,
            owner,
            flags,
        ) {
            Ok(count) => {
                // Don't use `reply_ok` because we need to set a custom size length for the
                // header.
                let out = OutHeader {
                    len: (size_of::<OutHeader>() + count) as u32,
                    error: 0,
                    unique: in_header.unique,
                };

                w.write_all(out.as_slice()).map_err(Error::EncodeMessage)?;
                w.commit(Some(&data_writer)).map_err(Error::EncodeMessage)?;
                Ok(out.len as usize)
            }
            Err(e) => reply_error_explicit(e, in_header.unique, w),
        }
    }

    fn write(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let WriteIn {
            fh,
            offset,
            size,
            write_flags,
            lock_owner,
            flags,
            ..
        } = r.read_obj().map_err(Error::DecodeMessage)?;

        if size > MAX_BUFFER_SIZE {
            return reply_error_explicit(
                io::Error::from_raw_os_error(libc::ENOMEM),
                in_header.unique,
                w,
            );
        }

        let owner = if write_flags & WRITE_LOCKOWNER != 0 {
            Some(lock_owner)
        } else {
            None
        };
        let delayed_write = write_flags & WRITE_CACHE != 0;

        let buf = ServerUtil::get_message_body(&mut r, in_header, size_of::<WriteIn>())?;
        if buf.len() < size as usize {
            return reply_error(
                io::Error::from_raw_os_error(libc::EIO),
                in_header.unique,
                w,
            );
        }

        match self.fs.write(
            Context::from(in_header),
            in_header.nodeid,
            fh,
            &buf[..size as usize],
            offset,
            owner,
            delayed_write,
            flags,
        ) {
            Ok(count) => {
                let out = WriteOut {
                    size: count as u32,
                    ..Default::default()
                };

                reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => reply_error_explicit(e, in_header.unique, w),
        }
    }

    pub(super) fn statfs(&self, in_header: &InHeader, w: Writer) -> Result<usize> {
        match self.fs.statfs(Context::from(in_header), in_header.nodeid) {
            Ok(st) => reply_ok(Some(StatfsOut { st }), None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn release(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let ReleaseIn {
            fh,
            flags,
            release_flags,
            lock_owner,
        } = r.read_obj().map_err(Error::DecodeMessage)?;

        let flush = release_flags & RELEASE_FLUSH != 0;
        let flock_release = release_flags & RELEASE_FLOCK_UNLOCK != 0;
        let lock_owner = if flush || flock_release {
            Some(lock_owner)
        } else {
            None
        };

        match self.fs.release(
            Context::from(in_header),
            in_header.nodeid,
            flags,
            fh,
            flush,
            flock_release,
            lock_owner,
        ) {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    fn fsync(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let FsyncIn {
            fh, fsync_flags, ..
        } = r.read_obj().map_err(Error::DecodeMessage)?;
        let datasync = fsync_flags & FSYNC_FDATASYNC != 0;

        match self
            .fs
            .fsync(Context::from(in_header), in_header.nodeid, datasync, fh)
        {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn setxattr(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let SetxattrIn { size, flags } = r.read_obj().map_err(Error::DecodeMessage)?;
        let buf = ServerUtil::get_message_body(&mut r, in_header, size_of::<SetxattrIn>())?;

        // The name and value and encoded one after another and separated by a '\0' character.
        let split_pos = buf
            .iter()
            .position(|c| *c == b'\0')
            .map(|p| p + 1)
            .ok_or(Error::MissingParameter)?;
        let (name, value) = buf.split_at(split_pos);

        if size != value.len() as u32 {
            return Err(Error::InvalidXattrSize((size, value.len())));
        }

        match self.fs.setxattr(
            Context::from(in_header),
            in_header.nodeid,
            bytes_to_cstr(name)?,
            value,
            flags,
        ) {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn getxattr(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let GetxattrIn { size, .. } = r.read_obj().map_err(Error::DecodeMessage)?;
        if size > MAX_BUFFER_SIZE {
            return reply_error_explicit(
                io::Error::from_raw_os_error(libc::ENOMEM),
                in_header.unique,
                w,
            );
        }

        let buf = ServerUtil::get_message_body(&mut r, in_header, size_of::<GetxattrIn>())?;
        let name = bytes_to_cstr(buf.as_ref())?;

        match self
            .fs
            .getxattr(Context::from(in_header), in_header.nodeid, name, size)
        {
            Ok(GetxattrReply::Value(val)) => reply_ok(None::<u8>, Some(&val), in_header.unique, w),
            Ok(GetxattrReply::Count(count)) => {
                let out = GetxattrOut {
                    size: count,
                    ..Default::default()
                };

                reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn listxattr(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let GetxattrIn { size, .. } = r.read_obj().map_err(Error::DecodeMessage)?;

        if size > MAX_BUFFER_SIZE {
            return reply_error_explicit(
                io::Error::from_raw_os_error(libc::ENOMEM),
                in_header.unique,
                w,
            );
        }

        match self
            .fs
            .listxattr(Context::from(in_header), in_header.nodeid, size)
        {
            Ok(ListxattrReply::Names(val)) => reply_ok(None::<u8>, Some(&val), in_header.unique, w),
            Ok(ListxattrReply::Count(count)) => {
                let out = GetxattrOut {
                    size: count,
                    ..Default::default()
                };

                reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn removexattr(
        &self,
        in_header: &InHeader,
        mut r: Reader,
        w: Writer,
    ) -> Result<usize> {
        let buf = ServerUtil::get_message_body(&mut r, in_header, 0)?;
        let name = bytes_to_cstr(&buf)?;

        match self
            .fs
            .removexattr(Context::from(in_header), in_header.nodeid, name)
        {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn flush(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let FlushIn { fh, lock_owner, .. } = r.read_obj().map_err(Error::DecodeMessage)?;

        match self.fs.flush(
            Context::from(in_header),
            in_header.nodeid,
            fh,
            lock_owner,
        ) {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn init(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let InitIn {
            major,
            minor,
            max_readahead,
            flags,
        } = r.read_obj().map_err(Error::DecodeMessage)?;

        if major < KERNEL_VERSION {
            error!("Unsupported fuse protocol version: {}.{}", major, minor);
            return reply_error_explicit(
                io::Error::from_raw_os_error(libc::EPROTO),
                in_header.unique,
                w,
            );
        }

        if major > KERNEL_VERSION {
            // Wait for the kernel to reply back with a 7.X version.
            let out = InitOut {
                major: KERNEL_VERSION,
                minor: KERNEL_MINOR_VERSION,
                ..Default::default()
            };

            return reply_ok(Some(out), None, in_header.unique, w);
        }

        // These fuse features are supported by this server by default.
        let supported = FsOptions::ASYNC_READ
            | FsOptions::PARALLEL_DIROPS
            | FsOptions::BIG_WRITES
            | FsOptions::AUTO_INVAL_DATA
            | FsOptions::ASYNC_DIO
            | FsOptions::HAS_IOCTL_DIR
            | FsOptions::MAX_PAGES
            | FsOptions::ATOMIC_O_TRUNC;

        let capable = FsOptions::from_bits_truncate(flags);

        match self.fs.init(capable) {
            Ok(want) => {
                let enabled = capable & (want | supported);
                info!(
                    "FUSE INIT major {} minor {}, in_opts: {:?} out_opts: {:?}",
                    major, minor, capable, enabled
                );

                let max_pages =
                    ((self.opts.max_write as usize + crate::pagesize() - 1) / crate::pagesize())
                        as u16;
                let out = InitOut {
                    major: KERNEL_VERSION,
                    minor: KERNEL_MINOR_VERSION,
                    max_readahead,
                    flags: enabled.bits(),
                    max_background: self.opts.max_background,
                    congestion_threshold: (self.opts.max_background / 4) * 3,
                    max_write: self.opts.max_write,
                    time_gran: 1, // nanoseconds
                    max_pages,
                    ..Default::default()
                };
                let vers = ServerVersion { major, minor };
                self.vers.store(Arc::new(vers));
                if minor < KERNEL_MINOR_VERSION_INIT_OUT_SIZE {
                    reply_ok(
                        Some(
                            *<[u8; FUSE_COMPAT_INIT_OUT_SIZE]>::from_slice(
                                &out.as_slice()[..FUSE_COMPAT_INIT_OUT_SIZE],
                            )
                            .unwrap(),
                        ),
                        None,
                        in_header.unique,
                        w,
                    )
                } else if minor < KERNEL_MINOR_VERSION_INIT_22_OUT_SIZE {
                    reply_ok(
                        Some(
                            *<[u8; FUSE_COMPAT_22_INIT_OUT_SIZE]>::from_slice(
                                &out.as_slice()[..FUSE_COMPAT_22_INIT_OUT_SIZE],
                            )
                            .unwrap(),
                        ),
                        None,
                        in_header.unique,
                        w,
                    )
                } else {
                    reply_ok(Some(out), None, in_header.unique, w)
                }
            }
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn opendir(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let OpenIn { flags, .. } = r.read_obj().map_err(Error::DecodeMessage)?;

        match self
            .fs
            .opendir(Context::from(in_header), in_header.nodeid, flags)
        {
            Ok((handle, opts)) => {
                let out = OpenOut {
                    fh: handle.unwrap_or(0),
                    open_flags: opts.bits(),
                    ..Default::default()
                };

                reply_ok(Some(out), None, in_header.unique, w)
            }
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn readdir(&self, in_header: &InHeader, mut r: Reader, mut w: Writer) -> Result<usize> {
        let ReadIn {
            fh, offset, size, ..
        } = r.read_obj().map_err(Error::DecodeMessage)?;

        if size > MAX_BUFFER_SIZE {
            return reply_error_explicit(
                io::Error::from_raw_os_error(libc::ENOMEM),
                in_header.unique,
                w,
            );
        }

        // Skip over enough bytes for the header.
        let mut cursor = match w.split_at(size_of::<OutHeader>()) {
            Ok(v) => v,
            Err(_e) => return Err(Error::InvalidHeaderLength),
        };

        let res = self.fs.readdir(
            Context::from(in_header),
            in_header.nodeid,
            fh,
            size,
            offset,
            &mut |d| add_dirent(&mut cursor, size, d),
        );

        if let Err(e) = res {
            reply_error_explicit(e, in_header.unique, w)
        } else {
            // Don't use `reply_ok` because we need to set a custom size length for the
            // header.
            let out = OutHeader {
                len: (size_of::<OutHeader>() + cursor.bytes_written()) as u32,
                error: 0,
                unique: in_header.unique,
            };

            w.write_all(out.as_slice()).map_err(Error::EncodeMessage)?;
            w.commit(Some(&cursor)).map_err(Error::EncodeMessage)?;
            Ok(out.len as usize)
        }
    }

    pub(super) fn releasedir(
        &self,
        in_header: &InHeader,
        mut r: Reader,
        w: Writer,
    ) -> Result<usize> {
        let ReleaseIn { fh, flags, .. } = r.read_obj().map_err(Error::DecodeMessage)?;

        match self
            .fs
            .releasedir(Context::from(in_header), in_header.nodeid, flags, fh)
        {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    fn fsyncdir(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let FsyncIn {
            fh, fsync_flags, ..
        } = r.read_obj().map_err(Error::DecodeMessage)?;
        let datasync = fsync_flags & FSYNC_FDATASYNC != 0;

        match self
            .fs
            .fsyncdir(Context::from(in_header), in_header.nodeid, datasync, fh)
        {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn access(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let AccessIn { mask, .. } = r.read_obj().map_err(Error::DecodeMessage)?;

        match self
            .fs
            .access(Context::from(in_header), in_header.nodeid, mask)
        {
            Ok(()) => reply_ok(None::<u8>, None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    fn create(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let CreateIn {
            flags, mode, umask, ..
        } = r.read_obj().map_err(Error::DecodeMessage)?;
        let buf = ServerUtil::get_message_body(&mut r, in_header, size_of::<CreateIn>())?;
        let name = bytes_to_cstr(&buf)?;

        match self.fs.create(
            Context::from(in_header),
            in_header.nodeid,
            name,
            mode,
            flags,
            umask,
        ) {
            Ok((entry, handle, opts)) => {
                let entry_out = EntryOut::from(entry);
                let open_out = OpenOut {
                    fh: handle.unwrap_or(0),
                    open_flags: opts.bits(),
                    ..Default::default()
                };

                // Kind of a hack to write both structs.
                reply_ok(
                    Some(entry_out),
                    Some(open_out.as_slice()),
                    in_header.unique,
                    w,
                )
            }
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn interrupt(&self, in_header: &InHeader, mut r: Reader) -> Result<usize> {
        if let Ok(InterruptIn { unique }) = r.read_obj() {
            self.fs.interrupt(Context::from(in_header), unique);
        }

        // No reply; the kernel learns about the outcome from the original request.
        Ok(0)
    }

    pub(super) fn bmap(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let BmapIn {
            block, blocksize, ..
        } = r.read_obj().map_err(Error::DecodeMessage)?;

        match self
            .fs
            .bmap(Context::from(in_header), in_header.nodeid, block, blocksize)
        {
            Ok(block) => reply_ok(Some(BmapOut { block }), None, in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn destroy(&self) -> Result<usize> {
        // No reply to this function.
        self.fs.destroy();

        Ok(0)
    }

    pub(super) fn ioctl(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let IoctlIn {
            fh,
            flags,
            cmd,
            arg,
            in_size,
            out_size,
        } = r.read_obj().map_err(Error::DecodeMessage)?;

        match self.fs.ioctl(
            Context::from(in_header),
            in_header.nodeid,
            fh,
            flags,
            cmd,
            arg,
            in_size,
            out_size,
        ) {
            Ok((out, data)) => reply_ok(Some(out), Some(&data), in_header.unique, w),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn poll(&self, in_header: &InHeader, mut r: Reader, w: Writer) -> Result<usize> {
        let PollIn {
            fh,
            kh,
            flags,
            events,
        } = r.read_obj().map_err(Error::DecodeMessage)?;

        match self.fs.poll(
            Context::from(in_header),
            in_header.nodeid,
            fh,
            kh,
            flags,
            events,
        ) {
            Ok(revents) => reply_ok(
                Some(PollOut {
                    revents,
                    padding: 0,
                }),
                None,
                in_header.unique,
                w,
            ),
            Err(e) => reply_error(e, in_header.unique, w),
        }
    }

    pub(super) fn batch_forget(
        &self,
        in_header: &InHeader,
        mut r: Reader,
        w: Writer,
    ) -> Result<usize> {
        let BatchForgetIn { count, .. } = r.read_obj().map_err(Error::DecodeMessage)?;

        if let Some(size) = (count as usize).checked_mul(size_of::<ForgetOne>()) {
            if size > MAX_BUFFER_SIZE as usize {
                return reply_error_explicit(
                    io::Error::from_raw_os_error(libc::ENOMEM),
                    in_header.unique,
                    w,
                );
            }
        } else {
            return reply_error_explicit(
                io::Error::from_raw_os_error(libc::EOVERFLOW),
                in_header.unique,
                w,
            );
        }

        let mut requests = Vec::with_capacity(count as usize);
        for _ in 0..count {
            requests.push(
                r.read_obj::<ForgetOne>()
                    .map(|f| (f.nodeid, f.nlookup))
                    .map_err(Error::DecodeMessage)?,
            );
        }

        self.fs.batch_forget(Context::from(in_header), requests);

        // No reply for forget messages.
        Ok(0)
    }
}

fn reply_ok<T: ByteValued>(
    out: Option<T>,
    data: Option<&[u8]>,
    unique: u64,
    mut w: Writer,
) -> Result<usize> {
    let data2 = out.as_ref().map(|v| v.as_slice()).unwrap_or(&[]);
    let data3 = data.unwrap_or(&[]);
    let len = size_of::<OutHeader>() + data2.len() + data3.len();
    let header = OutHeader {
        len: len as u32,
        error: 0,
        unique,
    };
    trace!("fuse: new reply {:?}", header);

    match (data2.len(), data3.len()) {
        (0, 0) => w
            .write(header.as_slice())
            .map_err(Error::EncodeMessage)?,
        (0, _) => w
            .write_vectored(&[
                io::IoSlice::new(header.as_slice()),
                io::IoSlice::new(data3),
            ])
            .map_err(Error::EncodeMessage)?,
        (_, 0) => w
            .write_vectored(&[
                io::IoSlice::new(header.as_slice()),
                io::IoSlice::new(data2),
            ])
            .map_err(Error::EncodeMessage)?,
        (_, _) => w
            .write_vectored(&[
                io::IoSlice::new(header.as_slice()),
                io::IoSlice::new(data2),
                io::IoSlice::new(data3),
            ])
            .map_err(Error::EncodeMessage)?,
    };

    debug_assert_eq!(len, w.bytes_written());
    Ok(w.bytes_written())
}

fn do_reply_error(err: io::Error, unique: u64, mut w: Writer, explicit: bool) -> Result<usize> {
    let header = OutHeader {
        len: size_of::<OutHeader>() as u32,
        error: -err
            .raw_os_error()
            .unwrap_or_else(|| encode_io_error_kind(err.kind())),
        unique,
    };

    if explicit {
        error!("fuse: reply error header {:?}, error {:?}", header, err);
    } else {
        trace!("fuse: reply error header {:?}, error {:?}", header, err);
    }
    w.write_all(header.as_slice())
        .map_err(Error::EncodeMessage)?;

    // Commit the header if it is buffered, otherwise the kernel gets nothing back.
    w.commit(None)
        .map(|_| {
            debug_assert_eq!(header.len as usize, w.bytes_written());
            w.bytes_written()
        })
        .map_err(Error::EncodeMessage)
}

// Reply an operation error back to the fuse client, don't print an error message, as
// they are not the server's internal errors and the client can deal with them.
fn reply_error(err: io::Error, unique: u64, w: Writer) -> Result<usize> {
    do_reply_error(err, unique, w, false)
}

fn reply_error_explicit(err: io::Error, unique: u64, w: Writer) -> Result<usize> {
    do_reply_error(err, unique, w, true)
}

fn handle_attr_result(
    in_header: &InHeader,
    w: Writer,
    result: io::Result<(Attr, Duration)>,
) -> Result<usize> {
    match result {
        Ok((attr, timeout)) => {
            let out = AttrOut {
                attr_valid: timeout.as_secs(),
                attr_valid_nsec: timeout.subsec_nanos(),
                dummy: 0,
                attr,
            };
            reply_ok(Some(out), None, in_header.unique, w)
        }
        Err(e) => reply_error(e, in_header.unique, w),
    }
}

fn add_dirent(cursor: &mut Writer, max: u32, d: DirEntry) -> io::Result<usize> {
    if d.name.len() > ::std::u32::MAX as usize {
        return Err(io::Error::from_raw_os_error(libc::EOVERFLOW));
    }

    let dirent_len = size_of::<Dirent>()
        .checked_add(d.name.len())
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EOVERFLOW))?;

    // Directory entries must be padded to 8-byte alignment.  If adding 7 causes
    // an overflow then this dirent cannot be properly padded.
    let padded_dirent_len = dirent_len
        .checked_add(7)
        .map(|l| l & !7)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EOVERFLOW))?;

    // Skip the entry if there's not enough space left.
    if (max as usize).saturating_sub(cursor.bytes_written()) < padded_dirent_len {
        Ok(0)
    } else {
        let dirent = Dirent {
            ino: d.ino,
            off: d.offset,
            namelen: d.name.len() as u32,
            type_: d.type_,
        };

        cursor.write_all(dirent.as_slice())?;
        cursor.write_all(d.name)?;

        // We know that `dirent_len` <= `padded_dirent_len` due to the check above
        // so there's no need for checked arithmetic.
        let padding = padded_dirent_len - dirent_len;
        if padding > 0 {
            cursor.write_all(&DIRENT_PADDING[..padding])?;
        }

        Ok(padded_dirent_len)
    }
}
