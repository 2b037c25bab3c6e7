// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A path filesystem mirroring a host directory.
//!
//! This is the filesystem the union engine stacks its branches on, and the easiest
//! way to serve an existing directory tree over FUSE.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::linux::fs::MetadataExt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::abi::fuse_abi::{Attr, Kstatfs};
use crate::api::filesystem::Context;
use crate::pathfs::{DirEntry, DirStream, PathFile, PathFilesystem};

fn attr_from_metadata(meta: &fs::Metadata) -> Attr {
    Attr {
        ino: meta.st_ino(),
        size: meta.st_size(),
        blocks: meta.st_blocks(),
        atime: meta.st_atime() as u64,
        mtime: meta.st_mtime() as u64,
        ctime: meta.st_ctime() as u64,
        atimensec: meta.st_atime_nsec() as u32,
        mtimensec: meta.st_mtime_nsec() as u32,
        ctimensec: meta.st_ctime_nsec() as u32,
        mode: meta.st_mode(),
        nlink: meta.st_nlink() as u32,
        uid: meta.st_uid(),
        gid: meta.st_gid(),
        rdev: meta.st_rdev() as u32,
        blksize: meta.st_blksize() as u32,
        padding: 0,
    }
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn check_ret(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A filesystem passing all operations through to a directory on the host.
pub struct LoopbackFs {
    root: PathBuf,
}

impl LoopbackFs {
    /// Serve the tree under `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> LoopbackFs {
        LoopbackFs { root: root.into() }
    }

    fn full(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

impl PathFilesystem for LoopbackFs {
    fn name(&self) -> String {
        format!("loopback({})", self.root.display())
    }

    fn get_attr(&self, path: &str, _ctx: &Context) -> io::Result<Attr> {
        let meta = fs::symlink_metadata(self.full(path))?;
        Ok(attr_from_metadata(&meta))
    }

    fn chmod(&self, path: &str, mode: u32, _ctx: &Context) -> io::Result<()> {
        fs::set_permissions(self.full(path), fs::Permissions::from_mode(mode))
    }

    fn chown(&self, path: &str, uid: u32, gid: u32, _ctx: &Context) -> io::Result<()> {
        let p = cpath(&self.full(path))?;
        // Safe because the path outlives the call.
        check_ret(unsafe { libc::chown(p.as_ptr(), uid, gid) })
    }

    fn utimens(&self, path: &str, atime_ns: u64, mtime_ns: u64, _ctx: &Context) -> io::Result<()> {
        let p = cpath(&self.full(path))?;
        let times = [
            libc::timespec {
                tv_sec: (atime_ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (atime_ns % 1_000_000_000) as libc::c_long,
            },
            libc::timespec {
                tv_sec: (mtime_ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (mtime_ns % 1_000_000_000) as libc::c_long,
            },
        ];
        check_ret(unsafe { libc::utimensat(libc::AT_FDCWD, p.as_ptr(), times.as_ptr(), 0) })
    }

    fn truncate(&self, path: &str, size: u64, _ctx: &Context) -> io::Result<()> {
        let p = cpath(&self.full(path))?;
        check_ret(unsafe { libc::truncate(p.as_ptr(), size as libc::off_t) })
    }

    fn access(&self, path: &str, mask: u32, _ctx: &Context) -> io::Result<()> {
        let p = cpath(&self.full(path))?;
        check_ret(unsafe { libc::access(p.as_ptr(), mask as libc::c_int) })
    }

    fn link(&self, old_path: &str, new_path: &str, _ctx: &Context) -> io::Result<()> {
        fs::hard_link(self.full(old_path), self.full(new_path))
    }

    fn mkdir(&self, path: &str, mode: u32, _ctx: &Context) -> io::Result<()> {
        fs::DirBuilder::new().mode(mode).create(self.full(path))
    }

    fn mknod(&self, path: &str, mode: u32, rdev: u32, _ctx: &Context) -> io::Result<()> {
        let p = cpath(&self.full(path))?;
        check_ret(unsafe { libc::mknod(p.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
    }

    fn rename(&self, old_path: &str, new_path: &str, _ctx: &Context) -> io::Result<()> {
        fs::rename(self.full(old_path), self.full(new_path))
    }

    fn rmdir(&self, path: &str, _ctx: &Context) -> io::Result<()> {
        fs::remove_dir(self.full(path))
    }

    fn unlink(&self, path: &str, _ctx: &Context) -> io::Result<()> {
        fs::remove_file(self.full(path))
    }

    fn symlink(&self, target: &str, path: &str, _ctx: &Context) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.full(path))
    }

    fn readlink(&self, path: &str, _ctx: &Context) -> io::Result<String> {
        let target = fs::read_link(self.full(path))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn open(&self, path: &str, flags: u32, _ctx: &Context) -> io::Result<Arc<dyn PathFile>> {
        let flags = flags as i32;
        let accmode = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .custom_flags(flags & !libc::O_ACCMODE)
            .open(self.full(path))?;
        Ok(Arc::new(LoopbackFile { file }))
    }

    fn create(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
        _ctx: &Context,
    ) -> io::Result<Arc<dyn PathFile>> {
        let flags = flags as i32;
        let accmode = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
            .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
            .create(true)
            .custom_flags(flags & !libc::O_ACCMODE & !libc::O_CREAT)
            .mode(mode)
            .open(self.full(path))?;
        Ok(Arc::new(LoopbackFile { file }))
    }

    fn open_dir(&self, path: &str, _ctx: &Context) -> io::Result<DirStream> {
        let mut entries = Vec::new();
        for dent in fs::read_dir(self.full(path))? {
            let dent = dent?;
            let mode = dent
                .metadata()
                .map(|m| m.st_mode())
                .unwrap_or(libc::S_IFREG);
            entries.push(DirEntry {
                name: dent.file_name().to_string_lossy().into_owned(),
                mode,
            });
        }
        Ok(Box::new(entries.into_iter()))
    }

    fn statfs(&self, path: &str) -> io::Result<Kstatfs> {
        let p = cpath(&self.full(path))?;
        // Safe because we pass a zeroed struct of the right size.
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        check_ret(unsafe { libc::statvfs(p.as_ptr(), &mut st) })?;
        Ok(Kstatfs {
            blocks: st.f_blocks,
            bfree: st.f_bfree,
            bavail: st.f_bavail,
            files: st.f_files,
            ffree: st.f_ffree,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
            padding: 0,
            spare: [0u32; 6],
        })
    }

    fn get_xattr(&self, path: &str, name: &str, _ctx: &Context) -> io::Result<Vec<u8>> {
        let p = cpath(&self.full(path))?;
        let n = CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // Size query first, then fetch.
        let size =
            unsafe { libc::getxattr(p.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buf = vec![0u8; size as usize];
        let read = unsafe {
            libc::getxattr(
                p.as_ptr(),
                n.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(read as usize);
        Ok(buf)
    }

    fn set_xattr(
        &self,
        path: &str,
        name: &str,
        value: &[u8],
        flags: u32,
        _ctx: &Context,
    ) -> io::Result<()> {
        let p = cpath(&self.full(path))?;
        let n = CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        check_ret(unsafe {
            libc::setxattr(
                p.as_ptr(),
                n.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags as libc::c_int,
            )
        })
    }

    fn list_xattr(&self, path: &str, _ctx: &Context) -> io::Result<Vec<String>> {
        let p = cpath(&self.full(path))?;
        let size = unsafe { libc::listxattr(p.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buf = vec![0u8; size as usize];
        let read = unsafe {
            libc::listxattr(p.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if read < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(read as usize);
        Ok(buf
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    fn remove_xattr(&self, path: &str, name: &str, _ctx: &Context) -> io::Result<()> {
        let p = cpath(&self.full(path))?;
        let n = CString::new(name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        check_ret(unsafe { libc::removexattr(p.as_ptr(), n.as_ptr()) })
    }
}

struct LoopbackFile {
    file: File,
}

impl PathFile for LoopbackFile {
    fn read(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(data, offset)
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn get_attr(&self) -> io::Result<Attr> {
        let meta = self.file.metadata()?;
        Ok(attr_from_metadata(&meta))
    }

    fn chmod(&self, mode: u32) -> io::Result<()> {
        self.file
            .set_permissions(fs::Permissions::from_mode(mode))
    }

    fn chown(&self, uid: u32, gid: u32) -> io::Result<()> {
        check_ret(unsafe { libc::fchown(self.file.as_raw_fd(), uid, gid) })
    }

    fn utimens(&self, atime_ns: u64, mtime_ns: u64) -> io::Result<()> {
        let times = [
            libc::timespec {
                tv_sec: (atime_ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (atime_ns % 1_000_000_000) as libc::c_long,
            },
            libc::timespec {
                tv_sec: (mtime_ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (mtime_ns % 1_000_000_000) as libc::c_long,
            },
        ];
        check_ret(unsafe { libc::futimens(self.file.as_raw_fd(), times.as_ptr()) })
    }

    fn fsync(&self, datasync: bool) -> io::Result<()> {
        if datasync {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    fn ctx() -> Context {
        Context::root()
    }

    #[test]
    fn test_attr_and_listing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.as_path().join("one"), b"1").unwrap();
        fs::write(dir.as_path().join("two"), b"22").unwrap();
        fs::create_dir(dir.as_path().join("sub")).unwrap();

        let fsys = LoopbackFs::new(dir.as_path());
        let root = fsys.get_attr("", &ctx()).unwrap();
        assert!(root.is_dir());

        let one = fsys.get_attr("one", &ctx()).unwrap();
        assert!(one.is_regular());
        assert_eq!(one.size, 1);

        let mut names: Vec<String> = fsys
            .open_dir("", &ctx())
            .unwrap()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["one", "sub", "two"]);
    }

    #[test]
    fn test_file_io() {
        let dir = TempDir::new().unwrap();
        let fsys = LoopbackFs::new(dir.as_path());

        let f = fsys
            .create("file.txt", libc::O_WRONLY as u32, 0o644, &ctx())
            .unwrap();
        assert_eq!(f.write(b"hello", 0).unwrap(), 5);
        f.release();

        let f = fsys.open("file.txt", libc::O_RDONLY as u32, &ctx()).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        fsys.truncate("file.txt", 2, &ctx()).unwrap();
        assert_eq!(fsys.get_attr("file.txt", &ctx()).unwrap().size, 2);
    }

    #[test]
    fn test_mknod_fifo_and_socket() {
        let dir = TempDir::new().unwrap();
        let fsys = LoopbackFs::new(dir.as_path());

        fsys.mknod("fifo", libc::S_IFIFO | 0o644, 0, &ctx()).unwrap();
        let attr = fsys.get_attr("fifo", &ctx()).unwrap();
        assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFIFO);

        fsys.mknod("sock", libc::S_IFSOCK | 0o644, 0, &ctx()).unwrap();
        let attr = fsys.get_attr("sock", &ctx()).unwrap();
        assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFSOCK);
    }

    #[test]
    fn test_symlink_and_rename() {
        let dir = TempDir::new().unwrap();
        let fsys = LoopbackFs::new(dir.as_path());

        fsys.symlink("one", "link", &ctx()).unwrap();
        assert_eq!(fsys.readlink("link", &ctx()).unwrap(), "one");
        assert!(fsys.get_attr("link", &ctx()).unwrap().is_symlink());

        fs::write(dir.as_path().join("src"), b"data").unwrap();
        fsys.rename("src", "dst", &ctx()).unwrap();
        assert!(fsys.get_attr("src", &ctx()).is_err());
        assert_eq!(fsys.get_attr("dst", &ctx()).unwrap().size, 4);
    }
}
