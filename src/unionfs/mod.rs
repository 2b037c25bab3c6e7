// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A user-space union file system, stateless but efficient even if the writable
//! branch is on NFS.
//!
//! Assumptions:
//!
//! * It uses a list of branches, the first of which (index 0) is writable, and the
//!   rest read-only.
//! * It assumes that the number of deleted files is small relative to the total tree
//!   size.
//!
//! Deleting a file puts a marker file named after a hash of the full path into one
//! deletion directory on the writable branch, containing the full path itself. With
//! all whiteouts in one place the list of deleted files is one readdir away, and the
//! kernel's negative dentry cache answers is-deleted queries quickly.
//!
//! Mutations of paths living on a read-only branch first promote (copy up) the object
//! to the writable branch.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

use crate::abi::fuse_abi::Attr;
use crate::api::filesystem::Context;
use crate::pathfs::{
    copy_file, DevNullFile, DirEntry, DirStream, LoopbackFs, PathFile, PathFilesystem,
};

mod autounion;
mod cache;

pub use autounion::{AutoUnionFs, AutoUnionFsOptions};
pub use cache::{DirCache, TimedCache};

/// Opening this root file for writing clears all caches.
pub const DROP_CACHE_NAME: &str = ".drop_cache";

/// Name of the read-only sentinel symlink, hidden from the union view.
pub const READONLY_NAME: &str = "READONLY";

/// Tunables of a union filesystem.
#[derive(Debug, Clone)]
pub struct UnionFsOptions {
    /// TTL of the path -> branch cache.
    pub branch_cache_ttl: Duration,
    /// TTL of the deletion marker name cache.
    pub deletion_cache_ttl: Duration,
    /// Name of the deletion marker directory on the writable branch.
    pub deletion_dir: String,
}

impl Default for UnionFsOptions {
    fn default() -> Self {
        UnionFsOptions {
            branch_cache_ttl: Duration::from_secs(5),
            deletion_cache_ttl: Duration::from_secs(5),
            deletion_dir: "DELETIONS".to_string(),
        }
    }
}

// Where a path lives: its attributes, the errno of the probe and the branch index
// (-1 when not found on any branch).
#[derive(Clone)]
struct BranchResult {
    attr: Option<Attr>,
    code: i32,
    branch: i32,
}

impl BranchResult {
    fn ok(&self) -> bool {
        self.code == 0
    }

    fn not_found() -> BranchResult {
        BranchResult {
            attr: None,
            code: libc::ENOENT,
            branch: -1,
        }
    }

    fn error(&self) -> io::Error {
        io::Error::from_raw_os_error(if self.code == 0 { libc::EIO } else { self.code })
    }
}

fn errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn now_split() -> (u64, u32) {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

// Split a path into its directory part (with trailing slash) and base name.
fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    }
}

fn parent_dir(path: &str) -> &str {
    let (dir, _) = split_path(path);
    dir.trim_end_matches('/')
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

// Marker file name of a tombstoned path: a short hash of the directory part keeps
// all markers of a directory adjacent, and the base name keeps them readable.
fn file_path_hash(path: &str) -> String {
    let (dir, base) = split_path(path);
    let digest = Sha256::digest(dir.as_bytes());
    let mut name = String::with_capacity(16 + 1 + base.len());
    for b in digest.iter().take(8) {
        name.push_str(&format!("{:02x}", b));
    }
    name.push('-');
    name.push_str(base);
    name
}

/// A stateless union of a writable branch and any number of read-only branches.
pub struct UnionFs {
    branches: Vec<Arc<dyn PathFilesystem>>,
    // Backing directories when constructed from host paths; used by the supervisor.
    roots: Vec<String>,
    options: UnionFsOptions,
    deletion_cache: DirCache,
    branch_cache: TimedCache<BranchResult>,
}

impl UnionFs {
    /// Create a union over the given branches; branch 0 is writable.
    ///
    /// Fails when the deletion store cannot be created on the writable branch.
    pub fn new(
        branches: Vec<Arc<dyn PathFilesystem>>,
        options: UnionFsOptions,
    ) -> io::Result<UnionFs> {
        if branches.is_empty() {
            return Err(err(libc::EINVAL));
        }
        let fs = UnionFs {
            branches,
            roots: Vec::new(),
            deletion_cache: DirCache::new(options.deletion_cache_ttl),
            branch_cache: TimedCache::new(options.branch_cache_ttl),
            options,
        };
        fs.create_deletion_store()?;
        Ok(fs)
    }

    /// Create a union of host directories; the first is the writable branch.
    pub fn from_roots<P: AsRef<std::path::Path>>(
        roots: &[P],
        options: UnionFsOptions,
    ) -> io::Result<UnionFs> {
        let branches: Vec<Arc<dyn PathFilesystem>> = roots
            .iter()
            .map(|r| Arc::new(LoopbackFs::new(r.as_ref())) as Arc<dyn PathFilesystem>)
            .collect();
        let mut fs = UnionFs::new(branches, options)?;
        fs.roots = roots
            .iter()
            .map(|r| r.as_ref().to_string_lossy().into_owned())
            .collect();
        Ok(fs)
    }

    /// The host directory backing the writable branch, when known.
    pub fn writable_root(&self) -> Option<&str> {
        self.roots.get(0).map(|s| s.as_str())
    }

    fn writable(&self) -> &dyn PathFilesystem {
        self.branches[0].as_ref()
    }

    ////////////////
    // Deal with all the caches.

    fn create_deletion_store(&self) -> io::Result<()> {
        let ctx = Context::root();
        let store = &self.options.deletion_dir;
        let attr = match self.writable().get_attr(store, &ctx) {
            Err(ref e) if errno(e) == libc::ENOENT => {
                self.writable().mkdir(store, 0o755, &ctx)?;
                self.writable().get_attr(store, &ctx)?
            }
            Err(e) => return Err(e),
            Ok(attr) => attr,
        };
        if !attr.is_dir() {
            return Err(err(libc::EROFS));
        }
        Ok(())
    }

    fn deletion_path(&self, name: &str) -> String {
        join(&self.options.deletion_dir, &file_path_hash(name))
    }

    // Whether `name` has a marker in the deletion store. An inaccessible store is
    // reported as a read-only failure.
    fn is_deleted(&self, name: &str) -> io::Result<bool> {
        let marker = file_path_hash(name);
        if let Some(found) = self.deletion_cache.has_entry(&marker) {
            return Ok(found);
        }

        let ctx = Context::root();
        match self.writable().get_attr(&self.deletion_path(name), &ctx) {
            Ok(_) => Ok(true),
            Err(ref e) if errno(e) == libc::ENOENT => Ok(false),
            Err(e) => {
                warn!("error accessing deletion marker for {}: {}", name, e);
                Err(err(libc::EROFS))
            }
        }
    }

    fn remove_deletion(&self, name: &str) {
        let marker = self.deletion_path(name);
        self.deletion_cache.remove_entry(&file_path_hash(name));

        let ctx = Context::root();
        match self.writable().unlink(&marker, &ctx) {
            Ok(()) => {}
            Err(ref e) if errno(e) == libc::ENOENT => {}
            Err(e) => warn!("error unlinking {}: {}", marker, e),
        }
    }

    fn put_deletion(&self, name: &str) -> io::Result<()> {
        self.create_deletion_store()?;

        let marker = self.deletion_path(name);
        self.deletion_cache.add_entry(&file_path_hash(name));

        let ctx = Context::root();
        // An up-to-date marker needs no rewrite.
        if let Ok(attr) = self.writable().get_attr(&marker, &ctx) {
            if attr.size == name.len() as u64 {
                return Ok(());
            }
        }

        let file = match self.writable().get_attr(&marker, &ctx) {
            Err(ref e) if errno(e) == libc::ENOENT => self.writable().create(
                &marker,
                (libc::O_TRUNC | libc::O_WRONLY) as u32,
                0o644,
                &ctx,
            ),
            _ => {
                let _ = self.writable().chmod(&marker, 0o644, &ctx);
                self.writable()
                    .open(&marker, (libc::O_TRUNC | libc::O_WRONLY) as u32, &ctx)
            }
        };
        let file = file.map_err(|e| {
            warn!("could not create deletion file {}: {}", marker, e);
            err(libc::EPERM)
        })?;

        let written = file.write(name.as_bytes(), 0)?;
        let _ = file.flush();
        file.release();
        if written != name.len() {
            error!(
                "short write to deletion marker {}: {} of {}",
                marker,
                written,
                name.len()
            );
            return Err(err(libc::EIO));
        }
        Ok(())
    }

    // The file names currently present in the deletion store; also warms the cache.
    fn deletion_names(&self) -> io::Result<HashSet<String>> {
        let ctx = Context::root();
        match self.writable().open_dir(&self.options.deletion_dir, &ctx) {
            Ok(stream) => {
                let names: HashSet<String> = stream.map(|e| e.name).collect();
                self.deletion_cache.fill(names.clone());
                Ok(names)
            }
            Err(e) => {
                if errno(&e) == libc::ENOENT {
                    Ok(HashSet::new())
                } else {
                    Err(err(libc::EROFS))
                }
            }
        }
    }

    fn get_branch(&self, name: &str) -> BranchResult {
        let name = name.trim_end_matches('/');
        self.branch_cache
            .get_or(name, || self.branch_lookup(name))
    }

    fn fresh_branch(&self, name: &str) -> BranchResult {
        let name = name.trim_end_matches('/');
        self.branch_cache
            .refresh(name, || self.branch_lookup(name))
    }

    // Probe the branches for `name`, starting at its parent's branch: a child can
    // never live on an earlier branch than the directory containing it.
    fn branch_lookup(&self, name: &str) -> BranchResult {
        let parent_branch = if name.is_empty() {
            0
        } else {
            let r = self.get_branch(parent_dir(name));
            if r.branch < 0 {
                0
            } else {
                r.branch
            }
        };

        let ctx = Context::root();
        for (i, fs) in self.branches.iter().enumerate() {
            if i < parent_branch as usize {
                continue;
            }
            match fs.get_attr(name, &ctx) {
                Ok(mut attr) => {
                    // Make all files appear writable; writes promote.
                    attr.mode |= 0o222;
                    return BranchResult {
                        attr: Some(attr),
                        code: 0,
                        branch: i as i32,
                    };
                }
                Err(e) => {
                    let code = errno(&e);
                    if code != libc::ENOENT && code != libc::ENOTDIR {
                        warn!("getattr {} on branch {}: {}", name, i, e);
                    }
                }
            }
        }
        BranchResult::not_found()
    }

    ////////////////
    // Promotion.

    // Materialize `name` on the writable branch prior to a mutation.
    fn promote(&self, name: &str, src: &BranchResult, ctx: &Context) -> io::Result<()> {
        let source = self.branches[src.branch as usize].as_ref();
        let attr = match &src.attr {
            Some(attr) => *attr,
            None => return Err(err(libc::EIO)),
        };

        self.promote_dirs_to(name)?;

        let res = if attr.is_regular() {
            copy_file(source, self.writable(), name, name, attr.mode, ctx)
        } else if attr.is_symlink() {
            let target = source.readlink(name, ctx)?;
            self.writable().symlink(&target, name, ctx)
        } else if attr.is_dir() {
            self.writable().mkdir(name, 0o755, ctx)
        } else {
            warn!("cannot promote file type {:o} of {}", attr.mode, name);
            Err(err(libc::ENOSYS))
        };

        match res {
            Err(e) => {
                self.fresh_branch(name);
                Err(e)
            }
            Ok(()) => {
                let mut r = self.get_branch(name);
                r.branch = 0;
                self.branch_cache.set(name, r);
                Ok(())
            }
        }
    }

    // Recursively create the missing parent directories of `filename` on the
    // writable branch, top-down.
    fn promote_dirs_to(&self, filename: &str) -> io::Result<()> {
        let mut dir = parent_dir(filename);
        let mut todo: Vec<(String, BranchResult)> = Vec::new();

        while !dir.is_empty() {
            let r = self.get_branch(dir);
            if !r.ok() {
                warn!("path component does not exist: {} of {}", dir, filename);
            }
            if !r.attr.as_ref().map(Attr::is_dir).unwrap_or(false) {
                warn!("path component is not a directory: {}", dir);
                return Err(err(libc::EPERM));
            }
            if r.branch == 0 {
                break;
            }
            todo.push((dir.to_string(), r));
            dir = parent_dir(dir);
        }

        let ctx = Context::root();
        for (d, mut r) in todo.into_iter().rev() {
            self.writable().mkdir(&d, 0o755, &ctx).map_err(|e| {
                warn!("error creating dir leading to {}: {}", d, e);
                err(libc::EPERM)
            })?;
            r.branch = 0;
            self.branch_cache.set(&d, r);
        }
        Ok(())
    }

    // Promote `path`, and when it is a directory everything below it. Returns the
    // promoted paths.
    fn recursive_promote(
        &self,
        path: &str,
        result: &BranchResult,
        ctx: &Context,
    ) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        if result.branch > 0 {
            self.promote(path, result, ctx)?;
        }
        names.push(path.to_string());

        if result.attr.as_ref().map(Attr::is_dir).unwrap_or(false) {
            for entry in self.open_dir(path, ctx)? {
                let p = join(path, &entry.name);
                let r = self.get_branch(&p);
                names.extend(self.recursive_promote(&p, &r, ctx)?);
            }
        }
        Ok(names)
    }

    fn rename_directory(
        &self,
        src_result: &BranchResult,
        src_dir: &str,
        dst_dir: &str,
        ctx: &Context,
    ) -> io::Result<()> {
        let names = self.recursive_promote(src_dir, src_result, ctx)?;
        self.promote_dirs_to(dst_dir)?;
        self.writable().rename(src_dir, dst_dir, ctx)?;

        for src_name in names.iter() {
            let relative = src_name[src_dir.len()..].trim_start_matches('/');
            let dst = join(dst_dir, relative);
            self.remove_deletion(dst.trim_end_matches('/'));
        }

        let mut moved = self.get_branch(src_dir);
        moved.branch = 0;
        self.branch_cache.set(dst_dir, moved);

        let src_fresh = self.fresh_branch(src_dir);
        if src_fresh.branch > 0 {
            self.put_deletion(src_dir)?;
        }
        Ok(())
    }

    fn drop_all_caches(&self) {
        self.branch_cache.drop_all(None);
        self.deletion_cache.drop_cache();
        for fs in self.branches.iter() {
            fs.drop_caches();
        }
    }
}

impl PathFilesystem for UnionFs {
    fn name(&self) -> String {
        let names: Vec<String> = self.branches.iter().map(|fs| fs.name()).collect();
        format!("{:?}", names)
    }

    fn get_attr(&self, path: &str, _ctx: &Context) -> io::Result<Attr> {
        if path == READONLY_NAME {
            return Err(err(libc::ENOENT));
        }
        if path == DROP_CACHE_NAME {
            let mut attr = Attr::default();
            attr.mode = libc::S_IFREG | 0o777;
            return Ok(attr);
        }
        if path == self.options.deletion_dir {
            return Err(err(libc::ENOENT));
        }
        if self.is_deleted(path)? {
            return Err(err(libc::ENOENT));
        }
        let r = self.get_branch(path);
        if r.branch < 0 {
            return Err(err(libc::ENOENT));
        }
        r.attr.ok_or_else(|| r.error())
    }

    fn chmod(&self, path: &str, mode: u32, ctx: &Context) -> io::Result<()> {
        let mut r = self.get_branch(path);
        if !r.ok() {
            return Err(r.error());
        }
        let mut attr = match r.attr {
            Some(a) => a,
            None => return Err(err(libc::EIO)),
        };

        let perm_mask = 0o7777;
        // Always be writable.
        let mode = (mode | 0o222) & perm_mask;
        let old_mode = attr.mode & perm_mask;

        if old_mode != mode {
            if r.branch > 0 {
                self.promote(path, &r, ctx)?;
                r.branch = 0;
            }
            self.writable().chmod(path, mode, ctx)?;
        }
        attr.mode = (attr.mode & !perm_mask) | mode;
        let (secs, nsecs) = now_split();
        attr.ctime = secs;
        attr.ctimensec = nsecs;
        r.attr = Some(attr);
        self.branch_cache.set(path, r);
        Ok(())
    }

    fn chown(&self, path: &str, uid: u32, gid: u32, ctx: &Context) -> io::Result<()> {
        let mut r = self.get_branch(path);
        if !r.ok() {
            return Err(r.error());
        }
        let mut attr = match r.attr {
            Some(a) => a,
            None => return Err(err(libc::EIO)),
        };

        // Only root may reassign ownership across the union.
        if unsafe { libc::geteuid() } != 0 {
            return Err(err(libc::EPERM));
        }

        if attr.uid != uid || attr.gid != gid {
            if r.branch > 0 {
                self.promote(path, &r, ctx)?;
                r.branch = 0;
            }
            self.writable().chown(path, uid, gid, ctx)?;
        }
        attr.uid = uid;
        attr.gid = gid;
        let (secs, nsecs) = now_split();
        attr.ctime = secs;
        attr.ctimensec = nsecs;
        r.attr = Some(attr);
        self.branch_cache.set(path, r);
        Ok(())
    }

    fn utimens(&self, path: &str, atime_ns: u64, mtime_ns: u64, ctx: &Context) -> io::Result<()> {
        let mut r = self.get_branch(path);
        if !r.ok() {
            return Err(r.error());
        }
        if r.branch > 0 {
            self.promote(path, &r, ctx)?;
            r.branch = 0;
        }
        self.writable().utimens(path, atime_ns, mtime_ns, ctx)?;

        if let Some(attr) = r.attr.as_mut() {
            attr.atime = atime_ns / 1_000_000_000;
            attr.atimensec = (atime_ns % 1_000_000_000) as u32;
            attr.mtime = mtime_ns / 1_000_000_000;
            attr.mtimensec = (mtime_ns % 1_000_000_000) as u32;
            let (secs, nsecs) = now_split();
            attr.ctime = secs;
            attr.ctimensec = nsecs;
        }
        self.branch_cache.set(path, r);
        Ok(())
    }

    fn truncate(&self, path: &str, size: u64, ctx: &Context) -> io::Result<()> {
        if path == DROP_CACHE_NAME {
            return Ok(());
        }
        let mut r = self.get_branch(path);
        if !r.ok() {
            return Err(r.error());
        }
        if r.branch > 0 {
            self.promote(path, &r, ctx)?;
            r.branch = 0;
        }
        self.writable().truncate(path, size, ctx)?;

        if let Some(attr) = r.attr.as_mut() {
            attr.size = size;
            let (secs, nsecs) = now_split();
            attr.mtime = secs;
            attr.mtimensec = nsecs;
            attr.ctime = secs;
            attr.ctimensec = nsecs;
        }
        self.branch_cache.set(path, r);
        Ok(())
    }

    fn access(&self, path: &str, mask: u32, ctx: &Context) -> io::Result<()> {
        // We always allow writing; mutations promote.
        let mask = mask & !(libc::W_OK as u32);
        let r = self.get_branch(path);
        if r.branch >= 0 {
            return self.branches[r.branch as usize].access(path, mask, ctx);
        }
        Err(err(libc::ENOENT))
    }

    fn mkdir(&self, path: &str, mode: u32, ctx: &Context) -> io::Result<()> {
        let deleted = self.is_deleted(path)?;
        if !deleted {
            let r = self.get_branch(path);
            if r.code != libc::ENOENT {
                return Err(err(libc::EEXIST));
            }
        }

        self.promote_dirs_to(path)?;
        self.writable().mkdir(path, mode, ctx)?;
        self.remove_deletion(path);

        let (secs, nsecs) = now_split();
        let mut attr = Attr::default();
        attr.mode = libc::S_IFDIR | mode | 0o222;
        attr.ctime = secs;
        attr.ctimensec = nsecs;
        self.branch_cache.set(
            path,
            BranchResult {
                attr: Some(attr),
                code: 0,
                branch: 0,
            },
        );

        // Lower branches may still carry children of a directory deleted and
        // re-created under the same name; tombstone them.
        for entry in self.open_dir(path, ctx)? {
            self.put_deletion(&join(path, &entry.name))?;
        }
        Ok(())
    }

    fn rmdir(&self, path: &str, ctx: &Context) -> io::Result<()> {
        let r = self.get_branch(path);
        if !r.ok() {
            return Err(r.error());
        }
        if !r.attr.as_ref().map(Attr::is_dir).unwrap_or(false) {
            return Err(err(libc::ENOTDIR));
        }

        if self.open_dir(path, ctx)?.next().is_some() {
            return Err(err(libc::ENOTEMPTY));
        }

        if r.branch > 0 {
            return self.put_deletion(path);
        }
        self.writable().rmdir(path, ctx)?;
        self.branch_cache.remove(path);

        let fresh = self.fresh_branch(path);
        if fresh.branch > 0 {
            self.put_deletion(path)?;
        }
        Ok(())
    }

    fn unlink(&self, path: &str, ctx: &Context) -> io::Result<()> {
        let mut r = self.get_branch(path);
        if !r.ok() {
            return Err(r.error());
        }
        if r.branch == 0 {
            self.writable().unlink(path, ctx)?;
            r = self.fresh_branch(path);
        }
        if r.branch > 0 {
            // A lower branch still carries the path: cover it with a marker.
            self.put_deletion(path)?;
        }
        Ok(())
    }

    fn symlink(&self, target: &str, path: &str, ctx: &Context) -> io::Result<()> {
        self.promote_dirs_to(path)?;
        self.writable().symlink(target, path, ctx)?;
        self.remove_deletion(path);
        self.fresh_branch(path);
        Ok(())
    }

    fn readlink(&self, path: &str, ctx: &Context) -> io::Result<String> {
        let r = self.get_branch(path);
        if r.branch >= 0 {
            return self.branches[r.branch as usize].readlink(path, ctx);
        }
        Err(err(libc::ENOENT))
    }

    fn rename(&self, old_path: &str, new_path: &str, ctx: &Context) -> io::Result<()> {
        let src = self.get_branch(old_path);
        if !src.ok() {
            return Err(src.error());
        }

        if src.attr.as_ref().map(Attr::is_dir).unwrap_or(false) {
            return self.rename_directory(&src, old_path, new_path, ctx);
        }

        if src.branch > 0 {
            self.promote(old_path, &src, ctx)?;
        }
        self.promote_dirs_to(new_path)?;
        self.writable().rename(old_path, new_path, ctx)?;

        self.remove_deletion(new_path);
        let mut moved = src;
        moved.branch = 0;
        self.branch_cache.set(new_path, moved);

        let src_fresh = self.fresh_branch(old_path);
        if src_fresh.branch > 0 {
            self.put_deletion(old_path)?;
        }
        Ok(())
    }

    fn open(&self, path: &str, flags: u32, ctx: &Context) -> io::Result<Arc<dyn PathFile>> {
        let write = flags as i32 & (libc::O_WRONLY | libc::O_RDWR | libc::O_APPEND) != 0;
        if path == DROP_CACHE_NAME {
            if write {
                info!("forced cache drop on {}", self.name());
                self.drop_all_caches();
            }
            return Ok(Arc::new(DevNullFile));
        }

        let mut r = self.get_branch(path);
        if r.branch < 0 {
            // Should not happen: a GetAttr has already verified existence.
            warn!("open of non-existent file: {}", path);
            return Err(err(libc::ENOENT));
        }
        if write && r.branch > 0 {
            self.promote(path, &r, ctx)?;
            r.branch = 0;
            if let Some(attr) = r.attr.as_mut() {
                let (secs, nsecs) = now_split();
                attr.mtime = secs;
                attr.mtimensec = nsecs;
            }
            self.branch_cache.set(path, r.clone());
        }
        self.branches[r.branch as usize].open(path, flags, ctx)
    }

    fn create(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
        ctx: &Context,
    ) -> io::Result<Arc<dyn PathFile>> {
        self.promote_dirs_to(path)?;
        let file = self.writable().create(path, flags, mode, ctx)?;
        self.remove_deletion(path);

        let (secs, nsecs) = now_split();
        let mut attr = Attr::default();
        attr.mode = libc::S_IFREG | mode | 0o222;
        attr.ctime = secs;
        attr.ctimensec = nsecs;
        attr.mtime = secs;
        attr.mtimensec = nsecs;
        self.branch_cache.set(
            path,
            BranchResult {
                attr: Some(attr),
                code: 0,
                branch: 0,
            },
        );
        Ok(file)
    }

    fn open_dir(&self, path: &str, ctx: &Context) -> io::Result<DirStream> {
        let dir_branch = self.get_branch(path);
        if dir_branch.branch < 0 {
            return Err(err(libc::ENOENT));
        }

        let deletions = self.deletion_names()?;

        let mut results: HashMap<String, u32> = HashMap::new();
        for (i, fs) in self.branches.iter().enumerate() {
            if (i as i32) < dir_branch.branch {
                continue;
            }
            let stream = match fs.open_dir(path, ctx) {
                Ok(s) => s,
                Err(_) => continue,
            };
            for entry in stream {
                if i == 0 {
                    // The writable branch has no deleted files to filter.
                    results.insert(entry.name, entry.mode);
                    continue;
                }
                if results.contains_key(&entry.name) {
                    continue;
                }
                if deletions.contains(&file_path_hash(&join(path, &entry.name))) {
                    continue;
                }
                results.insert(entry.name, entry.mode);
            }
        }

        if path.is_empty() {
            results.remove(&self.options.deletion_dir);
            results.remove(READONLY_NAME);
        }

        let entries: Vec<DirEntry> = results
            .into_iter()
            .map(|(name, mode)| DirEntry { name, mode })
            .collect();
        Ok(Box::new(entries.into_iter()))
    }

    fn flush(&self, path: &str) -> io::Result<()> {
        // Refresh timestamps and the size field on the next query.
        self.branch_cache.remove(path.trim_end_matches('/'));
        Ok(())
    }

    fn get_xattr(&self, path: &str, name: &str, ctx: &Context) -> io::Result<Vec<u8>> {
        if path == DROP_CACHE_NAME {
            return Err(err(libc::ENODATA));
        }
        let r = self.get_branch(path);
        if r.branch >= 0 {
            return self.branches[r.branch as usize].get_xattr(path, name, ctx);
        }
        Err(err(libc::ENOENT))
    }

    fn drop_caches(&self) {
        self.drop_all_caches();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_path_hash_groups_by_directory() {
        let h1 = file_path_hash("a/b/c");
        let h2 = file_path_hash("a/b/d");
        let h3 = file_path_hash("a/x/c");

        assert!(h1.ends_with("-c"));
        assert!(h2.ends_with("-d"));
        // Same directory, same prefix.
        assert_eq!(h1[..16], h2[..16]);
        // Different directory, different prefix.
        assert_ne!(h1[..16], h3[..16]);

        // Root level paths hash the empty directory.
        let r1 = file_path_hash("file");
        let r2 = file_path_hash("other");
        assert_eq!(r1[..16], r2[..16]);
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_path("a/b/c"), ("a/b/", "c"));
        assert_eq!(split_path("c"), ("", "c"));
        assert_eq!(parent_dir("a/b/c"), "a/b");
        assert_eq!(parent_dir("c"), "");
        assert_eq!(join("", "x"), "x");
        assert_eq!(join("a", "x"), "a/x");
    }
}
