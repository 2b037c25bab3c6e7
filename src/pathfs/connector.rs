// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The connector adapting path-oriented filesystems onto the raw FUSE interface.
//!
//! The connector owns the inode table (lookup counts, parent/child links), the mount
//! table and the open file/directory handle tables. Paths are synthesized from the
//! inode tree under the registry read lock, copied out, and the user filesystem is
//! only ever called with the lock released.

use std::ffi::CStr;
use std::io;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use crate::abi::fuse_abi::{Attr, Kstatfs, SetattrIn, ROOT_ID};
use crate::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, GetxattrReply, ListxattrReply, OpenOptions,
    SetattrValid,
};
use crate::pathfs::dir::DirHandle;
use crate::pathfs::handle::HandleMap;
use crate::pathfs::inode::{InodeEntry, InodeTable};
use crate::pathfs::{FileSystemOptions, PathFile, PathFilesystem};
use crate::transport::{BufferPool, FuseNotifier};

fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

struct MountData {
    fs: Arc<dyn PathFilesystem>,
    options: FileSystemOptions,
    // Open files, dirs and child mounts pinning this mount.
    open_count: i64,
    unmount_pending: bool,
}

struct Tree {
    inodes: InodeTable,
    mounts: Vec<Option<MountData>>,
}

impl Tree {
    // Collect the path of `node` relative to its mount root. Must run under the lock.
    fn path_of(&self, node: u64) -> io::Result<(String, usize)> {
        let mut rev_components: Vec<&str> = Vec::with_capacity(8);
        let mut current = self.inodes.get(node).ok_or_else(ebadf)?;

        loop {
            if let Some(mount) = current.mount_point {
                let data = self.mounts[mount].as_ref().ok_or_else(enoent)?;
                if data.unmount_pending {
                    return Err(enoent());
                }
                let mut components = String::new();
                for (i, c) in rev_components.iter().rev().enumerate() {
                    if i > 0 {
                        components.push('/');
                    }
                    components.push_str(c);
                }
                return Ok((components, mount));
            }
            rev_components.push(&current.name);
            let parent = current.parent.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::Other,
                    "inode tree corrupted: no mount on the parent chain",
                )
            })?;
            current = self.inodes.get(parent).ok_or_else(ebadf)?;
        }
    }

    fn mount_fs(&self, mount: usize) -> io::Result<(Arc<dyn PathFilesystem>, FileSystemOptions)> {
        let data = self.mounts.get(mount).and_then(|m| m.as_ref()).ok_or_else(enoent)?;
        if data.unmount_pending {
            return Err(enoent());
        }
        Ok((data.fs.clone(), data.options.clone()))
    }

    // Detach `child` from every parent that records it under `name`-agnostic links.
    // Must run under the lock.
    fn detach_all(&mut self, child: u64) {
        let (primary, backrefs) = match self.inodes.get(child) {
            Some(e) => (
                e.parent.map(|p| (p, e.name.clone())),
                e.backrefs.clone(),
            ),
            None => return,
        };
        if let Some((parent, name)) = primary {
            if let Some(p) = self.inodes.get_mut(parent) {
                if p.children.get(&name) == Some(&child) {
                    p.children.remove(&name);
                }
            }
        }
        for (parent, name) in backrefs {
            if let Some(p) = self.inodes.get_mut(parent) {
                if p.children.get(&name) == Some(&child) {
                    p.children.remove(&name);
                }
            }
        }
        if let Some(e) = self.inodes.get_mut(child) {
            e.parent = None;
            e.backrefs.clear();
        }
    }

    // Evict `node` if nothing keeps it alive anymore. Must run under the lock.
    fn maybe_evict(&mut self, node: u64) {
        let evict = match self.inodes.get(node) {
            Some(e) => {
                e.evictable()
                    || (e.lookup_count == 0
                        && e.children.is_empty()
                        && !e.persistent
                        && e.mount_point
                            .map(|m| {
                                self.mounts[m]
                                    .as_ref()
                                    .map(|d| d.unmount_pending)
                                    .unwrap_or(true)
                            })
                            .unwrap_or(false))
            }
            None => false,
        };
        if evict {
            if let Some(mount) = self.inodes.get(node).and_then(|e| e.mount_point) {
                self.mounts[mount] = None;
            }
            self.detach_all(node);
            self.inodes.remove(node);
        }
    }
}

struct OpenFile {
    file: Arc<dyn PathFile>,
    mount: usize,
    path: String,
}

struct OpenDir {
    dir: DirHandle,
    mount: usize,
}

/// Adapter exposing a tree of [`PathFilesystem`] mounts as a raw [`FileSystem`].
pub struct PathFileSystemConnector {
    tree: RwLock<Tree>,
    files: HandleMap<OpenFile>,
    dirs: HandleMap<OpenDir>,
    buffers: Arc<BufferPool>,
    notifier: Mutex<Option<FuseNotifier>>,
    // Tests set this to make bookkeeping corruption fatal.
    paranoia: AtomicBool,
}

impl PathFileSystemConnector {
    /// Create a connector with `fs` mounted at the root.
    pub fn new(fs: Arc<dyn PathFilesystem>, options: FileSystemOptions) -> Arc<Self> {
        Self::with_buffer_pool(
            fs,
            options,
            Arc::new(BufferPool::new(crate::transport::MAX_KERNEL_WRITE)),
        )
    }

    /// Create a connector sharing an existing buffer pool with the service loop.
    pub fn with_buffer_pool(
        fs: Arc<dyn PathFilesystem>,
        options: FileSystemOptions,
        buffers: Arc<BufferPool>,
    ) -> Arc<Self> {
        let check_handles = !options.skip_check_handles;
        let tree = Tree {
            inodes: InodeTable::new(check_handles),
            mounts: vec![Some(MountData {
                fs: fs.clone(),
                options,
                open_count: 0,
                unmount_pending: false,
            })],
        };

        let connector = Arc::new(PathFileSystemConnector {
            tree: RwLock::new(tree),
            files: HandleMap::new(true),
            dirs: HandleMap::new(true),
            buffers,
            notifier: Mutex::new(None),
            paranoia: AtomicBool::new(false),
        });
        fs.on_mount(&connector);
        connector
    }

    /// Attach the kernel notification writer, normally the daemon's.
    pub fn set_notifier(&self, notifier: FuseNotifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    /// Make bookkeeping corruption fatal instead of reporting EIO. Used by tests.
    pub fn set_paranoia(&self, on: bool) {
        self.paranoia.store(on, Ordering::Relaxed);
    }

    /// Ask the kernel to drop cached data of `node`.
    pub fn notify_inval_inode(&self, node: u64, off: i64, len: i64) -> io::Result<()> {
        match self.notifier.lock().unwrap().as_ref() {
            Some(n) => n
                .inval_inode(node, off, len)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())),
            None => Err(io::Error::from_raw_os_error(libc::ENOSYS)),
        }
    }

    /// Ask the kernel to drop the cached entry `name` under `parent`. An empty parent
    /// path refers to the root.
    pub fn notify_inval_entry(&self, parent: u64, name: &str) -> io::Result<()> {
        match self.notifier.lock().unwrap().as_ref() {
            Some(n) => n
                .inval_entry(parent, name)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())),
            None => Err(io::Error::from_raw_os_error(libc::ENOSYS)),
        }
    }

    /// Find the node id of `path` by walking the already-known tree, without calling
    /// user filesystems.
    pub fn find_node(&self, path: &str) -> Option<u64> {
        let tree = self.tree.read().unwrap();
        let mut node = ROOT_ID;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            node = *tree.inodes.get(node)?.children.get(comp)?;
        }
        Some(node)
    }

    /// Mount `fs` on `path` (relative to the connector root), looking up the path
    /// components first.
    pub fn mount(
        self: &Arc<Self>,
        path: &str,
        fs: Arc<dyn PathFilesystem>,
        options: FileSystemOptions,
    ) -> io::Result<()> {
        let ctx = Context::root();
        let mut node = ROOT_ID;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let entry = self.internal_lookup(&ctx, node, comp, 0)?;
            if entry.inode == 0 {
                return Err(enoent());
            }
            node = entry.inode;
        }

        {
            let mut tree = self.tree.write().unwrap();
            let parent_mount = {
                let entry = tree.inodes.get(node).ok_or_else(ebadf)?;
                if entry.mount_point.is_some() {
                    return Err(io::Error::from_raw_os_error(libc::EBUSY));
                }
                if entry.kind & libc::S_IFMT != libc::S_IFDIR {
                    return Err(io::Error::from_raw_os_error(libc::EINVAL));
                }
                if !entry.children.is_empty() {
                    return Err(io::Error::from_raw_os_error(libc::EBUSY));
                }
                entry.mount
            };

            let index = tree.mounts.len();
            tree.mounts.push(Some(MountData {
                fs: fs.clone(),
                options,
                open_count: 0,
                unmount_pending: false,
            }));
            {
                let entry = tree.inodes.get_mut(node).unwrap();
                entry.mount_point = Some(index);
                entry.mount = index;
            }
            if let Some(m) = tree.mounts[parent_mount].as_mut() {
                m.open_count += 1;
            }
        }
        self.verify_tree();

        fs.on_mount(self);
        Ok(())
    }

    /// Unmount the filesystem mounted on `path`. Fails with `EBUSY` while files are
    /// open below it.
    pub fn unmount(&self, path: &str) -> io::Result<()> {
        let node = self.find_node(path).ok_or_else(enoent)?;

        let fs = {
            let mut tree = self.tree.write().unwrap();
            let (mount, parent_mount) = {
                let entry = tree.inodes.get(node).ok_or_else(ebadf)?;
                let mount = entry
                    .mount_point
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
                let parent = entry.parent.ok_or_else(|| {
                    // The connector root cannot be unmounted.
                    io::Error::from_raw_os_error(libc::EBUSY)
                })?;
                let parent_mount = tree.inodes.get(parent).ok_or_else(ebadf)?.mount;
                (mount, parent_mount)
            };

            {
                let data = tree.mounts[mount].as_mut().ok_or_else(enoent)?;
                if data.open_count > 0 {
                    warn!("unmount {}: busy", path);
                    return Err(io::Error::from_raw_os_error(libc::EBUSY));
                }
                data.unmount_pending = true;
            }
            let fs = tree.mounts[mount].as_ref().unwrap().fs.clone();

            let kernel_refs = tree.inodes.get(node).map(|e| e.lookup_count).unwrap_or(0);
            if kernel_refs == 0 {
                // Nothing references the mount root anymore: detach it now. The
                // subtree re-surfaces as ordinary entries of the parent mount.
                let entry = tree.inodes.get_mut(node).unwrap();
                entry.mount_point = None;
                entry.mount = parent_mount;
                tree.mounts[mount] = None;
                tree.maybe_evict(node);
            }

            if let Some(m) = tree.mounts[parent_mount].as_mut() {
                m.open_count -= 1;
            }
            fs
        };
        self.verify_tree();

        fs.on_unmount();
        Ok(())
    }

    fn join_path(dir: &str, name: &str) -> String {
        if dir.is_empty() {
            name.to_string()
        } else {
            let mut p = String::with_capacity(dir.len() + 1 + name.len());
            p.push_str(dir);
            p.push('/');
            p.push_str(name);
            p
        }
    }

    // Path and filesystem of `node`, resolved under the read lock and copied out.
    fn get_path(&self, node: u64) -> io::Result<(String, usize, Arc<dyn PathFilesystem>, FileSystemOptions)> {
        let tree = self.tree.read().unwrap();
        let (path, mount) = tree.path_of(node)?;
        let (fs, options) = tree.mount_fs(mount)?;
        Ok((path, mount, fs, options))
    }

    fn stamp_owner(options: &FileSystemOptions, attr: &mut Attr) {
        if let Some(owner) = options.owner {
            attr.uid = owner.uid;
            attr.gid = owner.gid;
        }
    }

    fn verify_tree(&self) {
        if !self.paranoia.load(Ordering::Relaxed) {
            return;
        }
        let tree = self.tree.read().unwrap();
        if let Err(msg) = tree.inodes.verify() {
            panic!("inode bookkeeping corrupted: {}", msg);
        }
    }

    // Record a positive lookup result in the tree, returning the stable node id.
    fn lookup_update(&self, parent: u64, name: &str, kind: u32, lookup_count: u64) -> io::Result<u64> {
        let mut tree = self.tree.write().unwrap();
        let (mount, existing) = {
            let p = tree.inodes.get(parent).ok_or_else(ebadf)?;
            (p.mount, p.children.get(name).copied())
        };

        let node = match existing {
            Some(node) => {
                let entry = tree.inodes.get_mut(node).ok_or_else(ebadf)?;
                entry.lookup_count += lookup_count;
                entry.kind = kind & libc::S_IFMT;
                node
            }
            None => {
                let node = tree.inodes.alloc(|node_id| InodeEntry {
                    node_id,
                    lookup_count,
                    kind: kind & libc::S_IFMT,
                    parent: Some(parent),
                    name: name.to_string(),
                    backrefs: Vec::new(),
                    children: Default::default(),
                    mount,
                    mount_point: None,
                    persistent: false,
                });
                tree.inodes
                    .get_mut(parent)
                    .ok_or_else(ebadf)?
                    .children
                    .insert(name.to_string(), node);
                node
            }
        };
        Ok(node)
    }

    fn internal_lookup(
        &self,
        ctx: &Context,
        parent: u64,
        name: &str,
        lookup_count: u64,
    ) -> io::Result<Entry> {
        // A lookup crossing into a sub-mount returns the child mount's root.
        let crossing = {
            let tree = self.tree.read().unwrap();
            match tree
                .inodes
                .get(parent)
                .ok_or_else(ebadf)?
                .children
                .get(name)
            {
                Some(&child) => tree
                    .inodes
                    .get(child)
                    .and_then(|e| e.mount_point.map(|m| (child, m))),
                None => None,
            }
        };
        if let Some((child, mount)) = crossing {
            let (fs, options) = self.tree.read().unwrap().mount_fs(mount)?;
            let mut attr = fs.get_attr("", ctx)?;
            Self::stamp_owner(&options, &mut attr);
            attr.ino = child;
            let mut tree = self.tree.write().unwrap();
            if let Some(e) = tree.inodes.get_mut(child) {
                e.lookup_count += lookup_count;
            }
            return Ok(Entry {
                inode: child,
                generation: 1,
                attr,
                attr_timeout: options.attr_timeout,
                entry_timeout: options.entry_timeout,
            });
        }

        let (ppath, _mount, fs, options) = self.get_path(parent)?;
        let path = Self::join_path(&ppath, name);

        let mut attr = match fs.get_attr(&path, ctx) {
            Ok(attr) => attr,
            Err(e) => {
                if e.raw_os_error() == Some(libc::ENOENT)
                    && options.negative_timeout > Duration::from_secs(0)
                {
                    return Ok(Entry::negative(options.negative_timeout));
                }
                return Err(e);
            }
        };

        let node = self.lookup_update(parent, name, attr.mode, lookup_count)?;
        self.verify_tree();

        Self::stamp_owner(&options, &mut attr);
        attr.ino = node;
        Ok(Entry {
            inode: node,
            generation: 1,
            attr,
            attr_timeout: options.attr_timeout,
            entry_timeout: options.entry_timeout,
        })
    }

    fn forget_update(&self, node: u64, count: u64) {
        if node == ROOT_ID {
            return;
        }
        let mut tree = self.tree.write().unwrap();
        if let Some(entry) = tree.inodes.get_mut(node) {
            entry.lookup_count = entry.lookup_count.saturating_sub(count);
        }
        tree.maybe_evict(node);
    }

    fn unlink_update(&self, parent: u64, name: &str) {
        let mut tree = self.tree.write().unwrap();
        let child = match tree.inodes.get_mut(parent) {
            Some(p) => p.children.remove(name),
            None => None,
        };
        if let Some(child) = child {
            if let Some(e) = tree.inodes.get_mut(child) {
                if e.parent == Some(parent) && e.name == name {
                    // Promote the next hard link to the primary position.
                    if let Some((np, nn)) = e.backrefs.pop() {
                        e.parent = Some(np);
                        e.name = nn;
                    } else {
                        e.parent = None;
                        e.name.clear();
                    }
                } else {
                    e.backrefs.retain(|(p, n)| !(*p == parent && n == name));
                }
            }
            tree.maybe_evict(child);
        }
    }

    fn rename_update(&self, old_parent: u64, old_name: &str, new_parent: u64, new_name: &str) {
        let mut tree = self.tree.write().unwrap();
        let child = match tree.inodes.get_mut(old_parent) {
            Some(p) => p.children.remove(old_name),
            None => None,
        };
        let child = match child {
            Some(c) => c,
            // A rename raced with an unlink or another rename; the user operation
            // already succeeded, so there is nothing left to fix up.
            None => return,
        };

        // An entry overwritten by the rename loses its place in the tree.
        let displaced = tree
            .inodes
            .get_mut(new_parent)
            .and_then(|p| p.children.remove(new_name));
        if let Some(displaced) = displaced {
            if displaced != child {
                if let Some(e) = tree.inodes.get_mut(displaced) {
                    if e.parent == Some(new_parent) && e.name == new_name {
                        if let Some((np, nn)) = e.backrefs.pop() {
                            e.parent = Some(np);
                            e.name = nn;
                        } else {
                            e.parent = None;
                            e.name.clear();
                        }
                    } else {
                        e.backrefs
                            .retain(|(p, n)| !(*p == new_parent && n == new_name));
                    }
                }
                tree.maybe_evict(displaced);
            }
        }

        if let Some(e) = tree.inodes.get_mut(child) {
            if e.parent == Some(old_parent) && e.name == old_name {
                e.parent = Some(new_parent);
                e.name = new_name.to_string();
            } else {
                e.backrefs.retain(|(p, n)| !(*p == old_parent && n == old_name));
                e.backrefs.push((new_parent, new_name.to_string()));
            }
        }
        if let Some(p) = tree.inodes.get_mut(new_parent) {
            p.children.insert(new_name.to_string(), child);
        }
    }

    fn add_open(&self, mount: usize, delta: i64) {
        let mut tree = self.tree.write().unwrap();
        if let Some(m) = tree.mounts.get_mut(mount).and_then(|m| m.as_mut()) {
            m.open_count += delta;
        }
    }

    fn cstr(name: &CStr) -> io::Result<&str> {
        name.to_str()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn now_ns() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    // Apply a SETATTR decomposed into discrete operations; the first failure aborts
    // the sequence and earlier steps are not rolled back.
    fn apply_setattr(
        &self,
        target: SetattrTarget,
        attr: &SetattrIn,
        valid: SetattrValid,
        ctx: &Context,
    ) -> io::Result<()> {
        if valid.contains(SetattrValid::MODE) {
            match &target {
                SetattrTarget::Path(fs, path) => fs.chmod(path, attr.mode & 0o7777, ctx)?,
                SetattrTarget::File(f) => f.chmod(attr.mode & 0o7777)?,
            }
        }
        if valid.intersects(SetattrValid::UID | SetattrValid::GID) {
            let uid = if valid.contains(SetattrValid::UID) {
                attr.uid
            } else {
                u32::MAX
            };
            let gid = if valid.contains(SetattrValid::GID) {
                attr.gid
            } else {
                u32::MAX
            };
            match &target {
                SetattrTarget::Path(fs, path) => fs.chown(path, uid, gid, ctx)?,
                SetattrTarget::File(f) => f.chown(uid, gid)?,
            }
        }
        if valid.contains(SetattrValid::SIZE) {
            match &target {
                SetattrTarget::Path(fs, path) => fs.truncate(path, attr.size, ctx)?,
                SetattrTarget::File(f) => f.truncate(attr.size)?,
            }
        }
        if valid.intersects(
            SetattrValid::ATIME
                | SetattrValid::MTIME
                | SetattrValid::ATIME_NOW
                | SetattrValid::MTIME_NOW,
        ) {
            let now = Self::now_ns();
            let atime = if valid.contains(SetattrValid::ATIME_NOW) {
                now
            } else {
                attr.atime * 1_000_000_000 + attr.atimensec as u64
            };
            let mtime = if valid.contains(SetattrValid::MTIME_NOW) {
                now
            } else {
                attr.mtime * 1_000_000_000 + attr.mtimensec as u64
            };
            match &target {
                SetattrTarget::Path(fs, path) => fs.utimens(path, atime, mtime, ctx)?,
                SetattrTarget::File(f) => f.utimens(atime, mtime)?,
            }
        }
        Ok(())
    }
}

enum SetattrTarget {
    Path(Arc<dyn PathFilesystem>, String),
    File(Arc<dyn PathFile>),
}

impl FileSystem for PathFileSystemConnector {
    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    fn destroy(&self) {}

    fn lookup(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<Entry> {
        let name = Self::cstr(name)?;
        self.internal_lookup(&ctx, parent, name, 1)
    }

    fn forget(&self, _ctx: Context, inode: u64, count: u64) {
        self.forget_update(inode, count);
        self.verify_tree();
    }

    fn getattr(&self, ctx: Context, inode: u64, handle: Option<u64>) -> io::Result<(Attr, Duration)> {
        if let Some(fh) = handle {
            if let Some(open) = self.files.get(fh) {
                // The file may already be unlinked or renamed over; its mount still
                // knows the attribute options.
                let options = self.tree.read().unwrap().mount_fs(open.mount)?.1;
                let mut attr = open.file.get_attr()?;
                Self::stamp_owner(&options, &mut attr);
                attr.ino = inode;
                return Ok((attr, options.attr_timeout));
            }
        }

        let (path, _, fs, options) = self.get_path(inode)?;
        let mut attr = fs.get_attr(&path, &ctx)?;
        Self::stamp_owner(&options, &mut attr);
        attr.ino = inode;
        Ok((attr, options.attr_timeout))
    }

    fn setattr(
        &self,
        ctx: Context,
        inode: u64,
        attr: SetattrIn,
        handle: Option<u64>,
        valid: SetattrValid,
    ) -> io::Result<(Attr, Duration)> {
        let open = handle.and_then(|fh| self.files.get(fh));
        match &open {
            Some(open) => {
                self.apply_setattr(SetattrTarget::File(open.file.clone()), &attr, valid, &ctx)?
            }
            None => {
                let (path, _, fs, _) = self.get_path(inode)?;
                self.apply_setattr(SetattrTarget::Path(fs, path), &attr, valid, &ctx)?
            }
        }

        // Return the filesystem's authoritative view after all mutations.
        self.getattr(ctx, inode, handle)
    }

    fn readlink(&self, ctx: Context, inode: u64) -> io::Result<Vec<u8>> {
        let (path, _, fs, _) = self.get_path(inode)?;
        fs.readlink(&path, &ctx).map(String::into_bytes)
    }

    fn symlink(&self, ctx: Context, linkname: &CStr, parent: u64, name: &CStr) -> io::Result<Entry> {
        let name = Self::cstr(name)?;
        let target = Self::cstr(linkname)?;
        let (ppath, _, fs, _) = self.get_path(parent)?;
        fs.symlink(target, &Self::join_path(&ppath, name), &ctx)?;
        self.internal_lookup(&ctx, parent, name, 1)
    }

    fn mknod(
        &self,
        ctx: Context,
        parent: u64,
        name: &CStr,
        mode: u32,
        rdev: u32,
        _umask: u32,
    ) -> io::Result<Entry> {
        let name = Self::cstr(name)?;
        let (ppath, _, fs, _) = self.get_path(parent)?;
        fs.mknod(&Self::join_path(&ppath, name), mode, rdev, &ctx)?;
        self.internal_lookup(&ctx, parent, name, 1)
    }

    fn mkdir(&self, ctx: Context, parent: u64, name: &CStr, mode: u32, _umask: u32) -> io::Result<Entry> {
        let name = Self::cstr(name)?;
        let (ppath, _, fs, _) = self.get_path(parent)?;
        fs.mkdir(&Self::join_path(&ppath, name), mode, &ctx)?;
        self.internal_lookup(&ctx, parent, name, 1)
    }

    fn unlink(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<()> {
        let name = Self::cstr(name)?;
        let (ppath, _, fs, _) = self.get_path(parent)?;
        fs.unlink(&Self::join_path(&ppath, name), &ctx)?;
        self.unlink_update(parent, name);
        self.verify_tree();
        Ok(())
    }

    fn rmdir(&self, ctx: Context, parent: u64, name: &CStr) -> io::Result<()> {
        let name = Self::cstr(name)?;
        let (ppath, _, fs, _) = self.get_path(parent)?;
        fs.rmdir(&Self::join_path(&ppath, name), &ctx)?;
        self.unlink_update(parent, name);
        self.verify_tree();
        Ok(())
    }

    fn rename(
        &self,
        ctx: Context,
        olddir: u64,
        oldname: &CStr,
        newdir: u64,
        newname: &CStr,
    ) -> io::Result<()> {
        let oldname = Self::cstr(oldname)?;
        let newname = Self::cstr(newname)?;

        let (old_path, old_mount, fs, _) = self.get_path(olddir)?;
        let (new_path, new_mount, _, _) = self.get_path(newdir)?;
        if old_mount != new_mount {
            return Err(io::Error::from_raw_os_error(libc::EXDEV));
        }
        // A mount point cannot be moved.
        {
            let tree = self.tree.read().unwrap();
            if let Some(p) = tree.inodes.get(olddir) {
                if let Some(&child) = p.children.get(oldname) {
                    if tree
                        .inodes
                        .get(child)
                        .map(|e| e.mount_point.is_some())
                        .unwrap_or(false)
                    {
                        return Err(io::Error::from_raw_os_error(libc::EBUSY));
                    }
                }
            }
        }

        fs.rename(
            &Self::join_path(&old_path, oldname),
            &Self::join_path(&new_path, newname),
            &ctx,
        )?;

        // The kernel updates its own tables after a successful rename; ours must
        // follow along.
        self.rename_update(olddir, oldname, newdir, newname);
        self.verify_tree();
        Ok(())
    }

    fn link(&self, ctx: Context, inode: u64, newparent: u64, newname: &CStr) -> io::Result<Entry> {
        let newname = Self::cstr(newname)?;
        let (old_path, old_mount, fs, _) = self.get_path(inode)?;
        let (new_dir, new_mount, _, _) = self.get_path(newparent)?;
        if old_mount != new_mount {
            return Err(io::Error::from_raw_os_error(libc::EXDEV));
        }
        let new_path = Self::join_path(&new_dir, newname);
        fs.link(&old_path, &new_path, &ctx)?;

        // Record the second name as a back reference of the same inode.
        {
            let mut tree = self.tree.write().unwrap();
            let known = tree
                .inodes
                .get(newparent)
                .map(|p| p.children.contains_key(newname))
                .unwrap_or(false);
            if !known && tree.inodes.get(inode).is_some() {
                if let Some(e) = tree.inodes.get_mut(inode) {
                    e.backrefs.push((newparent, newname.to_string()));
                }
                if let Some(p) = tree.inodes.get_mut(newparent) {
                    p.children.insert(newname.to_string(), inode);
                }
            }
        }
        self.verify_tree();

        self.internal_lookup(&ctx, newparent, newname, 1)
    }

    fn open(&self, ctx: Context, inode: u64, flags: u32) -> io::Result<(Option<u64>, OpenOptions)> {
        let (path, mount, fs, _) = self.get_path(inode)?;
        let file = fs.open(&path, flags, &ctx)?;
        self.add_open(mount, 1);
        let fh = self.files.insert(OpenFile { file, mount, path });
        Ok((Some(fh), OpenOptions::empty()))
    }

    fn create(
        &self,
        ctx: Context,
        parent: u64,
        name: &CStr,
        mode: u32,
        flags: u32,
        _umask: u32,
    ) -> io::Result<(Entry, Option<u64>, OpenOptions)> {
        let name = Self::cstr(name)?;
        let (ppath, mount, fs, _) = self.get_path(parent)?;
        let path = Self::join_path(&ppath, name);
        let file = fs.create(&path, flags, mode, &ctx)?;
        self.add_open(mount, 1);
        let fh = self.files.insert(OpenFile { file, mount, path });

        let entry = self.internal_lookup(&ctx, parent, name, 1)?;
        Ok((entry, Some(fh), OpenOptions::empty()))
    }

    fn read(
        &self,
        _ctx: Context,
        _inode: u64,
        handle: u64,
        w: &mut dyn io::Write,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let open = self.files.get(handle).ok_or_else(ebadf)?;
        let mut buf = self.buffers.acquire(size as usize);
        let res = open.file.read(&mut buf, offset);
        let count = match res {
            Ok(count) => {
                w.write_all(&buf[..count])?;
                Ok(count)
            }
            Err(e) => Err(e),
        };
        self.buffers.release(buf);
        count
    }

    fn write(
        &self,
        _ctx: Context,
        _inode: u64,
        handle: u64,
        data: &[u8],
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
    ) -> io::Result<usize> {
        let open = self.files.get(handle).ok_or_else(ebadf)?;
        open.file.write(data, offset)
    }

    fn flush(&self, _ctx: Context, _inode: u64, handle: u64, _lock_owner: u64) -> io::Result<()> {
        let open = self.files.get(handle).ok_or_else(ebadf)?;
        open.file.flush()?;
        // Give the filesystem a chance to refresh whatever it caches for the path.
        let tree = self.tree.read().unwrap();
        if let Ok((fs, _)) = tree.mount_fs(open.mount) {
            drop(tree);
            fs.flush(&open.path)?;
        }
        Ok(())
    }

    fn fsync(&self, _ctx: Context, _inode: u64, datasync: bool, handle: u64) -> io::Result<()> {
        let open = self.files.get(handle).ok_or_else(ebadf)?;
        open.file.fsync(datasync)
    }

    fn release(
        &self,
        _ctx: Context,
        _inode: u64,
        _flags: u32,
        handle: u64,
        flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        let open = self.files.remove(handle).ok_or_else(ebadf)?;
        if flush {
            let _ = open.file.flush();
        }
        open.file.release();
        self.add_open(open.mount, -1);
        Ok(())
    }

    fn statfs(&self, _ctx: Context, inode: u64) -> io::Result<Kstatfs> {
        let (path, _, fs, _) = self.get_path(inode)?;
        fs.statfs(&path)
    }

    fn opendir(&self, ctx: Context, inode: u64, _flags: u32) -> io::Result<(Option<u64>, OpenOptions)> {
        let (path, mount, fs, _) = self.get_path(inode)?;
        let stream = fs.open_dir(&path, &ctx)?;
        self.add_open(mount, 1);
        let fh = self.dirs.insert(OpenDir {
            dir: DirHandle::new(stream),
            mount,
        });
        Ok((Some(fh), OpenOptions::empty()))
    }

    fn readdir(
        &self,
        _ctx: Context,
        _inode: u64,
        handle: u64,
        _size: u32,
        _offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let open = self.dirs.get(handle).ok_or_else(ebadf)?;
        open.dir.read(add_entry)
    }

    fn releasedir(&self, _ctx: Context, _inode: u64, _flags: u32, handle: u64) -> io::Result<()> {
        let open = self.dirs.remove(handle).ok_or_else(ebadf)?;
        open.dir.release();
        self.add_open(open.mount, -1);
        Ok(())
    }

    fn fsyncdir(&self, _ctx: Context, _inode: u64, _datasync: bool, _handle: u64) -> io::Result<()> {
        Ok(())
    }

    fn access(&self, ctx: Context, inode: u64, mask: u32) -> io::Result<()> {
        let (path, _, fs, _) = self.get_path(inode)?;
        fs.access(&path, mask, &ctx)
    }

    fn setxattr(&self, ctx: Context, inode: u64, name: &CStr, value: &[u8], flags: u32) -> io::Result<()> {
        let name = Self::cstr(name)?;
        let (path, _, fs, _) = self.get_path(inode)?;
        fs.set_xattr(&path, name, value, flags, &ctx)
    }

    fn getxattr(&self, ctx: Context, inode: u64, name: &CStr, size: u32) -> io::Result<GetxattrReply> {
        let name = Self::cstr(name)?;
        let (path, _, fs, _) = self.get_path(inode)?;
        let data = fs.get_xattr(&path, name, &ctx)?;
        if size == 0 {
            Ok(GetxattrReply::Count(data.len() as u32))
        } else if data.len() > size as usize {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        } else {
            Ok(GetxattrReply::Value(data))
        }
    }

    fn listxattr(&self, ctx: Context, inode: u64, size: u32) -> io::Result<ListxattrReply> {
        let (path, _, fs, _) = self.get_path(inode)?;
        let names = fs.list_xattr(&path, &ctx)?;
        let mut buf = Vec::new();
        for name in names {
            buf.extend_from_slice(name.as_bytes());
            buf.push(0);
        }
        if size == 0 {
            Ok(ListxattrReply::Count(buf.len() as u32))
        } else if buf.len() > size as usize {
            Err(io::Error::from_raw_os_error(libc::ERANGE))
        } else {
            Ok(ListxattrReply::Names(buf))
        }
    }

    fn removexattr(&self, ctx: Context, inode: u64, name: &CStr) -> io::Result<()> {
        let name = Self::cstr(name)?;
        let (path, _, fs, _) = self.get_path(inode)?;
        fs.remove_xattr(&path, name, &ctx)
    }
}
