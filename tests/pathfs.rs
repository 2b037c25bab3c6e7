// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Connector-level tests over a loopback filesystem: the inode bookkeeping a kernel
//! would observe through LOOKUP/FORGET, rename, sub-mounts and open handles.

use std::ffi::CString;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use vmm_sys_util::tempdir::TempDir;

use fuse_pathfs::abi::fuse_abi::{SetattrIn, ROOT_ID};
use fuse_pathfs::api::filesystem::{Context, Entry, FileSystem, SetattrValid};
use fuse_pathfs::pathfs::{FileSystemOptions, LoopbackFs, PathFileSystemConnector};

fn ctx() -> Context {
    Context::root()
}

fn cstr(s: &str) -> CString {
    CString::new(s).unwrap()
}

fn new_connector(dir: &TempDir, options: FileSystemOptions) -> Arc<PathFileSystemConnector> {
    let connector =
        PathFileSystemConnector::new(Arc::new(LoopbackFs::new(dir.as_path())), options);
    connector.set_paranoia(true);
    connector
}

fn lookup(connector: &PathFileSystemConnector, parent: u64, name: &str) -> std::io::Result<Entry> {
    connector.lookup(ctx(), parent, &cstr(name))
}

fn readdir_names(connector: &PathFileSystemConnector, inode: u64) -> Vec<String> {
    let (fh, _) = connector.opendir(ctx(), inode, 0).unwrap();
    let fh = fh.unwrap();
    let mut names = Vec::new();
    connector
        .readdir(ctx(), inode, fh, 4096, 0, &mut |d| {
            names.push(String::from_utf8(d.name.to_vec()).unwrap());
            Ok(1)
        })
        .unwrap();
    connector.releasedir(ctx(), inode, 0, fh).unwrap();
    names
}

#[test]
fn test_loopback_readdir() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("one"), b"").unwrap();
    fs::write(dir.as_path().join("two"), b"").unwrap();
    fs::write(dir.as_path().join("three.txt"), b"").unwrap();

    let connector = new_connector(&dir, FileSystemOptions::default());
    let mut names = readdir_names(&connector, ROOT_ID);
    names.sort();
    assert_eq!(names, vec![".", "..", "one", "three.txt", "two"]);
}

#[test]
fn test_lookup_forget_round_trip() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("file"), b"x").unwrap();

    let connector = new_connector(&dir, FileSystemOptions::default());

    // Repeated lookups return the same node id while the kernel remembers it.
    let e1 = lookup(&connector, ROOT_ID, "file").unwrap();
    let e2 = lookup(&connector, ROOT_ID, "file").unwrap();
    assert_eq!(e1.inode, e2.inode);
    assert_eq!(e1.attr.ino, e1.inode);
    assert_ne!(e1.inode, 0);

    // One forget short of the lookup count keeps the entry alive.
    connector.forget(ctx(), e1.inode, 1);
    let e3 = lookup(&connector, ROOT_ID, "file").unwrap();
    assert_eq!(e3.inode, e1.inode);

    // Matching forgets drop it; a later lookup builds a fresh entry.
    connector.forget(ctx(), e1.inode, 2);
    let e4 = lookup(&connector, ROOT_ID, "file").unwrap();
    assert_ne!(e4.inode, e1.inode);
}

#[test]
fn test_negative_lookup() {
    let dir = TempDir::new().unwrap();

    // Without a negative timeout a miss is an error.
    let connector = new_connector(&dir, FileSystemOptions::default());
    assert_eq!(
        lookup(&connector, ROOT_ID, "missing")
            .unwrap_err()
            .raw_os_error(),
        Some(libc::ENOENT)
    );

    // With one, it is a cacheable negative entry with node id 0.
    let mut options = FileSystemOptions::default();
    options.negative_timeout = Duration::from_secs(1);
    let connector = new_connector(&dir, options);
    let entry = lookup(&connector, ROOT_ID, "missing").unwrap();
    assert_eq!(entry.inode, 0);
    assert_eq!(entry.entry_timeout, Duration::from_secs(1));
}

#[test]
fn test_owner_override() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("file"), b"x").unwrap();

    let mut options = FileSystemOptions::default();
    options.owner = Some(fuse_pathfs::pathfs::Owner { uid: 42, gid: 43 });
    let connector = new_connector(&dir, options);

    let entry = lookup(&connector, ROOT_ID, "file").unwrap();
    assert_eq!(entry.attr.uid, 42);
    assert_eq!(entry.attr.gid, 43);

    let (attr, _) = connector.getattr(ctx(), entry.inode, None).unwrap();
    assert_eq!(attr.uid, 42);
    assert_eq!(attr.gid, 43);
}

#[test]
fn test_skip_check_handles_keeps_ids_small() {
    let dir = TempDir::new().unwrap();
    for i in 0..50 {
        fs::write(dir.as_path().join(format!("f{}", i)), b"").unwrap();
    }

    let mut options = FileSystemOptions::default();
    options.skip_check_handles = true;
    let connector = new_connector(&dir, options);
    for i in 0..50 {
        let e = lookup(&connector, ROOT_ID, &format!("f{}", i)).unwrap();
        assert!(e.inode < (1 << 31));
    }
}

#[test]
fn test_create_write_read() {
    let dir = TempDir::new().unwrap();
    let connector = new_connector(&dir, FileSystemOptions::default());

    let (entry, fh, _) = connector
        .create(
            ctx(),
            ROOT_ID,
            &cstr("file.txt"),
            0o644,
            (libc::O_WRONLY | libc::O_CREAT) as u32,
            0,
        )
        .unwrap();
    let fh = fh.unwrap();
    assert_eq!(
        connector
            .write(ctx(), entry.inode, fh, b"hello", 0, None, false, 0)
            .unwrap(),
        5
    );
    connector.flush(ctx(), entry.inode, fh, 0).unwrap();
    connector
        .release(ctx(), entry.inode, 0, fh, false, false, None)
        .unwrap();

    assert_eq!(fs::read(dir.as_path().join("file.txt")).unwrap(), b"hello");

    let (fh, _) = connector
        .open(ctx(), entry.inode, libc::O_RDONLY as u32)
        .unwrap();
    let fh = fh.unwrap();
    let mut out = Vec::new();
    let n = connector
        .read(ctx(), entry.inode, fh, &mut out, 16, 0, None, 0)
        .unwrap();
    assert_eq!(n, 5);
    assert_eq!(out, b"hello");

    // A forged handle is refused.
    assert_eq!(
        connector
            .read(ctx(), entry.inode, fh ^ (1 << 40), &mut out, 16, 0, None, 0)
            .unwrap_err()
            .raw_os_error(),
        Some(libc::EBADF)
    );
    connector
        .release(ctx(), entry.inode, 0, fh, false, false, None)
        .unwrap();
}

#[test]
fn test_setattr_decomposition() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("file"), b"somebytes").unwrap();

    let connector = new_connector(&dir, FileSystemOptions::default());
    let entry = lookup(&connector, ROOT_ID, "file").unwrap();

    let mut attr = SetattrIn::default();
    attr.mode = 0o600;
    attr.size = 4;
    let (got, _) = connector
        .setattr(
            ctx(),
            entry.inode,
            attr,
            None,
            SetattrValid::MODE | SetattrValid::SIZE,
        )
        .unwrap();

    // The reply is the filesystem's authoritative view after all operations.
    assert_eq!(got.size, 4);
    assert_eq!(got.mode & 0o7777, 0o600);
    assert_eq!(fs::read(dir.as_path().join("file")).unwrap(), b"some");
}

#[test]
fn test_rename_updates_tree() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("src"), b"payload").unwrap();

    let connector = new_connector(&dir, FileSystemOptions::default());
    let src = lookup(&connector, ROOT_ID, "src").unwrap();

    connector
        .rename(ctx(), ROOT_ID, &cstr("src"), ROOT_ID, &cstr("dst"))
        .unwrap();

    // Rename(A, B): A is gone, B resolves to the pre-rename inode.
    assert_eq!(
        lookup(&connector, ROOT_ID, "src")
            .unwrap_err()
            .raw_os_error(),
        Some(libc::ENOENT)
    );
    let dst = lookup(&connector, ROOT_ID, "dst").unwrap();
    assert_eq!(dst.inode, src.inode);
}

#[test]
fn test_overwriting_rename_keeps_open_file_readable() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("victim"), b"old-bytes").unwrap();
    fs::write(dir.as_path().join("other"), b"new").unwrap();

    let connector = new_connector(&dir, FileSystemOptions::default());
    let victim = lookup(&connector, ROOT_ID, "victim").unwrap();
    let (fh, _) = connector
        .open(ctx(), victim.inode, libc::O_RDONLY as u32)
        .unwrap();
    let fh = fh.unwrap();

    let (attr, _) = connector.getattr(ctx(), victim.inode, Some(fh)).unwrap();
    assert_eq!(attr.nlink, 1);

    connector
        .rename(ctx(), ROOT_ID, &cstr("other"), ROOT_ID, &cstr("victim"))
        .unwrap();

    // The open fd survives the overwrite: zero links, original content.
    let (attr, _) = connector.getattr(ctx(), victim.inode, Some(fh)).unwrap();
    assert_eq!(attr.nlink, 0);

    let mut out = Vec::new();
    let n = connector
        .read(ctx(), victim.inode, fh, &mut out, 32, 0, None, 0)
        .unwrap();
    assert_eq!(&out[..n], b"old-bytes");

    connector
        .release(ctx(), victim.inode, 0, fh, false, false, None)
        .unwrap();

    // The name now resolves to the renamed file.
    let now = lookup(&connector, ROOT_ID, "victim").unwrap();
    assert_ne!(now.inode, victim.inode);
    assert_eq!(now.attr.size, 3);
}

#[test]
fn test_mknod_special_files() {
    let dir = TempDir::new().unwrap();
    let connector = new_connector(&dir, FileSystemOptions::default());

    let fifo = connector
        .mknod(ctx(), ROOT_ID, &cstr("fifo"), libc::S_IFIFO | 0o644, 0, 0)
        .unwrap();
    assert_eq!(fifo.attr.mode & libc::S_IFMT, libc::S_IFIFO);

    let sock = connector
        .mknod(ctx(), ROOT_ID, &cstr("sock"), libc::S_IFSOCK | 0o644, 0, 0)
        .unwrap();
    assert_eq!(sock.attr.mode & libc::S_IFMT, libc::S_IFSOCK);
}

#[test]
fn test_unlink_keeps_inode_while_open() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("doomed"), b"data").unwrap();

    let connector = new_connector(&dir, FileSystemOptions::default());
    let entry = lookup(&connector, ROOT_ID, "doomed").unwrap();
    let (fh, _) = connector
        .open(ctx(), entry.inode, libc::O_RDONLY as u32)
        .unwrap();
    let fh = fh.unwrap();

    connector.unlink(ctx(), ROOT_ID, &cstr("doomed")).unwrap();
    assert_eq!(
        lookup(&connector, ROOT_ID, "doomed")
            .unwrap_err()
            .raw_os_error(),
        Some(libc::ENOENT)
    );

    // Reads through the handle still work after the name is gone.
    let mut out = Vec::new();
    assert_eq!(
        connector
            .read(ctx(), entry.inode, fh, &mut out, 16, 0, None, 0)
            .unwrap(),
        4
    );
    connector
        .release(ctx(), entry.inode, 0, fh, false, false, None)
        .unwrap();
}

#[test]
fn test_hard_link_shares_inode() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("orig"), b"data").unwrap();

    let connector = new_connector(&dir, FileSystemOptions::default());
    let orig = lookup(&connector, ROOT_ID, "orig").unwrap();

    let linked = connector
        .link(ctx(), orig.inode, ROOT_ID, &cstr("alias"))
        .unwrap();
    assert_eq!(linked.inode, orig.inode);
    assert_eq!(linked.attr.nlink, 2);

    // Dropping the primary name leaves the inode reachable through the alias.
    connector.unlink(ctx(), ROOT_ID, &cstr("orig")).unwrap();
    let again = lookup(&connector, ROOT_ID, "alias").unwrap();
    assert_eq!(again.inode, orig.inode);
}

#[test]
fn test_submounts() {
    let outer = TempDir::new().unwrap();
    let inner = TempDir::new().unwrap();
    fs::create_dir(outer.as_path().join("sub")).unwrap();
    fs::write(inner.as_path().join("inner.txt"), b"inner").unwrap();

    let connector = new_connector(&outer, FileSystemOptions::default());
    connector
        .mount(
            "sub",
            Arc::new(LoopbackFs::new(inner.as_path())),
            FileSystemOptions::default(),
        )
        .unwrap();

    // A lookup crossing the boundary returns the child mount's root.
    let sub = lookup(&connector, ROOT_ID, "sub").unwrap();
    assert!(sub.attr.mode & libc::S_IFMT == libc::S_IFDIR);

    let file = lookup(&connector, sub.inode, "inner.txt").unwrap();
    assert_eq!(file.attr.size, 5);

    // Renames across the mount boundary are rejected.
    assert_eq!(
        connector
            .rename(ctx(), sub.inode, &cstr("inner.txt"), ROOT_ID, &cstr("out"))
            .unwrap_err()
            .raw_os_error(),
        Some(libc::EXDEV)
    );

    // An open file below the mount makes the unmount busy.
    let (fh, _) = connector
        .open(ctx(), file.inode, libc::O_RDONLY as u32)
        .unwrap();
    let fh = fh.unwrap();
    assert_eq!(
        connector.unmount("sub").unwrap_err().raw_os_error(),
        Some(libc::EBUSY)
    );

    connector
        .release(ctx(), file.inode, 0, fh, false, false, None)
        .unwrap();
    connector.unmount("sub").unwrap();
}
