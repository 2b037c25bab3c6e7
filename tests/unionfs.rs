// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Union engine tests over loopback branches in temporary directories.

use std::fs;
use std::path::Path;

use vmm_sys_util::tempdir::TempDir;

use fuse_pathfs::api::filesystem::Context;
use fuse_pathfs::pathfs::PathFilesystem;
use fuse_pathfs::unionfs::{UnionFs, UnionFsOptions};

fn ctx() -> Context {
    Context::root()
}

struct Branches {
    rw: TempDir,
    ro: TempDir,
}

fn setup() -> (UnionFs, Branches) {
    let rw = TempDir::new().unwrap();
    let ro = TempDir::new().unwrap();
    let fs = UnionFs::from_roots(
        &[rw.as_path().to_path_buf(), ro.as_path().to_path_buf()],
        UnionFsOptions::default(),
    )
    .unwrap();
    (fs, Branches { rw, ro })
}

fn list(fs: &UnionFs, path: &str) -> Vec<String> {
    let mut names: Vec<String> = fs.open_dir(path, &ctx()).unwrap().map(|e| e.name).collect();
    names.sort();
    names
}

fn read_all(fs: &UnionFs, path: &str) -> Vec<u8> {
    let f = fs.open(path, libc::O_RDONLY as u32, &ctx()).unwrap();
    let mut buf = vec![0u8; 4096];
    let n = f.read(&mut buf, 0).unwrap();
    buf.truncate(n);
    buf
}

fn write_all(fs: &UnionFs, path: &str, data: &[u8]) {
    let f = fs
        .open(path, (libc::O_WRONLY | libc::O_TRUNC) as u32, &ctx())
        .unwrap();
    assert_eq!(f.write(data, 0).unwrap(), data.len());
    f.release();
}

fn deletion_markers(rw: &Path) -> Vec<String> {
    match fs::read_dir(rw.join("DELETIONS")) {
        Ok(dir) => dir
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn test_deletion_store_created() {
    let (_fs, branches) = setup();
    assert!(branches.rw.as_path().join("DELETIONS").is_dir());
}

#[test]
fn test_union_view_merges_branches() {
    let (fs, branches) = setup();
    fs::write(branches.rw.as_path().join("upper.txt"), b"u").unwrap();
    fs::write(branches.ro.as_path().join("lower.txt"), b"l").unwrap();
    fs::write(branches.rw.as_path().join("both.txt"), b"from-rw").unwrap();
    fs::write(branches.ro.as_path().join("both.txt"), b"from-ro-x").unwrap();

    // The deletion store is hidden at the root; duplicates collapse to branch 0.
    assert_eq!(list(&fs, ""), vec!["both.txt", "lower.txt", "upper.txt"]);
    assert_eq!(fs.get_attr("both.txt", &ctx()).unwrap().size, 7);
    assert_eq!(read_all(&fs, "lower.txt"), b"l");
}

#[test]
fn test_readonly_files_appear_writable() {
    let (fs, branches) = setup();
    fs::write(branches.ro.as_path().join("foo"), b"A").unwrap();
    let attr = fs.get_attr("foo", &ctx()).unwrap();
    assert_ne!(attr.mode & 0o222, 0);
}

#[test]
fn test_write_promotes_to_writable_branch() {
    let (fs, branches) = setup();
    fs::write(branches.ro.as_path().join("foo"), b"A").unwrap();

    write_all(&fs, "foo", b"B");

    // The union and the writable branch see the new content, the read-only branch
    // keeps the original.
    assert_eq!(read_all(&fs, "foo"), b"B");
    assert_eq!(fs::read(branches.rw.as_path().join("foo")).unwrap(), b"B");
    assert_eq!(fs::read(branches.ro.as_path().join("foo")).unwrap(), b"A");
}

#[test]
fn test_promotion_creates_parent_directories() {
    let (fs, branches) = setup();
    fs::create_dir_all(branches.ro.as_path().join("a/b")).unwrap();
    fs::write(branches.ro.as_path().join("a/b/deep.txt"), b"deep").unwrap();

    write_all(&fs, "a/b/deep.txt", b"DEEP");

    assert!(branches.rw.as_path().join("a/b").is_dir());
    assert_eq!(
        fs::read(branches.rw.as_path().join("a/b/deep.txt")).unwrap(),
        b"DEEP"
    );
}

#[test]
fn test_unlink_lower_writes_tombstone() {
    let (fs, branches) = setup();
    fs::write(branches.ro.as_path().join("ro-only"), b"x").unwrap();

    fs.unlink("ro-only", &ctx()).unwrap();

    // A marker appeared in the deletion store, carrying the path as content.
    let markers = deletion_markers(branches.rw.as_path());
    assert_eq!(markers.len(), 1);
    assert!(markers[0].ends_with("-ro-only"));
    let body = fs::read(branches.rw.as_path().join("DELETIONS").join(&markers[0])).unwrap();
    assert_eq!(body, b"ro-only");

    // The union no longer shows the path.
    assert_eq!(
        fs.get_attr("ro-only", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
    assert!(!list(&fs, "").contains(&"ro-only".to_string()));
}

#[test]
fn test_unlink_missing_is_an_error() {
    let (fs, _branches) = setup();
    assert_eq!(
        fs.unlink("never-there", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
}

#[test]
fn test_create_after_delete_replaces_lower_entry() {
    let (fs, branches) = setup();
    fs::write(branches.ro.as_path().join("item"), b"old").unwrap();

    fs.unlink("item", &ctx()).unwrap();
    assert!(fs.get_attr("item", &ctx()).is_err());

    let f = fs
        .create("item", (libc::O_WRONLY | libc::O_CREAT) as u32, 0o644, &ctx())
        .unwrap();
    f.write(b"new", 0).unwrap();
    f.release();

    // The marker is gone and the union sees the new file.
    assert!(deletion_markers(branches.rw.as_path()).is_empty());
    assert_eq!(read_all(&fs, "item"), b"new");
}

#[test]
fn test_create_then_delete_restores_pre_create_state() {
    let (fs, branches) = setup();

    let f = fs
        .create("temp", (libc::O_WRONLY | libc::O_CREAT) as u32, 0o644, &ctx())
        .unwrap();
    f.write(b"t", 0).unwrap();
    f.release();
    assert!(fs.get_attr("temp", &ctx()).is_ok());

    fs.unlink("temp", &ctx()).unwrap();
    assert_eq!(
        fs.get_attr("temp", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
    // Nothing was tombstoned: the file only ever lived on the writable branch.
    assert!(deletion_markers(branches.rw.as_path()).is_empty());
}

#[test]
fn test_rename_file() {
    let (fs, branches) = setup();
    fs::write(branches.ro.as_path().join("src"), b"content").unwrap();

    fs.rename("src", "dst", &ctx()).unwrap();

    assert_eq!(
        fs.get_attr("src", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
    assert_eq!(read_all(&fs, "dst"), b"content");
    // The source survives on the read-only branch, covered by a tombstone.
    assert!(branches.ro.as_path().join("src").exists());
    assert_eq!(deletion_markers(branches.rw.as_path()).len(), 1);
}

#[test]
fn test_rename_missing_source_is_an_error() {
    let (fs, _branches) = setup();
    assert!(fs.rename("ghost", "dst", &ctx()).is_err());
}

#[test]
fn test_rename_directory_promotes_subtree() {
    let (fs, branches) = setup();
    fs::create_dir_all(branches.ro.as_path().join("dir/sub")).unwrap();
    fs::write(branches.ro.as_path().join("dir/a.txt"), b"a").unwrap();
    fs::write(branches.ro.as_path().join("dir/sub/b.txt"), b"b").unwrap();

    fs.rename("dir", "moved", &ctx()).unwrap();

    assert_eq!(list(&fs, "moved"), vec!["a.txt", "sub"]);
    assert_eq!(read_all(&fs, "moved/sub/b.txt"), b"b");
    assert_eq!(
        fs.get_attr("dir", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
    // The promoted copies moved on the writable branch.
    assert!(branches.rw.as_path().join("moved/sub/b.txt").is_file());
}

#[test]
fn test_rmdir_and_mkdir_cycle() {
    let (fs, branches) = setup();
    fs::create_dir(branches.ro.as_path().join("d")).unwrap();
    fs::write(branches.ro.as_path().join("d/child"), b"c").unwrap();

    // A non-empty union directory cannot be removed.
    assert_eq!(
        fs.rmdir("d", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOTEMPTY)
    );

    fs.unlink("d/child", &ctx()).unwrap();
    fs.rmdir("d", &ctx()).unwrap();
    assert_eq!(
        fs.get_attr("d", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );

    // Re-creating the directory removes its own marker and masks the surviving
    // lower-branch child.
    fs.mkdir("d", 0o755, &ctx()).unwrap();
    assert!(fs.get_attr("d", &ctx()).unwrap().is_dir());
    assert_eq!(list(&fs, "d"), Vec::<String>::new());
    assert_eq!(
        fs.get_attr("d/child", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
}

#[test]
fn test_symlink_promotion() {
    let (fs, branches) = setup();
    std::os::unix::fs::symlink("target", branches.ro.as_path().join("lnk")).unwrap();

    assert_eq!(fs.readlink("lnk", &ctx()).unwrap(), "target");

    // New symlinks land on the writable branch.
    fs.symlink("other", "lnk2", &ctx()).unwrap();
    assert_eq!(fs.readlink("lnk2", &ctx()).unwrap(), "other");
    assert!(branches.rw.as_path().join("lnk2").exists());
}

#[test]
fn test_drop_cache_backdoor() {
    let (fs, branches) = setup();
    fs::write(branches.ro.as_path().join("f"), b"1").unwrap();

    // Warm the branch cache.
    assert!(fs.get_attr("f", &ctx()).is_ok());

    // Mutate the branch behind the union's back: the cache hides it.
    fs::remove_file(branches.ro.as_path().join("f")).unwrap();
    assert!(fs.get_attr("f", &ctx()).is_ok());

    // .drop_cache looks like a writable file; opening it for write clears the caches.
    assert!(fs.get_attr(".drop_cache", &ctx()).unwrap().is_regular());
    let f = fs
        .open(".drop_cache", libc::O_WRONLY as u32, &ctx())
        .unwrap();
    f.release();

    assert_eq!(
        fs.get_attr("f", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
}

#[test]
fn test_sentinels_hidden() {
    let (fs, branches) = setup();
    std::os::unix::fs::symlink(branches.ro.as_path(), branches.rw.as_path().join("READONLY"))
        .unwrap();

    assert_eq!(
        fs.get_attr("READONLY", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
    assert_eq!(
        fs.get_attr("DELETIONS", &ctx()).unwrap_err().raw_os_error(),
        Some(libc::ENOENT)
    );
    assert_eq!(list(&fs, ""), Vec::<String>::new());
}

#[test]
fn test_chmod_promotes_and_keeps_write_bits() {
    let (fs, branches) = setup();
    fs::write(branches.ro.as_path().join("f"), b"x").unwrap();

    // A chmod that changes nothing beyond the implied write bits is a no-op.
    fs.chmod("f", 0o644, &ctx()).unwrap();
    assert!(!branches.rw.as_path().join("f").exists());

    fs.chmod("f", 0o500, &ctx()).unwrap();

    // The union view stays writable and the change promoted the file.
    let attr = fs.get_attr("f", &ctx()).unwrap();
    assert_ne!(attr.mode & 0o222, 0);
    assert!(branches.rw.as_path().join("f").exists());
}

#[test]
fn test_access_masks_out_write() {
    let (fs, branches) = setup();
    fs::write(branches.ro.as_path().join("f"), b"x").unwrap();
    let mut perms = fs::metadata(branches.ro.as_path().join("f"))
        .unwrap()
        .permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o444);
    fs::set_permissions(branches.ro.as_path().join("f"), perms).unwrap();

    // W_OK on a read-only lower file succeeds: a write would promote.
    fs.access("f", libc::W_OK as u32, &ctx()).unwrap();
}
