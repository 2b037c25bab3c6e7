// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! A supervisor creating unions for directories under a given root.
//!
//! The tree is walked looking for directories `D` containing a symlink named
//! `READONLY` pointing to another directory; each such pair forms a union with
//! writable branch `D` and read-only branch the target of the symlink. A union for
//! `A/B/C` is mounted under `A-B-C`. Two virtual directories expose control and
//! status entries:
//!
//! * `config/<name>` is a symlink to each union's writable root; creating a new
//!   symlink here adds a union at runtime.
//! * `status/` carries a version file and a symlink to the scan root.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::abi::fuse_abi::Attr;
use crate::api::filesystem::Context;
use crate::pathfs::{
    DirEntry, DirStream, FileSystemOptions, PathFile, PathFilesystem, PathFileSystemConnector,
    StaticFile,
};
use crate::unionfs::{UnionFs, UnionFsOptions, READONLY_NAME};

const STATUS: &str = "status";
const CONFIG: &str = "config";
const ROOT_LINK: &str = "root";
const VERSION_FILE: &str = "gounionfs_version";

fn err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn dir_attr() -> Attr {
    let mut attr = Attr::default();
    attr.mode = libc::S_IFDIR | 0o755;
    attr
}

fn link_attr() -> Attr {
    let mut attr = Attr::default();
    attr.mode = libc::S_IFLNK | 0o644;
    attr
}

/// Options of the auto-union supervisor.
#[derive(Debug, Clone, Default)]
pub struct AutoUnionFsOptions {
    /// Options handed to every created union.
    pub union: UnionFsOptions,
    /// Mount options of the per-union sub-filesystems.
    pub fs: FileSystemOptions,
}

/// Discovers and mounts unions below a scan root.
pub struct AutoUnionFs {
    root: PathBuf,
    options: AutoUnionFsOptions,
    known: RwLock<HashMap<String, Arc<UnionFs>>>,
    connector: Mutex<Option<Arc<PathFileSystemConnector>>>,
}

impl AutoUnionFs {
    /// Supervise unions below `root`.
    pub fn new<P: Into<PathBuf>>(root: P, options: AutoUnionFsOptions) -> AutoUnionFs {
        AutoUnionFs {
            root: root.into(),
            options,
            known: RwLock::new(HashMap::new()),
            connector: Mutex::new(None),
        }
    }

    // The (writable, readonly) branch roots of `path`, when it hosts a union.
    fn get_roots(path: &Path) -> Option<Vec<PathBuf>> {
        let ro = path.join(READONLY_NAME);
        let meta = fs::symlink_metadata(&ro).ok()?;
        let target = fs::metadata(&ro).ok()?;
        if meta.file_type().is_symlink() && target.is_dir() {
            Some(vec![path.to_path_buf(), ro])
        } else {
            None
        }
    }

    fn add_fs(&self, name: &str, roots: Vec<PathBuf>) -> bool {
        if name == CONFIG || name == STATUS {
            warn!("illegal name for overlay: {:?}", roots);
            return false;
        }

        let new_fs = {
            let mut known = self.known.write().unwrap();
            if known.contains_key(name) {
                None
            } else {
                info!("adding union for roots {:?}", roots);
                match UnionFs::from_roots(&roots, self.options.union.clone()) {
                    Ok(fs) => {
                        let fs = Arc::new(fs);
                        known.insert(name.to_string(), fs.clone());
                        Some(fs)
                    }
                    Err(e) => {
                        warn!("cannot create union for {:?}: {}", roots, e);
                        return false;
                    }
                }
            }
        };

        if let Some(fs) = new_fs {
            let connector = self.connector.lock().unwrap().clone();
            if let Some(connector) = connector {
                if let Err(e) = connector.mount(name, fs, self.options.fs.clone()) {
                    warn!("cannot mount union {}: {}", name, e);
                }
            }
        }
        true
    }

    fn add_automatic_fs(&self, roots: Vec<PathBuf>) {
        let relative = roots[0]
            .strip_prefix(&self.root)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = relative.trim_matches('/').replace('/', "-");
        if !name.is_empty() {
            self.add_fs(&name, roots);
        }
    }

    fn visit_dir(&self, path: &Path) {
        if let Some(roots) = Self::get_roots(path) {
            self.add_automatic_fs(roots);
        }
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let p = entry.path();
            let is_dir = fs::symlink_metadata(&p)
                .map(|m| m.file_type().is_dir())
                .unwrap_or(false);
            if is_dir {
                self.visit_dir(&p);
            }
        }
    }

    /// Rescan the root for new unions.
    pub fn update_known_fses(&self) {
        debug!("looking for new filesystems under {:?}", self.root);
        let root = self.root.clone();
        self.visit_dir(&root);
    }

    fn get_union_fs(&self, name: &str) -> Option<Arc<UnionFs>> {
        self.known.read().unwrap().get(name).cloned()
    }
}

impl PathFilesystem for AutoUnionFs {
    fn name(&self) -> String {
        format!("autounionfs({})", self.root.display())
    }

    fn on_mount(&self, connector: &Arc<PathFileSystemConnector>) {
        *self.connector.lock().unwrap() = Some(connector.clone());
        self.update_known_fses();
    }

    fn get_attr(&self, path: &str, _ctx: &Context) -> io::Result<Attr> {
        if path.is_empty() || path == CONFIG || path == STATUS {
            return Ok(dir_attr());
        }

        if path == format!("{}/{}", STATUS, VERSION_FILE) {
            let mut attr = Attr::default();
            attr.mode = libc::S_IFREG | 0o644;
            attr.size = env!("CARGO_PKG_VERSION").len() as u64;
            return Ok(attr);
        }
        if path == format!("{}/{}", STATUS, ROOT_LINK) {
            return Ok(link_attr());
        }

        let comps: Vec<&str> = path.split('/').collect();
        if comps.len() > 1 && comps[0] == CONFIG {
            return match self.get_union_fs(comps[1]) {
                Some(_) => Ok(link_attr()),
                None => Err(err(libc::ENOENT)),
            };
        }

        if self.get_union_fs(path).is_some() {
            return Ok(dir_attr());
        }

        Err(err(libc::ENOENT))
    }

    fn readlink(&self, path: &str, _ctx: &Context) -> io::Result<String> {
        let comps: Vec<&str> = path.split('/').collect();
        if comps.len() == 2 && comps[0] == STATUS && comps[1] == ROOT_LINK {
            return Ok(self.root.to_string_lossy().into_owned());
        }
        if comps.len() != 2 || comps[0] != CONFIG {
            return Err(err(libc::ENOENT));
        }
        match self.get_union_fs(comps[1]) {
            Some(fs) => fs
                .writable_root()
                .map(str::to_string)
                .ok_or_else(|| err(libc::ENOENT)),
            None => Err(err(libc::ENOENT)),
        }
    }

    fn symlink(&self, target: &str, path: &str, _ctx: &Context) -> io::Result<()> {
        let comps: Vec<&str> = path.split('/').collect();
        if comps.len() != 2 {
            return Err(err(libc::EPERM));
        }

        if comps[0] == CONFIG {
            let roots = match Self::get_roots(Path::new(target)) {
                Some(roots) => roots,
                None => return Err(err(libc::ENOTDIR)),
            };
            if !self.add_fs(comps[1], roots) {
                return Err(err(libc::EPERM));
            }
            return Ok(());
        }
        Err(err(libc::EPERM))
    }

    fn open(&self, path: &str, _flags: u32, _ctx: &Context) -> io::Result<Arc<dyn PathFile>> {
        if path == format!("{}/{}", STATUS, VERSION_FILE) {
            return Ok(Arc::new(StaticFile::new(
                env!("CARGO_PKG_VERSION").as_bytes().to_vec(),
            )));
        }
        Err(err(libc::ENOENT))
    }

    fn open_dir(&self, path: &str, _ctx: &Context) -> io::Result<DirStream> {
        match path {
            STATUS => {
                let entries = vec![
                    DirEntry {
                        name: VERSION_FILE.to_string(),
                        mode: libc::S_IFREG | 0o644,
                    },
                    DirEntry {
                        name: ROOT_LINK.to_string(),
                        mode: libc::S_IFLNK | 0o644,
                    },
                ];
                return Ok(Box::new(entries.into_iter()));
            }
            CONFIG => self.update_known_fses(),
            "" => {}
            _ => return Err(err(libc::ENOENT)),
        }

        let known = self.known.read().unwrap();
        let mut entries: Vec<DirEntry> = known
            .keys()
            .map(|name| DirEntry {
                name: name.clone(),
                mode: if path == CONFIG {
                    libc::S_IFLNK | 0o644
                } else {
                    libc::S_IFDIR | 0o755
                },
            })
            .collect();

        if path.is_empty() {
            entries.push(DirEntry {
                name: CONFIG.to_string(),
                mode: libc::S_IFDIR | 0o755,
            });
            entries.push(DirEntry {
                name: STATUS.to_string(),
                mode: libc::S_IFDIR | 0o755,
            });
        }
        Ok(Box::new(entries.into_iter()))
    }

    // An ENOSYS here would suspend all GetXAttr calls on the mount.
    fn get_xattr(&self, _path: &str, _name: &str, _ctx: &Context) -> io::Result<Vec<u8>> {
        Err(err(libc::ENODATA))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use vmm_sys_util::tempdir::TempDir;

    fn ctx() -> Context {
        Context::root()
    }

    fn setup_union_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        let base = dir.as_path();
        fs::create_dir_all(base.join("proj/rw")).unwrap();
        fs::create_dir_all(base.join("ro-data")).unwrap();
        fs::write(base.join("ro-data/seed.txt"), b"seed").unwrap();
        symlink(base.join("ro-data"), base.join("proj/rw/READONLY")).unwrap();
        dir
    }

    #[test]
    fn test_scan_discovers_union() {
        let dir = setup_union_root();
        let auto = AutoUnionFs::new(dir.as_path(), AutoUnionFsOptions::default());
        auto.update_known_fses();

        assert!(auto.get_union_fs("proj-rw").is_some());
        assert!(auto.get_attr("proj-rw", &ctx()).unwrap().is_dir());
        assert!(auto.get_attr("config/proj-rw", &ctx()).unwrap().is_symlink());

        let target = auto.readlink("config/proj-rw", &ctx()).unwrap();
        assert!(target.ends_with("proj/rw"));
    }

    #[test]
    fn test_status_entries() {
        let dir = TempDir::new().unwrap();
        let auto = AutoUnionFs::new(dir.as_path(), AutoUnionFsOptions::default());

        let mut names: Vec<String> = auto
            .open_dir("status", &ctx())
            .unwrap()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["gounionfs_version", "root"]);

        assert_eq!(
            auto.readlink("status/root", &ctx()).unwrap(),
            dir.as_path().to_string_lossy().into_owned()
        );

        let f = auto.open("status/gounionfs_version", 0, &ctx()).unwrap();
        let mut buf = [0u8; 32];
        let n = f.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], env!("CARGO_PKG_VERSION").as_bytes());
    }

    #[test]
    fn test_config_symlink_registers_union() {
        let dir = setup_union_root();
        let auto = AutoUnionFs::new(dir.as_path(), AutoUnionFsOptions::default());

        let writable = dir.as_path().join("proj/rw");
        auto.symlink(writable.to_str().unwrap(), "config/byhand", &ctx())
            .unwrap();
        assert!(auto.get_union_fs("byhand").is_some());

        // Non-union targets are rejected.
        let plain = dir.as_path().join("ro-data");
        assert_eq!(
            auto.symlink(plain.to_str().unwrap(), "config/bad", &ctx())
                .unwrap_err()
                .raw_os_error(),
            Some(libc::ENOTDIR)
        );
        // Only the config directory accepts symlinks.
        assert_eq!(
            auto.symlink(writable.to_str().unwrap(), "status/x", &ctx())
                .unwrap_err()
                .raw_os_error(),
            Some(libc::EPERM)
        );

        let root_list: Vec<String> = auto
            .open_dir("", &ctx())
            .unwrap()
            .map(|e| e.name)
            .collect();
        assert!(root_list.contains(&"config".to_string()));
        assert!(root_list.contains(&"status".to_string()));
        assert!(root_list.contains(&"byhand".to_string()));
    }
}
