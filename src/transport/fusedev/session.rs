// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! FUSE session management.
//!
//! A FUSE session is a connection from a FUSE mountpoint to a FUSE server daemon.
//! A FUSE session can have multiple FUSE channels so that FUSE requests are handled in
//! parallel.

use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::ops::Deref;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::{getgid, getuid, read};
use vm_memory::ByteValued;
use vmm_sys_util::eventfd::EventFd;

use super::writev;
use crate::abi::fuse_abi::{
    NotifyInvalEntryOut, NotifyInvalInodeOut, NotifyOpcode, OutHeader,
};
use crate::transport::Error::SessionFailure;
use crate::transport::Result;

/// The kernel caps writes at 128k.
pub const MAX_KERNEL_WRITE: u32 = 128 * 1024;

// Default kernel-visible background queue depth.
const DEFAULT_MAX_BACKGROUND: u16 = 12;

const FUSE_DEVICE: &str = "/dev/fuse";
const FUSE_FSTYPE: &str = "fuse";
const FUSERMOUNT_BIN: &str = "fusermount3";

// Number of unmount attempts, with exponential backoff between them.
const UMOUNT_RETRIES: u32 = 5;
const UMOUNT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Options for mounting a fuse session.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Allow users other than the mounting one to access the filesystem.
    pub allow_other: bool,
    /// Extra options passed to the mount invocation, comma-joined.
    pub options: Vec<String>,
    /// Kernel-visible background queue depth.
    pub max_background: u16,
    /// Largest single write, capped at [`MAX_KERNEL_WRITE`].
    pub max_write: u32,
    /// The mount helper binary used when mounting without privileges.
    pub fusermount: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            allow_other: true,
            options: Vec::new(),
            max_background: DEFAULT_MAX_BACKGROUND,
            max_write: MAX_KERNEL_WRITE,
            fusermount: FUSERMOUNT_BIN.to_string(),
        }
    }
}

impl MountOptions {
    /// Clamp option values to what the kernel accepts.
    pub fn normalize(&mut self) {
        if self.max_write == 0 {
            self.max_write = 1 << 16;
        }
        if self.max_write > MAX_KERNEL_WRITE {
            self.max_write = MAX_KERNEL_WRITE;
        }
    }
}

/// A fuse session manager to manage the connection with the in kernel fuse driver.
pub struct FuseSession {
    mountpoint: PathBuf,
    fsname: String,
    subtype: String,
    opts: MountOptions,
    file: Option<File>,
    // Socket kept alive for fusermount; dropping it triggers auto unmount.
    keep_alive: Option<UnixStream>,
    exit_evt: EventFd,
    bufsize: usize,
}

impl FuseSession {
    /// Create a new fuse session, without mounting/connecting to the in kernel fuse driver.
    pub fn new(
        mountpoint: &Path,
        fsname: &str,
        subtype: &str,
        opts: MountOptions,
    ) -> Result<FuseSession> {
        let dest = mountpoint
            .canonicalize()
            .map_err(|_| SessionFailure(format!("invalid mountpoint {:?}", mountpoint)))?;
        if !dest.is_dir() {
            return Err(SessionFailure(format!("{:?} is not a directory", dest)));
        }

        let mut opts = opts;
        opts.normalize();
        let bufsize = opts.max_write as usize + crate::pagesize();

        Ok(FuseSession {
            mountpoint: dest,
            fsname: fsname.to_owned(),
            subtype: subtype.to_owned(),
            opts,
            file: None,
            keep_alive: None,
            exit_evt: EventFd::new(0)
                .map_err(|e| SessionFailure(format!("create exit eventfd: {}", e)))?,
            bufsize,
        })
    }

    /// Mount the fuse mountpoint, building connection with the in kernel fuse driver.
    pub fn mount(&mut self) -> Result<()> {
        let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOATIME;
        let (file, socket) = fuse_kern_mount(
            &self.mountpoint,
            &self.fsname,
            &self.subtype,
            flags,
            &self.opts,
        )?;

        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|e| SessionFailure(format!("set fd nonblocking: {}", e)))?;
        self.file = Some(file);
        self.keep_alive = socket;

        Ok(())
    }

    /// Expose the associated FUSE session file.
    pub fn get_fuse_file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Force setting the associated FUSE session file.
    pub fn set_fuse_file(&mut self, file: File) {
        self.file = Some(file);
    }

    /// Get the mountpoint of the session.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Get the file system name of the session.
    pub fn fsname(&self) -> &str {
        &self.fsname
    }

    /// Get the mount options of the session.
    pub fn mount_options(&self) -> &MountOptions {
        &self.opts
    }

    /// Get the default buffer size of the session, large enough for any single request.
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Destroy the fuse session, retrying the unmount with exponential backoff.
    ///
    /// The kernel may still consider files open shortly after they were closed, so a
    /// failed unmount is retried up to five times before the final error is returned.
    pub fn umount(&mut self) -> Result<()> {
        if let Some(sock) = self.keep_alive.take() {
            // fusermount unmounts when its end of the socket pair is closed.
            drop(sock);
            self.file.take();
            return Ok(());
        }

        let file = match self.file.take() {
            Some(f) => f,
            None => return Ok(()),
        };
        let mountpoint = self
            .mountpoint
            .to_str()
            .ok_or_else(|| SessionFailure("invalid mountpoint".to_string()))?
            .to_string();

        let mut fds = [PollFd::new(file.as_raw_fd(), PollFlags::empty())];
        if poll(&mut fds, 0).is_ok() {
            // POLLERR means the file system is already umounted,
            // or the connection has been aborted via /sys/fs/fuse/connections/NNN/abort
            if let Some(event) = fds[0].revents() {
                if event == PollFlags::POLLERR {
                    return Ok(());
                }
            }
        }

        // Drop to close fuse session fd, otherwise synchronous umount can recurse into
        // the filesystem and cause deadlock.
        drop(file);

        let mut delay = Duration::from_millis(0);
        let mut last = Ok(());
        for attempt in 0..UMOUNT_RETRIES {
            if attempt > 0 {
                delay = delay * 2 + UMOUNT_BACKOFF_BASE;
                std::thread::sleep(delay);
            }
            match fuse_kern_umount(&mountpoint, &self.opts.fusermount) {
                Ok(()) => return Ok(()),
                Err(e) => last = Err(e),
            }
        }
        last
    }

    /// Create a new fuse message channel sharing the session's device fd.
    pub fn new_channel(&self) -> Result<FuseChannel> {
        if let Some(file) = &self.file {
            let file = file
                .try_clone()
                .map_err(|e| SessionFailure(format!("dup fd: {}", e)))?;
            let exit_evt = self
                .exit_evt
                .try_clone()
                .map_err(|e| SessionFailure(format!("dup exit eventfd: {}", e)))?;
            Ok(FuseChannel::new(file, exit_evt))
        } else {
            Err(SessionFailure("invalid fuse session".to_string()))
        }
    }

    /// Create a notifier pushing cache invalidation messages to the kernel.
    pub fn notifier(&self) -> Result<FuseNotifier> {
        if let Some(file) = &self.file {
            let file = file
                .try_clone()
                .map_err(|e| SessionFailure(format!("dup fd: {}", e)))?;
            Ok(FuseNotifier { file })
        } else {
            Err(SessionFailure("invalid fuse session".to_string()))
        }
    }

    /// Wake channel loops so they notice the session is exiting.
    ///
    /// The eventfd is deliberately never read so that a level triggered poll keeps
    /// reporting it to every channel.
    pub fn wake(&self) -> Result<()> {
        self.exit_evt
            .write(1)
            .map_err(|e| SessionFailure(format!("wake channel: {}", e)))
    }
}

impl Drop for FuseSession {
    fn drop(&mut self) {
        let _ = self.umount();
    }
}

/// A fuse channel abstraction. Each session can hold multiple channels.
pub struct FuseChannel {
    file: File,
    exit_evt: EventFd,
}

impl FuseChannel {
    fn new(file: File, exit_evt: EventFd) -> Self {
        FuseChannel { file, exit_evt }
    }

    /// Raw fd of the underlying fuse device file, for constructing reply writers.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Read the next available FUSE request from the underlying fuse device file into
    /// `buf`.
    ///
    /// Returns:
    /// - Ok(Some(len)): a request of `len` bytes was read into `buf`
    /// - Ok(None): the session is exiting, either by request or by unmount
    /// - Err(e): error message
    pub fn get_request(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let fd = self.file.as_raw_fd();
        loop {
            let mut fds = [
                PollFd::new(fd, PollFlags::POLLIN),
                PollFd::new(self.exit_evt.as_raw_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SessionFailure(format!("poll fuse device: {}", e))),
            }

            // Handle the exit event first so a pending wakeup beats pending requests.
            if let Some(revents) = fds[1].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    info!("will exit from fuse service");
                    return Ok(None);
                }
            }

            if let Some(revents) = fds[0].revents() {
                if revents.contains(PollFlags::POLLERR) {
                    info!("fuse channel closed");
                    return Ok(None);
                }
                if revents.contains(PollFlags::POLLIN) {
                    match read(fd, buf) {
                        Ok(len) => return Ok(Some(len)),
                        // ENOENT means the operation was interrupted, it's safe to restart
                        Err(Errno::ENOENT) => continue,
                        Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                        Err(Errno::ENODEV) => {
                            info!("fuse filesystem umounted");
                            return Ok(None);
                        }
                        Err(e) => {
                            warn! {"read fuse dev failed on fd {}: {}", fd, e};
                            return Err(SessionFailure(format!("read new request: {:?}", e)));
                        }
                    }
                }
            }
        }
    }
}

/// Pushes unsolicited cache invalidation messages to the kernel.
///
/// The kind of notification is encoded in the (positive) status field of the reply
/// header, with `unique` set to zero.
pub struct FuseNotifier {
    file: File,
}

impl FuseNotifier {
    /// Ask the kernel to invalidate cached data and attributes of an inode.
    pub fn inval_inode(&self, ino: u64, off: i64, len: i64) -> Result<()> {
        let payload = NotifyInvalInodeOut { ino, off, len };
        let header = OutHeader {
            len: (size_of::<OutHeader>() + size_of::<NotifyInvalInodeOut>()) as u32,
            error: NotifyOpcode::InvalInode as i32,
            unique: 0,
        };
        writev(
            self.file.as_raw_fd(),
            &[header.as_slice(), payload.as_slice()],
        )
        .map(|_| ())
        .map_err(|e| SessionFailure(format!("write inode notify: {}", e)))
    }

    /// Ask the kernel to invalidate a cached directory entry.
    pub fn inval_entry(&self, parent: u64, name: &str) -> Result<()> {
        // Many versions of FUSE generate stacktraces if the terminating null byte is
        // missing, so it is written even though namelen excludes it.
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        let payload = NotifyInvalEntryOut {
            parent,
            namelen: name.len() as u32,
            padding: 0,
        };
        let header = OutHeader {
            len: (size_of::<OutHeader>() + size_of::<NotifyInvalEntryOut>() + name_bytes.len())
                as u32,
            error: NotifyOpcode::InvalEntry as i32,
            unique: 0,
        };
        writev(
            self.file.as_raw_fd(),
            &[header.as_slice(), payload.as_slice(), &name_bytes],
        )
        .map(|_| ())
        .map_err(|e| SessionFailure(format!("write entry notify: {}", e)))
    }
}

/// Mount a fuse file system, falling back to the unprivileged mount helper on EPERM.
fn fuse_kern_mount(
    mountpoint: &Path,
    fsname: &str,
    subtype: &str,
    flags: MsFlags,
    mount_opts: &MountOptions,
) -> Result<(File, Option<UnixStream>)> {
    let file = OpenOptions::new()
        .create(false)
        .read(true)
        .write(true)
        .open(FUSE_DEVICE)
        .map_err(|e| SessionFailure(format!("open {}: {}", FUSE_DEVICE, e)))?;
    let meta = mountpoint
        .metadata()
        .map_err(|e| SessionFailure(format!("stat {:?}: {}", mountpoint, e)))?;
    let mut opts = format!(
        "default_permissions,fd={},rootmode={:o},user_id={},group_id={}",
        file.as_raw_fd(),
        meta.permissions().mode() & libc::S_IFMT,
        getuid(),
        getgid(),
    );
    if mount_opts.allow_other {
        opts.push_str(",allow_other");
    }
    for o in mount_opts.options.iter() {
        opts.push(',');
        opts.push_str(o);
    }
    let mut fstype = String::from(FUSE_FSTYPE);
    if !subtype.is_empty() {
        fstype.push('.');
        fstype.push_str(subtype);
    }

    if let Some(mountpoint) = mountpoint.to_str() {
        info!(
            "mount source {} dest {} with fstype {} opts {} fd {}",
            fsname,
            mountpoint,
            fstype,
            opts,
            file.as_raw_fd(),
        );
    }
    match mount(
        Some(fsname),
        mountpoint,
        Some(fstype.deref()),
        flags,
        Some(opts.deref()),
    ) {
        Ok(()) => Ok((file, None)),
        Err(Errno::EPERM) => fuse_fusermount_mount(mountpoint, fsname, subtype, flags, mount_opts),
        Err(e) => Err(SessionFailure(format!(
            "failed to mount {:?}: {}",
            mountpoint, e
        ))),
    }
}

fn msflags_to_string(flags: MsFlags) -> String {
    [
        (MsFlags::MS_RDONLY, ("rw", "ro")),
        (MsFlags::MS_NOSUID, ("suid", "nosuid")),
        (MsFlags::MS_NODEV, ("dev", "nodev")),
        (MsFlags::MS_NOATIME, ("atime", "noatime")),
    ]
    .iter()
    .map(|(flag, (neg, pos))| if flags.contains(*flag) { *pos } else { *neg })
    .collect::<Vec<&str>>()
    .join(",")
}

/// Mount a fuse file system with the fusermount helper.
///
/// The helper receives one end of a socket pair and sends back the connected
/// /dev/fuse fd over it.
fn fuse_fusermount_mount(
    mountpoint: &Path,
    fsname: &str,
    subtype: &str,
    flags: MsFlags,
    mount_opts: &MountOptions,
) -> Result<(File, Option<UnixStream>)> {
    let mut opts = vec![
        format!("fsname={}", fsname),
        "default_permissions".to_string(),
        msflags_to_string(flags),
    ];
    if !subtype.is_empty() {
        opts.push(format!("subtype={}", subtype));
    }
    if mount_opts.allow_other {
        opts.push("allow_other".to_string());
    }
    for o in mount_opts.options.iter() {
        opts.push(o.clone());
    }
    let opts = opts.join(",");

    let (send, recv) = UnixStream::pair()
        .map_err(|e| SessionFailure(format!("create socket pair: {}", e)))?;

    // Keep the sending socket around after exec to pass to fusermount.
    // Remove the close-on-exec flag from the socket, so we can pass it to fusermount.
    fcntl(send.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))
        .map_err(|e| SessionFailure(format!("remove close-on-exec flag: {}", e)))?;

    let mut proc = std::process::Command::new(&mount_opts.fusermount)
        .env("_FUSE_COMMFD", format!("{}", send.as_raw_fd()))
        .arg("-o")
        .arg(opts)
        .arg("--")
        .arg(mountpoint)
        .spawn()
        .map_err(|e| SessionFailure(format!("spawn {}: {}", mount_opts.fusermount, e)))?;

    match proc
        .wait()
        .map_err(|e| SessionFailure(format!("wait for fusermount: {}", e)))?
        .code()
    {
        Some(0) => {}
        exit_code => {
            return Err(SessionFailure(format!(
                "unexpected exit code when running fusermount: {:?}",
                exit_code
            )))
        }
    }
    drop(send);

    match vmm_sys_util::sock_ctrl_msg::ScmSocket::recv_with_fd(&recv, &mut [0u8; 8]).map_err(
        |e| {
            SessionFailure(format!(
                "unexpected error when receiving fuse file descriptor from fusermount: {}",
                e
            ))
        },
    )? {
        (_recv_bytes, Some(file)) => Ok((file, Some(recv))),
        (recv_bytes, None) => Err(SessionFailure(format!(
            "fusermount did not send a file descriptor, received {} bytes",
            recv_bytes
        ))),
    }
}

/// Umount a fuse file system, falling back to the mount helper on EPERM.
fn fuse_kern_umount(mountpoint: &str, fusermount: &str) -> Result<()> {
    match umount2(mountpoint, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(Errno::EPERM) => fuse_fusermount_umount(mountpoint, fusermount),
        Err(e) => Err(SessionFailure(format!(
            "failed to umount {}: {}",
            mountpoint, e
        ))),
    }
}

/// Umount a fuse file system by the fusermount helper.
fn fuse_fusermount_umount(mountpoint: &str, fusermount: &str) -> Result<()> {
    match std::process::Command::new(fusermount)
        .arg("--unmount")
        .arg("--quiet")
        .arg("--lazy")
        .arg("--")
        .arg(mountpoint)
        .status()
        .map_err(|e| SessionFailure(format!("run {}: {}", fusermount, e)))?
        .code()
    {
        Some(0) => Ok(()),
        exit_code => Err(SessionFailure(format!(
            "unexpected exit code when unmounting via fusermount: {:?}",
            exit_code
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::io::FromRawFd;
    use vmm_sys_util::tempdir::TempDir;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn test_new_session() {
        let se = FuseSession::new(Path::new("haha"), "foo", "bar", MountOptions::default());
        assert!(se.is_err());

        let dir = TempDir::new().unwrap();
        let se = FuseSession::new(dir.as_path(), "foo", "bar", MountOptions::default());
        assert!(se.is_ok());
    }

    #[test]
    fn test_mount_options_normalize() {
        let mut opts = MountOptions::default();
        opts.max_write = 0;
        opts.normalize();
        assert_eq!(opts.max_write, 1 << 16);

        opts.max_write = MAX_KERNEL_WRITE * 4;
        opts.normalize();
        assert_eq!(opts.max_write, MAX_KERNEL_WRITE);
        assert_eq!(opts.max_background, 12);
    }

    #[test]
    fn test_wake_exits_channel() {
        let dir = TempDir::new().unwrap();
        let mut se =
            FuseSession::new(dir.as_path(), "foo", "bar", MountOptions::default()).unwrap();
        // Stand in for /dev/fuse with an unreadable fd so only the event fires.
        let (_s, r) = UnixStream::pair().unwrap();
        se.set_fuse_file(unsafe { File::from_raw_fd(nix::unistd::dup(r.as_raw_fd()).unwrap()) });

        let mut channel = se.new_channel().unwrap();
        se.wake().unwrap();
        let mut buf = vec![0u8; 256];
        assert!(channel.get_request(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_entry_notify_layout() {
        let file = TempFile::new().unwrap().into_file();
        let notifier = FuseNotifier {
            file: file.try_clone().unwrap(),
        };
        notifier.inval_entry(42, "file.txt").unwrap();

        let mut file = file;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0)).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();

        let header = OutHeader::from_slice(&content[..size_of::<OutHeader>()]).unwrap();
        assert_eq!(header.unique, 0);
        assert_eq!(header.error, NotifyOpcode::InvalEntry as i32);
        assert_eq!(header.len as usize, content.len());
        // Name is written with a trailing null byte.
        assert_eq!(content.last(), Some(&0u8));
        let name_off = size_of::<OutHeader>() + size_of::<NotifyInvalEntryOut>();
        assert_eq!(&content[name_off..content.len() - 1], b"file.txt");
    }
}
