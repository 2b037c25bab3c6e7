// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The fuse service loop: a self-scaling pool of reader threads.
//!
//! At most `MAX_READERS` threads sit blocked in `read(2)` on the fuse device at any
//! time. When a reader obtains a request it leaves the reader set, and if that leaves
//! the set empty it spawns one successor so that the device is never starved of a
//! reader. The thread then handles its request in place and tries to rejoin the
//! reader set, exiting when the set is already full. This yields per-request
//! parallelism without a fixed thread count.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use super::{Server, ServerOptions};
use crate::api::filesystem::FileSystem;
use crate::transport::{
    BufferPool, FuseBuf, FuseNotifier, FuseSession, MountOptions, Reader, Writer,
};
use crate::transport::Error::SessionFailure;
use crate::Error;

// What is a good number? Maybe the number of CPUs?
const MAX_READERS: usize = 2;

/// A fuse daemon tying a session, a server and a buffer pool together.
pub struct FuseDaemon<F: FileSystem + Sync + Send + 'static> {
    inner: Arc<DaemonInner<F>>,
}

struct DaemonInner<F: FileSystem + Sync + Send + 'static> {
    server: Server<F>,
    session: Mutex<FuseSession>,
    pool: Arc<BufferPool>,
    max_write: usize,
    // Readers currently blocked on the device.
    readers: Mutex<usize>,
    // Live loop threads, and the unmount drain barrier over them.
    loops: Mutex<usize>,
    loops_cv: Condvar,
    exiting: AtomicBool,
}

impl<F: FileSystem + Sync + Send + 'static> FuseDaemon<F> {
    /// Create a daemon serving `fs` on `mountpoint`. The filesystem is not mounted yet.
    pub fn new(
        fs: F,
        mountpoint: &Path,
        fsname: &str,
        opts: MountOptions,
    ) -> crate::transport::Result<Self> {
        let session = FuseSession::new(mountpoint, fsname, "", opts)?;
        let server_opts = ServerOptions::from(session.mount_options());
        let pool = Arc::new(BufferPool::new(server_opts.max_write));
        let max_write = server_opts.max_write as usize;

        Ok(FuseDaemon {
            inner: Arc::new(DaemonInner {
                server: Server::with_options(fs, server_opts),
                session: Mutex::new(session),
                pool,
                max_write,
                readers: Mutex::new(0),
                loops: Mutex::new(0),
                loops_cv: Condvar::new(),
                exiting: AtomicBool::new(false),
            }),
        })
    }

    /// Create a daemon around an existing session, sharing an external buffer pool.
    pub fn with_session(
        fs: F,
        session: FuseSession,
        pool: Arc<BufferPool>,
    ) -> crate::transport::Result<Self> {
        let server_opts = ServerOptions::from(session.mount_options());
        let max_write = server_opts.max_write as usize;
        Ok(FuseDaemon {
            inner: Arc::new(DaemonInner {
                server: Server::with_options(fs, server_opts),
                session: Mutex::new(session),
                pool,
                max_write,
                readers: Mutex::new(0),
                loops: Mutex::new(0),
                loops_cv: Condvar::new(),
                exiting: AtomicBool::new(false),
            }),
        })
    }

    /// The buffer pool shared by the service loop.
    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.inner.pool.clone()
    }

    /// A notifier to push cache invalidation messages to the kernel.
    ///
    /// Only valid after `mount()`.
    pub fn notifier(&self) -> crate::transport::Result<FuseNotifier> {
        self.inner.session.lock().unwrap().notifier()
    }

    /// Mount the filesystem and start the service loop.
    pub fn mount(&self) -> crate::transport::Result<()> {
        self.inner.session.lock().unwrap().mount()?;
        DaemonInner::spawn_reader(self.inner.clone())?;
        Ok(())
    }

    /// Block until all service loop threads have exited.
    pub fn wait(&self) {
        let mut loops = self.inner.loops.lock().unwrap();
        while *loops > 0 {
            loops = self.inner.loops_cv.wait(loops).unwrap();
        }
    }

    /// Unmount the filesystem and drain all active handlers.
    pub fn umount(&self) -> crate::transport::Result<()> {
        self.inner.exiting.store(true, Ordering::Relaxed);
        {
            let session = self.inner.session.lock().unwrap();
            session.wake()?;
        }
        let res = self.inner.session.lock().unwrap().umount();
        self.wait();
        res
    }
}

impl<F: FileSystem + Sync + Send + 'static> DaemonInner<F> {
    fn spawn_reader(inner: Arc<Self>) -> crate::transport::Result<()> {
        {
            let mut loops = inner.loops.lock().unwrap();
            *loops += 1;
        }
        let cloned = inner.clone();
        thread::Builder::new()
            .name("fuse-reader".to_string())
            .spawn(move || {
                Self::reader_loop(&cloned);
                let mut loops = cloned.loops.lock().unwrap();
                *loops -= 1;
                cloned.loops_cv.notify_all();
            })
            .map(|_| ())
            .map_err(|e| {
                // Roll back the loop count so wait() does not hang on a failed spawn.
                let mut loops = inner.loops.lock().unwrap();
                *loops -= 1;
                inner.loops_cv.notify_all();
                SessionFailure(format!("spawn reader: {}", e))
            })
    }

    fn reader_loop(inner: &Arc<Self>) {
        let mut channel = match inner.session.lock().unwrap().new_channel() {
            Ok(c) => c,
            Err(e) => {
                error!("failed to create fuse channel: {}", e);
                return;
            }
        };

        loop {
            // Join the reader set, or exit when it is already full.
            {
                let mut readers = inner.readers.lock().unwrap();
                if *readers >= MAX_READERS || inner.exiting.load(Ordering::Relaxed) {
                    return;
                }
                *readers += 1;
            }

            let mut buf = inner.pool.acquire_read();
            let res = channel.get_request(&mut buf);

            // Leaving the reader set; keep the device covered.
            let spawn_successor = {
                let mut readers = inner.readers.lock().unwrap();
                *readers -= 1;
                *readers == 0 && !inner.exiting.load(Ordering::Relaxed)
            };
            if spawn_successor {
                if let Err(e) = Self::spawn_reader(inner.clone()) {
                    error!("{}", e);
                }
            }

            match res {
                Ok(Some(len)) => {
                    let reader = Reader::new(FuseBuf::new(&buf[..len]));
                    let writer = Writer::new(channel.raw_fd(), inner.max_write + 0x1000);
                    match inner.server.handle_message(reader, writer) {
                        Ok(_) => {}
                        Err(Error::EncodeMessage(e)) => {
                            // A transport write failure usually means the filesystem
                            // was unmounted; stop the loop.
                            error!("failed to write reply to fuse device: {}", e);
                            inner.exiting.store(true, Ordering::Relaxed);
                            let _ = inner.session.lock().unwrap().wake();
                            inner.pool.release_read(buf);
                            return;
                        }
                        Err(e) => {
                            error!("failed to handle fuse request: {}", e);
                        }
                    }
                    inner.pool.release_read(buf);
                }
                Ok(None) => {
                    // Session is exiting.
                    inner.pool.release_read(buf);
                    inner.exiting.store(true, Ordering::Relaxed);
                    let _ = inner.session.lock().unwrap().wake();
                    return;
                }
                Err(e) => {
                    error!("failed to read from fuse device: {}", e);
                    inner.pool.release_read(buf);
                    inner.exiting.store(true, Ordering::Relaxed);
                    let _ = inner.session.lock().unwrap().wake();
                    return;
                }
            }
        }
    }
}

impl<F: FileSystem + Sync + Send + 'static> Drop for FuseDaemon<F> {
    fn drop(&mut self) {
        let _ = self.umount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::filesystem::FileSystem as _;

    struct NullFs;
    impl crate::api::filesystem::FileSystem for NullFs {}

    #[test]
    fn test_daemon_umount_without_mount() {
        let dir = vmm_sys_util::tempdir::TempDir::new().unwrap();
        let daemon = FuseDaemon::new(
            NullFs,
            dir.as_path(),
            "nullfs",
            MountOptions::default(),
        )
        .unwrap();
        // Never mounted: umount is a no-op and wait returns immediately.
        daemon.umount().unwrap();
        daemon.wait();
        let _ = daemon.buffer_pool();
    }

    #[test]
    fn test_nullfs_defaults() {
        let fs = NullFs;
        let ctx = crate::api::filesystem::Context::root();
        assert_eq!(
            fs.lookup(ctx, 1, std::ffi::CStr::from_bytes_with_nul(b"x\0").unwrap())
                .unwrap_err()
                .raw_os_error(),
            Some(libc::ENOSYS)
        );
    }
}
