// Copyright (C) 2023 Ant Group. All rights reserved.
// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! Fuse API Server to interconnect transport layers with filesystem drivers.
//!
//! The Fuse API server is an adapter layer between the transport and file system
//! drivers. Its main functionalities are:
//! * Parse transport messages according to the Fuse ABI to avoid duplicated message
//!   decoding in every file system driver.
//! * Invoke the file system driver handler to serve each request and send the reply.
//! * Drive a self-scaling pool of reader threads so that the device never starves of
//!   a reader while requests are handled concurrently.
//!
//! The server is performance critical and supports multi-threading by adopting
//! interior-mutability, using the arc-swap crate for the negotiated protocol version.

use std::ffi::CStr;
use std::io::Read;
use std::mem::size_of;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::abi::fuse_abi::*;
use crate::api::filesystem::FileSystem;
use crate::transport::{MountOptions, Reader, MAX_KERNEL_WRITE};
use crate::{bytes_to_cstr, Error, Result};

mod daemon;
mod sync_io;
pub use daemon::FuseDaemon;

/// Requests longer than this are rejected outright.
pub const MAX_BUFFER_SIZE: u32 = MAX_KERNEL_WRITE + 0x1000;

pub(crate) const DIRENT_PADDING: [u8; 8] = [0; 8];

/// Fuse Server to handle requests from the Fuse client.
pub struct Server<F: FileSystem + Sync> {
    fs: F,
    vers: ArcSwap<ServerVersion>,
    opts: ServerOptions,
}

/// Tunables negotiated with the kernel at INIT time.
#[derive(Debug, Copy, Clone)]
pub struct ServerOptions {
    /// Kernel-visible background queue depth.
    pub max_background: u16,
    /// Largest single write accepted by the server.
    pub max_write: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            max_background: 12,
            max_write: MAX_KERNEL_WRITE,
        }
    }
}

impl From<&MountOptions> for ServerOptions {
    fn from(m: &MountOptions) -> Self {
        ServerOptions {
            max_background: m.max_background,
            max_write: m.max_write,
        }
    }
}

impl<F: FileSystem + Sync> Server<F> {
    /// Create a Server instance from a filesystem driver object.
    pub fn new(fs: F) -> Server<F> {
        Server::with_options(fs, ServerOptions::default())
    }

    /// Create a Server instance with explicit options.
    pub fn with_options(fs: F, opts: ServerOptions) -> Server<F> {
        Server {
            fs,
            vers: ArcSwap::new(Arc::new(ServerVersion {
                major: KERNEL_VERSION,
                minor: KERNEL_MINOR_VERSION,
            })),
            opts,
        }
    }

    /// Borrow the wrapped filesystem driver.
    pub fn filesystem(&self) -> &F {
        &self.fs
    }
}

struct ServerVersion {
    #[allow(dead_code)]
    major: u32,
    minor: u32,
}

struct ServerUtil();

impl ServerUtil {
    fn get_message_body(
        r: &mut Reader,
        in_header: &InHeader,
        sub_hdr_sz: usize,
    ) -> Result<Vec<u8>> {
        let len = (in_header.len as usize)
            .checked_sub(size_of::<InHeader>())
            .and_then(|l| l.checked_sub(sub_hdr_sz))
            .ok_or(Error::InvalidHeaderLength)?;

        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).map_err(Error::DecodeMessage)?;

        Ok(buf)
    }

    fn extract_two_cstrs(buf: &[u8]) -> Result<(&CStr, &CStr)> {
        if let Some(mut pos) = buf.iter().position(|x| *x == 0) {
            let first = CStr::from_bytes_with_nul(&buf[0..=pos]).map_err(Error::InvalidCString)?;
            pos += 1;
            if pos < buf.len() {
                return Ok((first, bytes_to_cstr(&buf[pos..])?));
            }
        }

        Err(Error::DecodeMessage(std::io::Error::from_raw_os_error(
            libc::EINVAL,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_cstrs() {
        assert_eq!(
            ServerUtil::extract_two_cstrs(&[0x1u8, 0x2u8, 0x0, 0x3, 0x0]).unwrap(),
            (
                CStr::from_bytes_with_nul(&[0x1u8, 0x2u8, 0x0]).unwrap(),
                CStr::from_bytes_with_nul(&[0x3u8, 0x0]).unwrap(),
            )
        );
        assert_eq!(
            ServerUtil::extract_two_cstrs(&[0x1u8, 0x2u8, 0x0, 0x3, 0x0, 0x4]).unwrap(),
            (
                CStr::from_bytes_with_nul(&[0x1u8, 0x2u8, 0x0]).unwrap(),
                CStr::from_bytes_with_nul(&[0x3u8, 0x0]).unwrap(),
            )
        );
        assert_eq!(
            ServerUtil::extract_two_cstrs(&[0x1u8, 0x2u8, 0x0, 0x0, 0x4]).unwrap(),
            (
                CStr::from_bytes_with_nul(&[0x1u8, 0x2u8, 0x0]).unwrap(),
                CStr::from_bytes_with_nul(&[0x0]).unwrap(),
            )
        );

        ServerUtil::extract_two_cstrs(&[0x1u8, 0x2u8, 0x0, 0x3]).unwrap_err();
        ServerUtil::extract_two_cstrs(&[0x1u8, 0x2u8, 0x0]).unwrap_err();
        ServerUtil::extract_two_cstrs(&[0x1u8, 0x2u8]).unwrap_err();
    }
}
