// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! A library to build userspace filesystem daemons based on the Linux Fuse ABI.
//!
//! Filesystem in Userspace ([FUSE]) is a software interface for Unix and Unix-like computer
//! operating systems that lets non-privileged users create their own file systems without
//! editing kernel code. This is achieved by running file system code in user space while
//! the FUSE module provides only a "bridge" to the actual kernel interfaces.
//!
//! The crate is divided into several subsystems:
//! * Transport Layer. Mounts the filesystem, receives Fuse requests from the kernel through
//!   `/dev/fuse` and sends back replies, recycling request buffers through a buffer pool.
//! * Fuse ABI. Linux Fuse wire structures and opcode metadata.
//! * Fuse API. Parses requests according to the Fuse ABI, invokes filesystem drivers to
//!   serve them and sends back the result. Also drives the self-scaling pool of reader
//!   threads that keeps the device busy without a fixed thread count.
//! * Path filesystem layer. A connector that maintains the kernel's inode tree (lookup
//!   counts, parent/child links, file handles, sub-mounts) and exposes a path-oriented
//!   filesystem API to user code.
//! * Union filesystem. A stateless union of one writable and N read-only path filesystems
//!   with a persistent deletion log and copy-up promotion, plus a supervisor that
//!   discovers and mounts unions automatically.
//!
//! [FUSE]: https://www.kernel.org/doc/html/latest/filesystems/fuse.html

extern crate bitflags;
extern crate libc;
#[macro_use]
extern crate log;
extern crate vm_memory;

use std::ffi::{CStr, FromBytesWithNulError};
use std::{error, fmt, io};

/// Error codes for Fuse related operations.
#[derive(Debug)]
pub enum Error {
    /// Failed to decode protocol messages.
    DecodeMessage(io::Error),
    /// Failed to encode protocol messages.
    EncodeMessage(io::Error),
    /// One or more parameters are missing.
    MissingParameter,
    /// A C string parameter is invalid.
    InvalidCString(FromBytesWithNulError),
    /// The `len` field of the header is too small.
    InvalidHeaderLength,
    /// The `size` field of the `SetxattrIn` message does not match the length
    /// of the decoded value.
    InvalidXattrSize((u32, usize)),
    /// An IO related error has happened.
    IoError(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            DecodeMessage(err) => write!(f, "failed to decode fuse message: {}", err),
            EncodeMessage(err) => write!(f, "failed to encode fuse message: {}", err),
            MissingParameter => write!(f, "one or more parameters are missing"),
            InvalidHeaderLength => write!(f, "the `len` field of the header is too small"),
            InvalidCString(err) => write!(f, "a c string parameter is invalid: {}", err),
            InvalidXattrSize((size, len)) => write!(
                f,
                "The `size` field of the `SetxattrIn` message does not match the length of the\
                 decoded value: size = {}, value.len() = {}",
                size, len
            ),
            IoError(err) => write!(f, "fail to handle request: {}", err),
        }
    }
}

/// Result for Fuse related operations.
pub type Result<T> = ::std::result::Result<T, Error>;

pub mod abi;
pub mod api;
pub mod pathfs;
pub mod transport;
pub mod unionfs;

/// Convert a slice of bytes ending with a trailing nul byte into a `CStr`.
pub fn bytes_to_cstr(buf: &[u8]) -> Result<&CStr> {
    CStr::from_bytes_with_nul(buf).map_err(Error::InvalidCString)
}

/// Map an `io::ErrorKind` to a raw OS error number for errors that carry none.
pub fn encode_io_error_kind(kind: io::ErrorKind) -> i32 {
    match kind {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        _ => libc::EIO,
    }
}

/// Safe wrapper for `sysconf(_SC_PAGESIZE)`.
#[inline(always)]
pub fn pagesize() -> usize {
    // Trivially safe
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_cstr() {
        assert_eq!(
            bytes_to_cstr(&[0x66u8, 0x6f, 0x6f, 0x0]).unwrap(),
            CStr::from_bytes_with_nul(b"foo\0").unwrap()
        );
        bytes_to_cstr(&[0x66u8, 0x6f, 0x6f]).unwrap_err();
    }

    #[test]
    fn test_encode_io_error_kind() {
        assert_eq!(encode_io_error_kind(io::ErrorKind::NotFound), libc::ENOENT);
        assert_eq!(encode_io_error_kind(io::ErrorKind::Other), libc::EIO);
    }
}
