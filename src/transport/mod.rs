// Copyright (C) 2023 Ant Group. All rights reserved.
//
// Copyright 2019 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Fuse transport drivers to receive requests from/send replies to the Fuse client.

use std::fmt;
use std::io::{self, Read};
use std::mem::{size_of, MaybeUninit};

use vm_memory::ByteValued;

mod buffer_pool;
pub use buffer_pool::BufferPool;

pub mod fusedev;
pub use fusedev::{
    FuseBuf, FuseChannel, FuseNotifier, FuseSession, MountOptions, Writer, MAX_KERNEL_WRITE,
};

/// Error codes for transport related operations.
#[derive(Debug)]
pub enum Error {
    /// Generic IO error.
    IoError(io::Error),
    /// Out of bounds when splitting a writer.
    SplitOutOfBounds(usize),
    /// Session errors
    SessionFailure(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            IoError(e) => write!(f, "device I/O error: {}", e),
            SplitOutOfBounds(off) => write!(f, "writer split is out of bounds: {}", off),
            SessionFailure(e) => write!(f, "fuse session failure: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Result for transport related operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Provides a high-level interface over the request bytes read from the fuse device.
///
/// One request is read from the device in a single `read(2)`, so a `Reader` simply
/// walks a borrowed byte buffer.
#[derive(Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader over a request buffer.
    pub fn new(buf: FuseBuf<'a>) -> Reader<'a> {
        Reader {
            buf: buf.mem,
            pos: 0,
        }
    }

    /// Reads a POD object from the request buffer.
    pub fn read_obj<T: ByteValued>(&mut self) -> io::Result<T> {
        let mut obj = MaybeUninit::<T>::uninit();

        // Safe because `MaybeUninit` guarantees that the pointer is valid for
        // `size_of::<T>()` bytes.
        let buf = unsafe {
            ::std::slice::from_raw_parts_mut(obj.as_mut_ptr() as *mut u8, size_of::<T>())
        };

        self.read_exact(buf)?;

        // Safe because any type that implements `ByteValued` can be considered initialized
        // even if it is filled with random data.
        Ok(unsafe { obj.assume_init() })
    }

    /// Returns number of bytes available for reading.
    pub fn available_bytes(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns number of bytes already read from the request buffer.
    pub fn bytes_read(&self) -> usize {
        self.pos
    }
}

impl<'a> io::Read for Reader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rem = &self.buf[self.pos..];
        let count = std::cmp::min(rem.len(), buf.len());
        buf[..count].copy_from_slice(&rem[..count]);
        self.pos += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_simple() {
        let buf = [0u8; 106];
        let mut reader = Reader::new(FuseBuf::new(&buf));

        assert_eq!(reader.available_bytes(), 106);
        assert_eq!(reader.bytes_read(), 0);

        let mut buffer = [0u8; 64];
        reader.read_exact(&mut buffer).unwrap();

        assert_eq!(reader.available_bytes(), 42);
        assert_eq!(reader.bytes_read(), 64);

        assert_eq!(reader.read(&mut buffer).unwrap(), 42);
        assert_eq!(reader.available_bytes(), 0);
        assert_eq!(reader.bytes_read(), 106);
    }

    #[test]
    fn reader_unexpected_eof() {
        let buf = [0u8; 106];
        let mut reader = Reader::new(FuseBuf::new(&buf));

        let mut buf2 = vec![0u8; 1024];
        assert_eq!(
            reader
                .read_exact(&mut buf2[..])
                .expect_err("read more bytes than available")
                .kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn read_obj() {
        let buf = [0u8; 9];
        let mut reader = Reader::new(FuseBuf::new(&buf));

        let _val: u64 = reader.read_obj().expect("failed to read object");

        assert_eq!(reader.available_bytes(), 1);
        assert_eq!(reader.bytes_read(), 8);
        assert!(reader.read_obj::<u64>().is_err());
    }
}
