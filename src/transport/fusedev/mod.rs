// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Structs to implement the /dev/fuse transport layer.

use std::io::{self, IoSlice, Write};
use std::marker::PhantomData;
use std::os::unix::io::RawFd;

use vm_memory::ByteValued;

use super::{Error, Reader, Result};

mod session;
pub use session::{FuseChannel, FuseNotifier, FuseSession, MountOptions, MAX_KERNEL_WRITE};

/// A buffer reference wrapper for fuse requests.
#[derive(Debug)]
pub struct FuseBuf<'a> {
    pub(crate) mem: &'a [u8],
}

impl<'a> FuseBuf<'a> {
    /// Construct a new fuse request buffer wrapper.
    pub fn new(mem: &'a [u8]) -> FuseBuf<'a> {
        FuseBuf { mem }
    }
}

impl<'a> Reader<'a> {
    /// Construct a Reader directly over raw request bytes.
    pub fn from_bytes(mem: &'a [u8]) -> Reader<'a> {
        Reader::new(FuseBuf::new(mem))
    }
}

/// Write a group of buffers to a fd in one vectored write, skipping empty buffers.
fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = bufs
        .iter()
        .filter(|b| !b.is_empty())
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    if iov.is_empty() {
        return Ok(0);
    }

    // Safe because the iovec array points into live slices for the duration of the call.
    let ret = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// A writer for fuse replies. There are a few special properties to follow:
/// 1. A fuse device reply MUST be written to the fuse device in one shot.
/// 2. If the writer is split, a final commit() MUST be called to issue the
///    device write operation.
/// 3. Concurrency, caller should not write to the writer concurrently.
#[derive(Debug, PartialEq, Eq)]
pub struct Writer<'a> {
    fd: RawFd,
    max_size: usize,
    bytes_written: usize,
    // buf used to support split writer.
    // For split writers, we write to the internal buffer upon write and
    // issue a final vectored device write upon commit.
    buf: Option<Vec<u8>>,
    // Keeps the lifetime tied to the request buffer of the owning iteration.
    phantom: PhantomData<&'a u8>,
}

impl<'a> Writer<'a> {
    /// Construct a new Writer.
    pub fn new(fd: RawFd, max_size: usize) -> Writer<'a> {
        Writer {
            fd,
            max_size,
            bytes_written: 0,
            buf: None,
            phantom: PhantomData,
        }
    }

    /// Splits this `Writer` into two at the given offset.
    ///
    /// After the split, `self` will be able to write up to `offset` bytes while the returned
    /// `Writer` can write up to `available_bytes() - offset` bytes. Returns an error if
    /// `offset > self.available_bytes()`.
    pub fn split_at(&mut self, offset: usize) -> Result<Writer<'a>> {
        if self.max_size < offset {
            return Err(Error::SplitOutOfBounds(offset));
        }
        // Writes of both halves go to internal buffers from now on.
        if self.buf.is_none() {
            self.buf = Some(Vec::with_capacity(offset));
        }
        let max_size = self.max_size - offset;
        self.max_size = offset;
        Ok(Writer {
            fd: self.fd,
            max_size,
            bytes_written: 0,
            buf: Some(Vec::with_capacity(max_size)),
            phantom: PhantomData,
        })
    }

    /// Commit all internal buffers of self and others with a single vectored write.
    ///
    /// We need this because the lifetime of `other` is usually shorter than self.
    pub fn commit(&mut self, other: Option<&Writer<'a>>) -> io::Result<usize> {
        if self.buf.is_none() {
            return Ok(0);
        }

        let mut bufs: Vec<&[u8]> = Vec::with_capacity(2);
        if let Some(data) = &self.buf {
            bufs.push(data);
        }
        if let Some(other) = other {
            if let Some(data) = &other.buf {
                bufs.push(data);
            }
        }

        if bufs.is_empty() {
            return Ok(0);
        }
        writev(self.fd, &bufs).map_err(|e| {
            error! {"fail to write to fuse device on commit: {}", e};
            e
        })
    }

    /// Returns number of bytes already written to the internal buffer.
    pub fn bytes_written(&self) -> usize {
        if let Some(data) = &self.buf {
            return data.len();
        }
        self.bytes_written
    }

    /// Returns number of bytes available for writing.
    pub fn available_bytes(&self) -> usize {
        self.max_size - self.bytes_written()
    }

    fn account_written(&mut self, count: usize) {
        self.bytes_written += count;
    }

    /// Writes an object to the writer.
    pub fn write_obj<T: ByteValued>(&mut self, val: T) -> io::Result<()> {
        self.write_all(val.as_slice())
    }

    fn check_available_space(&self, sz: usize) -> io::Result<()> {
        if sz > self.available_bytes() {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "data out of range, available {} requested {}",
                    self.available_bytes(),
                    sz
                ),
            ))
        } else {
            Ok(())
        }
    }
}

impl<'a> io::Write for Writer<'a> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check_available_space(data.len())?;
        if let Some(buf) = &mut self.buf {
            // write to internal buf
            let len = data.len();
            buf.extend_from_slice(data);
            self.account_written(len);
            Ok(len)
        } else {
            // write to fd, can only happen once per instance
            if self.fd < 0 {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            // Safe because data lives for the duration of the call.
            let ret = unsafe {
                libc::write(self.fd, data.as_ptr() as *const libc::c_void, data.len())
            };
            if ret < 0 {
                let e = io::Error::last_os_error();
                error! {"fail to write to fuse device fd {}: {}", self.fd, e};
                Err(e)
            } else {
                self.account_written(ret as usize);
                Ok(ret as usize)
            }
        }
    }

    // default write_vectored only writes the first non-empty IoSlice. Override it.
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.check_available_space(bufs.iter().fold(0, |acc, x| acc + x.len()))?;

        if let Some(data) = &mut self.buf {
            let count = bufs.iter().filter(|b| !b.is_empty()).fold(0, |acc, b| {
                data.extend_from_slice(b);
                acc + b.len()
            });
            Ok(count)
        } else {
            let slices: Vec<&[u8]> = bufs.iter().map(|b| &b[..]).collect();
            writev(self.fd, &slices)
                .map(|x| {
                    self.account_written(x);
                    x
                })
                .map_err(|e| {
                    error! {"fail to write to fuse device fd {}: {}", self.fd, e};
                    e
                })
        }
    }

    /// As this writer can associate multiple writers by splitting, `flush()` can't
    /// flush them all. Disable it!
    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "Writer does not support flush buffer.",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::unix::io::AsRawFd;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn writer_test_simple_chain() {
        let file = TempFile::new().unwrap().into_file();
        let mut writer = Writer::new(file.as_raw_fd(), 106);

        assert_eq!(writer.available_bytes(), 106);
        assert_eq!(writer.bytes_written(), 0);

        let buffer = [0u8; 64];
        writer.write_all(&buffer).unwrap();

        assert_eq!(writer.available_bytes(), 42);
        assert_eq!(writer.bytes_written(), 64);

        let buffer = [0u8; 42];
        assert_eq!(writer.write(&buffer).unwrap(), 42);

        assert_eq!(writer.available_bytes(), 0);
        assert_eq!(writer.bytes_written(), 106);
    }

    #[test]
    fn writer_split_commit_all() {
        let mut file = TempFile::new().unwrap().into_file();
        let mut writer = Writer::new(file.as_raw_fd(), 106);
        let mut other = writer.split_at(4).expect("failed to split Writer");

        assert_eq!(writer.available_bytes(), 4);
        assert_eq!(other.available_bytes(), 102);

        writer.write_all(&[0x1u8; 4]).unwrap();
        assert_eq!(writer.available_bytes(), 0);
        assert_eq!(writer.bytes_written(), 4);

        let buf = vec![0xdeu8; 64];
        let slices = [
            IoSlice::new(&buf[..32]),
            IoSlice::new(&buf[32..48]),
            IoSlice::new(&buf[48..]),
        ];
        assert_eq!(
            other
                .write_vectored(&slices)
                .expect("failed to write from buffer"),
            64
        );
        assert!(writer.flush().is_err());

        writer.commit(Some(&other)).unwrap();

        let mut content = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content.len(), 68);
        assert_eq!(&content[..4], &[0x1u8; 4]);
        assert_eq!(&content[4..], &buf[..]);
    }

    #[test]
    fn writer_split_out_of_bounds() {
        let file = TempFile::new().unwrap().into_file();
        let mut writer = Writer::new(file.as_raw_fd(), 106);
        assert!(writer.split_at(256).is_err());
    }

    #[test]
    fn write_full() {
        let file = TempFile::new().unwrap().into_file();
        let mut writer = Writer::new(file.as_raw_fd(), 48);

        let buf = vec![0xdeu8; 64];
        writer.write(&buf[..]).unwrap_err();

        let buf = vec![0xdeu8; 48];
        assert_eq!(
            writer.write(&buf[..]).expect("failed to write from buffer"),
            48
        );
    }

    #[test]
    fn write_obj() {
        let file = TempFile::new().unwrap().into_file();
        let mut writer = Writer::new(file.as_raw_fd(), 48);
        let val = 0x1u64;

        writer.write_obj(val).expect("failed to write from buffer");
        assert_eq!(writer.available_bytes(), 40);
    }
}
