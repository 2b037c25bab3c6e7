// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Buffered, offset-stamped directory streams.
//!
//! A directory open yields a lazy stream of `(name, mode)` pairs. The handle assigns
//! monotonically increasing offsets starting at 1 and packs entries into the kernel
//! provided size budget. When the next entry would overflow the budget it is stashed
//! as leftover and re-emitted as the first entry of the next READDIR.

use std::io;
use std::sync::Mutex;

use crate::abi::fuse_abi::FUSE_UNKNOWN_INO;
use crate::api::filesystem;
use crate::pathfs::{DirEntry, DirStream};

struct DirState {
    stream: Option<DirStream>,
    leftover: Option<DirEntry>,
    next_offset: u64,
}

/// An open directory: the entry stream plus the leftover-entry protocol.
pub struct DirHandle {
    state: Mutex<DirState>,
}

impl DirHandle {
    /// Wrap a stream of user entries, prepending the synthetic `.` and `..`.
    pub fn new(stream: DirStream) -> DirHandle {
        let dots = vec![
            DirEntry {
                name: ".".to_string(),
                mode: libc::S_IFDIR,
            },
            DirEntry {
                name: "..".to_string(),
                mode: libc::S_IFDIR,
            },
        ];
        DirHandle {
            state: Mutex::new(DirState {
                stream: Some(Box::new(dots.into_iter().chain(stream))),
                leftover: None,
                next_offset: 0,
            }),
        }
    }

    /// Emit entries through `add_entry` until the stream ends or the reply is full.
    ///
    /// `add_entry` returns the space an entry consumed, or 0 when it did not fit; the
    /// non-fitting entry is kept for the next call.
    pub fn read(
        &self,
        add_entry: &mut dyn FnMut(filesystem::DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.leftover.take() {
            if !Self::push(&mut state, entry, add_entry)? {
                return Ok(());
            }
        }

        loop {
            let next = match state.stream.as_mut() {
                Some(stream) => stream.next(),
                None => return Ok(()),
            };
            match next {
                Some(entry) => {
                    if !Self::push(&mut state, entry, add_entry)? {
                        return Ok(());
                    }
                }
                None => {
                    state.stream = None;
                    return Ok(());
                }
            }
        }
    }

    // Returns false when the entry did not fit and was stashed as leftover.
    fn push(
        state: &mut DirState,
        entry: DirEntry,
        add_entry: &mut dyn FnMut(filesystem::DirEntry) -> io::Result<usize>,
    ) -> io::Result<bool> {
        let offset = state.next_offset + 1;
        // Inodes are reported unknown; the kernel issues a LOOKUP when it cares.
        let raw = filesystem::DirEntry {
            ino: FUSE_UNKNOWN_INO,
            offset,
            type_: (entry.mode & libc::S_IFMT) >> 12,
            name: entry.name.as_bytes(),
        };
        match add_entry(raw)? {
            0 => {
                state.leftover = Some(entry);
                Ok(false)
            }
            _ => {
                state.next_offset = offset;
                Ok(true)
            }
        }
    }

    /// Drain the stream so the producer can terminate.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(stream) = state.stream.take() {
            for _ in stream {}
        }
        state.leftover = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[&str]) -> DirStream {
        let v: Vec<DirEntry> = names
            .iter()
            .map(|n| DirEntry {
                name: n.to_string(),
                mode: libc::S_IFREG | 0o644,
            })
            .collect();
        Box::new(v.into_iter())
    }

    // Collect entries while a budget of `limit` names lasts, mimicking the server's
    // packing callback.
    fn collect(handle: &DirHandle, limit: usize) -> Vec<(u64, String)> {
        let mut out = Vec::new();
        handle
            .read(&mut |d| {
                if out.len() >= limit {
                    return Ok(0);
                }
                out.push((d.offset, String::from_utf8(d.name.to_vec()).unwrap()));
                Ok(1)
            })
            .unwrap();
        out
    }

    #[test]
    fn test_offsets_and_dots() {
        let handle = DirHandle::new(entries(&["a", "b"]));
        let got = collect(&handle, 10);
        assert_eq!(
            got,
            vec![
                (1, ".".to_string()),
                (2, "..".to_string()),
                (3, "a".to_string()),
                (4, "b".to_string()),
            ]
        );
        // Stream exhausted.
        assert!(collect(&handle, 10).is_empty());
    }

    #[test]
    fn test_leftover_carries_over() {
        let handle = DirHandle::new(entries(&["a", "b", "c"]));
        let first = collect(&handle, 3);
        assert_eq!(first.len(), 3);
        assert_eq!(first[2].1, "a");

        // The entry that did not fit is the first of the next batch, same offset
        // progression.
        let second = collect(&handle, 10);
        assert_eq!(
            second,
            vec![(4, "b".to_string()), (5, "c".to_string())]
        );
    }

    #[test]
    fn test_release_drains() {
        let handle = DirHandle::new(entries(&["a", "b"]));
        handle.release();
        assert!(collect(&handle, 10).is_empty());
    }
}
