// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Wire-level tests: hand-built request frames through the server, replies parsed
//! back from a file standing in for the fuse device.

use std::convert::TryInto;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use vmm_sys_util::tempdir::TempDir;
use vmm_sys_util::tempfile::TempFile;

use fuse_pathfs::abi::fuse_abi::{
    ByteValued, Dirent, EntryOut, InHeader, Opcode, OutHeader, ROOT_ID,
};
use fuse_pathfs::api::server::Server;
use fuse_pathfs::pathfs::{FileSystemOptions, LoopbackFs, PathFileSystemConnector};
use fuse_pathfs::transport::{FuseBuf, Reader, Writer};

fn request(opcode: Opcode, nodeid: u64, unique: u64, payload: &[u8]) -> Vec<u8> {
    let header = InHeader {
        len: (size_of::<InHeader>() + payload.len()) as u32,
        opcode: opcode as u32,
        unique,
        nodeid,
        uid: 0,
        gid: 0,
        pid: 1,
        padding: 0,
    };
    let mut buf = header.as_slice().to_vec();
    buf.extend_from_slice(payload);
    buf
}

fn serve(server: &Server<Arc<PathFileSystemConnector>>, frame: &[u8]) -> Vec<u8> {
    let mut file = TempFile::new().unwrap().into_file();
    let reader = Reader::new(FuseBuf::new(frame));
    let writer = Writer::new(file.as_raw_fd(), 1 << 20);
    server.handle_message(reader, writer).unwrap();

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut reply = Vec::new();
    file.read_to_end(&mut reply).unwrap();
    reply
}

fn new_server(dir: &TempDir) -> Server<Arc<PathFileSystemConnector>> {
    let connector = PathFileSystemConnector::new(
        Arc::new(LoopbackFs::new(dir.as_path())),
        FileSystemOptions::default(),
    );
    Server::new(connector)
}

#[test]
fn test_lookup_reply_frame() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.as_path().join("one"), b"1").unwrap();
    let server = new_server(&dir);

    let reply = serve(&server, &request(Opcode::Lookup, ROOT_ID, 7, b"one\0"));

    let header = OutHeader::from_slice(&reply[..size_of::<OutHeader>()]).unwrap();
    assert_eq!(header.error, 0);
    assert_eq!(header.unique, 7);
    assert_eq!(header.len as usize, reply.len());
    assert_eq!(
        reply.len(),
        size_of::<OutHeader>() + size_of::<EntryOut>()
    );

    let entry = EntryOut::from_slice(&reply[size_of::<OutHeader>()..]).unwrap();
    assert_ne!(entry.nodeid, 0);
    assert_eq!(entry.attr.ino, entry.nodeid);
    assert_eq!(entry.attr.size, 1);
}

#[test]
fn test_lookup_miss_reply() {
    let dir = TempDir::new().unwrap();
    let server = new_server(&dir);

    let reply = serve(&server, &request(Opcode::Lookup, ROOT_ID, 8, b"gone\0"));
    let header = OutHeader::from_slice(&reply[..size_of::<OutHeader>()]).unwrap();
    assert_eq!(header.error, -libc::ENOENT);
    assert_eq!(header.len as usize, size_of::<OutHeader>());
}

#[test]
fn test_unknown_opcode_replies_enosys() {
    let dir = TempDir::new().unwrap();
    let server = new_server(&dir);

    let mut frame = request(Opcode::Lookup, ROOT_ID, 9, b"");
    // Corrupt the opcode to a hole in the numbering.
    frame[4..8].copy_from_slice(&7u32.to_le_bytes());

    let reply = serve(&server, &frame);
    let header = OutHeader::from_slice(&reply[..size_of::<OutHeader>()]).unwrap();
    assert_eq!(header.error, -libc::ENOSYS);
}

#[test]
fn test_short_payload_replies_eio() {
    let dir = TempDir::new().unwrap();
    let server = new_server(&dir);

    // A GETATTR carries a 16-byte struct; send only 4 bytes of payload.
    let reply = serve(&server, &request(Opcode::Getattr, ROOT_ID, 10, &[0u8; 4]));
    let header = OutHeader::from_slice(&reply[..size_of::<OutHeader>()]).unwrap();
    assert_eq!(header.error, -libc::EIO);
    assert_eq!(header.unique, 10);
}

#[test]
fn test_readdir_packing_respects_budget() {
    let dir = TempDir::new().unwrap();
    for name in ["one", "two", "three.txt"].iter() {
        fs::write(dir.as_path().join(name), b"").unwrap();
    }
    let server = new_server(&dir);

    // OPENDIR first to obtain a directory handle.
    let reply = serve(
        &server,
        &request(Opcode::Opendir, ROOT_ID, 11, &[0u8; 8]),
    );
    let header = OutHeader::from_slice(&reply[..size_of::<OutHeader>()]).unwrap();
    assert_eq!(header.error, 0);
    let fh = u64::from_le_bytes(reply[16..24].try_into().unwrap());

    // READDIR with a small budget: the reply must stay within it and the leftover
    // entries must arrive on the next call, in order.
    let mut names = Vec::new();
    let mut calls = 0;
    loop {
        let budget = 128u32;
        let mut payload = Vec::new();
        payload.extend_from_slice(&fh.to_le_bytes()); // fh
        payload.extend_from_slice(&0u64.to_le_bytes()); // offset
        payload.extend_from_slice(&budget.to_le_bytes()); // size
        payload.extend_from_slice(&[0u8; 20]); // read_flags, lock_owner, flags, padding

        let reply = serve(&server, &request(Opcode::Readdir, ROOT_ID, 12, &payload));
        let header = OutHeader::from_slice(&reply[..size_of::<OutHeader>()]).unwrap();
        assert_eq!(header.error, 0);
        let data = &reply[size_of::<OutHeader>()..];
        assert!(data.len() <= budget as usize);
        if data.is_empty() {
            break;
        }

        let mut pos = 0;
        while pos < data.len() {
            let dirent = Dirent::from_slice(&data[pos..pos + size_of::<Dirent>()]).unwrap();
            let name_start = pos + size_of::<Dirent>();
            let name = &data[name_start..name_start + dirent.namelen as usize];
            names.push(String::from_utf8(name.to_vec()).unwrap());
            let consumed = (size_of::<Dirent>() + dirent.namelen as usize + 7) & !7;
            pos += consumed;
        }

        calls += 1;
        assert!(calls < 10, "readdir did not terminate");
    }

    // More than one round was needed for five entries in 128 bytes.
    assert!(calls >= 2);
    assert_eq!(names[0], ".");
    assert_eq!(names[1], "..");
    let mut rest: Vec<String> = names[2..].to_vec();
    rest.sort();
    assert_eq!(rest, vec!["one", "three.txt", "two"]);
}
