// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The inode table backing the path connector.
//!
//! Every directory entry the kernel knows about is one [`InodeEntry`] in a single
//! owned arena; parent and child links are node ids, not references. An entry stays
//! alive while the kernel holds lookups on it, while children pin it, or while it is
//! flagged persistent (the root). Node ids are never reused while the kernel may
//! still reference them: with handle checking enabled the id carries the slot
//! generation, without it the slot is only reclaimed on id exhaustion grounds that
//! the kernel has forgotten the entry first.

use std::collections::HashMap;

use crate::abi::fuse_abi::ROOT_ID;

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// One live directory entry as seen by the kernel.
#[derive(Debug)]
pub struct InodeEntry {
    /// The id reported to the kernel; 1 is the root.
    pub node_id: u64,
    /// Kernel-side reference count, incremented by entry-producing replies and
    /// decremented by FORGET.
    pub lookup_count: u64,
    /// File type bits (S_IFMT) from the last attribute this entry produced.
    pub kind: u32,
    /// Primary parent link; `None` for the root and for unlinked entries.
    pub parent: Option<u64>,
    /// Name under the primary parent.
    pub name: String,
    /// Additional (parent, name) pairs this entry is hard-linked under.
    pub backrefs: Vec<(u64, String)>,
    /// Children by name.
    pub children: HashMap<String, u64>,
    /// Index of the mount this entry belongs to.
    pub mount: usize,
    /// Set when this entry is itself the root of a mount.
    pub mount_point: Option<usize>,
    /// Entries that survive a zero lookup count (the root).
    pub persistent: bool,
}

impl InodeEntry {
    /// Whether the entry can be evicted from the table: the kernel holds no lookups,
    /// no child pins it as parent, and it is neither persistent nor a live mount
    /// point. The caller detaches it from its parents before removal.
    pub fn evictable(&self) -> bool {
        self.lookup_count == 0
            && self.children.is_empty()
            && !self.persistent
            && self.mount_point.is_none()
    }
}

struct Slot {
    generation: u64,
    entry: Option<InodeEntry>,
}

/// The arena of inode entries, indexed by node id.
pub struct InodeTable {
    // Slot 0 reserved so the root lands on index 1 == ROOT_ID.
    slots: Vec<Slot>,
    free: Vec<usize>,
    check_handles: bool,
}

impl InodeTable {
    /// Create a table holding only the root entry.
    pub fn new(check_handles: bool) -> InodeTable {
        let mut table = InodeTable {
            slots: vec![Slot {
                generation: 0,
                entry: None,
            }],
            free: Vec::new(),
            check_handles,
        };

        let root = table.alloc(|node_id| InodeEntry {
            node_id,
            lookup_count: 0,
            kind: libc::S_IFDIR,
            parent: None,
            name: String::new(),
            backrefs: Vec::new(),
            children: HashMap::new(),
            mount: 0,
            mount_point: Some(0),
            persistent: true,
        });
        assert_eq!(root, ROOT_ID);

        table
    }

    fn encode(&self, index: usize, generation: u64) -> u64 {
        if self.check_handles {
            index as u64 | (generation << INDEX_BITS)
        } else {
            index as u64
        }
    }

    fn decode(&self, id: u64) -> (usize, u64) {
        if self.check_handles {
            ((id & INDEX_MASK) as usize, id >> INDEX_BITS)
        } else {
            (id as usize, 0)
        }
    }

    /// Allocate a fresh entry; `build` receives the assigned node id.
    pub fn alloc<B: FnOnce(u64) -> InodeEntry>(&mut self, build: B) -> u64 {
        let (index, generation) = match self.free.pop() {
            Some(index) => (index, self.slots[index].generation),
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1, 0)
            }
        };
        let node_id = self.encode(index, generation);
        self.slots[index].entry = Some(build(node_id));
        node_id
    }

    /// Resolve a node id, rejecting stale ids when verification is enabled.
    pub fn get(&self, id: u64) -> Option<&InodeEntry> {
        let (index, generation) = self.decode(id);
        let slot = self.slots.get(index)?;
        if self.check_handles && slot.generation != generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Mutable variant of [`InodeTable::get`].
    pub fn get_mut(&mut self, id: u64) -> Option<&mut InodeEntry> {
        let (index, generation) = self.decode(id);
        let check = self.check_handles;
        let slot = self.slots.get_mut(index)?;
        if check && slot.generation != generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Drop an entry from the table, recycling its slot.
    pub fn remove(&mut self, id: u64) -> Option<InodeEntry> {
        let (index, generation) = self.decode(id);
        let check = self.check_handles;
        let slot = self.slots.get_mut(index)?;
        if check && slot.generation != generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(entry)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Iterate over all live entries.
    pub fn iter(&self) -> impl Iterator<Item = &InodeEntry> {
        self.slots.iter().filter_map(|s| s.entry.as_ref())
    }

    /// Check the structural invariants of the tree.
    ///
    /// Every non-root entry must be reachable through a parent whose child table
    /// records it under its name, and both directions must agree.
    pub fn verify(&self) -> Result<(), String> {
        for entry in self.iter() {
            if let Some(parent_id) = entry.parent {
                let parent = self
                    .get(parent_id)
                    .ok_or_else(|| format!("inode {}: dangling parent {}", entry.node_id, parent_id))?;
                match parent.children.get(&entry.name) {
                    Some(&child_id) if child_id == entry.node_id => {}
                    other => {
                        return Err(format!(
                            "inode {}: parent/child relation corrupted, parent {} maps {:?} to {:?}",
                            entry.node_id, parent_id, entry.name, other
                        ))
                    }
                }
            }
            for (name, &child_id) in entry.children.iter() {
                let child = self
                    .get(child_id)
                    .ok_or_else(|| format!("inode {}: dangling child {}", entry.node_id, child_id))?;
                let primary = child.parent == Some(entry.node_id) && &child.name == name;
                let linked = child
                    .backrefs
                    .iter()
                    .any(|(p, n)| *p == entry.node_id && n == name);
                if !primary && !linked {
                    return Err(format!(
                        "inode {}: child {:?} ({}) does not reference it back",
                        entry.node_id, name, child_id
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_entry(node_id: u64, parent: Option<u64>, name: &str) -> InodeEntry {
        InodeEntry {
            node_id,
            lookup_count: 0,
            kind: libc::S_IFREG,
            parent,
            name: name.to_string(),
            backrefs: Vec::new(),
            children: HashMap::new(),
            mount: 0,
            mount_point: None,
            persistent: false,
        }
    }

    #[test]
    fn test_root_is_one() {
        let table = InodeTable::new(true);
        assert_eq!(table.get(ROOT_ID).unwrap().node_id, ROOT_ID);
        assert!(table.get(ROOT_ID).unwrap().persistent);

        let table = InodeTable::new(false);
        assert_eq!(table.get(ROOT_ID).unwrap().node_id, ROOT_ID);
    }

    #[test]
    fn test_ids_not_reused_with_verification() {
        let mut table = InodeTable::new(true);
        let id = table.alloc(|id| plain_entry(id, Some(ROOT_ID), "a"));
        table.remove(id).unwrap();
        let id2 = table.alloc(|id| plain_entry(id, Some(ROOT_ID), "b"));
        assert_ne!(id, id2);
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_verify_catches_corruption() {
        let mut table = InodeTable::new(true);
        let id = table.alloc(|id| plain_entry(id, Some(ROOT_ID), "a"));
        // Forgot to record the child in the parent's table.
        assert!(table.verify().is_err());

        table
            .get_mut(ROOT_ID)
            .unwrap()
            .children
            .insert("a".to_string(), id);
        assert!(table.verify().is_ok());
    }

    #[test]
    fn test_evictable() {
        let mut e = plain_entry(5, Some(ROOT_ID), "x");
        assert!(e.evictable());
        e.lookup_count = 1;
        assert!(!e.evictable());
        e.lookup_count = 0;
        e.children.insert("c".to_string(), 6);
        assert!(!e.evictable());
        e.children.clear();
        e.mount_point = Some(1);
        assert!(!e.evictable());
    }
}
