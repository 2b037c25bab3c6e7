// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! An arena handing out opaque 64-bit handles with stale-handle detection.
//!
//! A handle is `index | (generation << 32)`. The generation of a slot is bumped every
//! time the slot is reused, so a handle kept after its object was unregistered no
//! longer resolves. With verification disabled the handle is the bare index, which
//! keeps values below 2^31 as 32-bit `stat()` callers require.

use std::sync::Arc;
use std::sync::Mutex;

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

struct Slot<T> {
    generation: u64,
    val: Option<Arc<T>>,
}

struct MapInner<T> {
    // Slot 0 is never used so a valid handle is never 0.
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

/// A table of objects addressed by opaque 64-bit handles.
pub struct HandleMap<T> {
    inner: Mutex<MapInner<T>>,
    check_handles: bool,
}

impl<T> HandleMap<T> {
    /// Create a handle map. With `check_handles` disabled, handles carry no
    /// verification bits and stay below 2^31.
    pub fn new(check_handles: bool) -> Self {
        HandleMap {
            inner: Mutex::new(MapInner {
                slots: vec![Slot {
                    generation: 0,
                    val: None,
                }],
                free: Vec::new(),
            }),
            check_handles,
        }
    }

    fn encode(&self, index: usize, generation: u64) -> u64 {
        if self.check_handles {
            index as u64 | (generation << INDEX_BITS)
        } else {
            index as u64
        }
    }

    fn decode(&self, handle: u64) -> (usize, u64) {
        if self.check_handles {
            ((handle & INDEX_MASK) as usize, handle >> INDEX_BITS)
        } else {
            (handle as usize, 0)
        }
    }

    /// Register an object, returning its handle. O(1).
    pub fn insert(&self, val: T) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let index = match inner.free.pop() {
            Some(index) => {
                inner.slots[index].val = Some(Arc::new(val));
                index
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    val: Some(Arc::new(val)),
                });
                inner.slots.len() - 1
            }
        };
        self.encode(index, inner.slots[index].generation)
    }

    /// Resolve a handle. Returns `None` for stale or forged handles. O(1).
    pub fn get(&self, handle: u64) -> Option<Arc<T>> {
        let (index, generation) = self.decode(handle);
        let inner = self.inner.lock().unwrap();
        let slot = inner.slots.get(index)?;
        if self.check_handles && slot.generation != generation {
            return None;
        }
        slot.val.clone()
    }

    /// Unregister a handle, returning its object. O(1).
    pub fn remove(&self, handle: u64) -> Option<Arc<T>> {
        let (index, generation) = self.decode(handle);
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(index)?;
        if self.check_handles && slot.generation != generation {
            return None;
        }
        let val = slot.val.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(index);
        Some(val)
    }

    /// Number of live objects in the table.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|s| s.val.is_some()).count()
    }

    /// True when no objects are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let map: HandleMap<u32> = HandleMap::new(true);
        let h1 = map.insert(7);
        let h2 = map.insert(8);
        assert_ne!(h1, h2);
        assert_ne!(h1, 0);

        assert_eq!(*map.get(h1).unwrap(), 7);
        assert_eq!(*map.get(h2).unwrap(), 8);
        assert_eq!(map.len(), 2);

        assert_eq!(*map.remove(h1).unwrap(), 7);
        assert!(map.get(h1).is_none());
        assert!(map.remove(h1).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let map: HandleMap<u32> = HandleMap::new(true);
        let h1 = map.insert(7);
        map.remove(h1).unwrap();

        // The slot is reused with a fresh generation; the old handle must not resolve.
        let h2 = map.insert(9);
        assert_ne!(h1, h2);
        assert!(map.get(h1).is_none());
        assert_eq!(*map.get(h2).unwrap(), 9);
    }

    #[test]
    fn test_unchecked_handles_stay_small() {
        let map: HandleMap<u32> = HandleMap::new(false);
        for i in 0..100 {
            let h = map.insert(i);
            assert!(h < (1 << 31));
        }
        // Reuse does not change the handle value without verification bits.
        let h = map.insert(1000);
        map.remove(h).unwrap();
        let h2 = map.insert(1001);
        assert_eq!(h, h2);
    }
}
