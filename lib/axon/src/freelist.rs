//! Lock-free freelist handing out stamped identifiers.
//!
//! Identifiers combine a 16-bit index with a serial counter in the upper
//! bits; the serial is bumped on every release so a recycled index never
//! reproduces a previously seen id (ABA protection for timer ids). Storage
//! grows through tiered fixed-size blocks allocated on first use and is
//! never shrunk.

use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

const BLOCK_COUNT: usize = 6;
// Sums to 65535: index 0xffff is reserved as the exhaustion sentinel.
const SIZES: [i32; BLOCK_COUNT] = [16, 112, 896, 7168, 14336, 43007];

const INDEX_MASK: i32 = 0x0000_ffff;
const SERIAL_MASK: i32 = !INDEX_MASK & !(1 << 31);
const SERIAL_COUNTER: i32 = INDEX_MASK + 1;

/// Per-entry storage: the stack link to the next free index.
struct Block {
    next: Box<[AtomicI32]>,
}

impl Block {
    fn allocate(offset: i32, size: i32) -> *mut Block {
        let mut next = Vec::with_capacity(size as usize);
        for i in 0..size {
            next.push(AtomicI32::new(offset + i + 1));
        }

        Box::into_raw(Box::new(Block {
            next: next.into_boxed_slice(),
        }))
    }
}

/// A lock-free freelist of up to 65536 stamped identifiers.
pub struct FreeList {
    blocks: [AtomicPtr<Block>; BLOCK_COUNT],
    head: AtomicI32,
}

/// Find the block an absolute index falls into, returning the block number
/// and the offset within it.
#[inline]
fn block_for(index: i32) -> (usize, i32) {
    let mut x = index;
    for (i, &size) in SIZES.iter().enumerate() {
        if x < size {
            return (i, x);
        }
        x -= size;
    }

    panic!("freelist index {} out of range", index);
}

/// Take the serial from `old`, advance it, and combine with index `id`.
#[inline]
fn increment_serial(old: i32, id: i32) -> i32 {
    (id & INDEX_MASK) | (old.wrapping_add(SERIAL_COUNTER) & SERIAL_MASK)
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList::starting_at(0)
    }

    /// A freelist whose first handed-out index is `initial`. Indices below
    /// it are never produced, which lets callers reserve 0 as "no id".
    pub const fn starting_at(initial: i32) -> FreeList {
        const NULL: AtomicPtr<Block> = AtomicPtr::new(ptr::null_mut());

        FreeList {
            blocks: [NULL; BLOCK_COUNT],
            head: AtomicI32::new(initial),
        }
    }

    /// Pop the next free identifier (index plus current serial), or `None`
    /// when all 65536 indices are live.
    pub fn next(&self) -> Option<i32> {
        loop {
            let id = self.head.load(Ordering::Acquire);
            let at = id & INDEX_MASK;

            if at >= INDEX_MASK {
                return None;
            }

            let (block, offset) = block_for(at);
            let mut v = self.blocks[block].load(Ordering::Acquire);

            if v.is_null() {
                let base = at - offset;
                let fresh = Block::allocate(base, SIZES[block]);

                match self.blocks[block].compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => v = fresh,
                    Err(current) => {
                        // Lost the race; drop ours and use the winner's.
                        unsafe { drop(Box::from_raw(fresh)) };
                        v = current;
                    }
                }
            }

            let entry_next = unsafe { (*v).next[offset as usize].load(Ordering::Relaxed) };
            let new_head = (entry_next & INDEX_MASK) | (id & !INDEX_MASK);

            if self
                .head
                .compare_exchange(id, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(id & (INDEX_MASK | SERIAL_MASK));
            }
        }
    }

    /// Return an identifier to the list, stamping a fresh serial.
    pub fn release(&self, id: i32) {
        let at = id & INDEX_MASK;
        let (block, offset) = block_for(at);
        let v = self.blocks[block].load(Ordering::Acquire);
        assert!(!v.is_null(), "released id {} from unallocated block", id);

        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                (*v).next[offset as usize].store(head & INDEX_MASK, Ordering::Relaxed);
            }

            let new_head = increment_serial(head, id);
            if self
                .head
                .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl Drop for FreeList {
    fn drop(&mut self) {
        for block in self.blocks.iter() {
            let ptr = block.load(Ordering::Relaxed);
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

unsafe impl Send for FreeList {}
unsafe impl Sync for FreeList {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequential_allocation_is_unique() {
        let list = FreeList::new();
        let mut seen = HashSet::new();

        for _ in 0..1000 {
            let id = list.next().unwrap();
            assert!(seen.insert(id & INDEX_MASK));
        }
    }

    #[test]
    fn test_release_recycles_index_with_new_serial() {
        let list = FreeList::new();

        let first = list.next().unwrap();
        list.release(first);
        let second = list.next().unwrap();

        assert_eq!(first & INDEX_MASK, second & INDEX_MASK);
        assert_ne!(first, second);
    }

    #[test]
    fn test_block_for_tiers() {
        assert_eq!(block_for(0), (0, 0));
        assert_eq!(block_for(15), (0, 15));
        assert_eq!(block_for(16), (1, 0));
        assert_eq!(block_for(16 + 112), (2, 0));
    }

    #[test]
    fn test_concurrent_allocation() {
        let list = Arc::new(FreeList::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let list = list.clone();
            handles.push(std::thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..500 {
                    ids.push(list.next().unwrap());
                }
                for &id in &ids {
                    list.release(id);
                }
                ids
            }));
        }

        let mut live = HashSet::new();
        for handle in handles {
            // Within one round, indices handed to one thread are unique.
            let ids = handle.join().unwrap();
            let indices: HashSet<_> = ids.iter().map(|id| id & INDEX_MASK).collect();
            assert_eq!(indices.len(), ids.len());
            live.extend(ids);
        }
    }
}
