//! Slot pools backing the data-sharing frames.
//!
//! A pool is a chain of slots. Each slot starts with a `{next, data_end}`
//! header followed by its payload. Frames are bump allocated inside the
//! current slot; when one does not fit, the next linked slot is reused
//! if it is big enough, otherwise a fresh slot is carved from the pool's
//! arena and linked after the current one.

use crate::config::device::align_up;
use crate::ir::sir::Width;
use crate::sim::memory::Memory;
use crate::sim::RuntimeFault;

/// `next` and `data_end`.
pub const SLOT_HEADER: u64 = 16;
const NEXT: u64 = 0;
const DATA_END: u64 = 8;

/// Pool state saved by `begin` and restored by `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SavedState {
    pub slot: u64,
    pub stack: u64,
    pub frame: u64,
    pub active: u64,
}

#[derive(Debug)]
pub struct SlotPool {
    index: u32,
    state: SavedState,
    initialized: bool,
    arena_next: u64,
    arena_end: u64,
}

impl SlotPool {
    pub fn new(index: u32, arena_base: u64, capacity: u64) -> Self {
        Self {
            index,
            state: SavedState::default(),
            initialized: false,
            arena_next: arena_base,
            arena_end: arena_base + capacity,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> SavedState {
        self.state
    }

    pub fn restore(&mut self, state: SavedState) {
        self.state = state;
    }

    /// Make `slot` (with `size` payload bytes) the root of the pool.
    pub fn initialize(&mut self, mem: &Memory<'_>, slot: u64, size: u64) -> Result<(), RuntimeFault> {
        mem.store(slot + NEXT, Width::Ptr, 0)?;
        mem.store(slot + DATA_END, Width::Ptr, (slot + SLOT_HEADER + size) as i64)?;
        let data = slot + SLOT_HEADER;
        self.state = SavedState {
            slot,
            stack: data,
            frame: data,
            active: 0,
        };
        self.initialized = true;
        Ok(())
    }

    /// Push a frame of `size` bytes for the lanes in `mask` and return its
    /// address. New slots get a payload of at least `default_size`.
    pub fn begin(
        &mut self,
        mem: &Memory<'_>,
        size: u64,
        default_size: u64,
        mask: u64,
    ) -> Result<u64, RuntimeFault> {
        if !self.initialized {
            return Err(RuntimeFault::PoolUninitialized { pool: self.index });
        }
        let needed = align_up(size as u32, 8) as u64;
        let cur = self.state.slot;
        let end = mem.load(cur + DATA_END, Width::Ptr)? as u64;

        let data = if self.state.stack + needed <= end {
            self.state.stack
        } else {
            let next = mem.load(cur + NEXT, Width::Ptr)? as u64;
            let reusable = next != 0
                && (mem.load(next + DATA_END, Width::Ptr)? as u64) >= next + SLOT_HEADER + needed;
            let slot = if reusable {
                next
            } else {
                let payload = needed.max(default_size);
                let slot = self.arena_next;
                if slot + SLOT_HEADER + payload > self.arena_end {
                    return Err(RuntimeFault::PoolExhausted {
                        pool: self.index,
                        requested: payload,
                    });
                }
                self.arena_next = slot + SLOT_HEADER + payload;
                mem.store(slot + NEXT, Width::Ptr, 0)?;
                mem.store(slot + DATA_END, Width::Ptr, (slot + SLOT_HEADER + payload) as i64)?;
                mem.store(cur + NEXT, Width::Ptr, slot as i64)?;
                slot
            };
            self.state.slot = slot;
            slot + SLOT_HEADER
        };
        self.state.stack = data + needed;
        self.state.frame = data;
        self.state.active = mask;
        Ok(data)
    }

    pub fn frame(&self) -> Result<u64, RuntimeFault> {
        if !self.initialized {
            return Err(RuntimeFault::PoolUninitialized { pool: self.index });
        }
        Ok(self.state.frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::memory::{Cells, GLOBAL_BASE, POOL_BASE};

    fn pool(capacity: u64) -> SlotPool {
        SlotPool::new(0, POOL_BASE, capacity)
    }

    #[test]
    fn test_bump_within_root_slot() {
        let global = Cells::new();
        let mem = Memory::new(&global);
        let mut p = pool(1024);
        p.initialize(&mem, GLOBAL_BASE, 64).unwrap();
        let a = p.begin(&mem, 12, 4, 1).unwrap();
        assert_eq!(a, GLOBAL_BASE + SLOT_HEADER);
        let b = p.begin(&mem, 8, 4, 1).unwrap();
        assert_eq!(b, a + 16);
        assert_eq!(p.frame().unwrap(), b);
    }

    #[test]
    fn test_overflow_links_and_reuses_next_slot() {
        let global = Cells::new();
        let mem = Memory::new(&global);
        let mut p = pool(1024);
        p.initialize(&mem, GLOBAL_BASE, 4).unwrap();
        let root = p.state();

        let first = p.begin(&mem, 40, 4, 1).unwrap();
        assert_eq!(first, POOL_BASE + SLOT_HEADER);
        assert_eq!(mem.load(GLOBAL_BASE, Width::Ptr).unwrap() as u64, POOL_BASE);

        p.restore(root);
        let again = p.begin(&mem, 32, 4, 1).unwrap();
        assert_eq!(again, first, "linked slot is reused");
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let global = Cells::new();
        let mem = Memory::new(&global);
        let mut p = pool(64);
        p.initialize(&mem, GLOBAL_BASE, 4).unwrap();
        let err = p.begin(&mem, 128, 4, 1).unwrap_err();
        assert_eq!(
            err,
            RuntimeFault::PoolExhausted {
                pool: 0,
                requested: 128
            }
        );
    }

    #[test]
    fn test_uninitialized_pool() {
        let global = Cells::new();
        let mem = Memory::new(&global);
        let mut p = pool(64);
        assert!(matches!(
            p.begin(&mem, 8, 4, 1),
            Err(RuntimeFault::PoolUninitialized { pool: 0 })
        ));
        assert!(p.frame().is_err());
    }
}
