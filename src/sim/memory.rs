//! Simulated device memory.
//!
//! Memory is a sparse map from byte address to the value last stored
//! there. Generated code never overlaps accesses of different widths at
//! different offsets, so one cell per address is enough. Cells never
//! written read as zero.
//!
//! Address map:
//!   [FUNC_BASE, ..)      function symbols, not dereferenceable
//!   [GLOBAL_BASE, ..)    device globals and kernel buffers, grid wide
//!   [SHARED_BASE, ..)    shared-address-space globals, per block
//!   [POOL_BASE, ..)      slot pool arenas, per block
//!   [STACK_BASE, ..)     lane stacks, per block

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::ir::sir::Width;

use super::RuntimeFault;

pub const FUNC_BASE: u64 = 0x1000;
pub const GLOBAL_BASE: u64 = 0x1_0000_0000;
pub const SHARED_BASE: u64 = 0x2_0000_0000;
pub const POOL_BASE: u64 = 0x3_0000_0000;
pub const STACK_BASE: u64 = 0x4_0000_0000;
/// Stack bytes reserved per lane.
pub const STACK_SIZE: u64 = 1 << 20;

/// Base address of the stack of thread `tid`.
pub fn stack_base(tid: u32) -> u64 {
    STACK_BASE + tid as u64 * STACK_SIZE
}

/// Truncate `value` to `width` and sign-extend it back.
pub fn truncate(value: i64, width: Width) -> i64 {
    match width {
        Width::I8 => value as i8 as i64,
        Width::I32 => value as i32 as i64,
        Width::I64 | Width::Ptr => value,
    }
}

#[derive(Default)]
pub struct Cells {
    map: Mutex<HashMap<u64, i64>>,
}

impl Cells {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, i64>> {
        // a warp that panicked left the map consistent: every write is one insert
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn load(&self, addr: u64) -> i64 {
        self.lock().get(&addr).copied().unwrap_or(0)
    }

    pub fn store(&self, addr: u64, value: i64) {
        self.lock().insert(addr, value);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The memory one block sees: grid-wide cells plus its own.
pub struct Memory<'g> {
    global: &'g Cells,
    block: Cells,
}

impl<'g> Memory<'g> {
    pub fn new(global: &'g Cells) -> Self {
        Self {
            global,
            block: Cells::new(),
        }
    }

    fn route(&self, addr: u64) -> Result<&Cells, RuntimeFault> {
        if addr >= SHARED_BASE {
            Ok(&self.block)
        } else if addr >= GLOBAL_BASE {
            Ok(self.global)
        } else {
            Err(RuntimeFault::InvalidAddress { addr })
        }
    }

    pub fn load(&self, addr: u64, width: Width) -> Result<i64, RuntimeFault> {
        Ok(truncate(self.route(addr)?.load(addr), width))
    }

    pub fn store(&self, addr: u64, width: Width, value: i64) -> Result<(), RuntimeFault> {
        self.route(addr)?.store(addr, truncate(value, width));
        Ok(())
    }
}
