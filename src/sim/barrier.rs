//! Block-wide barrier over warps.
//!
//! Each warp thread arrives once per executed barrier op. Warps that have
//! left the kernel retire and stop being waited for. A warp that fails
//! poisons the barrier so the others stop waiting instead of timing out.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::SimError;

struct State {
    live: usize,
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

pub struct BlockBarrier {
    block: u32,
    state: Mutex<State>,
    cvar: Condvar,
    timeout: Duration,
}

impl BlockBarrier {
    pub fn new(block: u32, warps: usize, timeout: Duration) -> Self {
        Self {
            block,
            state: Mutex::new(State {
                live: warps,
                arrived: 0,
                generation: 0,
                poisoned: false,
            }),
            cvar: Condvar::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, state: &mut State) {
        state.arrived = 0;
        state.generation += 1;
        self.cvar.notify_all();
    }

    pub fn wait(&self) -> Result<(), SimError> {
        let mut state = self.lock();
        if state.poisoned {
            return Err(SimError::BarrierPoisoned { block: self.block });
        }
        state.arrived += 1;
        if state.arrived >= state.live {
            self.release(&mut state);
            return Ok(());
        }
        let generation = state.generation;
        let deadline = Instant::now() + self.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                state.poisoned = true;
                self.cvar.notify_all();
                return Err(SimError::Deadlock {
                    block: self.block,
                    waiting: state.arrived,
                    live: state.live,
                });
            }
            let (next, _) = self
                .cvar
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
            if state.generation != generation {
                return Ok(());
            }
            if state.poisoned {
                return Err(SimError::BarrierPoisoned { block: self.block });
            }
        }
    }

    /// A warp finished the kernel.
    pub fn retire(&self) {
        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        if state.arrived > 0 && state.arrived >= state.live {
            self.release(&mut state);
        }
    }

    pub fn poison(&self) {
        let mut state = self.lock();
        state.poisoned = true;
        self.cvar.notify_all();
    }
}
