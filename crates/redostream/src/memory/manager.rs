//! The swap daemon.
//!
//! Runs continuously: while the arena has free headroom it sleeps; under
//! pressure it evicts chunks of the largest buffered transaction to disk,
//! one at a time, waking any allocator blocked on the arena. Checkpoint
//! flush requests take priority over pressure-driven eviction.

use crate::common::ctx::trace as trace_bits;
use crate::common::{Ctx, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// The memory manager worker. One per source.
pub struct MemoryManager {
    ctx: Arc<Ctx>,
}

impl MemoryManager {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// Worker entry point.
    pub fn run(&self) -> Result<()> {
        debug!("memory manager start");
        let result = self.run_loop();
        match &result {
            Err(Error::Shutdown) | Ok(()) => debug!("memory manager stop"),
            Err(err) => debug!(code = err.code(), "memory manager stop on error"),
        }
        result
    }

    fn run_loop(&self) -> Result<()> {
        let ctx = &self.ctx;
        loop {
            if ctx.shutdown.is_hard() {
                return Ok(());
            }
            // The checkpoint worker depends on this one for its flush
            // requests, so it must be the one that leaves first.
            if ctx.shutdown.is_soft() && ctx.shutdown.checkpoint_finished() {
                return Ok(());
            }

            // Checkpoint flushes come first, to completion.
            if let Some(xid) = ctx.swap.flush_target() {
                trace!(xid = %xid, "flushing transaction for checkpoint");
                ctx.swap.flush_all(xid)?;
                continue;
            }

            // Above the swap thresholds there is nothing to do.
            if ctx.arena.nothing_to_swap() && !ctx.arena.parser_out_of_memory() {
                ctx.swap.wait_for_work(IDLE_WAIT);
                continue;
            }

            match ctx.swap.pick_victim() {
                Some(xid) => {
                    if ctx.trace_enabled(trace_bits::SWAP) {
                        trace!(xid = %xid, "evicting one chunk");
                    }
                    if !ctx.swap.evict_one(xid)? {
                        // The victim had nothing movable (shrink in
                        // progress or raced a release). If the parser is
                        // starving this is terminal.
                        self.ctx.arena.wont_swap()?;
                        ctx.swap.wait_for_work(IDLE_WAIT);
                    }
                }
                None => {
                    self.ctx.arena.wont_swap()?;
                    ctx.swap.wait_for_work(IDLE_WAIT);
                }
            }
        }
    }
}
