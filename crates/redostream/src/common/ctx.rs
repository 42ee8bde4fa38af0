//! The shared engine context.
//!
//! One [`Ctx`] per source, passed as an explicit handle to every worker.
//! The only process-wide state is the signal handler in the daemon, which
//! forwards into this context through atomics.

use crate::common::{Result, MemoryModule};
use crate::memory::{Arena, ArenaConfig, SwapRegistry};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Trace bitmask values for the `trace` configuration field.
///
/// Nineteen subsystem bits; the configured mask must stay within
/// [`trace::MAX`].
pub mod trace {
    pub const SLEEP: u32 = 1 << 0;
    pub const THREADS: u32 = 1 << 1;
    pub const DML: u32 = 1 << 2;
    pub const LWN: u32 = 1 << 3;
    pub const REDO: u32 = 1 << 4;
    pub const CHECKPOINT: u32 = 1 << 5;
    pub const WRITER: u32 = 1 << 6;
    pub const SCHEMA: u32 = 1 << 7;
    pub const LOB: u32 = 1 << 8;
    pub const FILE: u32 = 1 << 9;
    pub const DISK: u32 = 1 << 10;
    pub const PERFORMANCE: u32 = 1 << 11;
    pub const TRANSACTION: u32 = 1 << 12;
    pub const ARCHIVE: u32 = 1 << 13;
    pub const SYSTEM: u32 = 1 << 14;
    pub const CONDITION: u32 = 1 << 15;
    pub const SWAP: u32 = 1 << 16;
    pub const NETWORK: u32 = 1 << 17;
    pub const CONFIG: u32 = 1 << 18;

    pub const MAX: u32 = (1 << 19) - 1;
}

/// Behavior flags for the `flags` configuration field.
pub mod flags {
    /// Emit without a schema catalog; column values keyed by position.
    pub const SCHEMALESS: u32 = 1 << 0;
    /// Synthesize a placeholder schema element for unknown objects instead
    /// of filtering their records.
    pub const ADAPTIVE_SCHEMA: u32 = 1 << 1;
}

/// Cooperative shutdown flags, observed at every wait site.
pub struct ShutdownState {
    hard: AtomicBool,
    soft: AtomicBool,
    replicator_finished: AtomicBool,
    writer_finished: AtomicBool,
    checkpoint_finished: AtomicBool,
    main: Mutex<()>,
    cond_main: Condvar,
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            hard: AtomicBool::new(false),
            soft: AtomicBool::new(false),
            replicator_finished: AtomicBool::new(false),
            writer_finished: AtomicBool::new(false),
            checkpoint_finished: AtomicBool::new(false),
            main: Mutex::new(()),
            cond_main: Condvar::new(),
        }
    }

    pub fn is_hard(&self) -> bool {
        self.hard.load(Ordering::Acquire)
    }

    pub fn is_soft(&self) -> bool {
        self.soft.load(Ordering::Acquire)
    }

    pub fn replicator_finished(&self) -> bool {
        self.replicator_finished.load(Ordering::Acquire)
    }

    pub fn set_replicator_finished(&self) {
        self.replicator_finished.store(true, Ordering::Release);
        self.wake_main();
    }

    /// The writer drained the ring and confirmed its last frame; the
    /// final checkpoint may now capture the fully confirmed state.
    pub fn writer_finished(&self) -> bool {
        self.writer_finished.load(Ordering::Acquire)
    }

    pub fn set_writer_finished(&self) {
        self.writer_finished.store(true, Ordering::Release);
        self.wake_main();
    }

    /// The final checkpoint is on disk; the memory manager (which serves
    /// checkpoint flush requests) may exit.
    pub fn checkpoint_finished(&self) -> bool {
        self.checkpoint_finished.load(Ordering::Acquire)
    }

    pub fn set_checkpoint_finished(&self) {
        self.checkpoint_finished.store(true, Ordering::Release);
        self.wake_main();
    }

    pub fn stop_soft(&self) {
        if !self.soft.swap(true, Ordering::AcqRel) {
            self.wake_main();
        }
    }

    pub fn stop_hard(&self) {
        self.soft.store(true, Ordering::Release);
        if !self.hard.swap(true, Ordering::AcqRel) {
            self.wake_main();
        }
    }

    /// Park the supervisor until woken or the timeout elapses.
    pub fn wait_main(&self, timeout: Duration) {
        let mut guard = self.main.lock();
        if !self.is_hard() {
            self.cond_main.wait_for(&mut guard, timeout);
        }
    }

    pub fn wake_main(&self) {
        let _guard = self.main.lock();
        self.cond_main.notify_all();
    }
}

/// Shared engine context: shutdown coordination, memory, and the trace and
/// behavior switches read from configuration.
pub struct Ctx {
    pub shutdown: Arc<ShutdownState>,
    pub arena: Arena,
    pub swap: SwapRegistry,
    trace_mask: u32,
    flags: u32,
    dump_redo_log: u8,
    dump_status: AtomicBool,
    dump_memory: AtomicBool,
}

impl Ctx {
    pub fn new(
        arena_cfg: ArenaConfig,
        swap_path: PathBuf,
        trace_mask: u32,
        flags: u32,
        dump_redo_log: u8,
    ) -> Result<Arc<Ctx>> {
        let shutdown = Arc::new(ShutdownState::new());
        let arena = Arena::new(arena_cfg, Arc::clone(&shutdown))?;
        let swap = SwapRegistry::new(swap_path, Arc::clone(&shutdown));
        Ok(Arc::new(Ctx {
            shutdown,
            arena,
            swap,
            trace_mask,
            flags,
            dump_redo_log,
            dump_status: AtomicBool::new(false),
            dump_memory: AtomicBool::new(false),
        }))
    }

    /// Whether a trace subsystem bit is enabled.
    pub fn trace_enabled(&self, bit: u32) -> bool {
        self.trace_mask & bit != 0
    }

    pub fn flag_set(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn dump_redo_log(&self) -> u8 {
        self.dump_redo_log
    }

    /// Request a graceful stop: drain the ring, write a final checkpoint.
    pub fn stop_soft(&self) {
        info!("soft shutdown requested");
        self.shutdown.stop_soft();
        self.swap.wake_all();
    }

    /// Request an immediate stop: wake every blocked wait site.
    pub fn stop_hard(&self) {
        info!("hard shutdown requested");
        self.shutdown.stop_hard();
        self.arena.wake_all();
        self.swap.wake_all();
    }

    // Signal-driven dump requests. The handlers only flip these flags; the
    // supervisor loop performs the actual reporting.

    pub fn request_status_dump(&self) {
        self.dump_status.store(true, Ordering::Release);
        self.shutdown.wake_main();
    }

    pub fn request_memory_dump(&self) {
        self.dump_memory.store(true, Ordering::Release);
        self.shutdown.wake_main();
    }

    pub fn take_status_dump_request(&self) -> bool {
        self.dump_status.swap(false, Ordering::AcqRel)
    }

    pub fn take_memory_dump_request(&self) -> bool {
        self.dump_memory.swap(false, Ordering::AcqRel)
    }

    /// Human-readable memory report for the memory dump signal.
    pub fn memory_report(&self) -> String {
        let arena = self.arena.stats();
        let swap = self.swap.stats();
        let mut out = format!(
            "memory: allocated {}MB, free {}MB, hwm {}MB, swap budget {}MB\n",
            arena.allocated_mb, arena.free_mb, arena.hwm_mb, arena.swap_mb
        );
        for module in [
            MemoryModule::Builder,
            MemoryModule::Parser,
            MemoryModule::Reader,
            MemoryModule::Transactions,
        ] {
            out.push_str(&format!(
                "memory module {}: {}MB (hwm {}MB)\n",
                module,
                arena.module_mb[module.index()],
                arena.module_hwm_mb[module.index()],
            ));
        }
        out.push_str(&format!(
            "swap: {} transactions, {} resident chunks, {} swapped chunks, {} out / {} in total",
            swap.transactions,
            swap.resident_chunks,
            swap.swapped_chunks,
            swap.swapped_out_total,
            swap.swapped_in_total
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_transitions() {
        let state = ShutdownState::new();
        assert!(!state.is_soft());
        assert!(!state.is_hard());

        state.stop_soft();
        assert!(state.is_soft());
        assert!(!state.is_hard());

        state.stop_hard();
        assert!(state.is_soft());
        assert!(state.is_hard());
    }

    #[test]
    fn test_hard_stop_implies_soft() {
        let state = ShutdownState::new();
        state.stop_hard();
        assert!(state.is_soft());
    }

    #[test]
    fn test_trace_mask_bounds() {
        // All nineteen bits fit the documented maximum.
        assert_eq!(trace::MAX, 524287);
        assert!(trace::CONFIG <= trace::MAX);
    }

    #[test]
    fn test_dump_requests_are_one_shot() {
        let ctx = Ctx::new(
            crate::memory::ArenaConfig {
                chunks_min: 1,
                chunks_max: 2,
                chunks_swap: 0,
                read_buffer_min: 0,
                read_buffer_max: 2,
                write_buffer_min: 0,
                write_buffer_max: 2,
                unswap_buffer_min: 0,
            },
            std::env::temp_dir(),
            0,
            0,
            0,
        )
        .unwrap();

        assert!(!ctx.take_memory_dump_request());
        ctx.request_memory_dump();
        assert!(ctx.take_memory_dump_request());
        assert!(!ctx.take_memory_dump_request());
    }
}
