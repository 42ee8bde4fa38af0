//! Fixed-size chunk arena with per-module quotas.
//!
//! All buffer memory in the engine comes from here in 1 MiB chunks. Each
//! module (builder, parser, reader, transactions) draws against its own
//! quota; the reader and builder minimums are hard reservations that are
//! never lent to peers. When nothing can be allocated the caller blocks on
//! the arena condvar until a chunk is freed, a swap completes, or shutdown.
//!
//! Chunks are RAII handles: dropping a [`Chunk`] returns it to the free
//! list, and free chunks beyond the configured minimum are released back to
//! the OS.

use crate::common::ctx::ShutdownState;
use crate::common::{Error, MemoryModule, Result, CHUNK_SIZE, CHUNK_SIZE_MB};
use parking_lot::{Condvar, Mutex};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::trace;

/// Backing storage of one chunk, aligned for direct I/O.
#[repr(C, align(4096))]
struct ChunkData([u8; CHUNK_SIZE]);

impl ChunkData {
    fn layout() -> Layout {
        Layout::new::<ChunkData>()
    }
}

/// Owned buffer storage, freed back to the OS on drop.
struct RawChunk {
    ptr: NonNull<ChunkData>,
}

// SAFETY: RawChunk uniquely owns its allocation; transferring it between
// threads transfers the whole buffer.
unsafe impl Send for RawChunk {}
unsafe impl Sync for RawChunk {}

impl RawChunk {
    fn new_zeroed() -> Option<RawChunk> {
        // SAFETY: the layout is non-zero sized and correctly aligned; the
        // returned pointer is checked for null before use.
        let ptr = unsafe { alloc_zeroed(ChunkData::layout()) } as *mut ChunkData;
        NonNull::new(ptr).map(|ptr| RawChunk { ptr })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the pointer is valid for the lifetime of self.
        unsafe { &self.ptr.as_ref().0 }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the pointer is valid and uniquely owned.
        unsafe { &mut self.ptr.as_mut().0 }
    }
}

impl Drop for RawChunk {
    fn drop(&mut self) {
        // SAFETY: the pointer was produced by alloc_zeroed with this layout.
        unsafe { dealloc(self.ptr.as_ptr() as *mut u8, ChunkData::layout()) }
    }
}

/// A chunk handle. Returns itself to the arena's free list on drop.
pub struct Chunk {
    raw: Option<RawChunk>,
    module: MemoryModule,
    arena: Arc<ArenaShared>,
}

impl Chunk {
    pub fn module(&self) -> MemoryModule {
        self.module
    }

    pub fn bytes(&self) -> &[u8] {
        self.raw.as_ref().expect("chunk storage present").bytes()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.raw.as_mut().expect("chunk storage present").bytes_mut()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.arena.release(self.module, raw);
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk").field("module", &self.module).finish()
    }
}

/// Quotas and reservations, expressed in chunks.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub chunks_min: u64,
    pub chunks_max: u64,
    /// Chunks reserved for swap headroom; zero disables swapping.
    pub chunks_swap: u64,
    pub read_buffer_min: u64,
    pub read_buffer_max: u64,
    pub write_buffer_min: u64,
    pub write_buffer_max: u64,
    pub unswap_buffer_min: u64,
}

impl ArenaConfig {
    /// Derive chunk counts from MiB-denominated configuration values.
    pub fn from_mb(
        min_mb: u64,
        max_mb: u64,
        swap_mb: u64,
        read_buffer_min_mb: u64,
        read_buffer_max_mb: u64,
        write_buffer_min_mb: u64,
        write_buffer_max_mb: u64,
        unswap_buffer_min_mb: u64,
    ) -> Self {
        Self {
            chunks_min: min_mb / CHUNK_SIZE_MB,
            chunks_max: max_mb / CHUNK_SIZE_MB,
            chunks_swap: swap_mb / CHUNK_SIZE_MB,
            read_buffer_min: read_buffer_min_mb / CHUNK_SIZE_MB,
            read_buffer_max: read_buffer_max_mb / CHUNK_SIZE_MB,
            write_buffer_min: write_buffer_min_mb / CHUNK_SIZE_MB,
            write_buffer_max: write_buffer_max_mb / CHUNK_SIZE_MB,
            unswap_buffer_min: unswap_buffer_min_mb / CHUNK_SIZE_MB,
        }
    }
}

/// Point-in-time usage numbers, reported by the memory dump signal and at
/// shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub allocated_mb: u64,
    pub free_mb: u64,
    pub hwm_mb: u64,
    pub swap_mb: u64,
    pub module_mb: [u64; MemoryModule::COUNT],
    pub module_hwm_mb: [u64; MemoryModule::COUNT],
}

struct ArenaState {
    free: Vec<RawChunk>,
    /// Total live chunks, free or handed out.
    allocated: u64,
    hwm: u64,
    module_allocated: [u64; MemoryModule::COUNT],
    module_hwm: [u64; MemoryModule::COUNT],
    /// Raised while the parser is blocked for memory; observed by the
    /// memory manager to drive aggressive swapping.
    out_of_memory_parser: bool,
}

struct ArenaShared {
    cfg: ArenaConfig,
    state: Mutex<ArenaState>,
    cond: Condvar,
    shutdown: Arc<ShutdownState>,
}

impl ArenaShared {
    /// Return a chunk's storage to the free list, deallocating to the OS
    /// above the reserved minimum. Called from `Chunk::drop`.
    fn release(&self, module: MemoryModule, raw: RawChunk) {
        let excess = {
            let mut state = self.state.lock();

            debug_assert!(
                state.free.len() as u64 != state.allocated,
                "freeing a chunk the arena does not own ({module})"
            );
            debug_assert!(
                state.module_allocated[module.index()] > 0,
                "module {module} freeing with zero allocation"
            );

            state.module_allocated[module.index()] =
                state.module_allocated[module.index()].saturating_sub(1);

            let keep = (state.free.len() as u64) < self.cfg.chunks_min;
            if keep {
                state.free.push(raw);
                None
            } else {
                state.allocated -= 1;
                Some(raw)
            }
        };
        self.cond.notify_all();
        // OS deallocation happens outside the lock.
        drop(excess);
    }
}

/// The chunk arena. One per source.
pub struct Arena {
    shared: Arc<ArenaShared>,
}

impl Arena {
    pub fn new(cfg: ArenaConfig, shutdown: Arc<ShutdownState>) -> Result<Arena> {
        let mut free = Vec::with_capacity(cfg.chunks_min as usize);
        for _ in 0..cfg.chunks_min {
            let raw = RawChunk::new_zeroed().ok_or_else(|| {
                Error::runtime(
                    10016,
                    format!("couldn't allocate {CHUNK_SIZE_MB} MiB of memory for: memory chunks"),
                )
            })?;
            free.push(raw);
        }

        let allocated = free.len() as u64;
        Ok(Arena {
            shared: Arc::new(ArenaShared {
                state: Mutex::new(ArenaState {
                    free,
                    allocated,
                    hwm: allocated,
                    module_allocated: [0; MemoryModule::COUNT],
                    module_hwm: [0; MemoryModule::COUNT],
                    out_of_memory_parser: false,
                }),
                cond: Condvar::new(),
                cfg,
                shutdown,
            }),
        })
    }

    /// Take a chunk for `module`, blocking under memory pressure.
    ///
    /// `allow_swap` is false for allocations that must not depend on the
    /// swap daemon making progress (the unswap reservation stays off
    /// limits). Fails only with [`Error::Shutdown`] on hard stop, or a
    /// fatal runtime error when the OS refuses memory.
    pub fn get(&self, module: MemoryModule, allow_swap: bool) -> Result<Chunk> {
        let shared = &self.shared;
        let cfg = &shared.cfg;
        let mut state = shared.state.lock();

        loop {
            // A module below its hard reservation always takes from free.
            match module {
                MemoryModule::Reader
                    if state.module_allocated[module.index()] < cfg.read_buffer_min =>
                {
                    break
                }
                MemoryModule::Builder
                    if state.module_allocated[module.index()] < cfg.write_buffer_min =>
                {
                    break
                }
                _ => {}
            }

            // Free headroom the other reservations are still owed.
            let mut reserved = 0;
            let reader = state.module_allocated[MemoryModule::Reader.index()];
            if reader < cfg.read_buffer_min {
                reserved += cfg.read_buffer_min - reader;
            }
            let builder = state.module_allocated[MemoryModule::Builder.index()];
            if builder < cfg.write_buffer_min {
                reserved += cfg.write_buffer_min - builder;
            }
            if !allow_swap {
                reserved += cfg.unswap_buffer_min;
            }

            let builder_capped = module == MemoryModule::Builder
                && state.module_allocated[module.index()] >= cfg.write_buffer_max;
            if !builder_capped {
                if state.free.len() as u64 > reserved {
                    break;
                }

                if state.allocated < cfg.chunks_max {
                    let raw = RawChunk::new_zeroed().ok_or_else(|| {
                        Error::runtime(
                            10016,
                            format!(
                                "couldn't allocate {CHUNK_SIZE_MB} MiB of memory for: {module}"
                            ),
                        )
                    })?;
                    state.free.push(raw);
                    state.allocated += 1;
                    state.hwm = state.hwm.max(state.allocated);
                    break;
                }
            }

            if module == MemoryModule::Parser {
                state.out_of_memory_parser = true;
            }

            if shared.shutdown.is_hard() {
                return Err(Error::Shutdown);
            }

            trace!(module = module.name(), "arena exhausted, waiting");
            shared.cond.wait(&mut state);
        }

        if module == MemoryModule::Parser {
            state.out_of_memory_parser = false;
        }

        let raw = state.free.pop().expect("free list non-empty after wait loop");
        state.module_allocated[module.index()] += 1;
        state.module_hwm[module.index()] =
            state.module_hwm[module.index()].max(state.module_allocated[module.index()]);

        Ok(Chunk { raw: Some(raw), module, arena: Arc::clone(shared) })
    }

    /// Whether the swap daemon has nothing useful to do right now.
    pub fn nothing_to_swap(&self) -> bool {
        let state = self.shared.state.lock();
        self.shared.cfg.chunks_swap == 0
            || state.allocated - (state.free.len() as u64) < self.shared.cfg.chunks_swap
    }

    /// True while the parser is blocked waiting for memory.
    pub fn parser_out_of_memory(&self) -> bool {
        self.shared.state.lock().out_of_memory_parser
    }

    /// Called by the swap daemon when the parser is starved and there is
    /// nothing left to evict: fail fast with operator guidance.
    pub fn wont_swap(&self) -> Result<()> {
        let state = self.shared.state.lock();
        if !state.out_of_memory_parser {
            return Ok(());
        }
        if state.module_allocated[MemoryModule::Builder.index()]
            > self.shared.cfg.write_buffer_min
        {
            // The builder will free chunks once the writer confirms.
            return Ok(());
        }

        tracing::error!(
            "try to restart with a higher 'memory.max-mb' value, or add the offending \
             transaction to 'skip-xid'"
        );
        let reader = state.module_allocated[MemoryModule::Reader.index()];
        if reader > 5 {
            tracing::error!(
                read_buffer_mb = reader * CHUNK_SIZE_MB,
                "read buffer utilization is high, consider lowering 'memory.read-buffer-max-mb'"
            );
        }
        Err(Error::runtime(10017, "out of memory"))
    }

    /// Broadcast the arena condvar so every blocked allocator re-checks the
    /// shutdown flag.
    pub fn wake_all(&self) {
        let _guard = self.shared.state.lock();
        self.shared.cond.notify_all();
    }

    pub fn stats(&self) -> ArenaStats {
        let state = self.shared.state.lock();
        let mut module_mb = [0; MemoryModule::COUNT];
        let mut module_hwm_mb = [0; MemoryModule::COUNT];
        for i in 0..MemoryModule::COUNT {
            module_mb[i] = state.module_allocated[i] * CHUNK_SIZE_MB;
            module_hwm_mb[i] = state.module_hwm[i] * CHUNK_SIZE_MB;
        }
        ArenaStats {
            allocated_mb: state.allocated * CHUNK_SIZE_MB,
            free_mb: state.free.len() as u64 * CHUNK_SIZE_MB,
            hwm_mb: state.hwm * CHUNK_SIZE_MB,
            swap_mb: self.shared.cfg.chunks_swap * CHUNK_SIZE_MB,
            module_mb,
            module_hwm_mb,
        }
    }
}
