//! Per-transaction swap registry.
//!
//! Every transaction's full chunks live here, keyed by XID. Chunks are
//! either resident (`Some`) or swapped out (`None`, with a disk copy at
//! `<swap-path>/<xid>.<index>`), never both; the only exception is the
//! brief window `swapped_min..swapped_max` while the swap daemon is moving
//! an index, during which readers wait on the registry condvar.
//!
//! The registry never performs file or arena operations while holding its
//! lock: eviction and reload both run in two phases around the I/O.

use crate::common::ctx::ShutdownState;
use crate::common::{Error, Result, Scn, Xid};
use crate::memory::arena::{Arena, Chunk};
use crate::common::MemoryModule;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Registry counters for the memory dump.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapStats {
    pub transactions: usize,
    pub resident_chunks: usize,
    pub swapped_chunks: usize,
    pub swapped_out_total: u64,
    pub swapped_in_total: u64,
}

struct SwapEntry {
    chunks: Vec<Option<Arc<Chunk>>>,
    used: Vec<u32>,
    /// Half-open interval of indices the swap daemon is currently moving;
    /// empty when `swapped_min == swapped_max`.
    swapped_min: usize,
    swapped_max: usize,
    release: bool,
    start_scn: Scn,
    resident: usize,
}

impl SwapEntry {
    fn new(start_scn: Scn) -> Self {
        Self {
            chunks: Vec::new(),
            used: Vec::new(),
            swapped_min: 0,
            swapped_max: 0,
            release: false,
            start_scn,
            resident: 0,
        }
    }

    fn window_covers(&self, index: usize) -> bool {
        index >= self.swapped_min && index < self.swapped_max
    }

    fn window_empty(&self) -> bool {
        self.swapped_min == self.swapped_max
    }
}

struct SwapMap {
    xids: HashMap<Xid, SwapEntry>,
    /// Checkpoint wants this transaction fully on disk before proceeding.
    flush_xid: Option<Xid>,
    /// The producer is shrinking this transaction's tail; eviction keeps
    /// off the last index until it finishes.
    shrink_xid: Option<Xid>,
    swapped_out_total: u64,
    swapped_in_total: u64,
}

/// Chunk popped from a transaction's tail, see [`SwapRegistry::pop_chunk`].
pub enum PoppedChunk {
    Resident(Arc<Chunk>, u32),
    /// Only a disk copy exists; the caller reloads it.
    Swapped(u32),
}

/// Shared registry of swappable transaction chunks.
pub struct SwapRegistry {
    state: Mutex<SwapMap>,
    /// Wakes the swap daemon when there is new work.
    cond_manager: Condvar,
    /// Wakes readers waiting out a swap window.
    cond_reader: Condvar,
    shutdown: Arc<ShutdownState>,
    swap_path: PathBuf,
}

impl SwapRegistry {
    pub fn new(swap_path: impl Into<PathBuf>, shutdown: Arc<ShutdownState>) -> Self {
        Self {
            state: Mutex::new(SwapMap {
                xids: HashMap::new(),
                flush_xid: None,
                shrink_xid: None,
                swapped_out_total: 0,
                swapped_in_total: 0,
            }),
            cond_manager: Condvar::new(),
            cond_reader: Condvar::new(),
            shutdown,
            swap_path: swap_path.into(),
        }
    }

    fn chunk_file(&self, xid: Xid, index: usize) -> PathBuf {
        self.swap_path.join(format!("{}.{index}", xid.to_file_stem()))
    }

    /// Begin tracking a transaction.
    pub fn register(&self, xid: Xid, start_scn: Scn) {
        let mut state = self.state.lock();
        state.xids.insert(xid, SwapEntry::new(start_scn));
    }

    /// Append a filled chunk to the transaction's chain.
    pub fn push_chunk(&self, xid: Xid, chunk: Chunk, used: u32) -> Result<usize> {
        let mut state = self.state.lock();
        let entry = entry_mut(&mut state, xid, "push")?;
        entry.chunks.push(Some(Arc::new(chunk)));
        entry.used.push(used);
        entry.resident += 1;
        Ok(entry.chunks.len() - 1)
    }

    pub fn chunk_count(&self, xid: Xid) -> Result<usize> {
        let mut state = self.state.lock();
        Ok(entry_mut(&mut state, xid, "size")?.chunks.len())
    }

    /// Fetch chunk `index` for reading, waiting out any active swap window
    /// and reloading from disk when the slot is swapped out.
    pub fn fetch(&self, arena: &Arena, xid: Xid, index: usize) -> Result<(Arc<Chunk>, u32)> {
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    let entry = entry_mut(&mut state, xid, "fetch")?;
                    if !entry.window_covers(index) {
                        let used = entry.used[index];
                        match &entry.chunks[index] {
                            Some(chunk) => return Ok((Arc::clone(chunk), used)),
                            None => break, // reload outside the lock
                        }
                    }
                    if self.shutdown.is_hard() {
                        return Err(Error::Shutdown);
                    }
                    self.cond_manager.notify_all();
                    self.cond_reader.wait(&mut state);
                }
            }

            // Slot is on disk: allocate, read back, install.
            let mut chunk = arena.get(MemoryModule::Transactions, true)?;
            let used = self.read_chunk_file(xid, index, &mut chunk)?;

            let mut state = self.state.lock();
            let entry = entry_mut(&mut state, xid, "fetch-install")?;
            if entry.chunks[index].is_none() && !entry.window_covers(index) {
                let arc = Arc::new(chunk);
                entry.chunks[index] = Some(Arc::clone(&arc));
                entry.used[index] = used;
                entry.resident += 1;
                state.swapped_in_total += 1;
                trace!(xid = %xid, index, "reloaded swapped chunk");
                return Ok((arc, used));
            }
            // The daemon raced us on this index; retry from the top.
        }
    }

    /// Remove and return the transaction's last chunk, for tail shrinking.
    ///
    /// Sets the shrink marker so the daemon stays off the tail, and clears
    /// it under the same lock before returning (the marker is never
    /// visible once the pop is done).
    pub fn pop_chunk(&self, xid: Xid) -> Result<Option<PoppedChunk>> {
        let mut state = self.state.lock();
        state.shrink_xid = Some(xid);

        let result = loop {
            let entry = entry_mut(&mut state, xid, "pop")?;
            if entry.chunks.is_empty() {
                break None;
            }
            let index = entry.chunks.len() - 1;
            if !entry.window_covers(index) {
                let used = entry.used.pop().expect("used parallel to chunks");
                let slot = entry.chunks.pop().expect("checked non-empty");
                break Some(match slot {
                    Some(chunk) => {
                        entry.resident -= 1;
                        PoppedChunk::Resident(chunk, used)
                    }
                    None => PoppedChunk::Swapped(used),
                });
            }
            if self.shutdown.is_hard() {
                state.shrink_xid = None;
                return Err(Error::Shutdown);
            }
            self.cond_manager.notify_all();
            self.cond_reader.wait(&mut state);
        };

        state.shrink_xid = None;
        Ok(result)
    }

    /// Drop every chunk of the transaction and delete its swap files.
    pub fn release(&self, xid: Xid) -> Result<()> {
        let entry = {
            let mut state = self.state.lock();
            loop {
                let entry = entry_mut(&mut state, xid, "release")?;
                if entry.window_empty() {
                    break;
                }
                entry.release = true;
                if self.shutdown.is_hard() {
                    return Err(Error::Shutdown);
                }
                self.cond_manager.notify_all();
                self.cond_reader.wait(&mut state);
            }
            if state.flush_xid == Some(xid) {
                state.flush_xid = None;
            }
            state.xids.remove(&xid).expect("entry checked above")
        };

        let count = entry.chunks.len();
        drop(entry);
        for index in 0..count {
            let path = self.chunk_file(xid, index);
            if path.exists() {
                fs::remove_file(&path)
                    .map_err(|e| Error::io(10010, format!("file: {}", path.display()), e))?;
            }
        }
        debug!(xid = %xid, chunks = count, "transaction chunks released");
        self.cond_manager.notify_all();
        Ok(())
    }

    /// Reload a chunk that [`SwapRegistry::pop_chunk`] reported as swapped
    /// out, deleting its disk copy. `index` is the popped position, i.e.
    /// the chunk count after the pop.
    pub fn read_popped(&self, arena: &Arena, xid: Xid, index: usize) -> Result<Chunk> {
        let mut chunk = arena.get(MemoryModule::Transactions, true)?;
        self.read_chunk_file(xid, index, &mut chunk)?;
        let path = self.chunk_file(xid, index);
        fs::remove_file(&path)
            .map_err(|e| Error::io(10010, format!("file: {}", path.display()), e))?;
        Ok(chunk)
    }

    /// Ask the swap daemon to flush this transaction to disk completely
    /// (checkpoint time).
    pub fn request_flush(&self, xid: Xid) {
        let mut state = self.state.lock();
        state.flush_xid = Some(xid);
        self.cond_manager.notify_all();
    }

    /// Wait until any requested flush has finished, bounded by shutdown.
    pub fn wait_flush_done(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.flush_xid.is_some() {
            if self.shutdown.is_hard() {
                return Err(Error::Shutdown);
            }
            self.cond_manager.notify_all();
            self.cond_reader.wait_for(&mut state, std::time::Duration::from_millis(100));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Swap daemon side
    // ------------------------------------------------------------------

    /// The flush target, if a checkpoint flush is pending.
    pub fn flush_target(&self) -> Option<Xid> {
        self.state.lock().flush_xid
    }

    /// Choose the eviction victim: the transaction with the most resident
    /// chunks, ties broken by oldest start SCN.
    pub fn pick_victim(&self) -> Option<Xid> {
        let state = self.state.lock();
        state
            .xids
            .iter()
            .filter(|(_, e)| !e.release && e.resident > 0)
            .max_by(|(_, a), (_, b)| {
                a.resident.cmp(&b.resident).then(b.start_scn.cmp(&a.start_scn))
            })
            .map(|(xid, _)| *xid)
    }

    /// Evict one resident chunk of `xid` to disk. Returns false when the
    /// transaction has nothing evictable.
    pub fn evict_one(&self, xid: Xid) -> Result<bool> {
        // Phase 1: pick an index and open the swap window.
        let (index, chunk, used) = {
            let mut state = self.state.lock();
            let shrink = state.shrink_xid;
            let entry = match state.xids.get_mut(&xid) {
                Some(entry) if !entry.release => entry,
                _ => return Ok(false),
            };
            if !entry.window_empty() {
                return Ok(false);
            }

            // Oldest chunks go first; the tail stays put while the
            // producer is shrinking it.
            let last = entry.chunks.len().saturating_sub(1);
            let candidate = entry.chunks.iter().enumerate().position(|(i, slot)| {
                slot.is_some() && !(shrink == Some(xid) && i == last)
            });
            let index = match candidate {
                Some(index) => index,
                None => return Ok(false),
            };

            entry.swapped_min = index;
            entry.swapped_max = index + 1;
            let chunk = Arc::clone(entry.chunks[index].as_ref().expect("candidate resident"));
            (index, chunk, entry.used[index])
        };

        // Phase 2: write the chunk outside the lock, atomically.
        let write_result = self.write_chunk_file(xid, index, chunk.bytes(), used);

        // Phase 3: close the window; null the slot only on success.
        let mut state = self.state.lock();
        let released = {
            let entry = match state.xids.get_mut(&xid) {
                Some(entry) => entry,
                None => {
                    self.cond_reader.notify_all();
                    return write_result.map(|_| false);
                }
            };
            entry.swapped_min = 0;
            entry.swapped_max = 0;
            if write_result.is_ok() && !entry.release {
                entry.chunks[index] = None;
                entry.resident -= 1;
                state.swapped_out_total += 1;
                true
            } else {
                false
            }
        };
        self.cond_reader.notify_all();
        drop(state);
        drop(chunk);
        write_result?;
        if released {
            trace!(xid = %xid, index, "chunk swapped out");
        }
        Ok(released)
    }

    /// Flush every resident chunk of `xid`, then clear the flush marker.
    pub fn flush_all(&self, xid: Xid) -> Result<()> {
        loop {
            let has_resident = {
                let state = self.state.lock();
                match state.xids.get(&xid) {
                    Some(entry) if !entry.release => entry.resident > 0,
                    _ => false,
                }
            };
            if !has_resident || !self.evict_one(xid)? {
                break;
            }
        }
        let mut state = self.state.lock();
        if state.flush_xid == Some(xid) {
            state.flush_xid = None;
        }
        self.cond_reader.notify_all();
        Ok(())
    }

    /// Sleep until new swap work may exist or the timeout elapses.
    pub fn wait_for_work(&self, timeout: std::time::Duration) {
        let mut state = self.state.lock();
        self.cond_manager.wait_for(&mut state, timeout);
    }

    /// Broadcast both condvars so blocked threads observe shutdown.
    pub fn wake_all(&self) {
        let _state = self.state.lock();
        self.cond_manager.notify_all();
        self.cond_reader.notify_all();
    }

    pub fn stats(&self) -> SwapStats {
        let state = self.state.lock();
        let mut resident = 0;
        let mut swapped = 0;
        for entry in state.xids.values() {
            resident += entry.resident;
            swapped += entry.chunks.len() - entry.resident;
        }
        SwapStats {
            transactions: state.xids.len(),
            resident_chunks: resident,
            swapped_chunks: swapped,
            swapped_out_total: state.swapped_out_total,
            swapped_in_total: state.swapped_in_total,
        }
    }

    // ------------------------------------------------------------------
    // Swap files
    // ------------------------------------------------------------------

    fn write_chunk_file(&self, xid: Xid, index: usize, bytes: &[u8], used: u32) -> Result<()> {
        fs::create_dir_all(&self.swap_path)
            .map_err(|e| Error::io(10010, format!("dir: {}", self.swap_path.display()), e))?;
        let path = self.chunk_file(xid, index);
        let tmp = path.with_extension(format!("{index}.tmp"));
        write_atomic(&tmp, &path, &bytes[..used as usize])
    }

    fn read_chunk_file(&self, xid: Xid, index: usize, chunk: &mut Chunk) -> Result<u32> {
        let path = self.chunk_file(xid, index);
        let mut file = fs::File::open(&path)
            .map_err(|e| Error::io(10001, format!("file: {}", path.display()), e))?;
        let mut filled = 0usize;
        let buf = chunk.bytes_mut();
        loop {
            let n = file
                .read(&mut buf[filled..])
                .map_err(|e| Error::io(10005, format!("file: {}", path.display()), e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled as u32)
    }
}

fn entry_mut<'a>(state: &'a mut SwapMap, xid: Xid, op: &str) -> Result<&'a mut SwapEntry> {
    state
        .xids
        .get_mut(&xid)
        .ok_or_else(|| Error::redo(50070, format!("swap chunk not found for xid: {xid} during {op}")))
}

/// Write bytes to `tmp` then rename over `path`.
fn write_atomic(tmp: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(tmp)
        .map_err(|e| Error::io(10002, format!("file: {}", tmp.display()), e))?;
    file.write_all(bytes)
        .map_err(|e| Error::io(10006, format!("file: {}", tmp.display()), e))?;
    file.sync_all()
        .map_err(|e| Error::io(10008, format!("file: {}", tmp.display()), e))?;
    drop(file);
    fs::rename(tmp, path)
        .map_err(|e| Error::io(10009, format!("file: {}", path.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::arena::ArenaConfig;

    fn fixture() -> (Arc<Arena>, SwapRegistry, tempfile::TempDir) {
        let shutdown = Arc::new(ShutdownState::new());
        let arena = Arc::new(
            Arena::new(
                ArenaConfig {
                    chunks_min: 2,
                    chunks_max: 16,
                    chunks_swap: 4,
                    read_buffer_min: 0,
                    read_buffer_max: 16,
                    write_buffer_min: 0,
                    write_buffer_max: 16,
                    unswap_buffer_min: 1,
                },
                Arc::clone(&shutdown),
            )
            .unwrap(),
        );
        let dir = tempfile::tempdir().unwrap();
        let registry = SwapRegistry::new(dir.path(), shutdown);
        (arena, registry, dir)
    }

    fn filled_chunk(arena: &Arena, fill: u8, used: u32) -> Chunk {
        let mut chunk = arena.get(MemoryModule::Transactions, false).unwrap();
        for b in &mut chunk.bytes_mut()[..used as usize] {
            *b = fill;
        }
        chunk
    }

    #[test]
    fn test_swap_roundtrip_preserves_bytes() {
        let (arena, registry, _dir) = fixture();
        let xid = Xid::new(1, 2, 3);
        registry.register(xid, Scn(100));

        let chunk = filled_chunk(&arena, 0xAB, 4096);
        registry.push_chunk(xid, chunk, 4096).unwrap();

        assert!(registry.evict_one(xid).unwrap());
        let file = registry.chunk_file(xid, 0);
        assert!(file.exists());
        assert_eq!(fs::metadata(&file).unwrap().len(), 4096);

        let (reloaded, used) = registry.fetch(&arena, xid, 0).unwrap();
        assert_eq!(used, 4096);
        assert!(reloaded.bytes()[..4096].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_release_deletes_swap_files() {
        let (arena, registry, _dir) = fixture();
        let xid = Xid::new(4, 0, 9);
        registry.register(xid, Scn(7));
        registry.push_chunk(xid, filled_chunk(&arena, 1, 100), 100).unwrap();
        registry.push_chunk(xid, filled_chunk(&arena, 2, 200), 200).unwrap();
        assert!(registry.evict_one(xid).unwrap());
        let file = registry.chunk_file(xid, 0);
        assert!(file.exists());

        registry.release(xid).unwrap();
        assert!(!file.exists());
        assert_eq!(registry.stats().transactions, 0);
    }

    #[test]
    fn test_victim_is_largest_resident() {
        let (arena, registry, _dir) = fixture();
        let small = Xid::new(1, 0, 1);
        let large = Xid::new(2, 0, 2);
        registry.register(small, Scn(10));
        registry.register(large, Scn(20));
        registry.push_chunk(small, filled_chunk(&arena, 0, 8), 8).unwrap();
        for _ in 0..3 {
            registry.push_chunk(large, filled_chunk(&arena, 0, 8), 8).unwrap();
        }
        assert_eq!(registry.pick_victim(), Some(large));
    }

    #[test]
    fn test_victim_tie_breaks_by_oldest_scn() {
        let (arena, registry, _dir) = fixture();
        let newer = Xid::new(1, 0, 1);
        let older = Xid::new(2, 0, 2);
        registry.register(newer, Scn(200));
        registry.register(older, Scn(100));
        registry.push_chunk(newer, filled_chunk(&arena, 0, 8), 8).unwrap();
        registry.push_chunk(older, filled_chunk(&arena, 0, 8), 8).unwrap();
        assert_eq!(registry.pick_victim(), Some(older));
    }

    #[test]
    fn test_flush_all_evicts_everything() {
        let (arena, registry, _dir) = fixture();
        let xid = Xid::new(9, 1, 5);
        registry.register(xid, Scn(50));
        for i in 0..4u8 {
            registry.push_chunk(xid, filled_chunk(&arena, i, 64), 64).unwrap();
        }
        registry.request_flush(xid);
        registry.flush_all(xid).unwrap();
        let stats = registry.stats();
        assert_eq!(stats.resident_chunks, 0);
        assert_eq!(stats.swapped_chunks, 4);
        assert_eq!(registry.flush_target(), None);
    }

    #[test]
    fn test_pop_chunk_returns_tail() {
        let (arena, registry, _dir) = fixture();
        let xid = Xid::new(3, 3, 3);
        registry.register(xid, Scn(1));
        registry.push_chunk(xid, filled_chunk(&arena, 7, 32), 32).unwrap();
        registry.push_chunk(xid, filled_chunk(&arena, 8, 48), 48).unwrap();

        match registry.pop_chunk(xid).unwrap() {
            Some(PoppedChunk::Resident(chunk, used)) => {
                assert_eq!(used, 48);
                assert_eq!(chunk.bytes()[0], 8);
            }
            other => panic!("expected resident tail, got {:?}", other.is_some()),
        }
        assert_eq!(registry.chunk_count(xid).unwrap(), 1);
    }

    #[test]
    fn test_fetch_missing_xid_is_redo_error() {
        let (arena, registry, _dir) = fixture();
        let err = registry.fetch(&arena, Xid::new(1, 1, 1), 0).unwrap_err();
        assert_eq!(err.code(), 50070);
    }
}
