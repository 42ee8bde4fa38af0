//! Per-transaction redo buffer.
//!
//! Redo records arrive in write order, not commit order; each active XID
//! accumulates its records here until COMMIT or ROLLBACK. Records are
//! appended into arena chunks; full chunks move into the swap registry
//! where the memory manager may spill them to disk, and iteration reloads
//! them transparently.
//!
//! Record layout inside a chunk (records never straddle a chunk boundary):
//!
//! ```text
//! | scn u64 | sequence u32 | subscn u16 | offset u16 |  ordering header
//! | opcode u16 | length u32 | payload ...            |
//! ```

use crate::common::{Ctx, Error, MemoryModule, Result, Scn, Xid, CHUNK_SIZE};
use crate::memory::arena::Chunk;
use crate::memory::swap::PoppedChunk;
use bytes::{Buf, BufMut};
use std::sync::Arc;
use tracing::{debug, trace};

/// Encoded size of the per-record ordering header.
pub const RECORD_HEADER_SIZE: usize = 16;
/// Ordering header plus opcode and length fields.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + 2 + 4;
/// Largest payload a single record may carry.
pub const MAX_RECORD_PAYLOAD: usize = CHUNK_SIZE - RECORD_OVERHEAD;

/// Ordering key of a buffered record: position of the change within the
/// redo stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct RecordKey {
    pub scn: Scn,
    pub sequence: u32,
    pub subscn: u16,
    /// Offset of the record within its redo block.
    pub offset: u16,
}

impl RecordKey {
    fn encode(&self, mut buf: &mut [u8]) {
        buf.put_u64_le(self.scn.0);
        buf.put_u32_le(self.sequence);
        buf.put_u16_le(self.subscn);
        buf.put_u16_le(self.offset);
    }

    fn decode(mut buf: &[u8]) -> RecordKey {
        let scn = Scn(buf.get_u64_le());
        let sequence = buf.get_u32_le();
        let subscn = buf.get_u16_le();
        let offset = buf.get_u16_le();
        RecordKey { scn, sequence, subscn, offset }
    }
}

/// A record as seen during iteration; the payload borrows chunk storage.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub key: RecordKey,
    pub opcode: u16,
    pub payload: &'a [u8],
}

/// One transaction's buffered records.
pub struct TxBuf {
    xid: Xid,
    start_scn: Scn,
    tail: Option<Chunk>,
    tail_used: u32,
    /// Record end offsets within the tail, for undo of the last record.
    tail_ends: Vec<u32>,
    records: u64,
    total_bytes: u64,
    /// Hex-dump every appended record (the `dump-xid` side channel).
    dump: bool,
}

impl TxBuf {
    /// Start buffering a transaction. Registers the XID with the swap
    /// registry so the memory manager can see it.
    pub fn new(ctx: &Ctx, xid: Xid, start_scn: Scn, dump: bool) -> TxBuf {
        ctx.swap.register(xid, start_scn);
        if dump {
            debug!(xid = %xid, "transaction record dump enabled");
        }
        TxBuf {
            xid,
            start_scn,
            tail: None,
            tail_used: 0,
            tail_ends: Vec::new(),
            records: 0,
            total_bytes: 0,
            dump,
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn start_scn(&self) -> Scn {
        self.start_scn
    }

    pub fn record_count(&self) -> u64 {
        self.records
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Append a record at the logical end of the transaction.
    pub fn append(
        &mut self,
        ctx: &Ctx,
        key: RecordKey,
        opcode: u16,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(Error::redo(
                50071,
                format!(
                    "transaction record too large: {} bytes, xid: {}",
                    payload.len(),
                    self.xid
                ),
            ));
        }
        let need = RECORD_OVERHEAD + payload.len();

        // Seal the tail when the record does not fit.
        if let Some(tail) = self.tail.take() {
            if self.tail_used as usize + need > CHUNK_SIZE {
                ctx.swap.push_chunk(self.xid, tail, self.tail_used)?;
                self.tail_used = 0;
                self.tail_ends.clear();
            } else {
                self.tail = Some(tail);
            }
        }
        if self.tail.is_none() {
            self.tail = Some(ctx.arena.get(MemoryModule::Transactions, false)?);
        }

        let tail = self.tail.as_mut().expect("tail allocated above");
        let at = self.tail_used as usize;
        let buf = &mut tail.bytes_mut()[at..at + need];
        key.encode(&mut buf[..RECORD_HEADER_SIZE]);
        let mut rest = &mut buf[RECORD_HEADER_SIZE..];
        rest.put_u16_le(opcode);
        rest.put_u32_le(payload.len() as u32);
        rest.put_slice(payload);

        self.tail_used += need as u32;
        self.tail_ends.push(self.tail_used);
        self.records += 1;
        self.total_bytes += need as u64;

        if self.dump {
            trace!(
                xid = %self.xid,
                scn = key.scn.0,
                opcode,
                payload = %hex_prefix(payload, 64),
                "record appended"
            );
        }
        Ok(())
    }

    /// Iterate records in append order, reloading swapped chunks on demand.
    pub fn for_each(
        &self,
        ctx: &Ctx,
        mut f: impl FnMut(RecordView<'_>) -> Result<()>,
    ) -> Result<()> {
        let sealed = ctx.swap.chunk_count(self.xid)?;
        for index in 0..sealed {
            let (chunk, used) = ctx.swap.fetch(&ctx.arena, self.xid, index)?;
            decode_records(&chunk.bytes()[..used as usize], self.xid, &mut f)?;
        }
        if let Some(tail) = &self.tail {
            decode_records(&tail.bytes()[..self.tail_used as usize], self.xid, &mut f)?;
        }
        Ok(())
    }

    /// Remove the most recently appended record (single-operation undo).
    ///
    /// Returns false when the transaction has no records.
    pub fn undo_last(&mut self, ctx: &Ctx) -> Result<bool> {
        if self.records == 0 {
            return Ok(false);
        }

        // An empty tail means the previous chunk must come back from the
        // registry (and possibly from disk) first.
        if self.tail_ends.is_empty() {
            self.tail = None;
            self.tail_used = 0;
            let (chunk, used) = match ctx.swap.pop_chunk(self.xid)? {
                Some(PoppedChunk::Resident(chunk, used)) => {
                    (reclaim_chunk(ctx, chunk, used)?, used)
                }
                Some(PoppedChunk::Swapped(used)) => {
                    let index = ctx.swap.chunk_count(self.xid)?;
                    (ctx.swap.read_popped(&ctx.arena, self.xid, index)?, used)
                }
                None => return Ok(false),
            };
            self.tail_ends = record_ends(&chunk.bytes()[..used as usize], self.xid)?;
            self.tail = Some(chunk);
            self.tail_used = used;
        }

        let end = self.tail_ends.pop().expect("non-empty checked above");
        let start = self.tail_ends.last().copied().unwrap_or(0);
        self.tail_used = start;
        self.records -= 1;
        self.total_bytes -= u64::from(end - start);
        Ok(true)
    }

    /// Release every chunk, resident and on-disk. Used by commit (after
    /// replay), rollback, and skip.
    pub fn release(mut self, ctx: &Ctx) -> Result<()> {
        self.tail = None;
        ctx.swap.release(self.xid)
    }
}

/// Take back exclusive ownership of a popped chunk. If the swap daemon
/// still holds a clone the bytes are copied into a fresh chunk instead.
fn reclaim_chunk(ctx: &Ctx, chunk: Arc<Chunk>, used: u32) -> Result<Chunk> {
    match Arc::try_unwrap(chunk) {
        Ok(chunk) => Ok(chunk),
        Err(shared) => {
            let mut fresh = ctx.arena.get(MemoryModule::Transactions, false)?;
            fresh.bytes_mut()[..used as usize]
                .copy_from_slice(&shared.bytes()[..used as usize]);
            Ok(fresh)
        }
    }
}

fn decode_records(
    mut buf: &[u8],
    xid: Xid,
    f: &mut impl FnMut(RecordView<'_>) -> Result<()>,
) -> Result<()> {
    while !buf.is_empty() {
        if buf.len() < RECORD_OVERHEAD {
            return Err(Error::redo(
                50073,
                format!("truncated record header in transaction buffer, xid: {xid}"),
            ));
        }
        let key = RecordKey::decode(&buf[..RECORD_HEADER_SIZE]);
        let mut rest = &buf[RECORD_HEADER_SIZE..];
        let opcode = rest.get_u16_le();
        let len = rest.get_u32_le() as usize;
        if rest.len() < len {
            return Err(Error::redo(
                50073,
                format!("truncated record payload in transaction buffer, xid: {xid}"),
            ));
        }
        f(RecordView { key, opcode, payload: &rest[..len] })?;
        buf = &buf[RECORD_OVERHEAD + len..];
    }
    Ok(())
}

fn record_ends(buf: &[u8], xid: Xid) -> Result<Vec<u32>> {
    let mut ends = Vec::new();
    let mut at = 0usize;
    while at < buf.len() {
        if buf.len() - at < RECORD_OVERHEAD {
            return Err(Error::redo(
                50073,
                format!("truncated record header in transaction buffer, xid: {xid}"),
            ));
        }
        let mut rest = &buf[at + RECORD_HEADER_SIZE..];
        let _opcode = rest.get_u16_le();
        let len = rest.get_u32_le() as usize;
        at += RECORD_OVERHEAD + len;
        ends.push(at as u32);
    }
    Ok(ends)
}

fn hex_prefix(bytes: &[u8], max: usize) -> String {
    let shown = &bytes[..bytes.len().min(max)];
    let mut out = String::with_capacity(shown.len() * 2);
    for b in shown {
        out.push_str(&format!("{b:02x}"));
    }
    if bytes.len() > max {
        out.push_str("..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ArenaConfig;

    fn test_ctx(dir: &std::path::Path, max_chunks: u64) -> Arc<Ctx> {
        Ctx::new(
            ArenaConfig {
                chunks_min: 2,
                chunks_max: max_chunks,
                chunks_swap: 2,
                read_buffer_min: 0,
                read_buffer_max: max_chunks,
                write_buffer_min: 0,
                write_buffer_max: max_chunks,
                unswap_buffer_min: 1,
            },
            dir.to_path_buf(),
            0,
            0,
            0,
        )
        .unwrap()
    }

    fn key(scn: u64, seq: u32, subscn: u16) -> RecordKey {
        RecordKey { scn: Scn(scn), sequence: seq, subscn, offset: 0 }
    }

    #[test]
    fn test_append_and_iterate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 8);
        let xid = Xid::new(1, 2, 3);
        let mut buf = TxBuf::new(&ctx, xid, Scn(100), false);

        for i in 0u16..10 {
            buf.append(&ctx, key(100 + u64::from(i), 1, i), 11, &i.to_le_bytes()).unwrap();
        }
        assert_eq!(buf.record_count(), 10);

        let mut seen = Vec::new();
        buf.for_each(&ctx, |rec| {
            assert_eq!(rec.opcode, 11);
            seen.push(rec.key.subscn);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, (0u16..10).collect::<Vec<_>>());

        buf.release(&ctx).unwrap();
    }

    #[test]
    fn test_records_never_straddle_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 16);
        let xid = Xid::new(1, 0, 7);
        let mut buf = TxBuf::new(&ctx, xid, Scn(1), false);

        // Payload sized so two records cannot share one chunk.
        let payload = vec![0x5Au8; CHUNK_SIZE / 2 + 1024];
        for i in 0..4u32 {
            buf.append(&ctx, key(u64::from(i), 1, 0), 2, &payload).unwrap();
        }
        assert_eq!(ctx.swap.chunk_count(xid).unwrap(), 3);

        let mut count = 0;
        buf.for_each(&ctx, |rec| {
            assert_eq!(rec.payload.len(), payload.len());
            assert!(rec.payload.iter().all(|&b| b == 0x5A));
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 4);
        buf.release(&ctx).unwrap();
    }

    #[test]
    fn test_iterate_reloads_swapped_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 16);
        let xid = Xid::new(2, 1, 1);
        let mut buf = TxBuf::new(&ctx, xid, Scn(1), false);

        let payload = vec![0xC3u8; CHUNK_SIZE / 2];
        for i in 0..6u32 {
            buf.append(&ctx, key(u64::from(i), 1, 0), 3, &payload).unwrap();
        }

        // Spill every sealed chunk to disk.
        while ctx.swap.evict_one(xid).unwrap() {}
        assert!(ctx.swap.stats().swapped_chunks > 0);

        let mut scns = Vec::new();
        buf.for_each(&ctx, |rec| {
            assert!(rec.payload.iter().all(|&b| b == 0xC3));
            scns.push(rec.key.scn.0);
            Ok(())
        })
        .unwrap();
        assert_eq!(scns, vec![0, 1, 2, 3, 4, 5]);
        buf.release(&ctx).unwrap();
    }

    #[test]
    fn test_undo_last_record() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 8);
        let xid = Xid::new(5, 5, 5);
        let mut buf = TxBuf::new(&ctx, xid, Scn(9), false);

        buf.append(&ctx, key(9, 1, 0), 1, b"keep").unwrap();
        buf.append(&ctx, key(10, 1, 1), 1, b"drop").unwrap();
        assert!(buf.undo_last(&ctx).unwrap());
        assert_eq!(buf.record_count(), 1);

        let mut payloads = Vec::new();
        buf.for_each(&ctx, |rec| {
            payloads.push(rec.payload.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(payloads, vec![b"keep".to_vec()]);

        assert!(buf.undo_last(&ctx).unwrap());
        assert!(!buf.undo_last(&ctx).unwrap());
        buf.release(&ctx).unwrap();
    }

    #[test]
    fn test_oversized_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 8);
        let xid = Xid::new(1, 1, 2);
        let mut buf = TxBuf::new(&ctx, xid, Scn(1), false);

        let payload = vec![0u8; MAX_RECORD_PAYLOAD + 1];
        let err = buf.append(&ctx, key(1, 1, 0), 1, &payload).unwrap_err();
        assert_eq!(err.code(), 50071);
        buf.release(&ctx).unwrap();
    }
}
