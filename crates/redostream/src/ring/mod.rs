//! Framed SPSC byte queue between the builder and the writer.
//!
//! The ring is a chain of arena chunks. The builder (single producer)
//! frames messages into the tail chunk and publishes them by storing the
//! chunk's `size` with release semantics; the writer (single consumer)
//! reads frames below `size` and confirms them by advancing `start`. The
//! chain mutex is taken only to rotate chunks; the data path runs on the
//! two atomics.
//!
//! A frame is always contiguous: rotation copies the partial message into
//! the fresh chunk. A message that cannot fit a single chunk is a fatal
//! redo error. Back-pressure comes from the arena's builder quota:
//! rotation blocks until the writer confirms and retires old chunks.

use crate::common::ctx::ShutdownState;
use crate::common::{Ctx, Error, MemoryModule, Result, Scn, CHUNK_SIZE};
use crate::memory::arena::Chunk;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// `start` value of a chunk no frame has been committed into yet.
pub const START_UNDEFINED: u64 = u64::MAX;

/// Sentinel for "no message confirmed yet".
pub const NO_CONFIRMED_ID: u64 = u64::MAX;

/// Frame flag bits.
pub mod frame_flags {
    /// Frame space is reserved in the ring.
    pub const ALLOCATED: u16 = 0x01;
    /// The writer has delivered and confirmed the frame.
    pub const CONFIRMED: u16 = 0x02;
    /// The frame is a checkpoint boundary (transaction commit).
    pub const CHECKPOINT: u16 = 0x04;
}

/// Encoded size of a frame header. The payload follows immediately and the
/// whole frame is padded to 8-byte alignment.
pub const FRAME_HEADER_SIZE: usize = 56;

/// Fixed frame header, serialized little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Payload bytes (padding excluded).
    pub size: u64,
    /// Monotonic message id.
    pub id: u64,
    /// Id of the chunk the frame was committed in.
    pub chunk_id: u64,
    /// Commit SCN of the owning transaction.
    pub scn: Scn,
    /// SCN of the log write that carried the frame.
    pub lwn_scn: Scn,
    /// Index within that log write.
    pub lwn_idx: u32,
    /// Redo log sequence.
    pub sequence: u32,
    /// Object id of the affected table, zero for transaction markers.
    pub obj: u32,
    pub flags: u16,
}

impl FrameHeader {
    fn encode(&self, mut buf: &mut [u8]) {
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.chunk_id);
        buf.put_u64_le(self.scn.0);
        buf.put_u64_le(self.lwn_scn.0);
        buf.put_u32_le(self.lwn_idx);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.obj);
        buf.put_u16_le(self.flags);
        buf.put_bytes(0, 2);
    }

    fn decode(mut buf: &[u8]) -> FrameHeader {
        let size = buf.get_u64_le();
        let id = buf.get_u64_le();
        let chunk_id = buf.get_u64_le();
        let scn = Scn(buf.get_u64_le());
        let lwn_scn = Scn(buf.get_u64_le());
        let lwn_idx = buf.get_u32_le();
        let sequence = buf.get_u32_le();
        let obj = buf.get_u32_le();
        let flags = buf.get_u16_le();
        FrameHeader { size, id, chunk_id, scn, lwn_scn, lwn_idx, sequence, obj, flags }
    }
}

/// A delivered frame: header plus a copy of the payload, with the handle
/// the writer passes back on confirmation.
#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
    chunk: Arc<RingChunk>,
    end_offset: u64,
    total_bytes: u64,
}

impl Frame {
    /// Ring bytes the frame occupies (header, payload, padding).
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

fn align8(v: u64) -> u64 {
    (v + 7) & !7
}

/// Chunk storage shared between producer and consumer.
///
/// The release/acquire protocol on `RingChunk::size` is what makes the
/// aliasing sound: the producer only writes at offsets >= the published
/// `size`, and the consumer only reads below it.
struct ChunkCell(UnsafeCell<Chunk>);

// SAFETY: access is disciplined by the size atomic as described above.
unsafe impl Sync for ChunkCell {}
unsafe impl Send for ChunkCell {}

impl ChunkCell {
    /// Producer-side write. Caller must stay at or above the published
    /// size of the owning chunk.
    ///
    /// # Safety
    /// Only the single producer may call this, for unpublished offsets.
    unsafe fn write(&self, offset: usize, bytes: &[u8]) {
        let chunk = &mut *self.0.get();
        chunk.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Consumer-side read. Caller must stay below the published size
    /// loaded with acquire ordering.
    ///
    /// # Safety
    /// Only published regions may be read.
    unsafe fn read(&self, offset: usize, len: usize) -> &[u8] {
        let chunk = &*self.0.get();
        &chunk.bytes()[offset..offset + len]
    }
}

struct RingChunk {
    id: u64,
    /// Published bytes; monotonic, release-stored by the producer.
    size: AtomicU64,
    /// First unconfirmed byte, or [`START_UNDEFINED`].
    start: AtomicU64,
    /// Set when the producer rotated past this chunk; `size` is final.
    sealed: AtomicBool,
    data: ChunkCell,
}

impl std::fmt::Debug for RingChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingChunk")
            .field("id", &self.id)
            .field("size", &self.size.load(Ordering::Relaxed))
            .field("start", &self.start.load(Ordering::Relaxed))
            .finish()
    }
}

impl RingChunk {
    fn new(id: u64, chunk: Chunk) -> Arc<RingChunk> {
        Arc::new(RingChunk {
            id,
            size: AtomicU64::new(0),
            start: AtomicU64::new(START_UNDEFINED),
            sealed: AtomicBool::new(false),
            data: ChunkCell(UnsafeCell::new(chunk)),
        })
    }
}

struct RingShared {
    shutdown: Arc<ShutdownState>,
    chain: Mutex<VecDeque<Arc<RingChunk>>>,
    writer_cond: Condvar,
    /// Committed but unconfirmed bytes across the whole ring.
    unconfirmed: AtomicU64,
    /// Highest confirmed message id, or [`NO_CONFIRMED_ID`].
    confirmed_id: AtomicU64,
    /// Signal the writer once this many unconfirmed bytes accumulate;
    /// zero flushes on every commit.
    flush_threshold: u64,
}

impl RingShared {
    fn signal_writer(&self) {
        let _chain = self.chain.lock();
        self.writer_cond.notify_all();
    }
}

/// Create a ring, returning the two endpoint handles.
pub fn ring(ctx: &Arc<Ctx>, flush_threshold: u64) -> Result<(RingProducer, RingConsumer)> {
    let first = RingChunk::new(0, ctx.arena.get(MemoryModule::Builder, false)?);
    let shared = Arc::new(RingShared {
        shutdown: Arc::clone(&ctx.shutdown),
        chain: Mutex::new(VecDeque::from([Arc::clone(&first)])),
        writer_cond: Condvar::new(),
        unconfirmed: AtomicU64::new(0),
        confirmed_id: AtomicU64::new(NO_CONFIRMED_ID),
        flush_threshold,
    });
    let producer = RingProducer {
        shared: Arc::clone(&shared),
        ctx: Arc::clone(ctx),
        tail: Arc::clone(&first),
        write_pos: 0,
        msg_start: 0,
        msg_open: false,
        staged: FrameHeader::default(),
        next_id: 0,
        next_chunk_id: 1,
    };
    let consumer = RingConsumer { shared, current: first, read_pos: 0 };
    Ok((producer, consumer))
}

/// Producer endpoint, owned by the builder thread.
pub struct RingProducer {
    shared: Arc<RingShared>,
    ctx: Arc<Ctx>,
    tail: Arc<RingChunk>,
    write_pos: u64,
    msg_start: u64,
    msg_open: bool,
    staged: FrameHeader,
    next_id: u64,
    next_chunk_id: u64,
}

impl RingProducer {
    /// Reserve a frame. Fields other than the payload size are fixed here.
    pub fn begin(
        &mut self,
        scn: Scn,
        lwn_scn: Scn,
        lwn_idx: u32,
        sequence: u32,
        obj: u32,
        flags: u16,
    ) -> Result<()> {
        debug_assert!(!self.msg_open, "begin with a message already open");

        if self.write_pos + FRAME_HEADER_SIZE as u64 > CHUNK_SIZE as u64 {
            self.rotate(false)?;
        }
        self.msg_start = self.write_pos;
        self.write_pos += FRAME_HEADER_SIZE as u64;
        self.msg_open = true;
        self.staged = FrameHeader {
            size: 0,
            id: self.next_id,
            chunk_id: self.tail.id,
            scn,
            lwn_scn,
            lwn_idx,
            sequence,
            obj,
            flags: flags | frame_flags::ALLOCATED,
        };
        Ok(())
    }

    /// Append payload bytes to the open frame, rotating if needed.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        debug_assert!(self.msg_open, "append without begin");

        let msg_bytes = self.write_pos - self.msg_start;
        if msg_bytes + bytes.len() as u64 + 8 > CHUNK_SIZE as u64 {
            return Err(Error::redo(
                50057,
                format!(
                    "message too large for the write buffer: {} bytes, increase \
                     'memory.write-buffer-max-mb'",
                    msg_bytes + bytes.len() as u64
                ),
            ));
        }
        if self.write_pos + bytes.len() as u64 > CHUNK_SIZE as u64 {
            self.rotate(true)?;
        }

        // SAFETY: single producer, writing above the published size.
        unsafe { self.tail.data.write(self.write_pos as usize, bytes) };
        self.write_pos += bytes.len() as u64;
        Ok(())
    }

    /// Publish the open frame.
    pub fn commit(&mut self) -> Result<u64> {
        debug_assert!(self.msg_open, "commit without begin");

        let payload = self.write_pos - self.msg_start - FRAME_HEADER_SIZE as u64;
        if payload == 0 {
            return Err(Error::redo(50058, "output buffer - commit of empty message"));
        }

        self.staged.size = payload;
        self.staged.chunk_id = self.tail.id;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.staged.encode(&mut header);
        // SAFETY: the header region is unpublished until the size store.
        unsafe { self.tail.data.write(self.msg_start as usize, &header) };

        self.write_pos = align8(self.write_pos);
        let total = self.write_pos - self.msg_start;

        if self.tail.start.load(Ordering::Relaxed) == START_UNDEFINED {
            self.tail.start.store(self.msg_start, Ordering::Release);
        }
        self.tail.size.store(self.write_pos, Ordering::Release);

        let unconfirmed =
            self.shared.unconfirmed.fetch_add(total, Ordering::AcqRel) + total;
        self.msg_open = false;
        let id = self.staged.id;
        self.next_id += 1;

        if self.shared.flush_threshold == 0 || unconfirmed > self.shared.flush_threshold {
            self.flush();
        }
        Ok(id)
    }

    /// Wake the writer regardless of the flush threshold.
    pub fn flush(&self) {
        self.shared.signal_writer();
    }

    /// The id the next committed frame will carry.
    pub fn next_message_id(&self) -> u64 {
        self.next_id
    }

    /// Seed the message id sequence when resuming from a checkpoint, so
    /// ids stay monotonic across restarts.
    pub fn set_next_message_id(&mut self, id: u64) {
        debug_assert!(!self.msg_open);
        self.next_id = id;
    }

    /// Highest message id the writer has confirmed.
    pub fn confirmed_id(&self) -> u64 {
        self.shared.confirmed_id.load(Ordering::Acquire)
    }

    fn rotate(&mut self, copy_partial: bool) -> Result<()> {
        // Allocation happens before the chain lock: it may block on the
        // builder quota until the writer retires chunks.
        let chunk = self.ctx.arena.get(MemoryModule::Builder, false)?;
        let fresh = RingChunk::new(self.next_chunk_id, chunk);
        self.next_chunk_id += 1;

        let partial = if copy_partial && self.msg_open {
            let len = (self.write_pos - self.msg_start) as usize;
            // SAFETY: reading our own unpublished bytes back.
            let bytes =
                unsafe { self.tail.data.read(self.msg_start as usize, len) }.to_vec();
            Some(bytes)
        } else {
            None
        };

        if let Some(bytes) = &partial {
            // SAFETY: fresh chunk, nothing published yet.
            unsafe { fresh.data.write(0, bytes) };
            self.msg_start = 0;
            self.write_pos = bytes.len() as u64;
        } else {
            self.msg_start = 0;
            self.write_pos = 0;
        }

        self.tail.sealed.store(true, Ordering::Release);
        {
            let mut chain = self.shared.chain.lock();
            chain.push_back(Arc::clone(&fresh));
        }
        trace!(chunk_id = fresh.id, copied = partial.is_some(), "ring rotated");
        self.tail = fresh;
        self.shared.signal_writer();
        Ok(())
    }
}

/// Consumer endpoint, owned by the writer thread.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    current: Arc<RingChunk>,
    read_pos: u64,
}

impl RingConsumer {
    /// Next frame, or `None` after `timeout` with no published data.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        loop {
            let published = self.current.size.load(Ordering::Acquire);
            if self.read_pos < published {
                return Ok(Some(self.read_frame()));
            }

            // Chunk exhausted: follow the chain once the producer sealed
            // it, otherwise wait for more data.
            if self.current.sealed.load(Ordering::Acquire) {
                let next = {
                    let chain = self.shared.chain.lock();
                    let idx = chain
                        .iter()
                        .position(|c| c.id == self.current.id)
                        .expect("consumer chunk still chained");
                    chain.get(idx + 1).cloned()
                };
                if let Some(next) = next {
                    self.current = next;
                    self.read_pos = 0;
                    continue;
                }
            }

            if self.shared.shutdown.is_hard() {
                return Err(Error::Shutdown);
            }
            let mut chain = self.shared.chain.lock();
            let timed_out = self
                .shared
                .writer_cond
                .wait_for(&mut chain, timeout)
                .timed_out();
            drop(chain);
            if timed_out {
                return Ok(None);
            }
        }
    }

    /// True when every published frame has been consumed and confirmed.
    pub fn drained(&self) -> bool {
        self.shared.unconfirmed.load(Ordering::Acquire) == 0
            && self.read_pos == self.current.size.load(Ordering::Acquire)
    }

    fn read_frame(&mut self) -> Frame {
        // SAFETY: the region below `published` is immutable once stored
        // with release ordering.
        let header = FrameHeader::decode(unsafe {
            self.current.data.read(self.read_pos as usize, FRAME_HEADER_SIZE)
        });
        let payload_at = self.read_pos as usize + FRAME_HEADER_SIZE;
        let payload = unsafe { self.current.data.read(payload_at, header.size as usize) };
        let mut copy = BytesMut::with_capacity(payload.len());
        copy.put_slice(payload);

        let total = align8(FRAME_HEADER_SIZE as u64 + header.size);
        self.read_pos += total;
        Frame {
            header,
            payload: copy.freeze(),
            chunk: Arc::clone(&self.current),
            end_offset: self.read_pos,
            total_bytes: total,
        }
    }

    /// Confirm a delivered frame: advance the chunk's `start`, account the
    /// bytes, and retire fully confirmed sealed chunks back to the arena.
    pub fn confirm(&mut self, frame: Frame) {
        frame.chunk.start.store(frame.end_offset, Ordering::Release);
        self.shared.unconfirmed.fetch_sub(frame.total_bytes, Ordering::AcqRel);
        self.shared.confirmed_id.store(frame.header.id, Ordering::Release);
        drop(frame);

        // Retire fully confirmed sealed chunks from the head of the chain;
        // dropping them returns their memory to the arena and unblocks a
        // producer waiting on the builder quota.
        let mut chain = self.shared.chain.lock();
        while let Some(front) = chain.front() {
            let done = front.sealed.load(Ordering::Acquire)
                && front.start.load(Ordering::Acquire) == front.size.load(Ordering::Acquire)
                && front.id != self.current.id;
            if done {
                chain.pop_front();
            } else {
                break;
            }
        }
    }

    /// Highest confirmed message id, or [`NO_CONFIRMED_ID`].
    pub fn confirmed_id(&self) -> u64 {
        self.shared.confirmed_id.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ArenaConfig;

    fn test_ctx(builder_chunks: u64) -> Arc<Ctx> {
        Ctx::new(
            ArenaConfig {
                chunks_min: 2,
                chunks_max: builder_chunks + 4,
                chunks_swap: 0,
                read_buffer_min: 0,
                read_buffer_max: 4,
                write_buffer_min: 1,
                write_buffer_max: builder_chunks,
                unswap_buffer_min: 0,
            },
            std::env::temp_dir(),
            0,
            0,
            0,
        )
        .unwrap()
    }

    fn commit_frame(producer: &mut RingProducer, scn: u64, payload: &[u8]) -> u64 {
        producer.begin(Scn(scn), Scn(scn), 0, 1, 42, 0).unwrap();
        producer.append(payload).unwrap();
        producer.commit().unwrap()
    }

    #[test]
    fn test_frame_header_roundtrip() {
        let header = FrameHeader {
            size: 123,
            id: 7,
            chunk_id: 2,
            scn: Scn(1000),
            lwn_scn: Scn(999),
            lwn_idx: 3,
            sequence: 14,
            obj: 77,
            flags: frame_flags::ALLOCATED | frame_flags::CHECKPOINT,
        };
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(FrameHeader::decode(&buf), header);
    }

    #[test]
    fn test_fifo_delivery() {
        let ctx = test_ctx(4);
        let (mut producer, mut consumer) = ring(&ctx, 0).unwrap();

        for i in 0..5u64 {
            let id = commit_frame(&mut producer, 100 + i, format!("payload-{i}").as_bytes());
            assert_eq!(id, i);
        }

        for i in 0..5u64 {
            let frame = consumer.poll(Duration::from_millis(100)).unwrap().unwrap();
            assert_eq!(frame.header.id, i);
            assert_eq!(frame.header.scn, Scn(100 + i));
            assert_eq!(frame.payload.as_ref(), format!("payload-{i}").as_bytes());
            consumer.confirm(frame);
        }
        assert_eq!(consumer.confirmed_id(), 4);
        assert!(consumer.drained());
    }

    #[test]
    fn test_poll_times_out_when_empty() {
        let ctx = test_ctx(4);
        let (_producer, mut consumer) = ring(&ctx, 0).unwrap();
        let start = std::time::Instant::now();
        assert!(consumer.poll(Duration::from_millis(50)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_rotation_keeps_messages_contiguous() {
        let ctx = test_ctx(8);
        let (mut producer, mut consumer) = ring(&ctx, 0).unwrap();

        // Fill most of the first chunk, then a frame that forces rotation
        // mid-message.
        let big = vec![0xAAu8; CHUNK_SIZE - 4096];
        commit_frame(&mut producer, 1, &big);

        producer.begin(Scn(2), Scn(2), 1, 1, 9, 0).unwrap();
        producer.append(&[0xBBu8; 2048]).unwrap();
        producer.append(&[0xCCu8; 4096]).unwrap();
        producer.commit().unwrap();

        let first = consumer.poll(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(first.payload.len(), big.len());
        consumer.confirm(first);

        let second = consumer.poll(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(second.header.id, 1);
        assert_eq!(second.payload.len(), 2048 + 4096);
        assert!(second.payload[..2048].iter().all(|&b| b == 0xBB));
        assert!(second.payload[2048..].iter().all(|&b| b == 0xCC));
        consumer.confirm(second);
    }

    #[test]
    fn test_empty_commit_is_error() {
        let ctx = test_ctx(4);
        let (mut producer, _consumer) = ring(&ctx, 0).unwrap();
        producer.begin(Scn(1), Scn(1), 0, 1, 0, 0).unwrap();
        let err = producer.commit().unwrap_err();
        assert_eq!(err.code(), 50058);
    }

    #[test]
    fn test_oversized_message_is_error() {
        let ctx = test_ctx(4);
        let (mut producer, _consumer) = ring(&ctx, 0).unwrap();
        producer.begin(Scn(1), Scn(1), 0, 1, 0, 0).unwrap();
        let huge = vec![0u8; CHUNK_SIZE];
        let err = producer.append(&huge).unwrap_err();
        assert_eq!(err.code(), 50057);
    }

    #[test]
    fn test_chunk_ids_strictly_increase() {
        let ctx = test_ctx(8);
        let (mut producer, mut consumer) = ring(&ctx, 0).unwrap();

        let payload = vec![1u8; CHUNK_SIZE / 2];
        let mut chunk_ids = Vec::new();
        for i in 0..6u64 {
            commit_frame(&mut producer, i, &payload);
        }
        for _ in 0..6 {
            let frame = consumer.poll(Duration::from_millis(100)).unwrap().unwrap();
            chunk_ids.push(frame.header.chunk_id);
            consumer.confirm(frame);
        }
        for pair in chunk_ids.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(*chunk_ids.last().unwrap() > 0);
    }

    #[test]
    fn test_back_pressure_blocks_producer_until_confirm() {
        let ctx = test_ctx(2);
        let (mut producer, mut consumer) = ring(&ctx, 0).unwrap();

        // Two chunks of frames exhaust the builder quota.
        let payload = vec![7u8; CHUNK_SIZE / 2];
        commit_frame(&mut producer, 1, &payload);
        commit_frame(&mut producer, 2, &payload);

        let blocked = std::thread::spawn(move || {
            commit_frame(&mut producer, 3, &vec![8u8; CHUNK_SIZE / 2]);
            producer
        });

        // Confirming the first chunk's frames frees a chunk and unblocks
        // the producer.
        let f1 = consumer.poll(Duration::from_millis(200)).unwrap().unwrap();
        consumer.confirm(f1);
        let f2 = consumer.poll(Duration::from_millis(200)).unwrap().unwrap();
        consumer.confirm(f2);

        let _producer = blocked.join().unwrap();
        let f3 = consumer.poll(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(f3.header.scn, Scn(3));
        consumer.confirm(f3);
    }
}
