//! The writer: drains the ring and delivers frames to a sink.
//!
//! Sinks implement three operations: initialize, publish, confirm. The
//! writer never reorders; frames leave in ring id order, and each
//! confirmation advances the ring's `start` pointer, which is what lets
//! the builder recycle ring chunks. Transient sink failures are retried
//! with bounded backoff; exhausting the retries escalates to soft
//! shutdown so a final checkpoint can still be written.

pub mod discard;
pub mod file;
pub mod network;

use crate::common::{Ctx, Error, Result};
use crate::metadata::Metadata;
use crate::ring::{Frame, RingConsumer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use discard::DiscardSink;
pub use file::FileSink;
pub use network::NetworkSink;

/// A message sink.
pub trait Sink: Send {
    /// Human-readable sink type for logs.
    fn kind(&self) -> &'static str;

    /// Open connections or files.
    fn initialize(&mut self) -> Result<()>;

    /// Deliver one frame.
    fn publish(&mut self, frame: &Frame) -> Result<()>;

    /// Called after the frame is counted as confirmed, for sinks that
    /// batch their own acknowledgements.
    fn confirm(&mut self, frame: &Frame) -> Result<()> {
        let _ = frame;
        Ok(())
    }
}

/// Writer retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// The writer worker. One per sink.
pub struct Writer {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    consumer: RingConsumer,
    sink: Box<dyn Sink>,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl Writer {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        consumer: RingConsumer,
        sink: Box<dyn Sink>,
        poll_interval: Duration,
        retry: RetryPolicy,
    ) -> Writer {
        Writer { ctx, metadata, consumer, sink, poll_interval, retry }
    }

    /// Worker entry point.
    pub fn run(&mut self) -> Result<()> {
        info!(sink = self.sink.kind(), "writer start");
        self.sink.initialize()?;

        loop {
            if self.ctx.shutdown.is_hard() {
                break;
            }

            match self.consumer.poll(self.poll_interval) {
                Ok(Some(frame)) => self.deliver(frame)?,
                Ok(None) => {
                    // Idle. On graceful shutdown, leave once the replayed
                    // stream is fully delivered.
                    if self.ctx.shutdown.is_soft()
                        && self.ctx.shutdown.replicator_finished()
                        && self.consumer.drained()
                    {
                        break;
                    }
                }
                Err(Error::Shutdown) => break,
                Err(err) => return Err(err),
            }
        }

        debug!(sink = self.sink.kind(), "writer stop");
        Ok(())
    }

    fn deliver(&mut self, frame: Frame) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.sink.publish(&frame) {
                Ok(()) => break,
                Err(err) if err.is_retriable() && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self
                        .retry
                        .base_delay
                        .saturating_mul(1u32 << attempt.min(16))
                        .min(self.retry.max_delay);
                    warn!(
                        sink = self.sink.kind(),
                        attempt,
                        code = err.code(),
                        "publish failed, retrying in {delay:?}: {err}"
                    );
                    if self.ctx.shutdown.is_hard() {
                        return Err(Error::Shutdown);
                    }
                    std::thread::sleep(delay);
                }
                Err(err) => {
                    error!(
                        sink = self.sink.kind(),
                        code = err.code(),
                        "publish failed permanently: {err}"
                    );
                    return Err(err);
                }
            }
        }

        self.metadata.note_confirmed(
            frame.header.id,
            frame.header.scn,
            frame.header.lwn_scn,
            frame.total_bytes(),
        );
        self.sink.confirm(&frame)?;
        self.consumer.confirm(frame);
        Ok(())
    }
}
