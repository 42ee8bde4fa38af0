//! Sink that drops every frame. Useful for benchmarking the pipeline and
//! for draining a stream without a consumer.

use crate::common::Result;
use crate::ring::Frame;
use crate::writer::Sink;

#[derive(Default)]
pub struct DiscardSink {
    frames: u64,
}

impl DiscardSink {
    pub fn new() -> DiscardSink {
        DiscardSink::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Sink for DiscardSink {
    fn kind(&self) -> &'static str {
        "discard"
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn publish(&mut self, _frame: &Frame) -> Result<()> {
        self.frames += 1;
        Ok(())
    }
}
