//! Redo input.
//!
//! The physical log reader and the database-specific opcode decoder are
//! external collaborators; what the engine consumes is their output: a
//! stream of decoded, write-ordered redo records grouped by log write.
//! This module defines that record model, the [`RedoReader`] trait the
//! collaborators implement, and two implementations: a batch reader over
//! neutral redo files and an in-memory reader used by tests.

use crate::common::ctx::ShutdownState;
use crate::common::{Error, LobId, Result, Scn, Xid};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    String(String),
    /// Exact decimal rendering of a numeric column.
    Number(String),
    Raw(Vec<u8>),
    /// Reference to a large object reassembled from LOB pages.
    Lob(LobId),
}

/// Before/after images of one column within a DML record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<ColumnValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<ColumnValue>,
}

/// Row-level DML kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmlOp {
    Insert,
    Update,
    Delete,
}

/// Character set a character LOB was captured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LobCharset {
    /// Binary LOB, no character decoding.
    #[default]
    Binary,
    Utf8,
    Latin1,
}

/// Decoded redo operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum RedoPayload {
    Begin {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attributes: Vec<(String, String)>,
    },
    Dml {
        kind: DmlOp,
        obj: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rid: Option<String>,
        columns: Vec<ColumnChange>,
    },
    /// LOB locator index: the ordered page map of one large object.
    LobIndex {
        lob: LobId,
        obj: u32,
        charset: LobCharset,
        /// `(page_no, dba)` pairs in page order.
        pages: Vec<(u32, u64)>,
    },
    /// One LOB data page.
    LobData { dba: u64, bytes: Vec<u8> },
    Ddl { obj: u32, statement: String },
    /// Undo of the transaction's most recent DML (partial rollback).
    Undo,
    Commit {
        /// Commit time, Unix epoch seconds.
        #[serde(default)]
        timestamp: i64,
    },
    Rollback,
}

/// One decoded redo record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedoRecord {
    pub scn: Scn,
    pub subscn: u16,
    /// Record offset within its redo block.
    pub offset: u16,
    pub xid: Xid,
    #[serde(flatten)]
    pub payload: RedoPayload,
}

/// Records carried by one log write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedoBatch {
    /// Redo log sequence the batch belongs to.
    pub sequence: u32,
    /// Block offset of the log write within the sequence.
    pub block_offset: u64,
    /// SCN of the log write (secondary ordering key).
    pub lwn_scn: Scn,
    pub records: Vec<RedoRecord>,
}

/// Source of decoded redo batches, in write order.
pub trait RedoReader: Send {
    /// The next log write, or `None` at end of stream (batch mode only;
    /// online readers block until shutdown).
    fn next_batch(&mut self) -> Result<Option<RedoBatch>>;
}

/// Reader over neutral redo files: `<dir>/<name>-<sequence>.redo`, one
/// JSON batch per line.
///
/// When the next sequence is not present yet the fetch is retried a
/// bounded number of times before the stream is considered complete.
pub struct BatchReader {
    dir: PathBuf,
    name: String,
    sequence: u32,
    resume_offset: u64,
    current: Option<std::io::Lines<std::io::BufReader<std::fs::File>>>,
    read_tries: u32,
    read_sleep: Duration,
    shutdown: Option<Arc<ShutdownState>>,
}

impl BatchReader {
    pub fn new(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        start_sequence: u32,
        resume_offset: u64,
        read_tries: u32,
        read_sleep: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            sequence: start_sequence,
            resume_offset,
            current: None,
            read_tries,
            read_sleep,
            shutdown: None,
        }
    }

    /// Make the bounded fetch-retry loop observe shutdown.
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownState>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn sequence_path(&self, sequence: u32) -> PathBuf {
        self.dir.join(format!("{}-{:09}.redo", self.name, sequence))
    }

    fn open_next(&mut self) -> Result<bool> {
        let path = self.sequence_path(self.sequence);
        let mut tries = 0;
        loop {
            match std::fs::File::open(&path) {
                Ok(file) => {
                    info!(sequence = self.sequence, file = %path.display(), "redo log opened");
                    self.current = Some(std::io::BufReader::new(file).lines());
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tries += 1;
                    if tries >= self.read_tries {
                        debug!(sequence = self.sequence, "no further redo logs");
                        return Ok(false);
                    }
                    if let Some(shutdown) = &self.shutdown {
                        if shutdown.is_soft() || shutdown.is_hard() {
                            return Ok(false);
                        }
                    }
                    std::thread::sleep(self.read_sleep);
                }
                Err(e) => {
                    return Err(Error::io(10001, format!("file: {}", path.display()), e))
                }
            }
        }
    }
}

impl RedoReader for BatchReader {
    fn next_batch(&mut self) -> Result<Option<RedoBatch>> {
        loop {
            if self.current.is_none() && !self.open_next()? {
                return Ok(None);
            }

            let lines = self.current.as_mut().expect("opened above");
            match lines.next() {
                Some(line) => {
                    let line = line.map_err(|e| {
                        Error::io(10005, format!("sequence: {}", self.sequence), e)
                    })?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let batch: RedoBatch = serde_json::from_str(&line)?;
                    if batch.sequence == self.sequence && batch.block_offset < self.resume_offset
                    {
                        // Below the checkpointed resume position.
                        continue;
                    }
                    return Ok(Some(batch));
                }
                None => {
                    self.current = None;
                    self.sequence += 1;
                    self.resume_offset = 0;
                }
            }
        }
    }
}

/// In-memory reader fed by a channel; used by tests and embedded setups.
pub struct ChannelReader {
    rx: crossbeam_channel::Receiver<RedoBatch>,
    shutdown: Option<Arc<ShutdownState>>,
}

impl ChannelReader {
    /// Build a reader plus the sending half that feeds it. Dropping the
    /// sender ends the stream.
    pub fn new() -> (crossbeam_channel::Sender<RedoBatch>, ChannelReader) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (tx, ChannelReader { rx, shutdown: None })
    }

    /// Make the blocking receive observe shutdown.
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownState>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl RedoReader for ChannelReader {
    fn next_batch(&mut self) -> Result<Option<RedoBatch>> {
        loop {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(batch) => return Ok(Some(batch)),
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Ok(None),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if let Some(shutdown) = &self.shutdown {
                        if shutdown.is_soft() || shutdown.is_hard() {
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }
}
