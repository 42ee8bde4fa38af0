//! The builder: turns committed transactions into sink-facing frames.
//!
//! The parser replays a transaction's records through this module at
//! COMMIT, in append order. Each record becomes one ring frame, or the
//! whole transaction becomes a single aggregate frame under MSG_FULL.
//!
//! Per-transaction state machine:
//!
//! ```text
//! IDLE --begin--> OPEN --row/ddl--> OPEN --commit--> IDLE
//!                 OPEN --rollback-> IDLE   (never emits)
//! ```

pub mod format;
pub mod json;
pub mod protobuf;

use crate::common::{Ctx, Error, Result, Scn, Xid};
use crate::metadata::Metadata;
use crate::reader::DmlOp;
use crate::ring::{frame_flags, RingProducer};
use format::{ColumnFormat, FormatOptions};
use json::{FrameMeta, JsonEncoder};
use protobuf::PbEncoder;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Sink serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Protobuf,
}

/// A column with its values resolved to JSON (LOBs reassembled, character
/// data decoded, unknowns marked).
#[derive(Debug, Clone)]
pub struct ResolvedColumn {
    pub name: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// A row change ready for emission.
#[derive(Debug, Clone)]
pub struct RowEvent {
    pub kind: DmlOp,
    pub obj: u32,
    pub scn: Scn,
    pub rid: Option<String>,
    pub columns: Vec<ResolvedColumn>,
}

enum TxState {
    Idle,
    Open {
        xid: Xid,
        commit_scn: Scn,
        timestamp: i64,
        attributes: Vec<(String, String)>,
        /// Frame index within the transaction.
        idx: u64,
        /// Buffered payload entries under MSG_FULL.
        full_payload: Vec<Value>,
        last_id: Option<u64>,
    },
}

/// The builder. One per source, driven from the parser thread.
pub struct Builder {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    producer: RingProducer,
    options: FormatOptions,
    output: OutputFormat,
    json: JsonEncoder,
    pb: PbEncoder,
    state: TxState,
    lwn_scn: Scn,
    lwn_idx: u32,
    sequence: u32,
    /// Objects whose schema block has been emitted at least once.
    schema_sent: HashSet<u32>,
}

impl Builder {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        producer: RingProducer,
        options: FormatOptions,
        output: OutputFormat,
    ) -> Builder {
        let database = metadata.database.clone();
        Builder {
            ctx,
            metadata,
            producer,
            json: JsonEncoder::new(options.clone(), database.clone()),
            pb: PbEncoder::new(options.clone(), database),
            options,
            output,
            state: TxState::Idle,
            lwn_scn: Scn::ZERO,
            lwn_idx: 0,
            sequence: 0,
            schema_sent: HashSet::new(),
        }
    }

    /// Seed the ring message id when resuming from a checkpoint.
    pub fn resume_from(&mut self, next_message_id: u64) {
        self.producer.set_next_message_id(next_message_id);
    }

    /// Note the log write the following frames originate from.
    pub fn set_lwn(&mut self, lwn_scn: Scn, sequence: u32) {
        if lwn_scn != self.lwn_scn || sequence != self.sequence {
            self.lwn_scn = lwn_scn;
            self.sequence = sequence;
            self.lwn_idx = 0;
        }
    }

    /// Highest confirmed ring message id (writer side), for checkpoints.
    pub fn confirmed_id(&self) -> u64 {
        self.producer.confirmed_id()
    }

    /// Open a transaction; commit SCN and timestamp are known because the
    /// parser replays only committed transactions.
    pub fn begin_tx(
        &mut self,
        xid: Xid,
        commit_scn: Scn,
        timestamp: i64,
        attributes: Vec<(String, String)>,
    ) -> Result<()> {
        if !matches!(self.state, TxState::Idle) {
            return Err(Error::redo(50040, format!("builder begin while open, xid: {xid}")));
        }

        let mut full_payload = Vec::new();
        let mut idx = 0u64;
        let mut last_id = None;

        if self.options.msg_full() {
            full_payload.push(self.json.begin_payload());
        } else if !self.options.msg_skip_begin() {
            let meta = FrameMeta {
                commit_scn,
                record_scn: commit_scn,
                commit_idx: idx,
                timestamp,
                xid,
            };
            let attrs = self.frame_attributes(format::attributes_flags::BEGIN, &attributes);
            let id = self.emit(
                &meta,
                attrs.as_deref(),
                vec![self.json.begin_payload()],
                0,
                false,
            )?;
            last_id = Some(id);
            idx += 1;
        }

        self.state = TxState::Open {
            xid,
            commit_scn,
            timestamp,
            attributes,
            idx,
            full_payload,
            last_id,
        };
        Ok(())
    }

    /// Emit one row change.
    pub fn row(&mut self, event: RowEvent) -> Result<()> {
        let schema_block = self.schema_block_for(event.obj);
        let (before, after) = self.select_columns(&event);
        let op = match event.kind {
            DmlOp::Insert => "c",
            DmlOp::Update => "u",
            DmlOp::Delete => "d",
        };

        let TxState::Open { xid, commit_scn, timestamp, attributes, idx, full_payload, last_id } =
            &mut self.state
        else {
            return Err(Error::redo(50041, "builder row without an open transaction"));
        };

        let payload = self.json.dml_payload(
            op,
            schema_block,
            event.rid.as_deref(),
            before,
            after,
            *idx,
        );

        if self.options.msg_full() {
            full_payload.push(payload);
            *idx += 1;
            return Ok(());
        }

        let meta = FrameMeta {
            commit_scn: *commit_scn,
            record_scn: event.scn,
            commit_idx: *idx,
            timestamp: *timestamp,
            xid: *xid,
        };
        let attributes = attributes.clone();
        let attrs = self.frame_attributes(format::attributes_flags::DML, &attributes);
        let id = self.emit(&meta, attrs.as_deref(), vec![payload], event.obj, false)?;

        let TxState::Open { idx, last_id, .. } = &mut self.state else { unreachable!() };
        *last_id = Some(id);
        *idx += 1;
        Ok(())
    }

    /// Emit a DDL statement frame.
    pub fn ddl(&mut self, obj: u32, statement: &str, scn: Scn) -> Result<()> {
        let schema_block = self.schema_block_for(obj);
        let payload = self.json.ddl_payload(schema_block, statement);

        let TxState::Open { xid, commit_scn, timestamp, idx, full_payload, .. } =
            &mut self.state
        else {
            return Err(Error::redo(50041, "builder ddl without an open transaction"));
        };

        if self.options.msg_full() {
            full_payload.push(payload);
            *idx += 1;
            return Ok(());
        }

        let meta = FrameMeta {
            commit_scn: *commit_scn,
            record_scn: scn,
            commit_idx: *idx,
            timestamp: *timestamp,
            xid: *xid,
        };
        let id = self.emit(&meta, None, vec![payload], obj, false)?;

        let TxState::Open { idx, last_id, .. } = &mut self.state else { unreachable!() };
        *last_id = Some(id);
        *idx += 1;
        Ok(())
    }

    /// Close the transaction, emitting the COMMIT frame (or the aggregate
    /// MSG_FULL frame). Returns the last emitted message id, if any frame
    /// was emitted.
    pub fn commit_tx(&mut self) -> Result<Option<u64>> {
        let state = std::mem::replace(&mut self.state, TxState::Idle);
        let TxState::Open { xid, commit_scn, timestamp, attributes, idx, mut full_payload, last_id } =
            state
        else {
            return Err(Error::redo(50042, "builder commit without an open transaction"));
        };

        if self.options.msg_full() {
            full_payload.push(self.json.commit_payload());
            let meta = FrameMeta {
                commit_scn,
                record_scn: commit_scn,
                commit_idx: 0,
                timestamp,
                xid,
            };
            let attrs = self.frame_attributes(
                format::attributes_flags::BEGIN | format::attributes_flags::COMMIT,
                &attributes,
            );
            let id = self.emit(&meta, attrs.as_deref(), full_payload, 0, true)?;
            trace!(xid = %xid, id, "transaction emitted as aggregate frame");
            return Ok(Some(id));
        }

        if self.options.msg_skip_commit() {
            return Ok(last_id);
        }

        let meta = FrameMeta {
            commit_scn,
            record_scn: commit_scn,
            commit_idx: idx,
            timestamp,
            xid,
        };
        let attrs = self.frame_attributes(format::attributes_flags::COMMIT, &attributes);
        let id =
            self.emit(&meta, attrs.as_deref(), vec![self.json.commit_payload()], 0, true)?;
        Ok(Some(id))
    }

    /// Abandon the open transaction without emitting anything.
    ///
    /// Frames already committed to the ring stay there (rollbacks are
    /// detected before replay starts, so this only discards buffered
    /// MSG_FULL state).
    pub fn rollback_tx(&mut self) {
        self.state = TxState::Idle;
    }

    // ------------------------------------------------------------------

    fn frame_attributes(
        &self,
        wanted: u8,
        attributes: &[(String, String)],
    ) -> Option<Vec<(String, String)>> {
        if self.options.attributes & wanted != 0 && !attributes.is_empty() {
            Some(attributes.to_vec())
        } else {
            None
        }
    }

    fn schema_block_for(&mut self, obj: u32) -> Option<Value> {
        let schema = self.metadata.schema();
        let table = schema.get(obj)?;
        if !self.options.schema_repeated() && !self.schema_sent.insert(obj) {
            return None;
        }
        let columns: Vec<(String, bool)> = table
            .def
            .columns
            .iter()
            .map(|c| (c.name.clone(), table.is_key_column(&c.name)))
            .collect();
        Some(self.json.schema_block(
            &table.def.owner,
            &table.def.name,
            obj,
            Some(&columns),
        ))
    }

    /// Apply the column-selection policy to a row event.
    fn select_columns(
        &self,
        event: &RowEvent,
    ) -> (Option<Map<String, Value>>, Option<Map<String, Value>>) {
        let mut before = Map::new();
        let mut after = Map::new();
        for column in &event.columns {
            if let Some(value) = &column.before {
                before.insert(column.name.clone(), value.clone());
            }
            if let Some(value) = &column.after {
                after.insert(column.name.clone(), value.clone());
            }
        }

        // Full modes pad missing columns with nulls from the schema.
        let pad = match (self.options.column, event.kind) {
            (ColumnFormat::Changed, _) => false,
            (ColumnFormat::FullInsDec, DmlOp::Insert | DmlOp::Delete) => true,
            (ColumnFormat::FullInsDec, DmlOp::Update) => false,
            (ColumnFormat::FullUpd, _) => true,
        };
        if pad {
            if let Some(table) = self.metadata.schema().get(event.obj) {
                for column in &table.def.columns {
                    match event.kind {
                        DmlOp::Insert => {
                            after.entry(column.name.clone()).or_insert(Value::Null);
                        }
                        DmlOp::Delete => {
                            before.entry(column.name.clone()).or_insert(Value::Null);
                        }
                        DmlOp::Update => {
                            before.entry(column.name.clone()).or_insert(Value::Null);
                            after.entry(column.name.clone()).or_insert(Value::Null);
                        }
                    }
                }
            }
        }

        let before = match event.kind {
            DmlOp::Insert => None,
            _ if before.is_empty() => None,
            _ => Some(before),
        };
        let after = match event.kind {
            DmlOp::Delete => None,
            _ if after.is_empty() => None,
            _ => Some(after),
        };
        (before, after)
    }

    fn emit(
        &mut self,
        meta: &FrameMeta,
        attributes: Option<&[(String, String)]>,
        payload: Vec<Value>,
        obj: u32,
        checkpoint: bool,
    ) -> Result<u64> {
        if self.ctx.shutdown.is_hard() {
            return Err(Error::Shutdown);
        }
        let bytes = match self.output {
            OutputFormat::Json => {
                let frame = self.json.envelope(meta, attributes, payload);
                self.json.to_bytes(&frame)?
            }
            OutputFormat::Protobuf => self.pb.encode(meta, attributes, &payload)?,
        };

        let flags = if checkpoint { frame_flags::CHECKPOINT } else { 0 };
        self.producer.begin(
            meta.commit_scn,
            self.lwn_scn,
            self.lwn_idx,
            self.sequence,
            obj,
            flags,
        )?;
        self.lwn_idx += 1;
        self.producer.append(&bytes)?;
        self.producer.commit()
    }
}

impl Builder {
    /// Character-column policy, used by the parser's value resolution.
    pub fn options_char_format(&self) -> format::CharFormat {
        self.options.char_format
    }

    /// Unknown-value policy, used by the parser's value resolution.
    pub fn options_unknown_format(&self) -> format::UnknownFormat {
        self.options.unknown
    }
}
