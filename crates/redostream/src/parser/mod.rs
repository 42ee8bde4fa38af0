//! The parser: consumes decoded redo batches, accumulates records per
//! transaction, and replays committed transactions through the builder.
//!
//! Redo arrives in write order, not commit order. Nothing is emitted
//! until COMMIT; ROLLBACK discards the buffered transaction without a
//! trace. Large objects are reassembled at replay time from the LOB index
//! and data records buffered alongside the row changes.

use crate::builder::format::{CharFormat, UnknownFormat};
use crate::builder::{Builder, ResolvedColumn, RowEvent};
use crate::common::ctx::{flags, trace as trace_bits};
use crate::common::{Ctx, Error, LobId, Result, Scn, Xid};
use crate::metadata::checkpoint::Checkpoint;
use crate::metadata::schema::{options as table_options, ColumnDef, TableDef};
use crate::metadata::{Metadata, OpenXid, ReplayPosition};
use crate::reader::{
    ColumnChange, ColumnValue, LobCharset, RedoBatch, RedoPayload, RedoReader, RedoRecord,
};
use crate::txbuf::{RecordKey, TxBuf};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Opcodes used for records stored in the transaction buffer.
mod opcode {
    pub const DML: u16 = 2;
    pub const DDL: u16 = 5;
    pub const LOB_INDEX: u16 = 6;
    pub const LOB_DATA: u16 = 7;
}

/// Debug stop counters (`source.debug`); zero disables a counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugStops {
    pub log_switches: u64,
    pub checkpoints: u64,
    pub transactions: u64,
}

struct OpenTx {
    buf: TxBuf,
    attributes: Vec<(String, String)>,
}

/// The parser worker. One per source; drives the builder inline.
pub struct Parser {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    builder: Builder,
    reader: Box<dyn RedoReader>,
    checkpoint: Option<Arc<Checkpoint>>,

    skip_xids: HashSet<Xid>,
    dump_xids: HashSet<Xid>,
    /// Transactions being dropped because of `skip-xid`.
    skipped: HashSet<Xid>,
    transactions: HashMap<Xid, OpenTx>,

    /// Committed transactions at or below this SCN were already confirmed
    /// before the checkpoint this run resumed from.
    resume_scn: Scn,
    stops: DebugStops,
    /// Buffered-size cap per transaction; zero disables.
    transaction_max_bytes: u64,
    committed: u64,
    log_switches: u64,
    current_sequence: Option<u32>,
}

impl Parser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        builder: Builder,
        reader: Box<dyn RedoReader>,
        checkpoint: Option<Arc<Checkpoint>>,
        skip_xids: HashSet<Xid>,
        dump_xids: HashSet<Xid>,
        resume_scn: Scn,
        stops: DebugStops,
    ) -> Parser {
        Parser {
            ctx,
            metadata,
            builder,
            reader,
            checkpoint,
            skip_xids,
            dump_xids,
            skipped: HashSet::new(),
            transactions: HashMap::new(),
            resume_scn,
            stops,
            transaction_max_bytes: 0,
            committed: 0,
            log_switches: 0,
            current_sequence: None,
        }
    }

    /// Cap the buffered size of a single transaction (`transaction-max-mb`).
    /// Oversized transactions are dropped with a warning, like `skip-xid`.
    pub fn set_transaction_max_bytes(&mut self, bytes: u64) {
        self.transaction_max_bytes = bytes;
    }

    /// Worker entry point: consume batches until end of stream or
    /// shutdown.
    pub fn run(&mut self) -> Result<()> {
        debug!("parser start");
        loop {
            if self.ctx.shutdown.is_hard() || self.ctx.shutdown.is_soft() {
                break;
            }
            match self.reader.next_batch() {
                Ok(Some(batch)) => self.process_batch(batch)?,
                Ok(None) => {
                    info!("end of redo stream");
                    break;
                }
                Err(Error::Shutdown) => break,
                Err(err) => return Err(err),
            }
        }
        debug!(
            open = self.transactions.len(),
            committed = self.committed,
            "parser stop"
        );
        Ok(())
    }

    pub fn process_batch(&mut self, batch: RedoBatch) -> Result<()> {
        if self.ctx.dump_redo_log() >= 1 {
            debug!(
                sequence = batch.sequence,
                offset = batch.block_offset,
                lwn_scn = batch.lwn_scn.0,
                records = batch.records.len(),
                "redo batch"
            );
        }

        // Log switch: new sequence.
        if let Some(previous) = self.current_sequence {
            if batch.sequence != previous {
                info!(sequence = batch.sequence, "log switch");
                self.log_switches += 1;
                if let Some(checkpoint) = &self.checkpoint {
                    checkpoint.request();
                }
                if self.stops.log_switches > 0 && self.log_switches >= self.stops.log_switches
                {
                    info!("shutdown after reaching the configured log switch count");
                    self.ctx.stop_soft();
                }
            }
        }
        self.current_sequence = Some(batch.sequence);
        self.builder.set_lwn(batch.lwn_scn, batch.sequence);

        let position = ReplayPosition {
            sequence: batch.sequence,
            block_offset: batch.block_offset,
            scn: batch.lwn_scn,
        };
        for record in batch.records {
            self.process_record(record, position)?;
        }
        // The stored position points past the applied log write, so a
        // clean restart does not re-read it.
        self.metadata.set_position(ReplayPosition {
            block_offset: batch.block_offset + 1,
            ..position
        });
        Ok(())
    }

    fn process_record(&mut self, record: RedoRecord, position: ReplayPosition) -> Result<()> {
        if self.ctx.dump_redo_log() >= 2 || self.ctx.trace_enabled(trace_bits::DML) {
            debug!(scn = record.scn.0, xid = %record.xid, "redo record: {:?}", record.payload);
        }
        let xid = record.xid;
        if self.skipped.contains(&xid) {
            if matches!(record.payload, RedoPayload::Commit { .. } | RedoPayload::Rollback) {
                self.skipped.remove(&xid);
            }
            return Ok(());
        }

        match record.payload {
            RedoPayload::Begin { ref attributes } => {
                if self.skip_xids.contains(&xid) {
                    info!(xid = %xid, "transaction skipped by configuration");
                    self.skipped.insert(xid);
                    return Ok(());
                }
                let attributes = attributes.clone();
                self.open_transaction(xid, record.scn, position, attributes);
            }
            RedoPayload::Commit { timestamp } => {
                self.commit_transaction(xid, record.scn, timestamp)?;
            }
            RedoPayload::Rollback => {
                if let Some(tx) = self.transactions.remove(&xid) {
                    trace!(xid = %xid, records = tx.buf.record_count(), "rollback");
                    tx.buf.release(&self.ctx)?;
                }
                self.metadata.note_closed_xid(xid);
            }
            RedoPayload::Undo => {
                if let Some(tx) = self.transactions.get_mut(&xid) {
                    tx.buf.undo_last(&self.ctx)?;
                }
            }
            ref payload @ (RedoPayload::Dml { .. }
            | RedoPayload::Ddl { .. }
            | RedoPayload::LobIndex { .. }
            | RedoPayload::LobData { .. }) => {
                let opcode = match payload {
                    RedoPayload::Dml { .. } => opcode::DML,
                    RedoPayload::Ddl { .. } => opcode::DDL,
                    RedoPayload::LobIndex { .. } => opcode::LOB_INDEX,
                    RedoPayload::LobData { .. } => opcode::LOB_DATA,
                    _ => unreachable!(),
                };
                let body = serde_json::to_vec(payload)?;

                if !self.transactions.contains_key(&xid) {
                    // A transaction already in flight at the resume point
                    // has no BEGIN in the replayed range.
                    self.open_transaction(xid, record.scn, position, Vec::new());
                }
                let key = RecordKey {
                    scn: record.scn,
                    sequence: position.sequence,
                    subscn: record.subscn,
                    offset: record.offset,
                };
                let tx = self.transactions.get_mut(&xid).expect("opened above");
                tx.buf.append(&self.ctx, key, opcode, &body)?;

                if self.transaction_max_bytes > 0
                    && tx.buf.size_bytes() > self.transaction_max_bytes
                {
                    warn!(
                        xid = %xid,
                        size = tx.buf.size_bytes(),
                        "transaction exceeds 'transaction-max-mb', dropped"
                    );
                    let tx = self.transactions.remove(&xid).expect("present above");
                    tx.buf.release(&self.ctx)?;
                    self.metadata.note_closed_xid(xid);
                    self.skipped.insert(xid);
                }
            }
        }
        Ok(())
    }

    fn open_transaction(
        &mut self,
        xid: Xid,
        scn: Scn,
        position: ReplayPosition,
        attributes: Vec<(String, String)>,
    ) {
        let dump = self.dump_xids.contains(&xid);
        let buf = TxBuf::new(&self.ctx, xid, scn, dump);
        self.transactions.insert(xid, OpenTx { buf, attributes });
        self.metadata.note_open_xid(OpenXid {
            xid,
            first_scn: scn,
            first_sequence: position.sequence,
            first_offset: position.block_offset,
        });
        trace!(xid = %xid, scn = scn.0, "transaction open");
    }

    /// Replay a committed transaction through the builder, then release
    /// its buffers.
    fn commit_transaction(&mut self, xid: Xid, commit_scn: Scn, timestamp: i64) -> Result<()> {
        let Some(tx) = self.transactions.remove(&xid) else {
            return Ok(());
        };

        // Already confirmed before the checkpoint this run resumed from.
        if commit_scn < self.resume_scn {
            trace!(xid = %xid, scn = commit_scn.0, "commit below resume point, dropped");
            tx.buf.release(&self.ctx)?;
            self.metadata.note_closed_xid(xid);
            return Ok(());
        }

        // First pass: collect the LOB page maps.
        let mut lobs = LobAssembly::default();
        tx.buf.for_each(&self.ctx, |rec| {
            if rec.opcode == opcode::LOB_INDEX || rec.opcode == opcode::LOB_DATA {
                let payload: RedoPayload = serde_json::from_slice(rec.payload)?;
                lobs.absorb(payload);
            }
            Ok(())
        })?;

        // Second pass: emit rows and DDL in append order.
        self.builder.begin_tx(xid, commit_scn, timestamp, tx.attributes.clone())?;
        let mut debug_table_hit = false;
        let mut emit_error = None;
        {
            let builder = &mut self.builder;
            let metadata = &self.metadata;
            let ctx = &self.ctx;
            let resolver = ValueResolver {
                char_format: builder_char_format(builder),
                unknown: builder_unknown_format(builder),
                lobs: &lobs,
                xid,
            };
            tx.buf.for_each(ctx, |rec| {
                let result = (|| -> Result<()> {
                    match rec.opcode {
                        opcode::DML => {
                            let payload: RedoPayload = serde_json::from_slice(rec.payload)?;
                            let RedoPayload::Dml { kind, obj, rid, columns } = payload else {
                                return Err(Error::redo(
                                    50074,
                                    format!("opcode/payload mismatch in buffer, xid: {xid}"),
                                ));
                            };
                            match lookup_table(ctx, metadata, obj, &columns) {
                                TableLookup::Found(table) => {
                                    if table.options & table_options::DEBUG_TABLE != 0 {
                                        debug_table_hit = true;
                                    }
                                }
                                TableLookup::Schemaless => {}
                                TableLookup::Filtered => return Ok(()),
                            }
                            let columns = columns
                                .iter()
                                .map(|c| resolver.resolve(c))
                                .collect::<Vec<_>>();
                            builder.row(RowEvent {
                                kind,
                                obj,
                                scn: rec.key.scn,
                                rid,
                                columns,
                            })
                        }
                        opcode::DDL => {
                            let payload: RedoPayload = serde_json::from_slice(rec.payload)?;
                            let RedoPayload::Ddl { obj, statement } = payload else {
                                return Err(Error::redo(
                                    50074,
                                    format!("opcode/payload mismatch in buffer, xid: {xid}"),
                                ));
                            };
                            builder.ddl(obj, &statement, rec.key.scn)
                        }
                        _ => Ok(()),
                    }
                })();
                // Remember the first fatal error but finish iteration so
                // the buffers are released consistently.
                if let Err(err) = result {
                    if emit_error.is_none() {
                        emit_error = Some(err);
                    }
                }
                Ok(())
            })?;
        }
        if let Some(err) = emit_error {
            return Err(err);
        }
        self.builder.commit_tx()?;

        tx.buf.release(&self.ctx)?;
        self.metadata.note_closed_xid(xid);
        self.committed += 1;

        if debug_table_hit {
            info!("shutdown after committed DML in the configured debug table");
            self.ctx.stop_soft();
        }
        if self.stops.transactions > 0 && self.committed >= self.stops.transactions {
            info!("shutdown after reaching the configured transaction count");
            self.ctx.stop_soft();
        }
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.wake();
        }
        Ok(())
    }
}

enum TableLookup {
    Found(Arc<crate::metadata::schema::CapturedTable>),
    Schemaless,
    Filtered,
}

/// Resolve the schema entry for an object, honoring the schemaless and
/// adaptive-schema flags.
fn lookup_table(
    ctx: &Ctx,
    metadata: &Metadata,
    obj: u32,
    columns: &[ColumnChange],
) -> TableLookup {
    if ctx.flag_set(flags::SCHEMALESS) {
        return TableLookup::Schemaless;
    }
    if let Some(table) = metadata.schema().get(obj) {
        return TableLookup::Found(table);
    }
    if ctx.flag_set(flags::ADAPTIVE_SCHEMA) {
        let def = TableDef {
            obj,
            owner: "UNKNOWN".to_string(),
            name: format!("OBJ{obj}"),
            columns: columns
                .iter()
                .map(|c| ColumnDef { name: c.name.clone(), key: false })
                .collect(),
        };
        info!(obj, "adaptive schema synthesized for unknown object");
        metadata.adopt_table(def);
        let table = metadata.schema().get(obj).expect("adopted above");
        return TableLookup::Found(table);
    }
    TableLookup::Filtered
}

fn builder_char_format(builder: &Builder) -> CharFormat {
    builder.options_char_format()
}

fn builder_unknown_format(builder: &Builder) -> UnknownFormat {
    builder.options_unknown_format()
}

/// LOB page maps for one transaction, built in the first replay pass.
#[derive(Default)]
struct LobAssembly {
    /// LobId → (charset, pages in page order).
    index: HashMap<LobId, (LobCharset, Vec<(u32, u64)>)>,
    /// DBA → page bytes.
    data: HashMap<u64, Vec<u8>>,
}

impl LobAssembly {
    fn absorb(&mut self, payload: RedoPayload) {
        match payload {
            RedoPayload::LobIndex { lob, charset, mut pages, .. } => {
                pages.sort_by_key(|&(page_no, _)| page_no);
                self.index.insert(lob, (charset, pages));
            }
            RedoPayload::LobData { dba, bytes } => {
                self.data.insert(dba, bytes);
            }
            _ => {}
        }
    }

    /// Concatenate the referenced pages. `None` when the index or any
    /// page is missing.
    fn assemble(&self, lob: LobId) -> Option<(LobCharset, Vec<u8>)> {
        let (charset, pages) = self.index.get(&lob)?;
        let mut bytes = Vec::new();
        for &(_page_no, dba) in pages {
            bytes.extend_from_slice(self.data.get(&dba)?);
        }
        Some((*charset, bytes))
    }
}

/// Turns decoded column values into JSON values, applying the character
/// policy and the unknown policy.
struct ValueResolver<'a> {
    char_format: CharFormat,
    unknown: UnknownFormat,
    lobs: &'a LobAssembly,
    xid: Xid,
}

impl ValueResolver<'_> {
    fn resolve(&self, change: &ColumnChange) -> ResolvedColumn {
        ResolvedColumn {
            name: change.name.clone(),
            before: change.before.as_ref().map(|v| self.value(&change.name, v)),
            after: change.after.as_ref().map(|v| self.value(&change.name, v)),
        }
    }

    fn value(&self, column: &str, value: &ColumnValue) -> Value {
        match value {
            ColumnValue::Null => Value::Null,
            ColumnValue::String(text) => match self.char_format {
                CharFormat::Hex => Value::String(hex(text.as_bytes())),
                _ => Value::String(text.clone()),
            },
            ColumnValue::Number(text) => match text.parse::<serde_json::Number>() {
                Ok(number) => Value::Number(number),
                Err(_) => self.unknown_value(column, text.as_bytes()),
            },
            ColumnValue::Raw(bytes) => Value::String(hex(bytes)),
            ColumnValue::Lob(lob) => match self.lobs.assemble(*lob) {
                Some((charset, bytes)) => self.lob_value(column, charset, bytes),
                None => {
                    warn!(
                        xid = %self.xid,
                        lob = %lob,
                        column,
                        "incomplete LOB, column marked unknown [60003]"
                    );
                    self.unknown_value(column, &[])
                }
            },
        }
    }

    fn lob_value(&self, column: &str, charset: LobCharset, bytes: Vec<u8>) -> Value {
        if self.char_format == CharFormat::Hex || charset == LobCharset::Binary {
            return Value::String(hex(&bytes));
        }
        let decoded = match charset {
            LobCharset::Utf8 => String::from_utf8(bytes).ok(),
            LobCharset::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
            LobCharset::Binary => unreachable!(),
        };
        match decoded {
            Some(text) => Value::String(text),
            None => self.unknown_value(column, &[]),
        }
    }

    fn unknown_value(&self, column: &str, raw: &[u8]) -> Value {
        if self.unknown == UnknownFormat::Dump && !raw.is_empty() {
            warn!(column, raw = %hex(raw), "unknown value [60002]");
        }
        Value::String("?".to_string())
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
