//! The supervisor: builds the pipeline from configuration, spawns the
//! named workers, and coordinates shutdown.
//!
//! Soft shutdown lets the parser finish its batch, drains the ring
//! through the writer, and writes a final checkpoint. Hard shutdown
//! broadcasts every condvar so blocked allocators and waiters return
//! immediately.

use crate::builder::Builder;
use crate::common::ctx::flags;
use crate::common::{Ctx, Error, Result, Scn};
use crate::config::{Config, ConfigHandle, SourceConfig};
use crate::memory::MemoryManager;
use crate::metadata::checkpoint::{Checkpoint, CheckpointRecord};
use crate::metadata::schema::{options as table_options, SchemaElement, TableDef};
use crate::metadata::state::StateDisk;
use crate::metadata::{Metadata, ReplayPosition};
use crate::parser::Parser;
use crate::reader::{BatchReader, RedoReader};
use crate::ring::ring;
use crate::writer::{DiscardSink, FileSink, NetworkSink, RetryPolicy, Sink, Writer};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

type Fault = (&'static str, Error);

/// The assembled pipeline, ready to run.
pub struct Supervisor {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    checkpoint: Arc<Checkpoint>,
    parser: Option<Parser>,
    writer: Option<Writer>,
    faults: (Sender<Fault>, Receiver<Fault>),
}

impl Supervisor {
    /// Build every component from a validated configuration.
    pub fn new(handle: &ConfigHandle) -> Result<Supervisor> {
        let config = &handle.config;
        let source = config.source();
        let target = config.target();

        let ctx = Ctx::new(
            source.memory.to_arena_config(),
            PathBuf::from(&source.memory.swap_path),
            config.trace,
            source.flags,
            config.dump_redo_log,
        )?;

        let metadata = Metadata::new(
            source.name.clone(),
            StateDisk::new(&source.state.path, &source.name, source.state.keep_checkpoints),
        );

        // The schema text cache seeds the catalog when present.
        if let Some(body) = metadata.state().read_script()? {
            let tables: Vec<TableDef> = serde_json::from_str(&body)?;
            info!(tables = tables.len(), "schema catalog loaded from cache");
            metadata.set_catalog(tables);
        }
        apply_filter(source, &metadata, false)?;

        // Resume point.
        let mut resume_scn = Scn(source.reader.start_scn.unwrap_or(0));
        let mut next_message_id = 0u64;
        let mut start_sequence = source.reader.start_seq.unwrap_or(1);
        let mut start_offset = 0u64;
        if let Some(body) = metadata.state().read_current()? {
            let record = CheckpointRecord::from_json(&body)?;
            info!(
                scn = record.scn.0,
                confirmed = ?record.confirmed_id,
                open = record.open_xids.len(),
                "resuming from checkpoint"
            );
            metadata.set_position(record.resume);
            resume_scn = record.scn;
            next_message_id = record.confirmed_id.map(|id| id + 1).unwrap_or(0);
            start_sequence = record.resume.sequence.max(1);
            start_offset = record.resume.block_offset;
            // Carry the confirmed watermark forward so a quiet restart
            // never regresses the checkpoint.
            if let Some(id) = record.confirmed_id {
                metadata.note_confirmed(id, record.scn, record.confirmed_lwn_scn, 0);
            }
            if let Some(tables) = record.schema {
                metadata.set_catalog(tables);
                apply_filter(source, &metadata, false)?;
            }
        } else {
            metadata.set_position(ReplayPosition {
                sequence: start_sequence,
                block_offset: 0,
                scn: resume_scn,
            });
        }

        let options = source.format.to_options()?;
        let output = source.format.output_format()?;
        let (producer, consumer) = ring(&ctx, options.flush_buffer)?;
        let mut builder = Builder::new(
            Arc::clone(&ctx),
            Arc::clone(&metadata),
            producer,
            options,
            output,
        );
        builder.resume_from(next_message_id);

        // Live reload re-applies the filter section with the user-set
        // invariant enforced.
        let reload_path = handle.path.clone();
        let mut checkpoint_settings = source.state.to_checkpoint_settings();
        if let Some(debug) = &source.debug {
            checkpoint_settings.stop_after = debug.stop_checkpoints;
        }
        let checkpoint = Checkpoint::new(
            Arc::clone(&ctx),
            Arc::clone(&metadata),
            checkpoint_settings,
            handle.path.clone(),
            Box::new(move |metadata| {
                let config = Config::reload(&reload_path)?;
                apply_filter(config.source(), metadata, true)
            }),
        );

        let reader = build_reader(source, &ctx, start_sequence, start_offset)?;
        let (skip_xids, dump_xids) = match &source.filter {
            Some(filter) => (filter.skip_xids(), filter.dump_xids()),
            None => (Default::default(), Default::default()),
        };
        let stops = source.debug.as_ref().map(|d| d.to_stops()).unwrap_or_default();
        let mut parser = Parser::new(
            Arc::clone(&ctx),
            Arc::clone(&metadata),
            builder,
            reader,
            Some(Arc::clone(&checkpoint)),
            skip_xids,
            dump_xids,
            resume_scn,
            stops,
        );
        parser.set_transaction_max_bytes(source.transaction_max_mb * 1024 * 1024);

        let sink = build_sink(config, output)?;
        let writer = Writer::new(
            Arc::clone(&ctx),
            Arc::clone(&metadata),
            consumer,
            sink,
            target.writer.poll_interval().min(Duration::from_millis(100)),
            RetryPolicy::default(),
        );

        Ok(Supervisor {
            ctx,
            metadata,
            checkpoint,
            parser: Some(parser),
            writer: Some(writer),
            faults: unbounded(),
        })
    }

    /// The shared context, for signal wiring.
    pub fn ctx(&self) -> Arc<Ctx> {
        Arc::clone(&self.ctx)
    }

    /// Run the pipeline to completion. Returns the first fatal worker
    /// error, if any.
    pub fn run(mut self) -> Result<()> {
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let mut parser = self.parser.take().expect("parser built");
        let ctx = Arc::clone(&self.ctx);
        handles.push((
            "parser",
            spawn_worker("parser", self.faults.0.clone(), move || {
                let result = parser.run();
                // End of stream or graceful stop: let the writer drain and
                // the checkpoint finalize.
                ctx.shutdown.set_replicator_finished();
                if result.is_ok() {
                    ctx.stop_soft();
                }
                result
            }),
        ));

        let mut writer = self.writer.take().expect("writer built");
        let ctx = Arc::clone(&self.ctx);
        handles.push((
            "writer",
            spawn_worker("writer", self.faults.0.clone(), move || {
                let result = writer.run();
                ctx.shutdown.set_writer_finished();
                result
            }),
        ));

        let manager = MemoryManager::new(Arc::clone(&self.ctx));
        handles.push((
            "memory-manager",
            spawn_worker("memory-manager", self.faults.0.clone(), move || manager.run()),
        ));

        let checkpoint = Arc::clone(&self.checkpoint);
        let ctx = Arc::clone(&self.ctx);
        handles.push((
            "checkpoint",
            spawn_worker("checkpoint", self.faults.0.clone(), move || {
                let result = checkpoint.run();
                ctx.shutdown.set_checkpoint_finished();
                result
            }),
        ));

        // Supervision loop: dump requests, fault routing, completion.
        let mut first_error: Option<Error> = None;
        loop {
            if handles.iter().all(|(_, handle)| handle.is_finished()) {
                break;
            }
            self.ctx.shutdown.wait_main(Duration::from_millis(100));

            if self.ctx.take_status_dump_request() {
                let position = self.metadata.position();
                info!(
                    sequence = position.sequence,
                    offset = position.block_offset,
                    scn = position.scn.0,
                    open_xids = self.metadata.open_xids().len(),
                    confirmed = ?self.metadata.confirmed().id,
                    "status dump"
                );
            }
            if self.ctx.take_memory_dump_request() {
                info!("{}", self.ctx.memory_report());
            }

            while let Ok((worker, err)) = self.faults.1.try_recv() {
                match err.category() {
                    crate::common::error::ErrorCategory::Shutdown => {}
                    crate::common::error::ErrorCategory::Redo => {
                        error!(worker, code = err.code(), "fatal redo error: {err}");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        self.ctx.stop_hard();
                    }
                    _ => {
                        error!(worker, code = err.code(), "worker failed: {err}");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        self.ctx.stop_soft();
                        self.ctx.shutdown.set_replicator_finished();
                    }
                }
            }
        }

        for (worker, handle) in handles {
            if handle.join().is_err() {
                warn!(worker, "worker panicked");
                if first_error.is_none() {
                    first_error =
                        Some(Error::runtime(10018, format!("worker {worker} panicked")));
                }
            }
        }

        // Any fault reported during the final joins.
        while let Ok((worker, err)) = self.faults.1.try_recv() {
            if !matches!(err.category(), crate::common::error::ErrorCategory::Shutdown)
                && first_error.is_none()
            {
                error!(worker, code = err.code(), "worker failed: {err}");
                first_error = Some(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("replication finished");
                Ok(())
            }
        }
    }
}

fn spawn_worker(
    name: &'static str,
    faults: Sender<Fault>,
    body: impl FnOnce() -> Result<()> + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(err) = body() {
                let _ = faults.send((name, err));
            }
        })
        .expect("spawn worker thread")
}

/// Stage and commit the schema elements derived from configuration.
pub fn apply_filter(source: &SourceConfig, metadata: &Metadata, enforce_users: bool) -> Result<()> {
    metadata.reset_elements();
    let schemaless = source.flags & flags::SCHEMALESS != 0;

    if let Some(debug) = &source.debug {
        if !schemaless {
            if let (Some(owner), Some(table)) = (&debug.owner, &debug.table) {
                info!("will shutdown after committed DML in {owner}.{table}");
                metadata.add_element(
                    SchemaElement::new(owner.clone(), table.clone())?
                        .with_options(table_options::DEBUG_TABLE),
                );
            }
        }
    }
    if source.flags & flags::ADAPTIVE_SCHEMA != 0 {
        metadata.add_element(SchemaElement::new(".*", ".*")?);
    }
    if let Some(filter) = &source.filter {
        if !schemaless {
            for entry in &filter.table {
                let mut element = SchemaElement::new(entry.owner.clone(), entry.table.clone())?;
                if let Some(key) = &entry.key {
                    element = element.with_key(key, &filter.separator);
                }
                if let Some(condition) = &entry.condition {
                    element = element.with_condition(condition.clone());
                }
                if let Some(tag) = &entry.tag {
                    element = element.with_tag(tag, &filter.separator);
                }
                metadata.add_element(element);
            }
        }
    }

    metadata.commit_elements(enforce_users)?;
    Ok(())
}

fn build_reader(
    source: &SourceConfig,
    ctx: &Arc<Ctx>,
    start_sequence: u32,
    start_offset: u64,
) -> Result<Box<dyn RedoReader>> {
    match source.reader.reader_type.as_str() {
        "batch" | "offline" => {
            let dir = source.reader.path.clone().expect("validated");
            Ok(Box::new(
                BatchReader::new(
                    dir,
                    source.name.clone(),
                    start_sequence,
                    start_offset,
                    source.reader.arch_read_tries,
                    source.reader.arch_read_sleep(),
                )
                .with_shutdown(Arc::clone(&ctx.shutdown)),
            ))
        }
        "online" => Err(Error::config(
            30002,
            "reader type online: support not compiled in",
        )),
        other => Err(Error::config(
            30001,
            format!("bad JSON, invalid \"type\" value: {other}"),
        )),
    }
}

fn build_sink(config: &Config, output: crate::builder::OutputFormat) -> Result<Box<dyn Sink>> {
    let writer = &config.target().writer;
    let binary = output == crate::builder::OutputFormat::Protobuf;
    match writer.writer_type.as_str() {
        "file" => Ok(Box::new(FileSink::new(
            writer.output.as_ref().filter(|o| !o.is_empty()).map(PathBuf::from),
            writer.max_file_size,
            binary,
        ))),
        "discard" => Ok(Box::new(DiscardSink::new())),
        "network" => {
            let uri = writer.uri.clone().expect("validated");
            Ok(Box::new(NetworkSink::new(uri)))
        }
        "kafka" | "zeromq" => Err(Error::config(
            30002,
            format!("writer type {}: support not compiled in", writer.writer_type),
        )),
        other => Err(Error::config(
            30001,
            format!("bad JSON, invalid \"type\" value: {other}"),
        )),
    }
}
