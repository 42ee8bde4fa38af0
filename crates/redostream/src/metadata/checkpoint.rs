//! The checkpoint worker.
//!
//! Periodically persists a durable resume point: the last writer-confirmed
//! ring message, the replay position, the set of in-flight transactions,
//! and the schema fingerprint (with a full schema snapshot forced every
//! `schema-force-interval` checkpoints). Also watches the configuration
//! file's modification time and reloads filter rules live.

use crate::common::{Ctx, Error, Result, Scn};
use crate::metadata::schema::TableDef;
use crate::metadata::{Metadata, OpenXid, ReplayPosition};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info};

/// Version tag of the checkpoint file format.
pub const CHECKPOINT_VERSION: &str = "1.8.5";

const LOOP_WAIT: Duration = Duration::from_millis(100);

/// Serialized checkpoint record.
///
/// Field content is fully determined by the replication state, never by
/// the wall clock, so writing the same logical checkpoint twice produces
/// byte-identical files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: String,
    pub database: String,
    /// Checkpoint SCN: the stream is durable up to here.
    pub scn: Scn,
    /// Highest ring message id the writer confirmed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_id: Option<u64>,
    /// LWN SCN embedded in that message.
    pub confirmed_lwn_scn: Scn,
    /// Where replay resumes after restart.
    pub resume: ReplayPosition,
    /// Transactions still in flight, with their first positions.
    #[serde(default)]
    pub open_xids: Vec<OpenXid>,
    /// Fingerprint of the committed schema, hex.
    pub schema_fingerprint: String,
    /// Full schema snapshot, present on forced-interval checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Vec<TableDef>>,
}

impl CheckpointRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(body: &str) -> Result<CheckpointRecord> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Checkpoint cadence configuration.
#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    pub interval: Duration,
    /// Confirmed megabytes between size-triggered checkpoints.
    pub interval_mb: u64,
    pub schema_force_interval: u32,
    /// Debug stop: request soft shutdown after this many checkpoints
    /// (zero disables).
    pub stop_after: u64,
}

/// Reload callback: re-parse the configuration file and stage + commit the
/// new filter elements. Installed by the supervisor.
pub type ReloadFn = Box<dyn Fn(&Metadata) -> Result<()> + Send + Sync>;

/// The checkpoint worker. One per source.
pub struct Checkpoint {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    settings: CheckpointSettings,
    config_path: PathBuf,
    reload: ReloadFn,

    wake_mtx: Mutex<()>,
    wake_cond: Condvar,
    requested: AtomicBool,
}

impl Checkpoint {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        settings: CheckpointSettings,
        config_path: PathBuf,
        reload: ReloadFn,
    ) -> Arc<Checkpoint> {
        Arc::new(Checkpoint {
            ctx,
            metadata,
            settings,
            config_path,
            reload,
            wake_mtx: Mutex::new(()),
            wake_cond: Condvar::new(),
            requested: AtomicBool::new(false),
        })
    }

    /// Explicit trigger (schema change, log switch).
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.wake();
    }

    pub fn wake(&self) {
        let _guard = self.wake_mtx.lock();
        self.wake_cond.notify_all();
    }

    /// Worker entry point.
    pub fn run(&self) -> Result<()> {
        debug!("checkpoint start");
        let mut config_mtime = file_mtime(&self.config_path);
        let mut last_write = Instant::now();
        let mut last_bytes = 0u64;
        let mut last_scn = Scn::ZERO;
        let mut since_schema = 0u32;
        let mut written = 0u64;

        while !self.ctx.shutdown.is_hard() {
            let confirmed_bytes = self.metadata.confirmed().bytes;
            let due = self.requested.swap(false, Ordering::AcqRel)
                || last_write.elapsed() >= self.settings.interval
                || confirmed_bytes.saturating_sub(last_bytes)
                    >= self.settings.interval_mb * 1024 * 1024;

            if due {
                match self.write_checkpoint(&mut since_schema, &mut last_scn) {
                    Ok(advanced) => {
                        last_write = Instant::now();
                        if advanced {
                            last_bytes = confirmed_bytes;
                            self.metadata.state().prune()?;
                            written += 1;
                            if self.settings.stop_after > 0
                                && written >= self.settings.stop_after
                            {
                                info!("shutdown after reaching the configured checkpoint count");
                                self.ctx.stop_soft();
                            }
                        }
                    }
                    Err(Error::Shutdown) => break,
                    Err(err) => return Err(err),
                }
            }

            if self.ctx.shutdown.is_hard() {
                break;
            }
            // Leave only once the writer has confirmed its last frame, so
            // the final checkpoint captures the fully confirmed stream.
            if self.ctx.shutdown.is_soft()
                && self.ctx.shutdown.replicator_finished()
                && self.ctx.shutdown.writer_finished()
            {
                break;
            }

            self.track_config_file(&mut config_mtime);

            let mut guard = self.wake_mtx.lock();
            self.wake_cond.wait_for(&mut guard, LOOP_WAIT);
        }

        // Final checkpoint on graceful shutdown.
        if self.ctx.shutdown.is_soft() && !self.ctx.shutdown.is_hard() {
            let mut since_schema = u32::MAX - 1;
            if let Err(err) = self.write_checkpoint(&mut since_schema, &mut last_scn) {
                if !matches!(err, Error::Shutdown) {
                    return Err(err);
                }
            }
        }
        debug!("checkpoint stop");
        Ok(())
    }

    /// Build and persist one checkpoint. Returns false when the durable
    /// state has not advanced since the previous record.
    fn write_checkpoint(&self, since_schema: &mut u32, last_scn: &mut Scn) -> Result<bool> {
        let confirmed = self.metadata.confirmed();

        // Freeze schema and the open-XID set.
        let (open_xids, fingerprint, schema_defs) = {
            let _txn = self.metadata.txn_mutex.lock();
            let schema = self.metadata.schema();
            (self.metadata.open_xids(), schema.fingerprint(), schema.table_defs())
        };

        // Flush in-flight transactions so their buffered state survives a
        // restart from this checkpoint.
        for open in &open_xids {
            self.ctx.swap.request_flush(open.xid);
            self.ctx.swap.wait_flush_done()?;
        }

        let position = self.metadata.position();
        let scn = if confirmed.id.is_some() { confirmed.scn } else { position.scn };
        if scn == *last_scn && scn != Scn::ZERO {
            return Ok(false);
        }

        // Resume from the oldest in-flight transaction, or the current
        // parser position when everything is committed.
        let resume = open_xids
            .iter()
            .min_by_key(|o| (o.first_sequence, o.first_offset))
            .map(|o| ReplayPosition {
                sequence: o.first_sequence,
                block_offset: o.first_offset,
                scn: o.first_scn,
            })
            .unwrap_or(position);

        *since_schema += 1;
        let with_schema = *since_schema >= self.settings.schema_force_interval;
        if with_schema {
            *since_schema = 0;
        }

        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION.to_string(),
            database: self.metadata.database.clone(),
            scn,
            confirmed_id: confirmed.id,
            confirmed_lwn_scn: confirmed.lwn_scn,
            resume,
            open_xids,
            schema_fingerprint: format!("{fingerprint:016x}"),
            schema: with_schema.then_some(schema_defs),
        };

        self.metadata.state().write_checkpoint(scn, &record.to_json()?)?;
        *last_scn = scn;
        if self.ctx.trace_enabled(crate::common::ctx::trace::CHECKPOINT) {
            tracing::trace!(
                open = record.open_xids.len(),
                with_schema,
                "checkpoint record details"
            );
        }
        info!(scn = scn.0, confirmed = ?confirmed.id, "checkpoint completed");
        Ok(true)
    }

    /// Reload filters when the configuration file's mtime changes.
    fn track_config_file(&self, known_mtime: &mut Option<SystemTime>) {
        let mtime = file_mtime(&self.config_path);
        if mtime == *known_mtime {
            return;
        }
        *known_mtime = mtime;
        if mtime.is_none() {
            error!(file = %self.config_path.display(), "config file disappeared");
            return;
        }

        info!("config file changed, reloading");
        match (self.reload)(&self.metadata) {
            Ok(()) => {
                info!("scanning objects which match the configuration file");
                self.request();
            }
            // A bad reload keeps the previous configuration active.
            Err(err) => error!(code = err.code(), "config reload failed: {err}"),
        }
    }
}

fn file_mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
