//! On-disk state layout.
//!
//! ```text
//! <state-path>/<name>.json          current checkpoint
//! <state-path>/<name>-<scn>.json    retained historical checkpoints
//! <state-path>/scripts/<name>.json  helper state (schema text cache)
//! ```
//!
//! Every write goes through a temp file and rename, so a crash never
//! leaves a torn checkpoint behind.

use crate::common::{Error, Result, Scn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Checkpoint files above this size are refused on read.
const STATE_FILE_MAX_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Disk-backed state directory for one source.
pub struct StateDisk {
    dir: PathBuf,
    name: String,
    keep: u32,
}

impl StateDisk {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>, keep: u32) -> StateDisk {
        StateDisk { dir: dir.into(), name: name.into(), keep }
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.name))
    }

    fn historical_path(&self, scn: Scn) -> PathBuf {
        self.dir.join(format!("{}-{}.json", self.name, scn.0))
    }

    fn scripts_path(&self) -> PathBuf {
        self.dir.join("scripts").join(format!("{}.json", self.name))
    }

    /// Persist a checkpoint: the historical copy first, then the current
    /// pointer, both atomically.
    pub fn write_checkpoint(&self, scn: Scn, body: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::io(10010, format!("dir: {}", self.dir.display()), e))?;

        let historical = self.historical_path(scn);
        write_atomic(&historical, body.as_bytes())?;
        write_atomic(&self.current_path(), body.as_bytes())?;
        debug!(scn = scn.0, file = %historical.display(), "checkpoint written");
        Ok(())
    }

    /// The current checkpoint body, if one exists.
    pub fn read_current(&self) -> Result<Option<String>> {
        read_bounded(&self.current_path())
    }

    /// Delete historical checkpoints beyond the retention count.
    pub fn prune(&self) -> Result<()> {
        let mut scns = self.historical_scns()?;
        if scns.len() <= self.keep as usize {
            return Ok(());
        }
        scns.sort_unstable();
        let excess = scns.len() - self.keep as usize;
        for scn in scns.into_iter().take(excess) {
            let path = self.historical_path(Scn(scn));
            fs::remove_file(&path)
                .map_err(|e| Error::io(10010, format!("file: {}", path.display()), e))?;
            debug!(scn, "old checkpoint pruned");
        }
        Ok(())
    }

    /// SCNs of retained historical checkpoints, unordered.
    pub fn historical_scns(&self) -> Result<Vec<u64>> {
        let mut scns = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scns),
            Err(e) => return Err(Error::io(10003, format!("dir: {}", self.dir.display()), e)),
        };
        let prefix = format!("{}-", self.name);
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io(10003, format!("dir: {}", self.dir.display()), e))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            if let Some(rest) = file_name.strip_prefix(&prefix) {
                if let Some(scn) = rest.strip_suffix(".json") {
                    if let Ok(scn) = scn.parse::<u64>() {
                        scns.push(scn);
                    }
                }
            }
        }
        Ok(scns)
    }

    /// Write the helper schema text cache.
    pub fn write_script(&self, body: &str) -> Result<()> {
        let path = self.scripts_path();
        let parent = path.parent().expect("scripts path has a parent");
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(10010, format!("dir: {}", parent.display()), e))?;
        write_atomic(&path, body.as_bytes())
    }

    pub fn read_script(&self) -> Result<Option<String>> {
        read_bounded(&self.scripts_path())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp)
        .map_err(|e| Error::io(10002, format!("file: {}", tmp.display()), e))?;
    file.write_all(bytes)
        .map_err(|e| Error::io(10006, format!("file: {}", tmp.display()), e))?;
    file.sync_all()
        .map_err(|e| Error::io(10008, format!("file: {}", tmp.display()), e))?;
    drop(file);
    fs::rename(&tmp, path)
        .map_err(|e| Error::io(10009, format!("file: {}", path.display()), e))?;
    Ok(())
}

fn read_bounded(path: &Path) -> Result<Option<String>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(10003, format!("file: {}", path.display()), e)),
    };
    if metadata.len() > STATE_FILE_MAX_SIZE {
        return Err(Error::data(
            20004,
            format!("file: {} - wrong size: {}", path.display(), metadata.len()),
        ));
    }
    let body = fs::read_to_string(path)
        .map_err(|e| Error::io(10005, format!("file: {}", path.display()), e))?;
    Ok(Some(body))
}
