//! Configuration: a JSON file, read at startup, held under an exclusive
//! advisory lock for the life of the process, and watched for changes by
//! the checkpoint thread.
//!
//! Unknown attributes are rejected; every enumerated option has a closed
//! integer domain; cross-field constraints (memory bounds, mutually
//! exclusive start positions, format combinations) are validated before
//! any worker starts.

use crate::builder::format::{
    CharFormat, ColumnFormat, FormatOptions, ScnFormat, TimestampFormat, UnknownFormat,
    XidFormat,
};
use crate::builder::OutputFormat;
use crate::common::ctx::trace;
use crate::common::{Error, Result, Xid, CONFIG_FILE_MAX_SIZE};
use crate::memory::ArenaConfig;
use crate::metadata::checkpoint::CheckpointSettings;
use crate::parser::DebugStops;
use fs2::FileExt;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supported configuration schema version.
pub const CONFIG_SCHEMA_VERSION: &str = "1.8.5";

fn default_log_level() -> u8 {
    3
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    pub version: String,
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default)]
    pub trace: u32,
    #[serde(default)]
    pub dump_redo_log: u8,
    pub source: Vec<SourceConfig>,
    pub target: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub transaction_max_mb: u64,
    #[serde(default)]
    pub memory: MemoryConfig,
    pub state: StateConfig,
    pub reader: ReaderConfig,
    #[serde(default)]
    pub format: FormatConfig,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub debug: Option<DebugConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct MemoryConfig {
    #[serde(default = "MemoryConfig::default_min_mb")]
    pub min_mb: u64,
    #[serde(default = "MemoryConfig::default_max_mb")]
    pub max_mb: u64,
    #[serde(default)]
    pub swap_mb: u64,
    #[serde(default = "MemoryConfig::default_swap_path")]
    pub swap_path: String,
    #[serde(default = "MemoryConfig::default_small_buffer_mb")]
    pub read_buffer_min_mb: u64,
    /// Defaults to a quarter of `max-mb`.
    #[serde(default)]
    pub read_buffer_max_mb: Option<u64>,
    #[serde(default = "MemoryConfig::default_small_buffer_mb")]
    pub write_buffer_min_mb: u64,
    /// Defaults to `max-mb`.
    #[serde(default)]
    pub write_buffer_max_mb: Option<u64>,
    #[serde(default = "MemoryConfig::default_small_buffer_mb")]
    pub unswap_buffer_min_mb: u64,
}

impl MemoryConfig {
    fn default_min_mb() -> u64 {
        32
    }
    fn default_max_mb() -> u64 {
        1024
    }
    fn default_swap_path() -> String {
        ".".to_string()
    }
    fn default_small_buffer_mb() -> u64 {
        4
    }

    /// `read-buffer-max-mb` with its derived default.
    pub fn read_buffer_max(&self) -> u64 {
        self.read_buffer_max_mb
            .unwrap_or_else(|| (self.max_mb / 4).max(self.read_buffer_min_mb))
    }

    /// `write-buffer-max-mb` with its derived default.
    pub fn write_buffer_max(&self) -> u64 {
        self.write_buffer_max_mb.unwrap_or(self.max_mb)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are valid")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct StateConfig {
    #[serde(default = "StateConfig::default_type", rename = "type")]
    pub state_type: String,
    #[serde(default = "StateConfig::default_path")]
    pub path: String,
    #[serde(default = "StateConfig::default_interval_s")]
    pub interval_s: u64,
    #[serde(default = "StateConfig::default_interval_mb")]
    pub interval_mb: u64,
    #[serde(default = "StateConfig::default_keep_checkpoints")]
    pub keep_checkpoints: u32,
    #[serde(default = "StateConfig::default_schema_force_interval")]
    pub schema_force_interval: u32,
}

impl StateConfig {
    fn default_type() -> String {
        "disk".to_string()
    }
    fn default_path() -> String {
        "checkpoint".to_string()
    }
    fn default_interval_s() -> u64 {
        600
    }
    fn default_interval_mb() -> u64 {
        500
    }
    fn default_keep_checkpoints() -> u32 {
        100
    }
    fn default_schema_force_interval() -> u32 {
        20
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ReaderConfig {
    #[serde(rename = "type")]
    pub reader_type: String,
    /// Redo input directory for batch and offline readers.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub start_scn: Option<u64>,
    #[serde(default)]
    pub start_seq: Option<u32>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub start_time_rel: Option<u64>,
    #[serde(default = "ReaderConfig::default_con_id")]
    pub con_id: i16,
    #[serde(default)]
    pub db_timezone: Option<String>,
    #[serde(default)]
    pub log_timezone: Option<String>,
    #[serde(default)]
    pub host_timezone: Option<String>,
    /// Even-length list of `from, to` path prefix pairs.
    #[serde(default)]
    pub path_mapping: Vec<String>,
    #[serde(default = "ReaderConfig::default_log_archive_format")]
    pub log_archive_format: String,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default = "ReaderConfig::default_arch_read_sleep_us")]
    pub arch_read_sleep_us: u64,
    #[serde(default = "ReaderConfig::default_arch_read_tries")]
    pub arch_read_tries: u32,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
}

impl ReaderConfig {
    fn default_con_id() -> i16 {
        -1
    }
    fn default_log_archive_format() -> String {
        "o1_mf_%t_%s_%h_.arc".to_string()
    }
    fn default_arch_read_sleep_us() -> u64 {
        10_000_000
    }
    fn default_arch_read_tries() -> u32 {
        10
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FormatConfig {
    #[serde(default = "FormatConfig::default_type", rename = "type")]
    pub format_type: String,
    #[serde(default)]
    pub message: u8,
    #[serde(default)]
    pub rid: u8,
    #[serde(default)]
    pub xid: u8,
    #[serde(default)]
    pub timestamp: u8,
    #[serde(default, rename = "char")]
    pub char_format: u8,
    #[serde(default)]
    pub scn: u8,
    #[serde(default)]
    pub scn_all: u8,
    #[serde(default)]
    pub unknown: u8,
    #[serde(default)]
    pub schema: u8,
    #[serde(default)]
    pub column: u8,
    #[serde(default)]
    pub db: u8,
    #[serde(default = "FormatConfig::default_attributes")]
    pub attributes: u8,
    #[serde(default = "FormatConfig::default_flush_buffer")]
    pub flush_buffer: u64,
}

impl FormatConfig {
    fn default_type() -> String {
        "json".to_string()
    }
    fn default_attributes() -> u8 {
        1
    }
    fn default_flush_buffer() -> u64 {
        1024 * 1024
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are valid")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FilterConfig {
    #[serde(default)]
    pub table: Vec<FilterTable>,
    #[serde(default = "FilterConfig::default_separator")]
    pub separator: String,
    #[serde(default)]
    pub skip_xid: Vec<String>,
    #[serde(default)]
    pub dump_xid: Vec<String>,
}

impl FilterConfig {
    fn default_separator() -> String {
        ",".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FilterTable {
    pub owner: String,
    pub table: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DebugConfig {
    #[serde(default)]
    pub stop_log_switches: u64,
    #[serde(default)]
    pub stop_checkpoints: u64,
    #[serde(default)]
    pub stop_transactions: u64,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TargetConfig {
    #[serde(default)]
    pub alias: Option<String>,
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct WriterConfig {
    #[serde(rename = "type")]
    pub writer_type: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub max_file_size: u64,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "WriterConfig::default_poll_interval_us")]
    pub poll_interval_us: u64,
    #[serde(default = "WriterConfig::default_queue_size")]
    pub queue_size: u64,
}

impl WriterConfig {
    fn default_poll_interval_us() -> u64 {
        100_000
    }
    fn default_queue_size() -> u64 {
        65_536
    }
}

/// The parsed configuration plus the advisory-locked file handle; the
/// lock is held until the handle drops at process exit.
#[derive(Debug)]
pub struct ConfigHandle {
    pub config: Config,
    pub path: PathBuf,
    _lock: File,
}

impl Config {
    /// Open, lock, read, parse and validate the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<ConfigHandle> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .map_err(|e| Error::io(10001, format!("file: {}", path.display()), e))?;
        file.try_lock_exclusive().map_err(|e| {
            Error::io(10011, format!("lock: {} (already running?)", path.display()), e)
        })?;

        let size = file
            .metadata()
            .map_err(|e| Error::io(10003, format!("file: {}", path.display()), e))?
            .len();
        if size == 0 || size > CONFIG_FILE_MAX_SIZE {
            return Err(Error::config(
                10004,
                format!("file: {} - wrong size: {size}", path.display()),
            ));
        }

        let mut body = String::with_capacity(size as usize);
        file.read_to_string(&mut body)
            .map_err(|e| Error::io(10005, format!("file: {}", path.display()), e))?;

        let config = Config::parse(&body)
            .map_err(|e| Error::config(20001, format!("file: {} - {e}", path.display())))?;
        config.validate()?;
        Ok(ConfigHandle { config, path, _lock: file })
    }

    /// Parse without validating; used by tests and the reload path.
    pub fn parse(body: &str) -> std::result::Result<Config, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Re-read the configuration file (live reload). No lock transfer:
    /// the original handle keeps the advisory lock.
    pub fn reload(path: &Path) -> Result<Config> {
        let body = std::fs::read_to_string(path)
            .map_err(|e| Error::io(10005, format!("file: {}", path.display()), e))?;
        let config = Config::parse(&body)
            .map_err(|e| Error::config(20001, format!("file: {} - {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source[0]
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target[0]
    }

    /// Full structural validation, configuration-error codes throughout.
    pub fn validate(&self) -> Result<()> {
        if self.version != CONFIG_SCHEMA_VERSION {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"version\" value: {}, expected: {CONFIG_SCHEMA_VERSION}",
                    self.version
                ),
            ));
        }
        if self.log_level > 4 {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid \"log-level\" value: {}, expected: 0..4", self.log_level),
            ));
        }
        if self.trace > trace::MAX {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"trace\" value: {}, expected: 0..{}",
                    self.trace,
                    trace::MAX
                ),
            ));
        }
        if self.dump_redo_log > 2 {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"dump-redo-log\" value: {}, expected: 0..2",
                    self.dump_redo_log
                ),
            ));
        }
        if self.source.len() != 1 {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"source\" value: {} elements, expected: 1 element",
                    self.source.len()
                ),
            ));
        }
        if self.target.len() != 1 {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"target\" value: {} elements, expected: 1 element",
                    self.target.len()
                ),
            ));
        }

        let source = self.source();
        source.memory.validate()?;
        source.reader.validate()?;
        self.validate_state(&source.state)?;
        source.format.to_options()?.validate(source.flags & crate::common::ctx::flags::SCHEMALESS != 0)?;
        source.format.output_format()?;
        if let Some(filter) = &source.filter {
            filter.validate()?;
        }
        self.target().writer.validate()?;
        Ok(())
    }

    fn validate_state(&self, state: &StateConfig) -> Result<()> {
        if state.state_type != "disk" {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid \"type\" value: {}, expected: disk", state.state_type),
            ));
        }
        Ok(())
    }
}

impl MemoryConfig {
    /// The constraint set, values rounded down to chunk multiples.
    pub fn validate(&self) -> Result<()> {
        if self.min_mb < 16 {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid \"min-mb\" value: {}, expected: at least 16", self.min_mb),
            ));
        }
        if self.min_mb > self.max_mb {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"max-mb\" value: {}, expected: at least like \
                     \"min-mb\" value ({})",
                    self.max_mb, self.min_mb
                ),
            ));
        }
        if self.swap_mb > self.max_mb.saturating_sub(4) {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"swap-mb\" value: {}, expected maximum \"max-mb\"-4 \
                     value ({})",
                    self.swap_mb,
                    self.max_mb.saturating_sub(4)
                ),
            ));
        }
        for (name, min, max) in [
            ("read-buffer", self.read_buffer_min_mb, self.read_buffer_max()),
            ("write-buffer", self.write_buffer_min_mb, self.write_buffer_max()),
        ] {
            if min > max {
                return Err(Error::config(
                    30001,
                    format!(
                        "bad JSON, invalid \"{name}-max-mb\" value: {max}, expected: at \
                         least: \"{name}-min-mb\" value ({min})"
                    ),
                ));
            }
            if max > self.max_mb {
                return Err(Error::config(
                    30001,
                    format!(
                        "bad JSON, invalid \"{name}-max-mb\" value: {max}, expected: not \
                         greater than \"max-mb\" value ({})",
                        self.max_mb
                    ),
                ));
            }
        }
        let floor =
            self.unswap_buffer_min_mb + self.read_buffer_min_mb + self.write_buffer_min_mb + 4;
        if floor > self.max_mb {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"unswap-buffer-min-mb\" + \"read-buffer-min-mb\" + \
                     \"write-buffer-min-mb\" + 4 ({floor}) is greater than \"max-mb\" value ({})",
                    self.max_mb
                ),
            ));
        }
        Ok(())
    }

    pub fn to_arena_config(&self) -> ArenaConfig {
        ArenaConfig::from_mb(
            self.min_mb,
            self.max_mb,
            self.swap_mb,
            self.read_buffer_min_mb,
            self.read_buffer_max(),
            self.write_buffer_min_mb,
            self.write_buffer_max(),
            self.unswap_buffer_min_mb,
        )
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<()> {
        match self.reader_type.as_str() {
            "online" | "offline" | "batch" => {}
            other => {
                return Err(Error::config(
                    30001,
                    format!(
                        "bad JSON, invalid \"type\" value: {other}, expected: online, \
                         offline or batch"
                    ),
                ))
            }
        }

        let starts = [
            self.start_scn.is_some(),
            self.start_seq.is_some(),
            self.start_time.is_some(),
            self.start_time_rel.is_some(),
        ]
        .iter()
        .filter(|&&set| set)
        .count();
        if starts > 1 {
            return Err(Error::config(
                30001,
                "bad JSON, invalid start position: \"start-scn\", \"start-seq\", \
                 \"start-time\" and \"start-time-rel\" are mutually exclusive",
            ));
        }

        if self.path_mapping.len() % 2 != 0 {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"path-mapping\" value: {} elements, expected: \
                     an even number",
                    self.path_mapping.len()
                ),
            ));
        }

        for tz in [&self.db_timezone, &self.log_timezone, &self.host_timezone]
            .into_iter()
            .flatten()
        {
            if parse_timezone(tz).is_none() {
                return Err(Error::config(
                    30001,
                    format!("bad JSON, invalid timezone value: {tz}, expected: [+-]HH:MM"),
                ));
            }
        }

        if self.reader_type == "online" {
            if self.user.is_none() || self.password.is_none() || self.server.is_none() {
                return Err(Error::config(
                    30001,
                    "bad JSON, missing \"user\", \"password\" or \"server\" for the \
                     online reader",
                ));
            }
            // Waiting for an archive that may never appear is refused up
            // front.
            if self.start_time.is_some() && self.arch.as_deref() == Some("online-keep") {
                return Err(Error::config(
                    30001,
                    "bad JSON, \"start-time\" cannot be combined with \"arch\": \
                     online-keep before any archive exists",
                ));
            }
        } else if self.path.is_none() {
            return Err(Error::config(
                30001,
                format!("bad JSON, missing \"path\" for the {} reader", self.reader_type),
            ));
        }
        Ok(())
    }

    pub fn arch_read_sleep(&self) -> Duration {
        Duration::from_micros(self.arch_read_sleep_us)
    }
}

impl FormatConfig {
    pub fn output_format(&self) -> Result<OutputFormat> {
        match self.format_type.as_str() {
            "json" => Ok(OutputFormat::Json),
            "protobuf" => Ok(OutputFormat::Protobuf),
            other => Err(Error::config(
                30001,
                format!("bad JSON, invalid \"type\" value: {other}, expected: json or protobuf"),
            )),
        }
    }

    pub fn to_options(&self) -> Result<FormatOptions> {
        if self.rid > 1 {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid \"rid\" value: {}, expected: 0..1", self.rid),
            ));
        }
        if self.scn_all > 1 {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid \"scn-all\" value: {}, expected: 0..1", self.scn_all),
            ));
        }
        if self.db > 1 {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid \"db\" value: {}, expected: 0..1", self.db),
            ));
        }
        Ok(FormatOptions {
            message: self.message,
            schema: self.schema,
            attributes: self.attributes,
            timestamp: TimestampFormat::from_config(self.timestamp)?,
            scn: ScnFormat::from_config(self.scn)?,
            scn_all: self.scn_all != 0,
            xid: XidFormat::from_config(self.xid)?,
            char_format: CharFormat::from_config(self.char_format)?,
            column: ColumnFormat::from_config(self.column)?,
            unknown: UnknownFormat::from_config(self.unknown)?,
            rid: self.rid != 0,
            db: self.db != 0,
            flush_buffer: self.flush_buffer,
        })
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        for list in [&self.skip_xid, &self.dump_xid] {
            for entry in list {
                if Xid::parse(entry).is_none() {
                    return Err(Error::config(
                        30001,
                        format!("bad JSON, invalid xid value: {entry}, expected: usn.slot.sqn"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn skip_xids(&self) -> HashSet<Xid> {
        self.skip_xid.iter().filter_map(|s| Xid::parse(s)).collect()
    }

    pub fn dump_xids(&self) -> HashSet<Xid> {
        self.dump_xid.iter().filter_map(|s| Xid::parse(s)).collect()
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<()> {
        match self.writer_type.as_str() {
            "file" | "discard" | "network" => {}
            "kafka" => {
                if cfg!(not(feature = "kafka")) {
                    return Err(Error::config(
                        30002,
                        "writer type kafka: support not compiled in",
                    ));
                }
            }
            "zeromq" => {
                if cfg!(not(feature = "zeromq")) {
                    return Err(Error::config(
                        30002,
                        "writer type zeromq: support not compiled in",
                    ));
                }
            }
            other => {
                return Err(Error::config(
                    30001,
                    format!(
                        "bad JSON, invalid \"type\" value: {other}, expected: file, \
                         discard, kafka, zeromq or network"
                    ),
                ))
            }
        }
        if self.writer_type == "network" && self.uri.is_none() {
            return Err(Error::config(
                30001,
                "bad JSON, missing \"uri\" for the network writer",
            ));
        }
        if !(100..=3_600_000_000).contains(&self.poll_interval_us) {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"poll-interval-us\" value: {}, expected: \
                     100..3600000000",
                    self.poll_interval_us
                ),
            ));
        }
        if !(1..=1_000_000).contains(&self.queue_size) {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"queue-size\" value: {}, expected: 1..1000000",
                    self.queue_size
                ),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

impl StateConfig {
    pub fn to_checkpoint_settings(&self) -> CheckpointSettings {
        CheckpointSettings {
            interval: Duration::from_secs(self.interval_s),
            interval_mb: self.interval_mb,
            schema_force_interval: self.schema_force_interval.max(1),
            stop_after: 0,
        }
    }
}

impl DebugConfig {
    pub fn to_stops(&self) -> DebugStops {
        DebugStops {
            log_switches: self.stop_log_switches,
            checkpoints: self.stop_checkpoints,
            transactions: self.stop_transactions,
        }
    }
}

/// Parse a `[+-]HH:MM` timezone offset into seconds.
pub fn parse_timezone(text: &str) -> Option<i32> {
    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1i32, &text[1..]),
        b'-' => (-1i32, &text[1..]),
        _ => (1i32, text),
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_config() -> String {
        serde_json::json!({
            "version": CONFIG_SCHEMA_VERSION,
            "source": [{
                "name": "db",
                "state": {"path": "state"},
                "reader": {"type": "batch", "path": "redo"},
            }],
            "target": [{
                "writer": {"type": "file", "output": "out.json"},
            }],
        })
        .to_string()
    }

    #[test]
    fn test_minimal_config_parses_and_validates() {
        let config = Config::parse(&minimal_config()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.source().name, "db");
        assert_eq!(config.source().memory.min_mb, 32);
        assert_eq!(config.target().writer.writer_type, "file");
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_config()).unwrap();
        value["surprise"] = serde_json::json!(1);
        assert!(Config::parse(&value.to_string()).is_err());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_config()).unwrap();
        value["version"] = serde_json::json!("0.0.1");
        let config = Config::parse(&value.to_string()).unwrap();
        assert_eq!(config.validate().unwrap_err().code(), 30001);
    }

    #[test]
    fn test_memory_constraints() {
        let ok = MemoryConfig {
            min_mb: 32,
            max_mb: 128,
            swap_mb: 64,
            swap_path: "/tmp".into(),
            read_buffer_min_mb: 4,
            read_buffer_max_mb: Some(32),
            write_buffer_min_mb: 4,
            write_buffer_max_mb: Some(64),
            unswap_buffer_min_mb: 4,
        };
        ok.validate().unwrap();

        let mut bad = ok.clone();
        bad.min_mb = 256;
        assert!(bad.validate().is_err());

        let mut bad = ok.clone();
        bad.swap_mb = 125;
        assert!(bad.validate().is_err());

        let mut bad = ok.clone();
        bad.unswap_buffer_min_mb = 120;
        assert!(bad.validate().is_err());

        let mut bad = ok;
        bad.write_buffer_max_mb = Some(256);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_buffer_maxima_derive_from_max_mb() {
        let config = MemoryConfig { max_mb: 64, ..MemoryConfig::default() };
        config.validate().unwrap();
        assert_eq!(config.read_buffer_max(), 16);
        assert_eq!(config.write_buffer_max(), 64);
    }

    #[test]
    fn test_start_positions_mutually_exclusive() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_config()).unwrap();
        value["source"][0]["reader"]["start-scn"] = serde_json::json!(100);
        value["source"][0]["reader"]["start-seq"] = serde_json::json!(5);
        let config = Config::parse(&value.to_string()).unwrap();
        assert_eq!(config.validate().unwrap_err().code(), 30001);
    }

    #[test]
    fn test_online_start_time_with_online_keep_rejected() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_config()).unwrap();
        value["source"][0]["reader"] = serde_json::json!({
            "type": "online",
            "user": "u", "password": "p", "server": "s",
            "start-time": "2024-01-01 00:00:00",
            "arch": "online-keep",
        });
        let config = Config::parse(&value.to_string()).unwrap();
        assert_eq!(config.validate().unwrap_err().code(), 30001);
    }

    #[test]
    fn test_kafka_requires_feature() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_config()).unwrap();
        value["target"][0]["writer"] =
            serde_json::json!({"type": "kafka", "topic": "events"});
        let config = Config::parse(&value.to_string()).unwrap();
        let result = config.validate();
        if cfg!(feature = "kafka") {
            result.unwrap();
        } else {
            assert_eq!(result.unwrap_err().code(), 30002);
        }
    }

    #[test]
    fn test_writer_ranges() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_config()).unwrap();
        value["target"][0]["writer"]["poll-interval-us"] = serde_json::json!(10);
        let config = Config::parse(&value.to_string()).unwrap();
        assert!(config.validate().is_err());

        let mut value: serde_json::Value = serde_json::from_str(&minimal_config()).unwrap();
        value["target"][0]["writer"]["queue-size"] = serde_json::json!(0);
        let config = Config::parse(&value.to_string()).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_mapping_must_be_even() {
        let mut value: serde_json::Value = serde_json::from_str(&minimal_config()).unwrap();
        value["source"][0]["reader"]["path-mapping"] = serde_json::json!(["/a"]);
        let config = Config::parse(&value.to_string()).unwrap();
        assert_eq!(config.validate().unwrap_err().code(), 30001);
    }

    #[test]
    fn test_timezone_parsing() {
        assert_eq!(parse_timezone("+02:00"), Some(7200));
        assert_eq!(parse_timezone("-05:30"), Some(-19800));
        assert_eq!(parse_timezone("02:00"), Some(7200));
        assert_eq!(parse_timezone("+15:00"), None);
        assert_eq!(parse_timezone("bogus"), None);
    }

    #[test]
    fn test_load_locks_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(minimal_config().as_bytes()).unwrap();
        drop(file);

        let handle = Config::load(&path).unwrap();
        assert_eq!(handle.config.source().name, "db");
        assert_eq!(handle.path, path);
    }

    #[test]
    fn test_empty_config_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::File::create(&path).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert_eq!(err.code(), 10004);
    }

    #[test]
    fn test_filter_xid_lists() {
        let filter = FilterConfig {
            table: vec![],
            separator: ",".into(),
            skip_xid: vec!["1.2.3".into()],
            dump_xid: vec!["4.5.6".into()],
        };
        filter.validate().unwrap();
        assert!(filter.skip_xids().contains(&Xid::new(1, 2, 3)));
        assert!(filter.dump_xids().contains(&Xid::new(4, 5, 6)));

        let bad = FilterConfig {
            table: vec![],
            separator: ",".into(),
            skip_xid: vec!["nope".into()],
            dump_xid: vec![],
        };
        assert!(bad.validate().is_err());
    }
}
