//! Sink-facing format options.
//!
//! Every option has a closed integer domain checked at configuration
//! time; invalid values and invalid combinations are configuration
//! errors, never silent fallbacks.

use crate::common::{Error, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// `message` bitmask values.
pub mod message_flags {
    /// One aggregate frame per transaction instead of one per record.
    pub const FULL: u8 = 0x01;
    /// Add record sequence numbers to payloads.
    pub const ADD_SEQUENCES: u8 = 0x02;
    /// Suppress BEGIN frames.
    pub const SKIP_BEGIN: u8 = 0x04;
    /// Suppress COMMIT frames.
    pub const SKIP_COMMIT: u8 = 0x08;

    pub const MAX: u8 = 0x0F;
}

/// `schema` bitmask values.
pub mod schema_flags {
    /// Include column definitions.
    pub const FULL: u8 = 0x01;
    /// Repeat the schema block in every frame, not only the first per
    /// table.
    pub const REPEATED: u8 = 0x02;
    /// Include the object id.
    pub const OBJ: u8 = 0x04;

    pub const MAX: u8 = 0x07;
}

/// `attributes` bitmask values: which frames carry transaction
/// attributes.
pub mod attributes_flags {
    pub const BEGIN: u8 = 0x01;
    pub const DML: u8 = 0x02;
    pub const COMMIT: u8 = 0x04;

    pub const MAX: u8 = 0x07;
}

/// Timestamp output encodings (`timestamp` ∈ 0..=15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    UnixNano,
    UnixMicro,
    UnixMilli,
    Unix,
    UnixNanoString,
    UnixMicroString,
    UnixMilliString,
    UnixString,
    Iso8601NanoTz,
    Iso8601MicroTz,
    Iso8601MilliTz,
    Iso8601Tz,
    Iso8601Nano,
    Iso8601Micro,
    Iso8601Milli,
    Iso8601,
}

/// A formatted timestamp: the numeric encodings feed the `tm` field, the
/// text encodings feed `tms`.
#[derive(Debug, Clone, PartialEq)]
pub enum TimestampValue {
    Numeric(i64),
    Text(String),
}

impl TimestampFormat {
    pub fn from_config(value: u8) -> Result<TimestampFormat> {
        use TimestampFormat::*;
        Ok(match value {
            0 => UnixNano,
            1 => UnixMicro,
            2 => UnixMilli,
            3 => Unix,
            4 => UnixNanoString,
            5 => UnixMicroString,
            6 => UnixMilliString,
            7 => UnixString,
            8 => Iso8601NanoTz,
            9 => Iso8601MicroTz,
            10 => Iso8601MilliTz,
            11 => Iso8601Tz,
            12 => Iso8601Nano,
            13 => Iso8601Micro,
            14 => Iso8601Milli,
            15 => Iso8601,
            other => {
                return Err(Error::config(
                    30001,
                    format!("bad JSON, invalid \"timestamp\" value: {other}, expected: 0..15"),
                ))
            }
        })
    }

    /// Encode a commit timestamp (Unix epoch seconds).
    pub fn render(&self, epoch_secs: i64) -> TimestampValue {
        use TimestampFormat::*;
        let utc: DateTime<Utc> =
            Utc.timestamp_opt(epoch_secs, 0).single().unwrap_or_default();
        match self {
            UnixNano => TimestampValue::Numeric(epoch_secs.saturating_mul(1_000_000_000)),
            UnixMicro => TimestampValue::Numeric(epoch_secs.saturating_mul(1_000_000)),
            UnixMilli => TimestampValue::Numeric(epoch_secs.saturating_mul(1_000)),
            Unix => TimestampValue::Numeric(epoch_secs),
            UnixNanoString => {
                TimestampValue::Text(epoch_secs.saturating_mul(1_000_000_000).to_string())
            }
            UnixMicroString => {
                TimestampValue::Text(epoch_secs.saturating_mul(1_000_000).to_string())
            }
            UnixMilliString => {
                TimestampValue::Text(epoch_secs.saturating_mul(1_000).to_string())
            }
            UnixString => TimestampValue::Text(epoch_secs.to_string()),
            Iso8601NanoTz => {
                TimestampValue::Text(utc.to_rfc3339_opts(SecondsFormat::Nanos, true))
            }
            Iso8601MicroTz => {
                TimestampValue::Text(utc.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Iso8601MilliTz => {
                TimestampValue::Text(utc.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Iso8601Tz => TimestampValue::Text(utc.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Iso8601Nano => {
                TimestampValue::Text(utc.format("%Y-%m-%dT%H:%M:%S%.9f").to_string())
            }
            Iso8601Micro => {
                TimestampValue::Text(utc.format("%Y-%m-%dT%H:%M:%S%.6f").to_string())
            }
            Iso8601Milli => {
                TimestampValue::Text(utc.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
            }
            Iso8601 => TimestampValue::Text(utc.format("%Y-%m-%dT%H:%M:%S").to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            TimestampFormat::UnixNano
                | TimestampFormat::UnixMicro
                | TimestampFormat::UnixMilli
                | TimestampFormat::Unix
        )
    }
}

/// SCN output encoding (`scn` ∈ {0, 1}).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScnFormat {
    /// Numeric `scn` field.
    Numeric,
    /// Hex text `scns` field.
    TextHex,
}

impl ScnFormat {
    pub fn from_config(value: u8) -> Result<ScnFormat> {
        match value {
            0 => Ok(ScnFormat::Numeric),
            1 => Ok(ScnFormat::TextHex),
            other => Err(Error::config(
                30001,
                format!("bad JSON, invalid \"scn\" value: {other}, expected: 0..1"),
            )),
        }
    }
}

/// XID output encoding (`xid` ∈ {0, 1, 2}).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidFormat {
    /// `xid` as `0xUUUU.SSS.QQQQQQQQ`.
    TextHex,
    /// `xid` as `usn.slot.sqn`.
    TextDec,
    /// Numeric `xidn` field.
    Numeric,
}

impl XidFormat {
    pub fn from_config(value: u8) -> Result<XidFormat> {
        match value {
            0 => Ok(XidFormat::TextHex),
            1 => Ok(XidFormat::TextDec),
            2 => Ok(XidFormat::Numeric),
            other => Err(Error::config(
                30001,
                format!("bad JSON, invalid \"xid\" value: {other}, expected: 0..2"),
            )),
        }
    }
}

/// Character column handling (`char` ∈ {0, 1, 2}).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharFormat {
    /// Decode through the source character set, emit UTF-8.
    Utf8,
    /// Pass bytes through unmapped.
    NoMapping,
    /// Emit hex.
    Hex,
}

impl CharFormat {
    pub fn from_config(value: u8) -> Result<CharFormat> {
        match value {
            0 => Ok(CharFormat::Utf8),
            1 => Ok(CharFormat::NoMapping),
            2 => Ok(CharFormat::Hex),
            other => Err(Error::config(
                30001,
                format!("bad JSON, invalid \"char\" value: {other}, expected: 0..2"),
            )),
        }
    }
}

/// Column selection (`column` ∈ {0, 1, 2}).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFormat {
    /// Only changed columns.
    Changed,
    /// All columns on insert and delete.
    FullInsDec,
    /// All columns on update too.
    FullUpd,
}

impl ColumnFormat {
    pub fn from_config(value: u8) -> Result<ColumnFormat> {
        match value {
            0 => Ok(ColumnFormat::Changed),
            1 => Ok(ColumnFormat::FullInsDec),
            2 => Ok(ColumnFormat::FullUpd),
            other => Err(Error::config(
                30001,
                format!("bad JSON, invalid \"column\" value: {other}, expected: 0..2"),
            )),
        }
    }
}

/// Unknown-value handling (`unknown` ∈ {0, 1}).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownFormat {
    /// Emit `"?"`.
    QuestionMark,
    /// Emit `"?"` and log a hex dump of the raw value.
    Dump,
}

impl UnknownFormat {
    pub fn from_config(value: u8) -> Result<UnknownFormat> {
        match value {
            0 => Ok(UnknownFormat::QuestionMark),
            1 => Ok(UnknownFormat::Dump),
            other => Err(Error::config(
                30001,
                format!("bad JSON, invalid \"unknown\" value: {other}, expected: 0..1"),
            )),
        }
    }
}

/// Validated format options, built from the configuration's raw integers.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub message: u8,
    pub schema: u8,
    pub attributes: u8,
    pub timestamp: TimestampFormat,
    pub scn: ScnFormat,
    /// Emit the SCN on every frame, not only commit markers.
    pub scn_all: bool,
    pub xid: XidFormat,
    pub char_format: CharFormat,
    pub column: ColumnFormat,
    pub unknown: UnknownFormat,
    /// Include row ids.
    pub rid: bool,
    /// Include the database name.
    pub db: bool,
    /// Signal the writer once this many unconfirmed bytes accumulate.
    pub flush_buffer: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            message: 0,
            schema: 0,
            attributes: attributes_flags::BEGIN,
            timestamp: TimestampFormat::UnixMilli,
            scn: ScnFormat::Numeric,
            scn_all: false,
            xid: XidFormat::TextHex,
            char_format: CharFormat::Utf8,
            column: ColumnFormat::Changed,
            unknown: UnknownFormat::QuestionMark,
            rid: false,
            db: false,
            flush_buffer: 1024 * 1024,
        }
    }
}

impl FormatOptions {
    pub fn msg_full(&self) -> bool {
        self.message & message_flags::FULL != 0
    }

    pub fn msg_skip_begin(&self) -> bool {
        self.message & message_flags::SKIP_BEGIN != 0
    }

    pub fn msg_skip_commit(&self) -> bool {
        self.message & message_flags::SKIP_COMMIT != 0
    }

    pub fn msg_add_sequences(&self) -> bool {
        self.message & message_flags::ADD_SEQUENCES != 0
    }

    pub fn schema_full(&self) -> bool {
        self.schema & schema_flags::FULL != 0
    }

    pub fn schema_repeated(&self) -> bool {
        self.schema & schema_flags::REPEATED != 0
    }

    pub fn schema_obj(&self) -> bool {
        self.schema & schema_flags::OBJ != 0
    }

    /// Cross-field validation.
    ///
    /// `schemaless` disallows column selection; MSG_FULL aggregation is
    /// mutually exclusive with the skip flags.
    pub fn validate(&self, schemaless: bool) -> Result<()> {
        if self.message > message_flags::MAX {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid \"message\" value: {}, expected: 0..15", self.message),
            ));
        }
        if self.schema > schema_flags::MAX {
            return Err(Error::config(
                30001,
                format!("bad JSON, invalid \"schema\" value: {}, expected: 0..7", self.schema),
            ));
        }
        if self.attributes > attributes_flags::MAX {
            return Err(Error::config(
                30001,
                format!(
                    "bad JSON, invalid \"attributes\" value: {}, expected: 0..7",
                    self.attributes
                ),
            ));
        }
        if self.msg_full() && (self.msg_skip_begin() || self.msg_skip_commit()) {
            return Err(Error::config(
                30001,
                "bad JSON, invalid \"message\" value: begin/commit skip flags cannot be \
                 combined with full message aggregation",
            ));
        }
        if schemaless && self.column != ColumnFormat::Changed {
            return Err(Error::config(
                30001,
                "bad JSON, invalid \"column\" value: column selection requires a schema",
            ));
        }
        Ok(())
    }
}
