//! Core identifier types drawn from the redo stream.
//!
//! All of these are thin newtypes so that an SCN can never be confused with
//! a sequence number or a block offset at a call site.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of allocation and swap: 1 MiB.
pub const CHUNK_SIZE: usize = 1024 * 1024;
/// Chunk size expressed in MiB, for configuration arithmetic.
pub const CHUNK_SIZE_MB: u64 = 1;
/// Upper bound on the configuration file size.
pub const CONFIG_FILE_MAX_SIZE: u64 = 1024 * 1024;

/// System change number: the monotonic logical clock of the redo stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Scn(pub u64);

impl Scn {
    pub const ZERO: Scn = Scn(0);

    /// Render as the hexadecimal text form used by the `scns` output field.
    pub fn to_hex(&self) -> String {
        format!("0x{:016x}", self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier: (undo segment number, slot, sequence).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Xid {
    pub usn: u16,
    pub slot: u16,
    pub sqn: u32,
}

impl Xid {
    pub fn new(usn: u16, slot: u16, sqn: u32) -> Self {
        Self { usn, slot, sqn }
    }

    /// Pack into a single number, used by the `xidn` output encoding.
    pub fn to_u64(&self) -> u64 {
        (u64::from(self.usn) << 48) | (u64::from(self.slot) << 32) | u64::from(self.sqn)
    }

    /// Hex text form: `0x0001.002.00000003`.
    pub fn to_hex(&self) -> String {
        format!("0x{:04x}.{:03x}.{:08x}", self.usn, self.slot, self.sqn)
    }

    /// Decimal text form: `1.2.3`.
    pub fn to_dec(&self) -> String {
        format!("{}.{}.{}", self.usn, self.slot, self.sqn)
    }

    /// File-name-safe form used for swap files.
    pub fn to_file_stem(&self) -> String {
        format!("{:04x}-{:03x}-{:08x}", self.usn, self.slot, self.sqn)
    }

    /// Parse the decimal triple form (`usn.slot.sqn`), as accepted by the
    /// `skip-xid` and `dump-xid` configuration lists.
    pub fn parse(text: &str) -> Option<Xid> {
        let mut parts = text.split('.');
        let usn = parts.next()?.parse().ok()?;
        let slot = parts.next()?.parse().ok()?;
        let sqn = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Xid { usn, slot, sqn })
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.usn, self.slot, self.sqn)
    }
}

/// Large-object locator carried by LOB index and data records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LobId(pub u64);

impl fmt::Display for LobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Arena accounting buckets. Each module has its own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryModule {
    Builder,
    Parser,
    Reader,
    Transactions,
}

impl MemoryModule {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        match self {
            MemoryModule::Builder => 0,
            MemoryModule::Parser => 1,
            MemoryModule::Reader => 2,
            MemoryModule::Transactions => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MemoryModule::Builder => "builder",
            MemoryModule::Parser => "parser",
            MemoryModule::Reader => "reader",
            MemoryModule::Transactions => "transactions",
        }
    }
}

impl fmt::Display for MemoryModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
