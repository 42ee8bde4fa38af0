//! Protobuf frame encoding.
//!
//! The protobuf sink format carries the same header fields as the JSON
//! format in a typed envelope; the payload entries travel as serialized
//! JSON documents inside the envelope. Writers frame each encoded message
//! with an 8-byte little-endian length prefix on the wire.

use crate::builder::format::{FormatOptions, ScnFormat, TimestampValue, XidFormat};
use crate::builder::json::FrameMeta;
use crate::common::Result;
use prost::Message;
use serde_json::Value;

/// Protobuf frame envelope.
#[derive(Clone, PartialEq, Message)]
pub struct PbFrame {
    /// Record or commit SCN, per the `scn-all` option.
    #[prost(uint64, tag = "1")]
    pub scn: u64,
    /// Hex text SCN, set instead of `scn` under the hex option.
    #[prost(string, tag = "2")]
    pub scns: String,
    #[prost(uint64, tag = "3")]
    pub c_scn: u64,
    #[prost(uint64, tag = "4")]
    pub c_idx: u64,
    /// Numeric timestamp (`tm` encodings).
    #[prost(int64, tag = "5")]
    pub tm: i64,
    /// Text timestamp (`tms` encodings).
    #[prost(string, tag = "6")]
    pub tms: String,
    /// Text XID, hex or decimal.
    #[prost(string, tag = "7")]
    pub xid: String,
    /// Numeric XID under the numeric option.
    #[prost(uint64, tag = "8")]
    pub xidn: u64,
    #[prost(string, tag = "9")]
    pub db: String,
    #[prost(map = "string, string", tag = "10")]
    pub attributes: std::collections::HashMap<String, String>,
    /// Payload entries, each a serialized JSON document.
    #[prost(string, repeated, tag = "11")]
    pub payload: Vec<String>,
}

/// Stateless protobuf encoder for sink frames.
pub struct PbEncoder {
    options: FormatOptions,
    database: String,
}

impl PbEncoder {
    pub fn new(options: FormatOptions, database: impl Into<String>) -> PbEncoder {
        PbEncoder { options, database: database.into() }
    }

    /// Build and serialize a frame envelope.
    pub fn encode(
        &self,
        meta: &FrameMeta,
        attributes: Option<&[(String, String)]>,
        payload: &[Value],
    ) -> Result<Vec<u8>> {
        let mut frame = PbFrame::default();

        let scn = if self.options.scn_all { meta.record_scn } else { meta.commit_scn };
        match self.options.scn {
            ScnFormat::Numeric => frame.scn = scn.0,
            ScnFormat::TextHex => frame.scns = scn.to_hex(),
        }

        match self.options.timestamp.render(meta.timestamp) {
            TimestampValue::Numeric(value) => frame.tm = value,
            TimestampValue::Text(value) => frame.tms = value,
        }

        frame.c_scn = meta.commit_scn.0;
        frame.c_idx = meta.commit_idx;

        match self.options.xid {
            XidFormat::TextHex => frame.xid = meta.xid.to_hex(),
            XidFormat::TextDec => frame.xid = meta.xid.to_dec(),
            XidFormat::Numeric => frame.xidn = meta.xid.to_u64(),
        }

        if self.options.db {
            frame.db = self.database.clone();
        }
        if let Some(attributes) = attributes {
            for (key, value) in attributes {
                frame.attributes.insert(key.clone(), value.clone());
            }
        }

        for entry in payload {
            frame.payload.push(serde_json::to_string(entry)?);
        }

        Ok(frame.encode_to_vec())
    }
}
