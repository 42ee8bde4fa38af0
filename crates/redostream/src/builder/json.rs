//! JSON frame encoding.
//!
//! Field vocabulary: `scn`/`scns` (record or commit SCN, numeric or hex),
//! `tm`/`tms` (timestamp, numeric or text), `c_scn`/`c_idx` (commit SCN
//! and frame index within the transaction), `xid`/`xidn`, `db`,
//! `attributes`, and a `payload` array whose entries carry `op` ∈
//! {"begin", "c", "u", "d", "ddl", "commit"} plus `schema`, `rid`,
//! `before`/`after` and `num`.

use crate::builder::format::{FormatOptions, ScnFormat, TimestampValue, XidFormat};
use crate::common::{Scn, Xid};
use serde_json::{json, Map, Value};

/// Header values shared by every frame of a transaction.
#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub commit_scn: Scn,
    /// SCN of the record itself (equals `commit_scn` for markers).
    pub record_scn: Scn,
    /// Frame index within the transaction.
    pub commit_idx: u64,
    /// Commit timestamp, Unix epoch seconds.
    pub timestamp: i64,
    pub xid: Xid,
}

/// Stateless JSON encoder for sink frames.
pub struct JsonEncoder {
    options: FormatOptions,
    database: String,
}

impl JsonEncoder {
    pub fn new(options: FormatOptions, database: impl Into<String>) -> JsonEncoder {
        JsonEncoder { options, database: database.into() }
    }

    pub fn options(&self) -> &FormatOptions {
        &self.options
    }

    /// The frame envelope: header fields plus the payload array.
    pub fn envelope(
        &self,
        meta: &FrameMeta,
        attributes: Option<&[(String, String)]>,
        payload: Vec<Value>,
    ) -> Value {
        let mut map = Map::new();

        let scn = if self.options.scn_all { meta.record_scn } else { meta.commit_scn };
        match self.options.scn {
            ScnFormat::Numeric => {
                map.insert("scn".into(), json!(scn.0));
            }
            ScnFormat::TextHex => {
                map.insert("scns".into(), json!(scn.to_hex()));
            }
        }

        match self.options.timestamp.render(meta.timestamp) {
            TimestampValue::Numeric(value) => {
                map.insert("tm".into(), json!(value));
            }
            TimestampValue::Text(value) => {
                map.insert("tms".into(), json!(value));
            }
        }

        map.insert("c_scn".into(), json!(meta.commit_scn.0));
        map.insert("c_idx".into(), json!(meta.commit_idx));

        match self.options.xid {
            XidFormat::TextHex => {
                map.insert("xid".into(), json!(meta.xid.to_hex()));
            }
            XidFormat::TextDec => {
                map.insert("xid".into(), json!(meta.xid.to_dec()));
            }
            XidFormat::Numeric => {
                map.insert("xidn".into(), json!(meta.xid.to_u64()));
            }
        }

        if self.options.db {
            map.insert("db".into(), json!(self.database));
        }

        if let Some(attributes) = attributes {
            let mut attrs = Map::new();
            for (key, value) in attributes {
                attrs.insert(key.clone(), json!(value));
            }
            map.insert("attributes".into(), Value::Object(attrs));
        }

        map.insert("payload".into(), Value::Array(payload));
        Value::Object(map)
    }

    /// `{"op":"begin"}` payload entry.
    pub fn begin_payload(&self) -> Value {
        json!({"op": "begin"})
    }

    /// `{"op":"commit"}` payload entry.
    pub fn commit_payload(&self) -> Value {
        json!({"op": "commit"})
    }

    /// DML payload entry.
    #[allow(clippy::too_many_arguments)]
    pub fn dml_payload(
        &self,
        op: &str,
        schema_block: Option<Value>,
        rid: Option<&str>,
        before: Option<Map<String, Value>>,
        after: Option<Map<String, Value>>,
        num: u64,
    ) -> Value {
        let mut map = Map::new();
        map.insert("op".into(), json!(op));
        if let Some(schema_block) = schema_block {
            map.insert("schema".into(), schema_block);
        }
        if self.options.rid {
            if let Some(rid) = rid {
                map.insert("rid".into(), json!(rid));
            }
        }
        if let Some(before) = before {
            map.insert("before".into(), Value::Object(before));
        }
        if let Some(after) = after {
            map.insert("after".into(), Value::Object(after));
        }
        if self.options.msg_add_sequences() {
            map.insert("num".into(), json!(num));
        }
        Value::Object(map)
    }

    /// DDL payload entry.
    pub fn ddl_payload(&self, schema_block: Option<Value>, statement: &str) -> Value {
        let mut map = Map::new();
        map.insert("op".into(), json!("ddl"));
        if let Some(schema_block) = schema_block {
            map.insert("schema".into(), schema_block);
        }
        map.insert("sql".into(), json!(statement));
        Value::Object(map)
    }

    /// The `schema` block of a payload entry, shaped by the schema flags.
    pub fn schema_block(
        &self,
        owner: &str,
        table: &str,
        obj: u32,
        columns: Option<&[(String, bool)]>,
    ) -> Value {
        let mut map = Map::new();
        map.insert("owner".into(), json!(owner));
        map.insert("table".into(), json!(table));
        if self.options.schema_obj() {
            map.insert("obj".into(), json!(obj));
        }
        if self.options.schema_full() {
            if let Some(columns) = columns {
                let list: Vec<Value> = columns
                    .iter()
                    .map(|(name, key)| json!({"name": name, "key": key}))
                    .collect();
                map.insert("columns".into(), Value::Array(list));
            }
        }
        Value::Object(map)
    }

    /// Serialize a frame envelope to bytes.
    pub fn to_bytes(&self, frame: &Value) -> crate::common::Result<Vec<u8>> {
        Ok(serde_json::to_vec(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::format::message_flags;

    fn meta() -> FrameMeta {
        FrameMeta {
            commit_scn: Scn(101),
            record_scn: Scn(100),
            commit_idx: 0,
            timestamp: 1_700_000_000,
            xid: Xid::new(1, 2, 3),
        }
    }

    #[test]
    fn test_envelope_default_fields() {
        let encoder = JsonEncoder::new(FormatOptions::default(), "db");
        let frame = encoder.envelope(&meta(), None, vec![encoder.begin_payload()]);

        assert_eq!(frame["scn"], json!(101));
        assert_eq!(frame["c_scn"], json!(101));
        assert_eq!(frame["c_idx"], json!(0));
        assert_eq!(frame["xid"], json!("0x0001.002.00000003"));
        assert!(frame.get("db").is_none());
        assert_eq!(frame["payload"][0]["op"], json!("begin"));
    }

    #[test]
    fn test_scn_all_uses_record_scn() {
        let options = FormatOptions { scn_all: true, ..FormatOptions::default() };
        let encoder = JsonEncoder::new(options, "db");
        let frame = encoder.envelope(&meta(), None, vec![]);
        assert_eq!(frame["scn"], json!(100));
    }

    #[test]
    fn test_hex_scn_and_numeric_xid() {
        let options = FormatOptions {
            scn: ScnFormat::TextHex,
            xid: XidFormat::Numeric,
            ..FormatOptions::default()
        };
        let encoder = JsonEncoder::new(options, "db");
        let frame = encoder.envelope(&meta(), None, vec![]);
        assert_eq!(frame["scns"], json!("0x0000000000000065"));
        assert!(frame.get("scn").is_none());
        assert_eq!(frame["xidn"], json!(Xid::new(1, 2, 3).to_u64()));
    }

    #[test]
    fn test_dml_payload_shape() {
        let encoder = JsonEncoder::new(FormatOptions::default(), "db");
        let schema = encoder.schema_block("APP", "USERS", 10, None);
        let mut after = Map::new();
        after.insert("id".into(), json!(1));

        let payload = encoder.dml_payload("c", Some(schema), None, None, Some(after), 0);
        assert_eq!(payload["op"], json!("c"));
        assert_eq!(payload["schema"]["owner"], json!("APP"));
        assert_eq!(payload["after"]["id"], json!(1));
        assert!(payload.get("num").is_none());
    }

    #[test]
    fn test_add_sequences_emits_num() {
        let options = FormatOptions {
            message: message_flags::ADD_SEQUENCES,
            ..FormatOptions::default()
        };
        let encoder = JsonEncoder::new(options, "db");
        let payload = encoder.dml_payload("u", None, None, None, None, 5);
        assert_eq!(payload["num"], json!(5));
    }

    #[test]
    fn test_attributes_rendered_as_object() {
        let encoder = JsonEncoder::new(FormatOptions::default(), "db");
        let attributes = vec![("client".to_string(), "etl".to_string())];
        let frame = encoder.envelope(&meta(), Some(&attributes), vec![]);
        assert_eq!(frame["attributes"]["client"], json!("etl"));
    }
}
