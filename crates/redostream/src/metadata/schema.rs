//! Schema selection: which tables are captured and how.
//!
//! Configuration supplies pattern elements (owner/table regular
//! expressions plus key, condition and tag metadata); the catalog loader
//! supplies table definitions. Building a [`Schema`] joins the two into a
//! map keyed by object id, published atomically so parser and builder
//! always observe a consistent view.

use crate::common::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Table options carried on a schema element.
pub mod options {
    /// Commit of a DML on this table triggers a debug shutdown.
    pub const DEBUG_TABLE: u8 = 0x01;
    /// Synthesized by adaptive schema, not matched from configuration.
    pub const ADAPTIVE: u8 = 0x02;
}

/// One column of a captured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Part of the primary key unless overridden by the element's `key`.
    #[serde(default)]
    pub key: bool,
}

/// A table definition from the catalog loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub obj: u32,
    pub owner: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner, self.name)
    }
}

/// A configured capture rule.
#[derive(Debug, Clone)]
pub struct SchemaElement {
    pub owner_pattern: String,
    pub table_pattern: String,
    owner_re: Regex,
    table_re: Regex,
    pub key_columns: Vec<String>,
    pub condition: Option<String>,
    pub tag_columns: Vec<String>,
    pub options: u8,
}

impl SchemaElement {
    pub fn new(owner: impl Into<String>, table: impl Into<String>) -> Result<SchemaElement> {
        let owner_pattern = owner.into();
        let table_pattern = table.into();
        let owner_re = compile_anchored(&owner_pattern)?;
        let table_re = compile_anchored(&table_pattern)?;
        Ok(SchemaElement {
            owner_pattern,
            table_pattern,
            owner_re,
            table_re,
            key_columns: Vec::new(),
            condition: None,
            tag_columns: Vec::new(),
            options: 0,
        })
    }

    /// Parse the `key` attribute: column names joined by `separator`.
    pub fn with_key(mut self, key: &str, separator: &str) -> SchemaElement {
        self.key_columns = split_columns(key, separator);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> SchemaElement {
        self.condition = Some(condition.into());
        self
    }

    /// Parse the `tag` attribute: column names joined by `separator`.
    pub fn with_tag(mut self, tag: &str, separator: &str) -> SchemaElement {
        self.tag_columns = split_columns(tag, separator);
        self
    }

    pub fn with_options(mut self, options: u8) -> SchemaElement {
        self.options = options;
        self
    }

    pub fn matches(&self, owner: &str, table: &str) -> bool {
        self.owner_re.is_match(owner) && self.table_re.is_match(table)
    }
}

fn compile_anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^{pattern}$"))
        .map_err(|e| Error::config(30001, format!("bad table pattern {pattern:?}: {e}")))
}

fn split_columns(list: &str, separator: &str) -> Vec<String> {
    list.split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A captured table: the definition joined with its element's metadata.
#[derive(Debug, Clone)]
pub struct CapturedTable {
    pub def: TableDef,
    pub key_columns: Vec<String>,
    pub condition: Option<String>,
    pub tag_columns: Vec<String>,
    pub options: u8,
}

impl CapturedTable {
    /// Whether `column` is part of the emitted key.
    pub fn is_key_column(&self, column: &str) -> bool {
        if self.key_columns.is_empty() {
            self.def.columns.iter().any(|c| c.key && c.name == column)
        } else {
            self.key_columns.iter().any(|k| k == column)
        }
    }
}

/// The committed schema map.
#[derive(Clone, Default)]
pub struct Schema {
    tables: HashMap<u32, Arc<CapturedTable>>,
    fingerprint: u64,
}

impl Schema {
    pub fn empty() -> Schema {
        Schema::default()
    }

    /// Join elements and catalog into a captured-table map.
    pub fn build(elements: &[SchemaElement], catalog: &[TableDef]) -> Result<Schema> {
        let mut tables = HashMap::new();
        for def in catalog {
            if let Some(element) =
                elements.iter().find(|e| e.matches(&def.owner, &def.name))
            {
                tables.insert(
                    def.obj,
                    Arc::new(CapturedTable {
                        def: def.clone(),
                        key_columns: element.key_columns.clone(),
                        condition: element.condition.clone(),
                        tag_columns: element.tag_columns.clone(),
                        options: element.options,
                    }),
                );
            }
        }
        let fingerprint = fingerprint_of(&tables);
        Ok(Schema { tables, fingerprint })
    }

    pub fn get(&self, obj: u32) -> Option<Arc<CapturedTable>> {
        self.tables.get(&obj).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Install a synthesized (adaptive) table definition.
    pub fn adopt(&mut self, def: TableDef) {
        self.tables.insert(
            def.obj,
            Arc::new(CapturedTable {
                def,
                key_columns: Vec::new(),
                condition: None,
                tag_columns: Vec::new(),
                options: options::ADAPTIVE,
            }),
        );
        self.fingerprint = fingerprint_of(&self.tables);
    }

    /// Captured `owner.table` names, sorted.
    pub fn captured_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.tables.values().map(|t| t.def.qualified_name()).collect();
        names.sort();
        names
    }

    /// Stable fingerprint of the captured set, recorded in checkpoints.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Serializable table definitions, for forced schema snapshots.
    pub fn table_defs(&self) -> Vec<TableDef> {
        let mut defs: Vec<TableDef> =
            self.tables.values().map(|t| t.def.clone()).collect();
        defs.sort_by_key(|d| d.obj);
        defs
    }
}

/// FNV-1a over the sorted serialized definitions: deterministic across
/// processes, unlike the default hasher.
fn fingerprint_of(tables: &HashMap<u32, Arc<CapturedTable>>) -> u64 {
    let mut defs: Vec<&CapturedTable> = tables.values().map(Arc::as_ref).collect();
    defs.sort_by_key(|t| t.def.obj);

    let mut hash: u64 = 0xcbf29ce484222325;
    let mut eat = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x100000001b3);
        }
    };
    for table in defs {
        eat(&table.def.obj.to_le_bytes());
        eat(table.def.owner.as_bytes());
        eat(table.def.name.as_bytes());
        for column in &table.def.columns {
            eat(column.name.as_bytes());
            eat(&[u8::from(column.key)]);
        }
        for key in &table.key_columns {
            eat(key.as_bytes());
        }
        eat(&[table.options]);
    }
    hash
}
