//! Replication metadata: the schema map, on-disk state, the replay
//! position, and the checkpoint protocol.

pub mod checkpoint;
pub mod schema;
pub mod state;

use crate::common::{Result, Scn, Xid};
use parking_lot::{Mutex, RwLock};
use schema::{Schema, SchemaElement, TableDef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Position in the redo stream the parser has applied up to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPosition {
    pub sequence: u32,
    pub block_offset: u64,
    pub scn: Scn,
}

/// What the writer has confirmed so far, mirrored out of the ring for the
/// checkpoint thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmedState {
    pub id: Option<u64>,
    pub scn: Scn,
    pub lwn_scn: Scn,
    pub bytes: u64,
}

/// An open transaction and where it started, for checkpoint records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenXid {
    pub xid: Xid,
    pub first_scn: Scn,
    pub first_sequence: u32,
    pub first_offset: u64,
}

/// Shared replication metadata. One per source.
pub struct Metadata {
    pub database: String,
    state: state::StateDisk,
    /// Committed schema; read without blocking writers after commit.
    schema: RwLock<Arc<Schema>>,
    /// Elements staged by configuration (re)load, not yet committed.
    staged: Mutex<Vec<SchemaElement>>,
    users: Mutex<BTreeSet<String>>,
    /// Table definitions provided by the catalog loader.
    catalog: Mutex<Vec<TableDef>>,
    position: Mutex<ReplayPosition>,
    confirmed: Mutex<ConfirmedState>,
    open_xids: Mutex<std::collections::BTreeMap<Xid, OpenXid>>,
    /// Guards the schema swap and the open-XID snapshot during checkpoint
    /// and configuration reload.
    pub txn_mutex: Mutex<()>,
}

impl Metadata {
    pub fn new(database: impl Into<String>, state: state::StateDisk) -> Arc<Metadata> {
        Arc::new(Metadata {
            database: database.into(),
            state,
            schema: RwLock::new(Arc::new(Schema::empty())),
            staged: Mutex::new(Vec::new()),
            users: Mutex::new(BTreeSet::new()),
            catalog: Mutex::new(Vec::new()),
            position: Mutex::new(ReplayPosition::default()),
            confirmed: Mutex::new(ConfirmedState::default()),
            open_xids: Mutex::new(std::collections::BTreeMap::new()),
            txn_mutex: Mutex::new(()),
        })
    }

    pub fn state(&self) -> &state::StateDisk {
        &self.state
    }

    // ------------------------------------------------------------------
    // Schema staging and commit
    // ------------------------------------------------------------------

    /// Replace the staged element set (configuration load or reload).
    pub fn reset_elements(&self) {
        self.staged.lock().clear();
    }

    pub fn add_element(&self, element: SchemaElement) {
        self.staged.lock().push(element);
    }

    /// Load table definitions from the catalog loader.
    pub fn set_catalog(&self, tables: Vec<TableDef>) {
        *self.catalog.lock() = tables;
    }

    /// Compile the staged elements against the catalog and atomically
    /// publish the result. Returns the captured-table names.
    ///
    /// On reload, the owner set must be unchanged: a user added or removed
    /// at runtime is a configuration error (code 20007).
    pub fn commit_elements(&self, enforce_users: bool) -> Result<Vec<String>> {
        let _txn = self.txn_mutex.lock();

        let staged = self.staged.lock().clone();
        let catalog = self.catalog.lock().clone();
        let schema = Schema::build(&staged, &catalog)?;

        let new_users: BTreeSet<String> =
            staged.iter().map(|e| e.owner_pattern.clone()).collect();
        {
            let mut users = self.users.lock();
            if enforce_users && *users != new_users {
                if let Some(user) = users.difference(&new_users).next() {
                    return Err(crate::common::Error::config(
                        20007,
                        format!("user {user} is missing after reload"),
                    ));
                }
                if let Some(user) = new_users.difference(&*users).next() {
                    return Err(crate::common::Error::config(
                        20007,
                        format!("user {user} is redundant after reload"),
                    ));
                }
            }
            *users = new_users;
        }

        let found: Vec<String> = schema.captured_names();
        for name in &found {
            info!("- found: {name}");
        }
        *self.schema.write() = Arc::new(schema);
        Ok(found)
    }

    /// The committed schema. Cheap to call; clones an `Arc`.
    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema.read())
    }

    /// Register a synthesized table (adaptive schema) into the committed
    /// map.
    pub fn adopt_table(&self, def: TableDef) {
        let _txn = self.txn_mutex.lock();
        let mut guard = self.schema.write();
        let mut schema = (**guard).clone();
        schema.adopt(def);
        *guard = Arc::new(schema);
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    pub fn set_position(&self, position: ReplayPosition) {
        *self.position.lock() = position;
    }

    pub fn position(&self) -> ReplayPosition {
        *self.position.lock()
    }

    /// Record a transaction as open, with the position of its first
    /// record (parser, at BEGIN).
    pub fn note_open_xid(&self, open: OpenXid) {
        self.open_xids.lock().insert(open.xid, open);
    }

    /// Remove a transaction on commit, rollback or skip.
    pub fn note_closed_xid(&self, xid: Xid) {
        self.open_xids.lock().remove(&xid);
    }

    /// Snapshot of in-flight transactions, ordered by XID.
    pub fn open_xids(&self) -> Vec<OpenXid> {
        self.open_xids.lock().values().copied().collect()
    }

    /// Called by the writer after each confirmed frame.
    pub fn note_confirmed(&self, id: u64, scn: Scn, lwn_scn: Scn, bytes: u64) {
        let mut confirmed = self.confirmed.lock();
        confirmed.id = Some(id);
        confirmed.scn = scn;
        confirmed.lwn_scn = lwn_scn;
        confirmed.bytes += bytes;
    }

    pub fn confirmed(&self) -> ConfirmedState {
        *self.confirmed.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::schema::ColumnDef;

    fn metadata(dir: &std::path::Path) -> Arc<Metadata> {
        Metadata::new("testdb", state::StateDisk::new(dir, "testdb", 3))
    }

    fn table(obj: u32, owner: &str, name: &str) -> TableDef {
        TableDef {
            obj,
            owner: owner.into(),
            name: name.into(),
            columns: vec![ColumnDef { name: "id".into(), key: true }],
        }
    }

    #[test]
    fn test_commit_elements_builds_schema() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(dir.path());
        meta.set_catalog(vec![table(10, "APP", "USERS"), table(11, "OTHER", "T")]);
        meta.add_element(SchemaElement::new("APP", "USERS".to_string()).unwrap());

        let found = meta.commit_elements(false).unwrap();
        assert_eq!(found, vec!["APP.USERS".to_string()]);
        assert!(meta.schema().get(10).is_some());
        assert!(meta.schema().get(11).is_none());
    }

    #[test]
    fn test_reload_with_changed_users_fails() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(dir.path());
        meta.set_catalog(vec![table(10, "APP", "USERS")]);
        meta.add_element(SchemaElement::new("APP", "USERS".to_string()).unwrap());
        meta.commit_elements(false).unwrap();

        meta.reset_elements();
        meta.add_element(SchemaElement::new("NEWUSER", ".*".to_string()).unwrap());
        let err = meta.commit_elements(true).unwrap_err();
        assert_eq!(err.code(), 20007);
    }

    #[test]
    fn test_confirmed_accumulates_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let meta = metadata(dir.path());
        meta.note_confirmed(0, Scn(10), Scn(9), 100);
        meta.note_confirmed(1, Scn(12), Scn(11), 50);
        let confirmed = meta.confirmed();
        assert_eq!(confirmed.id, Some(1));
        assert_eq!(confirmed.bytes, 150);
        assert_eq!(confirmed.scn, Scn(12));
    }
}
