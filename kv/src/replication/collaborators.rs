//! Stand-ins for the external collaborators this crate treats as out of
//! scope: heap/catalog access, the MVCC table, and the WAL/log manager.
//! Each gets a narrow trait plus one concrete implementation backed by this
//! crate's own storage engine, so end-to-end scenarios can run against
//! something real instead of a mock.

use std::sync::{Arc, Mutex};

use crate::error::CResult;
use crate::replication::object::{AttrChange, Lsa};
use crate::storage::engine::Engine;

/// A per-transaction multi-version concurrency identifier, assigned at
/// first write. Kept as a bare alias rather than re-exporting `mvcc`'s
/// private `Version` type, since replication treats it as an opaque key.
pub type MvccId = u64;

/// A class (table) object identifier, as handed to `get_class_name`.
pub type ClassOid = i32;

/// Heap/catalog access (`get_class_name`) and row mutation, as seen by a
/// slave applier. The original's `get_class_name` is infallible by
/// contract ("callers assert"); we keep that shape by not returning a
/// `CResult` from lookups, only from mutations.
pub trait ClassCatalog: Send + Sync {
    /// Resolves a class OID to its name. Infallible by contract: an
    /// unknown OID is a caller bug, not a runtime error.
    fn class_name(&self, class_oid: ClassOid) -> String;

    fn execute_statement(&self, statement: &str) -> CResult<()>;
    fn insert_row(&self, class_name: &str, key: &[u8], record: &[u8]) -> CResult<()>;
    fn delete_row(&self, class_name: &str, key: &[u8]) -> CResult<()>;
    fn update_attrs(&self, class_name: &str, key: &[u8], changes: &[AttrChange]) -> CResult<()>;
    fn replace_record(&self, class_name: &str, key: &[u8], record: &[u8]) -> CResult<()>;
}

/// An `Engine`-backed catalog: classes are key prefixes, rows are raw
/// key/value pairs. Good enough to exercise `apply()` end to end in tests
/// without a real heap.
pub struct EngineClassCatalog<E: Engine> {
    engine: Arc<Mutex<E>>,
}

impl<E: Engine> EngineClassCatalog<E> {
    pub fn new(engine: Arc<Mutex<E>>) -> Self {
        EngineClassCatalog { engine }
    }

    fn row_key(class_name: &str, key: &[u8]) -> Vec<u8> {
        let mut out = class_name.as_bytes().to_vec();
        out.push(0);
        out.extend_from_slice(key);
        out
    }
}

impl<E: Engine> ClassCatalog for EngineClassCatalog<E> {
    fn class_name(&self, class_oid: ClassOid) -> String {
        format!("class_{}", class_oid)
    }

    fn execute_statement(&self, _statement: &str) -> CResult<()> {
        // SBR replays a SQL statement against the local engine; out of
        // scope for this stand-in, which only models row-level apply.
        Ok(())
    }

    fn insert_row(&self, class_name: &str, key: &[u8], record: &[u8]) -> CResult<()> {
        let mut engine = self.engine.lock().unwrap();
        engine.set(&Self::row_key(class_name, key), record.to_vec())
    }

    fn delete_row(&self, class_name: &str, key: &[u8]) -> CResult<()> {
        let mut engine = self.engine.lock().unwrap();
        engine.delete(&Self::row_key(class_name, key))?;
        Ok(())
    }

    fn update_attrs(&self, class_name: &str, key: &[u8], changes: &[AttrChange]) -> CResult<()> {
        let mut engine = self.engine.lock().unwrap();
        let row_key = Self::row_key(class_name, key);
        let mut record = engine.get(&row_key)?.unwrap_or_default();
        for change in changes {
            record = apply_attr_change(record, change);
        }
        engine.set(&row_key, record)
    }

    fn replace_record(&self, class_name: &str, key: &[u8], record: &[u8]) -> CResult<()> {
        let mut engine = self.engine.lock().unwrap();
        engine.set(&Self::row_key(class_name, key), record.to_vec())
    }
}

/// Folds one attribute change into a flat record, appending
/// `column_id:new_value` pairs. The real encoding lives in the heap layer
/// that's out of scope here; this just needs to be deterministic for tests.
fn apply_attr_change(mut record: Vec<u8>, change: &AttrChange) -> Vec<u8> {
    record.extend_from_slice(&change.column_id.to_be_bytes());
    record.extend_from_slice(&(change.new_value.len() as u32).to_be_bytes());
    record.extend_from_slice(&change.new_value);
    record
}

/// A recording catalog for tests: every call is pushed onto a log instead
/// of touching storage, so assertions can check dispatch without an
/// engine.
#[derive(Default)]
pub struct NullClassCatalog {
    calls: Mutex<Vec<String>>,
}

impl NullClassCatalog {
    pub fn new() -> Self {
        NullClassCatalog::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ClassCatalog for NullClassCatalog {
    fn class_name(&self, class_oid: ClassOid) -> String {
        format!("class_{}", class_oid)
    }

    fn execute_statement(&self, statement: &str) -> CResult<()> {
        self.calls.lock().unwrap().push(format!("execute_statement({})", statement));
        Ok(())
    }

    fn insert_row(&self, class_name: &str, _key: &[u8], _record: &[u8]) -> CResult<()> {
        self.calls.lock().unwrap().push(format!("insert_row({})", class_name));
        Ok(())
    }

    fn delete_row(&self, class_name: &str, _key: &[u8]) -> CResult<()> {
        self.calls.lock().unwrap().push(format!("delete_row({})", class_name));
        Ok(())
    }

    fn update_attrs(&self, class_name: &str, _key: &[u8], _changes: &[AttrChange]) -> CResult<()> {
        self.calls.lock().unwrap().push(format!("update_attrs({})", class_name));
        Ok(())
    }

    fn replace_record(&self, class_name: &str, _key: &[u8], _record: &[u8]) -> CResult<()> {
        self.calls.lock().unwrap().push(format!("replace_record({})", class_name));
        Ok(())
    }
}

/// The MVCC table's `complete_group_mvcc` hook: marks every MVCCID in a
/// closed group as committed-and-visible.
pub trait MvccTable: Send + Sync {
    fn complete_group_mvcc(&self, mvccids: &[MvccId]) -> CResult<()>;
}

/// An in-memory stand-in that just records which MVCCIDs were completed, in
/// order, so tests can assert on group membership.
#[derive(Default)]
pub struct RecordingMvccTable {
    completed: Mutex<Vec<MvccId>>,
}

impl RecordingMvccTable {
    pub fn new() -> Self {
        RecordingMvccTable::default()
    }

    pub fn completed(&self) -> Vec<MvccId> {
        self.completed.lock().unwrap().clone()
    }
}

impl MvccTable for RecordingMvccTable {
    fn complete_group_mvcc(&self, mvccids: &[MvccId]) -> CResult<()> {
        self.completed.lock().unwrap().extend_from_slice(mvccids);
        Ok(())
    }
}

/// The WAL/log manager hooks this crate invokes: `append_group_complete_record`
/// (named `log_append_group_complete` in the original) and
/// `wakeup_log_flush`.
pub trait LogManager: Send + Sync {
    /// Appends the group-complete WAL record, returning the LSA range it
    /// occupied.
    fn append_group_complete_record(&self, group_id: u64, start_stream_pos: u64) -> CResult<(Lsa, Lsa)>;

    fn wakeup_log_flush(&self);
}

/// A log manager backed by this crate's own append-only storage engine:
/// each group-complete record is one `Engine::set` keyed by group id, and
/// the LSA range returned is synthesized from the engine's own position
/// bookkeeping so tests have something real to assert on.
pub struct EngineLogManager<E: Engine> {
    engine: Arc<Mutex<E>>,
    next_page: std::sync::atomic::AtomicI64,
}

impl<E: Engine> EngineLogManager<E> {
    pub fn new(engine: Arc<Mutex<E>>) -> Self {
        EngineLogManager { engine, next_page: std::sync::atomic::AtomicI64::new(1) }
    }
}

impl<E: Engine> LogManager for EngineLogManager<E> {
    fn append_group_complete_record(&self, group_id: u64, start_stream_pos: u64) -> CResult<(Lsa, Lsa)> {
        let page = self.next_page.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let start = Lsa::new(page, 0);
        let end = Lsa::new(page, 1);
        let mut engine = self.engine.lock().unwrap();
        let key = format!("__group_complete:{}", group_id);
        engine.set(key.as_bytes(), start_stream_pos.to_be_bytes().to_vec())?;
        Ok((start, end))
    }

    fn wakeup_log_flush(&self) {
        // This engine flushes synchronously on `flush()`; there is no
        // separate flush daemon to wake here.
    }
}
