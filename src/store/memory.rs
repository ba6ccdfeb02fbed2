//! In-memory [`Connection`] backend.
//!
//! `MemoryConnection` interprets the ANSI statement templates over plain
//! maps, with a pending journal that gives commit/rollback the same
//! semantics a SQL backend would: writes are visible to reads on the same
//! connection before commit, and rollback discards them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::{SpatialError, SpatialResult};
use crate::node::PageId;
use crate::store::dialect::{
    CatalogRecord, Connection, PageRecord, SharedConnection, SqlValue, CATALOG_TABLE,
};

/// What a statement template resolves to.
enum Target {
    CreateTable(String),
    InsertPage(String),
    UpdatePage(String),
    SelectPage(String),
    MaxId(String),
    CatalogInsert,
    CatalogQuery,
}

fn classify(statement: &str) -> SpatialResult<Target> {
    let tokens: Vec<&str> = statement.split_whitespace().collect();
    let target = match tokens.as_slice() {
        ["CREATE", "TABLE", table, ..] => Target::CreateTable((*table).to_string()),
        ["INSERT", "INTO", table, ..] if *table == CATALOG_TABLE => Target::CatalogInsert,
        ["INSERT", "INTO", table, ..] => Target::InsertPage((*table).to_string()),
        ["UPDATE", table, "SET", ..] => Target::UpdatePage((*table).to_string()),
        ["SELECT", "MAX(ID)", "FROM", table] => Target::MaxId((*table).to_string()),
        ["SELECT", ..] => {
            let table = tokens
                .iter()
                .position(|token| *token == "FROM")
                .and_then(|at| tokens.get(at + 1))
                .ok_or_else(|| {
                    SpatialError::Persistence(format!("unsupported statement: {statement}"))
                })?;
            if *table == CATALOG_TABLE {
                Target::CatalogQuery
            } else {
                Target::SelectPage((*table).to_string())
            }
        }
        _ => {
            return Err(SpatialError::Persistence(format!(
                "unsupported statement: {statement}"
            )))
        }
    };
    Ok(target)
}

enum PendingWrite {
    Page { table: String, record: PageRecord },
    Catalog(CatalogRecord),
}

/// A map-backed connection for tests and embedded use.
#[derive(Default)]
pub struct MemoryConnection {
    tables: HashMap<String, BTreeMap<PageId, PageRecord>>,
    catalog: HashMap<String, CatalogRecord>,
    pending: Vec<PendingWrite>,
}

impl MemoryConnection {
    pub fn new() -> MemoryConnection {
        MemoryConnection::default()
    }

    /// Wraps the connection for sharing across nodes.
    pub fn into_shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self))
    }

    /// Committed row count of `table`, for inspection after commit.
    pub fn committed_pages(&self, table: &str) -> usize {
        self.tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }

    fn known_table(&self, table: &str) -> SpatialResult<()> {
        if self.tables.contains_key(table) {
            Ok(())
        } else {
            Err(SpatialError::Persistence(format!("no such table: {table}")))
        }
    }

    fn pending_page(&self, table: &str, id: PageId) -> Option<&PageRecord> {
        self.pending.iter().rev().find_map(|write| match write {
            PendingWrite::Page {
                table: t,
                record,
            } if t.as_str() == table && record.id == id => Some(record),
            _ => None,
        })
    }

    fn page_exists(&self, table: &str, id: PageId) -> bool {
        self.pending_page(table, id).is_some()
            || self
                .tables
                .get(table)
                .map(|rows| rows.contains_key(&id))
                .unwrap_or(false)
    }
}

fn int_param(params: &[SqlValue], at: usize) -> SpatialResult<i64> {
    match params.get(at) {
        Some(SqlValue::Int(value)) => Ok(*value),
        other => Err(SpatialError::Persistence(format!(
            "expected integer parameter at {at}, got {other:?}"
        ))),
    }
}

fn bool_param(params: &[SqlValue], at: usize) -> SpatialResult<bool> {
    match params.get(at) {
        Some(SqlValue::Bool(value)) => Ok(*value),
        other => Err(SpatialError::Persistence(format!(
            "expected boolean parameter at {at}, got {other:?}"
        ))),
    }
}

fn bytes_param(params: &[SqlValue], at: usize) -> SpatialResult<Vec<u8>> {
    match params.get(at) {
        Some(SqlValue::Bytes(value)) => Ok(value.clone()),
        other => Err(SpatialError::Persistence(format!(
            "expected blob parameter at {at}, got {other:?}"
        ))),
    }
}

fn text_param(params: &[SqlValue], at: usize) -> SpatialResult<String> {
    match params.get(at) {
        Some(SqlValue::Text(value)) => Ok(value.clone()),
        other => Err(SpatialError::Persistence(format!(
            "expected text parameter at {at}, got {other:?}"
        ))),
    }
}

impl Connection for MemoryConnection {
    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> SpatialResult<()> {
        match classify(statement)? {
            // DDL takes effect immediately, as it would in most backends.
            Target::CreateTable(table) => {
                self.tables.entry(table).or_default();
                Ok(())
            }
            Target::InsertPage(table) => {
                self.known_table(&table)?;
                let id = int_param(params, 0)? as PageId;
                if self.page_exists(&table, id) {
                    return Err(SpatialError::Persistence(format!(
                        "duplicate page id {id} in table {table}"
                    )));
                }
                let record = PageRecord {
                    id,
                    leaf: bool_param(params, 1)?,
                    payload: bytes_param(params, 2)?,
                };
                self.pending.push(PendingWrite::Page { table, record });
                Ok(())
            }
            Target::UpdatePage(table) => {
                self.known_table(&table)?;
                let id = int_param(params, 2)? as PageId;
                if !self.page_exists(&table, id) {
                    return Err(SpatialError::Persistence(format!(
                        "no page {id} in table {table}"
                    )));
                }
                let record = PageRecord {
                    id,
                    leaf: bool_param(params, 0)?,
                    payload: bytes_param(params, 1)?,
                };
                self.pending.push(PendingWrite::Page { table, record });
                Ok(())
            }
            Target::CatalogInsert => {
                let record = CatalogRecord {
                    table: text_param(params, 0)?,
                    root_page: int_param(params, 1)? as PageId,
                    dimension: int_param(params, 2)? as u32,
                };
                self.pending.push(PendingWrite::Catalog(record));
                Ok(())
            }
            _ => Err(SpatialError::Persistence(format!(
                "not an executable statement: {statement}"
            ))),
        }
    }

    fn query_page(&mut self, statement: &str, id: PageId) -> SpatialResult<Option<PageRecord>> {
        match classify(statement)? {
            Target::SelectPage(table) => {
                self.known_table(&table)?;
                if let Some(record) = self.pending_page(&table, id) {
                    return Ok(Some(record.clone()));
                }
                Ok(self
                    .tables
                    .get(&table)
                    .and_then(|rows| rows.get(&id))
                    .cloned())
            }
            _ => Err(SpatialError::Persistence(format!(
                "not a page query: {statement}"
            ))),
        }
    }

    fn query_scalar(
        &mut self,
        statement: &str,
        _params: &[SqlValue],
    ) -> SpatialResult<Option<i64>> {
        match classify(statement)? {
            Target::MaxId(table) => {
                self.known_table(&table)?;
                let committed = self
                    .tables
                    .get(&table)
                    .and_then(|rows| rows.keys().next_back().copied());
                let pending = self
                    .pending
                    .iter()
                    .filter_map(|write| match write {
                        PendingWrite::Page { table: t, record } if *t == table => Some(record.id),
                        _ => None,
                    })
                    .max();
                Ok(committed.max(pending).map(|id| id as i64))
            }
            _ => Err(SpatialError::Persistence(format!(
                "not a scalar query: {statement}"
            ))),
        }
    }

    fn query_catalog(
        &mut self,
        statement: &str,
        table: &str,
    ) -> SpatialResult<Option<CatalogRecord>> {
        match classify(statement)? {
            Target::CatalogQuery => {
                let pending = self.pending.iter().rev().find_map(|write| match write {
                    PendingWrite::Catalog(record) if record.table == table => Some(record.clone()),
                    _ => None,
                });
                Ok(pending.or_else(|| self.catalog.get(table).cloned()))
            }
            _ => Err(SpatialError::Persistence(format!(
                "not a catalog query: {statement}"
            ))),
        }
    }

    fn commit(&mut self) -> SpatialResult<()> {
        for write in self.pending.drain(..) {
            match write {
                PendingWrite::Page { table, record } => {
                    self.tables.entry(table).or_default().insert(record.id, record);
                }
                PendingWrite::Catalog(record) => {
                    self.catalog.insert(record.table.clone(), record);
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> SpatialResult<()> {
        self.pending.clear();
        Ok(())
    }
}
