//! Persistence abstraction: statement dialects and the connection contract.
//!
//! A [`Dialect`] translates node load/save operations into backend-specific
//! parameterized SQL templates; a [`Connection`] executes those templates
//! against the backing store. The index core never depends on a concrete
//! SQL grammar — any backend (embedded engine, client/server RDBMS)
//! implements these two traits.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::SpatialResult;
use crate::node::PageId;

/// One node row in the backing store: an integer page id, the leaf flag and
/// an opaque binary payload.
#[derive(Clone, Debug, PartialEq)]
pub struct PageRecord {
    pub id: PageId,
    pub leaf: bool,
    pub payload: Vec<u8>,
}

/// One catalog row per index: the root page id and the dimension, used to
/// find the root when reopening an existing index.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogRecord {
    pub table: String,
    pub root_page: PageId,
    pub dimension: u32,
}

/// A parameter bound into a statement template.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Int(i64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

/// A transactional connection to the backing store (consumed interface).
///
/// Statements are plain parameterized templates produced by a [`Dialect`];
/// mutations become visible to other connections only on `commit` and are
/// discarded by `rollback`.
pub trait Connection: Send {
    /// Executes a mutating statement with the given parameters.
    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> SpatialResult<()>;

    /// Fetches a single node row by page id.
    fn query_page(&mut self, statement: &str, id: PageId) -> SpatialResult<Option<PageRecord>>;

    /// Runs a scalar query (e.g. a max-aggregate); `None` for an empty
    /// result set.
    fn query_scalar(&mut self, statement: &str, params: &[SqlValue])
        -> SpatialResult<Option<i64>>;

    /// Fetches the catalog row for the given index table.
    fn query_catalog(
        &mut self,
        statement: &str,
        table: &str,
    ) -> SpatialResult<Option<CatalogRecord>>;

    fn commit(&mut self) -> SpatialResult<()>;

    fn rollback(&mut self) -> SpatialResult<()>;
}

/// A connection shared between the nodes of one persisted tree.
pub type SharedConnection = Arc<Mutex<dyn Connection>>;

/// Translates node load/save into backend-specific statements,
/// parameterized by a table name.
///
/// Implementations need no internal synchronization: the reference design
/// requires callers to hold the lock manager's exclusive lock around all
/// mutating operations, including [`Dialect::next_page_id`] allocation.
pub trait Dialect: Send + Sync {
    /// DDL creating the node table (`id`, leaf flag, payload blob). The
    /// catalog table is backend bookkeeping and assumed to exist.
    fn create_table(&self, table: &str) -> String;

    /// Template selecting one node row by page id.
    fn select_page(&self, table: &str) -> String;

    /// Template inserting a node row `(id, leaf-flag, payload)`.
    fn insert_page(&self, table: &str) -> String;

    /// Template updating a node row's `(leaf-flag, payload)` by id.
    fn update_page(&self, table: &str) -> String;

    /// Allocates a fresh page id unique within `table`.
    fn next_page_id(&self, conn: &mut dyn Connection, table: &str) -> SpatialResult<PageId>;

    /// Template selecting the catalog row for a table.
    fn catalog_query(&self) -> String;

    /// Template inserting a catalog row.
    fn catalog_insert(&self) -> String;
}

/// Name of the bookkeeping table holding one row per index.
pub const CATALOG_TABLE: &str = "SPATIAL_IDX_METADATA";

/// Generic ANSI SQL dialect. Emits plain parameterized templates that any
/// standard-compliant backend accepts; page id allocation is a max-aggregate
/// over the table.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnsiDialect;

impl Dialect for AnsiDialect {
    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {table} (ID INTEGER PRIMARY KEY, LEAF INTEGER NOT NULL, DATA BLOB NOT NULL)"
        )
    }

    fn select_page(&self, table: &str) -> String {
        format!("SELECT ID, LEAF, DATA FROM {table} WHERE ID = ?")
    }

    fn insert_page(&self, table: &str) -> String {
        format!("INSERT INTO {table} (ID, LEAF, DATA) VALUES (?, ?, ?)")
    }

    fn update_page(&self, table: &str) -> String {
        format!("UPDATE {table} SET LEAF = ?, DATA = ? WHERE ID = ?")
    }

    fn next_page_id(&self, conn: &mut dyn Connection, table: &str) -> SpatialResult<PageId> {
        let statement = format!("SELECT MAX(ID) FROM {table}");
        let max = conn.query_scalar(&statement, &[])?;
        Ok(max.map(|m| m as PageId + 1).unwrap_or(1))
    }

    fn catalog_query(&self) -> String {
        format!(
            "SELECT TABLE_NAME, ROOT_PAGE, DIMENSION FROM {CATALOG_TABLE} WHERE TABLE_NAME = ?"
        )
    }

    fn catalog_insert(&self) -> String {
        format!("INSERT INTO {CATALOG_TABLE} (TABLE_NAME, ROOT_PAGE, DIMENSION) VALUES (?, ?, ?)")
    }
}
