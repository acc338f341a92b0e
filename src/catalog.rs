//! The table catalog: registered base streams and relations.
//!
//! Each registration carries the table's schema, whether it is a stream
//! or a relation, and the pull source supplying its tuples. `SysStream`
//! occupies id 0 with its fixed schema and no external source — its
//! tuples come from the system-stream generator.
//!
//! A registered source is consumed by the query that reads the table;
//! since every queue has a single reader, each base table feeds exactly
//! one registered query.

use std::collections::HashMap;

use crate::error::RilletError;
use crate::exec::monitor::{SYS_STREAM_ID, SYS_STREAM_NAME, sys_stream_schema};
use crate::interface::TableSource;
use crate::types::Attr;

/// Maximum registered tables.
pub const MAX_TABLES: usize = 50;

pub struct TableEntry {
    pub id: usize,
    pub name: String,
    pub schema: Vec<Attr>,
    pub is_stream: bool,
    source: Option<Box<dyn TableSource>>,
}

pub struct TableCatalog {
    by_name: HashMap<String, usize>,
    entries: Vec<TableEntry>,
}

impl std::fmt::Debug for TableCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCatalog")
            .field("tables", &self.entries.len())
            .finish()
    }
}

impl Default for TableCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TableCatalog {
    /// A fresh catalog, with `SysStream` pre-registered as id 0.
    pub fn new() -> Self {
        let mut catalog = Self {
            by_name: HashMap::new(),
            entries: Vec::new(),
        };
        catalog.by_name.insert(SYS_STREAM_NAME.to_string(), SYS_STREAM_ID);
        catalog.entries.push(TableEntry {
            id: SYS_STREAM_ID,
            name: SYS_STREAM_NAME.to_string(),
            schema: sys_stream_schema(),
            is_stream: true,
            source: None,
        });
        catalog
    }

    /// Register a base table; returns its id.
    pub fn register(
        &mut self,
        name: &str,
        schema: Vec<Attr>,
        is_stream: bool,
        source: Box<dyn TableSource>,
    ) -> Result<usize, RilletError> {
        if self.by_name.contains_key(name) {
            return Err(RilletError::DuplicateTable(name.to_string()));
        }
        if self.entries.len() == MAX_TABLES {
            return Err(RilletError::InvalidParam(format!(
                "too many tables (max {MAX_TABLES})"
            )));
        }
        if schema.is_empty() {
            return Err(RilletError::InvalidParam(format!(
                "table {name}: empty schema"
            )));
        }
        let id = self.entries.len();
        self.by_name.insert(name.to_string(), id);
        self.entries.push(TableEntry {
            id,
            name: name.to_string(),
            schema,
            is_stream,
            source: Some(source),
        });
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Result<&TableEntry, RilletError> {
        let id = self
            .by_name
            .get(name)
            .ok_or_else(|| RilletError::UnknownTable(name.to_string()))?;
        Ok(&self.entries[*id])
    }

    /// Take the table's source for instantiation. Fails when the table is
    /// already wired into a query (sources are single-reader) or is the
    /// system stream.
    pub fn take_source(&mut self, name: &str) -> Result<Box<dyn TableSource>, RilletError> {
        let id = *self
            .by_name
            .get(name)
            .ok_or_else(|| RilletError::UnknownTable(name.to_string()))?;
        if id == SYS_STREAM_ID {
            return Err(RilletError::InvalidUse(
                "SysStream has no external source".into(),
            ));
        }
        self.entries[id].source.take().ok_or_else(|| {
            RilletError::InvalidUse(format!("table {name} is already read by a query"))
        })
    }
}
