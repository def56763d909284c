//! Relational store collaborator
//!
//! Handlers talk to the database through `RecordStore`. The queries they
//! issue are the constants below; `MemoryRecordStore` understands exactly
//! those, which is enough for tests and single-process use.

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One row, column name to value
pub type Row = Map<String, Value>;

pub const USERS: &str = "users";
pub const MESSAGES: &str = "messages";

pub const FIND_USER: &str = "SELECT * FROM users WHERE username = ?";
pub const LIST_MESSAGES: &str = "SELECT * FROM messages ORDER BY created_at DESC";
pub const SEARCH_MESSAGES: &str =
    "SELECT * FROM messages WHERE message LIKE ? ORDER BY created_at DESC";

/// Access to the relational database
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a row, returning its id
    async fn insert(&self, table: &str, fields: Row) -> Result<u64, StoreError>;

    /// Run a parameterized query
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Row>>,
    next_id: HashMap<String, u64>,
}

/// In-memory record store
pub struct MemoryRecordStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the database going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of rows in a table
    pub fn count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .map(|t| t.rows.get(table).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError("database unavailable".to_string()));
        }
        self.tables
            .lock()
            .map_err(|e| StoreError(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn table_rows<'a>(tables: &'a Tables, name: &str) -> &'a [Row] {
    tables.rows.get(name).map(Vec::as_slice).unwrap_or(&[])
}

fn text_param(params: &[Value], index: usize) -> Result<&str, StoreError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError(format!("missing text parameter {}", index)))
}

fn column<'a>(row: &'a Row, name: &str) -> &'a str {
    row.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// Newest first; ids are assigned in insertion order
fn newest_first<'a>(rows: impl DoubleEndedIterator<Item = &'a Row>) -> Vec<Row> {
    rows.rev().cloned().collect()
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, table: &str, mut fields: Row) -> Result<u64, StoreError> {
        let mut tables = self.tables()?;
        let id = {
            let next = tables.next_id.entry(table.to_string()).or_insert(0);
            *next += 1;
            *next
        };
        fields.insert("id".to_string(), Value::from(id));
        tables.rows.entry(table.to_string()).or_default().push(fields);
        Ok(id)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables()?;

        match sql {
            FIND_USER => {
                let username = text_param(params, 0)?;
                Ok(table_rows(&tables, USERS)
                    .iter()
                    .filter(|row| column(row, "username") == username)
                    .cloned()
                    .collect())
            }
            LIST_MESSAGES => Ok(newest_first(table_rows(&tables, MESSAGES).iter())),
            SEARCH_MESSAGES => {
                let needle = text_param(params, 0)?.trim_matches('%');
                Ok(newest_first(
                    table_rows(&tables, MESSAGES)
                        .iter()
                        .filter(|row| column(row, "message").contains(needle)),
                ))
            }
            other => Err(StoreError(format!("unsupported query: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_per_table() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.insert(USERS, row(json!({"username": "a"}))).await.unwrap(), 1);
        assert_eq!(store.insert(USERS, row(json!({"username": "b"}))).await.unwrap(), 2);
        assert_eq!(store.insert(MESSAGES, row(json!({"message": "m"}))).await.unwrap(), 1);
        assert_eq!(store.count(USERS), 2);
    }

    #[tokio::test]
    async fn test_find_user() {
        let store = MemoryRecordStore::new();
        store.insert(USERS, row(json!({"username": "alice"}))).await.unwrap();

        let found = store.query(FIND_USER, &[json!("alice")]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.query(FIND_USER, &[json!("nobody")]).await.unwrap().is_empty());
        assert!(store.query(FIND_USER, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_messages_newest_first_and_search() {
        let store = MemoryRecordStore::new();
        for text in ["hello world", "goodbye", "hello again"] {
            store.insert(MESSAGES, row(json!({"message": text}))).await.unwrap();
        }

        let all = store.query(LIST_MESSAGES, &[]).await.unwrap();
        assert_eq!(all[0]["message"], "hello again");
        assert_eq!(all[2]["message"], "hello world");

        let hits = store.query(SEARCH_MESSAGES, &[json!("%hello%")]).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["message"], "hello again");
    }

    #[tokio::test]
    async fn test_unavailable_and_unknown_query() {
        let store = MemoryRecordStore::new();
        assert!(store.query("DROP TABLE users", &[]).await.is_err());

        store.set_available(false);
        assert!(store.insert(USERS, Row::new()).await.is_err());
        assert!(store.query(LIST_MESSAGES, &[]).await.is_err());
    }
}
