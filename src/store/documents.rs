use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};

use super::{StoreError, StoreResult};
use crate::model::now_rfc3339;

/// Hard cap on operations in one atomic commit.
pub const MAX_BATCH_WRITES: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

/// Equality filter on a top-level field. A missing field compares as `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    fn matches(&self, data: &Value) -> bool {
        data.get(&self.field).unwrap_or(&Value::Null) == &self.value
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the whole document.
    Set {
        collection: String,
        id: String,
        data: Value,
    },
    /// Overwrite the given top-level fields, creating the document if needed.
    Merge {
        collection: String,
        id: String,
        data: Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Operations committed atomically by [`DocumentStore::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, collection: &str, id: &str, data: Value) -> &mut Self {
        self.ops.push(WriteOp::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        });
        self
    }

    pub fn merge(&mut self, collection: &str, id: &str, data: Value) -> &mut Self {
        self.ops.push(WriteOp::Merge {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        });
        self
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[cfg(test)]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

impl FromIterator<WriteOp> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = WriteOp>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

/// A collection-of-documents backend: equality queries and atomic batches.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>>;

    async fn query(&self, collection: &str, filters: &[Filter]) -> StoreResult<Vec<Document>>;

    /// Apply every operation of `batch` or none of them.
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;

    async fn set(&self, collection: &str, id: &str, data: Value) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.set(collection, id, data);
        self.commit(batch).await
    }

    async fn merge(&self, collection: &str, id: &str, data: Value) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.merge(collection, id, data);
        self.commit(batch).await
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(collection, id);
        self.commit(batch).await
    }
}

/// Document collections kept in the workspace SQLite database.
pub struct SqliteDocuments {
    conn: Mutex<Connection>,
}

impl SqliteDocuments {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::ensure_schema(&conn).expect("create schema");
        Self::new(conn)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run `f` against the underlying connection (settings and other
    /// workspace tables that are not document collections).
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        f(&conn)
    }
}

fn parse_doc(collection: &str, id: &str, raw: &str) -> StoreResult<Value> {
    serde_json::from_str(raw).map_err(|source| StoreError::Malformed {
        collection: collection.to_string(),
        id: id.to_string(),
        source,
    })
}

#[async_trait]
impl DocumentStore for SqliteDocuments {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM documents WHERE collection = ? AND id = ?",
                (collection, id),
                |r| r.get(0),
            )
            .optional()?;
        raw.map(|r| parse_doc(collection, id, &r)).transpose()
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> StoreResult<Vec<Document>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, data FROM documents WHERE collection = ? ORDER BY rowid")?;
        let rows = stmt
            .query_map([collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for (id, raw) in rows {
            let data = parse_doc(collection, &id, &raw)?;
            if filters.iter().all(|f| f.matches(&data)) {
                out.push(Document { id, data });
            }
        }
        Ok(out)
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.len() > MAX_BATCH_WRITES {
            return Err(StoreError::BatchTooLarge {
                len: batch.len(),
                limit: MAX_BATCH_WRITES,
            });
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        for op in batch.ops {
            match op {
                WriteOp::Set {
                    collection,
                    id,
                    data,
                } => {
                    tx.execute(
                        "INSERT INTO documents(collection, id, data, updated_at)
                         VALUES(?, ?, ?, ?)
                         ON CONFLICT(collection, id) DO UPDATE SET
                           data = excluded.data,
                           updated_at = excluded.updated_at",
                        (&collection, &id, serde_json::to_string(&data)?, &now),
                    )?;
                }
                WriteOp::Merge {
                    collection,
                    id,
                    data,
                } => {
                    let existing: Option<String> = tx
                        .query_row(
                            "SELECT data FROM documents WHERE collection = ? AND id = ?",
                            (&collection, &id),
                            |r| r.get(0),
                        )
                        .optional()?;
                    let mut merged = match existing {
                        Some(raw) => parse_doc(&collection, &id, &raw)?,
                        None => Value::Object(Default::default()),
                    };
                    if let (Some(target), Value::Object(fields)) = (merged.as_object_mut(), data)
                    {
                        for (k, v) in fields {
                            target.insert(k, v);
                        }
                    }
                    tx.execute(
                        "INSERT INTO documents(collection, id, data, updated_at)
                         VALUES(?, ?, ?, ?)
                         ON CONFLICT(collection, id) DO UPDATE SET
                           data = excluded.data,
                           updated_at = excluded.updated_at",
                        (&collection, &id, serde_json::to_string(&merged)?, &now),
                    )?;
                }
                WriteOp::Delete { collection, id } => {
                    tx.execute(
                        "DELETE FROM documents WHERE collection = ? AND id = ?",
                        (&collection, &id),
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
