//! The generic table API
//!
//! Implementors provide the batch primitives. The single-key convenience operations
//! are built on top of them and map inline statuses to return values:
//! `OK` is success, `PRECONDITION_VIOLATION` is `false`, anything else is an error.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use crate::error::{DatabaseError, Result};
use crate::model::{
    BatchReadRequest, BatchWriteRequest, ReadResult, ReadStatus, VersionedValue, WriteRequest,
    WriteResult, WriteStatus,
};

#[async_trait]
pub trait DatabaseService: Send + Sync {
    /// Creates a table. Returns `false` if it already exists.
    async fn create_table(&self, name: &str) -> Result<bool>;

    /// Creates a table whose rows expire `ttl_millis` after insertion.
    async fn create_table_with_ttl(&self, name: &str, ttl_millis: u32) -> Result<bool>;

    async fn drop_table(&self, name: &str) -> Result<()>;

    async fn drop_all_tables(&self) -> Result<()>;

    async fn list_tables(&self) -> Result<BTreeSet<String>>;

    async fn batch_read(&self, batch: BatchReadRequest) -> Result<Vec<ReadResult>>;

    async fn batch_write(&self, batch: BatchWriteRequest) -> Result<Vec<WriteResult>>;

    async fn get_all(&self, table: &str) -> Result<HashMap<String, VersionedValue>>;

    async fn get(&self, table: &str, key: &str) -> Result<Option<VersionedValue>> {
        let mut results = self.batch_read(BatchReadRequest::single(table, key)).await?;
        let result = results
            .pop()
            .ok_or_else(|| DatabaseError::IllegalState("empty read result".to_string()))?;
        match result.status {
            ReadStatus::Ok => Ok(result.value),
            status => Err(DatabaseError::unexpected_status("get", status)),
        }
    }

    /// Unconditional put. Returns the value it replaced.
    async fn put(&self, table: &str, key: &str, value: Vec<u8>) -> Result<Option<VersionedValue>> {
        let result = single_write(self, WriteRequest::put(table, key, value)).await?;
        match result.status {
            WriteStatus::Ok => Ok(result.previous_value),
            status => Err(DatabaseError::unexpected_status("put", status)),
        }
    }

    async fn put_if_absent(&self, table: &str, key: &str, value: Vec<u8>) -> Result<bool> {
        let result = single_write(self, WriteRequest::put_if_absent(table, key, value)).await?;
        conditional_outcome("putIfAbsent", result.status)
    }

    async fn put_if_version_matches(
        &self,
        table: &str,
        key: &str,
        value: Vec<u8>,
        version: u64,
    ) -> Result<bool> {
        let request = WriteRequest::put_if_version(table, key, value, version);
        let result = single_write(self, request).await?;
        conditional_outcome("putIfVersionMatches", result.status)
    }

    async fn put_if_value_matches(
        &self,
        table: &str,
        key: &str,
        old_value: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let request = WriteRequest::put_if_value(table, key, old_value, value);
        let result = single_write(self, request).await?;
        conditional_outcome("putIfValueMatches", result.status)
    }

    /// Unconditional remove. Returns the removed value, if any.
    async fn remove(&self, table: &str, key: &str) -> Result<Option<VersionedValue>> {
        let result = single_write(self, WriteRequest::remove(table, key)).await?;
        match result.status {
            WriteStatus::Ok => Ok(result.previous_value),
            status => Err(DatabaseError::unexpected_status("remove", status)),
        }
    }

    async fn remove_if_version_matches(&self, table: &str, key: &str, version: u64) -> Result<bool> {
        let result = single_write(self, WriteRequest::remove_if_version(table, key, version)).await?;
        conditional_outcome("removeIfVersionMatches", result.status)
    }

    async fn remove_if_value_matches(
        &self,
        table: &str,
        key: &str,
        old_value: Vec<u8>,
    ) -> Result<bool> {
        let result = single_write(self, WriteRequest::remove_if_value(table, key, old_value)).await?;
        conditional_outcome("removeIfValueMatches", result.status)
    }
}

async fn single_write<S: DatabaseService + ?Sized>(
    service: &S,
    request: WriteRequest,
) -> Result<WriteResult> {
    let mut results = service
        .batch_write(BatchWriteRequest::single(request))
        .await?;
    results
        .pop()
        .ok_or_else(|| DatabaseError::IllegalState("empty write result".to_string()))
}

fn conditional_outcome(operation: &str, status: WriteStatus) -> Result<bool> {
    match status {
        WriteStatus::Ok => Ok(true),
        WriteStatus::PreconditionViolation => Ok(false),
        status => Err(DatabaseError::unexpected_status(operation, status)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model::TableMetadata;

    /// Single-table store that is just enough to exercise the provided methods.
    #[derive(Default)]
    struct FakeDatabase {
        tables: Mutex<HashMap<String, (TableMetadata, HashMap<String, VersionedValue>)>>,
        version: Mutex<u64>,
    }

    #[async_trait]
    impl DatabaseService for FakeDatabase {
        async fn create_table(&self, name: &str) -> Result<bool> {
            let mut tables = self.tables.lock().unwrap();
            if tables.contains_key(name) {
                return Ok(false);
            }
            tables.insert(name.to_string(), (TableMetadata::new(name), HashMap::new()));
            Ok(true)
        }

        async fn create_table_with_ttl(&self, name: &str, _ttl_millis: u32) -> Result<bool> {
            self.create_table(name).await
        }

        async fn drop_table(&self, name: &str) -> Result<()> {
            self.tables.lock().unwrap().remove(name);
            Ok(())
        }

        async fn drop_all_tables(&self) -> Result<()> {
            self.tables.lock().unwrap().clear();
            Ok(())
        }

        async fn list_tables(&self) -> Result<BTreeSet<String>> {
            Ok(self.tables.lock().unwrap().keys().cloned().collect())
        }

        async fn batch_read(&self, batch: BatchReadRequest) -> Result<Vec<ReadResult>> {
            let tables = self.tables.lock().unwrap();
            Ok(batch
                .requests
                .into_iter()
                .map(|r| match tables.get(&r.table_name) {
                    Some((_, rows)) => ReadResult {
                        status: ReadStatus::Ok,
                        value: rows.get(&r.key).cloned(),
                        table_name: r.table_name,
                        key: r.key,
                    },
                    None => ReadResult {
                        status: ReadStatus::NoSuchTable,
                        value: None,
                        table_name: r.table_name,
                        key: r.key,
                    },
                })
                .collect())
        }

        async fn batch_write(&self, batch: BatchWriteRequest) -> Result<Vec<WriteResult>> {
            let mut tables = self.tables.lock().unwrap();
            let mut version = self.version.lock().unwrap();
            let mut results = Vec::new();
            for request in batch.requests {
                let Some((_, rows)) = tables.get_mut(request.table_name()) else {
                    results.push(WriteResult::new(WriteStatus::NoSuchTable, None));
                    continue;
                };
                let current = rows.get(request.key()).cloned();
                if !request.precondition_holds(current.as_ref()) {
                    results.push(WriteResult::new(WriteStatus::PreconditionViolation, current));
                    continue;
                }
                match request.new_value() {
                    Some(value) => {
                        *version += 1;
                        rows.insert(
                            request.key().to_string(),
                            VersionedValue::new(value.to_vec(), *version),
                        );
                    }
                    None => {
                        rows.remove(request.key());
                    }
                }
                results.push(WriteResult::new(WriteStatus::Ok, current));
            }
            Ok(results)
        }

        async fn get_all(&self, table: &str) -> Result<HashMap<String, VersionedValue>> {
            let tables = self.tables.lock().unwrap();
            Ok(tables.get(table).map(|(_, rows)| rows.clone()).unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_put_returns_previous_value() {
        let db = FakeDatabase::default();
        db.create_table("t").await.unwrap();

        assert_eq!(db.put("t", "k", b"1".to_vec()).await.unwrap(), None);
        let previous = db.put("t", "k", b"2".to_vec()).await.unwrap().unwrap();
        assert_eq!(previous.value, b"1".to_vec());
        assert_eq!(db.get("t", "k").await.unwrap().unwrap().value, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_conditional_ops_map_violation_to_false() {
        let db = FakeDatabase::default();
        db.create_table("t").await.unwrap();

        assert!(db.put_if_absent("t", "k", b"a".to_vec()).await.unwrap());
        assert!(!db.put_if_absent("t", "k", b"b".to_vec()).await.unwrap());

        let version = db.get("t", "k").await.unwrap().unwrap().version;
        assert!(!db.put_if_version_matches("t", "k", b"c".to_vec(), version + 1).await.unwrap());
        assert!(db.put_if_version_matches("t", "k", b"c".to_vec(), version).await.unwrap());
        assert!(!db.remove_if_value_matches("t", "k", b"a".to_vec()).await.unwrap());
        assert!(db.remove_if_value_matches("t", "k", b"c".to_vec()).await.unwrap());
        assert_eq!(db.get("t", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_table_is_an_error() {
        let db = FakeDatabase::default();

        let err = db.put_if_absent("nope", "k", b"v".to_vec()).await.unwrap_err();
        assert_eq!(
            err,
            DatabaseError::unexpected_status("putIfAbsent", WriteStatus::NoSuchTable)
        );
        assert!(matches!(
            db.get("nope", "k").await,
            Err(DatabaseError::UnexpectedStatus { .. })
        ));
    }
}
