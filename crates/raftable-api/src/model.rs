//! Table data model
//!
//! Every stored value carries a version drawn from one counter shared by the whole
//! state machine, so versions are unique across tables and keys.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// A stored value tagged with its global version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: u64,
}

impl VersionedValue {
    pub fn new(value: impl Into<Vec<u8>>, version: u64) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// Table metadata, fixed at creation.
///
/// Changing the TTL policy requires dropping and recreating the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub name: String,
    pub ttl_millis: Option<u32>,
    pub expire_old_entries: bool,
}

impl TableMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl_millis: None,
            expire_old_entries: false,
        }
    }

    pub fn with_ttl(name: impl Into<String>, ttl_millis: u32) -> Self {
        Self {
            name: name.into(),
            ttl_millis: Some(ttl_millis),
            expire_old_entries: true,
        }
    }

    pub fn has_ttl(&self) -> bool {
        self.expire_old_entries && self.ttl_millis.is_some()
    }
}

/// One item of a batch write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteRequest {
    Put {
        table_name: String,
        key: String,
        value: Vec<u8>,
    },
    PutIfAbsent {
        table_name: String,
        key: String,
        value: Vec<u8>,
    },
    PutIfValue {
        table_name: String,
        key: String,
        old_value: Vec<u8>,
        value: Vec<u8>,
    },
    PutIfVersion {
        table_name: String,
        key: String,
        value: Vec<u8>,
        previous_version: u64,
    },
    Remove {
        table_name: String,
        key: String,
    },
    RemoveIfValue {
        table_name: String,
        key: String,
        old_value: Vec<u8>,
    },
    RemoveIfVersion {
        table_name: String,
        key: String,
        previous_version: u64,
    },
}

impl WriteRequest {
    pub fn put(table: &str, key: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            table_name: table.to_string(),
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn put_if_absent(table: &str, key: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::PutIfAbsent {
            table_name: table.to_string(),
            key: key.to_string(),
            value: value.into(),
        }
    }

    pub fn put_if_value(
        table: &str,
        key: &str,
        old_value: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self::PutIfValue {
            table_name: table.to_string(),
            key: key.to_string(),
            old_value: old_value.into(),
            value: value.into(),
        }
    }

    pub fn put_if_version(
        table: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
        previous_version: u64,
    ) -> Self {
        Self::PutIfVersion {
            table_name: table.to_string(),
            key: key.to_string(),
            value: value.into(),
            previous_version,
        }
    }

    pub fn remove(table: &str, key: &str) -> Self {
        Self::Remove {
            table_name: table.to_string(),
            key: key.to_string(),
        }
    }

    pub fn remove_if_value(table: &str, key: &str, old_value: impl Into<Vec<u8>>) -> Self {
        Self::RemoveIfValue {
            table_name: table.to_string(),
            key: key.to_string(),
            old_value: old_value.into(),
        }
    }

    pub fn remove_if_version(table: &str, key: &str, previous_version: u64) -> Self {
        Self::RemoveIfVersion {
            table_name: table.to_string(),
            key: key.to_string(),
            previous_version,
        }
    }

    pub fn table_name(&self) -> &str {
        match self {
            Self::Put { table_name, .. }
            | Self::PutIfAbsent { table_name, .. }
            | Self::PutIfValue { table_name, .. }
            | Self::PutIfVersion { table_name, .. }
            | Self::Remove { table_name, .. }
            | Self::RemoveIfValue { table_name, .. }
            | Self::RemoveIfVersion { table_name, .. } => table_name,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. }
            | Self::PutIfAbsent { key, .. }
            | Self::PutIfValue { key, .. }
            | Self::PutIfVersion { key, .. }
            | Self::Remove { key, .. }
            | Self::RemoveIfValue { key, .. }
            | Self::RemoveIfVersion { key, .. } => key,
        }
    }

    /// The value a put-family request stores, `None` for removes.
    pub fn new_value(&self) -> Option<&[u8]> {
        match self {
            Self::Put { value, .. }
            | Self::PutIfAbsent { value, .. }
            | Self::PutIfValue { value, .. }
            | Self::PutIfVersion { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Whether the request's precondition holds against the currently stored value.
    pub fn precondition_holds(&self, current: Option<&VersionedValue>) -> bool {
        match self {
            Self::Put { .. } | Self::Remove { .. } => true,
            Self::PutIfAbsent { .. } => current.is_none(),
            Self::PutIfValue { old_value, .. } | Self::RemoveIfValue { old_value, .. } => {
                current.is_some_and(|c| &c.value == old_value)
            }
            Self::PutIfVersion {
                previous_version, ..
            }
            | Self::RemoveIfVersion {
                previous_version, ..
            } => current.is_some_and(|c| c.version == *previous_version),
        }
    }
}

/// An ordered batch of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWriteRequest {
    pub requests: Vec<WriteRequest>,
}

impl BatchWriteRequest {
    pub fn builder() -> BatchWriteRequestBuilder {
        BatchWriteRequestBuilder::default()
    }

    pub fn single(request: WriteRequest) -> Self {
        Self {
            requests: vec![request],
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BatchWriteRequestBuilder {
    requests: Vec<WriteRequest>,
}

impl BatchWriteRequestBuilder {
    pub fn add(mut self, request: WriteRequest) -> Self {
        self.requests.push(request);
        self
    }

    pub fn put(self, table: &str, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.add(WriteRequest::put(table, key, value))
    }

    pub fn remove(self, table: &str, key: &str) -> Self {
        self.add(WriteRequest::remove(table, key))
    }

    pub fn build(self) -> BatchWriteRequest {
        BatchWriteRequest {
            requests: self.requests,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteStatus {
    Ok,
    PreconditionViolation,
    NoSuchTable,
    Aborted,
}

impl Display for WriteStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::PreconditionViolation => "PRECONDITION_VIOLATION",
            Self::NoSuchTable => "NO_SUCH_TABLE",
            Self::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Outcome of one batch item plus the value that existed before the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub status: WriteStatus,
    pub previous_value: Option<VersionedValue>,
}

impl WriteResult {
    pub fn new(status: WriteStatus, previous_value: Option<VersionedValue>) -> Self {
        Self {
            status,
            previous_value,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == WriteStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadRequest {
    pub table_name: String,
    pub key: String,
}

impl ReadRequest {
    pub fn new(table: &str, key: &str) -> Self {
        Self {
            table_name: table.to_string(),
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReadRequest {
    pub requests: Vec<ReadRequest>,
}

impl BatchReadRequest {
    pub fn builder() -> BatchReadRequestBuilder {
        BatchReadRequestBuilder::default()
    }

    pub fn single(table: &str, key: &str) -> Self {
        Self {
            requests: vec![ReadRequest::new(table, key)],
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReadRequestBuilder {
    requests: Vec<ReadRequest>,
}

impl BatchReadRequestBuilder {
    pub fn get(mut self, table: &str, key: &str) -> Self {
        self.requests.push(ReadRequest::new(table, key));
        self
    }

    pub fn build(self) -> BatchReadRequest {
        BatchReadRequest {
            requests: self.requests,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadStatus {
    Ok,
    NoSuchTable,
}

impl Display for ReadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::NoSuchTable => f.write_str("NO_SUCH_TABLE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResult {
    pub status: ReadStatus,
    pub table_name: String,
    pub key: String,
    pub value: Option<VersionedValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableModificationType {
    RowAdded,
    RowUpdated,
    RowDeleted,
}

/// Produced once per applied mutation, identically on every replica.
///
/// For `RowDeleted` the value is the one that was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableModificationEvent {
    pub table_name: String,
    pub key: String,
    pub value: VersionedValue,
    #[serde(rename = "type")]
    pub kind: TableModificationType,
}

impl TableModificationEvent {
    pub fn row_added(table: &str, key: &str, value: VersionedValue) -> Self {
        Self::new(table, key, value, TableModificationType::RowAdded)
    }

    pub fn row_updated(table: &str, key: &str, value: VersionedValue) -> Self {
        Self::new(table, key, value, TableModificationType::RowUpdated)
    }

    pub fn row_deleted(table: &str, key: &str, value: VersionedValue) -> Self {
        Self::new(table, key, value, TableModificationType::RowDeleted)
    }

    fn new(table: &str, key: &str, value: VersionedValue, kind: TableModificationType) -> Self {
        Self {
            table_name: table.to_string(),
            key: key.to_string(),
            value,
            kind,
        }
    }
}
