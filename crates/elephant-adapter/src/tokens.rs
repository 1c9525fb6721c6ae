//! Token persistence backends.
//!
//! Keys are opaque digests chosen by the caller; the backends never see raw
//! bearer tokens.

use std::{collections::HashMap, future::Future, path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

// redb table: key = token digest, value = JSON-encoded TokenRecord
const TOKENS: TableDefinition<'_, &str, &str> = TableDefinition::new("auth_tokens");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub username: String,
    pub created_at: DateTime<Utc>,
}

// Uses explicit `impl Future + Send` so callers can stay generic without boxing.
pub trait TokenBackend: Send + Sync {
    /// Stores `record` under `key` unless the key is already taken.
    /// Returns `false` on collision, leaving the existing record untouched.
    fn insert_if_absent(
        &self,
        key: &str,
        record: &TokenRecord,
    ) -> impl Future<Output = Result<bool>> + Send;
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<TokenRecord>>> + Send;
    fn remove(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;
    fn count(&self) -> impl Future<Output = Result<usize>> + Send;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTokenBackend {
    records: Arc<RwLock<HashMap<String, TokenRecord>>>,
}

impl MemoryTokenBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenBackend for MemoryTokenBackend {
    async fn insert_if_absent(&self, key: &str, record: &TokenRecord) -> Result<bool> {
        let mut records = self.records.write();
        if records.contains_key(key) {
            return Ok(false);
        }
        records.insert(key.to_string(), record.clone());
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<TokenRecord>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.records.write().remove(key).is_some())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}

/// Token records in a single-file redb database, surviving restarts.
#[derive(Clone)]
pub struct RedbTokenBackend {
    db: Arc<Database>,
}

impl RedbTokenBackend {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating token store dir {}", parent.display()))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("opening token store at {}", path.display()))?;

        let write_txn = db.begin_write()?;
        {
            let _table = write_txn.open_table(TOKENS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl TokenBackend for RedbTokenBackend {
    async fn insert_if_absent(&self, key: &str, record: &TokenRecord) -> Result<bool> {
        let encoded = serde_json::to_string(record).context("encoding token record")?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(TOKENS)?;
            if table.get(key)?.is_some() {
                false
            } else {
                table.insert(key, encoded.as_str())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    async fn get(&self, key: &str) -> Result<Option<TokenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS)?;
        let Some(raw) = table.get(key)? else {
            return Ok(None);
        };
        let record = serde_json::from_str(raw.value()).context("decoding token record")?;
        Ok(Some(record))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TOKENS)?;
            table.remove(key)?.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TOKENS)?;
        Ok(table.iter()?.count())
    }
}

/// Backend chosen at startup from configuration.
#[derive(Clone)]
pub enum AnyTokenBackend {
    Memory(MemoryTokenBackend),
    Redb(RedbTokenBackend),
}

impl AnyTokenBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redb(_) => "redb",
        }
    }
}

impl TokenBackend for AnyTokenBackend {
    async fn insert_if_absent(&self, key: &str, record: &TokenRecord) -> Result<bool> {
        match self {
            Self::Memory(b) => b.insert_if_absent(key, record).await,
            Self::Redb(b) => b.insert_if_absent(key, record).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<TokenRecord>> {
        match self {
            Self::Memory(b) => b.get(key).await,
            Self::Redb(b) => b.get(key).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        match self {
            Self::Memory(b) => b.remove(key).await,
            Self::Redb(b) => b.remove(key).await,
        }
    }

    async fn count(&self) -> Result<usize> {
        match self {
            Self::Memory(b) => b.count().await,
            Self::Redb(b) => b.count().await,
        }
    }
}
