// ============================================================================
// Credential Storage - Embedded Database (redb)
// ============================================================================
// Durable key-value storage for the session credentials.
// Default path: ~/.birdauth/credentials.redb (override via BIRDAUTH_DB_PATH)
// ============================================================================

mod credentials;
mod memory;

pub use credentials::{CredentialSnapshot, CredentialStore};
pub use memory::MemoryStore;

use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::StoreError;

/// Fixed namespace holding the single user session
const CREDENTIALS: TableDefinition<&str, &str> = TableDefinition::new("twitter_oauth");

/// Minimal key-value capability the credential store needs
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Write several keys at once. Either all land or none do.
    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError>;
    /// Remove every key in the namespace
    fn clear(&self) -> Result<(), StoreError>;
}

fn backend<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Backend(format!("{}: {}", context, e))
}

/// redb-backed key-value store
pub struct RedbStore {
    db: Database,
    path: PathBuf,
}

impl RedbStore {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses BIRDAUTH_DB_PATH env var or ~/.birdauth/credentials.redb
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let db_path = if let Some(p) = path {
            p.to_path_buf()
        } else if let Ok(env_path) = std::env::var("BIRDAUTH_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir()
                .ok_or_else(|| StoreError::Backend("Cannot determine home directory".to_string()))?;
            home.join(".birdauth").join("credentials.redb")
        };

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(backend("Failed to create database directory"))?;
        }

        info!("Opening credential database at: {}", db_path.display());

        let db = Database::create(&db_path).map_err(backend("Failed to open database"))?;

        // Ensure the table exists so read transactions can open it
        let write_txn = db.begin_write().map_err(backend("Failed to begin write"))?;
        {
            let _ = write_txn
                .open_table(CREDENTIALS)
                .map_err(backend("Failed to create credentials table"))?;
        }
        write_txn.commit().map_err(backend("Failed to commit init"))?;

        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let read_txn = self.db.begin_read().map_err(backend("Failed to begin read"))?;
        let table = read_txn
            .open_table(CREDENTIALS)
            .map_err(backend("Failed to open credentials table"))?;

        let value = table
            .get(key)
            .map_err(backend("Failed to get credential"))?
            .map(|v| v.value().to_string());
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(backend("Failed to begin write"))?;
        {
            let mut table = write_txn
                .open_table(CREDENTIALS)
                .map_err(backend("Failed to open credentials table"))?;
            table
                .insert(key, value)
                .map_err(backend("Failed to insert credential"))?;
        }
        write_txn.commit().map_err(backend("Failed to commit"))?;

        debug!("Stored credential field: {}", key);
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(backend("Failed to begin write"))?;
        {
            let mut table = write_txn
                .open_table(CREDENTIALS)
                .map_err(backend("Failed to open credentials table"))?;
            for (key, value) in entries {
                table
                    .insert(*key, *value)
                    .map_err(backend("Failed to insert credential"))?;
            }
        }
        write_txn.commit().map_err(backend("Failed to commit"))?;

        debug!("Stored {} credential fields", entries.len());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(backend("Failed to begin write"))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(CREDENTIALS)
                .map_err(backend("Failed to open credentials table"))?;

            let keys = table
                .iter()
                .map_err(backend("Failed to iterate credentials"))?
                .map(|entry| entry.map(|(k, _)| k.value().to_string()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend("Failed to read entry"))?;

            for key in &keys {
                table
                    .remove(key.as_str())
                    .map_err(backend("Failed to remove credential"))?;
            }
            removed = keys.len();
        }
        write_txn.commit().map_err(backend("Failed to commit delete"))?;

        debug!("Cleared {} credential fields", removed);
        Ok(())
    }
}
