//! Local persistence for the served tree head.
//!
//! Each node mirrors the cluster's serving tree head into its own
//! database so it can answer queries and recover after a restart without
//! consulting the store.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use snafu::ResultExt;
use snafu::Snafu;

use crate::sth::SignedTreeHead;

/// Table of served tree heads. Key: timestamp (ms), value: JSON record.
/// JSON rather than a fixed binary layout so opaque tree head fields
/// survive storage.
const TREE_HEADS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("serving_tree_heads");

/// Local database consumed by the controller.
#[async_trait]
pub trait TreeHeadDatabase: Send + Sync {
    /// Record a newly served tree head. A head older than the newest one
    /// already stored is ignored.
    async fn store_serving_sth(&self, sth: &SignedTreeHead) -> Result<(), DatabaseError>;

    /// The most recently served tree head, if any. Used for recovery at
    /// startup.
    async fn latest_tree_head(&self) -> Result<Option<SignedTreeHead>, DatabaseError>;
}

#[async_trait]
impl<T: TreeHeadDatabase + ?Sized> TreeHeadDatabase for Arc<T> {
    async fn store_serving_sth(&self, sth: &SignedTreeHead) -> Result<(), DatabaseError> {
        (**self).store_serving_sth(sth).await
    }

    async fn latest_tree_head(&self) -> Result<Option<SignedTreeHead>, DatabaseError> {
        (**self).latest_tree_head().await
    }
}

/// redb-backed [`TreeHeadDatabase`].
///
/// Transactions run on the blocking pool so the controller's event loop is
/// never stalled by disk I/O.
pub struct RedbTreeHeadDatabase {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbTreeHeadDatabase {
    /// Create or open a tree head database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu { path: parent })?;
        }

        let db = Database::create(&path).context(OpenDatabaseSnafu { path: &path })?;

        // Initialize the table so reads never race table creation.
        let write_txn = db.begin_write().context(BeginWriteSnafu)?;
        {
            write_txn
                .open_table(TREE_HEADS_TABLE)
                .context(OpenTableSnafu)?;
        }
        write_txn.commit().context(CommitSnafu)?;

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_blocking(db: &Database, sth: &SignedTreeHead) -> Result<(), DatabaseError> {
        let write_txn = db.begin_write().context(BeginWriteSnafu)?;
        {
            let mut table = write_txn
                .open_table(TREE_HEADS_TABLE)
                .context(OpenTableSnafu)?;

            let newest = match table.iter().context(IterateSnafu)?.next_back() {
                Some(item) => {
                    let (_key, value) = item.context(IterateSnafu)?;
                    Some(
                        serde_json::from_slice::<SignedTreeHead>(value.value())
                            .context(DeserializeSnafu)?,
                    )
                }
                None => None,
            };
            if let Some(newest) = newest {
                if sth.same_serving_point(&newest) || !sth.is_not_older_than(&newest) {
                    return Ok(());
                }
            }

            let encoded = serde_json::to_vec(sth).context(SerializeSnafu)?;
            table
                .insert(sth.timestamp, encoded.as_slice())
                .context(InsertSnafu)?;
        }
        write_txn.commit().context(CommitSnafu)?;

        Ok(())
    }

    fn latest_blocking(db: &Database) -> Result<Option<SignedTreeHead>, DatabaseError> {
        let read_txn = db.begin_read().context(BeginReadSnafu)?;
        let table = read_txn
            .open_table(TREE_HEADS_TABLE)
            .context(OpenTableSnafu)?;

        let result = match table.iter().context(IterateSnafu)?.next_back() {
            Some(item) => {
                let (_key, value) = item.context(IterateSnafu)?;
                let sth = serde_json::from_slice::<SignedTreeHead>(value.value())
                    .context(DeserializeSnafu)?;
                Ok(Some(sth))
            }
            None => Ok(None),
        };
        result
    }
}

#[async_trait]
impl TreeHeadDatabase for RedbTreeHeadDatabase {
    async fn store_serving_sth(&self, sth: &SignedTreeHead) -> Result<(), DatabaseError> {
        let db = self.db.clone();
        let sth = sth.clone();
        tokio::task::spawn_blocking(move || Self::store_blocking(&db, &sth))
            .await
            .unwrap_or_else(|join_error| {
                Err(DatabaseError::Internal {
                    message: join_error.to_string(),
                })
            })
    }

    async fn latest_tree_head(&self) -> Result<Option<SignedTreeHead>, DatabaseError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || Self::latest_blocking(&db))
            .await
            .unwrap_or_else(|join_error| {
                Err(DatabaseError::Internal {
                    message: join_error.to_string(),
                })
            })
    }
}

/// Tree head database errors.
#[derive(Debug, Snafu)]
pub enum DatabaseError {
    /// The database directory could not be created.
    #[snafu(display("failed to create directory {}: {source}", path.display()))]
    CreateDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The database file could not be opened.
    #[snafu(display("failed to open database at {}: {source}", path.display()))]
    OpenDatabase {
        /// Path of the database file.
        path: PathBuf,
        /// The underlying redb error.
        #[snafu(source(from(redb::DatabaseError, Box::new)))]
        source: Box<redb::DatabaseError>,
    },

    /// A write transaction could not be started.
    #[snafu(display("failed to begin write transaction: {source}"))]
    BeginWrite {
        /// The underlying transaction error.
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    /// A read transaction could not be started.
    #[snafu(display("failed to begin read transaction: {source}"))]
    BeginRead {
        /// The underlying transaction error.
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    /// The tree head table could not be opened.
    #[snafu(display("failed to open table: {source}"))]
    OpenTable {
        /// The underlying table error.
        #[snafu(source(from(redb::TableError, Box::new)))]
        source: Box<redb::TableError>,
    },

    /// A transaction failed to commit.
    #[snafu(display("failed to commit transaction: {source}"))]
    Commit {
        /// The underlying commit error.
        #[snafu(source(from(redb::CommitError, Box::new)))]
        source: Box<redb::CommitError>,
    },

    /// An insert failed.
    #[snafu(display("failed to insert into table: {source}"))]
    Insert {
        /// The underlying storage error.
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// Iterating the table failed.
    #[snafu(display("failed to iterate table: {source}"))]
    Iterate {
        /// The underlying storage error.
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    /// A tree head failed to serialize.
    #[snafu(display("failed to serialize tree head: {source}"))]
    Serialize {
        /// The underlying encoding error.
        source: serde_json::Error,
    },

    /// A stored tree head failed to deserialize.
    #[snafu(display("failed to deserialize tree head: {source}"))]
    Deserialize {
        /// The underlying encoding error.
        source: serde_json::Error,
    },

    /// An internal failure, such as a cancelled blocking task.
    #[snafu(display("internal database error: {message}"))]
    Internal {
        /// Failure detail.
        message: String,
    },
}
