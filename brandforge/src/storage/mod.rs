pub mod credentials;
pub mod outputs;
pub mod registries;
pub mod repositories;
pub mod runs;
pub mod templates;

#[cfg(test)]
pub mod tests;

use sqlx::{
    migrate,
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::ops::Deref;
use std::str::FromStr;
use std::{fs::File, io, path::Path};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not establish connection to database; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    #[error("entity is still referenced by other objects")]
    ForeignKeyViolation,

    #[error("did not find any fields to update")]
    NoFieldsUpdated,

    #[error("could not parse value '{value}' for column '{column}' from database; {err}")]
    Parse {
        value: String,
        column: String,
        err: String,
    },

    #[error("unexpected storage error occurred; {0}")]
    Unknown(String),
}

/// Sqlite errors are determined by database error code. We map these to specific variants so that
/// callers can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
pub fn map_sqlx_error(e: sqlx::Error, query: &str) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    // Primary key and unique constraint violations.
                    "1555" | "2067" => StorageError::Exists,
                    // Foreign key constraint violations.
                    "787" => StorageError::ForeignKeyViolation,
                    _ => StorageError::Unknown(format!(
                        "Error occurred while running query; [{err_code}] {database_err}; query: {query}"
                    )),
                }
            } else {
                StorageError::Unknown(format!(
                    "Error occurred while running query; {database_err}; query: {query}"
                ))
            }
        }
        _ => StorageError::Unknown(format!(
            "Error occurred while running query; {:#?}; query: {query}",
            e
        )),
    }
}

#[derive(Debug, Clone)]
pub struct Db {
    read_pool: Pool<Sqlite>,
    write_pool: Pool<Sqlite>,
}

// Create file if not exists.
fn touch_file(path: &Path) -> io::Result<()> {
    if !path.exists() {
        File::create(path)?;
    }

    Ok(())
}

impl Db {
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        touch_file(Path::new(path))
            .map_err(|e| StorageError::Connection(format!("could not create db file; {:?}", e)))?;

        // We create two different pools of connections. The read pool has many connections and is
        // high concurrency. The write pool is essentially a single connection in which only one
        // write can be made at a time. Not using this paradigm may result in sqlite
        // "database is locked(error: 5)" errors because of the manner in which sqlite handles
        // transactions.
        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))?
            // * journal_mode: Turns on WAL mode which increases concurrency and reliability.
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // * synchronous: Tells sqlite to sync to disk only at critical junctures. Safe in
            //   combination with WAL mode.
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            // * foreign_keys: Turns on relational style foreign keys. A must have.
            .foreign_keys(true)
            // * busy_timeout: How long a sqlite query waits on a locked database before it
            //   returns an error.
            .busy_timeout(std::time::Duration::from_secs(5));

        let read_pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))?;

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))?;

        migrate!("src/storage/migrations")
            .run(&write_pool)
            .await
            .map_err(|e| StorageError::Connection(format!("could not run migrations; {:?}", e)))?;

        Ok(Db {
            read_pool,
            write_pool,
        })
    }

    pub async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.read_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }

    pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.write_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }
}
