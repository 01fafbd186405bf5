use std::{collections::BTreeMap, ops::Deref, path::Path};

use capa_shared::error::CommonError;
use tempfile::TempDir;
use tracing::info;

use crate::migrations::{INIT_MIGRATION_NAME, INIT_MIGRATION_SQL};

/// Thin wrapper around `libsql::Connection` that retries on `SQLITE_BUSY` /
/// "database is locked", which is routine for a single-writer embedded database
/// fielding concurrent readers from HTTP workers.
#[derive(Debug, Clone)]
pub struct Connection(pub libsql::Connection);

impl Connection {
    pub fn new(connection: libsql::Connection) -> Self {
        Self(connection)
    }
}

impl Deref for Connection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! execute_with_retry {
    ($operation:expr) => {
        $crate::execute_with_retry!($operation, 10)
    };
    ($operation:expr, $max_retries:expr) => {{
            async {
                let mut retries = 0u32;
                let max_retries: u32 = $max_retries;

                loop {
                    match $operation.await {
                        Ok(result) => break Ok(result),
                        Err(err) => {
                            let err_str = err.to_string();
                            if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY") {
                                if retries >= max_retries {
                                    break Err(err);
                                }
                                retries += 1;
                                let delay_us = 10_000u64 * (1 << retries.min(6));
                                tokio::time::sleep(std::time::Duration::from_micros(delay_us)).await;
                            } else {
                                break Err(err);
                            }
                        }
                    }
                }
            }
                .await
    }};
}

impl Connection {
    pub async fn execute(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> libsql::Result<u64> {
        let params = params.into_params()?;
        execute_with_retry!(self.0.execute(sql, params.clone()), 10)
    }

    pub async fn query(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> libsql::Result<libsql::Rows> {
        let stmt = self.prepare(sql).await?;
        let params = params.into_params()?;
        execute_with_retry!(stmt.query(params.clone()), 10)
    }
}

/// Opens (creating if needed) the local embedded database at `db_path` and applies
/// migrations. The broker is explicitly single-process (Non-goals: no
/// distribution/replication), so only the `libsql::Builder::new_local` path is
/// wired up here.
pub async fn establish_db_connection(db_path: &Path) -> Result<(libsql::Database, Connection), CommonError> {
    if let Some(parent) = db_path.parent()
    && !parent.as_os_str().is_empty()
    && !std::fs::exists(parent)?
    {
        std::fs::create_dir_all(parent)?;
    }

    info!(path = %db_path.display(), "opening local capa database");
    let db = libsql::Builder::new_local(db_path).build().await?;
    let conn = db.connect()?;

    let mut migrations: BTreeMap<&str, &str> = BTreeMap::new();
    migrations.insert(INIT_MIGRATION_NAME, INIT_MIGRATION_SQL);
    let temp_dir = write_migrations_to_temp_dir(&migrations).await?;
    libsql_migration::dir::migrate(&conn, temp_dir).await?;

    Ok((db, Connection(conn)))
}

/// Opens an in-memory database for tests.
pub async fn establish_in_memory_connection() -> Result<(libsql::Database, Connection), CommonError> {
    let db = libsql::Builder::new_local(":memory:").build().await?;
    let conn = db.connect()?;

    let mut migrations: BTreeMap<&str, &str> = BTreeMap::new();
    migrations.insert(INIT_MIGRATION_NAME, INIT_MIGRATION_SQL);
    let temp_dir = write_migrations_to_temp_dir(&migrations).await?;
    libsql_migration::dir::migrate(&conn, temp_dir).await?;

    Ok((db, Connection(conn)))
}

async fn write_migrations_to_temp_dir(
    migrations: &BTreeMap<&str, &str>,
) -> Result<std::path::PathBuf, CommonError> {
    let temp_dir = TempDir::new()?;
    let temp_path = temp_dir.keep();

    for (filename, contents) in migrations {
        std::fs::write(temp_path.join(filename), contents)?;
    }

    Ok(temp_path)
}
