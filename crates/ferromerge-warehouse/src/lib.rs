//! # Ferromerge Warehouse
//!
//! Durable feature store for ferromerge, backed by `DuckDB`.
//!
//! ## Overview
//!
//! The store holds one wide row per `(entity, date)`. Columns are partitioned
//! into disjoint groups, one per source type, and the only write primitive is
//! a partial upsert that touches a single group:
//!
//! - **Atomic**: each upsert is one `INSERT ... ON CONFLICT DO UPDATE` statement
//! - **Group-scoped**: the update clause lists only the writing group's columns
//! - **Last-observed-wins**: the update is guarded by the group's `observed_at`
//! - **Parameterized**: values are bound; column names come from the catalog
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferromerge_warehouse::{FeatureKey, FeatureStore, GroupWrite, SourceType, Warehouse};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warehouse = Warehouse::open_default()?;
//!     let key = FeatureKey::new("BTC", "2025-10-20")?;
//!
//!     let write = GroupWrite::new(SourceType::Price, 1_760_918_400_000)
//!         .with_value("price_close", Some(67_000.0));
//!     warehouse.upsert_partial(&key, &write)?;
//!
//!     let row = warehouse.read(&key)?;
//!     println!("{row:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `feature_rows` | One row per entity and date, all column groups |
//! | `merge_log` | Per-key merge audit written by the materializer |
//! | `schema_migrations` | Applied migration versions |

pub mod duckdb;
pub mod groups;
pub mod migrations;
pub mod row;
pub mod store;

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ::duckdb::{Row, ToSql};
use thiserror::Error;

pub use duckdb::{DuckDbConnectionManager, PooledConnection};
pub use groups::{owner_of, ColumnGroup, SourceType};
pub use row::{FeatureKey, FeatureRow, GroupFreshness, GroupSnapshot, GroupWrite, UpsertOutcome};
pub use store::{FeatureStore, MemoryFeatureStore, MergeLogEntry};

/// Errors that can occur during feature store operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unknown source type '{0}'")]
    UnknownSource(String),

    #[error("column '{column}' is not part of the {owner} group")]
    ForeignColumn { column: String, owner: SourceType },
}

/// Configuration for the feature store database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for ferromerge data.
    pub ferromerge_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let ferromerge_home = resolve_ferromerge_home();
        let db_path = ferromerge_home.join("store").join("features.duckdb");
        Self {
            ferromerge_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// `DuckDB`-backed [`FeatureStore`].
///
/// Upserts are serialized in-process: `DuckDB` aborts concurrent updates of
/// the same row with a transaction conflict instead of queueing them.
#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
    writes: Arc<Mutex<()>>,
}

impl Warehouse {
    /// Open a warehouse with default configuration.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Open a warehouse with the specified configuration.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self::with_manager(manager);
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Open a private in-memory warehouse.
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let manager = DuckDbConnectionManager::open_in_memory(2)?;
        let warehouse = Self::with_manager(manager);
        warehouse.initialize()?;
        Ok(warehouse)
    }

    fn with_manager(manager: DuckDbConnectionManager) -> Self {
        Self {
            manager,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Apply schema migrations.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        tracing::debug!(db_path = ?self.manager.db_path(), "feature store schema ready");
        Ok(())
    }

    pub fn manager(&self) -> &DuckDbConnectionManager {
        &self.manager
    }

    /// Number of rows in `feature_rows`.
    pub fn row_count(&self) -> Result<u64, WarehouseError> {
        let connection = self.manager.acquire()?;
        let count: i64 =
            connection.query_row("SELECT COUNT(*) FROM feature_rows", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn query_rows(
        &self,
        filter: &str,
        params: &[&dyn ToSql],
    ) -> Result<Vec<FeatureRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let sql = format!(
            "SELECT entity_key, CAST(as_of_date AS VARCHAR), {columns} FROM feature_rows \
             WHERE {filter} ORDER BY as_of_date",
            columns = select_columns().join(", "),
        );
        let mut statement = connection.prepare(&sql)?;
        let mut cursor = statement.query(params)?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next()? {
            rows.push(read_feature_row(row)?);
        }
        Ok(rows)
    }
}

impl FeatureStore for Warehouse {
    fn upsert_partial(
        &self,
        key: &FeatureKey,
        write: &GroupWrite,
    ) -> Result<UpsertOutcome, WarehouseError> {
        write.validate()?;
        let values = write.assigned_values();
        let columns = values.iter().map(|(column, _)| *column).collect::<Vec<_>>();
        let sql = upsert_sql(write.source.group(), &columns);

        // SECURITY: identifiers come from the static catalog; every value is bound.
        let entity = key.entity();
        let date = key.date();
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(values.len() + 3);
        params.push(&entity);
        params.push(&date);
        for (_, value) in &values {
            params.push(value);
        }
        params.push(&write.observed_at_ms);

        let connection = self.manager.acquire()?;
        let changed = {
            let _write = self.writes.lock().expect("warehouse write lock is not poisoned");
            connection.execute(&sql, params.as_slice())?
        };
        if changed == 0 {
            tracing::debug!(key = %key, source = %write.source, "stored group observed later; write superseded");
            return Ok(UpsertOutcome::Superseded);
        }
        Ok(UpsertOutcome::Applied)
    }

    fn read(&self, key: &FeatureKey) -> Result<Option<FeatureRow>, WarehouseError> {
        let entity = key.entity();
        let date = key.date();
        let params: [&dyn ToSql; 2] = [&entity, &date];
        let mut rows = self.query_rows(
            "entity_key = ? AND as_of_date = CAST(? AS DATE)",
            params.as_slice(),
        )?;
        Ok(rows.pop())
    }

    fn entity_rows(&self, entity: &str) -> Result<Vec<FeatureRow>, WarehouseError> {
        let params: [&dyn ToSql; 1] = [&entity];
        self.query_rows("entity_key = ?", params.as_slice())
    }

    fn record_merge(&self, entry: &MergeLogEntry) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        let source = entry.source.as_str();
        let entity = entry.key.entity();
        let date = entry.key.date();
        let params: [&dyn ToSql; 6] = [
            &entry.run_id,
            &source,
            &entity,
            &date,
            &entry.status,
            &entry.observed_at_ms,
        ];
        connection.execute(
            "INSERT INTO merge_log \
             (run_id, source, entity_key, as_of_date, status, observed_at, logged_at) \
             VALUES (?, ?, ?, CAST(? AS DATE), ?, ?, CURRENT_TIMESTAMP)",
            params.as_slice(),
        )?;
        Ok(())
    }
}

/// One statement per write: insert the key with only the written columns
/// populated, or overwrite exactly those columns when the stored observation of
/// the group is not newer.
fn upsert_sql(group: &ColumnGroup, columns: &[&'static str]) -> String {
    let observed = group.observed_at_column;
    let mut insert_columns = vec!["entity_key", "as_of_date"];
    insert_columns.extend(columns.iter().copied());
    insert_columns.push(observed);

    let mut placeholders = vec!["?", "CAST(? AS DATE)"];
    placeholders.extend(std::iter::repeat("?").take(columns.len() + 1));

    let assignments = columns
        .iter()
        .copied()
        .chain(std::iter::once(observed))
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO feature_rows ({columns}) VALUES ({placeholders}) \
         ON CONFLICT (entity_key, as_of_date) DO UPDATE SET {assignments} \
         WHERE {observed} IS NULL OR {observed} <= EXCLUDED.{observed}",
        columns = insert_columns.join(", "),
        placeholders = placeholders.join(", "),
    )
}

/// Group columns followed by the group's observed-at column, for every group.
fn select_columns() -> Vec<&'static str> {
    SourceType::ALL
        .into_iter()
        .flat_map(|source| {
            let group = source.group();
            group
                .columns
                .iter()
                .copied()
                .chain(std::iter::once(group.observed_at_column))
        })
        .collect()
}

fn read_feature_row(row: &Row<'_>) -> Result<FeatureRow, WarehouseError> {
    let entity: String = row.get(0)?;
    let date: String = row.get(1)?;
    let mut feature_row = FeatureRow::empty(FeatureKey::new(entity, date)?);

    let mut index = 2;
    for source in SourceType::ALL {
        let group = source.group();
        let mut values = std::collections::BTreeMap::new();
        for column in group.columns {
            let value: Option<f64> = row.get(index)?;
            values.insert((*column).to_owned(), value);
            index += 1;
        }
        let observed: Option<i64> = row.get(index)?;
        index += 1;

        if let Some(observed_at_ms) = observed {
            feature_row.groups.insert(
                source,
                GroupSnapshot {
                    values,
                    observed_at_ms,
                },
            );
        }
    }

    Ok(feature_row)
}

/// Resolve the ferromerge home directory from environment or default.
fn resolve_ferromerge_home() -> PathBuf {
    if let Some(path) = env::var_os("FERROMERGE_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ferromerge");
    }

    PathBuf::from(".ferromerge")
}
