use ::duckdb::Connection;

use crate::groups::SourceType;

struct Migration {
    version: &'static str,
    sql: fn() -> String,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_feature_rows",
        sql: feature_rows_ddl,
    },
    Migration {
        version: "0002_merge_log",
        sql: merge_log_ddl,
    },
];

/// Columns are added with `IF NOT EXISTS` so catalog growth only needs this
/// pass, not a new migration.
fn feature_rows_ddl() -> String {
    let mut sql = String::from(
        "CREATE TABLE IF NOT EXISTS feature_rows (\n    \
         entity_key TEXT NOT NULL,\n    \
         as_of_date DATE NOT NULL,\n    \
         PRIMARY KEY(entity_key, as_of_date)\n);\n",
    );
    sql.push_str(&catalog_columns_ddl());
    sql
}

fn catalog_columns_ddl() -> String {
    let mut sql = String::new();
    for source in SourceType::ALL {
        let group = source.group();
        for column in group.columns {
            sql.push_str(&format!(
                "ALTER TABLE feature_rows ADD COLUMN IF NOT EXISTS {column} DOUBLE;\n"
            ));
        }
        sql.push_str(&format!(
            "ALTER TABLE feature_rows ADD COLUMN IF NOT EXISTS {} BIGINT;\n",
            group.observed_at_column
        ));
    }
    sql
}

fn merge_log_ddl() -> String {
    String::from(
        r"
CREATE TABLE IF NOT EXISTS merge_log (
    run_id TEXT NOT NULL,
    source TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    as_of_date DATE NOT NULL,
    status TEXT NOT NULL,
    observed_at BIGINT NOT NULL,
    logged_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_merge_log_source_key ON merge_log(source, entity_key, as_of_date);
",
    )
}

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
",
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            [migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(&(migration.sql)())?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                [migration.version],
            )?;
        }
    }

    connection.execute_batch(&catalog_columns_ddl())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent_and_create_every_catalog_column() {
        let connection = Connection::open_in_memory().expect("open");
        apply_migrations(&connection).expect("first pass");
        apply_migrations(&connection).expect("second pass");

        let applied: i64 = connection
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(applied, MIGRATIONS.len() as i64);

        for source in SourceType::ALL {
            for column in source.group().columns {
                let found: i64 = connection
                    .query_row(
                        "SELECT COUNT(*) FROM information_schema.columns \
                         WHERE table_name = 'feature_rows' AND column_name = ?",
                        [*column],
                        |row| row.get(0),
                    )
                    .expect("column lookup");
                assert_eq!(found, 1, "missing column {column}");
            }
        }
    }
}
