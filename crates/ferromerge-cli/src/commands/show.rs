use ferromerge_core::domain::normalize_date;
use ferromerge_core::{EngineConfig, EntityKey, FeatureKey, FeatureStore, SourceType, UtcDateTime};
use serde_json::{json, Map, Value};

use crate::cli::ShowArgs;
use crate::error::CliError;

use super::CommandResult;

pub fn run(args: &ShowArgs, config: &EngineConfig) -> Result<CommandResult, CliError> {
    let entity = EntityKey::parse(&args.entity)?;
    let date = normalize_date(&args.date)?;
    let key = FeatureKey::new(entity.as_str(), date)?;

    let store = super::open_store(config)?;
    let Some(row) = store.read(&key)? else {
        let data = json!({ "entity": key.entity(), "date": key.date(), "found": false });
        return Ok(CommandResult::ok(data).with_warning(format!("no feature row for {key}")));
    };

    let now_ms = UtcDateTime::now().unix_millis();
    let mut freshness = Map::new();
    for source in SourceType::ALL {
        let max_age_ms = i64::try_from(config.staleness_window(source).as_millis()).unwrap_or(i64::MAX);
        let state = row.freshness(source, now_ms, max_age_ms);
        freshness.insert(source.as_str().to_owned(), serde_json::to_value(state)?);
    }

    Ok(CommandResult::ok(json!({
        "found": true,
        "row": row.to_flat_json(),
        "freshness": Value::Object(freshness),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferromerge_core::{GroupWrite, Warehouse};
    use tempfile::tempdir;

    fn args(entity: &str, date: &str) -> ShowArgs {
        ShowArgs {
            entity: entity.to_owned(),
            date: date.to_owned(),
        }
    }

    #[test]
    fn reports_missing_rows_and_group_freshness() {
        let temp = tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.warehouse.db_path = Some(temp.path().join("features.duckdb"));

        let missing = run(&args("btc", "2025-10-20"), &config).expect("missing row");
        assert_eq!(missing.data["found"], false);
        assert_eq!(missing.warnings.len(), 1);

        {
            let store = Warehouse::open(config.warehouse.warehouse_config()).expect("open");
            let key = FeatureKey::new("BTC", "2025-10-20").expect("key");
            let write = GroupWrite::new(SourceType::Price, UtcDateTime::now().unix_millis())
                .with_value("price_close", Some(67_000.0));
            store.upsert_partial(&key, &write).expect("upsert");
        }

        let found = run(&args("btc", "2025-10-20"), &config).expect("row");
        assert_eq!(found.data["found"], true);
        assert_eq!(found.data["row"]["price_close"], 67_000.0);
        assert_eq!(found.data["freshness"]["price"], "fresh");
        assert_eq!(found.data["freshness"]["sentiment"], "missing");
        assert!(found.warnings.is_empty());
    }
}
