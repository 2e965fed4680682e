use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let diagnostic_path = args.cache_root.join("extraction_debug.txt");
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("ansdata.sqlite"));

    info!(cache_root = %args.cache_root.display(), "status requested");

    if manifest_dir.exists() {
        let counts = count_manifests(&manifest_dir)?;
        info!(
            convert_runs = counts.convert_runs,
            import_runs = counts.import_runs,
            consolidations = counts.consolidations,
            "manifest inventory"
        );
    } else {
        warn!(path = %manifest_dir.display(), "manifest directory missing");
    }

    if diagnostic_path.exists() {
        info!(path = %diagnostic_path.display(), "extraction diagnostic present");
    }

    if db_path.exists() {
        let connection = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;

        let operators = query_count(&connection, "SELECT COUNT(*) FROM operators").unwrap_or(0);
        let reports =
            query_count(&connection, "SELECT COUNT(*) FROM financial_reports").unwrap_or(0);
        let schema_version = query_metadata(&connection, "db_schema_version").unwrap_or_default();
        let years = report_years(&connection).unwrap_or_default();

        info!(
            path = %db_path.display(),
            operators,
            financial_reports = reports,
            schema_version = %schema_version,
            report_years = ?years,
            "database status"
        );
    } else {
        warn!(path = %db_path.display(), "database file missing");
    }

    Ok(())
}

#[derive(Debug, Default)]
struct ManifestCounts {
    convert_runs: usize,
    import_runs: usize,
    consolidations: usize,
}

fn count_manifests(manifest_dir: &Path) -> Result<ManifestCounts> {
    let mut counts = ManifestCounts::default();

    let entries = fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?;

    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in {}", manifest_dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if name.starts_with("convert_run_") {
            counts.convert_runs += 1;
        } else if name.starts_with("import_run_") {
            counts.import_runs += 1;
        } else if name.starts_with("consolidation_") {
            counts.consolidations += 1;
        }
    }

    Ok(counts)
}

fn query_count(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

fn query_metadata(connection: &Connection, key: &str) -> Result<String> {
    let value = connection.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
        row.get(0)
    })?;
    Ok(value)
}

fn report_years(connection: &Connection) -> Result<Vec<i64>> {
    let mut statement = connection.prepare(
        "SELECT DISTINCT CAST(strftime('%Y', report_date) AS INTEGER) AS year
         FROM financial_reports ORDER BY year",
    )?;

    let years = statement
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;

    Ok(years)
}
