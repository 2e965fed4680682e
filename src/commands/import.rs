use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Datelike, NaiveDate, Utc};
use csv::{ReaderBuilder, StringRecord};
use regex::Regex;
use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::cli::ImportArgs;
use crate::commands::consolidate::{consolidate_year, consolidated_output_path};
use crate::model::{
    ConsolidationEntry, FinancialLoadSummary, FinancialRecord, FinancialYearCounts, ImportCounts,
    ImportPaths, ImportRunManifest, OperatorLoadSummary, OperatorRecord, SourceFileEntry,
};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

const DB_SCHEMA_VERSION: &str = "0.1.0";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Externally supplied importer configuration. The loaders read paths,
/// batch sizing and the retry budget from here, never from embedded
/// constants.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub operators_file: PathBuf,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

/// Bounded retry with a fixed blocking delay between attempts. Wraps only
/// operations that are safe to restart from scratch.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Runs `operation` until it succeeds or the attempt budget is spent.
    /// Returns the value together with the number of attempts used.
    pub fn run<T>(
        &self,
        label: &str,
        mut operation: impl FnMut() -> Result<T>,
    ) -> Result<(T, usize)> {
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            match operation() {
                Ok(value) => return Ok((value, attempt)),
                Err(error) => {
                    if attempt >= self.max_attempts {
                        return Err(
                            error.context(format!("{label} failed after {attempt} attempts"))
                        );
                    }

                    warn!(label, attempt, error = %error, "attempt failed, retrying");
                    thread::sleep(self.delay);
                }
            }
        }
    }
}

pub fn run(args: ImportArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let config = ImportConfig {
        db_path: args
            .db_path
            .clone()
            .unwrap_or_else(|| cache_root.join("ansdata.sqlite")),
        data_dir: args.data_dir.clone(),
        operators_file: args
            .operators_file
            .clone()
            .unwrap_or_else(|| args.data_dir.join("active_operators.csv")),
        batch_size: args.batch_size,
        retry: RetryPolicy {
            max_attempts: args.max_attempts,
            delay: Duration::from_secs(args.retry_delay_secs),
        },
    };
    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("import_run_{}.json", utc_compact_string(started_ts)))
    });
    let years = target_years(&args.years);

    info!(db = %config.db_path.display(), run_id = %run_id, "starting import");

    let mut connection = Connection::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;

    let mut warnings = Vec::new();
    let mut source_hashes = Vec::new();

    let operators = import_operators(&mut connection, &config)?;
    source_hashes.push(SourceFileEntry {
        filename: config.operators_file.display().to_string(),
        sha256: sha256_file(&config.operators_file)?,
    });

    let mut consolidations = Vec::new();
    let mut financial_years = Vec::new();

    for year in years {
        let output_path = consolidated_output_path(&config.data_dir, year);

        let Some(outcome) = consolidate_year(&config.data_dir, year, &output_path)? else {
            warn!(year, "no period files found, skipping year");
            warnings.push(format!("no period files found for {year}"));
            continue;
        };

        consolidations.push(ConsolidationEntry {
            year,
            output: output_path.display().to_string(),
            input_files: outcome.input_files,
            data_rows: outcome.data_rows,
        });

        let summary = import_financial_reports(&mut connection, &config, &output_path)?;
        source_hashes.push(SourceFileEntry {
            filename: output_path.display().to_string(),
            sha256: sha256_file(&output_path)?,
        });
        financial_years.push(FinancialYearCounts { year, summary });
    }

    let operators_total = count_rows(&connection, "SELECT COUNT(*) FROM operators")?;
    let financial_total = count_rows(&connection, "SELECT COUNT(*) FROM financial_reports")?;
    let total_inserted = operators.inserted
        + financial_years
            .iter()
            .map(|entry| entry.summary.inserted)
            .sum::<usize>();

    let manifest = ImportRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        paths: ImportPaths {
            cache_root: cache_root.display().to_string(),
            data_dir: config.data_dir.display().to_string(),
            db_path: config.db_path.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
        },
        counts: ImportCounts {
            operators,
            financial_years,
            total_inserted,
        },
        consolidations,
        source_hashes,
        warnings,
        notes: vec![
            "Import command completed using the local sqlite store.".to_string(),
            "Operator load is full-replace; report loads reset only their own period.".to_string(),
        ],
    };

    write_json_pretty(&manifest_path, &manifest)?;

    info!(path = %manifest_path.display(), "wrote import run manifest");
    info!(
        operators = operators_total,
        financial_reports = financial_total,
        inserted = total_inserted,
        "import completed"
    );

    Ok(())
}

fn target_years(requested: &[i32]) -> Vec<i32> {
    if requested.is_empty() {
        let current = Utc::now().year();
        vec![current - 1, current]
    } else {
        requested.to_vec()
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS operators (
          ans_registration TEXT,
          cnpj TEXT,
          legal_name TEXT,
          trade_name TEXT,
          modality TEXT,
          address TEXT,
          number TEXT,
          complement TEXT,
          neighborhood TEXT,
          city TEXT,
          state TEXT,
          zip_code TEXT,
          area_code TEXT,
          phone TEXT,
          fax TEXT,
          email TEXT,
          representative TEXT,
          representative_role TEXT,
          created_at TEXT
        );

        CREATE TABLE IF NOT EXISTS financial_reports (
          report_date TEXT NOT NULL,
          operator_code TEXT,
          account TEXT,
          description TEXT,
          is_consolidated INTEGER,
          balance REAL
        );

        CREATE INDEX IF NOT EXISTS idx_operators_registration
          ON operators(ans_registration);
        CREATE INDEX IF NOT EXISTS idx_financial_reports_date
          ON financial_reports(report_date);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

fn import_operators(
    connection: &mut Connection,
    config: &ImportConfig,
) -> Result<OperatorLoadSummary> {
    info!(file = %config.operators_file.display(), "loading active operators");

    if !config.operators_file.exists() {
        bail!(
            "operators source file not found: {}",
            config.operators_file.display()
        );
    }

    // Reset-then-reload is idempotent, so the whole attempt can restart on
    // a database failure.
    let (mut summary, attempts) = config.retry.run("operator load", || {
        load_operators_once(connection, &config.operators_file, config.batch_size)
    })?;
    summary.attempts = attempts;

    info!(
        inserted = summary.inserted,
        skipped = summary.skipped,
        dates_nulled = summary.dates_nulled,
        attempts,
        "operators imported"
    );

    Ok(summary)
}

fn load_operators_once(
    connection: &mut Connection,
    path: &Path,
    batch_size: usize,
) -> Result<OperatorLoadSummary> {
    let mut summary = OperatorLoadSummary::default();

    connection
        .execute("DELETE FROM operators", [])
        .context("failed to reset operators table")?;

    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut batch: Vec<OperatorRecord> = Vec::with_capacity(batch_size);

    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read {}", path.display()))?;

        let Some(operator) = parse_operator_record(&record, &mut summary) else {
            continue;
        };

        batch.push(operator);
        if batch.len() == batch_size {
            flush_operator_batch(connection, &batch)?;
            summary.inserted += batch.len();
            batch.clear();
            info!(rows = summary.inserted, "flushed operator batch");
        }
    }

    if !batch.is_empty() {
        flush_operator_batch(connection, &batch)?;
        summary.inserted += batch.len();
    }

    Ok(summary)
}

fn parse_operator_record(
    record: &StringRecord,
    summary: &mut OperatorLoadSummary,
) -> Option<OperatorRecord> {
    if record.len() < 19 {
        warn!(
            columns = record.len(),
            "operator row skipped, insufficient columns"
        );
        summary.skipped += 1;
        return None;
    }

    let created_at = match optional_field(record, 18) {
        Some(raw) => match NaiveDate::parse_from_str(&raw, DATE_FORMAT) {
            Ok(date) => Some(date),
            Err(_) => {
                warn!(value = %raw, "operator date unparseable, storing null");
                summary.dates_nulled += 1;
                None
            }
        },
        None => None,
    };

    Some(OperatorRecord {
        ans_registration: optional_field(record, 0),
        cnpj: optional_field(record, 1),
        legal_name: optional_field(record, 2),
        trade_name: optional_field(record, 3),
        modality: optional_field(record, 4),
        address: optional_field(record, 5),
        number: optional_field(record, 6),
        complement: optional_field(record, 7),
        neighborhood: optional_field(record, 8),
        city: optional_field(record, 9),
        state: optional_field(record, 10),
        zip_code: optional_field(record, 11),
        area_code: optional_field(record, 12),
        phone: optional_field(record, 13),
        fax: optional_field(record, 14),
        email: optional_field(record, 15),
        representative: optional_field(record, 16),
        representative_role: optional_field(record, 17),
        created_at,
    })
}

/// Empty source fields become None and are stored as NULL, never as the
/// empty string.
fn optional_field(record: &StringRecord, index: usize) -> Option<String> {
    record
        .get(index)
        .map(|value| value.replace('"', ""))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn flush_operator_batch(connection: &mut Connection, batch: &[OperatorRecord]) -> Result<()> {
    let tx = connection.transaction()?;

    {
        let mut statement = tx.prepare(
            "
            INSERT INTO operators(
              ans_registration, cnpj, legal_name, trade_name, modality,
              address, number, complement, neighborhood, city, state,
              zip_code, area_code, phone, fax, email, representative,
              representative_role, created_at
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                   ?14, ?15, ?16, ?17, ?18, ?19)
            ",
        )?;

        for operator in batch {
            statement.execute(params![
                operator.ans_registration,
                operator.cnpj,
                operator.legal_name,
                operator.trade_name,
                operator.modality,
                operator.address,
                operator.number,
                operator.complement,
                operator.neighborhood,
                operator.city,
                operator.state,
                operator.zip_code,
                operator.area_code,
                operator.phone,
                operator.fax,
                operator.email,
                operator.representative,
                operator.representative_role,
                operator.created_at,
            ])?;
        }
    }

    tx.commit()?;
    Ok(())
}

fn import_financial_reports(
    connection: &mut Connection,
    config: &ImportConfig,
    path: &Path,
) -> Result<FinancialLoadSummary> {
    info!(file = %path.display(), "loading financial reports");

    // Only the file's own period is reset; other report years stay
    // untouched so periods can be re-imported independently.
    if let Some(year) = year_from_file_name(path)? {
        let deleted = connection
            .execute(
                "DELETE FROM financial_reports
                 WHERE CAST(strftime('%Y', report_date) AS INTEGER) = ?1",
                params![year],
            )
            .context("failed to reset report period")?;
        info!(year, deleted, "cleared existing report period");
    } else {
        warn!(
            file = %path.display(),
            "file name encodes no year, skipping period reset"
        );
    }

    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut summary = FinancialLoadSummary::default();
    let mut batch: Vec<FinancialRecord> = Vec::with_capacity(config.batch_size);

    for record in reader.records() {
        let record = record.with_context(|| format!("failed to read {}", path.display()))?;

        match parse_financial_record(&record) {
            RowOutcome::Row(report) => batch.push(report),
            RowOutcome::Degraded(report) => {
                summary.degraded += 1;
                batch.push(report);
            }
            RowOutcome::Skipped => {
                summary.skipped += 1;
                continue;
            }
        }

        if batch.len() == config.batch_size {
            flush_financial_batch(connection, &batch)?;
            summary.inserted += batch.len();
            batch.clear();
            info!(rows = summary.inserted, "flushed report batch");
        }
    }

    if !batch.is_empty() {
        flush_financial_batch(connection, &batch)?;
        summary.inserted += batch.len();
    }

    info!(
        inserted = summary.inserted,
        degraded = summary.degraded,
        skipped = summary.skipped,
        "financial reports imported"
    );

    Ok(summary)
}

fn year_from_file_name(path: &Path) -> Result<Option<i32>> {
    let pattern =
        Regex::new(r".*_(\d{4})_.*").context("failed to compile file-name year pattern")?;

    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return Ok(None);
    };

    let year = pattern
        .captures(name)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse::<i32>().ok());

    Ok(year)
}

/// Outcome of normalizing one source row. An unparseable balance degrades
/// that one field to zero; a malformed date or flag rejects just the row.
#[derive(Debug)]
enum RowOutcome {
    Row(FinancialRecord),
    Degraded(FinancialRecord),
    Skipped,
}

fn parse_financial_record(record: &StringRecord) -> RowOutcome {
    if record.len() < 6 {
        warn!(
            columns = record.len(),
            "report row skipped, insufficient columns"
        );
        return RowOutcome::Skipped;
    }

    let date_raw = clean_field(record.get(0));
    let Ok(report_date) = NaiveDate::parse_from_str(&date_raw, DATE_FORMAT) else {
        warn!(value = %date_raw, "report row skipped, malformed date");
        return RowOutcome::Skipped;
    };

    let flag_raw = clean_field(record.get(4));
    let Ok(is_consolidated) = flag_raw.parse::<i64>() else {
        warn!(value = %flag_raw, "report row skipped, non-numeric consolidated flag");
        return RowOutcome::Skipped;
    };

    let balance_raw = clean_field(record.get(5));
    let (balance, degraded) = match parse_balance(&balance_raw) {
        Some(value) => (value, false),
        None => {
            warn!(value = %balance_raw, "balance unparseable, storing zero");
            (0.0, true)
        }
    };

    let report = FinancialRecord {
        report_date,
        operator_code: clean_field(record.get(1)),
        account: clean_field(record.get(2)),
        description: clean_field(record.get(3)),
        is_consolidated,
        balance,
    };

    if degraded {
        RowOutcome::Degraded(report)
    } else {
        RowOutcome::Row(report)
    }
}

/// Quote handling is disabled for report files, so stray quote characters
/// are stripped from the value itself.
fn clean_field(value: Option<&str>) -> String {
    value.unwrap_or_default().replace('"', "").trim().to_string()
}

/// Balances arrive locale-formatted: `.` as thousands separator, `,` as
/// decimal separator.
fn parse_balance(raw: &str) -> Option<f64> {
    let normalized = raw.replace('.', "").replace(',', ".");
    normalized.parse::<f64>().ok()
}

fn flush_financial_batch(connection: &mut Connection, batch: &[FinancialRecord]) -> Result<()> {
    let tx = connection.transaction()?;

    {
        let mut statement = tx.prepare(
            "
            INSERT INTO financial_reports(
              report_date, operator_code, account, description,
              is_consolidated, balance
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ",
        )?;

        for report in batch {
            statement.execute(params![
                report.report_date,
                report.operator_code,
                report.account,
                report.description,
                report.is_consolidated,
                report.balance,
            ])?;
        }
    }

    tx.commit()?;
    Ok(())
}

fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use super::*;

    fn test_connection() -> Connection {
        let connection = Connection::open_in_memory().expect("open in-memory db");
        ensure_schema(&connection).expect("schema");
        connection
    }

    fn test_config(dir: &Path) -> ImportConfig {
        ImportConfig {
            db_path: dir.join("ansdata.sqlite"),
            data_dir: dir.to_path_buf(),
            operators_file: dir.join("active_operators.csv"),
            batch_size: 1000,
            retry: RetryPolicy {
                max_attempts: 1,
                delay: Duration::from_millis(1),
            },
        }
    }

    fn operator_row(registration: &str, date: &str) -> String {
        format!(
            "{registration};00000000000191;Legal Name SA;Trade Name;Medical group;Main Street;\
             10;;Downtown;Sao Paulo;SP;01310-100;11;5550-0000;;contact@example.com;\
             Ana Souza;Director;{date}"
        )
    }

    const OPERATORS_HEADER: &str = "Registro_ANS;CNPJ;Razao_Social;Nome_Fantasia;Modalidade;\
        Logradouro;Numero;Complemento;Bairro;Cidade;UF;CEP;DDD;Telefone;Fax;\
        Endereco_eletronico;Representante;Cargo_Representante;Data_Registro_ANS";

    #[test]
    fn operator_load_is_idempotent_across_reruns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("active_operators.csv");
        let contents = format!(
            "{OPERATORS_HEADER}\n{}\n{}\n",
            operator_row("326305", "2020-05-04"),
            operator_row("417173", "2019-11-20"),
        );
        fs::write(&path, contents).expect("write fixture");

        let mut connection = test_connection();

        for _ in 0..2 {
            let summary = load_operators_once(&mut connection, &path, 1000).expect("load");
            assert_eq!(summary.inserted, 2);
            assert_eq!(
                count_rows(&connection, "SELECT COUNT(*) FROM operators").unwrap(),
                2
            );
        }
    }

    #[test]
    fn short_operator_rows_are_skipped_and_load_continues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("active_operators.csv");
        let contents = format!(
            "{OPERATORS_HEADER}\n999999;truncated;row\n{}\n",
            operator_row("326305", "2020-05-04"),
        );
        fs::write(&path, contents).expect("write fixture");

        let mut connection = test_connection();
        let summary = load_operators_once(&mut connection, &path, 1000).expect("load");

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn unparseable_operator_dates_store_null() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("active_operators.csv");
        let contents = format!(
            "{OPERATORS_HEADER}\n{}\n",
            operator_row("326305", "04/05/2020"),
        );
        fs::write(&path, contents).expect("write fixture");

        let mut connection = test_connection();
        let summary = load_operators_once(&mut connection, &path, 1000).expect("load");

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.dates_nulled, 1);
        assert_eq!(
            count_rows(
                &connection,
                "SELECT COUNT(*) FROM operators WHERE created_at IS NULL"
            )
            .unwrap(),
            1
        );
    }

    #[test]
    fn empty_operator_fields_are_stored_as_null() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("active_operators.csv");
        let contents = format!(
            "{OPERATORS_HEADER}\n{}\n",
            operator_row("326305", "2020-05-04"),
        );
        fs::write(&path, contents).expect("write fixture");

        let mut connection = test_connection();
        load_operators_once(&mut connection, &path, 1000).expect("load");

        // Complement and fax are empty in the fixture row.
        assert_eq!(
            count_rows(
                &connection,
                "SELECT COUNT(*) FROM operators WHERE complement IS NULL AND fax IS NULL"
            )
            .unwrap(),
            1
        );
    }

    fn stage_reports(dir: &Path, year: i32, rows: &[&str]) -> PathBuf {
        let path = consolidated_output_path(dir, year);
        let mut contents =
            String::from("report_date;operator_code;account;description;is_consolidated;balance\n");
        for row in rows {
            contents.push_str(row);
            contents.push('\n');
        }
        fs::write(&path, contents).expect("write fixture");
        path
    }

    #[test]
    fn financial_reload_touches_only_the_matching_year() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut connection = test_connection();
        let config = test_config(dir.path());

        let path_2023 = stage_reports(
            dir.path(),
            2023,
            &[
                "2023-03-31;326305;411111;Premium revenue;0;1.000,00",
                "2023-06-30;326305;411111;Premium revenue;0;2.000,00",
            ],
        );
        let path_2024 = stage_reports(
            dir.path(),
            2024,
            &["2024-03-31;326305;411111;Premium revenue;1;3.000,00"],
        );

        import_financial_reports(&mut connection, &config, &path_2023).expect("load 2023");
        import_financial_reports(&mut connection, &config, &path_2024).expect("load 2024");

        // Re-running one period must leave the other untouched.
        let summary =
            import_financial_reports(&mut connection, &config, &path_2023).expect("reload 2023");
        assert_eq!(summary.inserted, 2);

        assert_eq!(
            count_rows(&connection, "SELECT COUNT(*) FROM financial_reports").unwrap(),
            3
        );
        assert_eq!(
            count_rows(
                &connection,
                "SELECT COUNT(*) FROM financial_reports WHERE report_date LIKE '2024%'"
            )
            .unwrap(),
            1
        );
    }

    #[test]
    fn unparseable_balance_degrades_to_zero_and_row_is_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut connection = test_connection();
        let config = test_config(dir.path());

        let path = stage_reports(
            dir.path(),
            2023,
            &["2023-03-31;326305;411111;Premium revenue;0;not-a-number"],
        );

        let summary = import_financial_reports(&mut connection, &config, &path).expect("load");
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.degraded, 1);

        let balance: f64 = connection
            .query_row("SELECT balance FROM financial_reports", [], |row| {
                row.get(0)
            })
            .expect("balance");
        assert_eq!(balance, 0.0);
    }

    #[test]
    fn short_financial_rows_are_skipped_and_load_continues() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut connection = test_connection();
        let config = test_config(dir.path());

        let path = stage_reports(
            dir.path(),
            2023,
            &[
                "2023-03-31;326305;411111;only four columns",
                "2023-03-31;326305;411111;Premium revenue;0;1.234,56",
            ],
        );

        let summary = import_financial_reports(&mut connection, &config, &path).expect("load");
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.inserted, 1);

        let balance: f64 = connection
            .query_row("SELECT balance FROM financial_reports", [], |row| {
                row.get(0)
            })
            .expect("balance");
        assert!((balance - 1234.56).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_dates_and_flags_reject_only_their_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut connection = test_connection();
        let config = test_config(dir.path());

        let path = stage_reports(
            dir.path(),
            2023,
            &[
                "31/03/2023;326305;411111;Premium revenue;0;1.000,00",
                "2023-03-31;326305;411111;Premium revenue;yes;1.000,00",
                "2023-03-31;326305;411111;Premium revenue;0;1.000,00",
            ],
        );

        let summary = import_financial_reports(&mut connection, &config, &path).expect("load");
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.inserted, 1);
    }

    #[test]
    fn balance_strings_use_locale_separators() {
        assert_eq!(parse_balance("1.234,56"), Some(1234.56));
        assert_eq!(parse_balance("-12.345.678,90"), Some(-12345678.90));
        assert_eq!(parse_balance("10"), Some(10.0));
        assert_eq!(parse_balance(""), None);
        assert_eq!(parse_balance("n/a"), None);
    }

    #[test]
    fn year_is_derived_from_the_consolidated_file_name() {
        let year = year_from_file_name(Path::new("financial_reports_2023_consolidated.csv"))
            .expect("pattern compiles");
        assert_eq!(year, Some(2023));

        let none = year_from_file_name(Path::new("reports.csv")).expect("pattern compiles");
        assert_eq!(none, None);
    }

    #[test]
    fn retry_policy_stops_at_the_first_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        };
        let calls = Cell::new(0usize);

        let (value, attempts) = policy
            .run("flaky operation", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    bail!("transient failure");
                }
                Ok(7)
            })
            .expect("succeeds within budget");

        assert_eq!(value, 7);
        assert_eq!(attempts, 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_policy_propagates_once_the_budget_is_spent() {
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(1),
        };
        let calls = Cell::new(0usize);

        let result: Result<((), usize)> = policy.run("doomed operation", || {
            calls.set(calls.get() + 1);
            bail!("persistent failure");
        });

        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }
}
