use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use regex::Regex;
use tracing::{info, warn};

use crate::cli::ConsolidateArgs;
use crate::model::{ConsolidationManifest, SourceFileEntry};
use crate::util::{now_utc_string, sha256_file, write_json_pretty};

pub fn run(args: ConsolidateArgs) -> Result<()> {
    let output_path = consolidated_output_path(&args.data_dir, args.year);

    let Some(outcome) = consolidate_year(&args.data_dir, args.year, &output_path)? else {
        warn!(
            year = args.year,
            dir = %args.data_dir.display(),
            "no period files found, nothing to consolidate"
        );
        return Ok(());
    };

    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        args.cache_root
            .join("manifests")
            .join(format!("consolidation_{}.json", args.year))
    });

    let manifest = ConsolidationManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        year: args.year,
        output_path: output_path.display().to_string(),
        input_files: outcome.input_files,
        data_rows: outcome.data_rows,
    };
    write_json_pretty(&manifest_path, &manifest)?;

    info!(path = %manifest_path.display(), "wrote consolidation manifest");
    info!(
        year = args.year,
        rows = outcome.data_rows,
        output = %output_path.display(),
        "consolidation completed"
    );

    Ok(())
}

#[derive(Debug)]
pub struct ConsolidationOutcome {
    pub input_files: Vec<SourceFileEntry>,
    pub data_rows: usize,
}

pub fn consolidated_output_path(data_dir: &Path, year: i32) -> PathBuf {
    data_dir.join(format!("financial_reports_{year}_consolidated.csv"))
}

/// Merges one reporting period's source files into `output_path`, header
/// from the most recently modified file, data rows appended in that same
/// recency order. Duplicate rows across files are preserved as-is.
///
/// Returns Ok(None) when the directory holds no files for the period;
/// callers treat that as "skip this period", not as a failure.
pub fn consolidate_year(
    data_dir: &Path,
    year: i32,
    output_path: &Path,
) -> Result<Option<ConsolidationOutcome>> {
    let mut inputs = discover_period_files(data_dir, year, output_path)?;
    if inputs.is_empty() {
        return Ok(None);
    }

    // Newest export first: it defines the header when quarterly files
    // disagree on column naming or order.
    inputs.sort_by(|a, b| b.modified.cmp(&a.modified));

    let mut writer = WriterBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;

    let header = read_header(&inputs[0].path)?;
    writer
        .write_record(&header)
        .context("failed to write consolidated header")?;

    let mut data_rows = 0usize;
    let mut input_files = Vec::with_capacity(inputs.len());

    for input in &inputs {
        let mut reader = ReaderBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .has_headers(false)
            .from_path(&input.path)
            .with_context(|| format!("failed to open {}", input.path.display()))?;

        let mut rows_from_file = 0usize;
        for (index, record) in reader.records().enumerate() {
            let record =
                record.with_context(|| format!("failed to read {}", input.path.display()))?;
            if index == 0 {
                continue;
            }

            writer
                .write_record(&record)
                .with_context(|| format!("failed to append row from {}", input.path.display()))?;
            rows_from_file += 1;
        }

        info!(
            file = %input.path.display(),
            rows = rows_from_file,
            "appended period file"
        );

        data_rows += rows_from_file;
        input_files.push(SourceFileEntry {
            filename: file_name_string(&input.path),
            sha256: sha256_file(&input.path)?,
        });
    }

    writer
        .flush()
        .with_context(|| format!("failed to flush {}", output_path.display()))?;

    Ok(Some(ConsolidationOutcome {
        input_files,
        data_rows,
    }))
}

#[derive(Debug)]
struct PeriodFile {
    path: PathBuf,
    modified: SystemTime,
}

fn discover_period_files(
    data_dir: &Path,
    year: i32,
    output_path: &Path,
) -> Result<Vec<PeriodFile>> {
    let pattern = period_file_pattern(year)?;
    let mut matches = Vec::new();

    let entries =
        fs::read_dir(data_dir).with_context(|| format!("failed to read {}", data_dir.display()))?;

    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", data_dir.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !pattern.is_match(name) || name.contains("consolidated") || path == output_path {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .with_context(|| format!("failed to read mtime: {}", path.display()))?;

        matches.push(PeriodFile { path, modified });
    }

    Ok(matches)
}

fn period_file_pattern(year: i32) -> Result<Regex> {
    Regex::new(&format!(r".*_{year}(_\dT)?.*\.csv$"))
        .context("failed to compile period file pattern")
}

fn read_header(path: &Path) -> Result<StringRecord> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut record = StringRecord::new();
    let has_header = reader
        .read_record(&mut record)
        .with_context(|| format!("failed to read header from {}", path.display()))?;
    if !has_header {
        bail!("period file is empty: {}", path.display());
    }

    Ok(record)
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::Duration;

    use super::*;

    fn stage_file(dir: &Path, name: &str, contents: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("write fixture");

        let modified = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(&path)
            .expect("open fixture")
            .set_modified(modified)
            .expect("set mtime");

        path
    }

    #[test]
    fn header_comes_from_newest_file_and_rows_follow_recency_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = consolidated_output_path(dir.path(), 2023);

        stage_file(dir.path(), "reports_2023_1T.csv", "H_OLD\nw1\n", 300);
        stage_file(dir.path(), "reports_2023_2T.csv", "H_MID\nz1\n", 200);
        stage_file(dir.path(), "reports_2023_3T.csv", "H_MID\ny1\ny2\n", 100);
        stage_file(dir.path(), "reports_2023_4T.csv", "H1\n", 10);

        let outcome = consolidate_year(dir.path(), 2023, &output)
            .expect("consolidation should succeed")
            .expect("period files are present");

        assert_eq!(outcome.data_rows, 4);
        assert_eq!(outcome.input_files.len(), 4);

        let written = fs::read_to_string(&output).unwrap();
        assert_eq!(
            written.lines().collect::<Vec<&str>>(),
            vec!["H1", "y1", "y2", "z1", "w1"]
        );
    }

    #[test]
    fn duplicate_rows_across_files_are_preserved() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = consolidated_output_path(dir.path(), 2024);

        stage_file(dir.path(), "reports_2024_1T.csv", "H\na;1\n", 100);
        stage_file(dir.path(), "reports_2024_2T.csv", "H\na;1\n", 10);

        let outcome = consolidate_year(dir.path(), 2024, &output)
            .expect("consolidation should succeed")
            .expect("period files are present");

        assert_eq!(outcome.data_rows, 2);
    }

    #[test]
    fn empty_period_signals_no_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = consolidated_output_path(dir.path(), 2023);

        stage_file(dir.path(), "reports_2022_4T.csv", "H\nrow\n", 10);

        let outcome = consolidate_year(dir.path(), 2023, &output).expect("no-input is not fatal");
        assert!(outcome.is_none());
    }

    #[test]
    fn prior_consolidated_output_is_not_consumed_as_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = consolidated_output_path(dir.path(), 2023);

        stage_file(dir.path(), "reports_2023_1T.csv", "H\nrow\n", 100);

        for _ in 0..2 {
            let outcome = consolidate_year(dir.path(), 2023, &output)
                .expect("consolidation should succeed")
                .expect("period files are present");
            assert_eq!(outcome.data_rows, 1);
            assert_eq!(outcome.input_files.len(), 1);
        }
    }
}
