use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use regex::Regex;
use tracing::info;

use crate::cli::ConvertArgs;
use crate::model::{
    ConvertCounts, ConvertPaths, ConvertRunManifest, ProcedureCategory, ProcedureRecord,
    SourceFileEntry,
};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

pub fn run(args: ConvertArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let output_csv = args
        .output_csv
        .clone()
        .unwrap_or_else(|| cache_root.join("procedures.csv"));
    let diagnostic_path = args
        .diagnostic_path
        .clone()
        .unwrap_or_else(|| cache_root.join("extraction_debug.txt"));
    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "convert_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });

    info!(input = %args.input_text.display(), run_id = %run_id, "starting conversion");

    let text = fs::read_to_string(&args.input_text)
        .with_context(|| format!("failed to read {}", args.input_text.display()))?;

    // The raw text layer is persisted before parsing so an empty extraction
    // always leaves inspectable evidence behind.
    write_diagnostic(&diagnostic_path, &text)?;

    let parser = ProcedureTableParser::new()?;
    let extraction = parser.extract(&text);

    if extraction.records.is_empty() {
        bail!(
            "no table data extracted from {}; inspect {} for the raw text layer",
            args.input_text.display(),
            diagnostic_path.display()
        );
    }

    info!(
        records = extraction.records.len(),
        strategy = extraction.strategy.as_str(),
        "extraction completed"
    );

    write_procedures_csv(&output_csv, &extraction.records)?;

    let source = SourceFileEntry {
        filename: args.input_text.display().to_string(),
        sha256: sha256_file(&args.input_text)?,
    };

    let manifest = ConvertRunManifest {
        manifest_version: 1,
        run_id,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        strategy: extraction.strategy.as_str().to_string(),
        paths: ConvertPaths {
            input_text: args.input_text.display().to_string(),
            output_csv: output_csv.display().to_string(),
            diagnostic_path: diagnostic_path.display().to_string(),
        },
        counts: ConvertCounts {
            line_count: text.lines().count(),
            records_extracted: extraction.records.len(),
            strategies_attempted: extraction.attempts,
        },
        source,
        warnings: Vec::new(),
        notes: vec![
            "Conversion ran the extraction strategy cascade over the linearized text layer."
                .to_string(),
        ],
    };

    write_json_pretty(&manifest_path, &manifest)?;

    info!(path = %manifest_path.display(), "wrote convert run manifest");
    info!(
        path = %output_csv.display(),
        records = extraction.records.len(),
        "conversion completed"
    );

    Ok(())
}

fn write_diagnostic(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    // Overwrite, never append: the artifact mirrors exactly one input.
    fs::write(path, text)
        .with_context(|| format!("failed to write diagnostic artifact: {}", path.display()))?;

    info!(path = %path.display(), "wrote extraction diagnostic");
    Ok(())
}

fn write_procedures_csv(path: &Path, records: &[ProcedureRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;

    writer
        .write_record(["Code", "Description", "Category"])
        .context("failed to write procedures header")?;

    for record in records {
        writer
            .write_record([
                record.code.as_str(),
                record.description.as_str(),
                record.category.label(),
            ])
            .with_context(|| format!("failed to write procedure row {}", record.code))?;
    }

    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Anchored,
    Relaxed,
    Tokenized,
}

impl Strategy {
    fn as_str(self) -> &'static str {
        match self {
            Strategy::Anchored => "anchored",
            Strategy::Relaxed => "relaxed",
            Strategy::Tokenized => "tokenized",
        }
    }
}

#[derive(Debug)]
struct Extraction {
    records: Vec<ProcedureRecord>,
    strategy: Strategy,
    attempts: usize,
}

/// Ordered extraction strategies over the linearized table text. Source
/// documents render the same logical table with inconsistent spacing, so
/// the cascade trades precision for recall as structure degrades.
#[derive(Debug)]
struct ProcedureTableParser {
    anchored_row: Regex,
    relaxed_row: Regex,
    code_token: Regex,
    category_token: Regex,
    column_gap: Regex,
}

impl ProcedureTableParser {
    fn new() -> Result<Self> {
        Ok(Self {
            anchored_row: Regex::new(r"^(\d{4,})\s+(.+?)\s+(OD|AMB)\s*$")
                .context("failed to compile anchored row regex")?,
            relaxed_row: Regex::new(r"(\d{4,})\s+(.+?)\s+(OD|AMB)")
                .context("failed to compile relaxed row regex")?,
            code_token: Regex::new(r"\d{4,}").context("failed to compile code token regex")?,
            category_token: Regex::new(r"\b(OD|AMB)\b")
                .context("failed to compile category token regex")?,
            column_gap: Regex::new(r"\t|\s{2,}").context("failed to compile column gap regex")?,
        })
    }

    /// Runs the strategies in order; the first one to produce any records
    /// wins and later strategies are never consulted. Results are never
    /// merged across strategies.
    fn extract(&self, text: &str) -> Extraction {
        let strategies = [Strategy::Anchored, Strategy::Relaxed, Strategy::Tokenized];
        let mut attempts = 0usize;

        for strategy in strategies {
            attempts += 1;
            let records = match strategy {
                Strategy::Anchored => self.extract_anchored(text),
                Strategy::Relaxed => self.extract_relaxed(text),
                Strategy::Tokenized => self.extract_tokenized(text),
            };

            if !records.is_empty() {
                return Extraction {
                    records,
                    strategy,
                    attempts,
                };
            }
        }

        Extraction {
            records: Vec::new(),
            strategy: Strategy::Tokenized,
            attempts,
        }
    }

    /// Well-formed tables: the whole line is one row, nothing trailing.
    fn extract_anchored(&self, text: &str) -> Vec<ProcedureRecord> {
        text.lines()
            .filter_map(|line| {
                let captures = self.anchored_row.captures(line.trim())?;
                build_record(
                    captures.get(1)?.as_str(),
                    captures.get(2)?.as_str(),
                    captures.get(3)?.as_str(),
                )
            })
            .collect()
    }

    /// Irregular spacing: first substring match per line, leading and
    /// trailing noise tolerated. Later matches on the same line are
    /// discarded.
    fn extract_relaxed(&self, text: &str) -> Vec<ProcedureRecord> {
        text.lines()
            .filter_map(|line| {
                let captures = self.relaxed_row.captures(line.trim())?;
                build_record(
                    captures.get(1)?.as_str(),
                    captures.get(2)?.as_str(),
                    captures.get(3)?.as_str(),
                )
            })
            .collect()
    }

    /// Last resort for heavily degraded layouts: accept any line carrying
    /// both a code token and a category token, then read the first three
    /// column gaps as code/description/category.
    fn extract_tokenized(&self, text: &str) -> Vec<ProcedureRecord> {
        text.lines()
            .filter_map(|line| self.tokenize_line(line))
            .collect()
    }

    fn tokenize_line(&self, line: &str) -> Option<ProcedureRecord> {
        let collapsed = collapse_whitespace(line);
        if !self.code_token.is_match(&collapsed) || !self.category_token.is_match(&collapsed) {
            return None;
        }

        // Column gaps only survive in the uncollapsed line.
        let segments: Vec<&str> = self.column_gap.split(line.trim()).collect();
        if segments.len() < 3 {
            return None;
        }

        let code = collapse_whitespace(segments[0]);
        if !is_procedure_code(&code) {
            return None;
        }

        let description = collapse_whitespace(segments[1]);
        let category = ProcedureCategory::from_token(&collapse_whitespace(segments[2]))?;

        Some(ProcedureRecord {
            code,
            description,
            category,
        })
    }
}

fn build_record(code: &str, description: &str, token: &str) -> Option<ProcedureRecord> {
    let category = ProcedureCategory::from_token(token)?;

    Some(ProcedureRecord {
        code: code.trim().to_string(),
        description: description.trim().to_string(),
        category,
    })
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn is_procedure_code(token: &str) -> bool {
    token.len() >= 4 && token.chars().all(|character| character.is_ascii_digit())
}
