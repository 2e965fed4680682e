use chrono::NaiveDate;
use serde::Serialize;

/// Procedure classification derived from the source category tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureCategory {
    Dental,
    Outpatient,
}

impl ProcedureCategory {
    /// Maps the two recognized source tokens. Anything else is not a
    /// category and the caller must drop the row.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "OD" => Some(Self::Dental),
            "AMB" => Some(Self::Outpatient),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Dental => "Dental",
            Self::Outpatient => "Outpatient",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureRecord {
    pub code: String,
    pub description: String,
    pub category: ProcedureCategory,
}

/// One active-operator row. Field order matches the source CSV; empty
/// source fields become None and are stored as SQL NULL.
#[derive(Debug, Clone)]
pub struct OperatorRecord {
    pub ans_registration: Option<String>,
    pub cnpj: Option<String>,
    pub legal_name: Option<String>,
    pub trade_name: Option<String>,
    pub modality: Option<String>,
    pub address: Option<String>,
    pub number: Option<String>,
    pub complement: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub area_code: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub email: Option<String>,
    pub representative: Option<String>,
    pub representative_role: Option<String>,
    pub created_at: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct FinancialRecord {
    pub report_date: NaiveDate,
    pub operator_code: String,
    pub account: String,
    pub description: String,
    pub is_consolidated: i64,
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFileEntry {
    pub filename: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertPaths {
    pub input_text: String,
    pub output_csv: String,
    pub diagnostic_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertCounts {
    pub line_count: usize,
    pub records_extracted: usize,
    pub strategies_attempted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub strategy: String,
    pub paths: ConvertPaths,
    pub counts: ConvertCounts,
    pub source: SourceFileEntry,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub year: i32,
    pub output_path: String,
    pub input_files: Vec<SourceFileEntry>,
    pub data_rows: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OperatorLoadSummary {
    pub inserted: usize,
    pub skipped: usize,
    pub dates_nulled: usize,
    pub attempts: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FinancialLoadSummary {
    pub inserted: usize,
    pub degraded: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinancialYearCounts {
    pub year: i32,
    pub summary: FinancialLoadSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationEntry {
    pub year: i32,
    pub output: String,
    pub input_files: Vec<SourceFileEntry>,
    pub data_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportPaths {
    pub cache_root: String,
    pub data_dir: String,
    pub db_path: String,
    pub manifest_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportCounts {
    pub operators: OperatorLoadSummary,
    pub financial_years: Vec<FinancialYearCounts>,
    pub total_inserted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub paths: ImportPaths,
    pub counts: ImportCounts,
    pub consolidations: Vec<ConsolidationEntry>,
    pub source_hashes: Vec<SourceFileEntry>,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}
