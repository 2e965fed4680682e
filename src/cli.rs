use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "ansdata",
    version,
    about = "Local ANS open-data extraction and import tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract the procedure table from a linearized document text file.
    Convert(ConvertArgs),
    /// Merge one reporting period's source files into a consolidated CSV.
    Consolidate(ConsolidateArgs),
    /// Load operator and financial-report CSV files into the local store.
    Import(ImportArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConvertArgs {
    #[arg(long, default_value = ".cache/ansdata")]
    pub cache_root: PathBuf,

    /// Text rendering of the procedure annex, as produced by the external
    /// text-linearization step.
    #[arg(long)]
    pub input_text: PathBuf,

    #[arg(long)]
    pub output_csv: Option<PathBuf>,

    #[arg(long)]
    pub diagnostic_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ConsolidateArgs {
    #[arg(long, default_value = ".cache/ansdata")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long)]
    pub year: i32,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    #[arg(long, default_value = ".cache/ansdata")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub operators_file: Option<PathBuf>,

    /// Report years to consolidate and import. Defaults to the previous
    /// and current calendar year.
    #[arg(long = "year")]
    pub years: Vec<i32>,

    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: usize,

    #[arg(long, default_value_t = 3)]
    pub retry_delay_secs: u64,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/ansdata")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}
