use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_TOKENS, DEFAULT_OUTPUT_ROOT, DEFAULT_POLL_INTERVAL_SECS,
};
use crate::model::Vendor;

#[derive(Parser, Debug)]
#[command(
    name = "vqa-judge",
    version,
    about = "Batch LLM judging and ensemble scoring for VQA answer tables"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Judge(JudgeArgs),
    Merge(MergeArgs),
    Evaluate(EvaluateArgs),
    Scores(ScoresArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct JudgeArgs {
    pub input: PathBuf,

    #[arg(long, value_enum)]
    pub vendor: Vendor,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,

    #[arg(long)]
    pub max_wait_secs: Option<u64>,

    #[arg(long, default_value = DEFAULT_OUTPUT_ROOT)]
    pub output_root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct MergeArgs {
    pub input: PathBuf,

    #[arg(value_enum)]
    pub vendor: Vendor,

    #[arg(long, default_value = DEFAULT_OUTPUT_ROOT)]
    pub output_root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    pub input: PathBuf,

    #[arg(long, default_value_t = false)]
    pub skip_ensemble: bool,

    #[arg(long, default_value_t = false)]
    pub skip_scores: bool,

    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ScoresArgs {
    #[arg(long, default_value = DEFAULT_OUTPUT_ROOT)]
    pub output_root: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    pub input: PathBuf,

    #[arg(long, value_enum)]
    pub vendor: Vendor,

    #[arg(long, default_value = DEFAULT_OUTPUT_ROOT)]
    pub output_root: PathBuf,
}
