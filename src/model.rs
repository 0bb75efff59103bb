use std::fmt;
use std::ops::AddAssign;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const INVALID_RATING: i64 = -1;
pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 4;
pub const CORRECT_THRESHOLD: i64 = 3;

pub const QA_ID_COLUMN: &str = "QA_Pair_ID";
pub const QUESTION_COLUMN: &str = "Question";
pub const MODEL_ANSWER_COLUMN: &str = "Model Answer";
pub const REFERENCE_ANSWER_COLUMN: &str = "Reference Answer";
pub const QA_TYPE_COLUMN: &str = "QA Type";
pub const ENSEMBLE_RATING_COLUMN: &str = "Ensemble_Judge_Rating";

pub fn is_valid_rating(rating: i64) -> bool {
    (MIN_RATING..=MAX_RATING).contains(&rating)
}

// Accepts "3", "3.0" and " 4 "; anything outside 1..=4 is `None`.
pub fn parse_rating_cell(cell: &str) -> Option<i64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }

    let value = match trimmed.parse::<i64>() {
        Ok(value) => value,
        Err(_) => {
            let float = trimmed.parse::<f64>().ok()?;
            if !float.is_finite() || float.fract() != 0.0 {
                return None;
            }
            float as i64
        }
    };

    is_valid_rating(value).then_some(value)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Claude,
    Gemini,
    Openai,
}

impl Vendor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Openai => "openai",
        }
    }

    pub fn column_label(self) -> &'static str {
        match self {
            Self::Claude => "Claude",
            Self::Gemini => "Gemini",
            Self::Openai => "Openai",
        }
    }

    pub fn rating_column(self) -> String {
        format!("{}_Judge_Rating", self.column_label())
    }

    pub fn reason_column(self) -> String {
        format!("{}_Judge_Reason", self.column_label())
    }

    pub fn judge_dir_name(self) -> String {
        format!("{}_judge", self.as_str())
    }

    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::Gemini => "GOOGLE_API_KEY",
            Self::Openai => "OPENAI_API_KEY",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Claude => "claude-sonnet-4-5",
            Self::Gemini => "models/gemini-2.5-pro",
            Self::Openai => "gpt-4o",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaRecord {
    pub id: String,
    pub question: String,
    pub reference_answer: String,
    pub candidate_answer: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub qa_id: String,
    pub rating: i64,
    pub reason: String,
    pub response_text: Option<String>,
    pub usage: TokenUsage,
}

impl Judgment {
    pub fn invalid(qa_id: &str, reason: impl Into<String>) -> Self {
        Self {
            qa_id: qa_id.to_string(),
            rating: INVALID_RATING,
            reason: reason.into(),
            response_text: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn is_valid(&self) -> bool {
        is_valid_rating(self.rating)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutputRow {
    #[serde(rename = "QA_Pair_ID")]
    pub qa_id: String,
    #[serde(rename = "Question")]
    pub question: String,
    #[serde(rename = "Model_Answer")]
    pub model_answer: String,
    #[serde(rename = "Reference_Answer")]
    pub reference_answer: String,
    #[serde(rename = "Judge_Rating")]
    pub judge_rating: String,
    #[serde(rename = "Judge_Reason")]
    pub judge_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl From<TokenUsage> for TokenTotals {
    fn from(usage: TokenUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenAverages {
    pub input_tokens: f64,
    pub output_tokens: f64,
    pub total_tokens: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenUsageSummary {
    pub timestamp: String,
    pub total_qa_pairs: usize,
    pub total_batches: usize,
    pub token_usage: TokenTotals,
    pub average_per_qa: TokenAverages,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenDetailRequest {
    pub question: String,
    pub model_answer: String,
    pub reference_answer: String,
    pub full_prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenDetailResponse {
    pub rating: i64,
    pub reason: String,
    pub full_response_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenDetailEntry {
    pub qa_id: String,
    pub request: TokenDetailRequest,
    pub response: TokenDetailResponse,
    pub tokens: TokenTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchTokenAnalysis {
    pub timestamp: String,
    pub batch_number: usize,
    pub num_qa_pairs: usize,
    pub token_summary: TokenTotals,
    pub detailed_entries: Vec<TokenDetailEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JudgeRunCounts {
    pub rows: usize,
    pub pending: usize,
    pub skipped_from_batch_files: usize,
    pub skipped_from_store: usize,
    pub unjudgeable: usize,
    pub duplicate_ids: usize,
    pub batches: usize,
    pub judged_valid: usize,
    pub judged_invalid: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgeRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub vendor: Vendor,
    pub model: String,
    pub input_path: String,
    pub input_sha256: String,
    pub batch_size: usize,
    pub poll_interval_secs: u64,
    pub max_wait_secs: Option<u64>,
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub counts: JudgeRunCounts,
    pub batch_files: Vec<String>,
}
