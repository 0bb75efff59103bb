mod anthropic;
mod gemini;
mod http;
mod openai;
pub mod resume;
pub mod runner;

use anyhow::Result;

use crate::config::JudgeConfig;
use crate::model::{TokenUsage, Vendor};

pub use anthropic::AnthropicBatchJudge;
pub use gemini::GeminiBatchJudge;
pub use openai::OpenAiBatchJudge;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeRequest {
    pub key: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running {
        state: String,
    },
    Succeeded {
        state: String,
        output_ref: Option<String>,
    },
    Failed {
        state: String,
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOutcome {
    Text(String),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub key: String,
    pub outcome: RawOutcome,
    pub usage: TokenUsage,
}

pub trait BatchJudge {
    fn vendor(&self) -> Vendor;

    fn model(&self) -> &str;

    fn submit(&self, requests: &[JudgeRequest]) -> Result<JobHandle>;

    fn poll(&self, handle: &JobHandle) -> Result<JobStatus>;

    fn fetch_results(&self, handle: &JobHandle, output_ref: &str) -> Result<Vec<RawRecord>>;
}

pub fn build_judge(config: &JudgeConfig) -> Result<Box<dyn BatchJudge>> {
    let judge: Box<dyn BatchJudge> = match config.vendor {
        Vendor::Claude => Box::new(AnthropicBatchJudge::new(
            config.api_key.clone(),
            config.model.clone(),
            config.max_tokens,
        )?),
        Vendor::Gemini => Box::new(GeminiBatchJudge::new(
            config.api_key.clone(),
            config.model.clone(),
        )?),
        Vendor::Openai => Box::new(OpenAiBatchJudge::new(
            config.api_key.clone(),
            config.model.clone(),
        )?),
    };
    Ok(judge)
}
