use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};

use crate::cli::JudgeArgs;
use crate::model::Vendor;
use crate::util::dataset_basename;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_OUTPUT_ROOT: &str = "output";
pub const DEFAULT_MAX_TOKENS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_wait: None,
        }
    }
}

#[derive(Clone)]
pub struct JudgeConfig {
    pub vendor: Vendor,
    pub model: String,
    pub batch_size: usize,
    pub max_tokens: u32,
    pub poll: PollSettings,
    pub output_root: PathBuf,
    pub api_key: String,
}

impl std::fmt::Debug for JudgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeConfig")
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .field("batch_size", &self.batch_size)
            .field("max_tokens", &self.max_tokens)
            .field("poll", &self.poll)
            .field("output_root", &self.output_root)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl JudgeConfig {
    pub fn from_args(args: &JudgeArgs) -> Result<Self> {
        let api_key = read_api_key(args.vendor)?;

        Ok(Self {
            vendor: args.vendor,
            model: args
                .model
                .clone()
                .filter(|model| !model.trim().is_empty())
                .unwrap_or_else(|| args.vendor.default_model().to_string()),
            batch_size: args.batch_size.max(1),
            max_tokens: args.max_tokens,
            poll: PollSettings {
                interval: Duration::from_secs(args.poll_interval_secs),
                max_wait: args.max_wait_secs.map(Duration::from_secs),
            },
            output_root: args.output_root.clone(),
            api_key,
        })
    }

    pub fn dataset_dir(&self, input_path: &Path) -> PathBuf {
        judge_dataset_dir(&self.output_root, self.vendor, input_path)
    }
}

pub fn judge_dataset_dir(output_root: &Path, vendor: Vendor, input_path: &Path) -> PathBuf {
    output_root
        .join(vendor.judge_dir_name())
        .join(dataset_basename(input_path))
}

// `{output_root}/logs/{dataset}/{command}_{vendor}.log`
pub fn run_log_path(
    output_root: &Path,
    input_path: &Path,
    command: &str,
    vendor: Vendor,
) -> PathBuf {
    output_root
        .join("logs")
        .join(dataset_basename(input_path))
        .join(format!("{command}_{}.log", vendor.as_str()))
}

pub fn read_api_key(vendor: Vendor) -> Result<String> {
    let name = vendor.api_key_env();
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => bail!("{name} not found in environment"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judge_dataset_dir_nests_vendor_and_dataset() {
        let dir = judge_dataset_dir(
            Path::new("output"),
            Vendor::Gemini,
            Path::new("data/gemini_2.5_pro.csv"),
        );
        assert_eq!(dir, Path::new("output/gemini_judge/gemini_2.5_pro"));
    }

    #[test]
    fn run_log_path_groups_logs_by_dataset() {
        let path = run_log_path(
            Path::new("output"),
            Path::new("data/gpt4o.csv"),
            "judge",
            Vendor::Claude,
        );
        assert_eq!(path, Path::new("output/logs/gpt4o/judge_claude.log"));
    }

    #[test]
    fn default_poll_settings_have_no_deadline() {
        let poll = PollSettings::default();
        assert_eq!(poll.interval, Duration::from_secs(30));
        assert!(poll.max_wait.is_none());
    }
}
