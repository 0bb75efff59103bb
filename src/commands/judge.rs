use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::JudgeArgs;
use crate::config::JudgeConfig;
use crate::judge::resume::{batch_file_name, load_judged_ids, next_batch_number};
use crate::judge::runner::{BatchOutcome, run_batch};
use crate::judge::{BatchJudge, build_judge};
use crate::lenient_json::VerdictParser;
use crate::model::{
    BatchOutputRow, BatchTokenAnalysis, JudgeRunCounts, JudgeRunManifest, QA_ID_COLUMN, QaRecord,
    TokenAverages, TokenDetailEntry, TokenDetailRequest, TokenDetailResponse, TokenUsage,
    TokenUsageSummary, Vendor, parse_rating_cell,
};
use crate::prompt::vendor_judge_prompt;
use crate::store::{RowStore, write_typed_csv};
use crate::util::{
    dataset_basename, ensure_directory, now_utc_string, round2, sha256_file, utc_compact_string,
    write_json_pretty,
};

const MANIFEST_VERSION: u32 = 1;
pub const RUN_MANIFEST_FILE: &str = "run_manifest.json";
pub const TOKEN_SUMMARY_FILE: &str = "token_usage_summary.json";
const TOKEN_ANALYSIS_DIR: &str = "token_analysis";

pub fn run(args: JudgeArgs) -> Result<()> {
    if !args.input.exists() {
        bail!("file not found: {}", args.input.display());
    }

    let config = JudgeConfig::from_args(&args)?;
    info!(
        vendor = %config.vendor,
        model = %config.model,
        batch_size = config.batch_size,
        poll_interval_secs = config.poll.interval.as_secs(),
        input = %args.input.display(),
        "judge run requested"
    );

    let judge = build_judge(&config)?;
    let manifest = execute(&config, judge.as_ref(), &args.input)?;

    info!(
        run_id = %manifest.run_id,
        status = %manifest.status,
        pending = manifest.counts.pending,
        batches = manifest.counts.batches,
        judged_valid = manifest.counts.judged_valid,
        judged_invalid = manifest.counts.judged_invalid,
        "judge run completed"
    );
    Ok(())
}

pub struct PendingPlan {
    pub records: Vec<QaRecord>,
    pub counts: JudgeRunCounts,
}

pub fn plan_pending(store: &RowStore, vendor: Vendor, judged: &HashSet<String>) -> PendingPlan {
    let rating_column = vendor.rating_column();
    let mut counts = JudgeRunCounts {
        rows: store.len(),
        ..JudgeRunCounts::default()
    };
    let mut queued = HashSet::new();
    let mut records = Vec::new();

    for row_idx in 0..store.len() {
        if store.get(row_idx, QA_ID_COLUMN).trim().is_empty() {
            warn!(row = row_idx, qa_id = %store.qa_id(row_idx), "row has no QA id, using fallback");
        }
        let qa_id = store.qa_id(row_idx);

        if judged.contains(&qa_id) {
            counts.skipped_from_batch_files += 1;
            continue;
        }
        if parse_rating_cell(store.get(row_idx, &rating_column)).is_some() {
            counts.skipped_from_store += 1;
            continue;
        }
        let Some(record) = store.qa_record(row_idx) else {
            counts.unjudgeable += 1;
            continue;
        };
        if !queued.insert(qa_id) {
            counts.duplicate_ids += 1;
            continue;
        }
        records.push(record);
    }

    if counts.duplicate_ids > 0 {
        warn!(duplicates = counts.duplicate_ids, "duplicate QA ids queued only once");
    }
    counts.pending = records.len();

    PendingPlan { records, counts }
}

pub fn execute(
    config: &JudgeConfig,
    judge: &dyn BatchJudge,
    input: &Path,
) -> Result<JudgeRunManifest> {
    let started_at = now_utc_string();
    let store = RowStore::load(input)?;
    let dataset_dir = config.dataset_dir(input);
    let resume = load_judged_ids(&dataset_dir)?;

    let PendingPlan {
        records,
        mut counts,
    } = plan_pending(&store, config.vendor, &resume.judged);
    info!(
        dataset = %dataset_basename(input),
        rows = counts.rows,
        pending = counts.pending,
        skipped_from_batch_files = counts.skipped_from_batch_files,
        skipped_from_store = counts.skipped_from_store,
        unjudgeable = counts.unjudgeable,
        "resume plan built"
    );

    let run_dir = unique_run_dir(&dataset_dir, &utc_compact_string(Utc::now()));
    let mut manifest = JudgeRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: run_dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string(),
        vendor: config.vendor,
        model: judge.model().to_string(),
        input_path: input.display().to_string(),
        input_sha256: sha256_file(input)?,
        batch_size: config.batch_size,
        poll_interval_secs: config.poll.interval.as_secs(),
        max_wait_secs: config.poll.max_wait.map(|wait| wait.as_secs()),
        status: "running".to_string(),
        started_at,
        finished_at: String::new(),
        counts: counts.clone(),
        batch_files: Vec::new(),
    };

    if records.is_empty() {
        info!("all rows already judged, nothing to submit");
        manifest.status = "nothing_to_do".to_string();
        manifest.finished_at = now_utc_string();
        return Ok(manifest);
    }

    ensure_directory(&run_dir)?;
    let manifest_path = run_dir.join(RUN_MANIFEST_FILE);
    write_json_pretty(&manifest_path, &manifest)?;

    let parser = VerdictParser::new()?;
    let mut batch_number = next_batch_number(&run_dir)?;
    let mut usage = TokenUsage::default();
    let total_batches = records.len().div_ceil(config.batch_size);

    for (chunk_idx, chunk) in records.chunks(config.batch_size).enumerate() {
        info!(
            batch = chunk_idx + 1,
            total_batches,
            qa_pairs = chunk.len(),
            "submitting batch"
        );

        let outcome = run_batch(judge, &parser, chunk, &config.poll);
        let file_name =
            write_batch_outputs(&run_dir, config.vendor, batch_number, chunk, &outcome)?;

        usage += outcome.usage;
        let valid = outcome.judgments.iter().filter(|j| j.is_valid()).count();
        counts.judged_valid += valid;
        counts.judged_invalid += outcome.judgments.len() - valid;
        counts.batches += 1;
        manifest.batch_files.push(file_name);
        manifest.counts = counts.clone();
        write_json_pretty(&manifest_path, &manifest)?;

        batch_number += 1;
    }

    let summary = token_usage_summary(records.len(), counts.batches, usage);
    write_json_pretty(&run_dir.join(TOKEN_SUMMARY_FILE), &summary)?;

    manifest.status = "completed".to_string();
    manifest.finished_at = now_utc_string();
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote run manifest");

    Ok(manifest)
}

fn unique_run_dir(dataset_dir: &Path, run_id: &str) -> PathBuf {
    let mut candidate = dataset_dir.join(run_id);
    let mut suffix = 2;
    while candidate.exists() {
        candidate = dataset_dir.join(format!("{run_id}_{suffix}"));
        suffix += 1;
    }
    candidate
}

fn write_batch_outputs(
    run_dir: &Path,
    vendor: Vendor,
    batch_number: usize,
    records: &[QaRecord],
    outcome: &BatchOutcome,
) -> Result<String> {
    let rows = records
        .iter()
        .zip(&outcome.judgments)
        .map(|(record, judgment)| BatchOutputRow {
            qa_id: record.id.clone(),
            question: record.question.clone(),
            model_answer: record.candidate_answer.clone(),
            reference_answer: record.reference_answer.clone(),
            judge_rating: judgment.rating.to_string(),
            judge_reason: judgment.reason.clone(),
        })
        .collect::<Vec<_>>();

    let file_name = batch_file_name(batch_number);
    let batch_path = run_dir.join(&file_name);
    write_typed_csv(&batch_path, &rows)?;

    let analysis = BatchTokenAnalysis {
        timestamp: now_utc_string(),
        batch_number,
        num_qa_pairs: records.len(),
        token_summary: outcome.usage.into(),
        detailed_entries: records
            .iter()
            .zip(&outcome.judgments)
            .map(|(record, judgment)| TokenDetailEntry {
                qa_id: record.id.clone(),
                request: TokenDetailRequest {
                    question: record.question.clone(),
                    model_answer: record.candidate_answer.clone(),
                    reference_answer: record.reference_answer.clone(),
                    full_prompt: vendor_judge_prompt(vendor, record),
                },
                response: TokenDetailResponse {
                    rating: judgment.rating,
                    reason: judgment.reason.clone(),
                    full_response_text: judgment.response_text.clone(),
                },
                tokens: judgment.usage.into(),
            })
            .collect(),
    };
    let analysis_path = run_dir
        .join(TOKEN_ANALYSIS_DIR)
        .join(format!("batch_{batch_number:04}_token_details.json"));
    write_json_pretty(&analysis_path, &analysis)?;

    info!(
        path = %batch_path.display(),
        rows = rows.len(),
        job_id = %outcome.job_id.as_deref().unwrap_or("-"),
        state = %outcome.final_state,
        "wrote batch results"
    );
    Ok(file_name)
}

fn token_usage_summary(qa_pairs: usize, batches: usize, usage: TokenUsage) -> TokenUsageSummary {
    let average = |tokens: u64| {
        if qa_pairs == 0 {
            0.0
        } else {
            round2(tokens as f64 / qa_pairs as f64)
        }
    };

    TokenUsageSummary {
        timestamp: now_utc_string(),
        total_qa_pairs: qa_pairs,
        total_batches: batches,
        average_per_qa: TokenAverages {
            input_tokens: average(usage.input_tokens),
            output_tokens: average(usage.output_tokens),
            total_tokens: average(usage.total()),
        },
        token_usage: usage.into(),
    }
}
