use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{BatchJudge, JobHandle, JobStatus, JudgeRequest, RawOutcome, RawRecord};
use crate::config::PollSettings;
use crate::lenient_json::VerdictParser;
use crate::model::{Judgment, QaRecord, TokenUsage, Vendor};
use crate::prompt::vendor_judge_prompt;

const STATUS_LOG_EVERY: u64 = 2;

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub judgments: Vec<Judgment>,
    pub usage: TokenUsage,
    pub job_id: Option<String>,
    pub final_state: String,
}

enum WaitResult {
    Ready(String, Option<String>),
    Failed(String, Option<String>),
    TimedOut(Duration),
}

pub fn build_requests(vendor: Vendor, records: &[QaRecord]) -> Vec<JudgeRequest> {
    records
        .iter()
        .map(|record| JudgeRequest {
            key: record.id.clone(),
            prompt: vendor_judge_prompt(vendor, record),
        })
        .collect()
}

pub fn run_batch(
    judge: &dyn BatchJudge,
    parser: &VerdictParser,
    records: &[QaRecord],
    poll: &PollSettings,
) -> BatchOutcome {
    let requests = build_requests(judge.vendor(), records);

    let handle = match judge.submit(&requests) {
        Ok(handle) => handle,
        Err(err) => {
            warn!(vendor = %judge.vendor(), error = %format!("{err:#}"), "batch submission failed");
            return failed_outcome(
                records,
                None,
                "submit_failed",
                &format!("Batch submission failed: {err:#}"),
            );
        }
    };
    info!(
        vendor = %judge.vendor(),
        job_id = %handle.id,
        requests = requests.len(),
        "batch submitted"
    );

    let (state, output_ref) = match wait_for_completion(judge, &handle, poll) {
        WaitResult::Ready(state, output_ref) => (state, output_ref),
        WaitResult::Failed(state, detail) => {
            warn!(
                job_id = %handle.id,
                state = %state,
                detail = %detail.unwrap_or_default(),
                "batch ended without results"
            );
            return failed_outcome(
                records,
                Some(handle.id),
                &state,
                &format!("Batch {state}"),
            );
        }
        WaitResult::TimedOut(waited) => {
            warn!(job_id = %handle.id, waited_secs = waited.as_secs(), "batch timed out");
            return failed_outcome(
                records,
                Some(handle.id),
                "timed_out",
                &format!("Batch timed out after {}s", waited.as_secs()),
            );
        }
    };

    let Some(output_ref) = output_ref else {
        warn!(job_id = %handle.id, state = %state, "batch succeeded without an output reference");
        return failed_outcome(records, Some(handle.id), &state, "No batch results");
    };

    let raw = match judge.fetch_results(&handle, &output_ref) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(job_id = %handle.id, error = %format!("{err:#}"), "failed to download results");
            return failed_outcome(
                records,
                Some(handle.id),
                &state,
                &format!("Download failed: {err:#}"),
            );
        }
    };

    let (judgments, usage) = assemble_judgments(records, raw, parser);
    let valid = judgments.iter().filter(|judgment| judgment.is_valid()).count();
    info!(
        job_id = %handle.id,
        valid,
        invalid = judgments.len() - valid,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "batch results processed"
    );

    BatchOutcome {
        judgments,
        usage,
        job_id: Some(handle.id),
        final_state: state,
    }
}

fn wait_for_completion(
    judge: &dyn BatchJudge,
    handle: &JobHandle,
    poll: &PollSettings,
) -> WaitResult {
    let started = Instant::now();
    let mut polls: u64 = 0;

    loop {
        if let Some(max_wait) = poll.max_wait {
            let waited = started.elapsed();
            if waited >= max_wait {
                return WaitResult::TimedOut(max_wait.max(waited));
            }
        }

        thread::sleep(poll.interval);
        polls += 1;

        match judge.poll(handle) {
            Ok(JobStatus::Running { state }) => {
                if polls % STATUS_LOG_EVERY == 0 {
                    info!(
                        job_id = %handle.id,
                        state = %state,
                        elapsed_secs = started.elapsed().as_secs(),
                        "batch still running"
                    );
                }
            }
            Ok(JobStatus::Succeeded { state, output_ref }) => {
                info!(job_id = %handle.id, state = %state, polls, "batch completed");
                return WaitResult::Ready(state, output_ref);
            }
            Ok(JobStatus::Failed { state, detail }) => return WaitResult::Failed(state, detail),
            Err(err) => {
                warn!(job_id = %handle.id, error = %format!("{err:#}"), "status check failed, retrying");
            }
        }
    }
}

fn failed_outcome(
    records: &[QaRecord],
    job_id: Option<String>,
    state: &str,
    reason: &str,
) -> BatchOutcome {
    BatchOutcome {
        judgments: records
            .iter()
            .map(|record| Judgment::invalid(&record.id, reason))
            .collect(),
        usage: TokenUsage::default(),
        job_id,
        final_state: state.to_string(),
    }
}

// Unrequested keys are dropped; requested ids without a record get -1 "Missing response".
pub fn assemble_judgments(
    records: &[QaRecord],
    raw: Vec<RawRecord>,
    parser: &VerdictParser,
) -> (Vec<Judgment>, TokenUsage) {
    let mut by_key: HashMap<String, RawRecord> = HashMap::with_capacity(raw.len());
    for record in raw {
        by_key.entry(record.key.clone()).or_insert(record);
    }

    let mut usage = TokenUsage::default();
    let judgments = records
        .iter()
        .map(|record| match by_key.remove(&record.id) {
            Some(raw) => {
                usage += raw.usage;
                judgment_from_raw(&record.id, raw, parser)
            }
            None => Judgment::invalid(&record.id, "Missing response"),
        })
        .collect();

    if !by_key.is_empty() {
        warn!(unexpected = by_key.len(), "ignoring results for ids that were not requested");
    }

    (judgments, usage)
}

fn judgment_from_raw(qa_id: &str, raw: RawRecord, parser: &VerdictParser) -> Judgment {
    match raw.outcome {
        RawOutcome::Text(text) => {
            let verdict = parser.parse(&text);
            Judgment {
                qa_id: qa_id.to_string(),
                rating: verdict.rating,
                reason: verdict.reason,
                response_text: Some(text),
                usage: raw.usage,
            }
        }
        RawOutcome::Error(reason) => Judgment {
            usage: raw.usage,
            ..Judgment::invalid(qa_id, reason)
        },
    }
}
