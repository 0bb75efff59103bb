use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::http::{build_client, jsonl_values, read_body, read_json, send, str_at, u64_at};
use super::{BatchJudge, JobHandle, JobStatus, JudgeRequest, RawOutcome, RawRecord};
use crate::model::{TokenUsage, Vendor};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const CUSTOM_ID_PREFIX: &str = "req_";

#[derive(Debug, Serialize)]
struct BatchCreateRequest<'a> {
    requests: Vec<BatchRequestEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchRequestEntry<'a> {
    custom_id: String,
    params: MessageParams<'a>,
}

#[derive(Debug, Serialize)]
struct MessageParams<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

pub struct AnthropicBatchJudge {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl AnthropicBatchJudge {
    pub fn new(api_key: String, model: String, max_tokens: u32) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key,
            model,
            max_tokens,
            base_url: ANTHROPIC_API_BASE.to_string(),
        })
    }

    fn get(&self, url: &str) -> RequestBuilder {
        self.client
            .get(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn batch_url(&self, id: &str) -> String {
        format!("{}/messages/batches/{id}", self.base_url)
    }
}

impl BatchJudge for AnthropicBatchJudge {
    fn vendor(&self) -> Vendor {
        Vendor::Claude
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn submit(&self, requests: &[JudgeRequest]) -> Result<JobHandle> {
        let body = BatchCreateRequest {
            requests: requests
                .iter()
                .enumerate()
                .map(|(idx, request)| BatchRequestEntry {
                    custom_id: custom_id(idx),
                    params: MessageParams {
                        model: &self.model,
                        max_tokens: self.max_tokens,
                        messages: vec![Message {
                            role: "user",
                            content: &request.prompt,
                        }],
                    },
                })
                .collect(),
        };

        let response = send(
            self.client
                .post(format!("{}/messages/batches", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body),
            "create message batch",
        )?;
        let created = read_json(response, "create message batch")?;

        let id = str_at(&created, "/id")
            .context("message batch response is missing an id")?
            .to_string();
        info!(
            job_id = %id,
            status = %str_at(&created, "/processing_status").unwrap_or_default(),
            "message batch created"
        );

        Ok(JobHandle {
            id,
            keys: requests.iter().map(|request| request.key.clone()).collect(),
        })
    }

    fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let response = send(self.get(&self.batch_url(&handle.id)), "retrieve message batch")?;
        let batch = read_json(response, "retrieve message batch")?;
        let state = str_at(&batch, "/processing_status").unwrap_or_default();

        Ok(match state {
            "ended" => JobStatus::Succeeded {
                state: state.to_string(),
                output_ref: Some(
                    str_at(&batch, "/results_url")
                        .map(ToOwned::to_owned)
                        .unwrap_or_else(|| format!("{}/results", self.batch_url(&handle.id))),
                ),
            },
            "canceled" | "expired" => JobStatus::Failed {
                state: state.to_string(),
                detail: batch.get("request_counts").map(Value::to_string),
            },
            _ => JobStatus::Running {
                state: state.to_string(),
            },
        })
    }

    fn fetch_results(&self, handle: &JobHandle, output_ref: &str) -> Result<Vec<RawRecord>> {
        let response = send(self.get(output_ref), "download batch results")?;
        let body = read_body(response, "download batch results")?;
        Ok(parse_results(&body, &handle.keys))
    }
}

fn custom_id(idx: usize) -> String {
    format!("{CUSTOM_ID_PREFIX}{idx}")
}

fn key_for_custom_id<'a>(custom_id: &str, keys: &'a [String]) -> Option<&'a String> {
    custom_id
        .strip_prefix(CUSTOM_ID_PREFIX)
        .and_then(|idx| idx.parse::<usize>().ok())
        .and_then(|idx| keys.get(idx))
}

pub(super) fn parse_results(body: &str, keys: &[String]) -> Vec<RawRecord> {
    let mut records = Vec::new();

    for line in jsonl_values(body) {
        let custom_id = str_at(&line, "/custom_id").unwrap_or_default();
        let Some(key) = key_for_custom_id(custom_id, keys) else {
            warn!(custom_id = %custom_id, "result references an unknown request");
            continue;
        };

        let result_type = str_at(&line, "/result/type").unwrap_or_default();
        let (outcome, usage) = match result_type {
            "succeeded" => {
                let usage = TokenUsage {
                    input_tokens: u64_at(&line, "/result/message/usage/input_tokens"),
                    output_tokens: u64_at(&line, "/result/message/usage/output_tokens"),
                };
                let outcome = match line.pointer("/result/message/content/0") {
                    Some(block) => match block.get("text").and_then(Value::as_str) {
                        Some(text) => RawOutcome::Text(text.to_string()),
                        None => RawOutcome::Text(block.to_string()),
                    },
                    None => RawOutcome::Error("Empty response".to_string()),
                };
                (outcome, usage)
            }
            "errored" => {
                let message = str_at(&line, "/result/error/error/message")
                    .or_else(|| str_at(&line, "/result/error/message"))
                    .unwrap_or("Unknown error");
                (
                    RawOutcome::Error(format!("API error: {message}")),
                    TokenUsage::default(),
                )
            }
            other => (
                RawOutcome::Error(format!("Unknown result type: {other}")),
                TokenUsage::default(),
            ),
        };

        records.push(RawRecord {
            key: key.clone(),
            outcome,
            usage,
        });
    }

    records
}
