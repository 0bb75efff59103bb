use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use serde_json::{Value, json};
use tracing::info;

use super::http::{build_client, jsonl_values, read_body, read_json, send, str_at, to_jsonl, u64_at};
use super::{BatchJudge, JobHandle, JobStatus, JudgeRequest, RawOutcome, RawRecord};
use crate::model::{TokenUsage, Vendor};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const CHAT_COMPLETIONS_ENDPOINT: &str = "/v1/chat/completions";
const COMPLETION_WINDOW: &str = "24h";
const BATCH_FILE_PURPOSE: &str = "batch";
const JSONL_MIME: &str = "application/jsonl";

pub struct OpenAiBatchJudge {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiBatchJudge {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key,
            model,
            base_url: OPENAI_API_BASE.to_string(),
        })
    }

    fn authorization(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn upload_jsonl(&self, payload: Vec<u8>, file_name: String) -> Result<String> {
        let file = Part::bytes(payload)
            .file_name(file_name)
            .mime_str(JSONL_MIME)
            .context("invalid jsonl mime type")?;
        let form = Form::new().text("purpose", BATCH_FILE_PURPOSE).part("file", file);

        let response = send(
            self.client
                .post(format!("{}/files", self.base_url))
                .header("Authorization", self.authorization())
                .multipart(form),
            "upload batch file",
        )?;
        let uploaded = read_json(response, "upload batch file")?;

        str_at(&uploaded, "/id")
            .map(ToOwned::to_owned)
            .context("file id not found in upload response")
    }
}

impl BatchJudge for OpenAiBatchJudge {
    fn vendor(&self) -> Vendor {
        Vendor::Openai
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn submit(&self, requests: &[JudgeRequest]) -> Result<JobHandle> {
        let lines = requests
            .iter()
            .map(|request| {
                json!({
                    "custom_id": request.key,
                    "method": "POST",
                    "url": CHAT_COMPLETIONS_ENDPOINT,
                    "body": {
                        "model": self.model,
                        "messages": [{ "role": "user", "content": request.prompt }],
                        "response_format": { "type": "json_object" }
                    }
                })
            })
            .collect::<Vec<_>>();
        let payload = to_jsonl(&lines)?;
        let bytes = payload.len();
        let file_name = format!("judge_batch_{}.jsonl", Utc::now().timestamp());

        let file_id = self.upload_jsonl(payload, file_name)?;
        info!(file = %file_id, bytes, "batch file uploaded");

        let response = send(
            self.client
                .post(format!("{}/batches", self.base_url))
                .header("Authorization", self.authorization())
                .json(&json!({
                    "input_file_id": file_id,
                    "endpoint": CHAT_COMPLETIONS_ENDPOINT,
                    "completion_window": COMPLETION_WINDOW
                })),
            "create batch",
        )?;
        let created = read_json(response, "create batch")?;

        let id = str_at(&created, "/id")
            .context("batch response is missing an id")?
            .to_string();
        info!(
            job_id = %id,
            status = %str_at(&created, "/status").unwrap_or_default(),
            "batch created"
        );

        Ok(JobHandle {
            id,
            keys: requests.iter().map(|request| request.key.clone()).collect(),
        })
    }

    fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let response = send(
            self.client
                .get(format!("{}/batches/{}", self.base_url, handle.id))
                .header("Authorization", self.authorization()),
            "retrieve batch",
        )?;
        let batch = read_json(response, "retrieve batch")?;
        Ok(batch_status(&batch))
    }

    fn fetch_results(&self, _handle: &JobHandle, output_ref: &str) -> Result<Vec<RawRecord>> {
        let response = send(
            self.client
                .get(format!("{}/files/{output_ref}/content", self.base_url))
                .header("Authorization", self.authorization()),
            "download batch results",
        )?;
        let body = read_body(response, "download batch results")?;
        Ok(parse_results(&body))
    }
}

fn batch_status(batch: &Value) -> JobStatus {
    let state = str_at(batch, "/status").unwrap_or_default();
    match state {
        "completed" => JobStatus::Succeeded {
            state: state.to_string(),
            output_ref: str_at(batch, "/output_file_id").map(ToOwned::to_owned),
        },
        "failed" | "expired" | "cancelling" | "cancelled" => JobStatus::Failed {
            state: state.to_string(),
            detail: batch
                .get("errors")
                .filter(|errors| !errors.is_null())
                .map(Value::to_string),
        },
        _ => JobStatus::Running {
            state: state.to_string(),
        },
    }
}

pub(super) fn parse_results(body: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();

    for line in jsonl_values(body) {
        let key = str_at(&line, "/custom_id").unwrap_or_default().to_string();

        if let Some(error) = line.get("error").filter(|error| !error.is_null()) {
            let message = str_at(error, "/message").unwrap_or("Unknown error");
            records.push(RawRecord {
                key,
                outcome: RawOutcome::Error(format!("API error: {message}")),
                usage: TokenUsage::default(),
            });
            continue;
        }

        let status_code = line
            .pointer("/response/status_code")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let body = line.pointer("/response/body").cloned().unwrap_or(Value::Null);

        let (outcome, usage) = if status_code == 200 {
            let usage = TokenUsage {
                input_tokens: u64_at(&body, "/usage/prompt_tokens"),
                output_tokens: u64_at(&body, "/usage/completion_tokens"),
            };
            let outcome = match body.pointer("/choices/0") {
                Some(choice) => RawOutcome::Text(
                    str_at(choice, "/message/content")
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                ),
                None => RawOutcome::Error("No choices in response".to_string()),
            };
            (outcome, usage)
        } else {
            let message = str_at(&body, "/error/message")
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| format!("Status {status_code}"));
            (
                RawOutcome::Error(format!("API error: {message}")),
                TokenUsage::default(),
            )
        };

        records.push(RawRecord {
            key,
            outcome,
            usage,
        });
    }

    records
}
