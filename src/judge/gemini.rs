use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::http::{
    build_client, header_value, jsonl_values, read_body, read_json, send, str_at, to_jsonl, u64_at,
};
use super::{BatchJudge, JobHandle, JobStatus, JudgeRequest, RawOutcome, RawRecord};
use crate::model::{TokenUsage, Vendor};

const GEMINI_HOST: &str = "https://generativelanguage.googleapis.com";
const GEMINI_API_VERSION: &str = "v1beta";

pub struct GeminiBatchJudge {
    client: Client,
    api_key: String,
    model: String,
    host: String,
}

impl GeminiBatchJudge {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            api_key,
            model,
            host: GEMINI_HOST.to_string(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{GEMINI_API_VERSION}/{path}", self.host)
    }

    fn upload_jsonl(&self, payload: &[u8], display_name: &str) -> Result<String> {
        let start = send(
            self.client
                .post(format!("{}/upload/{GEMINI_API_VERSION}/files", self.host))
                .header("x-goog-api-key", &self.api_key)
                .header("X-Goog-Upload-Protocol", "resumable")
                .header("X-Goog-Upload-Command", "start")
                .header("X-Goog-Upload-Header-Content-Length", payload.len().to_string())
                .header("X-Goog-Upload-Header-Content-Type", "application/json")
                .json(&json!({ "file": { "display_name": display_name } })),
            "start batch file upload",
        )?;

        let upload_url = header_value(&start, "x-goog-upload-url")
            .context("upload start response is missing x-goog-upload-url")?;

        let uploaded = send(
            self.client
                .post(upload_url)
                .header("X-Goog-Upload-Offset", "0")
                .header("X-Goog-Upload-Command", "upload, finalize")
                .body(payload.to_vec()),
            "upload batch file",
        )?;
        let uploaded = read_json(uploaded, "upload batch file")?;

        str_at(&uploaded, "/file/name")
            .map(ToOwned::to_owned)
            .context("file name not found in upload response")
    }
}

impl BatchJudge for GeminiBatchJudge {
    fn vendor(&self) -> Vendor {
        Vendor::Gemini
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn submit(&self, requests: &[JudgeRequest]) -> Result<JobHandle> {
        let lines = requests
            .iter()
            .map(|request| {
                json!({
                    "key": request.key,
                    "request": {
                        "contents": [{ "parts": [{ "text": request.prompt }] }]
                    }
                })
            })
            .collect::<Vec<_>>();
        let payload = to_jsonl(&lines)?;
        let display_name = format!("judge-{}", Utc::now().timestamp());

        let file_name = self.upload_jsonl(&payload, &display_name)?;
        info!(file = %file_name, bytes = payload.len(), "batch file uploaded");

        let response = send(
            self.client
                .post(self.api_url(&format!("{}:batchGenerateContent", self.model)))
                .header("x-goog-api-key", &self.api_key)
                .json(&json!({
                    "batch": {
                        "display_name": display_name,
                        "input_config": { "file_name": file_name }
                    }
                })),
            "create batch job",
        )?;
        let created = read_json(response, "create batch job")?;

        let id = str_at(&created, "/name")
            .context("batch job response is missing a name")?
            .to_string();
        info!(
            job_id = %id,
            status = %str_at(&created, "/metadata/state").unwrap_or_default(),
            "batch job created"
        );

        Ok(JobHandle {
            id,
            keys: requests.iter().map(|request| request.key.clone()).collect(),
        })
    }

    fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let response = send(
            self.client
                .get(self.api_url(&handle.id))
                .header("x-goog-api-key", &self.api_key),
            "get batch job",
        )?;
        let job = read_json(response, "get batch job")?;
        Ok(job_status(&job))
    }

    fn fetch_results(&self, _handle: &JobHandle, output_ref: &str) -> Result<Vec<RawRecord>> {
        let response = send(
            self.client
                .get(format!(
                    "{}/download/{GEMINI_API_VERSION}/{output_ref}:download",
                    self.host
                ))
                .query(&[("alt", "media")])
                .header("x-goog-api-key", &self.api_key),
            "download batch results",
        )?;
        let body = read_body(response, "download batch results")?;
        Ok(parse_results(&body))
    }
}

fn job_status(job: &Value) -> JobStatus {
    let state = str_at(job, "/metadata/state").unwrap_or_default();
    match state {
        "BATCH_STATE_SUCCEEDED" => JobStatus::Succeeded {
            state: state.to_string(),
            output_ref: str_at(job, "/response/responsesFile")
                .or_else(|| str_at(job, "/metadata/output/responsesFile"))
                .map(ToOwned::to_owned),
        },
        "BATCH_STATE_FAILED" | "BATCH_STATE_CANCELLED" | "BATCH_STATE_EXPIRED" => {
            JobStatus::Failed {
                state: state.to_string(),
                detail: job.get("error").map(Value::to_string),
            }
        }
        _ => JobStatus::Running {
            state: state.to_string(),
        },
    }
}

pub(super) fn parse_results(body: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();

    for line in jsonl_values(body) {
        let key = str_at(&line, "/key").unwrap_or_default().to_string();

        let (outcome, usage) = if let Some(response) = line.get("response") {
            let usage = TokenUsage {
                input_tokens: u64_at(response, "/usageMetadata/promptTokenCount"),
                output_tokens: u64_at(response, "/usageMetadata/candidatesTokenCount"),
            };
            (candidate_outcome(response), usage)
        } else if let Some(error) = line.get("error") {
            let message = str_at(error, "/message").unwrap_or("Unknown error");
            (
                RawOutcome::Error(format!("API error: {message}")),
                TokenUsage::default(),
            )
        } else {
            warn!(key = %key, "result line has neither response nor error");
            continue;
        };

        records.push(RawRecord {
            key,
            outcome,
            usage,
        });
    }

    records
}

fn candidate_outcome(response: &Value) -> RawOutcome {
    let Some(candidate) = response.pointer("/candidates/0") else {
        return RawOutcome::Error("No candidates in response".to_string());
    };
    let Some(parts) = candidate.pointer("/content/parts") else {
        return RawOutcome::Error("No content in candidate".to_string());
    };
    match str_at(parts, "/0/text") {
        Some(text) => RawOutcome::Text(text.trim().to_string()),
        None => RawOutcome::Error("No text in parts".to_string()),
    }
}
