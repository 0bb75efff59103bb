use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

pub fn build_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build http client")
}

pub fn send(request: RequestBuilder, action: &str) -> Result<Response> {
    let response = request
        .send()
        .with_context(|| format!("{action} failed"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        let message = vendor_error_message(&body).unwrap_or(body);
        bail!("{action} failed with HTTP {status}: {}", message.trim());
    }

    Ok(response)
}

// Error bodies from all three vendors nest the human-readable text under `error.message`.
pub fn vendor_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.pointer("/error/error/message"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

pub fn read_body(response: Response, action: &str) -> Result<String> {
    response
        .text()
        .with_context(|| format!("failed to read response body: {action}"))
}

pub fn read_json(response: Response, action: &str) -> Result<Value> {
    let body = read_body(response, action)?;
    serde_json::from_str(&body).with_context(|| format!("invalid json in response: {action}"))
}

pub fn header_value(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

pub fn to_jsonl<T: Serialize>(lines: &[T]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for line in lines {
        serde_json::to_writer(&mut buf, line).context("failed to serialize jsonl line")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

pub fn jsonl_values(body: &str) -> Vec<Value> {
    body.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(line_idx, line)| match serde_json::from_str::<Value>(line) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(line = line_idx + 1, error = %err, "failed to parse result line");
                None
            }
        })
        .collect()
}

pub fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

pub fn u64_at(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}
