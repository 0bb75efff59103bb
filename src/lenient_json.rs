use anyhow::{Context, Result, bail};
use regex::Regex;
use serde_json::{Map, Value};

use crate::model::INVALID_RATING;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub rating: i64,
    pub reason: String,
}

// Tolerates a surrounding fence, prose around a flat `{...}` verdict, and
// backslashes that do not start a valid JSON escape.
pub struct VerdictParser {
    rating_first: Regex,
    reason_first: Regex,
}

impl VerdictParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            rating_first: Regex::new(r#"\{[^{}]*"rating"[^{}]*"reason"[^{}]*\}"#)
                .context("failed to compile rating-first verdict regex")?,
            reason_first: Regex::new(r#"\{[^{}]*"reason"[^{}]*"rating"[^{}]*\}"#)
                .context("failed to compile reason-first verdict regex")?,
        })
    }

    pub fn parse(&self, text: &str) -> Verdict {
        match self.try_parse(text) {
            Ok(verdict) => verdict,
            Err(err) => {
                let raw = if text.trim().is_empty() { "EMPTY" } else { text };
                Verdict {
                    rating: INVALID_RATING,
                    reason: format!("Parse error: {err:#}, raw text: {raw}"),
                }
            }
        }
    }

    fn try_parse(&self, text: &str) -> Result<Verdict> {
        let object = self.extract_json_object(text)?;
        verdict_from_object(&object)
    }

    pub fn extract_json_object(&self, text: &str) -> Result<Map<String, Value>> {
        let unfenced = strip_code_fence(text);
        if unfenced.is_empty() {
            bail!("empty response");
        }

        let whole = parse_object(unfenced);
        if whole.is_ok() {
            return whole;
        }

        match self.find_verdict_object(unfenced) {
            Some(candidate) => parse_object(candidate),
            None => whole,
        }
    }

    fn find_verdict_object<'a>(&self, text: &'a str) -> Option<&'a str> {
        [&self.rating_first, &self.reason_first]
            .into_iter()
            .filter_map(|pattern| pattern.find(text))
            .min_by_key(|found| found.start())
            .map(|found| found.as_str())
    }
}

fn parse_object(text: &str) -> Result<Map<String, Value>> {
    let repaired = repair_invalid_escapes(text);
    let value: Value = serde_json::from_str(&repaired).context("invalid json")?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("expected a json object, found {}", json_kind(&other)),
    }
}

fn verdict_from_object(object: &Map<String, Value>) -> Result<Verdict> {
    let rating = match object.get("rating") {
        None | Some(Value::Null) => INVALID_RATING,
        Some(value) => coerce_rating(value)?,
    };
    let reason = match object.get("reason") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(reason)) => reason.clone(),
        Some(other) => other.to_string(),
    };

    Ok(Verdict { rating, reason })
}

pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }

    let body = match trimmed.find('\n') {
        Some(newline) => &trimmed[newline + 1..],
        None => trimmed.trim_start_matches('`'),
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);

    body.trim()
}

pub fn repair_invalid_escapes(text: &str) -> String {
    let mut repaired = String::with_capacity(text.len() + 8);
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            repaired.push(ch);
            continue;
        }

        match chars.peek() {
            Some(&next) if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                repaired.push('\\');
                repaired.push(next);
                chars.next();
            }
            _ => repaired.push_str("\\\\"),
        }
    }

    repaired
}

fn coerce_rating(value: &Value) -> Result<i64> {
    match value {
        Value::Number(number) => {
            if let Some(rating) = number.as_i64() {
                return Ok(rating);
            }
            let float = number.as_f64().context("rating is not a finite number")?;
            integral(float)
        }
        Value::String(raw) => {
            let trimmed = raw.trim();
            if let Ok(rating) = trimmed.parse::<i64>() {
                return Ok(rating);
            }
            let float = trimmed
                .parse::<f64>()
                .with_context(|| format!("rating is not numeric: {raw:?}"))?;
            integral(float)
        }
        other => bail!("rating must be a number, found {}", json_kind(other)),
    }
}

fn integral(value: f64) -> Result<i64> {
    if !value.is_finite() || value.fract() != 0.0 {
        bail!("rating is not an integer: {value}");
    }
    Ok(value as i64)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_verdict(text: &str) -> Verdict {
        VerdictParser::new().expect("verdict parser").parse(text)
    }

    #[test]
    fn parses_fenced_json_block() {
        let verdict = parse_verdict("```json\n{\"rating\": 3, \"reason\": \"ok\"}\n```");
        assert_eq!(
            verdict,
            Verdict {
                rating: 3,
                reason: "ok".to_string()
            }
        );
    }

    #[test]
    fn plain_text_is_a_parse_error() {
        let verdict = parse_verdict("not json at all");
        assert_eq!(verdict.rating, -1);
        assert!(verdict.reason.starts_with("Parse error"));
        assert!(verdict.reason.ends_with("raw text: not json at all"));
    }

    #[test]
    fn empty_text_reports_empty_raw_text() {
        let verdict = parse_verdict("   ");
        assert_eq!(verdict.rating, -1);
        assert!(verdict.reason.ends_with("raw text: EMPTY"));
    }

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let verdict = parse_verdict(
            "Sure! Here is my assessment:\n{\"rating\": 4, \"reason\": \"same meaning\"}\nHope this helps.",
        );
        assert_eq!(verdict.rating, 4);
        assert_eq!(verdict.reason, "same meaning");
    }

    #[test]
    fn extracts_object_with_reason_before_rating() {
        let verdict = parse_verdict("Result: {\"reason\": \"partial\", \"rating\": 3} done");
        assert_eq!(verdict.rating, 3);
        assert_eq!(verdict.reason, "partial");
    }

    #[test]
    fn repairs_latex_backslashes() {
        let verdict =
            parse_verdict(r#"{"rating": 2, "reason": "student wrote \sqrt{2} \le 3"}"#);
        assert_eq!(verdict.rating, 2);
        assert_eq!(verdict.reason, r"student wrote \sqrt{2} \le 3");
    }

    #[test]
    fn closing_brace_inside_reason_keeps_whole_object() {
        let verdict = parse_verdict(
            r#"{"rating": 3, "reason": "student wrote x} but the value is right"}"#,
        );
        assert_eq!(verdict.rating, 3);
        assert_eq!(verdict.reason, "student wrote x} but the value is right");
    }

    #[test]
    fn prose_around_object_with_brace_in_reason_still_extracts_flat_match() {
        let verdict = parse_verdict("Verdict: {\"rating\": 1, \"reason\": \"wrong\"} (see {notes})");
        assert_eq!(verdict.rating, 1);
        assert_eq!(verdict.reason, "wrong");
    }

    #[test]
    fn repair_keeps_valid_escape_pairs() {
        assert_eq!(repair_invalid_escapes(r#"a\"b\\c\nd"#), r#"a\"b\\c\nd"#);
        assert_eq!(repair_invalid_escapes(r"\x"), r"\\x");
        assert_eq!(repair_invalid_escapes(r"\\x"), r"\\x");
        assert_eq!(repair_invalid_escapes("end\\"), "end\\\\");
    }

    #[test]
    fn coerces_string_and_float_ratings() {
        assert_eq!(parse_verdict(r#"{"rating": "4", "reason": "r"}"#).rating, 4);
        assert_eq!(parse_verdict(r#"{"rating": 2.0, "reason": "r"}"#).rating, 2);
        assert_eq!(parse_verdict(r#"{"rating": 2.5, "reason": "r"}"#).rating, -1);
    }

    #[test]
    fn out_of_range_rating_is_returned_unchanged() {
        let verdict = parse_verdict(r#"{"rating": 7, "reason": "odd"}"#);
        assert_eq!(verdict.rating, 7);
    }

    #[test]
    fn missing_rating_key_yields_sentinel() {
        let verdict = parse_verdict(r#"{"score": 3, "reason": "wrong key"}"#);
        assert_eq!(verdict.rating, -1);
        assert_eq!(verdict.reason, "wrong key");
    }

    #[test]
    fn non_object_json_is_rejected() {
        let verdict = parse_verdict("[3, \"ok\"]");
        assert_eq!(verdict.rating, -1);
        assert!(verdict.reason.contains("expected a json object"));
    }

    #[test]
    fn strip_code_fence_handles_bare_and_unterminated_fences() {
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("```json\n{}"), "{}");
        assert_eq!(strip_code_fence("  {}  "), "{}");
    }
}
