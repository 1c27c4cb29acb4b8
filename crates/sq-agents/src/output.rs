//! Parsing of agent output.
//!
//! Agents answer in free text and may embed one JSON object carrying
//! structured results. The first balanced `{...}` block that parses as a JSON
//! object is taken; the rest is treated as human-readable output.

use std::ops::Range;

use serde_json::{Map, Value};

/// Longest summary kept from free text.
const SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDiscovery {
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub summary: String,
    /// Output with the structured block removed.
    pub text: String,
    pub artifacts: Vec<String>,
    pub discoveries: Vec<ParsedDiscovery>,
    pub tokens: Option<u64>,
}

/// Byte ranges of balanced top-level `{...}` candidates, in order. Braces
/// inside JSON strings are ignored. One pass: an unclosed brace keeps the
/// groups nested inside it, and a raw newline ends a string (JSON strings
/// cannot contain one).
pub fn json_object_spans(text: &str) -> Vec<Range<usize>> {
    let mut open = Vec::new();
    let mut closed: Vec<Range<usize>> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in text.as_bytes().iter().enumerate() {
        if in_string {
            match b {
                b'\n' => {
                    in_string = false;
                    escaped = false;
                }
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if !open.is_empty() => in_string = true,
            b'{' => open.push(i),
            b'}' => {
                if let Some(start) = open.pop() {
                    closed.push(start..i + 1);
                }
            }
            _ => {}
        }
    }

    // Groups close inner-first; keep only the outermost.
    closed.sort_by_key(|r| r.start);
    let mut spans: Vec<Range<usize>> = Vec::new();
    for range in closed {
        if spans.last().is_some_and(|last| range.end <= last.end) {
            continue;
        }
        spans.push(range);
    }
    spans
}

/// The first embedded JSON object and its span.
pub fn first_json_object(text: &str) -> Option<(Range<usize>, Map<String, Value>)> {
    json_object_spans(text).into_iter().find_map(|span| {
        match serde_json::from_str::<Value>(&text[span.clone()]) {
            Ok(Value::Object(map)) => Some((span, map)),
            _ => None,
        }
    })
}

pub fn parse_agent_output(stdout: &str) -> ParsedOutput {
    let Some((span, obj)) = first_json_object(stdout) else {
        let text = stdout.trim().to_string();
        return ParsedOutput {
            summary: summary_of(&text),
            text,
            ..Default::default()
        };
    };

    let text = format!("{}{}", &stdout[..span.start], &stdout[span.end..])
        .trim()
        .to_string();
    let summary = obj
        .get("summary")
        .and_then(Value::as_str)
        .map(|s| sq_core::plan::truncate_chars(s, SUMMARY_CHARS))
        .unwrap_or_else(|| summary_of(&text));

    let mut artifacts = Vec::new();
    for key in ["artifacts", "files_modified", "files"] {
        if let Some(list) = obj.get(key).and_then(Value::as_array) {
            for path in list.iter().filter_map(Value::as_str) {
                if !artifacts.iter().any(|a| a == path) {
                    artifacts.push(path.to_string());
                }
            }
        }
    }

    let mut discoveries = Vec::new();
    if let Some(list) = obj.get("discoveries").and_then(Value::as_array) {
        discoveries.extend(list.iter().filter_map(|d| d.as_object()).filter_map(discovery_of));
    } else if let Some(d) = discovery_of(&obj) {
        discoveries.push(d);
    }

    ParsedOutput {
        summary,
        text,
        artifacts,
        discoveries,
        tokens: tokens_of(&obj),
    }
}

fn discovery_of(obj: &Map<String, Value>) -> Option<ParsedDiscovery> {
    let kind = obj.get("kind")?.as_str()?.trim();
    if kind.is_empty() {
        return None;
    }
    let payload = match obj.get("payload") {
        Some(p) => p.clone(),
        None => {
            let mut rest = obj.clone();
            rest.remove("kind");
            Value::Object(rest)
        }
    };
    Some(ParsedDiscovery {
        kind: kind.to_string(),
        payload,
    })
}

fn tokens_of(obj: &Map<String, Value>) -> Option<u64> {
    if let Some(n) = obj.get("tokens").and_then(Value::as_u64) {
        return Some(n);
    }
    let usage = obj.get("usage")?.as_object()?;
    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    (input + output > 0).then_some(input + output)
}

fn summary_of(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    sq_core::plan::truncate_chars(line, SUMMARY_CHARS)
}
