//! Task prompt assembly.
//!
//! Sections, in order: role preamble, current task, available tools, shared
//! knowledge digest (only when non-empty), context files, standing
//! instructions, working directory.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use sq_core::types::{Discovery, Task};

use crate::agent::AgentRecord;
use crate::arsenal::ToolCategory;

/// Largest context file included verbatim.
pub const MAX_CONTEXT_FILE_BYTES: u64 = 64 * 1024;

/// Longest rendering of a single digest payload.
const DIGEST_PAYLOAD_CHARS: usize = 200;

const STANDING_INSTRUCTIONS: &str = "\
## Instructions
- Be concise; report what you changed and why in a few lines.
- Write or update tests for every behaviour you change.
- Commit incrementally with descriptive messages.
- If you made a decision other agents should know about, end your reply with a JSON \
object such as {\"discoveries\": [{\"kind\": \"decision\", \"payload\": \"...\"}], \
\"artifacts\": [\"path/to/file\"]}.";

pub struct PromptInputs<'a> {
    pub task: &'a Task,
    pub agent: &'a AgentRecord,
    pub tools: &'a BTreeMap<ToolCategory, String>,
    pub digest: &'a [Discovery],
    pub context_files: &'a [PathBuf],
    pub working_dir: Option<&'a Path>,
}

pub fn build_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut out = String::new();
    let task = inputs.task;

    out.push_str(&inputs.agent.preamble());
    out.push_str("\n\n");

    out.push_str("## Current Task\n");
    let _ = writeln!(out, "Title: {}", task.title);
    if !task.description.is_empty() {
        let _ = writeln!(out, "Description: {}", task.description);
    }
    let _ = writeln!(out, "Type: {}", task.task_type);
    let _ = writeln!(out, "Priority: {}", task.priority);
    if !task.tags.is_empty() {
        let _ = writeln!(out, "Tags: {}", task.tags.join(", "));
    }
    out.push('\n');

    if !inputs.tools.is_empty() {
        out.push_str("## Available Tools\n");
        for (category, tool) in inputs.tools {
            let _ = writeln!(out, "- {category}: {tool}");
        }
        out.push('\n');
    }

    if !inputs.digest.is_empty() {
        out.push_str("## Shared Knowledge\n");
        for d in inputs.digest {
            let _ = writeln!(
                out,
                "- [{}] {}: {}",
                d.agent,
                d.kind,
                render_payload(&d.payload)
            );
        }
        out.push('\n');
    }

    for path in inputs.context_files {
        out.push_str(&context_section(path));
        out.push('\n');
    }

    out.push_str(STANDING_INSTRUCTIONS);
    out.push('\n');

    if let Some(dir) = inputs.working_dir.or(task.working_dir.as_deref()) {
        let _ = writeln!(out, "\nWorking directory: {}", dir.display());
    }
    out
}

fn render_payload(payload: &serde_json::Value) -> String {
    let text = match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    sq_core::plan::truncate_chars(&text, DIGEST_PAYLOAD_CHARS)
}

fn context_section(path: &Path) -> String {
    let header = format!("## File: {}\n", path.display());
    let size = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return format!("{header}[missing file: {}]\n", path.display()),
    };
    if size > MAX_CONTEXT_FILE_BYTES {
        return format!("{header}[file omitted: {size} bytes exceeds {MAX_CONTEXT_FILE_BYTES} byte limit]\n");
    }
    match std::fs::read(path) {
        Ok(bytes) => {
            let mut body = String::from_utf8_lossy(&bytes).into_owned();
            if !body.ends_with('\n') {
                body.push('\n');
            }
            format!("{header}```\n{body}```\n")
        }
        Err(e) => format!("{header}[unreadable file: {e}]\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sq_core::types::{AgentRole, TaskPriority, TaskType};

    fn record() -> AgentRecord {
        AgentRecord::for_role(AgentRole::Architect, None)
    }

    fn task() -> Task {
        Task::new("Add login endpoint", TaskType::Development, TaskPriority::High)
            .with_description("POST /login returning a token")
            .with_tags(["api", "auth"])
    }

    #[test]
    fn sections_appear_in_order() {
        let record = record();
        let task = task();
        let mut tools = BTreeMap::new();
        tools.insert(ToolCategory::Search, "rg".to_string());
        let digest = vec![Discovery::new("qa", "decision", json!("use pytest"))];
        let prompt = build_prompt(&PromptInputs {
            task: &task,
            agent: &record,
            tools: &tools,
            digest: &digest,
            context_files: &[],
            working_dir: Some(Path::new("/work")),
        });

        let pos = |needle: &str| prompt.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
        assert!(pos("You are") < pos("## Current Task"));
        assert!(pos("## Current Task") < pos("## Available Tools"));
        assert!(pos("## Available Tools") < pos("## Shared Knowledge"));
        assert!(pos("## Shared Knowledge") < pos("## Instructions"));
        assert!(pos("## Instructions") < pos("Working directory: /work"));
        assert!(prompt.contains("Priority: high"));
        assert!(prompt.contains("- search: rg"));
        assert!(prompt.contains("[qa] decision: use pytest"));
    }

    #[test]
    fn empty_digest_is_omitted() {
        let record = record();
        let task = task();
        let prompt = build_prompt(&PromptInputs {
            task: &task,
            agent: &record,
            tools: &BTreeMap::new(),
            digest: &[],
            context_files: &[],
            working_dir: None,
        });
        assert!(!prompt.contains("## Shared Knowledge"));
        assert!(!prompt.contains("## Available Tools"));
        assert!(!prompt.contains("Working directory"));
    }

    #[test]
    fn context_files_inline_or_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("notes.md");
        std::fs::write(&small, "remember the cache").unwrap();
        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![b'x'; (MAX_CONTEXT_FILE_BYTES + 1) as usize]).unwrap();
        let missing = dir.path().join("nope.txt");

        let record = record();
        let task = task();
        let files = vec![small, big, missing];
        let prompt = build_prompt(&PromptInputs {
            task: &task,
            agent: &record,
            tools: &BTreeMap::new(),
            digest: &[],
            context_files: &files,
            working_dir: None,
        });
        assert!(prompt.contains("remember the cache"));
        assert!(prompt.contains("[file omitted:"));
        assert!(prompt.contains("[missing file:"));
        assert!(!prompt.contains("xxxxxxxx"));
    }

    #[test]
    fn build_is_deterministic() {
        let record = record();
        let task = task();
        let inputs = PromptInputs {
            task: &task,
            agent: &record,
            tools: &BTreeMap::new(),
            digest: &[],
            context_files: &[],
            working_dir: None,
        };
        assert_eq!(build_prompt(&inputs), build_prompt(&inputs));
    }
}
