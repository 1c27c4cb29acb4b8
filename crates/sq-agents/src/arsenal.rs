//! Command-line tool discovery.
//!
//! Each capability category has an ordered candidate list, best first. The
//! arsenal is probed once at startup and read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sq_core::types::Task;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// ToolCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Search,
    Find,
    View,
    Ls,
    Diff,
    Sed,
    Ps,
    Top,
    Http,
    Json,
    Yaml,
    Git,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 12] = [
        ToolCategory::Search,
        ToolCategory::Find,
        ToolCategory::View,
        ToolCategory::Ls,
        ToolCategory::Diff,
        ToolCategory::Sed,
        ToolCategory::Ps,
        ToolCategory::Top,
        ToolCategory::Http,
        ToolCategory::Json,
        ToolCategory::Yaml,
        ToolCategory::Git,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Search => "search",
            ToolCategory::Find => "find",
            ToolCategory::View => "view",
            ToolCategory::Ls => "ls",
            ToolCategory::Diff => "diff",
            ToolCategory::Sed => "sed",
            ToolCategory::Ps => "ps",
            ToolCategory::Top => "top",
            ToolCategory::Http => "http",
            ToolCategory::Json => "json",
            ToolCategory::Yaml => "yaml",
            ToolCategory::Git => "git",
        }
    }

    /// Candidate binaries, preferred first.
    pub fn candidates(&self) -> &'static [&'static str] {
        match self {
            ToolCategory::Search => &["rg", "ag", "ack", "grep"],
            ToolCategory::Find => &["fd", "fdfind", "find"],
            ToolCategory::View => &["bat", "batcat", "cat"],
            ToolCategory::Ls => &["eza", "exa", "ls"],
            ToolCategory::Diff => &["delta", "diff-so-fancy", "diff"],
            ToolCategory::Sed => &["sd", "sed"],
            ToolCategory::Ps => &["procs", "ps"],
            ToolCategory::Top => &["btop", "htop", "top"],
            ToolCategory::Http => &["http", "httpie", "curl", "wget"],
            ToolCategory::Json => &["jq", "jaq"],
            ToolCategory::Yaml => &["yq"],
            ToolCategory::Git => &["gh", "git"],
        }
    }

    /// Task keywords that make this category relevant. `Ls` is always
    /// relevant and has none.
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            ToolCategory::Search => &["buscar", "search", "find", "grep"],
            ToolCategory::Find => &["archivo", "file", "encontrar"],
            ToolCategory::View => &["ver", "view", "mostrar", "display"],
            ToolCategory::Diff => &["diff", "diferencia", "comparar", "compare"],
            ToolCategory::Sed => &["reemplazar", "replace", "cambiar"],
            ToolCategory::Ps => &["proceso", "process", "monitor"],
            ToolCategory::Json => &["json"],
            ToolCategory::Yaml => &["yaml", "yml"],
            ToolCategory::Http => &["http", "api", "request"],
            ToolCategory::Ls | ToolCategory::Top | ToolCategory::Git => &[],
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Package names for the preferred tool where it differs from the binary.
fn package_for(binary: &str) -> &str {
    match binary {
        "rg" => "ripgrep",
        "fd" => "fd-find",
        "delta" => "git-delta",
        "http" => "httpie",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Arsenal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStatus {
    pub category: ToolCategory,
    pub preferred: &'static str,
    pub selected: Option<String>,
}

impl CategoryStatus {
    /// A tool was found but it is not the preferred one.
    pub fn is_fallback(&self) -> bool {
        matches!(&self.selected, Some(s) if s != self.preferred)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Arsenal {
    selected: BTreeMap<ToolCategory, String>,
}

impl Arsenal {
    /// Probe the real `PATH`.
    pub fn probe() -> Self {
        let arsenal = Self::probe_with(on_path);
        info!(
            found = arsenal.selected.len(),
            categories = ToolCategory::ALL.len(),
            "tool arsenal probed"
        );
        arsenal
    }

    /// Probe with an injected existence check.
    pub fn probe_with<F>(exists: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        let mut selected = BTreeMap::new();
        for category in ToolCategory::ALL {
            if let Some(tool) = category.candidates().iter().find(|c| exists(c)) {
                debug!(category = %category, tool, "selected tool");
                selected.insert(category, (*tool).to_string());
            }
        }
        Self { selected }
    }

    /// An arsenal with nothing available.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn tool_for(&self, category: ToolCategory) -> Option<&str> {
        self.selected.get(&category).map(String::as_str)
    }

    pub fn tools(&self) -> &BTreeMap<ToolCategory, String> {
        &self.selected
    }

    /// Tools relevant to a task, chosen by keywords in its title and
    /// description. `ls` is always included when available.
    pub fn tools_for_task(&self, task: &Task) -> BTreeMap<ToolCategory, String> {
        let text = task.search_text();
        self.selected
            .iter()
            .filter(|(category, _)| {
                **category == ToolCategory::Ls
                    || category.keywords().iter().any(|k| text.contains(k))
            })
            .map(|(c, t)| (*c, t.clone()))
            .collect()
    }

    pub fn status_report(&self) -> Vec<CategoryStatus> {
        ToolCategory::ALL
            .into_iter()
            .map(|category| CategoryStatus {
                category,
                preferred: category.candidates()[0],
                selected: self.selected.get(&category).cloned(),
            })
            .collect()
    }

    /// One line per category whose preferred tool is missing.
    pub fn install_suggestions(&self) -> Vec<String> {
        self.status_report()
            .into_iter()
            .filter(|s| s.selected.as_deref() != Some(s.preferred))
            .map(|s| {
                let current = match &s.selected {
                    Some(tool) => format!("currently using {tool}"),
                    None => "nothing available".to_string(),
                };
                format!(
                    "{}: install {} for the best experience ({current})",
                    s.category,
                    package_for(s.preferred)
                )
            })
            .collect()
    }
}

/// Whether an executable called `name` resolves on `PATH`.
pub fn on_path(name: &str) -> bool {
    which::which(name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sq_core::types::{TaskPriority, TaskType};

    fn arsenal_of(tools: &[&str]) -> Arsenal {
        let tools: Vec<String> = tools.iter().map(|s| s.to_string()).collect();
        Arsenal::probe_with(|name| tools.iter().any(|t| t == name))
    }

    #[test]
    fn on_path_finds_a_shell_and_rejects_nonsense() {
        assert!(on_path("sh"));
        assert!(!on_path("sq-no-such-tool-4f1c"));
    }

    #[test]
    fn prefers_first_candidate() {
        let arsenal = arsenal_of(&["grep", "rg", "cat", "ls"]);
        assert_eq!(arsenal.tool_for(ToolCategory::Search), Some("rg"));
        assert_eq!(arsenal.tool_for(ToolCategory::View), Some("cat"));
        assert_eq!(arsenal.tool_for(ToolCategory::Yaml), None);
    }

    #[test]
    fn task_keywords_select_categories() {
        let arsenal = arsenal_of(&["rg", "ls", "jq", "curl", "sed"]);
        let task = Task::new("Search the JSON config", TaskType::Development, TaskPriority::Medium);
        let tools = arsenal.tools_for_task(&task);
        assert_eq!(
            tools.keys().copied().collect::<Vec<_>>(),
            vec![ToolCategory::Search, ToolCategory::Ls, ToolCategory::Json]
        );
    }

    #[test]
    fn ls_always_included() {
        let arsenal = arsenal_of(&["eza"]);
        let task = Task::new("Write docs", TaskType::Documentation, TaskPriority::Low);
        let tools = arsenal.tools_for_task(&task);
        assert_eq!(tools.get(&ToolCategory::Ls).map(String::as_str), Some("eza"));
    }

    #[test]
    fn suggestions_name_missing_preferred_tools() {
        let arsenal = arsenal_of(&["grep"]);
        let suggestions = arsenal.install_suggestions();
        assert!(suggestions
            .iter()
            .any(|s| s.starts_with("search: install ripgrep") && s.contains("currently using grep")));
        assert!(suggestions.iter().any(|s| s.contains("nothing available")));
        let report = arsenal.status_report();
        assert!(report[0].is_fallback());
    }
}
