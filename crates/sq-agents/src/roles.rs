use std::collections::{BTreeSet, HashMap};

use sq_core::types::{AgentRole, TaskType};

// ---------------------------------------------------------------------------
// RoleProfile
// ---------------------------------------------------------------------------

/// Static description of an agent role: routing keywords, the task types it
/// naturally owns and its prompt preamble.
#[derive(Debug, Clone, Copy)]
pub struct RoleProfile {
    pub role: AgentRole,
    pub specialties: &'static [&'static str],
    pub preferred_types: &'static [TaskType],
    /// Preamble with `{name}` and `{role}` placeholders.
    pub template: &'static str,
}

impl RoleProfile {
    /// Render the preamble, replacing `{key}` placeholders.
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let mut output = self.template.to_string();
        for (key, value) in vars {
            output = output.replace(&format!("{{{key}}}"), value);
        }
        output
    }

    pub fn preamble(&self, name: &str) -> String {
        let mut vars = HashMap::new();
        vars.insert("name", name.to_string());
        vars.insert("role", self.role.to_string());
        self.render(&vars)
    }

    /// Number of specialties mentioned in `text`, plus one when the task type
    /// is one this role owns.
    pub fn keyword_score(&self, text: &str, task_type: TaskType) -> usize {
        let lower = text.to_lowercase();
        let words = word_set(&lower);
        let hits = self
            .specialties
            .iter()
            .filter(|s| {
                if s.contains('-') {
                    lower.contains(*s)
                } else {
                    words.contains(**s)
                }
            })
            .count();
        hits + usize::from(self.preferred_types.contains(&task_type))
    }
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn profile_for(role: AgentRole) -> &'static RoleProfile {
    match role {
        AgentRole::Architect => &ARCHITECT,
        AgentRole::Devops => &DEVOPS,
        AgentRole::Qa => &QA,
        AgentRole::Frontend => &FRONTEND,
        AgentRole::Research => &RESEARCH,
    }
}

// ===========================================================================
// Architect
// ===========================================================================

const ARCHITECT_PROMPT: &str = "\
You are {name}, the {role} agent of a small engineering squad. You own backend design \
and implementation: APIs, data models, services and their tests.
- Prefer small, well-named modules over clever abstractions.
- Keep interfaces stable; note any breaking change you make.
- Record significant design decisions so other agents can follow them.";

pub const ARCHITECT: RoleProfile = RoleProfile {
    role: AgentRole::Architect,
    specialties: &[
        "backend",
        "api",
        "architecture",
        "database",
        "security",
        "refactoring",
        "code-review",
        "microservices",
        "design-patterns",
        "performance",
        "endpoint",
        "server",
        "model",
        "schema",
        "migration",
        "auth",
        "service",
        "controller",
        "repository",
    ],
    preferred_types: &[TaskType::Development, TaskType::Maintenance],
    template: ARCHITECT_PROMPT,
};

// ===========================================================================
// DevOps
// ===========================================================================

const DEVOPS_PROMPT: &str = "\
You are {name}, the {role} agent of a small engineering squad. You own build, deployment \
and runtime configuration.
- Scripts must be idempotent and safe to re-run.
- Never hard-code secrets; read them from the environment.
- Leave the repository buildable after every change.";

pub const DEVOPS: RoleProfile = RoleProfile {
    role: AgentRole::Devops,
    specialties: &[
        "devops",
        "docker",
        "kubernetes",
        "ci-cd",
        "automation",
        "bash",
        "scripting",
        "infrastructure",
        "monitoring",
        "deployment",
        "configuration",
    ],
    preferred_types: &[TaskType::Infrastructure],
    template: DEVOPS_PROMPT,
};

// ===========================================================================
// QA
// ===========================================================================

const QA_PROMPT: &str = "\
You are {name}, the {role} agent of a small engineering squad. You own correctness: \
tests, reviews and vulnerability checks.
- Cover edge cases and failure paths, not only the happy path.
- Report defects with a minimal reproduction.
- Do not weaken an existing test to make it pass.";

pub const QA: RoleProfile = RoleProfile {
    role: AgentRole::Qa,
    specialties: &[
        "testing",
        "qa",
        "security",
        "performance",
        "debugging",
        "monitoring",
        "documentation",
        "code-quality",
        "vulnerability",
        "metrics",
    ],
    preferred_types: &[TaskType::Testing, TaskType::Security],
    template: QA_PROMPT,
};

// ===========================================================================
// Frontend
// ===========================================================================

const FRONTEND_PROMPT: &str = "\
You are {name}, the {role} agent of a small engineering squad. You own user-facing code: \
components, styling and accessibility.
- Keep components small and reusable.
- Every interactive element must be keyboard accessible.
- Match the existing design system before adding new styles.";

pub const FRONTEND: RoleProfile = RoleProfile {
    role: AgentRole::Frontend,
    specialties: &[
        "frontend",
        "ui",
        "ux",
        "react",
        "vue",
        "css",
        "responsive",
        "accessibility",
        "components",
        "design-system",
    ],
    preferred_types: &[],
    template: FRONTEND_PROMPT,
};

// ===========================================================================
// Research
// ===========================================================================

const RESEARCH_PROMPT: &str = "\
You are {name}, the {role} agent of a small engineering squad. You investigate options, \
build prototypes and write documentation.
- Compare alternatives briefly and recommend one.
- Prototypes are throwaway unless stated otherwise.
- Cite the files you read when summarizing findings.";

pub const RESEARCH: RoleProfile = RoleProfile {
    role: AgentRole::Research,
    specialties: &[
        "research",
        "innovation",
        "optimization",
        "prototyping",
        "ai-ml",
        "performance",
        "documentation",
        "architecture",
        "emerging-tech",
        "proof-of-concept",
    ],
    preferred_types: &[
        TaskType::Research,
        TaskType::Documentation,
        TaskType::Optimization,
    ],
    template: RESEARCH_PROMPT,
};
