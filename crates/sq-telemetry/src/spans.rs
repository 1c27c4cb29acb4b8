use tracing::{info_span, Span};
use uuid::Uuid;

/// Short random id identifying one engine run (16 hex chars).
pub fn generate_run_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Span wrapping a whole run. Instrument the run future with it.
pub fn run_span(run_id: &str, instance_id: &str, mode: &str) -> Span {
    info_span!("run", run_id = %run_id, instance = %instance_id, mode = %mode)
}

/// Span wrapping one task execution inside a run.
pub fn task_span(task_id: &str, agent: &str) -> Span {
    info_span!("task", task_id = %task_id, agent = %agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_hex_and_distinct() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
