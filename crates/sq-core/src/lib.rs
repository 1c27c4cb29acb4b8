pub mod cancel;
pub mod config;
pub mod environment;
pub mod persist;
pub mod plan;
pub mod state_machine;
pub mod status;
pub mod types;
pub mod worktree;
