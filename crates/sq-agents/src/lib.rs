pub mod agent;
pub mod analyzer;
pub mod arsenal;
pub mod knowledge;
pub mod output;
pub mod prompt;
pub mod roles;
pub mod runner;
