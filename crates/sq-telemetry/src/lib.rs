//! Logging and span helpers shared by the squadron binaries and engine.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   written to stderr so stdout stays free for command output.
//! - **Spans**: run-scoped spans carrying a generated run id, so every line a
//!   run emits can be correlated.

pub mod logging;
pub mod spans;
