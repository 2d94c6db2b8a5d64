//! Command-line interface for taskmill.
//!
//! Provides the `enqueue`, `empty`, `info` and `worker` commands plus the
//! built-in task handlers selectable via `--handler`.

mod commands;
mod handlers;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
pub use handlers::{handler_for, NoopHandler, ShellHandler};
