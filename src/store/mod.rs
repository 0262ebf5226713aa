//! Persistence facades for job outcomes and captured output.
//!
//! - [`CompletionStore`]: last-known outcome per job name (upsert, last write wins)
//! - [`ConsoleStore`]: append-only log of output lines, queryable by job name
//! - [`ConsoleSink`]: a [`ConsoleStore`] plus a broadcast channel for live viewers
//!
//! The in-memory stores back tests and single-run CLI usage;
//! [`JsonFileCompletionStore`] keeps completion records across restarts.

pub mod completion;
pub mod console;

pub use completion::{
    CompletionRecord, CompletionStore, JsonFileCompletionStore, MemoryCompletionStore,
};
pub use console::{ColorHint, ConsoleLine, ConsoleSink, ConsoleStore, MemoryConsoleStore};
