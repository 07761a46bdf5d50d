//! Progress streaming for long-running pipeline stages.
//!
//! A stage runs as a tracked subprocess; its stdout/stderr lines are parsed
//! into typed [`ProgressEvent`]s by an ordered parser chain and emitted as a
//! live event stream. The same events also flow through the queued-task
//! transport's state updates.

pub mod event;
pub mod parsers;
pub mod stream;

pub use event::{ProgressEvent, ProgressLevel};
pub use parsers::{
    LineParser, parse_chunking_log, parse_embedding_log, parse_extraction_log, parse_line,
    parse_percent_bar, parse_progress_marker,
};
pub use stream::{CANCELLED_EXIT_CODE, SubprocessCommand, run_with_progress};

/// Callback a stage core invokes for each progress event it produces.
pub type ProgressFn = std::sync::Arc<dyn Fn(ProgressEvent) + Send + Sync>;
