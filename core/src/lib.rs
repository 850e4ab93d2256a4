//! Async execution engine for a SQL engine CLI (DuckDB-style).
//!
//! Queries run either in named persistent sessions, where each session
//! serializes its executions through a FIFO queue and detects completion
//! by a marker line the engine prints, or in short-lived one-off processes.

mod completion;
pub mod config;
mod control;
pub mod document;
mod engine;
mod error;
mod exec_id;
mod files;
pub mod literal;
mod one_off;
mod protocol;
mod session;
mod sink;
mod status;
pub mod tabular;
pub mod template;
mod tracker;

pub use completion::FinishEvent;
pub use completion::classify;
pub use completion::truncate_lines;
pub use config::DisplaySettings;
pub use config::SqlCellConfig;
pub use control::CancelOutcome;
pub use engine::ExecEngine;
pub use engine::ExecRequest;
pub use error::Result;
pub use error::SqlCellErr;
pub use exec_id::ExecId;
pub use exec_id::SYNC_MARKER;
pub use protocol::OutputFormat;
pub use session::SessionInfo;
pub use sink::CollectingSink;
pub use sink::ExecutionResult;
pub use sink::RenderOptions;
pub use sink::ResultSink;
pub use sink::ResultTarget;
pub use sink::truncation_notice;
pub use status::ExecStatus;
pub use status::ExecutionRecord;
pub use tracker::ExecutionEvent;
pub use tracker::ProgressDisplay;
pub use tracker::StatusTracker;
