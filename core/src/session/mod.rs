//! Persistent engine sessions: one process, one FIFO queue and one output
//! scanner per session name, all owned by a single actor task.

mod actor;
mod line_buffer;
pub(crate) mod process;
mod queue;
mod registry;
mod scanner;

pub(crate) use actor::NOT_STARTED_EXITED;
pub(crate) use actor::SessionCommand;
pub use registry::SessionInfo;
pub(crate) use registry::RegistrySettings;
pub(crate) use registry::SessionRegistry;
