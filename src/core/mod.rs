pub mod error;
pub mod process_tree;
pub mod pty_process;

pub use error::{AgentError, FatalError, SpawnError};
pub use process_tree::Monitor;
pub use pty_process::PtyProcess;
