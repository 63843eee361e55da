//! In-process Debug Adapter Protocol server for the Sable VM.
//!
//! The debugger runs on the interpreter's own thread. The host forwards its
//! call/return/line/error hooks into [`DapServer`]; when a breakpoint, data
//! watch, or step decides to stop, the server parks the host in a bounded
//! poll loop and serves client requests until execution is resumed.
//!
//! Stopping at arbitrary instructions works by patching: the engine saves an
//! instruction, overwrites it with the host's trap sentinel, and restores
//! the exact original bytes on resume. Every resume path, including client
//! disconnect, leaves the host byte-identical to its unpatched state.

pub mod breakpoints;
pub mod config;
pub mod dap;
pub mod error;
pub mod frames;
pub mod object_registry;
pub mod server;
pub mod session;
pub mod step;
pub mod transport;
pub mod traps;
pub mod watches;

pub use breakpoints::{BreakpointLocation, BreakpointSpec, BreakpointStore};
pub use config::DebuggerConfig;
pub use error::{DebugError, DebugResult};
pub use frames::FrameIdentityMap;
pub use object_registry::{ObjectRefRegistry, Resolved};
pub use server::DapServer;
pub use session::{Debugger, HookOutcome, StackFrameEntry, StopReason, VariableEntry};
pub use step::{RunState, StepController, StepGranularity, StepKind};
pub use transport::{DapTransport, QueueTransport, TcpTransport};
pub use traps::InstructionTrapTable;
pub use watches::{DataWatchStore, WatchCondition, WatchComparator, WatchEvent, WatchTarget};
