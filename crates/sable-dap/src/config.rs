use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerConfig {
    /// Sleep between transport polls while suspended, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on idle poll iterations per suspension. When exceeded the
    /// engine resumes the host rather than blocking it forever. `None` polls
    /// until the client answers or disconnects.
    #[serde(default)]
    pub max_poll_iterations: Option<u64>,

    /// Whether expiry of a stack-scoped data watch emits a stop notification
    /// like non-stack watch removal does. Off by default: running out of a
    /// local's scope is expected, losing a heap target is not.
    #[serde(default)]
    pub notify_stack_watch_removal: bool,

    /// Maximum number of weak, unretained object refs kept across lookups
    /// before dead entries are pruned eagerly instead of lazily.
    #[serde(default = "default_max_weak_refs")]
    pub max_weak_refs: usize,
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_max_weak_refs() -> usize {
    10_000
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_iterations: None,
            notify_stack_watch_removal: false,
            max_weak_refs: default_max_weak_refs(),
        }
    }
}

impl DebuggerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
