//! Run-state machine deciding when a hook should suspend the program.
//!
//! The controller is deliberately ignorant of trap arming: the session arms
//! traps when a step begins and tells the controller, per hook, whether the
//! hook landed on an armed instruction. Step requests snapshot the call
//! depth at their origin so over/out can compare against it later.

use sable_host::{HookEvent, ThreadId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepGranularity {
    Statement,
    Instruction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Over,
    In,
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// A pause was requested; stop at the very next hook.
    SuspendPending,
    Suspended,
    Step {
        kind: StepKind,
        granularity: StepGranularity,
        thread: ThreadId,
        /// Call depth of `thread` when the step was issued.
        origin_depth: usize,
    },
}

pub struct StepController {
    state: RunState,
}

impl Default for StepController {
    fn default() -> Self {
        Self::new()
    }
}

impl StepController {
    pub fn new() -> Self {
        Self {
            state: RunState::Running,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.state == RunState::Suspended
    }

    pub fn request_pause(&mut self) {
        if self.state != RunState::Suspended {
            self.state = RunState::SuspendPending;
        }
    }

    pub fn begin_step(
        &mut self,
        kind: StepKind,
        granularity: StepGranularity,
        thread: ThreadId,
        origin_depth: usize,
    ) {
        self.state = RunState::Step {
            kind,
            granularity,
            thread,
            origin_depth,
        };
    }

    pub fn suspend(&mut self) {
        self.state = RunState::Suspended;
    }

    pub fn resume(&mut self) {
        self.state = RunState::Running;
    }

    /// Should this hook park the program? `depth` is the thread's call depth
    /// after the hook's own call/return accounting; `at_trap` says the hook
    /// location carries an armed trap.
    pub fn should_stop(
        &self,
        thread: ThreadId,
        event: HookEvent,
        depth: usize,
        at_trap: bool,
    ) -> bool {
        match self.state {
            RunState::Running | RunState::Suspended => false,
            RunState::SuspendPending => true,
            RunState::Step {
                kind,
                granularity,
                thread: step_thread,
                origin_depth,
            } => {
                if thread != step_thread {
                    return false;
                }
                match granularity {
                    StepGranularity::Statement => {
                        statement_stop(kind, event, depth, origin_depth)
                    }
                    StepGranularity::Instruction => {
                        instruction_stop(kind, event, depth, origin_depth, at_trap)
                    }
                }
            }
        }
    }
}

fn statement_stop(kind: StepKind, event: HookEvent, depth: usize, origin_depth: usize) -> bool {
    if event != HookEvent::Line {
        return false;
    }
    match kind {
        StepKind::In => true,
        StepKind::Over => depth <= origin_depth,
        // Stepping out of the outermost frame degrades to step-in: there is
        // no shallower frame to land in before the program ends.
        StepKind::Out => origin_depth <= 1 || depth < origin_depth,
    }
}

fn instruction_stop(
    kind: StepKind,
    event: HookEvent,
    depth: usize,
    origin_depth: usize,
    at_trap: bool,
) -> bool {
    match kind {
        // The callee body is unpatched, so a trap in the origin function can
        // only fire at origin depth or, via recursion, deeper.
        StepKind::Over => at_trap && depth <= origin_depth,
        // A call hook marks entry into the callee's first instruction.
        StepKind::In => at_trap || event == HookEvent::Call,
        StepKind::Out => {
            if origin_depth <= 1 {
                return at_trap || event == HookEvent::Call;
            }
            event != HookEvent::Return && depth < origin_depth
        }
    }
}
