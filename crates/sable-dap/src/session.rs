//! The debug session engine.
//!
//! [`Debugger`] owns the host facade, the evaluator, and every store, and is
//! the single place where hook events turn into stop decisions. It is wire
//! format agnostic; `server` translates between it and DAP proper.
//!
//! Re-entrancy: evaluating a breakpoint condition or a watch expression may
//! execute script code, which makes the host raise hooks back into the
//! engine. A depth counter suppresses all hook reactions while any internal
//! evaluation is on the stack.

use sable_host::{
    Evaluator, HookEvent, HookLocation, HostError, HostRuntime, ThreadInfo, ThreadId, Value,
};

use crate::breakpoints::{BreakpointSpec, BreakpointStore};
use crate::config::DebuggerConfig;
use crate::error::{DebugError, DebugResult};
use crate::frames::FrameIdentityMap;
use crate::object_registry::{ObjectRefRegistry, Resolved};
use crate::step::{RunState, StepController, StepGranularity, StepKind};
use crate::traps::InstructionTrapTable;
use crate::watches::{DataWatchStore, WatchCondition, WatchEvent, WatchSpec, WatchTarget};

#[derive(Clone, Debug, PartialEq)]
pub enum StopReason {
    Breakpoint { id: i64 },
    FunctionBreakpoint { id: i64 },
    DataBreakpoint { id: i64 },
    Step,
    Pause,
    Exception { description: String },
}

/// Everything a single hook dispatch decided.
#[derive(Debug, Default, PartialEq)]
pub struct HookOutcome {
    pub stop: Option<StopReason>,
    /// Interpolated logpoint messages, to be sent as output events.
    pub output: Vec<String>,
    /// Ids of data watches that tore themselves down and want the client
    /// told about it.
    pub removed_watches: Vec<i64>,
}

#[derive(Clone, Copy, Debug, Default)]
struct ExceptionFilter {
    caught: bool,
    uncaught: bool,
}

/// One row of a `variables` or `evaluate` reply, pre-rendered.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableEntry {
    pub name: String,
    pub value: String,
    pub type_name: String,
    /// `variablesReference` for structured values, `0` for leaves.
    pub reference: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StackFrameEntry {
    pub id: i64,
    pub name: String,
    pub source: Option<String>,
    pub line: u32,
    pub instruction: u32,
}

pub struct Debugger<H: HostRuntime, E: Evaluator> {
    host: H,
    eval: E,
    config: DebuggerConfig,
    breakpoints: BreakpointStore,
    function_breakpoints: BreakpointStore,
    watches: DataWatchStore,
    traps: InstructionTrapTable,
    refs: ObjectRefRegistry,
    frames: FrameIdentityMap,
    step: StepController,
    exception_filter: ExceptionFilter,
    /// Nesting depth of engine-initiated evaluations. Non-zero suppresses
    /// every hook reaction.
    internal_eval: u32,
}

impl<H: HostRuntime, E: Evaluator> Debugger<H, E> {
    pub fn new(host: H, eval: E, config: DebuggerConfig) -> Self {
        let watches = DataWatchStore::new(config.notify_stack_watch_removal);
        let refs = ObjectRefRegistry::new(config.max_weak_refs);
        Self {
            host,
            eval,
            config,
            breakpoints: BreakpointStore::new(),
            function_breakpoints: BreakpointStore::new(),
            watches,
            traps: InstructionTrapTable::new(),
            refs,
            frames: FrameIdentityMap::new(),
            step: StepController::new(),
            exception_filter: ExceptionFilter::default(),
            internal_eval: 0,
        }
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    pub fn is_suspended(&self) -> bool {
        self.step.is_suspended()
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn eval_mut(&mut self) -> &mut E {
        &mut self.eval
    }

    // ---- hook entry ----------------------------------------------------

    /// Host hook entry for call/return/line events. Returns what the caller
    /// (normally the server) should do; on a stop the engine is already in
    /// the suspended state.
    pub fn on_hook(
        &mut self,
        thread: ThreadId,
        event: HookEvent,
        location: &HookLocation,
    ) -> HookOutcome {
        let mut outcome = HookOutcome::default();
        if self.internal_eval > 0 {
            return outcome;
        }

        let depth = self.host.call_depth(thread);
        let frame = depth.saturating_sub(1);
        let at_trap = self.traps.is_armed(location.function, location.instruction);

        let was_pause = self.step.state() == RunState::SuspendPending;
        if self.step.should_stop(thread, event, depth, at_trap) {
            outcome.stop = Some(if was_pause {
                StopReason::Pause
            } else {
                StopReason::Step
            });
        }

        self.internal_eval += 1;
        if outcome.stop.is_none() {
            self.check_breakpoints(thread, event, location, frame, &mut outcome);
        }
        let watch_events = self.watches.check_all(&mut self.host, &mut self.eval);
        self.internal_eval -= 1;

        for we in watch_events {
            match we {
                WatchEvent::Fired { id, .. } => {
                    if outcome.stop.is_none() {
                        outcome.stop = Some(StopReason::DataBreakpoint { id });
                    }
                }
                WatchEvent::Removed { id, notify } => {
                    if notify {
                        outcome.removed_watches.push(id);
                    }
                }
            }
        }

        if outcome.stop.is_some() {
            // The client inspects the real instruction stream, and any
            // evaluate during the pause must not execute a trap sentinel.
            self.traps.restore_all(&mut self.host);
            self.step.suspend();
        } else if at_trap {
            self.walk_instruction_step(location);
        }
        outcome
    }

    /// Host hook entry for propagating script errors. `caught` says a
    /// handler somewhere up the stack will absorb the error.
    pub fn on_error_hook(
        &mut self,
        _thread: ThreadId,
        description: &str,
        caught: bool,
    ) -> HookOutcome {
        let mut outcome = HookOutcome::default();
        if self.internal_eval > 0 {
            return outcome;
        }
        let wanted = if caught {
            self.exception_filter.caught
        } else {
            self.exception_filter.uncaught
        };
        if wanted {
            self.traps.restore_all(&mut self.host);
            self.step.suspend();
            outcome.stop = Some(StopReason::Exception {
                description: description.to_string(),
            });
        }
        outcome
    }

    fn check_breakpoints(
        &mut self,
        thread: ThreadId,
        event: HookEvent,
        location: &HookLocation,
        frame: usize,
        outcome: &mut HookOutcome,
    ) {
        let hit = match event {
            HookEvent::Line => match (&location.source, location.line) {
                (Some(source), Some(line)) => self
                    .breakpoints
                    .on_line_hook(&mut self.eval, source, line, thread, frame)
                    .map(|hit| (hit, false)),
                _ => None,
            },
            HookEvent::Call => {
                let Ok(name) = self.host.function_name(location.function) else {
                    return;
                };
                self.function_breakpoints
                    .on_call_hook(
                        &mut self.eval,
                        &name,
                        location.source.as_deref(),
                        location.line,
                        thread,
                        frame,
                    )
                    .map(|hit| (hit, true))
            }
            HookEvent::Return | HookEvent::Error => None,
        };

        if let Some((hit, is_function)) = hit {
            match hit.log_message {
                // A logpoint emits and keeps running.
                Some(message) => outcome.output.push(message),
                None => {
                    outcome.stop = Some(if is_function {
                        StopReason::FunctionBreakpoint { id: hit.id }
                    } else {
                        StopReason::Breakpoint { id: hit.id }
                    });
                }
            }
        }
    }

    /// A trap fired but the step logic declined to stop (recursion below the
    /// origin depth). Put the instruction stream back and chase execution by
    /// arming the successors of the trapped location.
    fn walk_instruction_step(&mut self, location: &HookLocation) {
        let RunState::Step {
            granularity: StepGranularity::Instruction,
            ..
        } = self.step.state()
        else {
            return;
        };
        self.traps.restore_all(&mut self.host);
        if let Err(err) = self.traps.arm_instruction_successors(
            &mut self.host,
            location.function,
            location.instruction,
        ) {
            tracing::error!(target: "sable.dap", %err, "failed to re-arm step traps");
            self.step.resume();
        }
    }

    // ---- execution control ---------------------------------------------

    /// Resume after a stop: exact trap restoration and weak handle purge.
    /// Frame ids are append-only and survive; stale ones are caught at
    /// resolve time.
    pub fn resume(&mut self) {
        self.teardown_episode();
        self.step.resume();
    }

    pub fn pause(&mut self) {
        self.step.request_pause();
    }

    pub fn step(
        &mut self,
        kind: StepKind,
        granularity: StepGranularity,
        thread: ThreadId,
    ) -> DebugResult<()> {
        let depth = self.host.call_depth(thread);
        let stack = self.host.call_stack(thread)?;
        let top = stack
            .last()
            .ok_or(DebugError::Host(HostError::UnknownThread(thread)))?;
        let (function, instruction) = (top.function, top.instruction);

        self.teardown_episode();
        match granularity {
            StepGranularity::Instruction => {
                self.traps
                    .arm_instruction_successors(&mut self.host, function, instruction)?;
            }
            StepGranularity::Statement => {
                let armed =
                    self.traps
                        .arm_statement_successors(&mut self.host, function, instruction)?;
                if !armed {
                    // No line metadata: line hooks alone have to carry the
                    // step, which still terminates, just more coarsely.
                    tracing::debug!(
                        target: "sable.dap",
                        function,
                        "stepping without line metadata"
                    );
                }
            }
        }
        self.step.begin_step(kind, granularity, thread, depth);
        Ok(())
    }

    fn teardown_episode(&mut self) {
        self.traps.restore_all(&mut self.host);
        self.refs.release_unretained();
    }

    /// Full teardown on disconnect: every patched instruction restored,
    /// every store emptied, every hold released, execution resumed.
    pub fn teardown(&mut self) {
        self.traps.restore_all(&mut self.host);
        self.watches.remove_all(&mut self.host);
        self.breakpoints.remove_all();
        self.function_breakpoints.remove_all();
        self.refs.clear(&mut self.host);
        self.frames.clear();
        self.step.resume();
    }

    // ---- breakpoint administration --------------------------------------

    /// Replace all breakpoints in `source` with `specs`, reporting each
    /// add's outcome positionally.
    pub fn set_source_breakpoints(
        &mut self,
        source: &str,
        specs: Vec<BreakpointSpec>,
    ) -> Vec<DebugResult<i64>> {
        self.breakpoints.remove_all_for_source(source);
        specs
            .into_iter()
            .map(|spec| self.breakpoints.add(&mut self.eval, spec))
            .collect()
    }

    pub fn set_function_breakpoints(
        &mut self,
        specs: Vec<BreakpointSpec>,
    ) -> Vec<DebugResult<i64>> {
        self.function_breakpoints.remove_all_function();
        specs
            .into_iter()
            .map(|spec| self.function_breakpoints.add(&mut self.eval, spec))
            .collect()
    }

    pub fn set_exception_filters(&mut self, caught: bool, uncaught: bool) {
        self.exception_filter = ExceptionFilter { caught, uncaught };
    }

    // ---- data watches ---------------------------------------------------

    /// Translate a (variablesReference, name) pair the client saw into a
    /// concrete watch target.
    pub fn watch_target_for(&mut self, reference: i64, name: &str) -> DebugResult<WatchTarget> {
        match self.refs.resolve(&mut self.host, reference) {
            Resolved::Object(object) => Ok(WatchTarget::Field {
                object,
                field: name.to_string(),
            }),
            Resolved::Scope { thread, frame } => {
                let locals = self.host.frame_locals(thread, frame)?;
                let slot = locals
                    .iter()
                    .position(|(n, _)| n == name)
                    .ok_or_else(|| DebugError::Host(HostError::NoSuchField(name.to_string())))?;
                Ok(WatchTarget::StackSlot {
                    thread,
                    frame,
                    slot: slot as u32,
                })
            }
            Resolved::Invalid => Err(DebugError::StaleReference(reference)),
        }
    }

    /// Watch target for a free-form expression, bound to the given frame (or
    /// the global context without one).
    pub fn expression_watch_target(
        &mut self,
        frame_id: Option<i64>,
        expression: &str,
    ) -> DebugResult<WatchTarget> {
        let (thread, frame) = self.eval_context(frame_id)?;
        Ok(WatchTarget::Expression {
            thread,
            frame,
            expression: expression.to_string(),
        })
    }

    pub fn add_watch(
        &mut self,
        target: WatchTarget,
        condition: Option<WatchCondition>,
    ) -> DebugResult<i64> {
        self.internal_eval += 1;
        let result = self
            .watches
            .add(&mut self.host, &mut self.eval, WatchSpec { target, condition });
        self.internal_eval -= 1;
        result
    }

    pub fn clear_watches(&mut self) {
        self.watches.remove_all(&mut self.host);
    }

    // ---- inspection -----------------------------------------------------

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.host.threads()
    }

    /// DAP-ordered stack: innermost frame first, each with a stable id.
    pub fn stack_trace(&mut self, thread: ThreadId) -> DebugResult<Vec<StackFrameEntry>> {
        let stack = self.host.call_stack(thread)?;
        let mut out = Vec::with_capacity(stack.len());
        for (index, frame) in stack.iter().enumerate().rev() {
            out.push(StackFrameEntry {
                id: self.frames.to_frame_id(thread, index),
                name: frame.name.clone(),
                source: frame.source.clone(),
                line: frame.line,
                instruction: frame.instruction,
            });
        }
        Ok(out)
    }

    /// The locals scope reference for a frame id.
    pub fn scope_reference(&mut self, frame_id: i64) -> DebugResult<i64> {
        let (thread, frame) = self
            .frames
            .resolve(&self.host, frame_id)
            .ok_or(DebugError::StaleReference(frame_id))?;
        Ok(self.refs.to_scope_ref(thread, frame))
    }

    pub fn variables(&mut self, reference: i64) -> DebugResult<Vec<VariableEntry>> {
        let children = match self.refs.resolve(&mut self.host, reference) {
            Resolved::Object(object) => self.host.object_children(object)?,
            Resolved::Scope { thread, frame } => self.host.frame_locals(thread, frame)?,
            Resolved::Invalid => return Err(DebugError::StaleReference(reference)),
        };
        Ok(children
            .into_iter()
            .map(|(name, value)| self.to_entry(name, &value, false))
            .collect())
    }

    pub fn set_variable(
        &mut self,
        reference: i64,
        name: &str,
        expression: &str,
    ) -> DebugResult<VariableEntry> {
        match self.refs.resolve(&mut self.host, reference) {
            Resolved::Scope { thread, frame } => {
                let value = self.guarded(|eval| eval.evaluate(expression, thread, frame))?;
                let stored = self.guarded(|eval| eval.assign(name, value, thread, frame))?;
                Ok(self.to_entry(name.to_string(), &stored, false))
            }
            Resolved::Object(object) => {
                // No frame context for a bare object; evaluate globally.
                let value = self.guarded(|eval| eval.evaluate(expression, 0, 0))?;
                self.host.set_object_field(object, name, value.clone())?;
                Ok(self.to_entry(name.to_string(), &value, false))
            }
            Resolved::Invalid => Err(DebugError::StaleReference(reference)),
        }
    }

    /// Evaluate in the given frame, or globally without one. Object results
    /// get a strong reference: an ephemeral value has no other owner to keep
    /// it alive while the client drills into it.
    pub fn evaluate(
        &mut self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> DebugResult<VariableEntry> {
        let (thread, frame) = self.eval_context(frame_id)?;
        let value = self.guarded(|eval| eval.evaluate(expression, thread, frame))?;
        Ok(self.to_entry(expression.to_string(), &value, true))
    }

    /// Assign to an l-value expression.
    pub fn set_expression(
        &mut self,
        expression: &str,
        value_expression: &str,
        frame_id: Option<i64>,
    ) -> DebugResult<VariableEntry> {
        let (thread, frame) = self.eval_context(frame_id)?;
        let value = self.guarded(|eval| eval.evaluate(value_expression, thread, frame))?;
        let stored = self.guarded(|eval| eval.assign(expression, value, thread, frame))?;
        Ok(self.to_entry(expression.to_string(), &stored, false))
    }

    pub fn goto_line(&mut self, thread: ThreadId, line: u32) -> DebugResult<()> {
        self.host.jump_to_line(thread, line)?;
        Ok(())
    }

    pub fn restart_frame(&mut self, frame_id: i64) -> DebugResult<()> {
        let (thread, frame) = self
            .frames
            .resolve(&self.host, frame_id)
            .ok_or(DebugError::StaleReference(frame_id))?;
        self.host.restart_frame(thread, frame)?;
        Ok(())
    }

    fn eval_context(&self, frame_id: Option<i64>) -> DebugResult<(ThreadId, usize)> {
        match frame_id {
            Some(id) => self
                .frames
                .resolve(&self.host, id)
                .ok_or(DebugError::StaleReference(id)),
            None => Ok((0, 0)),
        }
    }

    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut E) -> Result<T, sable_host::EvalError>,
    ) -> DebugResult<T> {
        self.internal_eval += 1;
        let result = f(&mut self.eval);
        self.internal_eval -= 1;
        Ok(result?)
    }

    fn to_entry(&mut self, name: String, value: &Value, strong: bool) -> VariableEntry {
        let reference = match value.object_id() {
            Some(object) => self.refs.to_ref(&mut self.host, object, strong),
            None => 0,
        };
        VariableEntry {
            name,
            value: value.to_string(),
            type_name: value.type_name().to_string(),
            reference,
        }
    }

    #[cfg(test)]
    fn trap_count(&self) -> usize {
        self.traps.len()
    }

    #[cfg(test)]
    fn ref_count(&self) -> usize {
        self.refs.len()
    }
}
