//! DAP request dispatch over a [`DapTransport`].
//!
//! The server is driven from inside the host: the host forwards hook events
//! through [`DapServer::on_hook`] and calls [`DapServer::tick`] from its
//! instruction loop. When a hook stops the program, the server parks the
//! host thread in a poll/sleep loop until the client resumes it.

use sable_host::{Evaluator, HookEvent, HookLocation, HostRuntime, ThreadId};
use serde_json::{json, Value};

use crate::breakpoints::{BreakpointLocation, BreakpointSpec};
use crate::dap::messages::{Event, Request, Response};
use crate::error::{DebugError, DebugResult};
use crate::session::{Debugger, StopReason};
use crate::step::{StepGranularity, StepKind};
use crate::transport::DapTransport;
use crate::watches::{WatchCondition, WatchTarget};

pub struct DapServer<H: HostRuntime, E: Evaluator, T: DapTransport> {
    debugger: Debugger<H, E>,
    transport: T,
    next_seq: u64,
    disconnected: bool,
}

impl<H: HostRuntime, E: Evaluator, T: DapTransport> DapServer<H, E, T> {
    pub fn new(debugger: Debugger<H, E>, transport: T) -> Self {
        Self {
            debugger,
            transport,
            next_seq: 0,
            disconnected: false,
        }
    }

    pub fn debugger_mut(&mut self) -> &mut Debugger<H, E> {
        &mut self.debugger
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Drain requests that arrived while the program was running. Hosts call
    /// this periodically from their interpreter loop.
    pub fn tick(&mut self) -> DebugResult<()> {
        if self.disconnected {
            return Ok(());
        }
        loop {
            match self.transport.poll_request() {
                Ok(Some(request)) => self.dispatch(request)?,
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.drop_client(&err);
                    return Ok(());
                }
            }
        }
    }

    /// Hook entry. On a stop this does not return until the client resumes
    /// execution, the poll budget runs out, or the client goes away.
    pub fn on_hook(
        &mut self,
        thread: ThreadId,
        event: HookEvent,
        location: &HookLocation,
    ) -> DebugResult<()> {
        if self.disconnected {
            return Ok(());
        }
        let outcome = self.debugger.on_hook(thread, event, location);
        self.report_outcome(thread, outcome)
    }

    pub fn on_error_hook(
        &mut self,
        thread: ThreadId,
        description: &str,
        caught: bool,
    ) -> DebugResult<()> {
        if self.disconnected {
            return Ok(());
        }
        let outcome = self.debugger.on_error_hook(thread, description, caught);
        self.report_outcome(thread, outcome)
    }

    fn report_outcome(
        &mut self,
        thread: ThreadId,
        outcome: crate::session::HookOutcome,
    ) -> DebugResult<()> {
        for message in outcome.output {
            self.send_event(
                "output",
                Some(json!({ "category": "console", "output": format!("{message}\n") })),
            )?;
        }
        for id in outcome.removed_watches {
            self.send_event(
                "breakpoint",
                Some(json!({
                    "reason": "removed",
                    "breakpoint": { "id": id, "verified": false },
                })),
            )?;
        }
        if let Some(reason) = outcome.stop {
            self.send_stopped(thread, &reason)?;
            self.suspend_loop()?;
        }
        Ok(())
    }

    fn suspend_loop(&mut self) -> DebugResult<()> {
        let interval = self.debugger.config().poll_interval();
        let budget = self.debugger.config().max_poll_iterations;
        let mut idle: u64 = 0;
        while self.debugger.is_suspended() && !self.disconnected {
            match self.transport.poll_request() {
                Ok(Some(request)) => {
                    idle = 0;
                    self.dispatch(request)?;
                }
                Ok(None) => {
                    idle += 1;
                    if budget.is_some_and(|max| idle >= max) {
                        tracing::warn!(
                            target: "sable.dap",
                            iterations = idle,
                            "poll budget exhausted while suspended, resuming"
                        );
                        self.debugger.resume();
                        self.send_event("continued", Some(json!({ "allThreadsContinued": true })))?;
                        break;
                    }
                    if !interval.is_zero() {
                        std::thread::sleep(interval);
                    }
                }
                Err(err) => {
                    self.drop_client(&err);
                    break;
                }
            }
        }
        Ok(())
    }

    /// The client is gone. Everything the session did to the host must be
    /// undone and execution must continue as if no debugger were attached.
    fn drop_client(&mut self, err: &std::io::Error) {
        tracing::info!(target: "sable.dap", %err, "client connection lost, detaching");
        self.debugger.teardown();
        self.disconnected = true;
    }

    fn dispatch(&mut self, request: Request) -> DebugResult<()> {
        tracing::debug!(
            target: "sable.dap",
            command = %request.command,
            seq = request.seq,
            "request"
        );
        let result = self.handle_request(&request).map_err(|err| {
            tracing::debug!(target: "sable.dap", command = %request.command, %err, "request failed");
            err.to_string()
        });
        let succeeded = result.is_ok();
        let seq = self.alloc_seq();
        self.send(&Response::reply(seq, &request, result))?;
        if succeeded {
            self.after_response(&request)?;
        }
        Ok(())
    }

    /// Side effects that per DAP ordering happen after the response is on
    /// the wire.
    fn after_response(&mut self, request: &Request) -> DebugResult<()> {
        match request.command.as_str() {
            "initialize" => self.send_event("initialized", None),
            "goto" => {
                let thread = request
                    .arguments()
                    .get("threadId")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                self.send_event(
                    "stopped",
                    Some(json!({
                        "reason": "goto",
                        "threadId": thread,
                        "allThreadsStopped": true,
                    })),
                )
            }
            "restartFrame" => self.send_event(
                "stopped",
                Some(json!({ "reason": "restart", "allThreadsStopped": true })),
            ),
            "disconnect" => {
                self.debugger.teardown();
                self.disconnected = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_request(&mut self, request: &Request) -> DebugResult<Option<Value>> {
        let args = request.arguments();
        match request.command.as_str() {
            "initialize" => Ok(Some(capabilities())),
            "launch" | "attach" | "configurationDone" => Ok(None),
            "setBreakpoints" => self.set_breakpoints(args),
            "setFunctionBreakpoints" => self.set_function_breakpoints(args),
            "setExceptionBreakpoints" => {
                let filters: Vec<&str> = args
                    .get("filters")
                    .and_then(Value::as_array)
                    .map(|f| f.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                self.debugger.set_exception_filters(
                    filters.contains(&"caught"),
                    filters.contains(&"uncaught"),
                );
                Ok(None)
            }
            "dataBreakpointInfo" => self.data_breakpoint_info(args),
            "setDataBreakpoints" => self.set_data_breakpoints(args),
            "threads" => {
                let threads: Vec<Value> = self
                    .debugger
                    .threads()
                    .into_iter()
                    .map(|t| json!({ "id": t.id, "name": t.name }))
                    .collect();
                Ok(Some(json!({ "threads": threads })))
            }
            "stackTrace" => {
                let thread = require_u64(args, "threadId")?;
                let frames: Vec<Value> = self
                    .debugger
                    .stack_trace(thread)?
                    .into_iter()
                    .map(|f| {
                        json!({
                            "id": f.id,
                            "name": f.name,
                            "source": f.source.map(|s| json!({ "name": s, "path": s })),
                            "line": f.line,
                            "column": 1,
                            "instructionPointerReference": format!("{}", f.instruction),
                        })
                    })
                    .collect();
                Ok(Some(json!({
                    "totalFrames": frames.len(),
                    "stackFrames": frames,
                })))
            }
            "scopes" => {
                let frame_id = require_i64(args, "frameId")?;
                let reference = self.debugger.scope_reference(frame_id)?;
                Ok(Some(json!({
                    "scopes": [{
                        "name": "Locals",
                        "variablesReference": reference,
                        "expensive": false,
                    }],
                })))
            }
            "variables" => {
                let reference = require_i64(args, "variablesReference")?;
                let variables: Vec<Value> = self
                    .debugger
                    .variables(reference)?
                    .into_iter()
                    .map(|v| {
                        json!({
                            "name": v.name,
                            "value": v.value,
                            "type": v.type_name,
                            "variablesReference": v.reference,
                        })
                    })
                    .collect();
                Ok(Some(json!({ "variables": variables })))
            }
            "setVariable" => {
                let reference = require_i64(args, "variablesReference")?;
                let name = require_str(args, "name")?;
                let value = require_str(args, "value")?;
                let entry = self.debugger.set_variable(reference, name, value)?;
                Ok(Some(json!({
                    "value": entry.value,
                    "type": entry.type_name,
                    "variablesReference": entry.reference,
                })))
            }
            "evaluate" => {
                let expression = require_str(args, "expression")?;
                let frame_id = args.get("frameId").and_then(Value::as_i64);
                let entry = self.debugger.evaluate(expression, frame_id)?;
                Ok(Some(json!({
                    "result": entry.value,
                    "type": entry.type_name,
                    "variablesReference": entry.reference,
                })))
            }
            "setExpression" => {
                let expression = require_str(args, "expression")?;
                let value = require_str(args, "value")?;
                let frame_id = args.get("frameId").and_then(Value::as_i64);
                let entry = self.debugger.set_expression(expression, value, frame_id)?;
                Ok(Some(json!({
                    "value": entry.value,
                    "type": entry.type_name,
                    "variablesReference": entry.reference,
                })))
            }
            "continue" => {
                self.debugger.resume();
                Ok(Some(json!({ "allThreadsContinued": true })))
            }
            "pause" => {
                self.debugger.pause();
                Ok(None)
            }
            "next" | "stepIn" | "stepOut" => {
                let thread = require_u64(args, "threadId")?;
                let granularity = match args.get("granularity").and_then(Value::as_str) {
                    Some("instruction") => StepGranularity::Instruction,
                    _ => StepGranularity::Statement,
                };
                let kind = match request.command.as_str() {
                    "next" => StepKind::Over,
                    "stepIn" => StepKind::In,
                    _ => StepKind::Out,
                };
                self.debugger.step(kind, granularity, thread)?;
                Ok(None)
            }
            "gotoTargets" => {
                let line = require_u64(args, "line")?;
                Ok(Some(json!({
                    "targets": [{
                        "id": line,
                        "label": format!("line {line}"),
                        "line": line,
                    }],
                })))
            }
            "goto" => {
                let thread = require_u64(args, "threadId")?;
                let line = require_u64(args, "targetId")? as u32;
                self.debugger.goto_line(thread, line)?;
                Ok(None)
            }
            "restartFrame" => {
                let frame_id = require_i64(args, "frameId")?;
                self.debugger.restart_frame(frame_id)?;
                Ok(None)
            }
            "disconnect" => Ok(None),
            other => Err(DebugError::Protocol(format!(
                "unsupported request `{other}`"
            ))),
        }
    }

    fn set_breakpoints(&mut self, args: &Value) -> DebugResult<Option<Value>> {
        let source = args
            .get("source")
            .and_then(|s| s.get("path").or_else(|| s.get("name")))
            .and_then(Value::as_str)
            .ok_or_else(|| DebugError::Protocol("setBreakpoints without a source".into()))?
            .to_string();
        let requested = args
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut specs = Vec::with_capacity(requested.len());
        let mut lines = Vec::with_capacity(requested.len());
        for bp in &requested {
            let line = require_u64(bp, "line")? as u32;
            lines.push(line);
            specs.push(BreakpointSpec {
                location: BreakpointLocation::Line {
                    source: source.clone(),
                    line,
                },
                condition: opt_str(bp, "condition"),
                hit_target: parse_hit_condition(bp)?,
                log_message: opt_str(bp, "logMessage"),
            });
        }

        let results = self.debugger.set_source_breakpoints(&source, specs);
        Ok(Some(json!({
            "breakpoints": breakpoint_results(results, Some(&lines)),
        })))
    }

    fn set_function_breakpoints(&mut self, args: &Value) -> DebugResult<Option<Value>> {
        let requested = args
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut specs = Vec::with_capacity(requested.len());
        for bp in &requested {
            specs.push(BreakpointSpec {
                location: BreakpointLocation::Function {
                    name: require_str(bp, "name")?.to_string(),
                    source: opt_str(bp, "source"),
                    line: bp.get("line").and_then(Value::as_u64).map(|l| l as u32),
                },
                condition: opt_str(bp, "condition"),
                hit_target: parse_hit_condition(bp)?,
                log_message: None,
            });
        }

        let results = self.debugger.set_function_breakpoints(specs);
        Ok(Some(json!({
            "breakpoints": breakpoint_results(results, None),
        })))
    }

    fn data_breakpoint_info(&mut self, args: &Value) -> DebugResult<Option<Value>> {
        let name = require_str(args, "name")?;
        let target = match args.get("variablesReference").and_then(Value::as_i64) {
            Some(reference) => self.debugger.watch_target_for(reference, name)?,
            None => {
                let frame_id = args.get("frameId").and_then(Value::as_i64);
                self.debugger.expression_watch_target(frame_id, name)?
            }
        };
        Ok(Some(json!({
            "dataId": encode_data_id(&target),
            "description": name,
            "accessTypes": ["write"],
            "canPersist": false,
        })))
    }

    fn set_data_breakpoints(&mut self, args: &Value) -> DebugResult<Option<Value>> {
        self.debugger.clear_watches();
        let requested = args
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(requested.len());
        for bp in &requested {
            let added = require_str(bp, "dataId")
                .and_then(decode_data_id)
                .and_then(|target| {
                    let condition = match opt_str(bp, "condition") {
                        Some(text) => Some(WatchCondition::parse(&text)?),
                        None => None,
                    };
                    self.debugger.add_watch(target, condition)
                });
            results.push(match added {
                Ok(id) => json!({ "id": id, "verified": true }),
                Err(err) => json!({ "verified": false, "message": err.to_string() }),
            });
        }
        Ok(Some(json!({ "breakpoints": results })))
    }

    fn send_stopped(&mut self, thread: ThreadId, reason: &StopReason) -> DebugResult<()> {
        let mut body = json!({
            "threadId": thread,
            "allThreadsStopped": true,
        });
        let map = body.as_object_mut().unwrap();
        match reason {
            StopReason::Breakpoint { id } | StopReason::FunctionBreakpoint { id } => {
                map.insert("reason".into(), json!("breakpoint"));
                map.insert("hitBreakpointIds".into(), json!([id]));
            }
            StopReason::DataBreakpoint { id } => {
                map.insert("reason".into(), json!("data breakpoint"));
                map.insert("hitBreakpointIds".into(), json!([id]));
            }
            StopReason::Step => {
                map.insert("reason".into(), json!("step"));
            }
            StopReason::Pause => {
                map.insert("reason".into(), json!("pause"));
            }
            StopReason::Exception { description } => {
                map.insert("reason".into(), json!("exception"));
                map.insert("description".into(), json!(description));
                map.insert("text".into(), json!(description));
            }
        }
        self.send_event("stopped", Some(body))
    }

    fn send_event(&mut self, name: &str, body: Option<Value>) -> DebugResult<()> {
        let seq = self.alloc_seq();
        self.send(&Event::new(seq, name, body))
    }

    /// Serialize and send one message. A write-side transport failure is as
    /// fatal as a read-side one and detaches the whole session.
    fn send<M: serde::Serialize>(&mut self, message: &M) -> DebugResult<()> {
        if self.disconnected {
            return Ok(());
        }
        let value = serde_json::to_value(message)
            .map_err(|err| DebugError::Protocol(err.to_string()))?;
        if let Err(err) = self.transport.send_message(&value) {
            self.drop_client(&err);
        }
        Ok(())
    }

    fn alloc_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsConditionalBreakpoints": true,
        "supportsHitConditionalBreakpoints": true,
        "supportsLogPoints": true,
        "supportsFunctionBreakpoints": true,
        "supportsDataBreakpoints": true,
        "supportsSetVariable": true,
        "supportsSetExpression": true,
        "supportsRestartFrame": true,
        "supportsGotoTargetsRequest": true,
        "supportsSteppingGranularity": true,
        "exceptionBreakpointFilters": [
            { "filter": "caught", "label": "Caught errors", "default": false },
            { "filter": "uncaught", "label": "Uncaught errors", "default": true },
        ],
    })
}

fn breakpoint_results(results: Vec<DebugResult<i64>>, lines: Option<&[u32]>) -> Vec<Value> {
    results
        .into_iter()
        .enumerate()
        .map(|(index, result)| match result {
            Ok(id) => {
                let mut bp = json!({ "id": id, "verified": true });
                if let Some(line) = lines.and_then(|l| l.get(index)) {
                    bp.as_object_mut().unwrap().insert("line".into(), json!(line));
                }
                bp
            }
            Err(err) => json!({ "verified": false, "message": err.to_string() }),
        })
        .collect()
}

/// Stable textual watch-target encoding used as the DAP `dataId`.
fn encode_data_id(target: &WatchTarget) -> String {
    match target {
        WatchTarget::Field { object, field } => format!("obj:{object}:{field}"),
        WatchTarget::StackSlot {
            thread,
            frame,
            slot,
        } => format!("slot:{thread}:{frame}:{slot}"),
        WatchTarget::Expression {
            thread,
            frame,
            expression,
        } => format!("expr:{thread}:{frame}:{expression}"),
    }
}

fn decode_data_id(data_id: &str) -> DebugResult<WatchTarget> {
    let bad = || DebugError::InvalidTarget(format!("malformed dataId `{data_id}`"));
    let mut parts = data_id.splitn(2, ':');
    let kind = parts.next().ok_or_else(bad)?;
    let rest = parts.next().ok_or_else(bad)?;
    match kind {
        "obj" => {
            let (object, field) = rest.split_once(':').ok_or_else(bad)?;
            Ok(WatchTarget::Field {
                object: object.parse().map_err(|_| bad())?,
                field: field.to_string(),
            })
        }
        "slot" => {
            let mut it = rest.splitn(3, ':');
            let thread = it.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let frame = it.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let slot = it.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            Ok(WatchTarget::StackSlot {
                thread,
                frame,
                slot,
            })
        }
        "expr" => {
            let mut it = rest.splitn(3, ':');
            let thread = it.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let frame = it.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
            let expression = it.next().ok_or_else(bad)?;
            Ok(WatchTarget::Expression {
                thread,
                frame,
                expression: expression.to_string(),
            })
        }
        _ => Err(bad()),
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> DebugResult<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DebugError::Protocol(format!("missing argument `{key}`")))
}

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn require_u64(args: &Value, key: &str) -> DebugResult<u64> {
    args.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| DebugError::Protocol(format!("missing argument `{key}`")))
}

fn require_i64(args: &Value, key: &str) -> DebugResult<i64> {
    args.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| DebugError::Protocol(format!("missing argument `{key}`")))
}

fn parse_hit_condition(bp: &Value) -> DebugResult<Option<u32>> {
    let Some(text) = bp.get("hitCondition").and_then(Value::as_str) else {
        return Ok(None);
    };
    text.trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| DebugError::Protocol(format!("bad hitCondition `{text}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_ids_roundtrip() {
        for target in [
            WatchTarget::Field {
                object: 7,
                field: "hp".into(),
            },
            WatchTarget::StackSlot {
                thread: 1,
                frame: 2,
                slot: 3,
            },
            WatchTarget::Expression {
                thread: 1,
                frame: 0,
                expression: "a.b:c".into(),
            },
        ] {
            assert_eq!(decode_data_id(&encode_data_id(&target)).unwrap(), target);
        }
    }

    #[test]
    fn malformed_data_ids_are_rejected() {
        assert!(decode_data_id("obj:banana:x").is_err());
        assert!(decode_data_id("slot:1:2").is_err());
        assert!(decode_data_id("nope").is_err());
    }

    #[test]
    fn hit_condition_must_be_a_count() {
        assert_eq!(
            parse_hit_condition(&json!({ "hitCondition": "4" })).unwrap(),
            Some(4)
        );
        assert_eq!(parse_hit_condition(&json!({})).unwrap(), None);
        assert!(parse_hit_condition(&json!({ "hitCondition": "% 3" })).is_err());
    }
}
