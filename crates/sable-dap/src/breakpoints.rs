//! Line and function breakpoints: conditions, hit counts, log messages.

use sable_host::{Evaluator, ExprId, ThreadId};

use crate::error::{DebugError, DebugResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakpointLocation {
    Line {
        source: String,
        line: u32,
    },
    Function {
        name: String,
        source: Option<String>,
        /// Declaration line, when the client wants to disambiguate
        /// same-named functions.
        line: Option<u32>,
    },
}

#[derive(Clone, Debug)]
pub struct BreakpointSpec {
    pub location: BreakpointLocation,
    pub condition: Option<String>,
    pub hit_target: Option<u32>,
    pub log_message: Option<String>,
}

#[derive(Debug)]
struct Breakpoint {
    id: i64,
    location: BreakpointLocation,
    /// Compiled condition. Dropped permanently after the first evaluation
    /// failure, making the breakpoint unconditional from then on.
    condition: Option<ExprId>,
    hit_target: Option<u32>,
    hit_count: u32,
    log_message: Option<String>,
}

/// What a firing breakpoint asks the session to do: report a stop, or emit
/// the interpolated log message as output and keep running.
#[derive(Clone, Debug, PartialEq)]
pub struct BreakpointHit {
    pub id: i64,
    pub log_message: Option<String>,
}

#[derive(Default)]
pub struct BreakpointStore {
    next_id: i64,
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Register a breakpoint. Rejects exact location duplicates and
    /// conditions that fail to compile.
    pub fn add<E: Evaluator>(&mut self, eval: &mut E, spec: BreakpointSpec) -> DebugResult<i64> {
        if self.breakpoints.iter().any(|bp| bp.location == spec.location) {
            return Err(DebugError::DuplicateBreakpoint);
        }

        let condition = match &spec.condition {
            Some(text) => Some(
                eval.compile(text)
                    .map_err(|err| DebugError::InvalidCondition(err.to_string()))?,
            ),
            None => None,
        };

        self.next_id += 1;
        let id = self.next_id;
        self.breakpoints.push(Breakpoint {
            id,
            location: spec.location,
            condition,
            hit_target: spec.hit_target,
            hit_count: 0,
            log_message: spec.log_message,
        });
        Ok(id)
    }

    pub fn remove_all_for_source(&mut self, source: &str) {
        self.breakpoints.retain(
            |bp| !matches!(&bp.location, BreakpointLocation::Line { source: s, .. } if s == source),
        );
    }

    pub fn remove_all_function(&mut self) {
        self.breakpoints
            .retain(|bp| !matches!(bp.location, BreakpointLocation::Function { .. }));
    }

    pub fn remove_all(&mut self) {
        self.breakpoints.clear();
    }

    /// Check a line hook against line breakpoints.
    pub fn on_line_hook<E: Evaluator>(
        &mut self,
        eval: &mut E,
        source: &str,
        line: u32,
        thread: ThreadId,
        frame: usize,
    ) -> Option<BreakpointHit> {
        self.check(
            eval,
            thread,
            frame,
            |location| matches!(location, BreakpointLocation::Line { source: s, line: l }
                if s == source && *l == line),
        )
    }

    /// Check a call hook against function breakpoints.
    pub fn on_call_hook<E: Evaluator>(
        &mut self,
        eval: &mut E,
        function_name: &str,
        source: Option<&str>,
        line: Option<u32>,
        thread: ThreadId,
        frame: usize,
    ) -> Option<BreakpointHit> {
        self.check(eval, thread, frame, |location| {
            let BreakpointLocation::Function {
                name,
                source: want_source,
                line: want_line,
            } = location
            else {
                return false;
            };
            name == function_name
                && want_source
                    .as_deref()
                    .map_or(true, |want| Some(want) == source)
                && want_line.map_or(true, |want| Some(want) == line)
        })
    }

    fn check<E: Evaluator>(
        &mut self,
        eval: &mut E,
        thread: ThreadId,
        frame: usize,
        matches: impl Fn(&BreakpointLocation) -> bool,
    ) -> Option<BreakpointHit> {
        for bp in &mut self.breakpoints {
            if !matches(&bp.location) {
                continue;
            }

            if let Some(expr) = bp.condition {
                match eval.evaluate_compiled(expr, thread, frame) {
                    Ok(value) => {
                        if !truthy(&value) {
                            continue;
                        }
                    }
                    Err(err) => {
                        // One bad evaluation permanently disarms the
                        // condition and suppresses this hit.
                        tracing::debug!(
                            target: "sable.dap",
                            breakpoint = bp.id,
                            %err,
                            "dropping breakpoint condition after evaluation failure"
                        );
                        bp.condition = None;
                        continue;
                    }
                }
            }

            if let Some(target) = bp.hit_target {
                bp.hit_count += 1;
                if bp.hit_count < target {
                    continue;
                }
                bp.hit_count = 0;
            }

            let log_message = bp
                .log_message
                .as_deref()
                .map(|template| interpolate(eval, template, thread, frame));
            return Some(BreakpointHit {
                id: bp.id,
                log_message,
            });
        }
        None
    }
}

fn truthy(value: &sable_host::Value) -> bool {
    use sable_host::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(v) => *v != 0,
        Value::Float(v) => *v != 0.0,
        Value::Str(_) | Value::Object(_) => true,
    }
}

/// Expand `{expr}` placeholders in a logpoint template. A failing expression
/// renders as its error text rather than killing the message.
fn interpolate<E: Evaluator>(
    eval: &mut E,
    template: &str,
    thread: ThreadId,
    frame: usize,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open + 1..];
        let Some(close) = rest.find('}') else {
            out.push('{');
            break;
        };
        let expr = &rest[..close];
        match eval.evaluate(expr, thread, frame) {
            Ok(value) => out.push_str(&value.to_string()),
            Err(err) => out.push_str(&format!("<{err}>")),
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    out
}
