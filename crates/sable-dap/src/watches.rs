//! Data watches over object fields, stack slots, and expressions.
//!
//! Each watch snapshots the location's value when it is created and is
//! re-read at every hook. A watch without a condition fires on any change;
//! a conditioned watch fires when the value changed *and* the new value
//! satisfies the comparison. Watches whose location disappears tear
//! themselves down and report the removal.

use sable_host::{FunctionId, HostError, HostRuntime, ObjectId, ThreadId, Value};

use crate::error::{DebugError, DebugResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchComparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `value & operand != 0`
    MaskAny,
    /// `value & operand == 0`
    MaskNone,
    /// `value & operand == operand`
    MaskAll,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchCondition {
    pub comparator: WatchComparator,
    pub operand: Value,
}

impl WatchCondition {
    /// Parse the textual form clients send, e.g. `">= 5"`, `"!= 0"`,
    /// `"& 4"`, `"!& 4"`, `"&= 6"`.
    pub fn parse(text: &str) -> DebugResult<Self> {
        let text = text.trim();
        let (op, rest) = ["<=", ">=", "!=", "==", "&=", "!&", "<", ">", "=", "&"]
            .iter()
            .find_map(|op| text.strip_prefix(op).map(|rest| (*op, rest)))
            .ok_or_else(|| {
                DebugError::InvalidCondition(format!("unrecognized watch condition `{text}`"))
            })?;
        let comparator = match op {
            "=" | "==" => WatchComparator::Eq,
            "!=" => WatchComparator::Ne,
            "<" => WatchComparator::Lt,
            "<=" => WatchComparator::Le,
            ">" => WatchComparator::Gt,
            ">=" => WatchComparator::Ge,
            "&" => WatchComparator::MaskAny,
            "!&" => WatchComparator::MaskNone,
            "&=" => WatchComparator::MaskAll,
            _ => unreachable!(),
        };
        let rest = rest.trim();
        let operand = if let Ok(v) = rest.parse::<i64>() {
            Value::Int(v)
        } else if let Ok(v) = rest.parse::<f64>() {
            Value::Float(v)
        } else if rest == "true" {
            Value::Bool(true)
        } else if rest == "false" {
            Value::Bool(false)
        } else if rest == "null" {
            Value::Null
        } else {
            return Err(DebugError::InvalidCondition(format!(
                "unparseable watch operand `{rest}`"
            )));
        };
        Ok(Self {
            comparator,
            operand,
        })
    }

    fn matches(&self, value: &Value) -> bool {
        use WatchComparator::*;
        match self.comparator {
            Eq => values_equal(value, &self.operand),
            Ne => !values_equal(value, &self.operand),
            Lt | Le | Gt | Ge => {
                let (Some(a), Some(b)) = (value.as_number(), self.operand.as_number()) else {
                    return false;
                };
                match self.comparator {
                    Lt => a < b,
                    Le => a <= b,
                    Gt => a > b,
                    Ge => a >= b,
                    _ => unreachable!(),
                }
            }
            MaskAny | MaskNone | MaskAll => {
                let (Some(a), Some(b)) = (value.as_int(), self.operand.as_int()) else {
                    return false;
                };
                match self.comparator {
                    MaskAny => a & b != 0,
                    MaskNone => a & b == 0,
                    MaskAll => a & b == b,
                    _ => unreachable!(),
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchTarget {
    /// A named field of a live heap object.
    Field { object: ObjectId, field: String },
    /// A local slot of a specific native frame, valid while the frame stays
    /// inside the slot's declaration range.
    StackSlot {
        thread: ThreadId,
        frame: usize,
        slot: u32,
    },
    /// An expression re-evaluated in a fixed frame.
    Expression {
        thread: ThreadId,
        frame: usize,
        expression: String,
    },
}

#[derive(Clone, Debug)]
pub struct WatchSpec {
    pub target: WatchTarget,
    pub condition: Option<WatchCondition>,
}

/// Instruction range `[start, end)` of `function` during which a watched
/// slot is declared.
#[derive(Clone, Copy, Debug)]
struct SlotRange {
    function: FunctionId,
    start: u32,
    end: u32,
}

#[derive(Debug)]
struct DataWatch {
    id: i64,
    target: WatchTarget,
    condition: Option<WatchCondition>,
    last: Value,
    /// Object id of `last` while `last` is object-valued; held strongly so
    /// the identity comparison stays meaningful across GC.
    retained: Option<ObjectId>,
    /// Declaration range for stack-slot targets, when the host records one.
    range: Option<SlotRange>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    Fired { id: i64, old: Value, new: Value },
    /// The watched location no longer exists. `notify` says whether the
    /// client should hear about it.
    Removed { id: i64, notify: bool },
}

pub struct DataWatchStore {
    next_id: i64,
    watches: Vec<DataWatch>,
    notify_stack_removal: bool,
}

impl DataWatchStore {
    pub fn new(notify_stack_removal: bool) -> Self {
        Self {
            next_id: 0,
            watches: Vec::new(),
            notify_stack_removal,
        }
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Register a watch, snapshotting the location's current value as the
    /// comparison baseline.
    pub fn add<H: HostRuntime, E: sable_host::Evaluator>(
        &mut self,
        host: &mut H,
        eval: &mut E,
        spec: WatchSpec,
    ) -> DebugResult<i64> {
        if self.watches.iter().any(|w| w.target == spec.target) {
            return Err(DebugError::DuplicateBreakpoint);
        }
        let last = read_target(host, eval, &spec.target)
            .map_err(|err| DebugError::InvalidTarget(err.to_string()))?;
        let range = slot_declaration_range(host, &spec.target)
            .map_err(|err| DebugError::InvalidTarget(err.to_string()))?;
        let retained = retain_value(host, &last);
        self.next_id += 1;
        let id = self.next_id;
        self.watches.push(DataWatch {
            id,
            target: spec.target,
            condition: spec.condition,
            last,
            retained,
            range,
        });
        Ok(id)
    }

    pub fn remove_all<H: HostRuntime>(&mut self, host: &mut H) {
        for watch in self.watches.drain(..) {
            if let Some(object) = watch.retained {
                let _ = host.release_object(object);
            }
        }
    }

    /// Re-read every watch against the current program state. Dead targets
    /// are dropped; changed values fire per their conditions.
    pub fn check_all<H: HostRuntime, E: sable_host::Evaluator>(
        &mut self,
        host: &mut H,
        eval: &mut E,
    ) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        let mut index = 0;
        while index < self.watches.len() {
            let watch = &self.watches[index];
            if let Some(notify) = self.target_gone(host, watch) {
                let watch = self.watches.remove(index);
                if let Some(object) = watch.retained {
                    let _ = host.release_object(object);
                }
                tracing::debug!(
                    target: "sable.dap",
                    watch = watch.id,
                    "removing data watch whose target disappeared"
                );
                events.push(WatchEvent::Removed {
                    id: watch.id,
                    notify,
                });
                continue;
            }

            let current = match read_target(host, eval, &watch.target) {
                Ok(value) => value,
                // Transiently unreadable; leave the baseline alone.
                Err(_) => {
                    index += 1;
                    continue;
                }
            };

            let watch = &mut self.watches[index];
            if !values_equal(&current, &watch.last) {
                let fires = watch
                    .condition
                    .as_ref()
                    .map_or(true, |cond| cond.matches(&current));
                if fires {
                    events.push(WatchEvent::Fired {
                        id: watch.id,
                        old: watch.last.clone(),
                        new: current.clone(),
                    });
                }
                if let Some(object) = watch.retained.take() {
                    let _ = host.release_object(object);
                }
                watch.retained = retain_value(host, &current);
                watch.last = current;
            }
            index += 1;
        }
        events
    }

    /// `Some(notify)` when the watch target no longer exists.
    fn target_gone<H: HostRuntime>(&self, host: &H, watch: &DataWatch) -> Option<bool> {
        match &watch.target {
            WatchTarget::Field { object, .. } => {
                (!host.is_object_live(*object)).then_some(true)
            }
            WatchTarget::StackSlot { thread, frame, .. } => {
                if *frame >= host.call_depth(*thread) {
                    return Some(self.notify_stack_removal);
                }
                let range = watch.range?;
                let inside = host
                    .call_stack(*thread)
                    .ok()
                    .and_then(|stack| stack.get(*frame).cloned())
                    .is_some_and(|info| {
                        info.function == range.function
                            && info.instruction >= range.start
                            && info.instruction < range.end
                    });
                (!inside).then_some(self.notify_stack_removal)
            }
            WatchTarget::Expression { thread, frame, .. } => {
                (*frame >= host.call_depth(*thread)).then_some(self.notify_stack_removal)
            }
        }
    }
}

/// Declaration range of a stack-slot target; `None` for other targets and
/// for hosts that do not record slot liveness.
fn slot_declaration_range<H: HostRuntime>(
    host: &H,
    target: &WatchTarget,
) -> Result<Option<SlotRange>, HostError> {
    let WatchTarget::StackSlot { thread, frame, slot } = target else {
        return Ok(None);
    };
    let stack = host.call_stack(*thread)?;
    let Some(info) = stack.get(*frame) else {
        return Ok(None);
    };
    Ok(host
        .slot_range(info.function, *slot)?
        .map(|(start, end)| SlotRange {
            function: info.function,
            start,
            end,
        }))
}

fn read_target<H: HostRuntime, E: sable_host::Evaluator>(
    host: &mut H,
    eval: &mut E,
    target: &WatchTarget,
) -> anyhow::Result<Value> {
    match target {
        WatchTarget::Field { object, field } => Ok(host.object_field(*object, field)?),
        WatchTarget::StackSlot {
            thread,
            frame,
            slot,
        } => Ok(host.stack_slot(*thread, *frame, *slot)?),
        WatchTarget::Expression {
            thread,
            frame,
            expression,
        } => Ok(eval.evaluate(expression, *thread, *frame)?),
    }
}

fn retain_value<H: HostRuntime>(host: &mut H, value: &Value) -> Option<ObjectId> {
    let object = value.object_id()?;
    host.retain_object(object).ok().map(|_| object)
}

/// Value equality for change detection: objects compare by identity, floats
/// bitwise (a NaN overwrite still counts as a change from non-NaN).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => x.id == y.id,
        _ => false,
    }
}
