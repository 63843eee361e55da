//! Host-runtime facade for the Sable in-process debugger.
//!
//! `sable-dap` consumes this crate to observe (and minimally perturb) the
//! embedding script VM: hook events, instruction patching, weak/strong object
//! liveness, call-stack enumeration, and expression evaluation.
//!
//! The debugger never interprets bytecode itself. Everything it knows about
//! the debuggee arrives through [`HostRuntime`] and [`Evaluator`], which are
//! deliberately mock-friendly: [`MockHost`] and [`MockEvaluator`] are
//! deterministic in-memory implementations used throughout the test suites.

mod mock;

use thiserror::Error;

pub use mock::{MockEvaluator, MockFunction, MockHost, MockObject};

pub type ThreadId = u64;
pub type ObjectId = u64;
pub type FunctionId = u64;

/// Handle to a condition/log expression compiled by the host's [`Evaluator`].
pub type ExprId = u32;

/// Category of a heap object, as reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    Array,
    Instance,
    Function,
    Other,
}

/// Reference to a debuggee heap object.
///
/// Carrying the `ObjectId` alone; liveness must be re-checked through
/// [`HostRuntime::is_object_live`] before every use.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub runtime_type: String,
}

/// Dynamic value of the debugged language, as a closed sum type.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(ObjectRef),
}

impl Value {
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Object(obj) => Some(obj.id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view used by ordered watch comparators. Non-numbers compare
    /// as absent.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Object(obj) => obj.runtime_type.as_str(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Object(obj) => write!(f, "{}@0x{:x}", obj.runtime_type, obj.id),
        }
    }
}

/// One host instruction, opaque to the debugger except for the trap sentinel.
///
/// The debugger saves instructions verbatim, overwrites them with
/// [`Instruction::TRAP`], and later restores the exact original bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub operands: [i32; 3],
}

impl Instruction {
    /// Sentinel the host recognizes as "always raise a Line hook here".
    pub const TRAP: Instruction = Instruction {
        opcode: 0xff,
        operands: [0; 3],
    };

    pub fn new(opcode: u8, operands: [i32; 3]) -> Self {
        Self { opcode, operands }
    }

    pub fn is_trap(&self) -> bool {
        *self == Self::TRAP
    }
}

/// Why the host invoked the debugger's hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    Call,
    Return,
    Line,
    /// A script error is propagating. Used by exception breakpoints only.
    Error,
}

/// Where a hook fired.
#[derive(Clone, Debug, PartialEq)]
pub struct HookLocation {
    pub function: FunctionId,
    pub instruction: u32,
    pub source: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
}

/// One frame of a thread's call stack.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub function: FunctionId,
    pub name: String,
    pub instruction: u32,
    pub source: Option<String>,
    pub line: u32,
}

/// Entry of a function's line-number table, sorted by instruction index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineEntry {
    pub instruction: u32,
    pub line: u32,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid object id {0}")]
    InvalidObject(ObjectId),
    #[error("invalid function id {0}")]
    InvalidFunction(FunctionId),
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("no frame {0} on the current stack")]
    InvalidFrame(usize),
    #[error("no stack slot {slot} in frame {frame}")]
    NoSuchSlot { frame: usize, slot: u32 },
    #[error("no field `{0}`")]
    NoSuchField(String),
    #[error("instruction index {index} out of range for function {function}")]
    InvalidInstruction { function: FunctionId, index: u32 },
    #[error("function has no line metadata")]
    NoLineMetadata,
    #[error("operation not supported by this host")]
    NotSupported,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error, Clone)]
pub enum EvalError {
    #[error("compile error: {0}")]
    Compile(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("evaluation is not supported by this host")]
    NotSupported,
}

/// Minimal, mock-friendly interface to the embedding VM.
///
/// The host invokes the debugger synchronously at call/return/line/error
/// boundaries; everything the debugger does in response flows back through
/// this trait. Implementations are expected to be single-threaded and
/// re-entrancy is the debugger's problem, not the host's.
pub trait HostRuntime {
    fn threads(&self) -> Vec<ThreadInfo>;

    /// Current call stack of `thread`, outermost frame first.
    fn call_stack(&self, thread: ThreadId) -> Result<Vec<FrameInfo>, HostError>;

    /// Current call depth of `thread`; `0` for unknown threads.
    fn call_depth(&self, thread: ThreadId) -> usize;

    fn function_name(&self, function: FunctionId) -> Result<String, HostError>;
    fn function_source(&self, function: FunctionId) -> Result<Option<String>, HostError>;
    fn instruction_count(&self, function: FunctionId) -> Result<u32, HostError>;

    /// Per-instruction source lines; empty when the function was compiled
    /// without line metadata.
    fn line_table(&self, function: FunctionId) -> Result<Vec<LineEntry>, HostError>;

    /// Branch destination of the instruction at `index`, if it is a jump.
    fn jump_target(&self, function: FunctionId, index: u32) -> Result<Option<u32>, HostError>;

    fn read_instruction(&self, function: FunctionId, index: u32)
        -> Result<Instruction, HostError>;
    fn write_instruction(
        &mut self,
        function: FunctionId,
        index: u32,
        instruction: Instruction,
    ) -> Result<(), HostError>;

    /// Whether the function object still exists. Trap restoration against a
    /// collected function must be skipped, not failed.
    fn is_function_live(&self, function: FunctionId) -> bool;

    fn is_object_live(&self, object: ObjectId) -> bool;

    /// Take a strong hold on `object`, preventing collection until the
    /// matching [`release_object`](Self::release_object).
    fn retain_object(&mut self, object: ObjectId) -> Result<(), HostError>;
    fn release_object(&mut self, object: ObjectId) -> Result<(), HostError>;

    fn object_field(&self, object: ObjectId, field: &str) -> Result<Value, HostError>;
    fn set_object_field(
        &mut self,
        object: ObjectId,
        field: &str,
        value: Value,
    ) -> Result<(), HostError>;

    /// Named children of `object` in a host-defined stable order.
    fn object_children(&self, object: ObjectId) -> Result<Vec<(String, Value)>, HostError>;

    /// Read a local slot of frame `frame` (native index, outermost = 0).
    fn stack_slot(&self, thread: ThreadId, frame: usize, slot: u32) -> Result<Value, HostError>;

    /// Named locals of frame `frame`, in slot order.
    fn frame_locals(
        &self,
        thread: ThreadId,
        frame: usize,
    ) -> Result<Vec<(String, Value)>, HostError>;

    /// Instruction range `[start, end)` during which `slot` is declared, if
    /// the compiler recorded one. `None` means the whole function.
    fn slot_range(
        &self,
        _function: FunctionId,
        _slot: u32,
    ) -> Result<Option<(u32, u32)>, HostError> {
        Ok(None)
    }

    fn jump_to_line(&mut self, _thread: ThreadId, _line: u32) -> Result<(), HostError> {
        Err(HostError::NotSupported)
    }

    fn restart_frame(&mut self, _thread: ThreadId, _frame: usize) -> Result<(), HostError> {
        Err(HostError::NotSupported)
    }
}

/// Expression compiler/evaluator for the debugged language.
///
/// Used for breakpoint conditions, log-message interpolation, data watches,
/// and the client's evaluate/setVariable/setExpression requests. Evaluating
/// may itself execute script code; the debug session suppresses its own hook
/// reactions while doing so.
pub trait Evaluator {
    fn compile(&mut self, expression: &str) -> Result<ExprId, EvalError>;

    fn evaluate_compiled(
        &mut self,
        expr: ExprId,
        thread: ThreadId,
        frame: usize,
    ) -> Result<Value, EvalError>;

    fn evaluate(
        &mut self,
        expression: &str,
        thread: ThreadId,
        frame: usize,
    ) -> Result<Value, EvalError>;

    /// Assign `value` to the l-value described by `target`, returning the
    /// value actually stored.
    fn assign(
        &mut self,
        _target: &str,
        _value: Value,
        _thread: ThreadId,
        _frame: usize,
    ) -> Result<Value, EvalError> {
        Err(EvalError::NotSupported)
    }
}
