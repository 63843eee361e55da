use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    EvalError, Evaluator, ExprId, FrameInfo, FunctionId, HostError, HostRuntime, Instruction,
    LineEntry, ObjectId, ThreadId, ThreadInfo, Value,
};

/// Scripted function body: instructions plus the metadata the debugger reads.
#[derive(Clone, Debug)]
pub struct MockFunction {
    pub name: String,
    pub source: Option<String>,
    pub instructions: Vec<Instruction>,
    pub line_table: Vec<LineEntry>,
    pub jump_targets: HashMap<u32, u32>,
    pub slot_ranges: HashMap<u32, (u32, u32)>,
}

impl MockFunction {
    /// A straight-line function of `len` no-op instructions with one source
    /// line per instruction starting at `first_line`.
    pub fn straight_line(name: &str, source: &str, len: u32, first_line: u32) -> Self {
        Self {
            name: name.to_string(),
            source: Some(source.to_string()),
            instructions: (0..len).map(|i| Instruction::new(1, [i as i32, 0, 0])).collect(),
            line_table: (0..len)
                .map(|i| LineEntry {
                    instruction: i,
                    line: first_line + i,
                })
                .collect(),
            jump_targets: HashMap::new(),
            slot_ranges: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockObject {
    pub kind: crate::ObjectKind,
    pub runtime_type: String,
    pub fields: Vec<(String, Value)>,
}

impl MockObject {
    pub fn table(runtime_type: &str, fields: Vec<(&str, Value)>) -> Self {
        Self {
            kind: crate::ObjectKind::Table,
            runtime_type: runtime_type.to_string(),
            fields: fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }
}

/// Deterministic, in-memory host VM test double.
///
/// Tests script functions, objects, and thread stacks up front, then drive
/// the debugger's hook entrypoints by hand while mutating this state.
#[derive(Default)]
pub struct MockHost {
    functions: HashMap<FunctionId, MockFunction>,
    objects: HashMap<ObjectId, MockObject>,
    retain_counts: HashMap<ObjectId, u32>,
    threads: Vec<ThreadInfo>,
    stacks: HashMap<ThreadId, Vec<FrameInfo>>,
    pub retain_calls: Vec<ObjectId>,
    pub release_calls: Vec<ObjectId>,
    pub jump_calls: Vec<(ThreadId, u32)>,
    pub restart_calls: Vec<(ThreadId, usize)>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, id: FunctionId, function: MockFunction) {
        self.functions.insert(id, function);
    }

    /// Simulate the GC collecting a function object.
    pub fn collect_function(&mut self, id: FunctionId) {
        self.functions.remove(&id);
    }

    pub fn insert_object(&mut self, id: ObjectId, object: MockObject) {
        self.objects.insert(id, object);
    }

    /// Simulate the GC collecting `id`. Panics if the debugger still holds a
    /// strong reference, which would be a refcounting bug.
    pub fn collect_object(&mut self, id: ObjectId) {
        assert_eq!(
            self.retain_counts.get(&id).copied().unwrap_or(0),
            0,
            "collecting object {id} while the debugger holds a strong reference"
        );
        self.objects.remove(&id);
    }

    pub fn retain_count(&self, id: ObjectId) -> u32 {
        self.retain_counts.get(&id).copied().unwrap_or(0)
    }

    pub fn set_field(&mut self, id: ObjectId, field: &str, value: Value) {
        let obj = self.objects.get_mut(&id).expect("unknown mock object");
        match obj.fields.iter_mut().find(|(name, _)| name == field) {
            Some((_, slot)) => *slot = value,
            None => obj.fields.push((field.to_string(), value)),
        }
    }

    pub fn set_threads(&mut self, threads: Vec<ThreadInfo>) {
        self.threads = threads;
    }

    pub fn set_stack(&mut self, thread: ThreadId, frames: Vec<FrameInfo>) {
        self.stacks.insert(thread, frames);
    }

    pub fn push_frame(&mut self, thread: ThreadId, frame: FrameInfo) {
        self.stacks.entry(thread).or_default().push(frame);
    }

    pub fn pop_frame(&mut self, thread: ThreadId) {
        if let Some(stack) = self.stacks.get_mut(&thread) {
            stack.pop();
        }
    }

    /// Advance the innermost frame of `thread` to `(instruction, line)`.
    pub fn advance_top_frame(&mut self, thread: ThreadId, instruction: u32, line: u32) {
        if let Some(frame) = self.stacks.get_mut(&thread).and_then(|s| s.last_mut()) {
            frame.instruction = instruction;
            frame.line = line;
        }
    }

    pub fn function_instructions(&self, id: FunctionId) -> Option<&[Instruction]> {
        self.functions.get(&id).map(|f| f.instructions.as_slice())
    }

    fn function(&self, id: FunctionId) -> Result<&MockFunction, HostError> {
        self.functions.get(&id).ok_or(HostError::InvalidFunction(id))
    }
}

impl HostRuntime for MockHost {
    fn threads(&self) -> Vec<ThreadInfo> {
        self.threads.clone()
    }

    fn call_stack(&self, thread: ThreadId) -> Result<Vec<FrameInfo>, HostError> {
        self.stacks
            .get(&thread)
            .cloned()
            .ok_or(HostError::UnknownThread(thread))
    }

    fn call_depth(&self, thread: ThreadId) -> usize {
        self.stacks.get(&thread).map(Vec::len).unwrap_or(0)
    }

    fn function_name(&self, function: FunctionId) -> Result<String, HostError> {
        Ok(self.function(function)?.name.clone())
    }

    fn function_source(&self, function: FunctionId) -> Result<Option<String>, HostError> {
        Ok(self.function(function)?.source.clone())
    }

    fn instruction_count(&self, function: FunctionId) -> Result<u32, HostError> {
        Ok(self.function(function)?.instructions.len() as u32)
    }

    fn line_table(&self, function: FunctionId) -> Result<Vec<LineEntry>, HostError> {
        Ok(self.function(function)?.line_table.clone())
    }

    fn jump_target(&self, function: FunctionId, index: u32) -> Result<Option<u32>, HostError> {
        Ok(self.function(function)?.jump_targets.get(&index).copied())
    }

    fn read_instruction(
        &self,
        function: FunctionId,
        index: u32,
    ) -> Result<Instruction, HostError> {
        self.function(function)?
            .instructions
            .get(index as usize)
            .copied()
            .ok_or(HostError::InvalidInstruction { function, index })
    }

    fn write_instruction(
        &mut self,
        function: FunctionId,
        index: u32,
        instruction: Instruction,
    ) -> Result<(), HostError> {
        let f = self
            .functions
            .get_mut(&function)
            .ok_or(HostError::InvalidFunction(function))?;
        match f.instructions.get_mut(index as usize) {
            Some(slot) => {
                *slot = instruction;
                Ok(())
            }
            None => Err(HostError::InvalidInstruction { function, index }),
        }
    }

    fn is_function_live(&self, function: FunctionId) -> bool {
        self.functions.contains_key(&function)
    }

    fn is_object_live(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    fn retain_object(&mut self, object: ObjectId) -> Result<(), HostError> {
        if !self.objects.contains_key(&object) {
            return Err(HostError::InvalidObject(object));
        }
        *self.retain_counts.entry(object).or_insert(0) += 1;
        self.retain_calls.push(object);
        Ok(())
    }

    fn release_object(&mut self, object: ObjectId) -> Result<(), HostError> {
        let count = self
            .retain_counts
            .get_mut(&object)
            .ok_or(HostError::InvalidObject(object))?;
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.retain_counts.remove(&object);
        }
        self.release_calls.push(object);
        Ok(())
    }

    fn object_field(&self, object: ObjectId, field: &str) -> Result<Value, HostError> {
        let obj = self
            .objects
            .get(&object)
            .ok_or(HostError::InvalidObject(object))?;
        obj.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| HostError::NoSuchField(field.to_string()))
    }

    fn set_object_field(
        &mut self,
        object: ObjectId,
        field: &str,
        value: Value,
    ) -> Result<(), HostError> {
        if !self.objects.contains_key(&object) {
            return Err(HostError::InvalidObject(object));
        }
        self.set_field(object, field, value);
        Ok(())
    }

    fn object_children(&self, object: ObjectId) -> Result<Vec<(String, Value)>, HostError> {
        self.objects
            .get(&object)
            .map(|o| o.fields.clone())
            .ok_or(HostError::InvalidObject(object))
    }

    fn stack_slot(&self, thread: ThreadId, frame: usize, slot: u32) -> Result<Value, HostError> {
        let locals = self.frame_locals(thread, frame)?;
        locals
            .get(slot as usize)
            .map(|(_, value)| value.clone())
            .ok_or(HostError::NoSuchSlot { frame, slot })
    }

    fn frame_locals(
        &self,
        thread: ThreadId,
        frame: usize,
    ) -> Result<Vec<(String, Value)>, HostError> {
        let stack = self
            .stacks
            .get(&thread)
            .ok_or(HostError::UnknownThread(thread))?;
        let info = stack.get(frame).ok_or(HostError::InvalidFrame(frame))?;
        // Mock convention: a frame's locals live on a table object whose id
        // equals the function id, when one exists.
        match self.objects.get(&info.function) {
            Some(obj) => Ok(obj.fields.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn slot_range(
        &self,
        function: FunctionId,
        slot: u32,
    ) -> Result<Option<(u32, u32)>, HostError> {
        Ok(self.function(function)?.slot_ranges.get(&slot).copied())
    }

    fn jump_to_line(&mut self, thread: ThreadId, line: u32) -> Result<(), HostError> {
        self.jump_calls.push((thread, line));
        Ok(())
    }

    fn restart_frame(&mut self, thread: ThreadId, frame: usize) -> Result<(), HostError> {
        self.restart_calls.push((thread, frame));
        Ok(())
    }
}

/// Scripted expression evaluator.
///
/// Results are queued per expression text; a queued result is consumed by one
/// evaluation, after which the optional fixed fallback applies.
#[derive(Default)]
pub struct MockEvaluator {
    next_expr: ExprId,
    compiled: HashMap<ExprId, String>,
    compile_failures: HashSet<String>,
    queued: HashMap<String, VecDeque<Result<Value, EvalError>>>,
    fixed: HashMap<String, Value>,
    pub assignments: Vec<(String, Value)>,
}

impl MockEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_compile(&mut self, expression: impl Into<String>) {
        self.compile_failures.insert(expression.into());
    }

    pub fn push_result(
        &mut self,
        expression: impl Into<String>,
        result: Result<Value, EvalError>,
    ) {
        self.queued
            .entry(expression.into())
            .or_default()
            .push_back(result);
    }

    /// Fallback result returned whenever no queued result remains.
    pub fn set_result(&mut self, expression: impl Into<String>, value: Value) {
        self.fixed.insert(expression.into(), value);
    }
}

impl Evaluator for MockEvaluator {
    fn compile(&mut self, expression: &str) -> Result<ExprId, EvalError> {
        if self.compile_failures.contains(expression) {
            return Err(EvalError::Compile(format!(
                "cannot compile `{expression}`"
            )));
        }
        self.next_expr += 1;
        self.compiled.insert(self.next_expr, expression.to_string());
        Ok(self.next_expr)
    }

    fn evaluate_compiled(
        &mut self,
        expr: ExprId,
        thread: ThreadId,
        frame: usize,
    ) -> Result<Value, EvalError> {
        let Some(text) = self.compiled.get(&expr).cloned() else {
            return Err(EvalError::Runtime(format!("unknown expression id {expr}")));
        };
        self.evaluate(&text, thread, frame)
    }

    fn evaluate(
        &mut self,
        expression: &str,
        _thread: ThreadId,
        _frame: usize,
    ) -> Result<Value, EvalError> {
        if let Some(result) = self
            .queued
            .get_mut(expression)
            .and_then(|queue| queue.pop_front())
        {
            return result;
        }
        match self.fixed.get(expression) {
            Some(value) => Ok(value.clone()),
            None => Err(EvalError::Runtime(format!(
                "no mock result for `{expression}`"
            ))),
        }
    }

    fn assign(
        &mut self,
        target: &str,
        value: Value,
        _thread: ThreadId,
        _frame: usize,
    ) -> Result<Value, EvalError> {
        self.assignments.push((target.to_string(), value.clone()));
        self.fixed.insert(target.to_string(), value.clone());
        Ok(value)
    }
}
