//! Save/patch/restore of host instructions.
//!
//! The host only raises hooks at call/return/line boundaries, so to stop at
//! an exact future instruction the engine overwrites that instruction with
//! the trap sentinel and puts the original bytes back afterwards. Because
//! the line table cannot evaluate branch conditions, both the fallthrough
//! path and every branch-taken path between here and the next statement get
//! armed.

use sable_host::{FunctionId, HostError, HostRuntime, Instruction};

#[derive(Clone, Debug)]
struct InstructionTrap {
    function: FunctionId,
    index: u32,
    saved: Instruction,
}

#[derive(Default)]
pub struct InstructionTrapTable {
    traps: Vec<InstructionTrap>,
}

impl InstructionTrapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.traps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.traps.len()
    }

    pub fn is_armed(&self, function: FunctionId, index: u32) -> bool {
        self.traps
            .iter()
            .any(|t| t.function == function && t.index == index)
    }

    /// Patch a trap at `(function, index)`, saving the original instruction.
    /// At most one trap exists per location; re-arming is a no-op.
    pub fn arm<H: HostRuntime>(
        &mut self,
        host: &mut H,
        function: FunctionId,
        index: u32,
    ) -> Result<(), HostError> {
        if self.is_armed(function, index) {
            return Ok(());
        }
        let saved = host.read_instruction(function, index)?;
        debug_assert!(!saved.is_trap(), "double-patching instruction {function}:{index}");
        host.write_instruction(function, index, Instruction::TRAP)?;
        self.traps.push(InstructionTrap {
            function,
            index,
            saved,
        });
        Ok(())
    }

    /// Arm the immediate successors of the instruction at `index`: its
    /// fallthrough neighbor plus its branch destination, if it has one.
    pub fn arm_instruction_successors<H: HostRuntime>(
        &mut self,
        host: &mut H,
        function: FunctionId,
        index: u32,
    ) -> Result<(), HostError> {
        if let Some(target) = host.jump_target(function, index)? {
            self.arm(host, function, target)?;
        }
        let next = index + 1;
        if next < host.instruction_count(function)? {
            self.arm(host, function, next)?;
        }
        Ok(())
    }

    /// Arm every instruction execution can reach at the start of the next
    /// source statement: the first instruction on a different line, plus the
    /// branch destination of every jump in between.
    ///
    /// Returns `false` when the function carries no line metadata, in which
    /// case trap-based stepping is unavailable and the caller must fall back
    /// to coarser granularity.
    pub fn arm_statement_successors<H: HostRuntime>(
        &mut self,
        host: &mut H,
        function: FunctionId,
        index: u32,
    ) -> Result<bool, HostError> {
        let table = host.line_table(function)?;
        if table.is_empty() {
            return Ok(false);
        }

        let current_line = table
            .iter()
            .take_while(|e| e.instruction <= index)
            .last()
            .map(|e| e.line);
        let boundary = table
            .iter()
            .find(|e| e.instruction > index && Some(e.line) != current_line)
            .map(|e| e.instruction);

        // No later statement: the frame will exit through a return hook.
        let end = match boundary {
            Some(instruction) => instruction,
            None => host.instruction_count(function)?,
        };

        for i in index..end {
            if let Some(target) = host.jump_target(function, i)? {
                self.arm(host, function, target)?;
            }
        }
        if let Some(instruction) = boundary {
            self.arm(host, function, instruction)?;
        }
        Ok(true)
    }

    /// Restore every patched instruction to its exact original bytes.
    ///
    /// Restoration against a function the GC collected since arming is
    /// silently skipped; the patched buffer died with the function.
    pub fn restore_all<H: HostRuntime>(&mut self, host: &mut H) {
        for trap in self.traps.drain(..) {
            if !host.is_function_live(trap.function) {
                tracing::debug!(
                    target: "sable.dap",
                    function = trap.function,
                    index = trap.index,
                    "skipping trap restore against collected function"
                );
                continue;
            }
            if let Err(err) = host.write_instruction(trap.function, trap.index, trap.saved) {
                tracing::error!(
                    target: "sable.dap",
                    function = trap.function,
                    index = trap.index,
                    %err,
                    "failed to restore trapped instruction"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_host::{MockFunction, MockHost};

    const FN: FunctionId = 1;

    fn host_with_function(len: u32) -> MockHost {
        let mut host = MockHost::new();
        host.add_function(FN, MockFunction::straight_line("main", "a.sbl", len, 10));
        host
    }

    #[test]
    fn arm_and_restore_roundtrips_instruction_stream() {
        let mut host = host_with_function(6);
        let before = host.function_instructions(FN).unwrap().to_vec();

        let mut traps = InstructionTrapTable::new();
        traps.arm(&mut host, FN, 2).unwrap();
        traps.arm(&mut host, FN, 4).unwrap();
        assert!(host.read_instruction(FN, 2).unwrap().is_trap());
        assert!(host.read_instruction(FN, 4).unwrap().is_trap());

        traps.restore_all(&mut host);
        assert_eq!(host.function_instructions(FN).unwrap(), before.as_slice());
        assert!(traps.is_empty());
    }

    #[test]
    fn rearming_a_location_keeps_the_original_bytes() {
        let mut host = host_with_function(3);
        let original = host.read_instruction(FN, 1).unwrap();

        let mut traps = InstructionTrapTable::new();
        traps.arm(&mut host, FN, 1).unwrap();
        traps.arm(&mut host, FN, 1).unwrap();

        traps.restore_all(&mut host);
        assert_eq!(host.read_instruction(FN, 1).unwrap(), original);
    }

    #[test]
    fn statement_successors_include_branch_targets() {
        let mut host = MockHost::new();
        let mut function = MockFunction::straight_line("loopy", "a.sbl", 8, 10);
        // Instructions 0..=2 share line 10; a conditional jump at 1 targets 6.
        for i in 0..3 {
            function.line_table[i].line = 10;
        }
        function.jump_targets.insert(1, 6);
        host.add_function(FN, function);

        let mut traps = InstructionTrapTable::new();
        assert!(traps
            .arm_statement_successors(&mut host, FN, 0)
            .unwrap());

        // Next statement starts at 3; branch-taken path lands on 6.
        assert!(traps.is_armed(FN, 3));
        assert!(traps.is_armed(FN, 6));
        assert!(!traps.is_armed(FN, 1));
    }

    #[test]
    fn no_line_metadata_reports_unsteppable() {
        let mut host = MockHost::new();
        let mut function = MockFunction::straight_line("opaque", "a.sbl", 4, 1);
        function.line_table.clear();
        host.add_function(FN, function);

        let mut traps = InstructionTrapTable::new();
        assert!(!traps
            .arm_statement_successors(&mut host, FN, 0)
            .unwrap());
        assert!(traps.is_empty());
    }

    #[test]
    fn restore_against_collected_function_is_a_noop() {
        let mut host = host_with_function(3);
        let mut traps = InstructionTrapTable::new();
        traps.arm(&mut host, FN, 1).unwrap();

        host.collect_function(FN);
        traps.restore_all(&mut host);
        assert!(traps.is_empty());
    }

    #[test]
    fn instruction_successors_arm_both_paths() {
        let mut host = MockHost::new();
        let mut function = MockFunction::straight_line("branchy", "a.sbl", 5, 1);
        function.jump_targets.insert(2, 4);
        host.add_function(FN, function);

        let mut traps = InstructionTrapTable::new();
        traps.arm_instruction_successors(&mut host, FN, 2).unwrap();
        assert!(traps.is_armed(FN, 3));
        assert!(traps.is_armed(FN, 4));
    }
}
