//! Per-function compilation state.
//!
//! One [`FunctionState`] exists per nested function body currently being
//! parsed; [`crate::Compiler`] keeps them in a stack (outermost chunk at
//! index 0) so name resolution can walk enclosing functions without a
//! parent pointer. This is the direct counterpart of RocketVM's `Function`
//! struct, translated from fixed-size C arrays (`local[LUAI_MAXVARS]`,
//! `upValue[LUAI_MAXUPVALUES]`) to growable `Vec`s with an explicit
//! capacity check at the point registers or locals are allocated.

use ember_gc::Gc;
use ember_value::{Instruction, Opcode, Prototype, UpvalDesc, UpvalSource, Value};

/// A declared local variable and the register it occupies.
struct LocalVar {
    name: String,
    register: u8,
}

/// A lexical block: `do...end`, a loop body, or an `if` arm.
pub struct Block {
    /// Number of committed locals when the block was entered; on exit,
    /// locals declared inside the block go out of scope.
    pub first_local: usize,
    /// Register watermark when the block was entered; used both to free
    /// registers on exit and to decide which open upvalues a `Close`
    /// emitted on exit must cover.
    pub first_register: u8,
    /// Whether `break` is legal directly inside this block (loop bodies).
    pub breakable: bool,
    /// Head of the jump list for `break` statements targeting this block.
    pub break_jumps: i32,
}

/// Maximum number of registers a single function may use; the `A`/`B`/`C`
/// operand fields are 8 or 9 bits wide, but registers specifically are
/// addressed through the 8-bit `A` field in `Move`/arithmetic targets, so
/// 255 is the real ceiling regardless of the wider RK-tagged `B`/`C` range.
const MAX_REGISTERS: usize = 255;

/// Maximum number of local variables (including shadowed-but-still-live
/// ones) a single function may declare. RocketVM's `LUAI_MAXVARS`.
const MAX_LOCALS: usize = 200;

/// Maximum number of upvalues a single function may capture.
const MAX_UPVALUES: usize = 60;

pub struct FunctionState {
    pub num_params: u8,
    pub is_vararg: bool,

    pub code: Vec<Instruction>,
    pub line_info: Vec<u32>,

    pub constants: Vec<Value>,
    pub prototypes: Vec<Gc<Prototype>>,
    pub upvalues: Vec<UpvalDesc>,

    locals: Vec<LocalVar>,
    /// Locals `0..num_committed` are visible to name lookup; locals beyond
    /// that are mid-declaration (their initializer is still being parsed,
    /// so e.g. `local x = x` resolves the right-hand `x` to an enclosing
    /// scope rather than the new local).
    num_committed: usize,

    pub blocks: Vec<Block>,

    next_register: u8,
    max_stack_size: u8,

    /// Lowest register ever captured as a `ParentLocal` upvalue by a
    /// nested function, if any. Block/function exit compares this against
    /// the block's `first_register` to decide whether a `Close` is
    /// needed; once registers above it are closed the flag is left in
    /// place; closing is idempotent, so a redundant `Close` is harmless.
    pub captured_floor: Option<u8>,
}

impl FunctionState {
    pub fn new(num_params: u8, is_vararg: bool) -> Self {
        FunctionState {
            num_params,
            is_vararg,
            code: Vec::new(),
            line_info: Vec::new(),
            constants: Vec::new(),
            prototypes: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            num_committed: 0,
            blocks: Vec::new(),
            next_register: num_params,
            max_stack_size: num_params,
            captured_floor: None,
        }
    }

    // -- registers ----------------------------------------------------

    pub fn allocate_register(&mut self) -> Result<u8, String> {
        if self.next_register as usize >= MAX_REGISTERS {
            return Err("function uses too many registers".to_string());
        }
        let reg = self.next_register;
        self.next_register += 1;
        if self.next_register > self.max_stack_size {
            self.max_stack_size = self.next_register;
        }
        Ok(reg)
    }

    pub fn num_registers(&self) -> u8 {
        self.next_register
    }

    /// Lowers the free-register watermark back to `reg`, discarding any
    /// temporaries allocated above it. Never lowers below the first free
    /// register past declared locals.
    pub fn free_registers_to(&mut self, reg: u8) {
        if reg < self.next_register {
            self.next_register = reg;
        }
    }

    // -- locals ---------------------------------------------------------

    /// Declares a new local, returning its register. Not visible to name
    /// lookup until [`FunctionState::commit_locals`] runs.
    pub fn add_local(&mut self, name: &str) -> Result<u8, String> {
        if self.locals.len() >= MAX_LOCALS {
            return Err("too many local variables in function".to_string());
        }
        let register = self.allocate_register()?;
        self.locals.push(LocalVar {
            name: name.to_string(),
            register,
        });
        Ok(register)
    }

    /// Binds `name` to a register that's already reserved -- used when a
    /// `local` statement's right-hand side was discharged into its target
    /// registers before the names are declared, so there's no register
    /// left to allocate here. Still not visible until
    /// [`FunctionState::commit_locals`] runs.
    pub fn declare_local_at(&mut self, name: &str, register: u8) -> Result<(), String> {
        if self.locals.len() >= MAX_LOCALS {
            return Err("too many local variables in function".to_string());
        }
        self.locals.push(LocalVar {
            name: name.to_string(),
            register,
        });
        Ok(())
    }

    pub fn commit_locals(&mut self) {
        self.num_committed = self.locals.len();
    }

    /// Number of locals currently committed (visible).
    pub fn committed_count(&self) -> usize {
        self.num_committed
    }

    /// Drops locals back to `count`, lowering the register watermark to
    /// just past the last surviving local (or past the parameters if none
    /// remain).
    pub fn truncate_locals(&mut self, count: usize) {
        self.locals.truncate(count);
        self.num_committed = self.num_committed.min(count);
        let floor = self
            .locals
            .last()
            .map(|l| l.register + 1)
            .unwrap_or(self.num_params);
        self.free_registers_to(floor);
    }

    pub fn find_local(&self, name: &str) -> Option<u8> {
        self.locals[..self.num_committed]
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| l.register)
    }

    // -- upvalues ---------------------------------------------------------

    pub fn find_upvalue(&self, name: &str) -> Option<u32> {
        self.upvalues
            .iter()
            .position(|u| u.name == name)
            .map(|i| i as u32)
    }

    pub fn add_upvalue(&mut self, name: &str, source: UpvalSource) -> Result<u32, String> {
        if let Some(idx) = self.find_upvalue(name) {
            return Ok(idx);
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("too many upvalues in function".to_string());
        }
        if let UpvalSource::ParentLocal(reg) = source {
            let reg = reg as u8;
            self.captured_floor = Some(match self.captured_floor {
                Some(f) => f.min(reg),
                None => reg,
            });
        }
        self.upvalues.push(UpvalDesc {
            name: name.to_string(),
            source,
        });
        Ok((self.upvalues.len() - 1) as u32)
    }

    // -- constants ---------------------------------------------------------

    /// Interns `value` into the constant table, deduplicating by value
    /// equality (identical for primitives, pointer identity for the
    /// already-interned strings the lexer/parser produce).
    pub fn add_constant(&mut self, value: Value) -> u32 {
        if let Some(idx) = self.constants.iter().position(|v| v == &value) {
            return idx as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    // -- instruction emission ---------------------------------------------

    pub fn emit_abc(&mut self, op: Opcode, a: u32, b: u32, c: u32, line: u32) -> usize {
        self.code.push(Instruction::abc(op, a, b, c));
        self.line_info.push(line);
        self.code.len() - 1
    }

    pub fn emit_abx(&mut self, op: Opcode, a: u32, bx: u32, line: u32) -> usize {
        self.code.push(Instruction::abx(op, a, bx));
        self.line_info.push(line);
        self.code.len() - 1
    }

    pub fn emit_asbx(&mut self, op: Opcode, a: u32, sbx: i32, line: u32) -> usize {
        self.code.push(Instruction::asbx(op, a, sbx));
        self.line_info.push(line);
        self.code.len() - 1
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    // -- blocks ---------------------------------------------------------

    pub fn begin_block(&mut self, breakable: bool) {
        self.blocks.push(Block {
            first_local: self.num_committed,
            first_register: self.next_register,
            breakable,
            break_jumps: crate::jump::NO_JUMP,
        });
    }

    /// Pops the current block, closing upvalues captured from registers
    /// going out of scope and returning the (already-patched) break-jump
    /// list so callers of a loop's block can drop it (non-loop blocks
    /// never have a non-empty break list, since `break` always targets
    /// the innermost breakable block directly).
    pub fn end_block(&mut self, line: u32) -> i32 {
        let block = self.blocks.pop().expect("end_block without begin_block");
        if let Some(floor) = self.captured_floor {
            if floor >= block.first_register {
                self.emit_abc(Opcode::Close, block.first_register as u32, 0, 0, line);
            }
        }
        self.truncate_locals(block.first_local);
        block.break_jumps
    }

    pub fn break_block(&mut self, line: u32) -> Result<(), String> {
        let target = self
            .blocks
            .iter()
            .rposition(|b| b.breakable)
            .ok_or_else(|| "'break' outside a loop".to_string())?;
        let jump = crate::jump::emit(&mut self.code, &mut self.line_info, line);
        let block = &mut self.blocks[target];
        block.break_jumps = crate::jump::concat(&mut self.code, block.break_jumps, jump);
        Ok(())
    }

    // -- finalization ---------------------------------------------------

    pub fn into_prototype(self, source_name: String) -> Prototype {
        Prototype {
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_stack_size,
            code: self.code,
            constants: self.constants,
            prototypes: self.prototypes,
            upvalues: self.upvalues,
            line_info: self.line_info,
            source_name,
        }
    }
}
