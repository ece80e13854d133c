//! # ASTC container
//!
//! The linear, serialized form of a bytecode program: a fixed header
//! followed by a tightly packed instruction stream. This crate owns both
//! the [`Instruction`]/[`Opcode`] vocabulary (shared by the emitter that
//! produces a [`Program`] and the VM that executes one) and the on-disk
//! reader/writer for it.
//!
//! Layout (little-endian, matches spec.md §6):
//!
//! ```text
//! magic       "ASTC"   (4 bytes)
//! version     u32 = 1
//! flags       u32
//! entry_point u32      instruction index
//! count       u32      instruction count
//! code_size   u32      byte length of the instruction stream that follows
//! instructions[count]
//! ```

use std::fmt;
use std::io::{self, Read, Write};

pub const MAGIC: [u8; 4] = *b"ASTC";
pub const VERSION: u32 = 1;

/// Operation width for width-tagged arithmetic/comparison opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Width {
    I32 = 0,
    I64 = 1,
    U32 = 2,
    U64 = 3,
}

impl Width {
    fn from_u8(v: u8) -> Result<Self, AstcFormatError> {
        match v {
            0 => Ok(Width::I32),
            1 => Ok(Width::I64),
            2 => Ok(Width::U32),
            3 => Ok(Width::U64),
            other => Err(AstcFormatError::InvalidFormat(format!("unknown width tag {other}"))),
        }
    }
}

/// Which relation a `TEST` reduces the flags most recently set by `CMP`
/// down to a single stack boolean for. `CMP` alone only sets
/// {zero, negative, carry, overflow}; `TEST` needs to know which of the six
/// C relational operators those flags answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Relation {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
}

impl Relation {
    fn from_u8(v: u8) -> Result<Self, AstcFormatError> {
        match v {
            0 => Ok(Relation::Eq),
            1 => Ok(Relation::Ne),
            2 => Ok(Relation::Lt),
            3 => Ok(Relation::Le),
            4 => Ok(Relation::Gt),
            5 => Ok(Relation::Ge),
            other => Err(AstcFormatError::InvalidFormat(format!("unknown relation tag {other}"))),
        }
    }
}

/// The closed opcode enumeration. Values are stable and part of the v1
/// on-disk format — never renumber an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Halt = 1,
    Jump = 2,
    JumpIf = 3,
    JumpIfFalse = 4,
    Call = 5,
    Return = 6,
    LoadImm = 7,
    LoadReg = 8,
    StoreReg = 9,
    Move = 10,
    LocalGet = 11,
    LocalSet = 12,
    Drop = 13,
    I32Const = 14,
    I64Const = 15,
    Add = 16,
    Sub = 17,
    Mul = 18,
    Div = 19,
    Mod = 20,
    And = 21,
    Or = 22,
    Xor = 23,
    Not = 24,
    Shl = 25,
    Shr = 26,
    Cmp = 27,
    Test = 28,
    Push = 29,
    Pop = 30,
    Syscall = 31,
    Print = 32,
    Malloc = 33,
    Free = 34,
    LibcCall = 35,
    Exit = 36,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        let op = match v {
            0 => Nop,
            1 => Halt,
            2 => Jump,
            3 => JumpIf,
            4 => JumpIfFalse,
            5 => Call,
            6 => Return,
            7 => LoadImm,
            8 => LoadReg,
            9 => StoreReg,
            10 => Move,
            11 => LocalGet,
            12 => LocalSet,
            13 => Drop,
            14 => I32Const,
            15 => I64Const,
            16 => Add,
            17 => Sub,
            18 => Mul,
            19 => Div,
            20 => Mod,
            21 => And,
            22 => Or,
            23 => Xor,
            24 => Not,
            25 => Shl,
            26 => Shr,
            27 => Cmp,
            28 => Test,
            29 => Push,
            30 => Pop,
            31 => Syscall,
            32 => Print,
            33 => Malloc,
            34 => Free,
            35 => LibcCall,
            36 => Exit,
            _ => return None,
        };
        Some(op)
    }
}

/// A single instruction: opcode plus its typed operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Nop,
    Halt,
    /// Branch target is an instruction index.
    Jump(u32),
    JumpIf(u32),
    JumpIfFalse(u32),
    /// `target` is the callee's entry instruction index; `argc` is how many
    /// values the caller has already pushed (left-to-right) and that the VM
    /// must pop into the new frame's locals 0..argc before jumping.
    Call { target: u32, argc: u16 },
    Return,
    LoadImm { reg: u8, imm: i64 },
    LoadReg { reg: u8 },
    StoreReg { reg: u8 },
    Move { dst: u8, src: u8 },
    LocalGet(u32),
    LocalSet(u32),
    Drop,
    I32Const(i32),
    I64Const(i64),
    Add(Width),
    Sub(Width),
    Mul(Width),
    Div(Width),
    Mod(Width),
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Cmp(Width),
    Test(Relation),
    Push(i64),
    Pop,
    Syscall(u32),
    Print,
    Malloc,
    Free,
    LibcCall { func_id: u16, argc: u16 },
    Exit,
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Nop => Opcode::Nop,
            Instruction::Halt => Opcode::Halt,
            Instruction::Jump(_) => Opcode::Jump,
            Instruction::JumpIf(_) => Opcode::JumpIf,
            Instruction::JumpIfFalse(_) => Opcode::JumpIfFalse,
            Instruction::Call { .. } => Opcode::Call,
            Instruction::Return => Opcode::Return,
            Instruction::LoadImm { .. } => Opcode::LoadImm,
            Instruction::LoadReg { .. } => Opcode::LoadReg,
            Instruction::StoreReg { .. } => Opcode::StoreReg,
            Instruction::Move { .. } => Opcode::Move,
            Instruction::LocalGet(_) => Opcode::LocalGet,
            Instruction::LocalSet(_) => Opcode::LocalSet,
            Instruction::Drop => Opcode::Drop,
            Instruction::I32Const(_) => Opcode::I32Const,
            Instruction::I64Const(_) => Opcode::I64Const,
            Instruction::Add(_) => Opcode::Add,
            Instruction::Sub(_) => Opcode::Sub,
            Instruction::Mul(_) => Opcode::Mul,
            Instruction::Div(_) => Opcode::Div,
            Instruction::Mod(_) => Opcode::Mod,
            Instruction::And => Opcode::And,
            Instruction::Or => Opcode::Or,
            Instruction::Xor => Opcode::Xor,
            Instruction::Not => Opcode::Not,
            Instruction::Shl => Opcode::Shl,
            Instruction::Shr => Opcode::Shr,
            Instruction::Cmp(_) => Opcode::Cmp,
            Instruction::Test(_) => Opcode::Test,
            Instruction::Push(_) => Opcode::Push,
            Instruction::Pop => Opcode::Pop,
            Instruction::Syscall(_) => Opcode::Syscall,
            Instruction::Print => Opcode::Print,
            Instruction::Malloc => Opcode::Malloc,
            Instruction::Free => Opcode::Free,
            Instruction::LibcCall { .. } => Opcode::LibcCall,
            Instruction::Exit => Opcode::Exit,
        }
    }

    /// The instruction index a branch-carrying instruction targets, if any.
    pub fn branch_target(&self) -> Option<u32> {
        match *self {
            Instruction::Jump(t) | Instruction::JumpIf(t) | Instruction::JumpIfFalse(t) => Some(t),
            Instruction::Call { target, .. } => Some(target),
            _ => None,
        }
    }

    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&[self.opcode() as u8])?;
        match *self {
            Instruction::Nop
            | Instruction::Halt
            | Instruction::Return
            | Instruction::Drop
            | Instruction::And
            | Instruction::Or
            | Instruction::Xor
            | Instruction::Not
            | Instruction::Shl
            | Instruction::Shr
            | Instruction::Pop
            | Instruction::Print
            | Instruction::Malloc
            | Instruction::Free
            | Instruction::Exit => {}
            Instruction::Jump(t) | Instruction::JumpIf(t) | Instruction::JumpIfFalse(t) => {
                w.write_all(&t.to_le_bytes())?;
            }
            Instruction::Call { target, argc } => {
                w.write_all(&target.to_le_bytes())?;
                w.write_all(&argc.to_le_bytes())?;
            }
            Instruction::Test(relation) => {
                w.write_all(&[relation as u8])?;
            }
            Instruction::LoadImm { reg, imm } => {
                w.write_all(&[reg])?;
                w.write_all(&imm.to_le_bytes())?;
            }
            Instruction::LoadReg { reg } | Instruction::StoreReg { reg } => {
                w.write_all(&[reg])?;
            }
            Instruction::Move { dst, src } => {
                w.write_all(&[dst, src])?;
            }
            Instruction::LocalGet(i) | Instruction::LocalSet(i) => {
                w.write_all(&i.to_le_bytes())?;
            }
            Instruction::I32Const(v) => w.write_all(&v.to_le_bytes())?,
            Instruction::I64Const(v) | Instruction::Push(v) => w.write_all(&v.to_le_bytes())?,
            Instruction::Add(width)
            | Instruction::Sub(width)
            | Instruction::Mul(width)
            | Instruction::Div(width)
            | Instruction::Mod(width)
            | Instruction::Cmp(width) => {
                w.write_all(&[width as u8])?;
            }
            Instruction::Syscall(id) => w.write_all(&id.to_le_bytes())?,
            Instruction::LibcCall { func_id, argc } => {
                w.write_all(&func_id.to_le_bytes())?;
                w.write_all(&argc.to_le_bytes())?;
            }
        }
        Ok(())
    }

    fn read(r: &mut impl Read) -> Result<Self, AstcFormatError> {
        let mut opbuf = [0u8; 1];
        read_exact_or_truncated(r, &mut opbuf)?;
        let opcode = Opcode::from_u8(opbuf[0])
            .ok_or_else(|| AstcFormatError::InvalidFormat(format!("unknown opcode byte {}", opbuf[0])))?;

        let u32_operand = |r: &mut dyn Read| -> Result<u32, AstcFormatError> {
            let mut b = [0u8; 4];
            read_exact_or_truncated(r, &mut b)?;
            Ok(u32::from_le_bytes(b))
        };
        let i32_operand = |r: &mut dyn Read| -> Result<i32, AstcFormatError> {
            let mut b = [0u8; 4];
            read_exact_or_truncated(r, &mut b)?;
            Ok(i32::from_le_bytes(b))
        };
        let i64_operand = |r: &mut dyn Read| -> Result<i64, AstcFormatError> {
            let mut b = [0u8; 8];
            read_exact_or_truncated(r, &mut b)?;
            Ok(i64::from_le_bytes(b))
        };
        let u8_operand = |r: &mut dyn Read| -> Result<u8, AstcFormatError> {
            let mut b = [0u8; 1];
            read_exact_or_truncated(r, &mut b)?;
            Ok(b[0])
        };
        let u16_operand = |r: &mut dyn Read| -> Result<u16, AstcFormatError> {
            let mut b = [0u8; 2];
            read_exact_or_truncated(r, &mut b)?;
            Ok(u16::from_le_bytes(b))
        };

        Ok(match opcode {
            Opcode::Nop => Instruction::Nop,
            Opcode::Halt => Instruction::Halt,
            Opcode::Jump => Instruction::Jump(u32_operand(r)?),
            Opcode::JumpIf => Instruction::JumpIf(u32_operand(r)?),
            Opcode::JumpIfFalse => Instruction::JumpIfFalse(u32_operand(r)?),
            Opcode::Call => {
                let target = u32_operand(r)?;
                let argc = u16_operand(r)?;
                Instruction::Call { target, argc }
            }
            Opcode::Return => Instruction::Return,
            Opcode::LoadImm => {
                let reg = u8_operand(r)?;
                let imm = i64_operand(r)?;
                Instruction::LoadImm { reg, imm }
            }
            Opcode::LoadReg => Instruction::LoadReg { reg: u8_operand(r)? },
            Opcode::StoreReg => Instruction::StoreReg { reg: u8_operand(r)? },
            Opcode::Move => {
                let dst = u8_operand(r)?;
                let src = u8_operand(r)?;
                Instruction::Move { dst, src }
            }
            Opcode::LocalGet => Instruction::LocalGet(u32_operand(r)?),
            Opcode::LocalSet => Instruction::LocalSet(u32_operand(r)?),
            Opcode::Drop => Instruction::Drop,
            Opcode::I32Const => Instruction::I32Const(i32_operand(r)?),
            Opcode::I64Const => Instruction::I64Const(i64_operand(r)?),
            Opcode::Add => Instruction::Add(Width::from_u8(u8_operand(r)?)?),
            Opcode::Sub => Instruction::Sub(Width::from_u8(u8_operand(r)?)?),
            Opcode::Mul => Instruction::Mul(Width::from_u8(u8_operand(r)?)?),
            Opcode::Div => Instruction::Div(Width::from_u8(u8_operand(r)?)?),
            Opcode::Mod => Instruction::Mod(Width::from_u8(u8_operand(r)?)?),
            Opcode::And => Instruction::And,
            Opcode::Or => Instruction::Or,
            Opcode::Xor => Instruction::Xor,
            Opcode::Not => Instruction::Not,
            Opcode::Shl => Instruction::Shl,
            Opcode::Shr => Instruction::Shr,
            Opcode::Cmp => Instruction::Cmp(Width::from_u8(u8_operand(r)?)?),
            Opcode::Test => Instruction::Test(Relation::from_u8(u8_operand(r)?)?),
            Opcode::Push => Instruction::Push(i64_operand(r)?),
            Opcode::Pop => Instruction::Pop,
            Opcode::Syscall => Instruction::Syscall(u32_operand(r)?),
            Opcode::Print => Instruction::Print,
            Opcode::Malloc => Instruction::Malloc,
            Opcode::Free => Instruction::Free,
            Opcode::LibcCall => {
                let func_id = u16_operand(r)?;
                let argc = u16_operand(r)?;
                Instruction::LibcCall { func_id, argc }
            }
            Opcode::Exit => Instruction::Exit,
        })
    }

    /// Serialized size in bytes (1 opcode byte + operand bytes).
    pub fn encoded_len(&self) -> u32 {
        1 + match self {
            Instruction::Nop
            | Instruction::Halt
            | Instruction::Return
            | Instruction::Drop
            | Instruction::And
            | Instruction::Or
            | Instruction::Xor
            | Instruction::Not
            | Instruction::Shl
            | Instruction::Shr
            | Instruction::Pop
            | Instruction::Print
            | Instruction::Malloc
            | Instruction::Free
            | Instruction::Exit => 0,
            Instruction::Jump(_) | Instruction::JumpIf(_) | Instruction::JumpIfFalse(_) => 4,
            Instruction::Call { .. } => 4 + 2,
            Instruction::LoadImm { .. } => 1 + 8,
            Instruction::LoadReg { .. } | Instruction::StoreReg { .. } => 1,
            Instruction::Move { .. } => 2,
            Instruction::LocalGet(_) | Instruction::LocalSet(_) => 4,
            Instruction::I32Const(_) => 4,
            Instruction::I64Const(_) | Instruction::Push(_) => 8,
            Instruction::Add(_) | Instruction::Sub(_) | Instruction::Mul(_) | Instruction::Div(_) | Instruction::Mod(_) | Instruction::Cmp(_) | Instruction::Test(_) => 1,
            Instruction::Syscall(_) => 4,
            Instruction::LibcCall { .. } => 4,
        }
    }
}

/// The fixed table of host functions a `LibcCall` instruction may name.
/// Lives here rather than in `astc-vm` or `astc-emit` individually: both
/// crates depend on this one but not on each other, and the id numbering is
/// a frozen part of the on-disk/runtime contract, so there must be exactly
/// one definition of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LibcFunction {
    Putchar = 0,
    GetChar = 1,
    Printf = 2,
    Malloc = 3,
    Free = 4,
    Memcpy = 5,
    Memset = 6,
    Strlen = 7,
    Exit = 8,
}

impl LibcFunction {
    pub fn from_u16(id: u16) -> Option<Self> {
        use LibcFunction::*;
        Some(match id {
            0 => Putchar,
            1 => GetChar,
            2 => Printf,
            3 => Malloc,
            4 => Free,
            5 => Memcpy,
            6 => Memset,
            7 => Strlen,
            8 => Exit,
            _ => return None,
        })
    }

    /// Recognize a call target by the bare C name it is invoked under.
    pub fn from_name(name: &str) -> Option<Self> {
        use LibcFunction::*;
        Some(match name {
            "putchar" => Putchar,
            "getchar" => GetChar,
            "printf" => Printf,
            "malloc" => Malloc,
            "free" => Free,
            "memcpy" => Memcpy,
            "memset" => Memset,
            "strlen" => Strlen,
            "exit" => Exit,
            _ => return None,
        })
    }
}

fn read_exact_or_truncated(r: &mut impl Read, buf: &mut [u8]) -> Result<(), AstcFormatError> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => AstcFormatError::Truncated,
        _ => AstcFormatError::Io(e.to_string()),
    })
}

/// A deserialized ASTC program: header fields plus instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub version: u32,
    pub flags: u32,
    pub entry_point: u32,
    pub instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(entry_point: u32, instructions: Vec<Instruction>) -> Self {
        Self { version: VERSION, flags: 0, entry_point, instructions }
    }

    fn code_size(&self) -> u32 {
        self.instructions.iter().map(Instruction::encoded_len).sum()
    }

    /// Every branch target (`Jump`/`JumpIf`/`JumpIfFalse`/`Call`) must land
    /// inside `[0, instructions.len())`, and the entry point must too.
    /// Spec.md assigns checking this to `load_program` time in the VM, but
    /// the check itself is purely a property of the container, so it lives
    /// here for both the VM and tests to call.
    pub fn validate_branches(&self) -> Result<(), AstcFormatError> {
        let count = self.instructions.len() as u32;
        if self.entry_point >= count {
            return Err(AstcFormatError::InvalidFormat(format!(
                "entry point {} is out of range (instruction_count={count})",
                self.entry_point
            )));
        }
        for (i, instr) in self.instructions.iter().enumerate() {
            if let Some(target) = instr.branch_target() {
                if target >= count {
                    return Err(AstcFormatError::InvalidFormat(format!(
                        "instruction {i} branches to out-of-range target {target} (instruction_count={count})"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Errors from reading or writing the ASTC container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AstcFormatError {
    InvalidFormat(String),
    UnsupportedVersion(u32),
    Truncated,
    Io(String),
}

impl fmt::Display for AstcFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AstcFormatError::InvalidFormat(msg) => write!(f, "invalid ASTC format: {msg}"),
            AstcFormatError::UnsupportedVersion(v) => write!(f, "unsupported ASTC version {v}"),
            AstcFormatError::Truncated => write!(f, "truncated ASTC stream"),
            AstcFormatError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for AstcFormatError {}

/// Serialize a program: header, then its instructions, little-endian.
pub fn write_program(w: &mut impl Write, program: &Program) -> Result<(), AstcFormatError> {
    w.write_all(&MAGIC).map_err(|e| AstcFormatError::Io(e.to_string()))?;
    w.write_all(&program.version.to_le_bytes()).map_err(|e| AstcFormatError::Io(e.to_string()))?;
    w.write_all(&program.flags.to_le_bytes()).map_err(|e| AstcFormatError::Io(e.to_string()))?;
    w.write_all(&program.entry_point.to_le_bytes()).map_err(|e| AstcFormatError::Io(e.to_string()))?;
    let count = program.instructions.len() as u32;
    w.write_all(&count.to_le_bytes()).map_err(|e| AstcFormatError::Io(e.to_string()))?;
    w.write_all(&program.code_size().to_le_bytes()).map_err(|e| AstcFormatError::Io(e.to_string()))?;
    for instr in &program.instructions {
        instr.write(w).map_err(|e| AstcFormatError::Io(e.to_string()))?;
    }
    log::debug!("wrote ASTC program: {} instructions, entry={}", count, program.entry_point);
    Ok(())
}

/// Deserialize a program. Fails with `InvalidFormat` on magic mismatch,
/// `UnsupportedVersion` on version mismatch, `Truncated` on EOF mid-stream,
/// and `InvalidFormat` if trailing bytes remain after the declared
/// instruction count is consumed.
pub fn read_program(r: &mut impl Read) -> Result<Program, AstcFormatError> {
    let mut magic = [0u8; 4];
    read_exact_or_truncated(r, &mut magic)?;
    if magic != MAGIC {
        return Err(AstcFormatError::InvalidFormat(format!("bad magic {magic:?}")));
    }

    let mut u32_buf = [0u8; 4];
    read_exact_or_truncated(r, &mut u32_buf)?;
    let version = u32::from_le_bytes(u32_buf);
    if version != VERSION {
        return Err(AstcFormatError::UnsupportedVersion(version));
    }

    read_exact_or_truncated(r, &mut u32_buf)?;
    let flags = u32::from_le_bytes(u32_buf);

    read_exact_or_truncated(r, &mut u32_buf)?;
    let entry_point = u32::from_le_bytes(u32_buf);

    read_exact_or_truncated(r, &mut u32_buf)?;
    let count = u32::from_le_bytes(u32_buf);

    read_exact_or_truncated(r, &mut u32_buf)?;
    let declared_code_size = u32::from_le_bytes(u32_buf);

    let mut instructions = Vec::with_capacity(count as usize);
    let mut actual_code_size: u32 = 0;
    for _ in 0..count {
        let instr = Instruction::read(r)?;
        actual_code_size += instr.encoded_len();
        instructions.push(instr);
    }
    if actual_code_size != declared_code_size {
        return Err(AstcFormatError::InvalidFormat(format!(
            "declared code_size {declared_code_size} does not match decoded size {actual_code_size}"
        )));
    }

    // Surplus bytes beyond `instruction_count` are a deserialization error.
    let mut probe = [0u8; 1];
    match r.read(&mut probe) {
        Ok(0) => {}
        Ok(_) => return Err(AstcFormatError::InvalidFormat("surplus bytes after instruction stream".into())),
        Err(e) => return Err(AstcFormatError::Io(e.to_string())),
    }

    let program = Program { version, flags, entry_point, instructions };
    log::debug!("read ASTC program: {} instructions, entry={}", count, program.entry_point);
    Ok(program)
}
