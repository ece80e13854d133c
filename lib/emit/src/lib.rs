//! # ASTC bytecode emitter
//!
//! Lowers a translation-unit AST ([`astc_ast::Node`]) to an [`astc_format::Program`].
//! Functions are emitted in source order into one flat instruction stream;
//! calls to a function defined later in the file are resolved with a
//! fixup list once every function's start address is known.

mod fold;

use astc_ast::{BinaryOp, Node, NodeKind, SourcePos, TypeRef, UnaryOp};
use astc_format::{Instruction, LibcFunction, Program, Relation, Width};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Options controlling optional passes. No global optimizer singleton:
/// every call to [`emit_program`] takes its options explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitOptions {
    pub fold_constants: bool,
    pub eliminate_dead_code: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmitError {
    UnknownIdentifier { name: String, pos: SourcePos },
    UndefinedFunction { name: String, pos: SourcePos },
    DuplicateFunction { name: String, pos: SourcePos },
    BreakOutsideLoop { pos: SourcePos },
    ContinueOutsideLoop { pos: SourcePos },
    InvalidAssignmentTarget { pos: SourcePos },
    Unsupported { what: String, pos: SourcePos },
    NoEntryPoint,
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::UnknownIdentifier { name, pos } => write!(f, "{pos}: unknown identifier `{name}`"),
            EmitError::UndefinedFunction { name, pos } => write!(f, "{pos}: call to undefined function `{name}`"),
            EmitError::DuplicateFunction { name, pos } => write!(f, "{pos}: function `{name}` defined more than once"),
            EmitError::BreakOutsideLoop { pos } => write!(f, "{pos}: `break` outside a loop"),
            EmitError::ContinueOutsideLoop { pos } => write!(f, "{pos}: `continue` outside a loop"),
            EmitError::InvalidAssignmentTarget { pos } => write!(f, "{pos}: left side of assignment is not a variable"),
            EmitError::Unsupported { what, pos } => write!(f, "{pos}: unsupported construct: {what}"),
            EmitError::NoEntryPoint => write!(f, "no `main` function and no function to use as entry point"),
        }
    }
}

impl std::error::Error for EmitError {}

/// Lower a translation unit to a complete ASTC program.
pub fn emit_program(unit: &Rc<Node>, opts: EmitOptions) -> Result<Program, EmitError> {
    let unit = if opts.fold_constants { fold::fold_constants(unit) } else { unit.clone() };

    let NodeKind::TranslationUnit { items } = &unit.kind else {
        return Err(EmitError::Unsupported { what: "top-level node is not a translation unit".into(), pos: unit.pos });
    };

    let mut emitter = Emitter::new(opts);
    for item in items {
        if let NodeKind::FunctionDecl { name, params, body: Some(body), .. } = &item.kind {
            emitter.emit_function(name, params, body, item.pos)?;
        }
    }
    emitter.resolve_call_fixups()?;

    let entry_point = emitter
        .function_starts
        .get("main")
        .copied()
        .or_else(|| emitter.function_starts.values().min().copied())
        .ok_or(EmitError::NoEntryPoint)?;

    log::debug!(
        "emitted {} instructions across {} functions, entry_point={entry_point}",
        emitter.instructions.len(),
        emitter.function_starts.len()
    );
    Ok(Program::new(entry_point, emitter.instructions))
}

struct LoopCtx {
    break_fixups: Vec<usize>,
    continue_fixups: Vec<usize>,
    continue_target: Option<u32>,
}

struct Emitter {
    opts: EmitOptions,
    instructions: Vec<Instruction>,
    function_starts: HashMap<String, u32>,
    call_fixups: Vec<(usize, String, SourcePos)>,
    locals: HashMap<String, u32>,
    next_local: u32,
    loop_stack: Vec<LoopCtx>,
}

impl Emitter {
    fn new(opts: EmitOptions) -> Self {
        Self {
            opts,
            instructions: Vec::new(),
            function_starts: HashMap::new(),
            call_fixups: Vec::new(),
            locals: HashMap::new(),
            next_local: 0,
            loop_stack: Vec::new(),
        }
    }

    fn push(&mut self, instr: Instruction) -> usize {
        self.instructions.push(instr);
        self.instructions.len() - 1
    }

    fn here(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn patch_jump(&mut self, idx: usize, target: u32) {
        self.instructions[idx] = match self.instructions[idx] {
            Instruction::Jump(_) => Instruction::Jump(target),
            Instruction::JumpIf(_) => Instruction::JumpIf(target),
            Instruction::JumpIfFalse(_) => Instruction::JumpIfFalse(target),
            other => other,
        };
    }

    fn declare_local(&mut self, name: &str) -> u32 {
        *self.locals.entry(name.to_string()).or_insert_with(|| {
            let idx = self.next_local;
            self.next_local += 1;
            idx
        })
    }

    fn emit_function(&mut self, name: &str, params: &[astc_ast::Param], body: &Rc<Node>, pos: SourcePos) -> Result<(), EmitError> {
        if self.function_starts.contains_key(name) {
            return Err(EmitError::DuplicateFunction { name: name.to_string(), pos });
        }
        self.locals.clear();
        self.next_local = 0;
        for p in params {
            self.declare_local(&p.name);
        }
        self.function_starts.insert(name.to_string(), self.here());
        log::trace!("emitting function `{name}` at instruction {}", self.here());
        self.emit_stmt(body)?;
        // Guard against fallthrough off the end of a function body.
        self.push(Instruction::Return);
        Ok(())
    }

    fn resolve_call_fixups(&mut self) -> Result<(), EmitError> {
        for (idx, name, pos) in std::mem::take(&mut self.call_fixups) {
            let target = self
                .function_starts
                .get(&name)
                .copied()
                .ok_or(EmitError::UndefinedFunction { name, pos })?;
            let argc = match self.instructions[idx] {
                Instruction::Call { argc, .. } => argc,
                _ => unreachable!("call fixup index does not point at a Call placeholder"),
            };
            self.instructions[idx] = Instruction::Call { target, argc };
        }
        Ok(())
    }

    fn emit_stmt(&mut self, node: &Rc<Node>) -> Result<(), EmitError> {
        match &node.kind {
            NodeKind::CompoundStmt { stmts } => {
                for (i, s) in stmts.iter().enumerate() {
                    self.emit_stmt(s)?;
                    if self.opts.eliminate_dead_code && is_terminal(s) && i + 1 < stmts.len() {
                        log::debug!("dropping {} unreachable statement(s) after terminal statement", stmts.len() - i - 1);
                        break;
                    }
                }
            }
            NodeKind::VarDecl { name, init, .. } => {
                let idx = self.declare_local(name);
                if let Some(init) = init {
                    self.emit_expr(init)?;
                    self.push(Instruction::LocalSet(idx));
                }
            }
            NodeKind::If { cond, then_branch, else_branch } => {
                self.emit_expr(cond)?;
                let jf_idx = self.push(Instruction::JumpIfFalse(u32::MAX));
                self.emit_stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    let jmp_idx = self.push(Instruction::Jump(u32::MAX));
                    let else_start = self.here();
                    self.patch_jump(jf_idx, else_start);
                    self.emit_stmt(else_branch)?;
                    let end = self.here();
                    self.patch_jump(jmp_idx, end);
                } else {
                    let end = self.here();
                    self.patch_jump(jf_idx, end);
                }
            }
            NodeKind::While { cond, body } => {
                let loop_start = self.here();
                self.emit_expr(cond)?;
                let jf_idx = self.push(Instruction::JumpIfFalse(u32::MAX));
                self.loop_stack.push(LoopCtx {
                    break_fixups: Vec::new(),
                    continue_fixups: Vec::new(),
                    continue_target: Some(loop_start),
                });
                self.emit_stmt(body)?;
                let ctx = self.loop_stack.pop().expect("loop context pushed above");
                self.push(Instruction::Jump(loop_start));
                let end = self.here();
                self.patch_jump(jf_idx, end);
                for idx in ctx.break_fixups {
                    self.patch_jump(idx, end);
                }
            }
            NodeKind::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.emit_for_clause(init)?;
                }
                let cond_start = self.here();
                let jf_idx = match cond {
                    Some(cond) => {
                        self.emit_expr(cond)?;
                        Some(self.push(Instruction::JumpIfFalse(u32::MAX)))
                    }
                    None => None,
                };
                self.loop_stack.push(LoopCtx { break_fixups: Vec::new(), continue_fixups: Vec::new(), continue_target: None });
                self.emit_stmt(body)?;
                let ctx = self.loop_stack.pop().expect("loop context pushed above");
                let step_start = self.here();
                for idx in ctx.continue_fixups {
                    self.patch_jump(idx, step_start);
                }
                if let Some(step) = step {
                    self.emit_for_clause(step)?;
                }
                self.push(Instruction::Jump(cond_start));
                let end = self.here();
                if let Some(jf_idx) = jf_idx {
                    self.patch_jump(jf_idx, end);
                }
                for idx in ctx.break_fixups {
                    self.patch_jump(idx, end);
                }
            }
            NodeKind::Return { value } => {
                if let Some(value) = value {
                    self.emit_expr(value)?;
                }
                self.push(Instruction::Return);
            }
            NodeKind::ExprStmt { expr } => {
                self.emit_expr(expr)?;
                self.push(Instruction::Drop);
            }
            NodeKind::Break => {
                let pos = node.pos;
                let idx = self.push(Instruction::Jump(u32::MAX));
                let ctx = self.loop_stack.last_mut().ok_or(EmitError::BreakOutsideLoop { pos })?;
                ctx.break_fixups.push(idx);
            }
            NodeKind::Continue => {
                let pos = node.pos;
                let target = self.loop_stack.last().ok_or(EmitError::ContinueOutsideLoop { pos })?.continue_target;
                match target {
                    Some(t) => {
                        self.push(Instruction::Jump(t));
                    }
                    None => {
                        let idx = self.push(Instruction::Jump(u32::MAX));
                        self.loop_stack.last_mut().unwrap().continue_fixups.push(idx);
                    }
                }
            }
            _ => {
                return Err(EmitError::Unsupported { what: format!("{} as a statement", node.type_name()), pos: node.pos });
            }
        }
        Ok(())
    }

    /// Emit a `for` init/step clause, which may be a bare declaration or a
    /// plain (value-discarding) expression.
    fn emit_for_clause(&mut self, node: &Rc<Node>) -> Result<(), EmitError> {
        match &node.kind {
            NodeKind::VarDecl { .. } => self.emit_stmt(node),
            _ => {
                self.emit_expr(node)?;
                self.push(Instruction::Drop);
                Ok(())
            }
        }
    }

    fn emit_expr(&mut self, node: &Rc<Node>) -> Result<(), EmitError> {
        match &node.kind {
            NodeKind::IntegerConst { value, ty } => {
                match ty {
                    TypeRef::Long | TypeRef::Pointer(_) => {
                        self.push(Instruction::I64Const(*value));
                    }
                    _ => {
                        self.push(Instruction::I32Const(*value as i32));
                    }
                }
            }
            NodeKind::FloatConst { value } => {
                self.push(Instruction::I64Const(value.to_bits() as i64));
            }
            NodeKind::Identifier { name } => {
                let idx = *self.locals.get(name).ok_or_else(|| EmitError::UnknownIdentifier {
                    name: name.clone(),
                    pos: node.pos,
                })?;
                self.push(Instruction::LocalGet(idx));
            }
            NodeKind::StringLiteral { .. } => {
                return Err(EmitError::Unsupported {
                    what: "string literal (no data section in a bare ASTC program; package as a NATV module instead)".into(),
                    pos: node.pos,
                });
            }
            NodeKind::SymbolRef { module, name } => {
                return Err(EmitError::Unsupported {
                    what: format!(
                        "cross-module symbol reference `{}{name}` (resolved by the native module loader, not the bytecode emitter)",
                        module.as_ref().map(|m| format!("{m}.")).unwrap_or_default()
                    ),
                    pos: node.pos,
                });
            }
            NodeKind::BinaryOp { op: BinaryOp::Assign, lhs, rhs } => {
                let idx = self.lvalue_local(lhs)?;
                self.emit_expr(rhs)?;
                self.push(Instruction::LocalSet(idx));
                self.push(Instruction::LocalGet(idx));
            }
            NodeKind::BinaryOp { op, lhs, rhs } => {
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.emit_binary_op(*op);
            }
            NodeKind::UnaryOp { op, operand } => {
                self.emit_unary_op(*op, operand)?;
            }
            NodeKind::Call { callee, args } => {
                for arg in args {
                    self.emit_expr(arg)?;
                }
                self.emit_call(callee, args.len())?;
            }
            _ => {
                return Err(EmitError::Unsupported { what: format!("{} as an expression", node.type_name()), pos: node.pos });
            }
        }
        Ok(())
    }

    fn lvalue_local(&mut self, node: &Rc<Node>) -> Result<u32, EmitError> {
        match &node.kind {
            NodeKind::Identifier { name } => Ok(self.declare_local(name)),
            _ => Err(EmitError::InvalidAssignmentTarget { pos: node.pos }),
        }
    }

    fn emit_binary_op(&mut self, op: BinaryOp) {
        match op {
            BinaryOp::Add => {
                self.push(Instruction::Add(Width::I64));
            }
            BinaryOp::Sub => {
                self.push(Instruction::Sub(Width::I64));
            }
            BinaryOp::Mul => {
                self.push(Instruction::Mul(Width::I64));
            }
            BinaryOp::Div => {
                self.push(Instruction::Div(Width::I64));
            }
            BinaryOp::Mod => {
                self.push(Instruction::Mod(Width::I64));
            }
            BinaryOp::BitAnd | BinaryOp::LogicalAnd => {
                self.push(Instruction::And);
            }
            BinaryOp::BitOr | BinaryOp::LogicalOr => {
                self.push(Instruction::Or);
            }
            BinaryOp::BitXor => {
                self.push(Instruction::Xor);
            }
            BinaryOp::Shl => {
                self.push(Instruction::Shl);
            }
            BinaryOp::Shr => {
                self.push(Instruction::Shr);
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                self.push(Instruction::Cmp(Width::I64));
                self.push(Instruction::Test(relation_for(op)));
            }
            BinaryOp::Assign => unreachable!("handled by emit_expr before reaching here"),
        }
    }

    fn emit_unary_op(&mut self, op: UnaryOp, operand: &Rc<Node>) -> Result<(), EmitError> {
        match op {
            UnaryOp::Neg => {
                self.push(Instruction::I64Const(0));
                self.emit_expr(operand)?;
                self.push(Instruction::Sub(Width::I64));
            }
            UnaryOp::BitNot => {
                self.emit_expr(operand)?;
                self.push(Instruction::Not);
            }
            UnaryOp::LogicalNot => {
                self.emit_expr(operand)?;
                self.push(Instruction::I64Const(0));
                self.push(Instruction::Cmp(Width::I64));
                self.push(Instruction::Test(Relation::Eq));
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let idx = self.lvalue_local(operand)?;
                let is_inc = matches!(op, UnaryOp::PreInc | UnaryOp::PostInc);
                let is_post = matches!(op, UnaryOp::PostInc | UnaryOp::PostDec);
                if is_post {
                    self.push(Instruction::LocalGet(idx));
                }
                self.push(Instruction::LocalGet(idx));
                self.push(Instruction::I64Const(1));
                self.push(if is_inc { Instruction::Add(Width::I64) } else { Instruction::Sub(Width::I64) });
                self.push(Instruction::LocalSet(idx));
                if !is_post {
                    self.push(Instruction::LocalGet(idx));
                }
            }
            UnaryOp::AddressOf | UnaryOp::Deref => {
                return Err(EmitError::Unsupported {
                    what: "pointer address-of/dereference (no addressable memory model in the bare ASTC stack VM)".into(),
                    pos: operand.pos,
                });
            }
        }
        Ok(())
    }

    fn emit_call(&mut self, callee: &Rc<Node>, argc: usize) -> Result<(), EmitError> {
        let NodeKind::Identifier { name } = &callee.kind else {
            return Err(EmitError::Unsupported { what: "indirect call through a non-identifier expression".into(), pos: callee.pos });
        };
        if let Some(libc_fn) = LibcFunction::from_name(name) {
            self.push(Instruction::LibcCall { func_id: libc_fn as u16, argc: argc as u16 });
            return Ok(());
        }
        let idx = self.push(Instruction::Call { target: u32::MAX, argc: argc as u16 });
        self.call_fixups.push((idx, name.clone(), callee.pos));
        Ok(())
    }
}

fn relation_for(op: BinaryOp) -> Relation {
    match op {
        BinaryOp::Eq => Relation::Eq,
        BinaryOp::Ne => Relation::Ne,
        BinaryOp::Lt => Relation::Lt,
        BinaryOp::Le => Relation::Le,
        BinaryOp::Gt => Relation::Gt,
        BinaryOp::Ge => Relation::Ge,
        _ => unreachable!("relation_for called with a non-relational operator"),
    }
}

/// True for statements after which nothing in the same block can execute.
fn is_terminal(node: &Rc<Node>) -> bool {
    matches!(&node.kind, NodeKind::Return { .. } | NodeKind::Break | NodeKind::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use astc_format::Opcode;

    fn emit(src: &str, opts: EmitOptions) -> Program {
        let unit = astc_parser::parse(src.as_bytes()).expect("parses");
        emit_program(&unit, opts).expect("emits")
    }

    #[test]
    fn emits_constant_return() {
        let program = emit("int main(void) { return 42; }", EmitOptions::default());
        assert!(program.instructions.iter().any(|i| matches!(i, Instruction::I32Const(42))));
        assert!(matches!(program.instructions.last(), Some(Instruction::Return)));
    }

    #[test]
    fn resolves_forward_function_calls() {
        let program = emit(
            "int main(void) { return helper(); } int helper(void) { return 7; }",
            EmitOptions::default(),
        );
        assert!(program.instructions.iter().any(|i| matches!(i, Instruction::Call { .. })));
        assert!(program.validate_branches().is_ok());
    }

    #[test]
    fn call_carries_argument_count_for_the_vm_to_bind_locals() {
        let program = emit(
            "int main(void) { return add(1, 2); } int add(int a, int b) { return a + b; }",
            EmitOptions::default(),
        );
        assert!(program.instructions.iter().any(|i| matches!(i, Instruction::Call { argc: 2, .. })));
    }

    #[test]
    fn emits_libc_call_for_known_names() {
        let program = emit("int main(void) { putchar(65); return 0; }", EmitOptions::default());
        assert!(program
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::LibcCall { func_id, argc: 1 } if *func_id == LibcFunction::Putchar as u16)));
    }

    #[test]
    fn undefined_function_call_is_an_error() {
        let unit = astc_parser::parse(b"int main(void) { return missing(); }").unwrap();
        let err = emit_program(&unit, EmitOptions::default()).unwrap_err();
        assert!(matches!(err, EmitError::UndefinedFunction { .. }));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let unit = astc_parser::parse(b"int main(void) { break; }").unwrap();
        let err = emit_program(&unit, EmitOptions::default()).unwrap_err();
        assert!(matches!(err, EmitError::BreakOutsideLoop { .. }));
    }

    #[test]
    fn while_loop_round_trips_through_branch_validation() {
        let program = emit(
            "int main(void) { int i; i = 0; while (i < 10) { i = i + 1; } return i; }",
            EmitOptions::default(),
        );
        assert!(program.validate_branches().is_ok());
        assert!(program.instructions.iter().any(|i| i.opcode() == Opcode::Cmp));
    }

    #[test]
    fn for_loop_continue_targets_the_step() {
        let program = emit(
            "int main(void) { int i; int sum; sum = 0; for (i = 0; i < 5; i = i + 1) { if (i == 2) { continue; } sum = sum + i; } return sum; }",
            EmitOptions::default(),
        );
        assert!(program.validate_branches().is_ok());
    }

    #[test]
    fn constant_folding_collapses_arithmetic() {
        let program = emit("int main(void) { return 1 + 2 * 3; }", EmitOptions { fold_constants: true, eliminate_dead_code: false });
        assert!(program.instructions.iter().any(|i| matches!(i, Instruction::I32Const(7))));
        assert!(!program.instructions.iter().any(|i| i.opcode() == Opcode::Mul));
    }

    #[test]
    fn dead_code_after_return_is_dropped() {
        let program = emit(
            "int main(void) { return 1; return 2; }",
            EmitOptions { fold_constants: false, eliminate_dead_code: true },
        );
        let ones = program.instructions.iter().filter(|i| matches!(i, Instruction::I32Const(1))).count();
        let twos = program.instructions.iter().filter(|i| matches!(i, Instruction::I32Const(2))).count();
        assert_eq!(ones, 1);
        assert_eq!(twos, 0);
    }
}
