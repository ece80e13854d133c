//! Constant folding pre-pass, gated by `EmitOptions::fold_constants`.
//!
//! Only combines leaves that are themselves constants (per
//! [`astc_ast::Node::is_constant_expr`]); anything touching an identifier,
//! a call, or an assignment is left for the emitter to lower normally.
//! Division and modulo by a constant zero are deliberately left unfolded so
//! the fault surfaces at run time as `RuntimeError`, not as a compile-time
//! panic.

use astc_ast::{BinaryOp, Node, NodeKind, UnaryOp};
use std::rc::Rc;

pub fn fold_constants(node: &Rc<Node>) -> Rc<Node> {
    match &node.kind {
        NodeKind::BinaryOp { op, lhs, rhs } => {
            let lhs = fold_constants(lhs);
            let rhs = fold_constants(rhs);
            if let Some(folded) = try_fold_binary(*op, &lhs, &rhs, node.pos) {
                return folded;
            }
            Node::binary_op(*op, lhs, rhs, node.pos)
        }
        NodeKind::UnaryOp { op, operand } => {
            let operand = fold_constants(operand);
            if let Some(folded) = try_fold_unary(*op, &operand, node.pos) {
                return folded;
            }
            Node::unary_op(*op, operand, node.pos)
        }
        NodeKind::TranslationUnit { items } => {
            Node::new(NodeKind::TranslationUnit { items: items.iter().map(fold_constants).collect() }, node.pos)
        }
        NodeKind::FunctionDecl { name, return_type, params, body } => Node::new(
            NodeKind::FunctionDecl {
                name: name.clone(),
                return_type: return_type.clone(),
                params: params.clone(),
                body: body.as_ref().map(fold_constants),
            },
            node.pos,
        ),
        NodeKind::VarDecl { name, ty, init } => Node::new(
            NodeKind::VarDecl { name: name.clone(), ty: ty.clone(), init: init.as_ref().map(fold_constants) },
            node.pos,
        ),
        NodeKind::CompoundStmt { stmts } => {
            Node::new(NodeKind::CompoundStmt { stmts: stmts.iter().map(fold_constants).collect() }, node.pos)
        }
        NodeKind::If { cond, then_branch, else_branch } => Node::new(
            NodeKind::If {
                cond: fold_constants(cond),
                then_branch: fold_constants(then_branch),
                else_branch: else_branch.as_ref().map(fold_constants),
            },
            node.pos,
        ),
        NodeKind::While { cond, body } => {
            Node::new(NodeKind::While { cond: fold_constants(cond), body: fold_constants(body) }, node.pos)
        }
        NodeKind::For { init, cond, step, body } => Node::new(
            NodeKind::For {
                init: init.as_ref().map(fold_constants),
                cond: cond.as_ref().map(fold_constants),
                step: step.as_ref().map(fold_constants),
                body: fold_constants(body),
            },
            node.pos,
        ),
        NodeKind::Return { value } => {
            Node::new(NodeKind::Return { value: value.as_ref().map(fold_constants) }, node.pos)
        }
        NodeKind::ExprStmt { expr } => Node::new(NodeKind::ExprStmt { expr: fold_constants(expr) }, node.pos),
        NodeKind::Call { callee, args } => Node::new(
            NodeKind::Call { callee: fold_constants(callee), args: args.iter().map(fold_constants).collect() },
            node.pos,
        ),
        _ => node.shallow_clone(),
    }
}

fn try_fold_binary(op: BinaryOp, lhs: &Rc<Node>, rhs: &Rc<Node>, pos: astc_ast::SourcePos) -> Option<Rc<Node>> {
    if op == BinaryOp::Assign || !lhs.is_constant_expr() || !rhs.is_constant_expr() {
        return None;
    }
    if let (NodeKind::IntegerConst { value: a, ty }, NodeKind::IntegerConst { value: b, .. }) = (&lhs.kind, &rhs.kind)
    {
        let (a, b) = (*a, *b);
        let result = match op {
            BinaryOp::Add => a.checked_add(b)?,
            BinaryOp::Sub => a.checked_sub(b)?,
            BinaryOp::Mul => a.checked_mul(b)?,
            BinaryOp::Div if b != 0 => a.checked_div(b)?,
            BinaryOp::Mod if b != 0 => a.checked_rem(b)?,
            BinaryOp::Div | BinaryOp::Mod => return None,
            BinaryOp::BitAnd => a & b,
            BinaryOp::BitOr => a | b,
            BinaryOp::BitXor => a ^ b,
            BinaryOp::Shl => a.checked_shl(b as u32)?,
            BinaryOp::Shr => a.checked_shr(b as u32)?,
            BinaryOp::Eq => (a == b) as i64,
            BinaryOp::Ne => (a != b) as i64,
            BinaryOp::Lt => (a < b) as i64,
            BinaryOp::Le => (a <= b) as i64,
            BinaryOp::Gt => (a > b) as i64,
            BinaryOp::Ge => (a >= b) as i64,
            BinaryOp::LogicalAnd => ((a != 0) && (b != 0)) as i64,
            BinaryOp::LogicalOr => ((a != 0) || (b != 0)) as i64,
            BinaryOp::Assign => unreachable!(),
        };
        return Some(Node::integer_const(result, ty.clone(), pos));
    }
    if let (NodeKind::FloatConst { value: a }, NodeKind::FloatConst { value: b }) = (&lhs.kind, &rhs.kind) {
        let (a, b) = (*a, *b);
        let result = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div if b != 0.0 => a / b,
            BinaryOp::Div => return None,
            _ => return None,
        };
        return Some(Node::float_const(result, pos));
    }
    None
}

fn try_fold_unary(op: UnaryOp, operand: &Rc<Node>, pos: astc_ast::SourcePos) -> Option<Rc<Node>> {
    if !operand.is_constant_expr() {
        return None;
    }
    match (&operand.kind, op) {
        (NodeKind::IntegerConst { value, ty }, UnaryOp::Neg) => Some(Node::integer_const(-value, ty.clone(), pos)),
        (NodeKind::IntegerConst { value, ty }, UnaryOp::BitNot) => Some(Node::integer_const(!value, ty.clone(), pos)),
        (NodeKind::IntegerConst { value, ty }, UnaryOp::LogicalNot) => {
            Some(Node::integer_const((*value == 0) as i64, ty.clone(), pos))
        }
        (NodeKind::FloatConst { value }, UnaryOp::Neg) => Some(Node::float_const(-value, pos)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astc_ast::{SourcePos, TypeRef};

    fn pos() -> SourcePos {
        SourcePos::new(1, 1)
    }

    #[test]
    fn folds_nested_arithmetic() {
        let one = Node::integer_const(1, TypeRef::Int, pos());
        let two = Node::integer_const(2, TypeRef::Int, pos());
        let three = Node::integer_const(3, TypeRef::Int, pos());
        let mul = Node::binary_op(BinaryOp::Mul, two, three, pos());
        let add = Node::binary_op(BinaryOp::Add, one, mul, pos());
        let folded = fold_constants(&add);
        assert!(matches!(folded.kind, NodeKind::IntegerConst { value: 7, .. }));
    }

    #[test]
    fn does_not_fold_division_by_constant_zero() {
        let one = Node::integer_const(1, TypeRef::Int, pos());
        let zero = Node::integer_const(0, TypeRef::Int, pos());
        let div = Node::binary_op(BinaryOp::Div, one, zero, pos());
        let folded = fold_constants(&div);
        assert!(matches!(folded.kind, NodeKind::BinaryOp { op: BinaryOp::Div, .. }));
    }

    #[test]
    fn leaves_non_constant_expressions_untouched() {
        let ident = Node::identifier("x", pos());
        let one = Node::integer_const(1, TypeRef::Int, pos());
        let add = Node::binary_op(BinaryOp::Add, ident, one, pos());
        let folded = fold_constants(&add);
        assert!(matches!(folded.kind, NodeKind::BinaryOp { op: BinaryOp::Add, .. }));
    }
}
