//! # ASTC AST
//!
//! Tagged tree of C99 constructs produced by the parser and consumed by the
//! bytecode emitter. A node's `kind` selects which payload fields are valid,
//! matching the "tagged variant" data model used throughout this toolchain's
//! on-disk formats.
//!
//! ## Ownership
//!
//! Child nodes are held behind [`Rc<Node>`]. A freshly parsed tree has each
//! child at refcount one, so dropping the root frees the whole tree
//! transitively — the same "strict tree ownership" spec.md's data model
//! calls for. [`Node::shallow_clone`] is the one place a refcount is bumped
//! instead of re-parsing or deep-copying a subtree; it exists for callers
//! (e.g. constant folding) that want to detach a node from its original
//! parent without paying for a full copy of its children.

use std::fmt;
use std::rc::Rc;

/// A line/column pair. Both are 1-based; `(0, 0)` is used for synthetic
/// nodes that have no source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    pub const fn synthetic() -> Self {
        Self { line: 0, column: 0 }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Binary operator tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogicalAnd,
    LogicalOr,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Assign,
}

/// Unary operator tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    LogicalNot,
    BitNot,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    AddressOf,
    Deref,
}

/// A (coarse) type reference. The C99 subset driving self-hosting does not
/// need a full type-checking pass, so this is a descriptor used by the
/// emitter to choose instruction widths, not a type-system AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Void,
    Char,
    Int,
    Long,
    Float,
    Double,
    Pointer(Box<TypeRef>),
    Array(Box<TypeRef>, Option<u32>),
    Named(String),
}

/// A function parameter: name plus declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: TypeRef,
    pub pos: SourcePos,
}

/// The tagged payload of an AST node. The node's source position lives
/// alongside the kind in [`Node`], not inside each variant.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Ordered sequence of top-level declarations.
    TranslationUnit { items: Vec<Rc<Node>> },
    /// `name`, return type, ordered parameters, optional body.
    FunctionDecl {
        name: String,
        return_type: TypeRef,
        params: Vec<Param>,
        body: Option<Rc<Node>>,
    },
    /// `name`, type, optional initializer.
    VarDecl {
        name: String,
        ty: TypeRef,
        init: Option<Rc<Node>>,
    },
    CompoundStmt { stmts: Vec<Rc<Node>> },
    If {
        cond: Rc<Node>,
        then_branch: Rc<Node>,
        else_branch: Option<Rc<Node>>,
    },
    While { cond: Rc<Node>, body: Rc<Node> },
    For {
        init: Option<Rc<Node>>,
        cond: Option<Rc<Node>>,
        step: Option<Rc<Node>>,
        body: Rc<Node>,
    },
    Return { value: Option<Rc<Node>> },
    ExprStmt { expr: Rc<Node> },
    Break,
    Continue,
    BinaryOp { op: BinaryOp, lhs: Rc<Node>, rhs: Rc<Node> },
    UnaryOp { op: UnaryOp, operand: Rc<Node> },
    Call { callee: Rc<Node>, args: Vec<Rc<Node>> },
    Identifier { name: String },
    StringLiteral { bytes: Vec<u8> },
    IntegerConst { value: i64, ty: TypeRef },
    FloatConst { value: f64 },
    /// Module bridge: `module <name>;`
    ModuleDecl { name: String },
    /// Module bridge: `export <name>;`
    ExportDecl { name: String },
    /// Module bridge: `import <module>.<symbol>;`
    ImportDecl { module: String, symbol: String },
    /// Module bridge: a reference to a symbol resolved at link time.
    SymbolRef { module: Option<String>, name: String },
}

/// A single AST node: a tag (via [`NodeKind`]) plus its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub pos: SourcePos,
}

/// Errors produced by [`Node::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AstError {
    /// An identifier, module name, or symbol name was empty.
    EmptyName { node: &'static str, pos: SourcePos },
    /// Two parameters of the same function declared the same name.
    DuplicateParam { name: String, pos: SourcePos },
}

impl fmt::Display for AstError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AstError::EmptyName { node, pos } => {
                write!(f, "{pos}: {node} has an empty name")
            }
            AstError::DuplicateParam { name, pos } => {
                write!(f, "{pos}: duplicate parameter name `{name}`")
            }
        }
    }
}

impl std::error::Error for AstError {}

impl Node {
    /// create-node: build a node from a kind and its source position.
    pub fn new(kind: NodeKind, pos: SourcePos) -> Rc<Node> {
        Rc::new(Node { kind, pos })
    }

    pub fn identifier(name: impl Into<String>, pos: SourcePos) -> Rc<Node> {
        Self::new(NodeKind::Identifier { name: name.into() }, pos)
    }

    pub fn integer_const(value: i64, ty: TypeRef, pos: SourcePos) -> Rc<Node> {
        Self::new(NodeKind::IntegerConst { value, ty }, pos)
    }

    pub fn float_const(value: f64, pos: SourcePos) -> Rc<Node> {
        Self::new(NodeKind::FloatConst { value }, pos)
    }

    pub fn string_literal(bytes: Vec<u8>, pos: SourcePos) -> Rc<Node> {
        Self::new(NodeKind::StringLiteral { bytes }, pos)
    }

    pub fn binary_op(op: BinaryOp, lhs: Rc<Node>, rhs: Rc<Node>, pos: SourcePos) -> Rc<Node> {
        Self::new(NodeKind::BinaryOp { op, lhs, rhs }, pos)
    }

    pub fn unary_op(op: UnaryOp, operand: Rc<Node>, pos: SourcePos) -> Rc<Node> {
        Self::new(NodeKind::UnaryOp { op, operand }, pos)
    }

    /// node-type-name: a stable name for diagnostics, not `Debug` output.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::TranslationUnit { .. } => "translation-unit",
            NodeKind::FunctionDecl { .. } => "function-declaration",
            NodeKind::VarDecl { .. } => "variable-declaration",
            NodeKind::CompoundStmt { .. } => "compound-statement",
            NodeKind::If { .. } => "if-statement",
            NodeKind::While { .. } => "while-statement",
            NodeKind::For { .. } => "for-statement",
            NodeKind::Return { .. } => "return-statement",
            NodeKind::ExprStmt { .. } => "expression-statement",
            NodeKind::Break => "break-statement",
            NodeKind::Continue => "continue-statement",
            NodeKind::BinaryOp { .. } => "binary-operation",
            NodeKind::UnaryOp { .. } => "unary-operation",
            NodeKind::Call { .. } => "call-expression",
            NodeKind::Identifier { .. } => "identifier",
            NodeKind::StringLiteral { .. } => "string-literal",
            NodeKind::IntegerConst { .. } => "integer-constant",
            NodeKind::FloatConst { .. } => "float-constant",
            NodeKind::ModuleDecl { .. } => "module-declaration",
            NodeKind::ExportDecl { .. } => "export-declaration",
            NodeKind::ImportDecl { .. } => "import-declaration",
            NodeKind::SymbolRef { .. } => "symbol-reference",
        }
    }

    /// clone-node: a new node sharing child subtrees by reference count
    /// rather than deep-copying them. Spec.md's data model only requires a
    /// shallow copy of the payload, so this is refcount-cheap by
    /// construction instead of doing a full recursive [`Clone`].
    pub fn shallow_clone(self: &Rc<Node>) -> Rc<Node> {
        Rc::new(Node {
            kind: self.kind.clone(),
            pos: self.pos,
        })
    }

    /// validate-node: recursively check the structural invariants spec.md
    /// lays out. Node arity (binary ops have two operands, unary ops have
    /// one, declaration arrays match their `Vec::len()`) is enforced by the
    /// Rust type system and never needs a runtime check; this validates the
    /// invariants that are *not* structurally guaranteed by the types above.
    pub fn validate(self: &Rc<Node>) -> Result<(), AstError> {
        match &self.kind {
            NodeKind::Identifier { name } if name.is_empty() => {
                return Err(AstError::EmptyName {
                    node: "identifier",
                    pos: self.pos,
                });
            }
            NodeKind::ModuleDecl { name } | NodeKind::ExportDecl { name } if name.is_empty() => {
                return Err(AstError::EmptyName {
                    node: self.type_name(),
                    pos: self.pos,
                });
            }
            NodeKind::FunctionDecl { name, params, body, .. } => {
                if name.is_empty() {
                    return Err(AstError::EmptyName {
                        node: "function-declaration",
                        pos: self.pos,
                    });
                }
                for (i, p) in params.iter().enumerate() {
                    for other in &params[..i] {
                        if other.name == p.name {
                            return Err(AstError::DuplicateParam {
                                name: p.name.clone(),
                                pos: p.pos,
                            });
                        }
                    }
                }
                if let Some(body) = body {
                    body.validate()?;
                }
            }
            _ => {}
        }
        for child in self.children() {
            child.validate()?;
        }
        Ok(())
    }

    /// All direct child nodes, in evaluation/declaration order. Used by
    /// [`Node::validate`] and by callers that want to walk the tree
    /// generically (e.g. a future dead-code pass) without matching on every
    /// variant themselves.
    pub fn children(&self) -> Vec<Rc<Node>> {
        match &self.kind {
            NodeKind::TranslationUnit { items } => items.clone(),
            NodeKind::FunctionDecl { body, .. } => body.iter().cloned().collect(),
            NodeKind::VarDecl { init, .. } => init.iter().cloned().collect(),
            NodeKind::CompoundStmt { stmts } => stmts.clone(),
            NodeKind::If { cond, then_branch, else_branch } => {
                let mut v = vec![cond.clone(), then_branch.clone()];
                v.extend(else_branch.clone());
                v
            }
            NodeKind::While { cond, body } => vec![cond.clone(), body.clone()],
            NodeKind::For { init, cond, step, body } => {
                let mut v = Vec::new();
                v.extend(init.clone());
                v.extend(cond.clone());
                v.extend(step.clone());
                v.push(body.clone());
                v
            }
            NodeKind::Return { value } => value.iter().cloned().collect(),
            NodeKind::ExprStmt { expr } => vec![expr.clone()],
            NodeKind::BinaryOp { lhs, rhs, .. } => vec![lhs.clone(), rhs.clone()],
            NodeKind::UnaryOp { operand, .. } => vec![operand.clone()],
            NodeKind::Call { callee, args } => {
                let mut v = vec![callee.clone()];
                v.extend(args.iter().cloned());
                v
            }
            NodeKind::Break
            | NodeKind::Continue
            | NodeKind::Identifier { .. }
            | NodeKind::StringLiteral { .. }
            | NodeKind::IntegerConst { .. }
            | NodeKind::FloatConst { .. }
            | NodeKind::ModuleDecl { .. }
            | NodeKind::ExportDecl { .. }
            | NodeKind::ImportDecl { .. }
            | NodeKind::SymbolRef { .. } => Vec::new(),
        }
    }

    /// True iff this expression has no side effects and every leaf is a
    /// literal — the constant-expression predicate spec.md's emitter
    /// section requires for constant folding and dead-code elimination.
    pub fn is_constant_expr(&self) -> bool {
        match &self.kind {
            NodeKind::IntegerConst { .. } | NodeKind::FloatConst { .. } => true,
            NodeKind::BinaryOp { op, lhs, rhs } => {
                *op != BinaryOp::Assign && lhs.is_constant_expr() && rhs.is_constant_expr()
            }
            NodeKind::UnaryOp { op, operand } => {
                !matches!(
                    op,
                    UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec
                ) && operand.is_constant_expr()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> SourcePos {
        SourcePos::new(1, 1)
    }

    #[test]
    fn create_and_type_name() {
        let n = Node::integer_const(42, TypeRef::Int, pos());
        assert_eq!(n.type_name(), "integer-constant");
    }

    #[test]
    fn shallow_clone_shares_children() {
        let lhs = Node::integer_const(1, TypeRef::Int, pos());
        let rhs = Node::integer_const(2, TypeRef::Int, pos());
        let add = Node::binary_op(BinaryOp::Add, lhs.clone(), rhs.clone(), pos());
        let cloned = add.shallow_clone();
        assert_eq!(Rc::strong_count(&lhs), 2, "cloned node should share lhs by refcount");
        assert_eq!(cloned.type_name(), add.type_name());
    }

    #[test]
    fn validate_rejects_empty_identifier() {
        let n = Node::identifier("", pos());
        assert_eq!(
            n.validate(),
            Err(AstError::EmptyName { node: "identifier", pos: pos() })
        );
    }

    #[test]
    fn validate_rejects_duplicate_params() {
        let body = Node::new(NodeKind::CompoundStmt { stmts: vec![] }, pos());
        let func = Node::new(
            NodeKind::FunctionDecl {
                name: "f".into(),
                return_type: TypeRef::Void,
                params: vec![
                    Param { name: "x".into(), ty: TypeRef::Int, pos: pos() },
                    Param { name: "x".into(), ty: TypeRef::Int, pos: pos() },
                ],
                body: Some(body),
            },
            pos(),
        );
        assert!(matches!(func.validate(), Err(AstError::DuplicateParam { .. })));
    }

    #[test]
    fn is_constant_expr_detects_side_effects() {
        let lit = Node::integer_const(1, TypeRef::Int, pos());
        let inc = Node::unary_op(UnaryOp::PreInc, lit.clone(), pos());
        assert!(lit.is_constant_expr());
        assert!(!inc.is_constant_expr());
    }

    #[test]
    fn free_is_transitive_on_drop() {
        let child = Node::integer_const(7, TypeRef::Int, pos());
        let weak = Rc::downgrade(&child);
        let parent = Node::unary_op(UnaryOp::Neg, child, pos());
        drop(parent);
        assert!(weak.upgrade().is_none(), "dropping the parent must free its owned child");
    }
}
