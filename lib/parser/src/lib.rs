//! # ASTC parser
//!
//! Recursive-descent parser for the C99 subset driving self-hosting: no
//! error recovery (the first unexpected token fails the whole parse), and
//! a flat, hand-written lexer feeding it one token of lookahead at a time.

mod lexer;

use astc_ast::{BinaryOp, Node, NodeKind, Param, SourcePos, TypeRef, UnaryOp};
use lexer::{Keyword, Lexer, LexError, Punct, Token, TokenKind};
use std::fmt;
use std::rc::Rc;

/// A parse failure, always carrying the source position of the offending
/// token (spec.md §4.B: "fails with ParseError carrying line/column on any
/// unexpected token").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub pos: SourcePos,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pos, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError { message: e.message, pos: e.pos }
    }
}

/// Parse a full translation unit from UTF-8 source bytes.
pub fn parse(src: &[u8]) -> Result<Rc<Node>, ParseError> {
    let mut parser = Parser::new(src)?;
    parser.parse_translation_unit()
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(src: &'a [u8]) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(src);
        let current = lexer.next_token()?;
        Ok(Self { lexer, current })
    }

    fn bump(&mut self) -> Result<Token, ParseError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn pos(&self) -> SourcePos {
        self.current.pos
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError {
            message: format!("expected {expected}, found {:?}", self.current.kind),
            pos: self.current.pos,
        }
    }

    fn at_punct(&self, p: Punct) -> bool {
        matches!(&self.current.kind, TokenKind::Punct(x) if *x == p)
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        matches!(&self.current.kind, TokenKind::Keyword(x) if *x == kw)
    }

    fn eat_punct(&mut self, p: Punct) -> Result<bool, ParseError> {
        if self.at_punct(p) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_punct(&mut self, p: Punct) -> Result<(), ParseError> {
        if self.eat_punct(p)? {
            Ok(())
        } else {
            Err(self.unexpected(&format!("{p:?}")))
        }
    }

    fn expect_identifier(&mut self) -> Result<(String, SourcePos), ParseError> {
        let pos = self.pos();
        match self.current.kind.clone() {
            TokenKind::Identifier(name) => {
                self.bump()?;
                Ok((name, pos))
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn is_type_start(&self) -> bool {
        matches!(
            &self.current.kind,
            TokenKind::Keyword(Keyword::Int)
                | TokenKind::Keyword(Keyword::Char)
                | TokenKind::Keyword(Keyword::Float)
                | TokenKind::Keyword(Keyword::Double)
                | TokenKind::Keyword(Keyword::Void)
                | TokenKind::Keyword(Keyword::Long)
        )
    }

    fn parse_type(&mut self) -> Result<TypeRef, ParseError> {
        let base = match self.current.kind {
            TokenKind::Keyword(Keyword::Int) => TypeRef::Int,
            TokenKind::Keyword(Keyword::Char) => TypeRef::Char,
            TokenKind::Keyword(Keyword::Float) => TypeRef::Float,
            TokenKind::Keyword(Keyword::Double) => TypeRef::Double,
            TokenKind::Keyword(Keyword::Void) => TypeRef::Void,
            TokenKind::Keyword(Keyword::Long) => TypeRef::Long,
            _ => return Err(self.unexpected("a type keyword")),
        };
        self.bump()?;
        let mut ty = base;
        while self.eat_punct(Punct::Star)? {
            ty = TypeRef::Pointer(Box::new(ty));
        }
        Ok(ty)
    }

    fn parse_translation_unit(&mut self) -> Result<Rc<Node>, ParseError> {
        let pos = self.pos();
        let mut items = Vec::new();
        while !matches!(self.current.kind, TokenKind::Eof) {
            items.push(self.parse_external_decl()?);
        }
        log::debug!("parsed translation unit with {} top-level declarations", items.len());
        Ok(Node::new(NodeKind::TranslationUnit { items }, pos))
    }

    fn parse_external_decl(&mut self) -> Result<Rc<Node>, ParseError> {
        let pos = self.pos();
        if self.at_keyword(Keyword::Module) {
            self.bump()?;
            let (name, _) = self.expect_identifier()?;
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Node::new(NodeKind::ModuleDecl { name }, pos));
        }
        if self.at_keyword(Keyword::Export) {
            self.bump()?;
            let (name, _) = self.expect_identifier()?;
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Node::new(NodeKind::ExportDecl { name }, pos));
        }
        if self.at_keyword(Keyword::Import) {
            self.bump()?;
            let (dotted, ipos) = self.expect_identifier()?;
            self.expect_punct(Punct::Semicolon)?;
            let (module, symbol) = split_dotted(&dotted, ipos)?;
            return Ok(Node::new(NodeKind::ImportDecl { module, symbol }, pos));
        }

        let ty = self.parse_type()?;
        let (name, _) = self.expect_identifier()?;

        if self.eat_punct(Punct::LParen)? {
            let params = self.parse_param_list()?;
            self.expect_punct(Punct::RParen)?;
            let body = if self.eat_punct(Punct::Semicolon)? {
                None
            } else {
                Some(self.parse_compound_stmt()?)
            };
            log::trace!("parsed function declaration `{name}`");
            return Ok(Node::new(
                NodeKind::FunctionDecl { name, return_type: ty, params, body },
                pos,
            ));
        }

        let init = if self.eat_punct(Punct::Assign)? {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect_punct(Punct::Semicolon)?;
        Ok(Node::new(NodeKind::VarDecl { name, ty, init }, pos))
    }

    fn parse_param_list(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        if self.at_punct(Punct::RParen) {
            return Ok(params);
        }
        if self.at_keyword(Keyword::Void) {
            // `(void)` means no parameters. Anything else starting with
            // `void` (e.g. `void *p`) is a real parameter, so peek past it
            // with a disposable lexer clone instead of committing the bump.
            let mut probe = self.lexer.clone();
            if matches!(probe.next_token(), Ok(Token { kind: TokenKind::Punct(Punct::RParen), .. })) {
                self.bump()?;
                return Ok(params);
            }
        }
        loop {
            let pos = self.pos();
            let ty = self.parse_type()?;
            let (name, _) = self.expect_identifier()?;
            params.push(Param { name, ty, pos });
            if !self.eat_punct(Punct::Comma)? {
                break;
            }
        }
        Ok(params)
    }

    fn parse_compound_stmt(&mut self) -> Result<Rc<Node>, ParseError> {
        let pos = self.pos();
        self.expect_punct(Punct::LBrace)?;
        let mut stmts = Vec::new();
        while !self.at_punct(Punct::RBrace) {
            stmts.push(self.parse_stmt()?);
        }
        self.expect_punct(Punct::RBrace)?;
        Ok(Node::new(NodeKind::CompoundStmt { stmts }, pos))
    }

    fn parse_stmt(&mut self) -> Result<Rc<Node>, ParseError> {
        let pos = self.pos();
        if self.at_punct(Punct::LBrace) {
            return self.parse_compound_stmt();
        }
        if self.at_keyword(Keyword::If) {
            self.bump()?;
            self.expect_punct(Punct::LParen)?;
            let cond = self.parse_expr()?;
            self.expect_punct(Punct::RParen)?;
            let then_branch = self.parse_stmt()?;
            let else_branch = if self.at_keyword(Keyword::Else) {
                self.bump()?;
                Some(self.parse_stmt()?)
            } else {
                None
            };
            return Ok(Node::new(NodeKind::If { cond, then_branch, else_branch }, pos));
        }
        if self.at_keyword(Keyword::While) {
            self.bump()?;
            self.expect_punct(Punct::LParen)?;
            let cond = self.parse_expr()?;
            self.expect_punct(Punct::RParen)?;
            let body = self.parse_stmt()?;
            return Ok(Node::new(NodeKind::While { cond, body }, pos));
        }
        if self.at_keyword(Keyword::For) {
            self.bump()?;
            self.expect_punct(Punct::LParen)?;
            let init = if self.at_punct(Punct::Semicolon) {
                None
            } else if self.is_type_start() {
                Some(self.parse_local_decl_no_semi()?)
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(Punct::Semicolon)?;
            let cond = if self.at_punct(Punct::Semicolon) { None } else { Some(self.parse_expr()?) };
            self.expect_punct(Punct::Semicolon)?;
            let step = if self.at_punct(Punct::RParen) { None } else { Some(self.parse_expr()?) };
            self.expect_punct(Punct::RParen)?;
            let body = self.parse_stmt()?;
            return Ok(Node::new(NodeKind::For { init, cond, step, body }, pos));
        }
        if self.at_keyword(Keyword::Return) {
            self.bump()?;
            let value = if self.at_punct(Punct::Semicolon) { None } else { Some(self.parse_expr()?) };
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Node::new(NodeKind::Return { value }, pos));
        }
        if self.at_keyword(Keyword::Break) {
            self.bump()?;
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Node::new(NodeKind::Break, pos));
        }
        if self.at_keyword(Keyword::Continue) {
            self.bump()?;
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Node::new(NodeKind::Continue, pos));
        }
        if self.is_type_start() {
            let decl = self.parse_local_decl_no_semi()?;
            self.expect_punct(Punct::Semicolon)?;
            return Ok(decl);
        }
        if self.eat_punct(Punct::Semicolon)? {
            return Ok(Node::new(NodeKind::CompoundStmt { stmts: vec![] }, pos));
        }
        let expr = self.parse_expr()?;
        self.expect_punct(Punct::Semicolon)?;
        Ok(Node::new(NodeKind::ExprStmt { expr }, pos))
    }

    fn parse_local_decl_no_semi(&mut self) -> Result<Rc<Node>, ParseError> {
        let pos = self.pos();
        let ty = self.parse_type()?;
        let (name, _) = self.expect_identifier()?;
        let init = if self.eat_punct(Punct::Assign)? { Some(self.parse_expr()?) } else { None };
        Ok(Node::new(NodeKind::VarDecl { name, ty, init }, pos))
    }

    // Expression grammar, precedence low to high:
    //   assignment > logical-or > logical-and > bitwise-or > bitwise-xor
    //   > bitwise-and > equality > relational > shift > additive
    //   > multiplicative > unary > postfix > primary
    fn parse_expr(&mut self) -> Result<Rc<Node>, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Rc<Node>, ParseError> {
        let pos = self.pos();
        let lhs = self.parse_logical_or()?;
        if self.eat_punct(Punct::Assign)? {
            let rhs = self.parse_assignment()?;
            return Ok(Node::binary_op(BinaryOp::Assign, lhs, rhs, pos));
        }
        Ok(lhs)
    }

    fn parse_logical_or(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_logical_and()?;
        while self.at_punct(Punct::PipePipe) {
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_logical_and()?;
            left = Node::binary_op(BinaryOp::LogicalOr, left, right, pos);
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_bitor()?;
        while self.at_punct(Punct::AmpAmp) {
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_bitor()?;
            left = Node::binary_op(BinaryOp::LogicalAnd, left, right, pos);
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_bitxor()?;
        while self.at_punct(Punct::Pipe) {
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_bitxor()?;
            left = Node::binary_op(BinaryOp::BitOr, left, right, pos);
        }
        Ok(left)
    }

    fn parse_bitxor(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_bitand()?;
        while self.at_punct(Punct::Caret) {
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_bitand()?;
            left = Node::binary_op(BinaryOp::BitXor, left, right, pos);
        }
        Ok(left)
    }

    fn parse_bitand(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_equality()?;
        while self.at_punct(Punct::Amp) {
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_equality()?;
            left = Node::binary_op(BinaryOp::BitAnd, left, right, pos);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = if self.at_punct(Punct::EqEq) {
                BinaryOp::Eq
            } else if self.at_punct(Punct::Ne) {
                BinaryOp::Ne
            } else {
                break;
            };
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_relational()?;
            left = Node::binary_op(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_shift()?;
        loop {
            let op = if self.at_punct(Punct::Lt) {
                BinaryOp::Lt
            } else if self.at_punct(Punct::Le) {
                BinaryOp::Le
            } else if self.at_punct(Punct::Gt) {
                BinaryOp::Gt
            } else if self.at_punct(Punct::Ge) {
                BinaryOp::Ge
            } else {
                break;
            };
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_shift()?;
            left = Node::binary_op(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.at_punct(Punct::Shl) {
                BinaryOp::Shl
            } else if self.at_punct(Punct::Shr) {
                BinaryOp::Shr
            } else {
                break;
            };
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_additive()?;
            left = Node::binary_op(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.at_punct(Punct::Plus) {
                BinaryOp::Add
            } else if self.at_punct(Punct::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_multiplicative()?;
            left = Node::binary_op(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.at_punct(Punct::Star) {
                BinaryOp::Mul
            } else if self.at_punct(Punct::Slash) {
                BinaryOp::Div
            } else if self.at_punct(Punct::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            let pos = self.pos();
            self.bump()?;
            let right = self.parse_unary()?;
            left = Node::binary_op(op, left, right, pos);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Rc<Node>, ParseError> {
        let pos = self.pos();
        let op = if self.at_punct(Punct::Minus) {
            Some(UnaryOp::Neg)
        } else if self.at_punct(Punct::Bang) {
            Some(UnaryOp::LogicalNot)
        } else if self.at_punct(Punct::Tilde) {
            Some(UnaryOp::BitNot)
        } else if self.at_punct(Punct::Amp) {
            Some(UnaryOp::AddressOf)
        } else if self.at_punct(Punct::Star) {
            Some(UnaryOp::Deref)
        } else if self.at_punct(Punct::PlusPlus) {
            Some(UnaryOp::PreInc)
        } else if self.at_punct(Punct::MinusMinus) {
            Some(UnaryOp::PreDec)
        } else {
            None
        };
        if let Some(op) = op {
            self.bump()?;
            let operand = self.parse_unary()?;
            return Ok(Node::unary_op(op, operand, pos));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Rc<Node>, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            let pos = self.pos();
            if self.eat_punct(Punct::LParen)? {
                let mut args = Vec::new();
                if !self.at_punct(Punct::RParen) {
                    loop {
                        args.push(self.parse_assignment()?);
                        if !self.eat_punct(Punct::Comma)? {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::RParen)?;
                expr = Node::new(NodeKind::Call { callee: expr, args }, pos);
            } else if self.at_punct(Punct::PlusPlus) {
                self.bump()?;
                expr = Node::unary_op(UnaryOp::PostInc, expr, pos);
            } else if self.at_punct(Punct::MinusMinus) {
                self.bump()?;
                expr = Node::unary_op(UnaryOp::PostDec, expr, pos);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Rc<Node>, ParseError> {
        let pos = self.pos();
        match self.current.kind.clone() {
            TokenKind::IntLiteral(v) => {
                self.bump()?;
                Ok(Node::integer_const(v, TypeRef::Int, pos))
            }
            TokenKind::FloatLiteral(v) => {
                self.bump()?;
                Ok(Node::float_const(v, pos))
            }
            TokenKind::StringLiteral(bytes) => {
                self.bump()?;
                Ok(Node::string_literal(bytes, pos))
            }
            TokenKind::Identifier(name) => {
                self.bump()?;
                if name.contains('.') {
                    let (module, symbol) = split_dotted(&name, pos)?;
                    return Ok(Node::new(NodeKind::SymbolRef { module: Some(module), name: symbol }, pos));
                }
                Ok(Node::identifier(name, pos))
            }
            TokenKind::Punct(Punct::LParen) => {
                self.bump()?;
                let inner = self.parse_expr()?;
                self.expect_punct(Punct::RParen)?;
                Ok(inner)
            }
            _ => Err(self.unexpected("an expression")),
        }
    }
}

fn split_dotted(name: &str, pos: SourcePos) -> Result<(String, String), ParseError> {
    match name.split_once('.') {
        Some((module, symbol)) if !module.is_empty() && !symbol.is_empty() => {
            Ok((module.to_string(), symbol.to_string()))
        }
        _ => Err(ParseError {
            message: format!("expected `module.symbol`, found `{name}`"),
            pos,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Rc<Node> {
        parse(src.as_bytes()).expect("should parse")
    }

    #[test]
    fn parses_empty_function() {
        let unit = parse_ok("int main(void) { return 0; }");
        match &unit.kind {
            NodeKind::TranslationUnit { items } => {
                assert_eq!(items.len(), 1);
                match &items[0].kind {
                    NodeKind::FunctionDecl { name, params, body, .. } => {
                        assert_eq!(name, "main");
                        assert!(params.is_empty());
                        assert!(body.is_some());
                    }
                    other => panic!("expected function decl, got {other:?}"),
                }
            }
            other => panic!("expected translation unit, got {other:?}"),
        }
    }

    #[test]
    fn parses_binary_precedence() {
        let unit = parse_ok("int f() { return 1 + 2 * 3; }");
        let NodeKind::TranslationUnit { items } = &unit.kind else { unreachable!() };
        let NodeKind::FunctionDecl { body: Some(body), .. } = &items[0].kind else { unreachable!() };
        let NodeKind::CompoundStmt { stmts } = &body.kind else { unreachable!() };
        let NodeKind::Return { value: Some(value) } = &stmts[0].kind else { unreachable!() };
        match &value.kind {
            NodeKind::BinaryOp { op: BinaryOp::Add, rhs, .. } => {
                assert!(matches!(rhs.kind, NodeKind::BinaryOp { op: BinaryOp::Mul, .. }));
            }
            other => panic!("expected addition at top, got {other:?}"),
        }
    }

    #[test]
    fn parses_if_while_for_and_calls() {
        let unit = parse_ok(
            "int fib(int n) { if (n < 2) { return n; } while (n > 0) { n = n - 1; } for (int i = 0; i < n; i = i + 1) { fib(i); } return n; }",
        );
        assert!(matches!(unit.kind, NodeKind::TranslationUnit { .. }));
    }

    #[test]
    fn parses_module_bridge_decls() {
        let unit = parse_ok("module mymod; export add; import libm.sqrt;");
        let NodeKind::TranslationUnit { items } = &unit.kind else { unreachable!() };
        assert!(matches!(items[0].kind, NodeKind::ModuleDecl { .. }));
        assert!(matches!(items[1].kind, NodeKind::ExportDecl { .. }));
        assert!(matches!(
            items[2].kind,
            NodeKind::ImportDecl { ref module, ref symbol } if module == "libm" && symbol == "sqrt"
        ));
    }

    #[test]
    fn reports_position_on_unexpected_token() {
        let err = parse("int f( {".as_bytes()).unwrap_err();
        assert_eq!(err.pos, SourcePos::new(1, 8));
    }
}
