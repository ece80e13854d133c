//! Hand-written byte-oriented lexer for the ASTC C99 subset. No external
//! lexer-generator crate is used — matches this toolchain's preference for
//! hand-rolled scanning over the bytecode's own instruction stream.

use astc_ast::SourcePos;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Int,
    Char,
    Float,
    Double,
    Void,
    Long,
    If,
    Else,
    While,
    For,
    Return,
    Break,
    Continue,
    Module,
    Export,
    Import,
}

impl Keyword {
    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "int" => Keyword::Int,
            "char" => Keyword::Char,
            "float" => Keyword::Float,
            "double" => Keyword::Double,
            "void" => Keyword::Void,
            "long" => Keyword::Long,
            "if" => Keyword::If,
            "else" => Keyword::Else,
            "while" => Keyword::While,
            "for" => Keyword::For,
            "return" => Keyword::Return,
            "break" => Keyword::Break,
            "continue" => Keyword::Continue,
            "module" => Keyword::Module,
            "export" => Keyword::Export,
            "import" => Keyword::Import,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AmpAmp,
    PipePipe,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    PlusPlus,
    MinusMinus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    IntLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(Vec<u8>),
    Keyword(Keyword),
    Punct(Punct),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: SourcePos,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub pos: SourcePos,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pos, self.message)
    }
}

impl std::error::Error for LexError {}

#[derive(Clone, Copy)]
pub struct Lexer<'a> {
    src: &'a [u8],
    offset: usize,
    line: u32,
    column: u32,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

/// Identifiers (and the module-bridge's dotted `module.symbol` names) match
/// `[A-Za-z_][A-Za-z0-9_.$]*` per spec.md's lexing rules.
fn is_ident_cont(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'$'
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, offset: 0, line: 1, column: 1 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.offset).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.offset + ahead).copied()
    }

    fn pos(&self) -> SourcePos {
        SourcePos::new(self.line, self.column)
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.offset += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => break,
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            _ => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia();
        let pos = self.pos();
        let Some(b) = self.peek() else {
            return Ok(Token { kind: TokenKind::Eof, pos });
        };

        if is_ident_start(b) {
            return Ok(self.lex_identifier(pos));
        }
        if b.is_ascii_digit() {
            return self.lex_number(pos);
        }
        if b == b'"' {
            return self.lex_string(pos);
        }
        self.lex_punct(pos)
    }

    fn lex_identifier(&mut self, pos: SourcePos) -> Token {
        let start = self.offset;
        while let Some(b) = self.peek() {
            if is_ident_cont(b) {
                self.bump();
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.offset]).into_owned();
        let kind = match Keyword::from_str(&text) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Identifier(text),
        };
        Token { kind, pos }
    }

    fn lex_number(&mut self, pos: SourcePos) -> Result<Token, LexError> {
        let start = self.offset;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.bump();
            self.bump();
            let hex_start = self.offset;
            while matches!(self.peek(), Some(b) if b.is_ascii_hexdigit()) {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[hex_start..self.offset]).unwrap();
            let value = i64::from_str_radix(text, 16).map_err(|e| LexError {
                message: format!("invalid hex literal: {e}"),
                pos,
            })?;
            return Ok(Token { kind: TokenKind::IntLiteral(value), pos });
        }

        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b) if b.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.offset]).unwrap();
        if is_float {
            let value: f64 = text.parse().map_err(|_| LexError {
                message: format!("invalid float literal `{text}`"),
                pos,
            })?;
            Ok(Token { kind: TokenKind::FloatLiteral(value), pos })
        } else {
            let value: i64 = text.parse().map_err(|_| LexError {
                message: format!("invalid integer literal `{text}`"),
                pos,
            })?;
            Ok(Token { kind: TokenKind::IntLiteral(value), pos })
        }
    }

    /// No escape decoding beyond NUL termination is required for the C99
    /// subset driving self-hosting: a backslash simply protects the next
    /// byte from terminating the string early, it is not interpreted.
    fn lex_string(&mut self, pos: SourcePos) -> Result<Token, LexError> {
        self.bump(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(LexError { message: "unterminated string literal".into(), pos });
                }
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    bytes.push(self.bump().unwrap());
                    if let Some(b) = self.bump() {
                        bytes.push(b);
                    }
                }
                Some(_) => {
                    bytes.push(self.bump().unwrap());
                }
            }
        }
        bytes.push(0); // NUL terminate
        Ok(Token { kind: TokenKind::StringLiteral(bytes), pos })
    }

    fn lex_punct(&mut self, pos: SourcePos) -> Result<Token, LexError> {
        let two = |a: u8, b: u8| -> bool { self.peek() == Some(a) && self.peek_at(1) == Some(b) };
        let p = if two(b'=', b'=') {
            self.bump();
            self.bump();
            Punct::EqEq
        } else if two(b'!', b'=') {
            self.bump();
            self.bump();
            Punct::Ne
        } else if two(b'<', b'=') {
            self.bump();
            self.bump();
            Punct::Le
        } else if two(b'>', b'=') {
            self.bump();
            self.bump();
            Punct::Ge
        } else if two(b'&', b'&') {
            self.bump();
            self.bump();
            Punct::AmpAmp
        } else if two(b'|', b'|') {
            self.bump();
            self.bump();
            Punct::PipePipe
        } else if two(b'<', b'<') {
            self.bump();
            self.bump();
            Punct::Shl
        } else if two(b'>', b'>') {
            self.bump();
            self.bump();
            Punct::Shr
        } else if two(b'+', b'+') {
            self.bump();
            self.bump();
            Punct::PlusPlus
        } else if two(b'-', b'-') {
            self.bump();
            self.bump();
            Punct::MinusMinus
        } else {
            let b = self.bump().ok_or_else(|| LexError { message: "unexpected end of input".into(), pos })?;
            match b {
                b'(' => Punct::LParen,
                b')' => Punct::RParen,
                b'{' => Punct::LBrace,
                b'}' => Punct::RBrace,
                b'[' => Punct::LBracket,
                b']' => Punct::RBracket,
                b';' => Punct::Semicolon,
                b',' => Punct::Comma,
                b'+' => Punct::Plus,
                b'-' => Punct::Minus,
                b'*' => Punct::Star,
                b'/' => Punct::Slash,
                b'%' => Punct::Percent,
                b'=' => Punct::Assign,
                b'<' => Punct::Lt,
                b'>' => Punct::Gt,
                b'&' => Punct::Amp,
                b'|' => Punct::Pipe,
                b'^' => Punct::Caret,
                b'~' => Punct::Tilde,
                b'!' => Punct::Bang,
                other => {
                    return Err(LexError {
                        message: format!("unexpected byte 0x{other:02x}"),
                        pos,
                    })
                }
            }
        };
        Ok(Token { kind: TokenKind::Punct(p), pos })
    }
}
