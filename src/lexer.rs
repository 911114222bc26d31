use crate::error::report_syntax_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Dot,
    Comma,
    Semicolon,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Ampersand,
    Pipe,
    Tilde,
    Greater,
    Less,
    Equal,
    Bang,
    EqualEqual,
    GreaterEqual,
    LessEqual,
    BangEqual,
    StarStar,
    ShiftLeft,
    ShiftRight,
    Identifier,
    Str,
    Integer,
    Float,
    Or,
    And,
    Class,
    Fun,
    If,
    Else,
    For,
    While,
    Var,
    Nil,
    True,
    False,
    Return,
    This,
    Super,
    Del,
    Break,
    Continue,
    Print,
    Inf,
    Nan,
    EndOfFile,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Str(String),
    Integer(i64),
    Float(f64),
}

/// A token referencing its source span; `lexeme` recovers the exact slice.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub length: usize,
    pub line: usize,
    pub literal: Literal,
}

impl Token {
    pub fn lexeme<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.start + self.length]
    }
}

pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    file: &'a str,
    start: usize,
    current: usize,
    line: usize,
    errored: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            file,
            start: 0,
            current: 0,
            line: 1,
            errored: false,
        }
    }

    /// Scans the whole input, reporting errors as they are found so that
    /// several can surface in one pass. Always ends with an EndOfFile token.
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while !self.at_end() {
            self.start = self.current;
            if let Some(token) = self.scan_token() {
                tokens.push(token);
            }
        }
        tokens.push(Token {
            kind: TokenKind::EndOfFile,
            start: self.source.len(),
            length: 0,
            line: self.line,
            literal: Literal::None,
        });
        tokens
    }

    pub fn had_error(&self) -> bool {
        self.errored
    }

    fn scan_token(&mut self) -> Option<Token> {
        use TokenKind::*;
        let byte = self.advance();
        match byte {
            b' ' | b'\t' | b'\r' => None,
            b'\n' => {
                self.line += 1;
                None
            }
            b'(' => self.token(LeftParen),
            b')' => self.token(RightParen),
            b'{' => self.token(LeftBrace),
            b'}' => self.token(RightBrace),
            b'[' => self.token(LeftBracket),
            b']' => self.token(RightBracket),
            b'.' => self.token(Dot),
            b',' => self.token(Comma),
            b';' => self.token(Semicolon),
            b':' => self.token(Colon),
            b'+' => self.token(Plus),
            b'-' => self.token(Minus),
            b'%' => self.token(Percent),
            b'^' => self.token(Caret),
            b'&' => self.token(Ampersand),
            b'|' => self.token(Pipe),
            b'~' => self.token(Tilde),
            b'*' => {
                let kind = if self.matches(b'*') { StarStar } else { Star };
                self.token(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') { EqualEqual } else { Equal };
                self.token(kind)
            }
            b'!' => {
                let kind = if self.matches(b'=') { BangEqual } else { Bang };
                self.token(kind)
            }
            b'>' => {
                let kind = if self.matches(b'=') {
                    GreaterEqual
                } else if self.matches(b'>') {
                    ShiftRight
                } else {
                    Greater
                };
                self.token(kind)
            }
            b'<' => {
                let kind = if self.matches(b'=') {
                    LessEqual
                } else if self.matches(b'<') {
                    ShiftLeft
                } else {
                    Less
                };
                self.token(kind)
            }
            b'/' => {
                if self.matches(b'/') {
                    while !self.at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                    None
                } else if self.matches(b'*') {
                    self.block_comment();
                    None
                } else {
                    self.token(Slash)
                }
            }
            b'"' | b'\'' => self.string(byte),
            b'0'..=b'9' => self.number(),
            byte if is_identifier_start(byte) => Some(self.identifier()),
            byte => {
                self.error(
                    "SyntaxError",
                    &format!("unexpected character '{}'", byte as char),
                );
                None
            }
        }
    }

    /// Block comments nest; EOF before the closing delimiter is an error.
    fn block_comment(&mut self) {
        let mut depth = 1usize;
        while depth > 0 {
            if self.at_end() {
                self.error("SyntaxError", "unexpected EOF in block comment");
                return;
            }
            match self.advance() {
                b'\n' => self.line += 1,
                b'/' if self.matches(b'*') => depth += 1,
                b'*' if self.matches(b'/') => depth -= 1,
                _ => {}
            }
        }
    }

    fn string(&mut self, delimiter: u8) -> Option<Token> {
        while !self.at_end() && self.peek() != delimiter {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.at_end() {
            self.error("SyntaxError", "unterminated string");
            return None;
        }
        self.advance();
        let text = self.source[self.start + 1..self.current - 1].to_string();
        self.token_with_literal(TokenKind::Str, Literal::Str(text))
    }

    fn number(&mut self) -> Option<Token> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
            let text = &self.source[self.start..self.current];
            let value: f64 = text.parse().unwrap_or(f64::NAN);
            return self.token_with_literal(TokenKind::Float, Literal::Float(value));
        }
        let text = &self.source[self.start..self.current];
        match text.parse::<i64>() {
            Ok(value) => self.token_with_literal(TokenKind::Integer, Literal::Integer(value)),
            Err(_) => {
                self.error("OverflowError", "integer is too big");
                None
            }
        }
    }

    fn identifier(&mut self) -> Token {
        while is_identifier_part(self.peek()) {
            self.advance();
        }
        let text = &self.source[self.start..self.current];
        let kind = keyword(text).unwrap_or(TokenKind::Identifier);
        let literal = match kind {
            TokenKind::Inf => Literal::Float(f64::INFINITY),
            TokenKind::Nan => Literal::Float(f64::NAN),
            _ => Literal::Str(text.to_string()),
        };
        Token {
            kind,
            start: self.start,
            length: self.current - self.start,
            line: self.line,
            literal,
        }
    }

    /// Tokens without a dedicated literal carry their own lexeme.
    fn token(&self, kind: TokenKind) -> Option<Token> {
        let lexeme = self.source[self.start..self.current].to_string();
        self.token_with_literal(kind, Literal::Str(lexeme))
    }

    fn token_with_literal(&self, kind: TokenKind, literal: Literal) -> Option<Token> {
        Some(Token {
            kind,
            start: self.start,
            length: self.current - self.start,
            line: self.line,
            literal,
        })
    }

    fn advance(&mut self) -> u8 {
        let byte = self.bytes[self.current];
        self.current += 1;
        byte
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.at_end() || self.bytes[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn peek(&self) -> u8 {
        if self.at_end() {
            0
        } else {
            self.bytes[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.bytes.len() {
            0
        } else {
            self.bytes[self.current + 1]
        }
    }

    fn at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn error(&mut self, kind: &str, message: &str) {
        let context = &self.source[self.start..self.current.min(self.source.len())];
        report_syntax_error(self.file, self.line, context, kind, message);
        self.errored = true;
    }
}

fn is_identifier_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_identifier_part(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn keyword(text: &str) -> Option<TokenKind> {
    use TokenKind::*;
    let kind = match text {
        "or" => Or,
        "and" => And,
        "class" => Class,
        "fun" => Fun,
        "if" => If,
        "else" => Else,
        "for" => For,
        "while" => While,
        "var" => Var,
        "nil" => Nil,
        "true" => True,
        "false" => False,
        "return" => Return,
        "this" => This,
        "super" => Super,
        "del" => Del,
        "break" => Break,
        "continue" => Continue,
        "print" => Print,
        "inf" => Inf,
        "nan" => Nan,
        _ => return None,
    };
    Some(kind)
}
