use super::ast::{Location, Span};
use super::error::{CompileError, ErrorCode};
use crate::runtime::date;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    String(String),
    Date(f64),

    // Identifiers & keywords
    Ident(String),
    Keyword(Keyword),

    // Punctuation
    LParen,
    RParen,
    Comma,
    Dot,
    Colon,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Backslash,
    Caret,
    Ampersand,
    Eq,
    Ne, // <>
    Lt,
    Gt,
    Le, // <=
    Ge, // >=

    // Special
    Newline,
    Eof,
}

macro_rules! keywords {
    ($($variant:ident => $text:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Keyword {
            $($variant),*
        }

        impl Keyword {
            /// Case-insensitive keyword lookup.
            pub fn from_word(word: &str) -> Option<Keyword> {
                let lower = word.to_ascii_lowercase();
                match lower.as_str() {
                    $($text => Some(Keyword::$variant),)*
                    _ => None,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Keyword::$variant => $text),*
                }
            }
        }
    };
}

keywords! {
    And => "and",
    ByRef => "byref",
    ByVal => "byval",
    Call => "call",
    Case => "case",
    Class => "class",
    Const => "const",
    Default => "default",
    Dim => "dim",
    Do => "do",
    Each => "each",
    Else => "else",
    ElseIf => "elseif",
    Empty => "empty",
    End => "end",
    Eqv => "eqv",
    Erase => "erase",
    Error => "error",
    Exit => "exit",
    Explicit => "explicit",
    False => "false",
    For => "for",
    Function => "function",
    Get => "get",
    GoTo => "goto",
    If => "if",
    Imp => "imp",
    In => "in",
    Is => "is",
    Let => "let",
    Loop => "loop",
    Me => "me",
    Mod => "mod",
    New => "new",
    Next => "next",
    Not => "not",
    Nothing => "nothing",
    Null => "null",
    On => "on",
    Option => "option",
    Or => "or",
    Preserve => "preserve",
    Private => "private",
    Property => "property",
    Public => "public",
    ReDim => "redim",
    Resume => "resume",
    Select => "select",
    Set => "set",
    Step => "step",
    Sub => "sub",
    Then => "then",
    To => "to",
    True => "true",
    Until => "until",
    Wend => "wend",
    While => "while",
    With => "with",
    Xor => "xor",
}

impl Keyword {
    /// Keywords that may still be used as variable or member names.
    pub fn is_contextual(self) -> bool {
        matches!(
            self,
            Keyword::Default
                | Keyword::Error
                | Keyword::Explicit
                | Keyword::Get
                | Keyword::Preserve
                | Keyword::Property
                | Keyword::Resume
                | Keyword::Step
        )
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Tokenize a whole buffer. Lexical errors are collected, never fatal.
pub fn lex(source: &str) -> (Vec<SpannedToken>, Vec<CompileError>) {
    let mut lexer = Lexer::new(source);
    let tokens: Vec<SpannedToken> = lexer.by_ref().collect();
    (tokens, lexer.take_errors())
}

/// A lazy token stream. Ends with exactly one `Eof`; `restart` rewinds to
/// the beginning of the buffer.
pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    /// Suppresses repeated and leading newlines.
    at_line_start: bool,
    /// The previous token was a `.`, so the next word is a member name.
    after_dot: bool,
    done: bool,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
            at_line_start: true,
            after_dot: false,
            done: false,
            errors: Vec::new(),
        }
    }

    pub fn restart(&mut self) {
        *self = Self::new(self.source);
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<CompileError> {
        std::mem::take(&mut self.errors)
    }

    fn location(&self) -> Location {
        Location::new(self.pos, self.line, self.column)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    /// Consume one character, keeping line and column current.
    fn bump(&mut self) -> Option<char> {
        let ch = self.source[self.pos..].chars().next()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&mut self, code: ErrorCode, message: impl Into<String>, start: Location) {
        let span = Span::new(start, self.location());
        self.errors.push(CompileError::lexer(code, message, span));
    }

    fn skip_to_line_end(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' || b == b'\r' {
                break;
            }
            self.bump();
        }
    }

    /// `_` at the end of a line joins it with the next one.
    fn line_continuation(&self) -> Option<usize> {
        let mut i = self.pos + 1;
        while matches!(self.bytes.get(i), Some(b' ' | b'\t')) {
            i += 1;
        }
        match self.bytes.get(i) {
            Some(b'\r') if self.bytes.get(i + 1) == Some(&b'\n') => Some(i + 2),
            Some(b'\r' | b'\n') => Some(i + 1),
            None => Some(i),
            _ => None,
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' => {
                    self.bump();
                }
                b'\'' => self.skip_to_line_end(),
                b'_' => match self.line_continuation() {
                    Some(end) => {
                        while self.pos < end {
                            self.bump();
                        }
                    }
                    None => break,
                },
                b'r' | b'R' if self.is_rem() => self.skip_to_line_end(),
                _ => break,
            }
        }
    }

    fn is_rem(&self) -> bool {
        let word = self.bytes.get(self.pos..self.pos + 3);
        word.is_some_and(|w| w.eq_ignore_ascii_case(b"rem"))
            && !self.peek_at(3).is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
            && !self.after_dot
    }

    fn next_token(&mut self) -> Option<SpannedToken> {
        loop {
            self.skip_whitespace_and_comments();
            let start = self.location();
            let Some(ch) = self.peek() else {
                if self.done {
                    return None;
                }
                self.done = true;
                return Some(SpannedToken {
                    token: Token::Eof,
                    span: Span::at(start),
                });
            };

            if ch == b'\n' || ch == b'\r' {
                while matches!(self.peek(), Some(b'\n' | b'\r')) {
                    self.bump();
                }
                if self.at_line_start {
                    continue;
                }
                self.at_line_start = true;
                return Some(self.spanned(Token::Newline, start));
            }

            let token = match ch {
                b'(' => self.single(Token::LParen),
                b')' => self.single(Token::RParen),
                b',' => self.single(Token::Comma),
                b':' => self.single(Token::Colon),
                b'+' => self.single(Token::Plus),
                b'-' => self.single(Token::Minus),
                b'*' => self.single(Token::Star),
                b'/' => self.single(Token::Slash),
                b'\\' => self.single(Token::Backslash),
                b'^' => self.single(Token::Caret),
                b'=' => self.single(Token::Eq),
                b'.' if self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) && !self.after_dot => {
                    self.lex_number(start)
                }
                b'.' => self.single(Token::Dot),
                b'<' => {
                    self.bump();
                    match self.peek() {
                        Some(b'>') => self.single(Token::Ne),
                        Some(b'=') => self.single(Token::Le),
                        _ => Some(Token::Lt),
                    }
                }
                b'>' => {
                    self.bump();
                    if self.peek() == Some(b'=') {
                        self.single(Token::Ge)
                    } else {
                        Some(Token::Gt)
                    }
                }
                b'&' => match self.peek_at(1) {
                    Some(b'h' | b'H') => self.lex_radix(start, 16),
                    Some(b'o' | b'O') => self.lex_radix(start, 8),
                    _ => self.single(Token::Ampersand),
                },
                b'"' => self.lex_string(start),
                b'#' => self.lex_date(start),
                b'[' => self.lex_bracketed(start),
                b'0'..=b'9' => self.lex_number(start),
                b if b.is_ascii_alphabetic() => Some(self.lex_word()),
                _ => {
                    let c = self.bump().unwrap_or('?');
                    self.error(ErrorCode::InvalidCharacter, format!("Invalid character: '{c}'"), start);
                    None
                }
            };

            if let Some(token) = token {
                self.at_line_start = false;
                self.after_dot = token == Token::Dot;
                return Some(self.spanned(token, start));
            }
        }
    }

    fn spanned(&self, token: Token, start: Location) -> SpannedToken {
        SpannedToken {
            token,
            span: Span::new(start, self.location()),
        }
    }

    fn single(&mut self, token: Token) -> Option<Token> {
        self.bump();
        Some(token)
    }

    fn lex_word(&mut self) -> Token {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_') {
            self.bump();
        }
        let word = &self.source[start..self.pos];
        if self.after_dot {
            return Token::Ident(word.to_string());
        }
        match Keyword::from_word(word) {
            Some(k) => Token::Keyword(k),
            None => Token::Ident(word.to_string()),
        }
    }

    fn lex_bracketed(&mut self, start: Location) -> Option<Token> {
        self.bump();
        let name_start = self.pos;
        while self.peek().is_some_and(|b| b != b']' && b != b'\n' && b != b'\r') {
            self.bump();
        }
        let name = self.source[name_start..self.pos].to_string();
        if self.peek() == Some(b']') {
            self.bump();
            Some(Token::Ident(name))
        } else {
            self.error(ErrorCode::ExpectedIdentifier, "Unterminated bracketed identifier", start);
            None
        }
    }

    fn lex_string(&mut self, start: Location) -> Option<Token> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.peek() {
                Some(b'"') if self.peek_at(1) == Some(b'"') => {
                    self.bump();
                    self.bump();
                    value.push('"');
                }
                Some(b'"') => {
                    self.bump();
                    return Some(Token::String(value));
                }
                Some(b'\n' | b'\r') | None => {
                    self.error(ErrorCode::UnterminatedString, "Unterminated string constant", start);
                    return Some(Token::String(value));
                }
                Some(_) => {
                    if let Some(c) = self.bump() {
                        value.push(c);
                    }
                }
            }
        }
    }

    fn lex_date(&mut self, start: Location) -> Option<Token> {
        self.bump();
        let body_start = self.pos;
        while self.peek().is_some_and(|b| b != b'#' && b != b'\n' && b != b'\r') {
            self.bump();
        }
        let body = &self.source[body_start..self.pos];
        if self.peek() != Some(b'#') {
            self.error(ErrorCode::SyntaxError, "Unterminated date literal", start);
            return None;
        }
        self.bump();
        match date::parse(body) {
            Some(d) => Some(Token::Date(d)),
            None => {
                self.error(ErrorCode::SyntaxError, format!("Invalid date literal: #{body}#"), start);
                None
            }
        }
    }

    /// `&H1F`, `&O17`, with an optional trailing `&`. Up to four hex digits
    /// wrap to a 16-bit value, longer literals to 32 bits.
    fn lex_radix(&mut self, start: Location, radix: u32) -> Option<Token> {
        self.bump();
        self.bump();
        let digits_start = self.pos;
        while self.peek().is_some_and(|b| (b as char).is_digit(radix)) {
            self.bump();
        }
        let digits = &self.source[digits_start..self.pos];
        if self.peek() == Some(b'&') {
            self.bump();
        }
        let Ok(raw) = u64::from_str_radix(digits, radix) else {
            self.error(ErrorCode::InvalidNumber, "Invalid number", start);
            return None;
        };
        let value = if raw <= 0xFFFF && (radix != 16 || digits.len() <= 4) {
            i64::from(raw as u16 as i16)
        } else if raw <= 0xFFFF_FFFF {
            i64::from(raw as u32 as i32)
        } else {
            self.error(ErrorCode::InvalidNumber, "Overflow in numeric literal", start);
            return None;
        };
        Some(Token::Int(value))
    }

    fn lex_number(&mut self, start: Location) -> Option<Token> {
        let num_start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some(b'+' | b'-')));
            if self.peek_at(1 + sign).is_some_and(|b| b.is_ascii_digit()) {
                is_float = true;
                for _ in 0..=sign {
                    self.bump();
                }
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.bump();
                }
            }
        }
        let text = &self.source[num_start..self.pos];
        if !is_float {
            if let Ok(v) = text.parse::<i64>() {
                return Some(Token::Int(v));
            }
        }
        match text.parse::<f64>() {
            Ok(v) if v.is_finite() => Some(Token::Float(v)),
            _ => {
                self.error(ErrorCode::InvalidNumber, format!("Invalid number: {text}"), start);
                None
            }
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = SpannedToken;

    fn next(&mut self) -> Option<SpannedToken> {
        self.next_token()
    }
}
