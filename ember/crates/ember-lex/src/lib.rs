//! Lexical analyzer (tokenizer)
//!
//! ============================================================================
//! LEXICAL ANALYSIS THEORY
//! ============================================================================
//!
//! Lexical analysis is the first phase of compilation. It transforms a
//! stream of characters into a stream of tokens, also called "tokenization"
//! or "scanning".
//!
//! The lexer is a function L: Σ* → T* where Σ is the source alphabet and T
//! is the set of tokens. It runs in linear time, single-pass, and is
//! context-free: the meaning of a token never depends on tokens around it
//! (unlike, say, the parser's notion of which names are in scope).
//!
//! LEXEME vs TOKEN:
//! ----------------
//! - Lexeme: the actual string of characters (`"local"`, `"42"`, `"=="`)
//! - Token: the abstract category plus any payload (`Token::Local`,
//!   `Token::Number(42.0)`, `Token::EqEq`)
//!
//! ============================================================================
//! LONG-BRACKET STRINGS AND COMMENTS
//! ============================================================================
//!
//! `[[ ... ]]` delimits a string (or, after `--`, a comment) that does not
//! process escapes and may itself contain an arbitrary nesting *level*:
//! `[=[ ... ]=]`, `[==[ ... ]==]`, and so on, where the closing bracket must
//! repeat the same number of `=` signs as the opening one. This lets a
//! long-bracket literal contain `]]` as plain text as long as it's wrapped
//! in one more level of `=` than the content uses.
//!
//! ============================================================================
//! SOURCE LOCATION TRACKING
//! ============================================================================
//!
//! For error reporting the lexer tracks a byte offset, a 1-based line
//! number, and a 1-based column, and hands all three to
//! [`ember_util::DiagnosticBuilder`] when it reports a lexical error.

use ember_util::{DiagnosticBuilder, Handler, Span};

/// A lexical token.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    // Reserved words.
    And,
    Or,
    Not,
    If,
    Then,
    Else,
    Elseif,
    End,
    While,
    Do,
    Repeat,
    Until,
    For,
    In,
    Function,
    Local,
    Return,
    Break,
    Nil,
    True,
    False,

    /// Identifier. Not yet interned; `ember-par` interns identifiers used
    /// as globals or table-constructor keys into the constant table.
    Ident(String),
    /// A numeric literal, already parsed to its `f64` value (Lua has one
    /// numeric type; there is no separate integer token).
    Number(f64),
    /// A string literal with escapes already resolved (or, for a
    /// long-bracket string, copied verbatim).
    Str(String),

    // Operators and punctuation.
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,
    EqEq,
    NotEq,
    LtEq,
    GtEq,
    Lt,
    Gt,
    Eq,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    DoubleColon,
    Semi,
    Colon,
    Comma,
    Dot,
    DotDot,
    Ellipsis,

    Eof,
    /// Unrecognized character; the lexer has already reported an error for
    /// it and emits this so the parser can resynchronize rather than abort
    /// immediately.
    Invalid(String),
}

impl Token {
    fn keyword(ident: &str) -> Option<Token> {
        Some(match ident {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "elseif" => Token::Elseif,
            "end" => Token::End,
            "while" => Token::While,
            "do" => Token::Do,
            "repeat" => Token::Repeat,
            "until" => Token::Until,
            "for" => Token::For,
            "in" => Token::In,
            "function" => Token::Function,
            "local" => Token::Local,
            "return" => Token::Return,
            "break" => Token::Break,
            "nil" => Token::Nil,
            "true" => Token::True,
            "false" => Token::False,
            _ => return None,
        })
    }
}

/// Tokenizes source text into a single-token lookahead stream.
///
/// The interface the parser drives is `peek`/`advance` (via
/// [`Lexer::next_token`]) plus `current_line` for diagnostics; `ember-par`
/// keeps its own one-token lookahead buffer rather than asking the lexer
/// to buffer it, so `Lexer` itself is a plain forward-only scanner.
#[derive(Clone)]
pub struct Lexer<'source> {
    source: &'source str,
    bytes: &'source [u8],
    position: usize,
    token_start: usize,
    line: u32,
    token_start_line: u32,
    handler: &'source Handler,
}

impl<'source> Lexer<'source> {
    /// `Handler` collects diagnostics through interior mutability, so the
    /// lexer only needs a shared reference -- a caller (`ember-par`) can
    /// hold its own `&Handler` alongside the lexer for its own syntax
    /// errors.
    pub fn new(source: &'source str, handler: &'source Handler) -> Self {
        Lexer {
            source,
            bytes: source.as_bytes(),
            position: 0,
            token_start: 0,
            line: 1,
            token_start_line: 1,
            handler,
        }
    }

    pub fn current_line(&self) -> u32 {
        self.token_start_line
    }

    /// Scans and returns the next token, skipping whitespace and comments
    /// first.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();
        self.token_start = self.position;
        self.token_start_line = self.line;

        if self.is_at_end() {
            return Token::Eof;
        }

        let c = self.current_byte();
        match c {
            b'+' => self.consume(Token::Plus),
            b'-' => self.consume(Token::Minus),
            b'*' => self.consume(Token::Star),
            b'/' => self.consume(Token::Slash),
            b'%' => self.consume(Token::Percent),
            b'^' => self.consume(Token::Caret),
            b'#' => self.consume(Token::Hash),
            b'(' => self.consume(Token::LParen),
            b')' => self.consume(Token::RParen),
            b'{' => self.consume(Token::LBrace),
            b'}' => self.consume(Token::RBrace),
            b']' => self.consume(Token::RBracket),
            b';' => self.consume(Token::Semi),
            b',' => self.consume(Token::Comma),
            b'=' => {
                self.advance();
                if self.match_byte(b'=') {
                    Token::EqEq
                } else {
                    Token::Eq
                }
            }
            b'~' => {
                self.advance();
                if self.match_byte(b'=') {
                    Token::NotEq
                } else {
                    self.invalid_char('~')
                }
            }
            b'<' => {
                self.advance();
                if self.match_byte(b'=') {
                    Token::LtEq
                } else {
                    Token::Lt
                }
            }
            b'>' => {
                self.advance();
                if self.match_byte(b'=') {
                    Token::GtEq
                } else {
                    Token::Gt
                }
            }
            b':' => {
                self.advance();
                if self.match_byte(b':') {
                    Token::DoubleColon
                } else {
                    Token::Colon
                }
            }
            b'.' => self.lex_dot(),
            b'[' => self.lex_bracket(),
            b'"' | b'\'' => self.lex_short_string(c),
            c if c.is_ascii_digit() => self.lex_number(),
            c if is_ident_start(c) => self.lex_identifier(),
            _ => {
                let ch = self.current_char();
                self.advance();
                self.report_error(format!("unexpected symbol near '{ch}'"));
                Token::Invalid(ch.to_string())
            }
        }
    }

    fn consume(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    fn invalid_char(&mut self, c: char) -> Token {
        self.report_error(format!("unexpected symbol near '{c}'"));
        Token::Invalid(c.to_string())
    }

    fn lex_dot(&mut self) -> Token {
        self.advance();
        if self.match_byte(b'.') {
            if self.match_byte(b'.') {
                Token::Ellipsis
            } else {
                Token::DotDot
            }
        } else if self.current_byte().is_ascii_digit() {
            self.position = self.token_start;
            self.lex_number()
        } else {
            Token::Dot
        }
    }

    /// `[` may start `[[` / `[=[...` long-bracket strings, or just be a
    /// plain `LBracket`.
    fn lex_bracket(&mut self) -> Token {
        if let Some(level) = self.peek_long_bracket_open() {
            let start = self.token_start_line;
            match self.read_long_bracket(level) {
                Some(content) => Token::Str(content),
                None => {
                    self.report_error_at(start, "unterminated long string".to_string());
                    Token::Invalid("[[".to_string())
                }
            }
        } else {
            self.consume(Token::LBracket)
        }
    }

    /// Looks ahead from the current `[` for a long-bracket opener
    /// (`[`, then N `=`, then `[`), returning `N` without consuming
    /// anything if it matches, or `None` (leaving position untouched) if
    /// not.
    fn peek_long_bracket_open(&self) -> Option<usize> {
        let mut i = self.position + 1;
        let mut level = 0usize;
        while self.bytes.get(i) == Some(&b'=') {
            level += 1;
            i += 1;
        }
        if self.bytes.get(i) == Some(&b'[') {
            Some(level)
        } else {
            None
        }
    }

    fn read_long_bracket(&mut self, level: usize) -> Option<String> {
        // Consume the opener: `[`, `level` `=`s, `[`.
        self.advance();
        for _ in 0..level {
            self.advance();
        }
        self.advance();
        // A newline immediately after the opener is not part of the
        // content.
        if self.current_byte() == b'\r' {
            self.advance();
        }
        if self.current_byte() == b'\n' {
            self.advance();
        }

        let content_start = self.position;
        loop {
            if self.is_at_end() {
                return None;
            }
            if self.current_byte() == b']' {
                let mark = self.position;
                let mut i = self.position + 1;
                let mut seen = 0usize;
                while self.bytes.get(i) == Some(&b'=') {
                    seen += 1;
                    i += 1;
                }
                if seen == level && self.bytes.get(i) == Some(&b']') {
                    let content = self.source[content_start..mark].to_string();
                    self.position = i + 1;
                    return Some(content);
                }
            }
            self.advance();
        }
    }

    fn lex_short_string(&mut self, quote: u8) -> Token {
        self.advance();
        let mut out = String::new();
        loop {
            if self.is_at_end() || self.current_byte() == b'\n' {
                self.report_error("unterminated string".to_string());
                return Token::Invalid(out);
            }
            let b = self.current_byte();
            if b == quote {
                self.advance();
                return Token::Str(out);
            }
            if b == b'\\' {
                self.advance();
                match self.lex_escape() {
                    Some(c) => out.push(c),
                    None => return Token::Invalid(out),
                }
            } else {
                out.push(self.current_char());
                self.advance();
            }
        }
    }

    fn lex_escape(&mut self) -> Option<char> {
        if self.is_at_end() {
            self.report_error("unterminated string".to_string());
            return None;
        }
        let b = self.current_byte();
        let resolved = match b {
            b'n' => Some('\n'),
            b't' => Some('\t'),
            b'r' => Some('\r'),
            b'a' => Some('\u{7}'),
            b'b' => Some('\u{8}'),
            b'f' => Some('\u{c}'),
            b'v' => Some('\u{b}'),
            b'\\' => Some('\\'),
            b'"' => Some('"'),
            b'\'' => Some('\''),
            b'\n' => Some('\n'),
            d if d.is_ascii_digit() => {
                let mut value: u32 = 0;
                let mut count = 0;
                while count < 3 && self.current_byte().is_ascii_digit() {
                    value = value * 10 + (self.current_byte() - b'0') as u32;
                    self.advance();
                    count += 1;
                }
                return char::from_u32(value);
            }
            other => {
                self.report_error(format!("invalid escape sequence '\\{}'", other as char));
                None
            }
        };
        if resolved.is_some() {
            self.advance();
        }
        resolved
    }

    fn lex_number(&mut self) -> Token {
        let start = self.position;
        if self.current_byte() == b'0'
            && matches!(self.peek_byte(1), Some(b'x') | Some(b'X'))
        {
            self.advance();
            self.advance();
            let hex_start = self.position;
            while self.current_byte().is_ascii_hexdigit() {
                self.advance();
            }
            let text = &self.source[hex_start..self.position];
            return match u64::from_str_radix(text, 16) {
                Ok(v) => Token::Number(v as f64),
                Err(_) => {
                    self.report_error("malformed number".to_string());
                    Token::Invalid(self.source[start..self.position].to_string())
                }
            };
        }

        while self.current_byte().is_ascii_digit() {
            self.advance();
        }
        if self.current_byte() == b'.' {
            self.advance();
            while self.current_byte().is_ascii_digit() {
                self.advance();
            }
        }
        if matches!(self.current_byte(), b'e' | b'E') {
            let save = self.position;
            self.advance();
            if matches!(self.current_byte(), b'+' | b'-') {
                self.advance();
            }
            if self.current_byte().is_ascii_digit() {
                while self.current_byte().is_ascii_digit() {
                    self.advance();
                }
            } else {
                self.position = save;
            }
        }

        let text = &self.source[start..self.position];
        match text.parse::<f64>() {
            Ok(v) => Token::Number(v),
            Err(_) => {
                self.report_error(format!("malformed number near '{text}'"));
                Token::Invalid(text.to_string())
            }
        }
    }

    fn lex_identifier(&mut self) -> Token {
        let start = self.position;
        while is_ident_continue(self.current_byte()) {
            self.advance();
        }
        let text = &self.source[start..self.position];
        Token::keyword(text).unwrap_or_else(|| Token::Ident(text.to_string()))
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.current_byte() {
                b' ' | b'\t' | b'\r' => self.advance(),
                b'\n' => self.advance(),
                b'-' if self.peek_byte(1) == Some(b'-') => {
                    self.advance();
                    self.advance();
                    if let Some(level) = self.peek_long_bracket_open() {
                        if self.read_long_bracket(level).is_none() {
                            self.report_error("unterminated long comment".to_string());
                            return;
                        }
                    } else {
                        while !self.is_at_end() && self.current_byte() != b'\n' {
                            self.advance();
                        }
                    }
                }
                _ => return,
            }
        }
    }

    #[inline]
    fn current_byte(&self) -> u8 {
        self.bytes.get(self.position).copied().unwrap_or(0)
    }

    #[inline]
    fn peek_byte(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.position + offset).copied()
    }

    fn current_char(&self) -> char {
        self.source[self.position..].chars().next().unwrap_or('\0')
    }

    fn advance(&mut self) {
        if let Some(c) = self.source.get(self.position..).and_then(|s| s.chars().next()) {
            self.position += c.len_utf8();
            if c == '\n' {
                self.line += 1;
            }
        } else {
            self.position += 1;
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.current_byte() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.bytes.len()
    }

    fn report_error(&mut self, message: String) {
        self.report_error_at(self.token_start_line, message);
    }

    fn report_error_at(&mut self, line: u32, message: String) {
        let span = Span::point(line, 1);
        DiagnosticBuilder::error(message).span(span).emit(self.handler);
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        match self.next_token() {
            Token::Eof => None,
            token => Some(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let handler = Handler::new();
        let lexer = Lexer::new(src, &handler);
        lexer.collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            tokens("local x = true"),
            vec![
                Token::Local,
                Token::Ident("x".into()),
                Token::Eq,
                Token::True,
            ]
        );
    }

    #[test]
    fn numbers_decimal_hex_and_exponent() {
        assert_eq!(tokens("10"), vec![Token::Number(10.0)]);
        assert_eq!(tokens("0x1A"), vec![Token::Number(26.0)]);
        assert_eq!(tokens("3.5e2"), vec![Token::Number(350.0)]);
        assert_eq!(tokens(".5"), vec![Token::Number(0.5)]);
    }

    #[test]
    fn short_strings_with_escapes() {
        assert_eq!(
            tokens(r#""hi\nthere""#),
            vec![Token::Str("hi\nthere".to_string())]
        );
    }

    #[test]
    fn long_bracket_string_with_level() {
        assert_eq!(
            tokens("[==[a]]b]==]"),
            vec![Token::Str("a]]b".to_string())]
        );
    }

    #[test]
    fn long_bracket_string_skips_leading_newline() {
        assert_eq!(tokens("[[\nhello]]"), vec![Token::Str("hello".to_string())]);
    }

    #[test]
    fn line_comment_is_skipped() {
        assert_eq!(
            tokens("local x -- comment\nlocal y"),
            vec![
                Token::Local,
                Token::Ident("x".into()),
                Token::Local,
                Token::Ident("y".into()),
            ]
        );
    }

    #[test]
    fn long_comment_is_skipped() {
        assert_eq!(
            tokens("local x --[[ long\ncomment ]] local y"),
            vec![
                Token::Local,
                Token::Ident("x".into()),
                Token::Local,
                Token::Ident("y".into()),
            ]
        );
    }

    #[test]
    fn operators_and_punctuation() {
        assert_eq!(
            tokens("== ~= <= >= < > .. ... :: #"),
            vec![
                Token::EqEq,
                Token::NotEq,
                Token::LtEq,
                Token::GtEq,
                Token::Lt,
                Token::Gt,
                Token::DotDot,
                Token::Ellipsis,
                Token::DoubleColon,
                Token::Hash,
            ]
        );
    }

    #[test]
    fn unterminated_string_reports_error() {
        let handler = Handler::new();
        let mut lexer = Lexer::new("\"abc", &handler);
        let _ = lexer.next_token();
        assert!(handler.has_errors());
    }
}
