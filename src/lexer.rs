use thiserror::Error;

pub mod token;

use token::{Position, Token, TokenKind, lookup_ident};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("unexpected digit '0' in {position}")]
    LeadingZero { position: Position },
    #[error("unexpected token: expected digits in {position}")]
    MissingFractionDigits { position: Position },
    #[error("digit expected for number exponent in {position}")]
    MissingExponentDigits { position: Position },
    #[error("unsupported escape character in {position}")]
    UnsupportedEscape { position: Position },
    #[error("cannot contain control characters in strings in {position}")]
    ControlCharacterInString { position: Position },
    #[error("unclosed string in {position}")]
    UnclosedString { position: Position },
    #[error("unexpected character {character:?} in {position}")]
    UnexpectedCharacter { character: char, position: Position },
}

// One-rune lookahead over the source; the token spelling accumulates in
// `buffer` with string escapes decoded on the way in. Errors are recorded
// and do not stop token production.
pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    position: Position,
    buffer: String,
    errors: Vec<LexError>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            position: Position { line: 1, column: 0 },
            buffer: String::new(),
            errors: Vec::new(),
        }
    }

    /// Errors recorded so far; the list keeps growing as tokens are pulled.
    pub fn errors(&self) -> &[LexError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<LexError> {
        std::mem::take(&mut self.errors)
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        self.buffer.clear();

        match self.peek_char() {
            Some(delim @ ('"' | '\'')) => {
                self.skip();
                self.read_string(delim);
                return self.emit(TokenKind::String);
            }
            None => return self.emit(TokenKind::Eof),
            _ => {}
        }

        let ch = match self.next() {
            Some(ch) => ch,
            None => return self.emit(TokenKind::Eof),
        };
        match ch {
            '=' => {
                if self.peek_char() == Some('=') {
                    self.next();
                    self.emit(TokenKind::Eq)
                } else {
                    self.emit(TokenKind::Assign)
                }
            }
            '!' => {
                if self.peek_char() == Some('=') {
                    self.next();
                    self.emit(TokenKind::NotEq)
                } else {
                    self.emit(TokenKind::Bang)
                }
            }
            '+' => self.emit(TokenKind::Plus),
            '-' => self.emit(TokenKind::Minus),
            '*' => self.emit(TokenKind::Asterisk),
            '/' => self.emit(TokenKind::Slash),
            '|' => self.emit(TokenKind::Pipeline),
            '<' => self.emit(TokenKind::Lt),
            '>' => self.emit(TokenKind::Gt),
            ',' => self.emit(TokenKind::Comma),
            ';' => self.emit(TokenKind::Semicolon),
            ':' => self.emit(TokenKind::Colon),
            '[' => self.emit(TokenKind::LBracket),
            ']' => self.emit(TokenKind::RBracket),
            '(' => self.emit(TokenKind::LParen),
            ')' => self.emit(TokenKind::RParen),
            '{' => self.emit(TokenKind::LBrace),
            '}' => self.emit(TokenKind::RBrace),
            ch if is_letter(ch) => {
                self.read_identifier();
                self.emit(lookup_ident(&self.buffer))
            }
            ch if ch.is_ascii_digit() => {
                self.read_number(ch);
                self.emit(TokenKind::Number)
            }
            ch => {
                self.record(LexError::UnexpectedCharacter {
                    character: ch,
                    position: self.position,
                });
                self.emit(TokenKind::Illegal)
            }
        }
    }

    // Identifiers are ASCII letters and underscore only; digits never
    // continue an identifier.
    fn read_identifier(&mut self) {
        while let Some(ch) = self.peek_char() {
            if !is_letter(ch) {
                break;
            }
            self.next();
        }
    }

    fn read_number(&mut self, first: char) {
        if first == '0' && self.peek_char().is_some_and(|ch| ch.is_ascii_digit()) {
            self.record(LexError::LeadingZero {
                position: self.position,
            });
            return;
        }
        self.consume_digits();

        if self.peek_char() == Some('.') {
            self.next();
            if !self.peek_char().is_some_and(|ch| ch.is_ascii_digit()) {
                self.record(LexError::MissingFractionDigits {
                    position: self.position,
                });
                return;
            }
            self.consume_digits();
        }

        if matches!(self.peek_char(), Some('e' | 'E')) {
            self.next();
            if matches!(self.peek_char(), Some('+' | '-')) {
                self.next();
            }
            if !self.peek_char().is_some_and(|ch| ch.is_ascii_digit()) {
                self.record(LexError::MissingExponentDigits {
                    position: self.position,
                });
                return;
            }
            self.consume_digits();
        }
    }

    fn consume_digits(&mut self) {
        while self.peek_char().is_some_and(|ch| ch.is_ascii_digit()) {
            self.next();
        }
    }

    // The opening delimiter has already been skipped; the closing one is
    // skipped too, so the buffer holds the decoded content only.
    fn read_string(&mut self, delim: char) {
        loop {
            match self.peek_char() {
                Some(ch) if ch == delim => {
                    self.skip();
                    return;
                }
                Some('\\') => {
                    self.skip();
                    match self.peek_char() {
                        Some(ch) if ch == delim => {
                            self.next();
                        }
                        Some('b') => self.decode_escape('\u{0008}'),
                        Some('f') => self.decode_escape('\u{000C}'),
                        Some('n') => self.decode_escape('\n'),
                        Some('r') => self.decode_escape('\r'),
                        Some('t') => self.decode_escape('\t'),
                        _ => {
                            self.record(LexError::UnsupportedEscape {
                                position: self.position,
                            });
                            return;
                        }
                    }
                }
                Some(ch) if ch.is_control() => {
                    self.record(LexError::ControlCharacterInString {
                        position: self.position,
                    });
                    return;
                }
                Some(_) => {
                    self.next();
                }
                None => {
                    self.record(LexError::UnclosedString {
                        position: self.position,
                    });
                    return;
                }
            }
        }
    }

    fn decode_escape(&mut self, decoded: char) {
        self.skip();
        self.buffer.push(decoded);
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.skip();
        }
    }

    fn emit(&mut self, kind: TokenKind) -> Token {
        Token::new(kind, std::mem::take(&mut self.buffer))
    }

    fn record(&mut self, error: LexError) {
        self.errors.push(error);
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    /// Consumes one rune into the token buffer.
    fn next(&mut self) -> Option<char> {
        let ch = self.advance()?;
        self.buffer.push(ch);
        Some(ch)
    }

    /// Consumes one rune without buffering it (delimiters, escapes).
    fn skip(&mut self) -> Option<char> {
        self.advance()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        if ch == '\n' {
            self.position = Position {
                line: self.position.line + 1,
                column: 0,
            };
        }
        self.position.column += ch.len_utf8();
        self.pos += ch.len_utf8();
        Some(ch)
    }
}

fn is_letter(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

/// Pulls every token up to and including EOF.
pub fn tokenize(input: &str) -> (Vec<Token>, Vec<LexError>) {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token();
        let is_eof = token.kind == TokenKind::Eof;
        tokens.push(token);
        if is_eof {
            break;
        }
    }
    let errors = lexer.take_errors();
    (tokens, errors)
}
