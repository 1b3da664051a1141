//! Char-level MSL scanner, mirrored from `front::wgsl::lexer`'s
//! `Peekable<Chars>` shape over MSL's token set: C-style `//`/`/* */`
//! comments, and the double-bracket `[[` / `]]` pair MSL attributes are
//! written with, which WGSL's `@`-attribute token set has no equivalent
//! for.
use std::iter::Peekable;
use std::str::Chars;

use crate::error::{Diag, DiagCode};
use crate::front::Pos;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    IntLit(i64, IntSuffix),
    FloatLit(f64, FloatSuffix),
    /// `[[`
    AttrOpen,
    /// `]]`
    AttrClose,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Star,
    Amp,
    Eq,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AmpAmp,
    PipePipe,
    Plus,
    Minus,
    Slash,
    Percent,
    Pipe,
    Caret,
    Bang,
    Tilde,
    Shl,
    Shr,
    Eof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntSuffix {
    None,
    U,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatSuffix {
    None,
    F,
    H,
}

pub struct Spanned<T> {
    pub value: T,
    pub pos: Pos,
}

#[derive(Clone)]
pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: u32,
    col: u32,
}
impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            chars: src.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        match c {
            Some('\n') => {
                self.line += 1;
                self.col = 1;
            }
            Some(_) => self.col += 1,
            None => {}
        }
        c
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while !matches!(self.chars.peek(), Some('\n') | None) {
                        self.bump();
                    }
                }
                Some('/') => {
                    let mut clone = self.chars.clone();
                    clone.next();
                    match clone.peek() {
                        Some('/') => {
                            while !matches!(self.chars.peek(), Some('\n') | None) {
                                self.bump();
                            }
                        }
                        Some('*') => {
                            self.bump();
                            self.bump();
                            loop {
                                match self.bump() {
                                    Some('*') if self.chars.peek() == Some(&'/') => {
                                        self.bump();
                                        break;
                                    }
                                    None => break,
                                    _ => {}
                                }
                            }
                        }
                        _ => break,
                    }
                }
                _ => break,
            }
        }
    }

    fn tokenize_number(&mut self) -> Result<Spanned<Token>, Diag> {
        let start = self.pos();
        let mut buf = String::new();
        let mut is_float = false;
        while let Some(c) = self.chars.peek() {
            if c.is_ascii_digit() {
                buf.push(*c);
                self.bump();
            } else {
                break;
            }
        }
        if self.chars.peek() == Some(&'.') {
            is_float = true;
            buf.push('.');
            self.bump();
            while let Some(c) = self.chars.peek() {
                if c.is_ascii_digit() {
                    buf.push(*c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if matches!(self.chars.peek(), Some('e') | Some('E')) {
            is_float = true;
            buf.push('e');
            self.bump();
            if matches!(self.chars.peek(), Some('+') | Some('-')) {
                buf.push(*self.chars.peek().unwrap());
                self.bump();
            }
            while let Some(c) = self.chars.peek() {
                if c.is_ascii_digit() {
                    buf.push(*c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        let token = if is_float {
            let suffix = match self.chars.peek() {
                Some('f') => {
                    self.bump();
                    FloatSuffix::F
                }
                Some('h') => {
                    self.bump();
                    FloatSuffix::H
                }
                _ => FloatSuffix::None,
            };
            let value = buf
                .parse::<f64>()
                .map_err(|e| Diag::new(DiagCode::Parse, format!("bad float literal: {}", e)).with_span(start.span()))?;
            Token::FloatLit(value, suffix)
        } else {
            let suffix = match self.chars.peek() {
                Some('u') => {
                    self.bump();
                    IntSuffix::U
                }
                _ => IntSuffix::None,
            };
            let value = buf
                .parse::<i64>()
                .map_err(|e| Diag::new(DiagCode::Parse, format!("bad int literal: {}", e)).with_span(start.span()))?;
            Token::IntLit(value, suffix)
        };
        Ok(Spanned { value: token, pos: start })
    }

    fn tokenize_ident(&mut self) -> Spanned<Token> {
        let start = self.pos();
        let mut buf = String::new();
        while let Some(c) = self.chars.peek() {
            if c.is_alphanumeric() || *c == '_' {
                buf.push(*c);
                self.bump();
            } else {
                break;
            }
        }
        Spanned {
            value: Token::Ident(buf),
            pos: start,
        }
    }

    pub fn next_token(&mut self) -> Result<Spanned<Token>, Diag> {
        self.skip_trivia();
        let start = self.pos();
        let c = match self.chars.peek().copied() {
            Some(c) => c,
            None => {
                return Ok(Spanned {
                    value: Token::Eof,
                    pos: start,
                })
            }
        };
        if c.is_ascii_digit() {
            return self.tokenize_number();
        }
        if c.is_alphabetic() || c == '_' {
            return Ok(self.tokenize_ident());
        }
        macro_rules! two {
            ($second:expr, $both:expr, $single:expr) => {{
                self.bump();
                if self.chars.peek() == Some(&$second) {
                    self.bump();
                    $both
                } else {
                    $single
                }
            }};
        }
        let token = match c {
            '[' => {
                self.bump();
                if self.chars.peek() == Some(&'[') {
                    self.bump();
                    Token::AttrOpen
                } else {
                    Token::LBracket
                }
            }
            ']' => {
                self.bump();
                if self.chars.peek() == Some(&']') {
                    self.bump();
                    Token::AttrClose
                } else {
                    Token::RBracket
                }
            }
            '(' => {
                self.bump();
                Token::LParen
            }
            ')' => {
                self.bump();
                Token::RParen
            }
            '{' => {
                self.bump();
                Token::LBrace
            }
            '}' => {
                self.bump();
                Token::RBrace
            }
            ',' => {
                self.bump();
                Token::Comma
            }
            ':' => {
                self.bump();
                Token::Colon
            }
            ';' => {
                self.bump();
                Token::Semicolon
            }
            '.' => {
                self.bump();
                Token::Dot
            }
            '%' => {
                self.bump();
                Token::Percent
            }
            '^' => {
                self.bump();
                Token::Caret
            }
            '~' => {
                self.bump();
                Token::Tilde
            }
            '*' => {
                self.bump();
                Token::Star
            }
            '=' => two!('=', Token::EqEq, Token::Eq),
            '!' => two!('=', Token::NotEq, Token::Bang),
            '&' => two!('&', Token::AmpAmp, Token::Amp),
            '|' => two!('|', Token::PipePipe, Token::Pipe),
            '+' => {
                self.bump();
                Token::Plus
            }
            '-' => {
                self.bump();
                Token::Minus
            }
            '/' => {
                self.bump();
                Token::Slash
            }
            '<' => {
                self.bump();
                match self.chars.peek() {
                    Some('=') => {
                        self.bump();
                        Token::Le
                    }
                    Some('<') => {
                        self.bump();
                        Token::Shl
                    }
                    _ => Token::Lt,
                }
            }
            '>' => {
                self.bump();
                match self.chars.peek() {
                    Some('=') => {
                        self.bump();
                        Token::Ge
                    }
                    Some('>') => {
                        self.bump();
                        Token::Shr
                    }
                    _ => Token::Gt,
                }
            }
            _ => {
                return Err(Diag::new(DiagCode::Parse, format!("unexpected character '{}'", c)).with_span(start.span()))
            }
        };
        Ok(Spanned { value: token, pos: start })
    }
}
