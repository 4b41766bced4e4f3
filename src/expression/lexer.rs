use std::{fmt, num::ParseFloatError, num::ParseIntError, ops::Range};

use logos::{Logos, SpannedIter};
use thiserror::Error;

/// Failure to split an expression into tokens.
#[derive(Default, Error, Debug, Clone, PartialEq)]
pub enum LexicalError {
    /// Input does not start any known token.
    #[default]
    #[error("invalid token")]
    InvalidToken,
    /// Integer literal out of range.
    #[error("failed to parse integer: {0}")]
    Integer(ParseIntError),
    /// Malformed float literal.
    #[error("failed to parse float: {0}")]
    Float(ParseFloatError),
    /// Unknown escape sequence in a string literal.
    #[error("invalid escape sequence in string literal")]
    InvalidEscape,
}

#[derive(Clone, Debug, Logos, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+", error = LexicalError)]
pub enum Token {
    #[token("<")]
    LessThan,
    #[token("<=")]
    LessThanEqual,
    #[token(">")]
    GreaterThan,
    #[token(">=")]
    GreaterThanEqual,
    #[token("==")]
    Equal,
    #[token("!=")]
    NotEqual,
    #[token("!")]
    Not,
    #[token("in")]
    In,
    #[token("&&")]
    And,
    #[token("||")]
    Or,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token("(")]
    LeftParenthesis,
    #[token(")")]
    RightParenthesis,
    #[token("[")]
    LeftSquareBracket,
    #[token("]")]
    RightSquareBracket,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token("null")]
    Null,
    #[token("true", |_| true)]
    #[token("false", |_| false)]
    BooleanLiteral(bool),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().map_err(LexicalError::Integer))]
    IntegerLiteral(i64),
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().map_err(LexicalError::Float))]
    FloatLiteral(f64),
    #[regex(r#"("(\\.|[^"\\])*"|'(\\.|[^'\\])*')"#, |lex| unescape(lex.slice()))]
    StringLiteral(String),
    #[regex("[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_owned())]
    Identifier(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Strip quotes and resolve escape sequences.
fn unescape(literal: &str) -> Result<String, LexicalError> {
    let inner = &literal[1..literal.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some(c @ ('\\' | '"' | '\'')) => result.push(c),
            _ => return Err(LexicalError::InvalidEscape),
        }
    }
    Ok(result)
}

pub type Spanned<Tok, Loc, Error> = Result<(Loc, Tok, Loc), Error>;

pub struct Lexer<'input> {
    token_stream: SpannedIter<'input, Token>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        Self {
            token_stream: Token::lexer(input).spanned(),
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Spanned<Token, usize, (LexicalError, Range<usize>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.token_stream.next().map(|(token, span)| match token {
            Ok(token) => Ok((span.start, token, span.end)),
            Err(error) => Err((error, span)),
        })
    }
}
