//! The reader turns source text into the expression trees the compiler consumes.
//!
//! It performs no syntax validation beyond datum structure: whether a list is
//! a well-formed special form is left to the compiler.
use std::ops::Range;

use icu_casemap::CaseMapper;
use logos::SpannedIter;

use crate::{
    lexer::{Directive, LexerError, Span, Token},
    value::Value,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseErrorKind {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected `)`")]
    UnexpectedCloseParen,
    #[error("misplaced `.`")]
    MisplacedDot,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{kind} at {}..{}", .span.start, .span.end)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Span,
}

/// Reads every top-level datum of `source`, in order
pub fn read(source: &str) -> Result<Vec<Value>, ParseError> {
    let mut reader = Reader::new(source);
    let mut data = vec![];
    while let Some(datum) = reader.next_datum()? {
        data.push(datum);
    }
    Ok(data)
}

struct Reader<'src> {
    tokens: SpannedIter<'src, Token>,
    source_len: usize,
    fold_case: bool,
    case_mapper: CaseMapper,
}

impl<'src> Reader<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            tokens: Token::lexer(source).spanned(),
            source_len: source.len(),
            fold_case: false,
            case_mapper: CaseMapper::new(),
        }
    }

    fn eof(&self) -> ParseError {
        ParseError {
            kind: ParseErrorKind::UnexpectedEof,
            span: self.source_len..self.source_len,
        }
    }

    // Next meaningful token, handling trivia and directives on the way
    fn next_token(&mut self) -> Result<Option<(Token, Range<usize>)>, ParseError> {
        loop {
            let Some((token, span)) = self.tokens.next() else {
                return Ok(None);
            };
            match token {
                Ok(tok) if tok.is_trivia() => {}
                Ok(Token::Directive(Directive::FoldCase)) => self.fold_case = true,
                Ok(Token::Directive(Directive::NoFoldCase)) => self.fold_case = false,
                Ok(tok) => return Ok(Some((tok, span))),
                Err(err) => {
                    return Err(ParseError {
                        kind: err.into(),
                        span,
                    })
                }
            }
        }
    }

    fn next_datum(&mut self) -> Result<Option<Value>, ParseError> {
        match self.next_token()? {
            Some((token, span)) => self.datum_from(token, span).map(Some),
            None => Ok(None),
        }
    }

    fn expect_datum(&mut self) -> Result<Value, ParseError> {
        match self.next_token()? {
            Some((token, span)) => self.datum_from(token, span),
            None => Err(self.eof()),
        }
    }

    fn datum_from(&mut self, token: Token, span: Span) -> Result<Value, ParseError> {
        match token {
            Token::Number(n) => Ok(Value::Number(n)),
            Token::Boolean(b) => Ok(Value::Boolean(b)),
            Token::Identifier(id) => Ok(if self.fold_case {
                Value::symbol(self.case_mapper.fold_string(&id))
            } else {
                Value::symbol(id)
            }),
            Token::Quote => {
                let quoted = self.expect_datum()?;
                Ok(Value::list([Value::symbol("quote"), quoted]))
            }
            Token::LParen => self.list_tail(),
            Token::RParen => Err(ParseError {
                kind: ParseErrorKind::UnexpectedCloseParen,
                span,
            }),
            Token::Dot => Err(ParseError {
                kind: ParseErrorKind::MisplacedDot,
                span,
            }),
            // trivia and directives never leave next_token
            Token::IntralineWhitespace
            | Token::LineEnding
            | Token::Comment
            | Token::Directive(_) => Err(ParseError {
                kind: ParseErrorKind::Lexer(LexerError::Invalid),
                span,
            }),
        }
    }

    // Reads the rest of a list after its opening paren
    fn list_tail(&mut self) -> Result<Value, ParseError> {
        let mut items = vec![];
        loop {
            let Some((token, span)) = self.next_token()? else {
                return Err(self.eof());
            };
            match token {
                Token::RParen => return Ok(Value::list(items)),
                Token::Dot => {
                    if items.is_empty() {
                        return Err(ParseError {
                            kind: ParseErrorKind::MisplacedDot,
                            span,
                        });
                    }
                    let tail = self.expect_datum()?;
                    return match self.next_token()? {
                        Some((Token::RParen, _)) => Ok(Value::list_with_tail(items, tail)),
                        Some((_, span)) => Err(ParseError {
                            kind: ParseErrorKind::MisplacedDot,
                            span,
                        }),
                        None => Err(self.eof()),
                    };
                }
                token => items.push(self.datum_from(token, span)?),
            }
        }
    }
}
