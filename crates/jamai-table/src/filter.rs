//! Row filter expressions
//!
//! The `where` parameter of row listing accepts a small SQL subset: `AND`,
//! `OR`, `=`, `~*` (case-insensitive regex), parenthesization, and
//! double-quoted column names. Expressions are parsed once and evaluated
//! in-process against decoded rows, so user input never reaches SQL.

use crate::error::{Error, Result};
use crate::store::StoredRow;
use regex::RegexBuilder;

/// A parsed filter expression
#[derive(Debug, Clone)]
pub enum FilterExpr {
    /// Both sides must hold
    And(Box<FilterExpr>, Box<FilterExpr>),
    /// Either side must hold
    Or(Box<FilterExpr>, Box<FilterExpr>),
    /// Column equals literal
    Eq(String, Literal),
    /// Column matches a case-insensitive regex
    RegexMatch(String, String),
}

/// A literal operand
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// String literal
    Str(String),
    /// Numeric literal
    Num(f64),
    /// Boolean literal
    Bool(bool),
    /// NULL
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    And,
    Or,
    True,
    False,
    Null,
    Eq,
    RegexOp,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '~' => {
                chars.next();
                if chars.next() != Some('*') {
                    return Err(Error::BadInput("expected `~*` operator".to_string()));
                }
                tokens.push(Token::RegexOp);
            }
            '"' => {
                chars.next();
                let mut ident = String::new();
                let mut closed = false;
                while let Some(inner) = chars.next() {
                    if inner == '"' {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            ident.push('"');
                        } else {
                            closed = true;
                            break;
                        }
                    } else {
                        ident.push(inner);
                    }
                }
                if !closed {
                    return Err(Error::BadInput("unterminated column name".to_string()));
                }
                tokens.push(Token::Ident(ident));
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(inner) = chars.next() {
                    if inner == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            s.push('\'');
                        } else {
                            closed = true;
                            break;
                        }
                    } else {
                        s.push(inner);
                    }
                }
                if !closed {
                    return Err(Error::BadInput("unterminated string literal".to_string()));
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num
                    .parse::<f64>()
                    .map_err(|_| Error::BadInput(format!("invalid number: {num}")))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        word.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "TRUE" => tokens.push(Token::True),
                    "FALSE" => tokens.push(Token::False),
                    "NULL" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(Error::BadInput(format!(
                    "unexpected character in filter: {other:?}"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterExpr> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.parse_or()?;
            if self.next() != Some(Token::RParen) {
                return Err(Error::BadInput("expected `)`".to_string()));
            }
            return Ok(inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<FilterExpr> {
        let column = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(Error::BadInput(format!(
                    "expected column name, found {other:?}"
                )));
            }
        };
        match self.next() {
            Some(Token::Eq) => {
                let literal = match self.next() {
                    Some(Token::Str(s)) => Literal::Str(s),
                    Some(Token::Num(n)) => Literal::Num(n),
                    Some(Token::True) => Literal::Bool(true),
                    Some(Token::False) => Literal::Bool(false),
                    Some(Token::Null) => Literal::Null,
                    other => {
                        return Err(Error::BadInput(format!(
                            "expected literal, found {other:?}"
                        )));
                    }
                };
                Ok(FilterExpr::Eq(column, literal))
            }
            Some(Token::RegexOp) => match self.next() {
                Some(Token::Str(pattern)) => {
                    // Validate eagerly so bad patterns fail the request.
                    RegexBuilder::new(&pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| Error::BadInput(format!("invalid regex: {e}")))?;
                    Ok(FilterExpr::RegexMatch(column, pattern))
                }
                other => Err(Error::BadInput(format!(
                    "expected regex pattern, found {other:?}"
                ))),
            },
            other => Err(Error::BadInput(format!(
                "expected `=` or `~*`, found {other:?}"
            ))),
        }
    }
}

impl FilterExpr {
    /// Parse a `where` expression.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(Error::BadInput("empty filter expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::BadInput("trailing tokens in filter".to_string()));
        }
        Ok(expr)
    }

    /// Evaluate against a row. Missing cells behave as NULL.
    #[must_use]
    pub fn matches(&self, row: &StoredRow) -> bool {
        match self {
            Self::And(a, b) => a.matches(row) && b.matches(row),
            Self::Or(a, b) => a.matches(row) || b.matches(row),
            Self::Eq(column, literal) => {
                let value = column_value(row, column);
                match (literal, &value) {
                    (Literal::Null, v) => v.is_null(),
                    (Literal::Str(s), serde_json::Value::String(v)) => s == v,
                    (Literal::Num(n), serde_json::Value::Number(v)) => {
                        v.as_f64().is_some_and(|f| (f - n).abs() < f64::EPSILON)
                    }
                    (Literal::Bool(b), serde_json::Value::Bool(v)) => b == v,
                    _ => false,
                }
            }
            Self::RegexMatch(column, pattern) => {
                let value = column_value(row, column);
                let text = match &value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => return false,
                    other => other.to_string(),
                };
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .is_ok_and(|re| re.is_match(&text))
            }
        }
    }
}

fn column_value(row: &StoredRow, column: &str) -> serde_json::Value {
    if column == "ID" {
        return serde_json::Value::String(row.id.clone());
    }
    if column == "Updated at" {
        return serde_json::Value::String(row.updated_at.to_rfc3339());
    }
    row.cells
        .get(column)
        .map(|c| c.value.clone())
        .unwrap_or(serde_json::Value::Null)
}
