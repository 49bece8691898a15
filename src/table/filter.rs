//! OData filter parsing and evaluation for the table backends
//!
//! Supports the subset produced by `TableQuery`: `and`, `or`, `not`,
//! parentheses, the six comparison operators and typed literals.

use std::cmp::Ordering;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::ServiceError;
use crate::table::entity::{parse_datetime, EntityProperty, TypedEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn from_keyword(word: &str) -> Option<Self> {
        Some(match word {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "ge" => CompareOp::Ge,
            "lt" => CompareOp::Lt,
            "le" => CompareOp::Le,
            _ => return None,
        })
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Property(String),
    Literal(EntityProperty),
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    Compare { left: Operand, op: CompareOp, right: Operand },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Word(String),
    Literal(EntityProperty),
}

impl Filter {
    pub fn parse(input: &str) -> Result<Filter, ServiceError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(syntax(format!("unexpected trailing input in filter: {}", input)));
        }
        Ok(filter)
    }

    pub fn matches(&self, entity: &TypedEntity) -> bool {
        match self {
            Filter::And(a, b) => a.matches(entity) && b.matches(entity),
            Filter::Or(a, b) => a.matches(entity) || b.matches(entity),
            Filter::Not(inner) => !inner.matches(entity),
            Filter::Compare { left, op, right } => {
                match (resolve(left, entity), resolve(right, entity)) {
                    (Some(l), Some(r)) => compare(&l, &r).map(|o| op.accepts(o)).unwrap_or(false),
                    _ => false,
                }
            }
        }
    }
}

fn resolve(operand: &Operand, entity: &TypedEntity) -> Option<EntityProperty> {
    match operand {
        Operand::Property(name) => entity.property(name),
        Operand::Literal(value) => Some(value.clone()),
    }
}

fn compare(left: &EntityProperty, right: &EntityProperty) -> Option<Ordering> {
    use EntityProperty::*;
    match (left, right) {
        (String(a), String(b)) => Some(a.cmp(b)),
        (Guid(a), Guid(b)) | (Guid(a), String(b)) | (String(a), Guid(b)) => {
            Some(a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()))
        }
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
        (Binary(a), Binary(b)) => Some(a.cmp(b)),
        (a, b) => match (as_integer(a), as_integer(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => as_number(a)?.partial_cmp(&as_number(b)?),
        },
    }
}

fn as_integer(p: &EntityProperty) -> Option<i64> {
    match p {
        EntityProperty::Int32(i) => Some(*i as i64),
        EntityProperty::Int64(i) => Some(*i),
        _ => None,
    }
}

fn as_number(p: &EntityProperty) -> Option<f64> {
    match p {
        EntityProperty::Double(f) => Some(*f),
        other => as_integer(other).map(|i| i as f64),
    }
}

fn syntax(message: String) -> ServiceError {
    ServiceError::BadRequest(message)
}

fn tokenize(input: &str) -> Result<Vec<Token>, ServiceError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == '\'' {
            let (text, next) = read_quoted(&chars, i)?;
            tokens.push(Token::Literal(EntityProperty::String(text)));
            i = next;
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E' | '+' | '-')) {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let long = chars.get(i) == Some(&'L');
            if long {
                i += 1;
            }
            tokens.push(Token::Literal(number_literal(&text, long)?));
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if chars.get(i) == Some(&'\'') {
                let (text, next) = read_quoted(&chars, i)?;
                tokens.push(Token::Literal(typed_literal(&word, &text)?));
                i = next;
            } else {
                tokens.push(Token::Word(word));
            }
        } else {
            return Err(syntax(format!("unexpected character '{}' in filter", c)));
        }
    }
    Ok(tokens)
}

/// Reads a `'...'` literal starting at `start`, `''` being an escaped quote.
fn read_quoted(chars: &[char], start: usize) -> Result<(String, usize), ServiceError> {
    let mut text = String::new();
    let mut i = start + 1;
    loop {
        match chars.get(i) {
            None => return Err(syntax("unterminated string literal in filter".to_string())),
            Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                text.push('\'');
                i += 2;
            }
            Some('\'') => return Ok((text, i + 1)),
            Some(c) => {
                text.push(*c);
                i += 1;
            }
        }
    }
}

fn number_literal(text: &str, long: bool) -> Result<EntityProperty, ServiceError> {
    let bad = || syntax(format!("invalid number literal {}", text));
    if long {
        return text.parse().map(EntityProperty::Int64).map_err(|_| bad());
    }
    if text.contains(['.', 'e', 'E']) {
        return text.parse().map(EntityProperty::Double).map_err(|_| bad());
    }
    let value: i64 = text.parse().map_err(|_| bad())?;
    Ok(match i32::try_from(value) {
        Ok(small) => EntityProperty::Int32(small),
        Err(_) => EntityProperty::Int64(value),
    })
}

fn typed_literal(prefix: &str, text: &str) -> Result<EntityProperty, ServiceError> {
    match prefix {
        "datetime" => parse_datetime(text)
            .map(EntityProperty::DateTime)
            .ok_or_else(|| syntax(format!("invalid datetime literal {}", text))),
        "guid" => Ok(EntityProperty::Guid(text.to_string())),
        "X" | "binary" => hex::decode(text)
            .or_else(|_| BASE64.decode(text))
            .map(EntityProperty::Binary)
            .map_err(|_| syntax(format!("invalid binary literal {}", text))),
        other => Err(syntax(format!("unknown literal prefix {}", other))),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_word(&self, word: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Word(w)) if w == word)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Filter, ServiceError> {
        let mut left = self.parse_and()?;
        while self.peek_word("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Filter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Filter, ServiceError> {
        let mut left = self.parse_unary()?;
        while self.peek_word("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Filter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Filter, ServiceError> {
        if self.peek_word("not") {
            self.pos += 1;
            return Ok(Filter::Not(Box::new(self.parse_unary()?)));
        }
        if self.tokens.get(self.pos) == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err(syntax("missing closing parenthesis in filter".to_string())),
            };
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Filter, ServiceError> {
        let left = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Word(w)) => CompareOp::from_keyword(&w)
                .ok_or_else(|| syntax(format!("expected comparison operator, found {}", w)))?,
            other => return Err(syntax(format!("expected comparison operator, found {:?}", other))),
        };
        let right = self.parse_operand()?;
        Ok(Filter::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> Result<Operand, ServiceError> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            Some(Token::Word(w)) if w == "true" => Ok(Operand::Literal(EntityProperty::Boolean(true))),
            Some(Token::Word(w)) if w == "false" => Ok(Operand::Literal(EntityProperty::Boolean(false))),
            Some(Token::Word(w)) => Ok(Operand::Property(w)),
            other => Err(syntax(format!("expected operand, found {:?}", other))),
        }
    }
}
