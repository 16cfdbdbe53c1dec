//! Boolean expressions used by `condition`, `test` and similar attributes.
//!
//! Expressions are tokenized before any reference is resolved. A `{name}`
//! reference becomes a single operand holding the field's value, so field
//! data never turns into operators: with `role` set to `x || 1`, the
//! expression `{role} == admin` compares one string against `admin`.
//! Supported syntax:
//!
//! - literals: numbers, `true`/`false`/`null`, quoted strings, bare words
//! - references: `{name}` and `{a.b}`, form first, then caller fields
//! - comparison: `==` (or `=`), `!=`, `<`, `<=`, `>`, `>=`
//! - logic: `&&`/`and`, `||`/`or`, `!`/`not`, parentheses
//!
//! A missing operand or an unknown reference compares as the empty string.
//! Operands compare numerically when both sides are numeric, as text otherwise.
//! References inside quotes or next to other text are spliced in as text.

use serde_json::Value;
use std::cmp::Ordering;

use super::context::ExecutionContext;
use super::value::{as_number, to_text, truthy};
use super::{InterpreterError, Result};

/// Deepest allowed nesting of parentheses and negations.
pub const MAX_NESTING: usize = 64;

/// Evaluate an expression to a boolean against `scope`. Blank input is false.
pub fn evaluate(source: &str, scope: &ExecutionContext) -> Result<bool> {
    Ok(truthy(&evaluate_value(source, scope)?))
}

/// Evaluate an expression to its value.
pub fn evaluate_value(source: &str, scope: &ExecutionContext) -> Result<Value> {
    let tokens = tokenize(source, scope)?;
    if tokens.is_empty() {
        return Ok(Value::Bool(false));
    }
    let mut parser = ExprParser {
        tokens,
        index: 0,
        depth: 0,
    };
    let value = parser.parse_or()?;
    if parser.index < parser.tokens.len() {
        return Err(expression_error(source, "unexpected trailing input"));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CmpOp),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(source: &str, scope: &ExecutionContext) -> Result<Vec<Token>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < bytes.len() {
        let ch = bytes[index];
        let next = bytes.get(index + 1).copied();
        match ch {
            c if c.is_ascii_whitespace() => index += 1,
            b'(' => {
                tokens.push(Token::LParen);
                index += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                index += 1;
            }
            b'!' if next == Some(b'=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                index += 2;
            }
            b'!' => {
                tokens.push(Token::Not);
                index += 1;
            }
            b'&' if next == Some(b'&') => {
                tokens.push(Token::And);
                index += 2;
            }
            b'|' if next == Some(b'|') => {
                tokens.push(Token::Or);
                index += 2;
            }
            b'=' => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                index += if next == Some(b'=') { 2 } else { 1 };
            }
            b'<' | b'>' => {
                let or_equal = next == Some(b'=');
                let op = match (ch, or_equal) {
                    (b'<', false) => CmpOp::Lt,
                    (b'<', true) => CmpOp::Le,
                    (_, false) => CmpOp::Gt,
                    (_, true) => CmpOp::Ge,
                };
                tokens.push(Token::Cmp(op));
                index += if or_equal { 2 } else { 1 };
            }
            b'"' | b'\'' => {
                let (text, consumed) = read_quoted(&source[index..])
                    .ok_or_else(|| expression_error(source, "unterminated string literal"))?;
                tokens.push(Token::Literal(Value::String(interpolate(&text, scope))));
                index += consumed;
            }
            _ => {
                let start = index;
                while index < bytes.len() && !is_delimiter(bytes[index]) {
                    index += 1;
                }
                if start == index {
                    return Err(expression_error(source, "unexpected character"));
                }
                let word = &source[start..index];
                tokens.push(if word.contains('{') {
                    reference_token(word, scope)
                } else {
                    word_token(word)
                });
            }
        }
    }

    Ok(tokens)
}

fn is_delimiter(ch: u8) -> bool {
    ch.is_ascii_whitespace()
        || matches!(ch, b'(' | b')' | b'!' | b'=' | b'<' | b'>' | b'"' | b'\'')
        || ch == b'&'
        || ch == b'|'
}

fn word_token(word: &str) -> Token {
    match word.to_ascii_lowercase().as_str() {
        "and" => return Token::And,
        "or" => return Token::Or,
        "not" => return Token::Not,
        "true" => return Token::Literal(Value::Bool(true)),
        "false" => return Token::Literal(Value::Bool(false)),
        "null" => return Token::Literal(Value::Null),
        _ => {}
    }
    match word.parse::<f64>() {
        Ok(n) if n.is_finite() => Token::Literal(super::value::number(n)),
        _ => Token::Literal(Value::String(word.to_string())),
    }
}

/// Operand for a word holding references. A lone reference keeps the
/// field's value; anything else is spliced into one text operand.
fn reference_token(word: &str, scope: &ExecutionContext) -> Token {
    let lone = word
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| is_reference_name(name));
    match lone {
        Some(name) => Token::Literal(
            scope
                .resolve(name)
                .unwrap_or_else(|| Value::String(String::new())),
        ),
        None => Token::Literal(Value::String(interpolate(word, scope))),
    }
}

/// Replace `{name}` references in `text` with the fields' text.
fn interpolate(text: &str, scope: &ExecutionContext) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail.find('}').filter(|close| is_reference_name(&tail[1..*close])) {
            Some(close) => {
                if let Some(value) = scope.resolve(&tail[1..close]) {
                    out.push_str(&to_text(&value));
                }
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_reference_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphanumeric() || matches!(first, '_' | '@'))
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '@' | ':' | '-'))
}

/// Read a quoted literal starting at the opening quote; returns the text and
/// the number of bytes consumed including both quotes.
fn read_quoted(input: &str) -> Option<(String, usize)> {
    let mut chars = input.char_indices();
    let (_, quote) = chars.next()?;
    let mut buf = String::new();
    while let Some((offset, ch)) = chars.next() {
        match ch {
            '\\' => {
                let (_, escaped) = chars.next()?;
                buf.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            }
            c if c == quote => return Some((buf, offset + c.len_utf8())),
            c => buf.push(c),
        }
    }
    None
}

struct ExprParser {
    tokens: Vec<Token>,
    index: usize,
    depth: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.index)
    }

    fn nest(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(InterpreterError::Expression(format!(
                "nesting deeper than {MAX_NESTING} levels"
            )));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Value> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.index += 1;
            let right = self.parse_and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.index += 1;
            let right = self.parse_not()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Not) {
            self.index += 1;
            self.nest()?;
            let inner = self.parse_not();
            self.depth -= 1;
            return Ok(Value::Bool(!truthy(&inner?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Value> {
        let left = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.index += 1;
            let right = self.parse_operand()?;
            return Ok(Value::Bool(compare(op, &left, &right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Value> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.index += 1;
                self.nest()?;
                let inner = self.parse_or();
                self.depth -= 1;
                let inner = inner?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(InterpreterError::Expression(
                        "missing closing parenthesis".to_string(),
                    ));
                }
                self.index += 1;
                Ok(inner)
            }
            Some(Token::Literal(value)) => {
                self.index += 1;
                Ok(value)
            }
            Some(Token::Not) => self.parse_not(),
            // Missing operand: an empty expansion.
            _ => Ok(Value::String(String::new())),
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    let ordering = match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) if !is_blank(left) && !is_blank(right) => a.partial_cmp(&b),
        _ => Some(to_text(left).cmp(&to_text(right))),
    };
    match (op, ordering) {
        (CmpOp::Eq, Some(ord)) => ord == Ordering::Equal,
        (CmpOp::Ne, Some(ord)) => ord != Ordering::Equal,
        (CmpOp::Lt, Some(ord)) => ord == Ordering::Less,
        (CmpOp::Le, Some(ord)) => ord != Ordering::Greater,
        (CmpOp::Gt, Some(ord)) => ord == Ordering::Greater,
        (CmpOp::Ge, Some(ord)) => ord != Ordering::Less,
        (CmpOp::Ne, None) => true,
        (_, None) => false,
    }
}

fn is_blank(value: &Value) -> bool {
    matches!(value, Value::String(text) if text.trim().is_empty())
}

fn expression_error(source: &str, message: &str) -> InterpreterError {
    InterpreterError::Expression(format!("{message} in `{source}`"))
}
