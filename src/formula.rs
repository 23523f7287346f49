//! Formula evaluation.
//!
//! A formula is a leading `=` followed by an arithmetic expression over
//! numbers and cell references (`=A1+B2*2`). References are substituted
//! textually with the referenced cell's numeric value, then the result is
//! run through a restricted recursive-descent parser. Only digits,
//! `+ - * / ( ) .` and whitespace survive substitution; anything else is an
//! evaluation error, so no free-form text ever reaches an interpreter.
//!
//! Evaluation failures are data, not errors: they produce the `ERROR`
//! sentinel value and the caller carries on.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CELL_REF_REGEX: Regex = Regex::new(r"[A-Z]+[0-9]+").unwrap();
}

/// Leading marker denoting a derived cell value.
pub const FORMULA_MARKER: char = '=';

/// Stored in place of a value when evaluation fails.
pub const ERROR_SENTINEL: &str = "ERROR";

#[derive(Debug, Clone, PartialEq)]
pub enum EvalResult {
    Number(f64),
    Error,
}

impl EvalResult {
    /// Renders the result as the text stored in the cell mapping.
    pub fn into_value(self) -> String {
        match self {
            EvalResult::Number(n) => format_number(n),
            EvalResult::Error => ERROR_SENTINEL.to_string(),
        }
    }
}

pub fn is_formula(text: &str) -> bool {
    text.starts_with(FORMULA_MARKER)
}

/// Formats a numeric result the way the grid displays it: integral values
/// print without a fractional part (`7`, never `7.0`). Value equality
/// throughout the engine is textual on this canonical form.
pub fn format_number(n: f64) -> String {
    // 2^53: beyond this an f64 cannot represent every integer anyway.
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Evaluates `formula` against the given cell lookup.
///
/// A missing or non-numeric referenced cell reads as `0`. The lookup sees the
/// current stored values; this function never mutates anything.
pub fn evaluate<F>(formula: &str, lookup: F) -> EvalResult
where
    F: Fn(&str) -> Option<String>,
{
    let expr = match formula.strip_prefix(FORMULA_MARKER) {
        Some(rest) => rest,
        None => return EvalResult::Error,
    };

    let substituted = CELL_REF_REGEX.replace_all(expr, |caps: &regex::Captures| {
        let referenced = lookup(&caps[0])
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|n| n.is_finite())
            .unwrap_or(0.0);
        format_number(referenced)
    });

    // Reject anything outside the arithmetic grammar before parsing.
    let safe = substituted
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_whitespace() || "+-*/().".contains(c));
    if !safe {
        return EvalResult::Error;
    }

    match ExprParser::new(&substituted).parse() {
        Some(n) if n.is_finite() => EvalResult::Number(n),
        _ => EvalResult::Error,
    }
}

/// Recursive-descent parser for the substituted expression.
///
/// Grammar:
///   expr   -> term (('+' | '-') term)*
///   term   -> factor (('*' | '/') factor)*
///   factor -> '-' factor | '(' expr ')' | number
struct ExprParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn new(input: &'a str) -> Self {
        ExprParser {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Option<f64> {
        let value = self.expr()?;
        self.skip_whitespace();
        if self.pos == self.input.len() {
            Some(value)
        } else {
            None
        }
    }

    fn skip_whitespace(&mut self) {
        while self
            .input
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.input.get(self.pos).copied()
    }

    fn expr(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                b'+' => {
                    self.pos += 1;
                    value += self.term()?;
                }
                b'-' => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                b'*' => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                b'/' => {
                    self.pos += 1;
                    value /= self.factor()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<f64> {
        match self.peek()? {
            b'-' => {
                self.pos += 1;
                Some(-self.factor()?)
            }
            b'(' => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek()? != b')' {
                    return None;
                }
                self.pos += 1;
                Some(value)
            }
            _ => self.number(),
        }
    }

    fn number(&mut self) -> Option<f64> {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
        {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()?
            .parse()
            .ok()
    }
}
