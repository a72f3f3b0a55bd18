//! Boolean constraint expressions over node attributes.
//!
//! A request can carry constraints such as `arch == "x86_64" && gpus >= 1`
//! or `queue in ["batch", "short"]`. They are parsed once into an [`Expr`]
//! tree and evaluated against each candidate node's attribute map.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or      := and ( ("||" | "or") and )*
//! and     := unary ( ("&&" | "and") unary )*
//! unary   := ("!" | "not") unary | compare
//! compare := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") primary )?
//! primary := number | string | "true" | "false" | ident | "(" or ")" | "[" list "]"
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(String),
    Literal(Value),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    In {
        item: Box<Expr>,
        set: Box<Expr>,
    },
}

impl Expr {
    /// Parse an expression. Blank input is the constant `true`.
    pub fn parse(src: &str) -> Result<Expr, ExprError> {
        if src.trim().is_empty() {
            return Ok(Expr::Literal(Value::Bool(true)));
        }
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: src.len(),
        };
        let expr = parser.parse_or()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(ExprError::Parse {
                offset: *offset,
                message: format!("unexpected {token:?}"),
            });
        }
        Ok(expr)
    }

    /// Evaluate against an attribute map.
    pub fn eval(&self, vars: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
        match self {
            Expr::Var(name) => vars
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::UnknownVariable(name.clone())),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|e| e.eval(vars))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval_bool(vars)?)),
            Expr::And(lhs, rhs) => {
                if !lhs.eval_bool(vars)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(rhs.eval_bool(vars)?))
            }
            Expr::Or(lhs, rhs) => {
                if lhs.eval_bool(vars)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(rhs.eval_bool(vars)?))
            }
            Expr::Compare { op, lhs, rhs } => {
                let l = lhs.eval(vars)?;
                let r = rhs.eval(vars)?;
                compare(*op, &l, &r).map(Value::Bool)
            }
            Expr::In { item, set } => {
                let item = item.eval(vars)?;
                match (&item, set.eval(vars)?) {
                    (_, Value::List(items)) => Ok(Value::Bool(items.contains(&item))),
                    (Value::Str(needle), Value::Str(hay)) => Ok(Value::Bool(hay.contains(needle.as_str()))),
                    (_, other) => Err(ExprError::TypeMismatch(format!(
                        "cannot test membership of {} in {}",
                        item.type_name(),
                        other.type_name()
                    ))),
                }
            }
        }
    }

    /// Evaluate and require a boolean result.
    pub fn eval_bool(&self, vars: &BTreeMap<String, Value>) -> Result<bool, ExprError> {
        match self.eval(vars)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::TypeMismatch(format!(
                "expected bool, found {}",
                other.type_name()
            ))),
        }
    }
}

fn compare(op: CompareOp, l: &Value, r: &Value) -> Result<bool, ExprError> {
    match op {
        CompareOp::Eq => return Ok(l == r),
        CompareOp::Ne => return Ok(l != r),
        _ => {}
    }
    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => {
            return Err(ExprError::TypeMismatch(format!(
                "cannot compare {} {op} {}",
                l.type_name(),
                r.type_name()
            )));
        }
    };
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
    })
}

// ── Lexer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Not,
    And,
    Or,
    In,
    Op(CompareOp),
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let peek = |i: usize| chars.get(i).map(|(_, c)| *c);
    let mut tokens = Vec::new();
    let mut i = 0;

    while let Some(&(offset, c)) = chars.get(i) {
        let err = |message: &str| ExprError::Parse {
            offset,
            message: message.to_string(),
        };

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (token, width) = match c {
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            ',' => (Token::Comma, 1),
            '!' if peek(i + 1) == Some('=') => (Token::Op(CompareOp::Ne), 2),
            '!' => (Token::Not, 1),
            '=' if peek(i + 1) == Some('=') => (Token::Op(CompareOp::Eq), 2),
            '<' if peek(i + 1) == Some('=') => (Token::Op(CompareOp::Le), 2),
            '<' => (Token::Op(CompareOp::Lt), 1),
            '>' if peek(i + 1) == Some('=') => (Token::Op(CompareOp::Ge), 2),
            '>' => (Token::Op(CompareOp::Gt), 1),
            '&' if peek(i + 1) == Some('&') => (Token::And, 2),
            '|' if peek(i + 1) == Some('|') => (Token::Or, 2),
            '"' | '\'' => {
                let mut j = i + 1;
                let mut text = String::new();
                loop {
                    match peek(j) {
                        Some(q) if q == c => break,
                        Some(ch) => text.push(ch),
                        None => return Err(err("unterminated string")),
                    }
                    j += 1;
                }
                (Token::Str(text), j + 1 - i)
            }
            c if c.is_ascii_digit()
                || (c == '-' && peek(i + 1).is_some_and(|n| n.is_ascii_digit() || n == '.')) =>
            {
                let mut j = i + 1;
                while peek(j).is_some_and(|n| n.is_ascii_digit() || n == '.') {
                    j += 1;
                }
                let text: String = chars[i..j].iter().map(|(_, ch)| *ch).collect();
                let n = text.parse::<f64>().map_err(|_| err("malformed number"))?;
                (Token::Number(n), j - i)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while peek(j).is_some_and(|n| n.is_alphanumeric() || matches!(n, '_' | '.' | '-')) {
                    j += 1;
                }
                let word: String = chars[i..j].iter().map(|(_, ch)| *ch).collect();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                };
                (token, j - i)
            }
            _ => return Err(err(&format!("unexpected character {c:?}"))),
        };

        tokens.push((offset, token));
        i += width;
    }

    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        if self.peek() == Some(&want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {want:?}")))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_primary()?;
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                let rhs = self.parse_primary()?;
                Ok(Expr::Compare {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                })
            }
            Some(Token::In) => {
                self.pos += 1;
                let set = self.parse_primary()?;
                Ok(Expr::In {
                    item: Box::new(lhs),
                    set: Box::new(set),
                })
            }
            _ => Ok(lhs),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::List(items))
            }
            Some(other) => Err(ExprError::Parse {
                offset,
                message: format!("unexpected {other:?}"),
            }),
            None => Err(ExprError::Parse {
                offset,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}
