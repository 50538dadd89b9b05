//! Restricted key-expression language.
//!
//! Expressions are evaluated against the arguments of a single call and nothing
//! else. The grammar is deliberately small:
//!
//! ```text
//! expr     := term ('+' term)*
//! term     := STRING | INTEGER | variable
//! variable := '#' IDENT accessor*
//! accessor := '.' IDENT | '[' INTEGER ']' | '[' STRING ']'
//! ```
//!
//! `#name` resolves an argument by name, `#p0` / `#a0` by position, `#args` is
//! the positional list and `#method` the operation name. There is no method
//! invocation and no access to anything outside the argument scope.

use serde_json::Value;

use super::{Arg, KeyError};

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Literal(Value),
    Variable { name: String, path: Vec<Accessor> },
}

#[derive(Debug, Clone, PartialEq)]
enum Accessor {
    Field(String),
    Index(usize),
}

/// A parsed key expression, ready to be evaluated per call.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyExpression {
    source: String,
    terms: Vec<Term>,
}

impl KeyExpression {
    pub fn parse(source: &str) -> Result<Self, KeyError> {
        let terms = Parser::new(source).parse()?;
        Ok(Self {
            source: source.to_string(),
            terms,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `args`, returning the string form of the result.
    pub fn evaluate(&self, operation: &str, args: &[Arg]) -> Result<String, KeyError> {
        let scope = Scope { operation, args };
        let mut out = String::new();
        for term in &self.terms {
            let value = match term {
                Term::Literal(value) => value.clone(),
                Term::Variable { name, path } => scope.lookup(name, path)?,
            };
            out.push_str(&value_to_key_string(&value));
        }
        Ok(out)
    }
}

/// String form used in keys: strings verbatim, everything else as JSON.
pub fn value_to_key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Scope<'a> {
    operation: &'a str,
    args: &'a [Arg],
}

impl Scope<'_> {
    fn lookup(&self, name: &str, path: &[Accessor]) -> Result<Value, KeyError> {
        let root = self.root(name)?;
        let mut current = root;
        let mut trail = format!("#{}", name);
        for accessor in path {
            current = match accessor {
                Accessor::Field(field) => {
                    trail.push('.');
                    trail.push_str(field);
                    current
                        .get(field.as_str())
                        .cloned()
                        .ok_or_else(|| KeyError::MissingField { path: trail.clone() })?
                }
                Accessor::Index(index) => {
                    trail.push_str(&format!("[{}]", index));
                    match &current {
                        Value::Array(items) => items.get(*index).cloned().ok_or_else(|| {
                            KeyError::IndexOutOfBounds {
                                path: trail.clone(),
                                len: items.len(),
                            }
                        })?,
                        _ => return Err(KeyError::MissingField { path: trail }),
                    }
                }
            };
        }
        Ok(current)
    }

    fn root(&self, name: &str) -> Result<Value, KeyError> {
        if let Some(arg) = self.args.iter().find(|arg| arg.name() == name) {
            return arg.expression_value();
        }
        if let Some(position) = positional(name) {
            return match self.args.get(position) {
                Some(arg) => arg.expression_value(),
                None => Err(KeyError::UndefinedVariable(name.to_string())),
            };
        }
        match name {
            "method" => Ok(Value::String(self.operation.to_string())),
            "args" => {
                let values = self
                    .args
                    .iter()
                    .map(Arg::expression_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(values))
            }
            _ => Err(KeyError::UndefinedVariable(name.to_string())),
        }
    }
}

/// `p0`, `a3`, ... -> positional index.
fn positional(name: &str) -> Option<usize> {
    let rest = name.strip_prefix('p').or_else(|| name.strip_prefix('a'))?;
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

struct Parser<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Vec<Term>, KeyError> {
        let mut terms = Vec::new();
        self.skip_ws();
        if self.at_end() {
            return Err(self.error("empty expression"));
        }
        terms.push(self.term()?);
        loop {
            self.skip_ws();
            if self.at_end() {
                break;
            }
            if self.peek() != Some('+') {
                return Err(self.error("expected '+'"));
            }
            self.pos += 1;
            self.skip_ws();
            terms.push(self.term()?);
        }
        Ok(terms)
    }

    fn term(&mut self) -> Result<Term, KeyError> {
        match self.peek() {
            Some('#') => {
                self.pos += 1;
                let name = self.ident()?;
                let mut path = Vec::new();
                loop {
                    match self.peek() {
                        Some('.') => {
                            self.pos += 1;
                            path.push(Accessor::Field(self.ident()?));
                        }
                        Some('[') => {
                            self.pos += 1;
                            self.skip_ws();
                            let accessor = match self.peek() {
                                Some('\'') | Some('"') => Accessor::Field(self.string()?),
                                Some(c) if c.is_ascii_digit() => {
                                    let digits = self.digits();
                                    let index = digits
                                        .parse()
                                        .map_err(|_| self.error("index out of range"))?;
                                    Accessor::Index(index)
                                }
                                _ => return Err(self.error("expected index or quoted key")),
                            };
                            self.skip_ws();
                            if self.peek() != Some(']') {
                                return Err(self.error("expected ']'"));
                            }
                            self.pos += 1;
                            path.push(accessor);
                        }
                        _ => break,
                    }
                }
                Ok(Term::Variable { name, path })
            }
            Some('\'') | Some('"') => Ok(Term::Literal(Value::String(self.string()?))),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let start = self.pos;
                if c == '-' {
                    self.pos += 1;
                }
                let digits = self.digits();
                if digits.is_empty() {
                    self.pos = start;
                    return Err(self.error("expected digits"));
                }
                let literal: String = self.chars[start..self.pos].iter().collect();
                let number: i64 = literal
                    .parse()
                    .map_err(|_| self.error("integer literal out of range"))?;
                Ok(Term::Literal(Value::from(number)))
            }
            Some(_) => Err(self.error("expected '#variable', literal or number")),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn ident(&mut self) -> Result<String, KeyError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn digits(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn string(&mut self) -> Result<String, KeyError> {
        let quote = self.peek().ok_or_else(|| self.error("expected quote"))?;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    // doubled quote escapes itself
                    if self.peek() == Some(quote) {
                        out.push(quote);
                        self.pos += 1;
                        continue;
                    }
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn error(&self, message: &str) -> KeyError {
        KeyError::Syntax {
            expression: self.src.to_string(),
            position: self.pos,
            message: message.to_string(),
        }
    }
}
