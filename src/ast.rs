// Expression tree definitions and the evaluation protocol.
//
// An expression is built once at definition-compile time, cached, and
// evaluated many times against per-request value providers. The tree is
// immutable and evaluation never mutates the provider.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::functions::Function;
use crate::value::Value;

/// Source position an expression node was parsed from, carried for
/// diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub source: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(source: impl Into<String>, line: u32, column: u32) -> Self {
        Location {
            source: source.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.line, self.column)
    }
}

/// Discriminator for the three expression shapes, exposed so callers can
/// branch on what a parsed attribute turned out to be without matching the
/// tree itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionType {
    Literal,
    Property,
    Function,
}

/// A dotted/indexed path (`a.b[0]` has the parts `a`, `b`, `0`), resolved
/// lazily against a [`ValueProvider`] at evaluation time. The engine never
/// interprets the parts itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyReference {
    parts: Vec<String>,
    location: Location,
}

impl PropertyReference {
    pub fn new(parts: Vec<String>, location: Location) -> Self {
        PropertyReference { parts, location }
    }

    /// Split a dotted path on `.`; bracketed indices become parts of their
    /// own (`a.b[0]` and `a.b.0` are the same reference).
    pub fn from_path(path: &str, location: Location) -> Self {
        let mut parts = Vec::new();
        for piece in path.split('.') {
            let mut rest = piece;
            while let Some(open) = rest.find('[') {
                if !rest[..open].is_empty() {
                    parts.push(rest[..open].to_string());
                }
                rest = &rest[open + 1..];
                if let Some(close) = rest.find(']') {
                    parts.push(rest[..close].to_string());
                    rest = &rest[close + 1..];
                } else {
                    break;
                }
            }
            if !rest.is_empty() {
                parts.push(rest.to_string());
            }
        }
        PropertyReference { parts, location }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn size(&self) -> usize {
        self.parts.len()
    }

    /// First path part.
    pub fn root(&self) -> &str {
        &self.parts[0]
    }

    /// Last path part.
    pub fn leaf(&self) -> &str {
        &self.parts[self.parts.len() - 1]
    }

    /// Everything after the root, or None for a single-part reference.
    pub fn stem(&self) -> Option<PropertyReference> {
        if self.parts.len() <= 1 {
            return None;
        }
        Some(PropertyReference {
            parts: self.parts[1..].to_vec(),
            location: self.location.clone(),
        })
    }

    pub fn location(&self) -> &Location {
        &self.location
    }
}

impl PartialEq for PropertyReference {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

// The canonical dotted form; indices rejoin with dots, which round-trips
// through from_path.
impl fmt::Display for PropertyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join("."))
    }
}

/// Error surfaced by a [`ValueProvider`] when a property reference cannot be
/// resolved. The engine imposes no recovery policy: these propagate out of
/// [`Expression::evaluate`] untouched.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ResolveError {
    message: String,
}

impl ResolveError {
    pub fn new(message: impl Into<String>) -> Self {
        ResolveError {
            message: message.into(),
        }
    }
}

/// Capability resolving a property reference to a value, supplied by the
/// caller per evaluation (an attribute set, a model, a test fixture).
pub trait ValueProvider {
    fn get_value(&self, key: &PropertyReference) -> Result<Value, ResolveError>;
}

/// A constant carrying its source location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Literal {
    value: Value,
    location: Location,
}

impl Literal {
    pub fn new(value: Value, location: Location) -> Self {
        Literal { value, location }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// A named function applied to an ordered argument list. Arguments evaluate
/// left to right before dispatch; there is no short-circuiting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    function: Function,
    args: Vec<Expression>,
    location: Location,
}

impl FunctionCall {
    pub fn new(function: Function, args: Vec<Expression>, location: Location) -> Self {
        FunctionCall {
            function,
            args,
            location,
        }
    }

    pub fn function(&self) -> Function {
        self.function
    }

    pub fn args(&self) -> &[Expression] {
        &self.args
    }
}

/// A parsed expression: a constant, a lazily resolved property path, or a
/// function applied to sub-expressions. Trees are acyclic by construction
/// and evaluation is pure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Literal),
    Property(PropertyReference),
    FunctionCall(FunctionCall),
}

impl Expression {
    pub fn literal(value: impl Into<Value>, location: Location) -> Self {
        Expression::Literal(Literal::new(value.into(), location))
    }

    pub fn expression_type(&self) -> ExpressionType {
        match self {
            Expression::Literal(_) => ExpressionType::Literal,
            Expression::Property(_) => ExpressionType::Property,
            Expression::FunctionCall(_) => ExpressionType::Function,
        }
    }

    pub fn location(&self) -> &Location {
        match self {
            Expression::Literal(l) => &l.location,
            Expression::Property(p) => p.location(),
            Expression::FunctionCall(c) => &c.location,
        }
    }

    /// Evaluate against a value provider.
    ///
    /// Literals return their constant; property references ask the
    /// provider; function calls evaluate every argument left to right and
    /// dispatch. The only error source is the provider — the function
    /// library itself never fails.
    pub fn evaluate(&self, provider: &dyn ValueProvider) -> Result<Value, ResolveError> {
        match self {
            Expression::Literal(literal) => Ok(literal.value.clone()),
            Expression::Property(reference) => provider.get_value(reference),
            Expression::FunctionCall(call) => {
                let mut args = Vec::with_capacity(call.args.len());
                for arg in &call.args {
                    args.push(arg.evaluate(provider)?);
                }
                Ok(call.function.evaluate(&args))
            }
        }
    }
}

/// Simple provider backed by a name → value table, keyed by the full dotted
/// reference text. Unknown references resolve to null, matching how missing
/// attributes render.
#[derive(Debug, Default)]
pub struct ValueMap {
    entries: std::collections::HashMap<String, Value>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(name.into(), value.into());
    }
}

impl ValueProvider for ValueMap {
    fn get_value(&self, key: &PropertyReference) -> Result<Value, ResolveError> {
        Ok(self
            .entries
            .get(&key.to_string())
            .cloned()
            .unwrap_or(Value::Null))
    }
}
