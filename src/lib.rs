//! # sprig
//!
//! The server-side algorithmic core of a component-based UI framework:
//! an expression engine with JavaScript-compatible coercion semantics, and
//! the instance stack that keeps server-side component instantiation in
//! step with the client runtime's tree walk.
//!
//! Expressions bound to component attributes are compiled once at
//! definition time and evaluated per request against a caller-supplied
//! [`ValueProvider`]. Coercion never fails — a type mismatch renders as
//! `NaN`, an empty string, or a marker, never as an aborted render.
//!
//! ## Architecture
//!
//! - `parser` - expression parser (source text to expression tree)
//! - `ast` - expression tree and the evaluation protocol
//! - `functions` - operator/function library and registry
//! - `coerce` - JS-compatible number/string/boolean coercion
//! - `value` - dynamic value type flowing through evaluation
//! - `instance` - per-request tree-position tracking and the component
//!   registry serialized back to the client
//!
//! ## Example
//!
//! ```
//! use sprig::{compile, ValueMap};
//!
//! let expression = compile("price * quantity").unwrap();
//!
//! let mut values = ValueMap::new();
//! values.bind("price", 100);
//! values.bind("quantity", 5);
//!
//! let result = expression.evaluate(&values).unwrap();
//! assert_eq!(result.as_f64(), Some(500.0));
//! ```

pub mod ast;
pub mod coerce;
pub mod functions;
pub mod instance;
pub mod parser;
pub mod value;

pub use ast::{
    Expression, ExpressionType, Literal, Location, PropertyReference, ResolveError, ValueMap,
    ValueProvider,
};
pub use functions::{Function, FunctionRegistry};
pub use instance::{Component, Descriptor, Instance, InstanceStack, NamespaceRules};
pub use parser::{parse, ExpressionBuilder, ParserError};
pub use value::Value;

#[doc(hidden)]
pub use indexmap as __indexmap;

/// Compile an expression with the default function registry.
///
/// Equivalent to [`parser::parse`]; use an [`ExpressionBuilder`] to share a
/// registry across many compile sites or to attach real source locations.
pub fn compile(source: &str) -> Result<Expression, ParserError> {
    parser::parse(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_evaluate() {
        let expression = compile("1 + 2").unwrap();
        let values = ValueMap::new();
        assert_eq!(expression.evaluate(&values).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_compile_rejects_malformed_source() {
        assert!(compile("1 +").is_err());
    }
}
