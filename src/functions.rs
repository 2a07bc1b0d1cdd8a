// Operator/function library for the expression language.
//
// Every function takes its arguments fully evaluated and never fails:
// type mismatches resolve through the coercion rules in `coerce` instead of
// erroring, so a bad expression renders as inert text rather than aborting
// the surrounding render.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// One operator of the expression language.
///
/// Functions are stateless; the enum doubles as the process-wide singleton.
/// Lookup goes through [`FunctionRegistry`] by any of the function's
/// case-insensitive aliases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulus,
    Absolute,
    Negate,
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    And,
    Or,
    Not,
    Ternary,
    Empty,
    Format,
}

impl Function {
    pub const ALL: [Function; 19] = [
        Function::Add,
        Function::Subtract,
        Function::Multiply,
        Function::Divide,
        Function::Modulus,
        Function::Absolute,
        Function::Negate,
        Function::Equals,
        Function::NotEquals,
        Function::GreaterThan,
        Function::GreaterThanOrEqual,
        Function::LessThan,
        Function::LessThanOrEqual,
        Function::And,
        Function::Or,
        Function::Not,
        Function::Ternary,
        Function::Empty,
        Function::Format,
    ];

    /// Primary name, as it appears in expression source.
    pub fn name(&self) -> &'static str {
        self.aliases()[0]
    }

    /// Every name this function answers to in the registry.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Function::Add => &["add", "concat"],
            Function::Subtract => &["sub", "subtract"],
            Function::Multiply => &["mul", "mult"],
            Function::Divide => &["div", "divide"],
            Function::Modulus => &["mod", "modulus"],
            Function::Absolute => &["abs", "absolute"],
            Function::Negate => &["neg", "negate"],
            Function::Equals => &["eq", "equals"],
            Function::NotEquals => &["ne", "notequals"],
            Function::GreaterThan => &["gt", "greaterthan"],
            Function::GreaterThanOrEqual => &["ge", "greaterthanorequal"],
            Function::LessThan => &["lt", "lessthan"],
            Function::LessThanOrEqual => &["le", "lessthanorequal"],
            Function::And => &["and"],
            Function::Or => &["or"],
            Function::Not => &["not"],
            Function::Ternary => &["if"],
            Function::Empty => &["empty"],
            Function::Format => &["format"],
        }
    }

    /// Apply this function to already-evaluated arguments.
    pub fn evaluate(&self, args: &[Value]) -> Value {
        match self {
            Function::Add => multi::add(args),
            Function::Subtract => math::subtract(args),
            Function::Multiply => math::multiply(args),
            Function::Divide => math::divide(args),
            Function::Modulus => math::modulus(args),
            Function::Absolute => math::absolute(args),
            Function::Negate => math::negate(args),
            Function::Equals => multi::equals(args),
            Function::NotEquals => multi::notequals(args),
            Function::GreaterThan => multi::greater_than(args),
            Function::GreaterThanOrEqual => multi::greater_than_or_equal(args),
            Function::LessThan => multi::less_than(args),
            Function::LessThanOrEqual => multi::less_than_or_equal(args),
            Function::And => boolean::and(args),
            Function::Or => boolean::or(args),
            Function::Not => boolean::not(args),
            Function::Ternary => boolean::ternary(args),
            Function::Empty => util::empty(args),
            Function::Format => util::format(args),
        }
    }
}

/// Immutable alias → function table, built once at startup and shared by
/// every expression builder (safe for concurrent lookup).
#[derive(Debug)]
pub struct FunctionRegistry {
    by_name: HashMap<String, Function>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        let mut by_name = HashMap::new();
        for function in Function::ALL {
            for alias in function.aliases() {
                by_name.insert((*alias).to_string(), function);
            }
        }
        FunctionRegistry { by_name }
    }

    /// Case-insensitive lookup by any registered alias.
    pub fn lookup(&self, name: &str) -> Option<Function> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Arithmetic that is always numeric: both operands coerce to doubles and
/// the result follows IEEE-754 exactly (5/0 is Infinity, 0/0 is NaN).
pub mod math {
    use crate::coerce::to_number;
    use crate::value::Value;

    pub fn subtract(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Number(to_number(a) - to_number(b))
    }

    pub fn multiply(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Number(to_number(a) * to_number(b))
    }

    pub fn divide(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Number(to_number(a) / to_number(b))
    }

    pub fn modulus(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Number(to_number(a) % to_number(b))
    }

    pub fn absolute(args: &[Value]) -> Value {
        match args {
            [] => Value::Null,
            [a, ..] => Value::Number(to_number(a).abs()),
        }
    }

    pub fn negate(args: &[Value]) -> Value {
        match args {
            [] => Value::Null,
            [a, ..] => Value::Number(-to_number(a)),
        }
    }
}

/// Operators whose behavior depends on the operand kinds: ADD switches
/// between numeric addition and string concatenation, equality and ordering
/// apply loose cross-kind rules.
pub mod multi {
    use std::cmp::Ordering;

    use crate::coerce::{parse_number, stringify, to_number};
    use crate::value::Value;

    /// ADD, which is also string concatenation (alias `concat`).
    ///
    /// A null beside a numeric operand yields the numeric operand; two
    /// nulls yield integer zero; two integers stay integral unless the sum
    /// overflows. Any non-numeric operand routes the pair through string
    /// concatenation of the coerced display strings.
    pub fn add(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        match (a, b) {
            (Value::Null, Value::Null) => Value::Int(0),
            (Value::Null, other) if other.is_number() => other.clone(),
            (other, Value::Null) if other.is_number() => other.clone(),
            (Value::Int(x), Value::Int(y)) => match x.checked_add(*y) {
                Some(sum) => Value::Int(sum),
                None => Value::Number(*x as f64 + *y as f64),
            },
            _ if a.is_number() && b.is_number() => Value::Number(to_number(a) + to_number(b)),
            _ => Value::string(format!("{}{}", stringify(a), stringify(b))),
        }
    }

    // Loose `==`: same-kind comparison only, with numerics crossing the
    // Int/Number boundary. NaN is never equal to anything, including itself.
    fn loose_eq(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Bool(_), _) | (_, Value::Bool(_)) => false,
            _ if a.is_number() && b.is_number() => to_number(a) == to_number(b),
            (Value::String(x), Value::String(y)) => x == y,
            (Value::List(x), Value::List(y)) => x == y,
            (Value::Map(x), Value::Map(y)) => x == y,
            _ => false,
        }
    }

    pub fn equals(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Bool(loose_eq(a, b))
    }

    pub fn notequals(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Bool(!loose_eq(a, b))
    }

    // Ordering for the four relational operators. Two strings compare
    // numerically when both parse cleanly, lexicographically otherwise;
    // any other pairing coerces to doubles. None means a NaN was involved,
    // which makes every relational operator false.
    fn compare(a: &Value, b: &Value) -> Option<Ordering> {
        if let (Value::String(x), Value::String(y)) = (a, b) {
            let (nx, ny) = (parse_number(x), parse_number(y));
            if !nx.is_nan() && !ny.is_nan() {
                return nx.partial_cmp(&ny);
            }
            return Some(x.as_ref().cmp(y.as_ref()));
        }
        to_number(a).partial_cmp(&to_number(b))
    }

    pub fn greater_than(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Bool(matches!(compare(a, b), Some(Ordering::Greater)))
    }

    pub fn greater_than_or_equal(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Bool(matches!(
            compare(a, b),
            Some(Ordering::Greater | Ordering::Equal)
        ))
    }

    pub fn less_than(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Bool(matches!(compare(a, b), Some(Ordering::Less)))
    }

    pub fn less_than_or_equal(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        Value::Bool(matches!(
            compare(a, b),
            Some(Ordering::Less | Ordering::Equal)
        ))
    }
}

/// Value-returning logical operators matching JS `&&`/`||`/`!` and the
/// conditional. These return an *operand*, not a boolean (NOT excepted).
pub mod boolean {
    use crate::coerce::is_truthy;
    use crate::value::Value;

    pub fn and(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        if is_truthy(a) {
            b.clone()
        } else {
            a.clone()
        }
    }

    pub fn or(args: &[Value]) -> Value {
        let (a, b) = match args {
            [] => return Value::Null,
            [only] => return only.clone(),
            [a, b, ..] => (a, b),
        };
        if is_truthy(a) {
            a.clone()
        } else {
            b.clone()
        }
    }

    pub fn not(args: &[Value]) -> Value {
        match args {
            [] => Value::Null,
            [a, ..] => Value::Bool(!is_truthy(a)),
        }
    }

    /// The conditional, registered as `if`. The two-argument form returns
    /// null on a falsy condition.
    pub fn ternary(args: &[Value]) -> Value {
        match args {
            [] | [_] => Value::Null,
            [cond, when_true] => {
                if is_truthy(cond) {
                    when_true.clone()
                } else {
                    Value::Null
                }
            }
            [cond, when_true, when_false, ..] => {
                if is_truthy(cond) {
                    when_true.clone()
                } else {
                    when_false.clone()
                }
            }
        }
    }
}

/// Presentation helpers exposed to markup authors.
pub mod util {
    use crate::coerce::stringify;
    use crate::value::Value;

    /// True for null, the empty string, and the empty list. Zero, NaN and
    /// false are *not* empty.
    pub fn empty(args: &[Value]) -> Value {
        match args {
            [] => Value::Null,
            [a, ..] => Value::Bool(match a {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::List(items) => items.is_empty(),
                _ => false,
            }),
        }
    }

    /// Positional `{N}` template substitution.
    ///
    /// Since expressions are exposed to the UI we prevent the display of
    /// nulls: a null template renders as the empty string, and so does a
    /// null substitution argument. Unmatched placeholders stay verbatim;
    /// surplus arguments are ignored.
    pub fn format(args: &[Value]) -> Value {
        let (template, rest) = match args {
            [] => return Value::string(""),
            [t, rest @ ..] => (t, rest),
        };
        if template.is_null() {
            return Value::string("");
        }
        let template = stringify(template);
        if rest.is_empty() {
            return Value::string(template);
        }
        let substitutions: Vec<String> = rest
            .iter()
            .map(|v| if v.is_null() { String::new() } else { stringify(v) })
            .collect();
        Value::string(substitute(&template, &substitutions))
    }

    fn substitute(template: &str, args: &[String]) -> String {
        let chars: Vec<char> = template.chars().collect();
        let mut out = String::with_capacity(template.len());
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '{' {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_ascii_digit() {
                    j += 1;
                }
                if j > i + 1 && j < chars.len() && chars[j] == '}' {
                    let index: usize = chars[i + 1..j]
                        .iter()
                        .collect::<String>()
                        .parse()
                        .unwrap_or(usize::MAX);
                    if index < args.len() {
                        out.push_str(&args[index]);
                        i = j + 1;
                        continue;
                    }
                }
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }
}
