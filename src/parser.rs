// Markup expression parser.
//
// Turns attribute expression source (`price * quantity`, `if(v.on, 'yes')`)
// into an immutable expression tree. Parse failures are the validation
// boundary: malformed source errors here, never during evaluation.

use std::rc::Rc;

use thiserror::Error;
use tracing::trace;

use crate::ast::{Expression, FunctionCall, Location, PropertyReference};
use crate::functions::{Function, FunctionRegistry};
use crate::value::Value;

/// Parser errors
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("unexpected token {found} at {line}:{column}")]
    UnexpectedToken {
        found: String,
        line: u32,
        column: u32,
    },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("unclosed string literal")]
    UnclosedString,

    #[error("invalid escape sequence: {0}")]
    InvalidEscape(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("expected {expected}, found {found}")]
    Expected { expected: String, found: String },
}

/// Token types for the lexer
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Int(i64),
    Float(f64),
    String(String),
    True,
    False,
    Null,

    Identifier(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    Question,
    Colon,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Dot,
    Comma,

    Eof,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Int(n) => n.to_string(),
            TokenKind::Float(n) => n.to_string(),
            TokenKind::String(s) => format!("'{}'", s),
            TokenKind::Identifier(s) => s.clone(),
            TokenKind::Eof => "end of expression".to_string(),
            other => format!("{:?}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
}

/// Lexer for tokenizing expression source
struct Lexer {
    input: Vec<char>,
    position: usize,
    line: u32,
    column: u32,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current() {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            self.position += 1;
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ParserError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let (line, column) = (self.line, self.column);
            let kind = match self.current() {
                None => {
                    tokens.push(Token {
                        kind: TokenKind::Eof,
                        line,
                        column,
                    });
                    return Ok(tokens);
                }
                Some(ch) => match ch {
                    '0'..='9' => self.read_number()?,
                    '\'' | '"' => TokenKind::String(self.read_string(ch)?),
                    'a'..='z' | 'A'..='Z' | '_' => self.read_identifier(),
                    '+' => {
                        self.advance();
                        TokenKind::Plus
                    }
                    '-' => {
                        self.advance();
                        TokenKind::Minus
                    }
                    '*' => {
                        self.advance();
                        TokenKind::Star
                    }
                    '/' => {
                        self.advance();
                        TokenKind::Slash
                    }
                    '%' => {
                        self.advance();
                        TokenKind::Percent
                    }
                    '?' => {
                        self.advance();
                        TokenKind::Question
                    }
                    ':' => {
                        self.advance();
                        TokenKind::Colon
                    }
                    '(' => {
                        self.advance();
                        TokenKind::LeftParen
                    }
                    ')' => {
                        self.advance();
                        TokenKind::RightParen
                    }
                    '[' => {
                        self.advance();
                        TokenKind::LeftBracket
                    }
                    ']' => {
                        self.advance();
                        TokenKind::RightBracket
                    }
                    '.' => {
                        self.advance();
                        TokenKind::Dot
                    }
                    ',' => {
                        self.advance();
                        TokenKind::Comma
                    }
                    '!' => {
                        self.advance();
                        if self.current() == Some('=') {
                            self.advance();
                            TokenKind::NotEq
                        } else {
                            TokenKind::Bang
                        }
                    }
                    '=' if self.peek(1) == Some('=') => {
                        self.advance();
                        self.advance();
                        TokenKind::EqEq
                    }
                    '<' => {
                        self.advance();
                        if self.current() == Some('=') {
                            self.advance();
                            TokenKind::Le
                        } else {
                            TokenKind::Lt
                        }
                    }
                    '>' => {
                        self.advance();
                        if self.current() == Some('=') {
                            self.advance();
                            TokenKind::Ge
                        } else {
                            TokenKind::Gt
                        }
                    }
                    '&' if self.peek(1) == Some('&') => {
                        self.advance();
                        self.advance();
                        TokenKind::AndAnd
                    }
                    '|' if self.peek(1) == Some('|') => {
                        self.advance();
                        self.advance();
                        TokenKind::OrOr
                    }
                    other => {
                        return Err(ParserError::UnexpectedToken {
                            found: other.to_string(),
                            line,
                            column,
                        })
                    }
                },
            };
            tokens.push(Token { kind, line, column });
        }
    }

    fn read_number(&mut self) -> Result<TokenKind, ParserError> {
        let mut text = String::new();
        let mut is_float = false;

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        if self.current() == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.advance();
            while let Some(ch) = self.current() {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            let mut lookahead = 1;
            if matches!(self.peek(1), Some('+') | Some('-')) {
                lookahead = 2;
            }
            if self.peek(lookahead).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                for _ in 0..lookahead {
                    text.push(self.current().ok_or(ParserError::UnexpectedEnd)?);
                    self.advance();
                }
                while let Some(ch) = self.current() {
                    if ch.is_ascii_digit() {
                        text.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| ParserError::InvalidNumber(text))
        } else {
            // integral literals stay integral; fall back to float on overflow
            match text.parse::<i64>() {
                Ok(n) => Ok(TokenKind::Int(n)),
                Err(_) => text
                    .parse::<f64>()
                    .map(TokenKind::Float)
                    .map_err(|_| ParserError::InvalidNumber(text)),
            }
        }
    }

    fn read_string(&mut self, quote_char: char) -> Result<String, ParserError> {
        let mut result = String::new();
        self.advance(); // skip opening quote

        loop {
            match self.current() {
                None => return Err(ParserError::UnclosedString),
                Some(ch) if ch == quote_char => {
                    self.advance(); // skip closing quote
                    return Ok(result);
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        None => return Err(ParserError::UnclosedString),
                        Some('\'') => result.push('\''),
                        Some('"') => result.push('"'),
                        Some('\\') => result.push('\\'),
                        Some('/') => result.push('/'),
                        Some('b') => result.push('\u{0008}'),
                        Some('f') => result.push('\u{000C}'),
                        Some('n') => result.push('\n'),
                        Some('r') => result.push('\r'),
                        Some('t') => result.push('\t'),
                        Some('u') => {
                            self.advance();
                            let mut hex = String::new();
                            for _ in 0..4 {
                                match self.current() {
                                    Some(h) if h.is_ascii_hexdigit() => {
                                        hex.push(h);
                                        self.advance();
                                    }
                                    _ => {
                                        return Err(ParserError::InvalidEscape(format!(
                                            "\\u{}",
                                            hex
                                        )))
                                    }
                                }
                            }
                            let code = u32::from_str_radix(&hex, 16)
                                .map_err(|_| ParserError::InvalidEscape(format!("\\u{}", hex)))?;
                            if let Some(ch) = char::from_u32(code) {
                                result.push(ch);
                            } else {
                                return Err(ParserError::InvalidEscape(format!("\\u{}", hex)));
                            }
                            continue; // don't advance again
                        }
                        Some(ch) => return Err(ParserError::InvalidEscape(format!("\\{}", ch))),
                    }
                    self.advance();
                }
                Some(ch) => {
                    result.push(ch);
                    self.advance();
                }
            }
        }
    }

    fn read_identifier(&mut self) -> TokenKind {
        let mut text = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        match text.as_str() {
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            _ => TokenKind::Identifier(text),
        }
    }
}

/// Builds expression trees from source, validating function names against a
/// registry. Cheap to clone per compile site; the registry is shared.
pub struct ExpressionBuilder {
    registry: Rc<FunctionRegistry>,
}

impl ExpressionBuilder {
    pub fn new() -> Self {
        ExpressionBuilder {
            registry: Rc::new(FunctionRegistry::new()),
        }
    }

    pub fn with_registry(registry: Rc<FunctionRegistry>) -> Self {
        ExpressionBuilder { registry }
    }

    /// Parse `source` into an expression tree. `start` names the markup
    /// file and line the expression came from; node locations are offset
    /// from it.
    pub fn build_expression(
        &self,
        source: &str,
        start: &Location,
    ) -> Result<Expression, ParserError> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser {
            tokens,
            position: 0,
            registry: &self.registry,
            base: start,
        };
        let expression = parser.parse_expression()?;
        parser.expect_eof()?;
        trace!("compiled expression <{}>", source);
        Ok(expression)
    }
}

impl Default for ExpressionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    registry: &'a FunctionRegistry,
    base: &'a Location,
}

impl<'a> Parser<'a> {
    fn current(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let token = self.current().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.current().kind == kind {
            self.bump();
            return true;
        }
        false
    }

    /// Consume a bare identifier used as an alphabetic operator (eq, ne,
    /// lt, gt, le, ge).
    fn eat_operator_word(&mut self, word: &str) -> bool {
        if let TokenKind::Identifier(name) = &self.current().kind {
            if name == word {
                self.bump();
                return true;
            }
        }
        false
    }

    fn location_of(&self, token: &Token) -> Location {
        Location::new(
            self.base.source.clone(),
            self.base.line + token.line - 1,
            token.column,
        )
    }

    fn here(&self) -> Location {
        self.location_of(&self.current().clone())
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<(), ParserError> {
        if self.eat(kind) {
            return Ok(());
        }
        Err(ParserError::Expected {
            expected: expected.to_string(),
            found: self.current().kind.describe(),
        })
    }

    fn expect_eof(&mut self) -> Result<(), ParserError> {
        let token = self.current();
        if token.kind == TokenKind::Eof {
            return Ok(());
        }
        Err(ParserError::UnexpectedToken {
            found: token.kind.describe(),
            line: token.line,
            column: token.column,
        })
    }

    fn call(&self, function: Function, args: Vec<Expression>, location: Location) -> Expression {
        Expression::FunctionCall(FunctionCall::new(function, args, location))
    }

    fn parse_expression(&mut self) -> Result<Expression, ParserError> {
        self.parse_ternary()
    }

    // cond ? then : else — right-associative
    fn parse_ternary(&mut self) -> Result<Expression, ParserError> {
        let condition = self.parse_or()?;
        if !self.eat(&TokenKind::Question) {
            return Ok(condition);
        }
        let location = condition.location().clone();
        let when_true = self.parse_expression()?;
        self.expect(&TokenKind::Colon, ":")?;
        let when_false = self.parse_expression()?;
        Ok(self.call(
            Function::Ternary,
            vec![condition, when_true, when_false],
            location,
        ))
    }

    fn parse_or(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::OrOr) {
            let right = self.parse_and()?;
            let location = left.location().clone();
            left = self.call(Function::Or, vec![left, right], location);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let right = self.parse_equality()?;
            let location = left.location().clone();
            left = self.call(Function::And, vec![left, right], location);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_relational()?;
        loop {
            let function = if self.eat(&TokenKind::EqEq) || self.eat_operator_word("eq") {
                Function::Equals
            } else if self.eat(&TokenKind::NotEq) || self.eat_operator_word("ne") {
                Function::NotEquals
            } else {
                return Ok(left);
            };
            let right = self.parse_relational()?;
            let location = left.location().clone();
            left = self.call(function, vec![left, right], location);
        }
    }

    fn parse_relational(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_additive()?;
        loop {
            let function = if self.eat(&TokenKind::Le) || self.eat_operator_word("le") {
                Function::LessThanOrEqual
            } else if self.eat(&TokenKind::Ge) || self.eat_operator_word("ge") {
                Function::GreaterThanOrEqual
            } else if self.eat(&TokenKind::Lt) || self.eat_operator_word("lt") {
                Function::LessThan
            } else if self.eat(&TokenKind::Gt) || self.eat_operator_word("gt") {
                Function::GreaterThan
            } else {
                return Ok(left);
            };
            let right = self.parse_additive()?;
            let location = left.location().clone();
            left = self.call(function, vec![left, right], location);
        }
    }

    fn parse_additive(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let function = if self.eat(&TokenKind::Plus) {
                Function::Add
            } else if self.eat(&TokenKind::Minus) {
                Function::Subtract
            } else {
                return Ok(left);
            };
            let right = self.parse_multiplicative()?;
            let location = left.location().clone();
            left = self.call(function, vec![left, right], location);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, ParserError> {
        let mut left = self.parse_unary()?;
        loop {
            let function = if self.eat(&TokenKind::Star) {
                Function::Multiply
            } else if self.eat(&TokenKind::Slash) {
                Function::Divide
            } else if self.eat(&TokenKind::Percent) {
                Function::Modulus
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            let location = left.location().clone();
            left = self.call(function, vec![left, right], location);
        }
    }

    fn parse_unary(&mut self) -> Result<Expression, ParserError> {
        let location = self.here();
        if self.eat(&TokenKind::Minus) {
            let operand = self.parse_unary()?;
            return Ok(self.call(Function::Negate, vec![operand], location));
        }
        if self.eat(&TokenKind::Bang) {
            let operand = self.parse_unary()?;
            return Ok(self.call(Function::Not, vec![operand], location));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression, ParserError> {
        let token = self.bump();
        let location = self.location_of(&token);
        match token.kind {
            TokenKind::Int(n) => Ok(Expression::literal(n, location)),
            TokenKind::Float(n) => Ok(Expression::literal(n, location)),
            TokenKind::String(s) => Ok(Expression::literal(s, location)),
            TokenKind::True => Ok(Expression::literal(true, location)),
            TokenKind::False => Ok(Expression::literal(false, location)),
            TokenKind::Null => Ok(Expression::literal(Value::Null, location)),
            TokenKind::LeftParen => {
                let inner = self.parse_expression()?;
                self.expect(&TokenKind::RightParen, ")")?;
                Ok(inner)
            }
            TokenKind::Identifier(name) => {
                if self.eat(&TokenKind::LeftParen) {
                    self.parse_call(&name, location)
                } else {
                    self.parse_property(name, location)
                }
            }
            TokenKind::Eof => Err(ParserError::UnexpectedEnd),
            other => Err(ParserError::UnexpectedToken {
                found: other.describe(),
                line: token.line,
                column: token.column,
            }),
        }
    }

    // name( already consumed through the paren
    fn parse_call(&mut self, name: &str, location: Location) -> Result<Expression, ParserError> {
        let function = self
            .registry
            .lookup(name)
            .ok_or_else(|| ParserError::UnknownFunction(name.to_string()))?;
        let mut args = Vec::new();
        if !self.eat(&TokenKind::RightParen) {
            loop {
                args.push(self.parse_expression()?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                self.expect(&TokenKind::RightParen, ")")?;
                break;
            }
        }
        Ok(self.call(function, args, location))
    }

    // first path part already consumed
    fn parse_property(
        &mut self,
        first: String,
        location: Location,
    ) -> Result<Expression, ParserError> {
        let mut parts = vec![first];
        loop {
            if self.eat(&TokenKind::Dot) {
                match self.bump().kind {
                    TokenKind::Identifier(part) => parts.push(part),
                    TokenKind::Int(n) => parts.push(n.to_string()),
                    other => {
                        return Err(ParserError::Expected {
                            expected: "property name".to_string(),
                            found: other.describe(),
                        })
                    }
                }
            } else if self.eat(&TokenKind::LeftBracket) {
                match self.bump().kind {
                    TokenKind::Int(n) => parts.push(n.to_string()),
                    other => {
                        return Err(ParserError::Expected {
                            expected: "index".to_string(),
                            found: other.describe(),
                        })
                    }
                }
                self.expect(&TokenKind::RightBracket, "]")?;
            } else {
                return Ok(Expression::Property(PropertyReference::new(
                    parts, location,
                )));
            }
        }
    }
}

/// Parse an expression with the default function registry and an anonymous
/// source location.
pub fn parse(source: &str) -> Result<Expression, ParserError> {
    ExpressionBuilder::new().build_expression(source, &Location::new("<expression>", 1, 1))
}
