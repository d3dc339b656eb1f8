//! Custom-rule expression language.
//!
//! Grammar (validated at rule-creation time, anything else is rejected):
//!
//! ```text
//! expr       := and_expr ("or" and_expr)*
//! and_expr   := unary ("and" unary)*
//! unary      := "not" unary | comparison
//! comparison := operand (("<" | ">" | "<=" | ">=" | "==" | "!=") operand)?
//! operand    := number | "true" | "false" | identifier | "(" expr ")"
//! ```
//!
//! Identifiers resolve against the current position (`speed`, `ignition`,
//! `satellites`, `altitude`) and every key in `sensors`. An unknown
//! identifier evaluates to null, and any comparison involving null is
//! false. No function calls, no strings, no property access.

use std::collections::HashMap;
use std::fmt;

use crate::domain::NormalizedPosition;

#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    UnexpectedChar(char),
    UnexpectedToken(String),
    UnexpectedEnd,
    TrailingInput(String),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::UnexpectedChar(c) => write!(f, "unexpected character '{c}'"),
            ExprError::UnexpectedToken(t) => write!(f, "unexpected token '{t}'"),
            ExprError::UnexpectedEnd => write!(f, "unexpected end of expression"),
            ExprError::TrailingInput(t) => write!(f, "trailing input at '{t}'"),
        }
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Ident(String),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// Evaluation result; `Null` only ever loses comparisons.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Null,
}

impl Value {
    fn truthy(self) -> bool {
        matches!(self, Value::Bool(true))
    }
}

/// Identifier scope for one evaluation.
pub struct Context {
    values: HashMap<String, Value>,
}

impl Context {
    pub fn from_position(position: &NormalizedPosition) -> Self {
        let mut values = HashMap::new();
        values.insert("speed".into(), Value::Number(position.speed_kmh()));
        values.insert(
            "ignition".into(),
            position.ignition.map(Value::Bool).unwrap_or(Value::Null),
        );
        values.insert(
            "satellites".into(),
            position.satellites.map(|s| Value::Number(s as f64)).unwrap_or(Value::Null),
        );
        values.insert(
            "altitude".into(),
            position.altitude.map(Value::Number).unwrap_or(Value::Null),
        );
        for (key, value) in &position.sensors {
            let value = match value {
                serde_json::Value::Bool(b) => Value::Bool(*b),
                serde_json::Value::Number(n) => {
                    n.as_f64().map(Value::Number).unwrap_or(Value::Null)
                }
                _ => Value::Null,
            };
            values.entry(key.clone()).or_insert(value);
        }
        Self { values }
    }

    fn get(&self, name: &str) -> Value {
        self.values.get(name).copied().unwrap_or(Value::Null)
    }

    #[cfg(test)]
    pub fn with(pairs: &[(&str, Value)]) -> Self {
        Self { values: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect() }
    }
}

impl Expr {
    /// Parse and validate; rule creation calls this and rejects errors.
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(ExprError::TrailingInput(token.describe())),
        }
    }

    /// True only when the expression evaluates to boolean true.
    pub fn matches(&self, ctx: &Context) -> bool {
        self.eval(ctx).truthy()
    }

    fn eval(&self, ctx: &Context) -> Value {
        match self {
            Expr::Number(n) => Value::Number(*n),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Ident(name) => ctx.get(name),
            Expr::Compare(lhs, op, rhs) => {
                Value::Bool(compare(lhs.eval(ctx), *op, rhs.eval(ctx)))
            }
            Expr::And(lhs, rhs) => Value::Bool(lhs.eval(ctx).truthy() && rhs.eval(ctx).truthy()),
            Expr::Or(lhs, rhs) => Value::Bool(lhs.eval(ctx).truthy() || rhs.eval(ctx).truthy()),
            Expr::Not(inner) => Value::Bool(!inner.eval(ctx).truthy()),
        }
    }
}

/// Null never satisfies a comparison; mixed types never satisfy one either.
fn compare(lhs: Value, op: CmpOp, rhs: Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match op {
            CmpOp::Lt => a < b,
            CmpOp::Gt => a > b,
            CmpOp::Le => a <= b,
            CmpOp::Ge => a >= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            _ => false,
        },
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    True,
    False,
    And,
    Or,
    Not,
    Cmp(CmpOp),
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Ident(name) => name.clone(),
            Token::True => "true".into(),
            Token::False => "false".into(),
            Token::And => "and".into(),
            Token::Or => "or".into(),
            Token::Not => "not".into(),
            Token::Cmp(_) => "comparison".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, eq) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    _ => return Err(ExprError::UnexpectedChar(c)),
                };
                tokens.push(Token::Cmp(op));
                i += if eq { 2 } else { 1 };
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse().map_err(|_| ExprError::UnexpectedToken(text))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ExprError::UnexpectedChar(other)),
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

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.next();
            let rhs = self.parse_operand()?;
            return Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_operand(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(token) => Err(ExprError::UnexpectedToken(token.describe())),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(token) => Err(ExprError::UnexpectedToken(token.describe())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(input: &str, pairs: &[(&str, Value)]) -> bool {
        Expr::parse(input).unwrap().matches(&Context::with(pairs))
    }

    #[test]
    fn comparisons() {
        assert!(eval("speed > 80", &[("speed", Value::Number(90.0))]));
        assert!(!eval("speed > 80", &[("speed", Value::Number(70.0))]));
        assert!(eval("speed >= 80", &[("speed", Value::Number(80.0))]));
        assert!(eval("speed != 80", &[("speed", Value::Number(81.0))]));
        assert!(eval("speed == 80", &[("speed", Value::Number(80.0))]));
    }

    #[test]
    fn boolean_logic_and_precedence() {
        let ctx = [("speed", Value::Number(90.0)), ("ignition", Value::Bool(true))];
        assert!(eval("speed > 80 and ignition", &ctx));
        assert!(eval("speed > 100 or ignition", &ctx));
        assert!(!eval("not ignition", &ctx));
        // "or" binds looser than "and".
        assert!(eval("false and false or true", &[]));
        assert!(eval("(speed > 100 or speed < 95) and ignition", &ctx));
    }

    #[test]
    fn unknown_identifier_comparisons_are_false() {
        assert!(!eval("battery_voltage < 3.5", &[]));
        assert!(!eval("battery_voltage > 3.5", &[]));
        assert!(!eval("battery_voltage == 3.5", &[]));
        // ...but the surrounding logic still works.
        assert!(eval("battery_voltage < 3.5 or true", &[]));
    }

    #[test]
    fn mixed_type_comparisons_are_false() {
        let ctx = [("ignition", Value::Bool(true))];
        assert!(!eval("ignition > 1", &ctx));
        assert!(eval("ignition == true", &ctx));
        assert!(eval("ignition != false", &ctx));
    }

    #[test]
    fn grammar_rejections() {
        assert!(Expr::parse("speed > 80 and").is_err());
        assert!(Expr::parse("foo(1)").is_err()); // call syntax
        assert!(Expr::parse("a.b > 1").is_err()); // property access
        assert!(Expr::parse("speed > 'fast'").is_err()); // strings
        assert!(Expr::parse("speed >> 1").is_err());
        assert!(Expr::parse("(speed > 1").is_err());
        assert!(Expr::parse("1 2").is_err());
        assert!(Expr::parse("").is_err());
    }

    #[test]
    fn context_from_position_exposes_sensors_by_bare_name() {
        let mut position = crate::domain::NormalizedPosition::new(
            "x",
            time::macros::datetime!(2024-03-15 08:30 UTC),
            1.0,
            2.0,
        );
        position.speed = Some(42.0);
        position.ignition = Some(true);
        position.sensors.insert("battery_voltage".into(), serde_json::json!(3.2));
        position.sensors.insert("moving".into(), serde_json::json!(false));
        let ctx = Context::from_position(&position);
        assert!(Expr::parse("battery_voltage < 3.5").unwrap().matches(&ctx));
        assert!(Expr::parse("speed == 42 and not moving").unwrap().matches(&ctx));
        assert!(!Expr::parse("satellites >= 0").unwrap().matches(&ctx)); // null
    }
}
