//! Calculator plugin: evaluates arithmetic expressions without executing code.
//!
//! Expressions are tokenized and parsed by a small recursive-descent parser.
//! Only numbers, the operators `+ - * / % **` (`^` is accepted as an alias
//! for `**`), parentheses, a fixed set of functions and the constants `pi`
//! and `e` are understood. Anything else is rejected.
//!
//! Precedence, loosest first: `+ -`, `* / %`, unary `+ -`, `**`. Power is
//! right-associative and binds tighter than a leading minus, so `-2**2` is
//! `-4`.

use super::{Plugin, PluginFuture};
use crate::{PluginError, json_schema_for};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;
use tracing::debug;

/// Registry name of the calculator plugin.
pub const CALCULATOR_NAME: &str = "calculator";

/// Longest expression accepted, in characters.
const MAX_EXPRESSION_LEN: usize = 512;

/// Deepest parenthesis / function nesting accepted.
const MAX_DEPTH: usize = 64;

const FUNCTIONS: &[&str] = &[
    "sqrt", "sin", "cos", "tan", "log", "exp", "abs", "round", "floor", "ceil",
];

/// Arguments accepted by the calculator.
#[derive(Deserialize, JsonSchema)]
pub struct CalculateArgs {
    /// Arithmetic expression, e.g. `2 + 3 * 4`, `sqrt(16)`, `sin(pi / 2)`.
    pub expression: String,
}

/// Why an expression could not be evaluated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("expression is empty")]
    Empty,

    #[error("expression is longer than {MAX_EXPRESSION_LEN} characters")]
    TooLong,

    #[error("expression nests deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),

    #[error("malformed number '{0}'")]
    BadNumber(String),

    #[error("unknown name '{0}'")]
    UnknownName(String),

    #[error("unexpected {0}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("division by zero")]
    DivisionByZero,

    #[error("math domain error in {0}")]
    Domain(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => format!("number {n}"),
            Token::Ident(s) => format!("name '{s}'"),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::Slash => "'/'".into(),
            Token::Percent => "'%'".into(),
            Token::Pow => "'**'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<Chars<'_>> = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => tokens.push(lex_number(&mut chars)?),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '*' => {
                chars.next();
                if chars.peek() == Some(&'*') {
                    chars.next();
                    tokens.push(Token::Pow);
                } else {
                    tokens.push(Token::Star);
                }
            }
            _ => {
                chars.next();
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '^' => Token::Pow,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    other => return Err(EvalError::UnexpectedChar(other)),
                });
            }
        }
    }
    Ok(tokens)
}

/// Lex digits, an optional fraction and an optional exponent (`1.5e-3`).
fn lex_number(chars: &mut Peekable<Chars<'_>>) -> Result<Token, EvalError> {
    let mut text = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if matches!(chars.peek(), Some('e' | 'E')) {
        // Only treat `e` as an exponent when digits follow; otherwise it is
        // the start of a name such as the constant `e` (`2e` is an error
        // further down, `2 e` would be too).
        let mut lookahead = chars.clone();
        lookahead.next();
        if matches!(lookahead.peek(), Some('+' | '-')) {
            lookahead.next();
        }
        if lookahead.peek().is_some_and(|c| c.is_ascii_digit()) {
            text.push('e');
            chars.next();
            if let Some(&sign @ ('+' | '-')) = chars.peek() {
                text.push(sign);
                chars.next();
            }
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
        }
    }
    text.parse::<f64>()
        .map(Token::Num)
        .map_err(|_| EvalError::BadNumber(text))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
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

    fn expect(&mut self, expected: Token) -> Result<(), EvalError> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(EvalError::UnexpectedToken(t.describe())),
            None => Err(EvalError::UnexpectedEnd),
        }
    }

    fn descend(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<f64, EvalError> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.next();
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.next();
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, EvalError> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.next();
                    value *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.next();
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    value /= rhs;
                }
                Some(Token::Percent) => {
                    self.next();
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    // Result takes the sign of the divisor.
                    value -= rhs * (value / rhs).floor();
                }
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self) -> Result<f64, EvalError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.next();
                self.descend()?;
                let v = self.unary()?;
                self.depth -= 1;
                Ok(-v)
            }
            Some(Token::Plus) => {
                self.next();
                self.descend()?;
                let v = self.unary()?;
                self.depth -= 1;
                Ok(v)
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, EvalError> {
        let base = self.primary()?;
        if self.peek() == Some(&Token::Pow) {
            self.next();
            self.descend()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            return checked("**", base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, EvalError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                self.descend()?;
                let v = self.expr()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(v)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "pi" => Ok(std::f64::consts::PI),
                "e" => Ok(std::f64::consts::E),
                f if FUNCTIONS.contains(&f) => {
                    self.expect(Token::LParen)?;
                    self.descend()?;
                    let arg = self.expr()?;
                    self.expect(Token::RParen)?;
                    self.depth -= 1;
                    apply(f, arg)
                }
                _ => Err(EvalError::UnknownName(name.clone())),
            },
            Some(t) => Err(EvalError::UnexpectedToken(t.describe())),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}

fn apply(function: &str, x: f64) -> Result<f64, EvalError> {
    let value = match function {
        "sqrt" if x < 0.0 => return Err(EvalError::Domain("sqrt".into())),
        "sqrt" => x.sqrt(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "log" if x <= 0.0 => return Err(EvalError::Domain("log".into())),
        "log" => x.ln(),
        "exp" => x.exp(),
        "abs" => x.abs(),
        "round" => x.round_ties_even(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        other => return Err(EvalError::UnknownName(other.to_string())),
    };
    checked(function, value)
}

fn checked(op: &str, value: f64) -> Result<f64, EvalError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EvalError::Domain(op.to_string()))
    }
}

/// Evaluate an arithmetic expression.
pub fn evaluate(expression: &str) -> Result<f64, EvalError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(EvalError::Empty);
    }
    if expression.chars().count() > MAX_EXPRESSION_LEN {
        return Err(EvalError::TooLong);
    }

    let mut parser = Parser {
        tokens: tokenize(expression)?,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(extra) = parser.peek() {
        return Err(EvalError::UnexpectedToken(extra.describe()));
    }
    checked("expression", value)
}

/// The built-in calculator plugin.
#[derive(Debug, Default, Clone, Copy)]
pub struct Calculator;

impl Calculator {
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for Calculator {
    fn name(&self) -> &str {
        CALCULATOR_NAME
    }

    fn description(&self) -> &str {
        "Evaluates arithmetic safely. Supports + - * / % ** and parentheses, \
         sqrt, sin, cos, tan, log, exp, abs, round, floor, ceil, and the constants pi and e."
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "name": CALCULATOR_NAME,
            "description": self.description(),
            "parameters": json_schema_for::<CalculateArgs>(),
        })
    }

    fn execute(&self, args: serde_json::Value) -> PluginFuture<'_> {
        Box::pin(async move {
            let args: CalculateArgs =
                serde_json::from_value(args).map_err(|e| PluginError::InvalidArguments {
                    name: CALCULATOR_NAME.into(),
                    reason: e.to_string(),
                })?;
            let expression = args.expression.trim().to_string();

            let result = evaluate(&expression).map_err(|e| PluginError::Execution {
                name: CALCULATOR_NAME.into(),
                reason: e.to_string(),
            })?;

            debug!("Calculated {expression} = {result}");
            Ok(json!({ "result": result, "expression": expression }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str) -> f64 {
        evaluate(expr).unwrap_or_else(|e| panic!("{expr}: {e}"))
    }

    #[test]
    fn precedence() {
        assert_eq!(eval("2 + 3 * 4"), 14.0);
        assert_eq!(eval("(2 + 3) * 4"), 20.0);
        assert_eq!(eval("10 - 4 - 3"), 3.0);
        assert_eq!(eval("2 ** 3 ** 2"), 512.0);
        assert_eq!(eval("-2 ** 2"), -4.0);
        assert_eq!(eval("2 ** -1"), 0.5);
        assert_eq!(eval("2 ^ 10"), 1024.0);
    }

    #[test]
    fn functions_and_constants() {
        assert_eq!(eval("sqrt(16) + 2**3"), 12.0);
        assert!((eval("sin(pi / 2)") - 1.0).abs() < 1e-12);
        assert!((eval("log(e)") - 1.0).abs() < 1e-12);
        assert_eq!(eval("abs(-3.5)"), 3.5);
        assert_eq!(eval("floor(2.7) + ceil(2.1)"), 5.0);
        assert_eq!(eval("round(2.5)"), 2.0);
        assert_eq!(eval("round(3.5)"), 4.0);
    }

    #[test]
    fn modulo_takes_divisor_sign() {
        assert_eq!(eval("7 % 3"), 1.0);
        assert_eq!(eval("-7 % 3"), 2.0);
        assert_eq!(eval("7 % -3"), -2.0);
    }

    #[test]
    fn scientific_notation_and_constant_e() {
        assert_eq!(eval("1.5e3"), 1500.0);
        assert_eq!(eval("2e-1"), 0.2);
        assert!((eval("2*e") - 2.0 * std::f64::consts::E).abs() < 1e-12);
    }

    #[test]
    fn errors() {
        assert_eq!(evaluate("1 / 0"), Err(EvalError::DivisionByZero));
        assert_eq!(evaluate("5 % 0"), Err(EvalError::DivisionByZero));
        assert_eq!(evaluate(""), Err(EvalError::Empty));
        assert_eq!(evaluate("sqrt(-1)"), Err(EvalError::Domain("sqrt".into())));
        assert_eq!(evaluate("log(0)"), Err(EvalError::Domain("log".into())));
        assert_eq!(
            evaluate("__import__"),
            Err(EvalError::UnknownName("__import__".into()))
        );
        assert_eq!(evaluate("2 +"), Err(EvalError::UnexpectedEnd));
        assert_eq!(evaluate("(1 + 2"), Err(EvalError::UnexpectedEnd));
        assert!(matches!(evaluate("1 2"), Err(EvalError::UnexpectedToken(_))));
        assert_eq!(evaluate("2 $ 3"), Err(EvalError::UnexpectedChar('$')));
        assert!(matches!(evaluate("1..2"), Err(EvalError::BadNumber(_))));
        assert_eq!(evaluate("10 ** 400"), Err(EvalError::Domain("**".into())));
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&deep), Err(EvalError::TooDeep));
        let ok = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(eval(&ok), 1.0);
        assert_eq!(evaluate(&"-".repeat(200)), Err(EvalError::TooDeep));
    }

    #[test]
    fn length_is_bounded() {
        let long = vec!["1"; 400].join("+");
        assert_eq!(evaluate(&long), Err(EvalError::TooLong));
    }

    #[tokio::test]
    async fn plugin_returns_result_and_expression() {
        let out = Calculator
            .execute(json!({"expression": " 2 + 3 * 4 "}))
            .await
            .unwrap();
        assert_eq!(out["result"], 14.0);
        assert_eq!(out["expression"], "2 + 3 * 4");
    }

    #[tokio::test]
    async fn plugin_reports_failures() {
        let err = Calculator
            .execute(json!({"expression": "1/0"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Execution { .. }));

        let err = Calculator.execute(json!({"expr": "1"})).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidArguments { .. }));
    }

    #[test]
    fn schema_names_the_plugin() {
        let schema = Calculator.schema();
        assert_eq!(schema["name"], CALCULATOR_NAME);
        assert_eq!(schema["parameters"]["type"], "object");
    }
}
