//! Closed arithmetic grammar for `${eval:'...'}` configuration expressions.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/' | '//' | '%') unary)*
//! unary  := '-' unary | '+' unary | power
//! power  := atom ('**' unary)?
//! atom   := number | '(' expr ')' | ident '(' expr (',' expr)* ')'
//! ```
//!
//! Functions: `max`, `min`, `abs`, `int`, `float`, `round`. Nothing else is
//! callable and there are no free variables; references are substituted by
//! the interpolation pass before evaluation.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("invalid number literal '{0}'")]
    BadNumber(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' takes {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: &'static str,
        got: usize,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    Overflow,
}

/// Evaluated number. Integer arithmetic stays integral until a float enters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{i}"),
            Number::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<Number> for serde_yaml::Value {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => serde_yaml::Value::Number(i.into()),
            Number::Float(f) => serde_yaml::Value::Number(f.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(Number),
    Ident(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    LParen,
    RParen,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit()
                        || chars[i] == '.'
                        || chars[i] == '_'
                        || chars[i] == 'e'
                        || chars[i] == 'E'
                        || ((chars[i] == '-' || chars[i] == '+')
                            && matches!(chars[i - 1], 'e' | 'E')))
                {
                    i += 1;
                }
                let lit: String = chars[start..i].iter().filter(|&&c| c != '_').collect();
                tokens.push(Token::Num(parse_number(&lit)?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::StarStar);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    tokens.push(Token::SlashSlash);
                    i += 2;
                } else {
                    tokens.push(Token::Slash);
                    i += 1;
                }
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

fn parse_number(lit: &str) -> Result<Number, ExprError> {
    let is_float = lit.contains(['.', 'e', 'E']);
    if is_float {
        lit.parse::<f64>()
            .map(Number::Float)
            .map_err(|_| ExprError::BadNumber(lit.to_string()))
    } else {
        lit.parse::<i64>()
            .map(Number::Int)
            .map_err(|_| ExprError::BadNumber(lit.to_string()))
    }
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<Number, ExprError> {
        let mut acc = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    acc = add(acc, self.term()?)?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    acc = sub(acc, self.term()?)?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn term(&mut self) -> Result<Number, ExprError> {
        let mut acc = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    acc = mul(acc, self.unary()?)?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    acc = div(acc, self.unary()?)?;
                }
                Some(Token::SlashSlash) => {
                    self.pos += 1;
                    acc = floor_div(acc, self.unary()?)?;
                }
                Some(Token::Percent) => {
                    self.pos += 1;
                    acc = modulo(acc, self.unary()?)?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn unary(&mut self) -> Result<Number, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                match self.unary()? {
                    Number::Int(i) => i.checked_neg().map(Number::Int).ok_or(ExprError::Overflow),
                    Number::Float(f) => Ok(Number::Float(-f)),
                }
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Number, ExprError> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::StarStar) {
            self.pos += 1;
            let exp = self.unary()?;
            return pow(base, exp);
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Number, ExprError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let v = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(name)) => {
                self.expect(Token::LParen)?;
                let mut args = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                call(&name, &args)
            }
            Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

fn add(a: Number, b: Number) -> Result<Number, ExprError> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x.checked_add(y).map(Number::Int).ok_or(ExprError::Overflow),
        _ => Ok(Number::Float(a.as_f64() + b.as_f64())),
    }
}

fn sub(a: Number, b: Number) -> Result<Number, ExprError> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x.checked_sub(y).map(Number::Int).ok_or(ExprError::Overflow),
        _ => Ok(Number::Float(a.as_f64() - b.as_f64())),
    }
}

fn mul(a: Number, b: Number) -> Result<Number, ExprError> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x.checked_mul(y).map(Number::Int).ok_or(ExprError::Overflow),
        _ => Ok(Number::Float(a.as_f64() * b.as_f64())),
    }
}

/// True division always yields a float.
fn div(a: Number, b: Number) -> Result<Number, ExprError> {
    if b.as_f64() == 0.0 {
        return Err(ExprError::DivisionByZero);
    }
    Ok(Number::Float(a.as_f64() / b.as_f64()))
}

fn floor_div(a: Number, b: Number) -> Result<Number, ExprError> {
    match (a, b) {
        (Number::Int(_), Number::Int(0)) => Err(ExprError::DivisionByZero),
        (Number::Int(x), Number::Int(y)) => {
            let q = x.checked_div_euclid(y).ok_or(ExprError::Overflow)?;
            // div_euclid rounds toward +inf for a negative divisor.
            if y < 0 && x.rem_euclid(y) != 0 {
                Ok(Number::Int(q - 1))
            } else {
                Ok(Number::Int(q))
            }
        }
        _ => {
            if b.as_f64() == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(Number::Float((a.as_f64() / b.as_f64()).floor()))
        }
    }
}

fn modulo(a: Number, b: Number) -> Result<Number, ExprError> {
    match (a, b) {
        (Number::Int(_), Number::Int(0)) => Err(ExprError::DivisionByZero),
        (Number::Int(x), Number::Int(y)) => {
            let r = x % y;
            Ok(Number::Int(if r != 0 && (r < 0) != (y < 0) { r + y } else { r }))
        }
        _ => {
            let (x, y) = (a.as_f64(), b.as_f64());
            if y == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(Number::Float(x - y * (x / y).floor()))
        }
    }
}

fn pow(base: Number, exp: Number) -> Result<Number, ExprError> {
    match (base, exp) {
        (Number::Int(b), Number::Int(e)) if e >= 0 => {
            let e = u32::try_from(e).map_err(|_| ExprError::Overflow)?;
            b.checked_pow(e).map(Number::Int).ok_or(ExprError::Overflow)
        }
        _ => Ok(Number::Float(base.as_f64().powf(exp.as_f64()))),
    }
}

fn call(name: &str, args: &[Number]) -> Result<Number, ExprError> {
    let unary = |expected: &'static str| -> Result<Number, ExprError> {
        if args.len() == 1 {
            Ok(args[0])
        } else {
            Err(ExprError::Arity {
                name: name.to_string(),
                expected,
                got: args.len(),
            })
        }
    };

    match name {
        "max" | "min" => {
            let want_max = name == "max";
            let mut best = args[0];
            for &a in &args[1..] {
                let better = if want_max {
                    a.as_f64() > best.as_f64()
                } else {
                    a.as_f64() < best.as_f64()
                };
                if better {
                    best = a;
                }
            }
            Ok(best)
        }
        "abs" => Ok(match unary("1")? {
            Number::Int(i) => Number::Int(i.checked_abs().ok_or(ExprError::Overflow)?),
            Number::Float(f) => Number::Float(f.abs()),
        }),
        "int" => Ok(match unary("1")? {
            Number::Int(i) => Number::Int(i),
            Number::Float(f) => Number::Int(f.trunc() as i64),
        }),
        "float" => Ok(Number::Float(unary("1")?.as_f64())),
        "round" => Ok(match unary("1")? {
            Number::Int(i) => Number::Int(i),
            Number::Float(f) => Number::Int(f.round() as i64),
        }),
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// Evaluate one arithmetic expression.
pub fn evaluate(src: &str) -> Result<Number, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    match parser.peek() {
        None => Ok(value),
        Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), Number::Int(14));
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), Number::Int(20));
        assert_eq!(evaluate("-2 ** 2").unwrap(), Number::Int(-4));
        assert_eq!(evaluate("2 ** 3 ** 2").unwrap(), Number::Int(512));
    }

    #[test]
    fn test_true_division_is_float() {
        assert_eq!(evaluate("7 / 2").unwrap(), Number::Float(3.5));
        assert_eq!(evaluate("7 // 2").unwrap(), Number::Int(3));
        assert_eq!(evaluate("-7 // 2").unwrap(), Number::Int(-4));
        assert_eq!(evaluate("-7 % 3").unwrap(), Number::Int(2));
    }

    #[test]
    fn test_functions() {
        assert_eq!(evaluate("max(4, 9, 2)").unwrap(), Number::Int(9));
        assert_eq!(evaluate("min(4, 1.5)").unwrap(), Number::Float(1.5));
        assert_eq!(evaluate("int(64 * 1.5)").unwrap(), Number::Int(96));
        assert_eq!(evaluate("round(2.6)").unwrap(), Number::Int(3));
    }

    #[test]
    fn test_floats_and_exponents() {
        assert_eq!(evaluate("1e-3 * 1000").unwrap(), Number::Float(1.0));
        assert_eq!(evaluate("0.5 + 1").unwrap(), Number::Float(1.5));
    }

    #[test]
    fn test_rejects_non_arithmetic() {
        assert!(matches!(
            evaluate("__import__('os')"),
            Err(ExprError::UnexpectedChar('\'', _))
        ));
        assert!(matches!(
            evaluate("open(1)"),
            Err(ExprError::UnknownFunction(name)) if name == "open"
        ));
        assert!(matches!(evaluate("1 +"), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(evaluate("1 2"), Err(ExprError::UnexpectedToken(_))));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(evaluate("1 / 0"), Err(ExprError::DivisionByZero));
        assert_eq!(evaluate("1 // 0"), Err(ExprError::DivisionByZero));
        assert_eq!(evaluate("1 % 0"), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn test_overflow_is_reported() {
        assert_eq!(evaluate("9223372036854775807 + 1"), Err(ExprError::Overflow));
    }
}
