//! Sandboxed expression language for conditions, guards, and the calculator tool.
//!
//! Expressions can only read named values from a scope and combine them with
//! a fixed set of operators. There are no function calls, assignments, or
//! attribute lookups beyond plain JSON navigation.
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := not (("&&" | "and") not)*
//! not     := ("!" | "not") not | compare
//! compare := sum (("==" | "!=" | "<" | "<=" | ">" | ">=" | "contains" | "in") sum)?
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "%") unary)*
//! unary   := "-" unary | primary
//! primary := number | string | true | false | null | path | "(" or ")"
//! path    := ident ("." (ident | integer) | "[" (string | integer) "]")*
//! ```
//!
//! Paths that do not resolve evaluate to `null`.

use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::types::Context;

const MAX_DEPTH: usize = 64;
const MAX_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Path(String, Vec<Segment>),
    Not(Box<Node>),
    Neg(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Binary(&'static str, Box<Node>, Box<Node>),
}

/// A parsed expression, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    source: String,
    root: Node,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self> {
        if source.len() > MAX_LEN {
            return Err(WeftError::Expression(format!(
                "expression longer than {} bytes",
                MAX_LEN
            )));
        }
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(WeftError::Expression("empty expression".into()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.or()?;
        if let Some(tok) = parser.peek() {
            return Err(WeftError::Expression(format!(
                "unexpected token {:?} in '{}'",
                tok, source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, scope: &Context) -> Result<Value> {
        eval(&self.root, scope)
    }

    pub fn eval_bool(&self, scope: &Context) -> Result<bool> {
        self.eval(scope).map(|v| is_truthy(&v))
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, scope: &Context) -> Result<Value> {
    Expr::parse(source)?.eval(scope)
}

/// Parse and evaluate, reducing the result to a boolean.
pub fn evaluate_bool(source: &str, scope: &Context) -> Result<bool> {
    Expr::parse(source)?.eval_bool(scope)
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            // After a dot this is a path index, so never take a fraction.
            let after_dot = matches!(tokens.last(), Some(Token::Dot));
            if !after_dot
                && i + 1 < chars.len()
                && chars[i] == '.'
                && chars[i + 1].is_ascii_digit()
            {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| WeftError::Expression(format!("bad number '{}'", text)))?;
            tokens.push(Token::Num(n));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "and" => Token::Op("&&"),
                "or" => Token::Op("||"),
                "not" => Token::Op("!"),
                "contains" => Token::Op("contains"),
                "in" => Token::Op("in"),
                _ => Token::Ident(word),
            });
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' && i + 1 < chars.len() {
                    s.push(match chars[i + 1] {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    i += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                s.push(ch);
                i += 1;
            }
            if !closed {
                return Err(WeftError::Expression("unterminated string".into()));
            }
            tokens.push(Token::Str(s));
            continue;
        }

        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let op2 = match two.as_str() {
            "==" => Some("=="),
            "!=" => Some("!="),
            "<=" => Some("<="),
            ">=" => Some(">="),
            "&&" => Some("&&"),
            "||" => Some("||"),
            _ => None,
        };
        if let Some(op) = op2 {
            tokens.push(Token::Op(op));
            i += 2;
            continue;
        }

        tokens.push(match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '.' => Token::Dot,
            '<' => Token::Op("<"),
            '>' => Token::Op(">"),
            '!' => Token::Op("!"),
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '%' => Token::Op("%"),
            other => {
                return Err(WeftError::Expression(format!(
                    "unexpected character '{}'",
                    other
                )))
            }
        });
        i += 1;
    }

    Ok(tokens)
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
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(WeftError::Expression("expression nested too deeply".into()));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Node> {
        self.enter()?;
        let mut left = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            let right = self.and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        self.depth -= 1;
        Ok(left)
    }

    fn and(&mut self) -> Result<Node> {
        let mut left = self.not()?;
        while self.eat_op(&["&&"]).is_some() {
            let right = self.not()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Node> {
        if self.eat_op(&["!"]).is_some() {
            self.enter()?;
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Node> {
        let left = self.sum()?;
        if let Some(op) = self.eat_op(&["==", "!=", "<", "<=", ">", ">=", "contains", "in"]) {
            let right = self.sum()?;
            return Ok(Node::Binary(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn sum(&mut self) -> Result<Node> {
        let mut left = self.product()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.product()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn product(&mut self) -> Result<Node> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let right = self.unary()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Node> {
        if self.eat_op(&["-"]).is_some() {
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Node::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Node::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" | "True" => Ok(Node::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Node::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Node::Literal(Value::Null)),
                _ => self.path(word),
            },
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(WeftError::Expression("expected ')'".into())),
                }
            }
            Some(tok) => Err(WeftError::Expression(format!("unexpected token {:?}", tok))),
            None => Err(WeftError::Expression("unexpected end of expression".into())),
        }
    }

    fn path(&mut self, root: String) -> Result<Node> {
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Num(n)) => segments.push(Segment::Index(index(n)?)),
                        _ => return Err(WeftError::Expression("expected name after '.'".into())),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let seg = match self.next() {
                        Some(Token::Str(key)) => Segment::Key(key),
                        Some(Token::Num(n)) => Segment::Index(index(n)?),
                        _ => {
                            return Err(WeftError::Expression(
                                "expected string or integer index".into(),
                            ))
                        }
                    };
                    if self.next() != Some(Token::RBracket) {
                        return Err(WeftError::Expression("expected ']'".into()));
                    }
                    segments.push(seg);
                }
                _ => break,
            }
        }
        Ok(Node::Path(root, segments))
    }
}

fn index(n: f64) -> Result<usize> {
    if n < 0.0 || n.fract() != 0.0 {
        return Err(WeftError::Expression(format!("bad index {}", n)));
    }
    Ok(n as usize)
}

/// Integral values stay integers so `2 + 3` renders as `5`, not `5.0`.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn lookup(scope: &Context, root: &str, segments: &[Segment]) -> Value {
    let mut current = match scope.get(root) {
        Some(v) => v,
        None => return Value::Null,
    };
    for seg in segments {
        let next = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(k),
            (Segment::Key(k), Value::Array(items)) => {
                k.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            (Segment::Index(i), Value::Array(items)) => items.get(*i),
            (Segment::Index(i), Value::Object(map)) => map.get(&i.to_string()),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn eval(node: &Node, scope: &Context) -> Result<Value> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Path(root, segments) => Ok(lookup(scope, root, segments)),
        Node::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, scope)?))),
        Node::Neg(inner) => {
            let v = eval(inner, scope)?;
            let n = as_number(&v, "-")?;
            Ok(number(-n))
        }
        Node::And(l, r) => {
            if !is_truthy(&eval(l, scope)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval(r, scope)?)))
        }
        Node::Or(l, r) => {
            if is_truthy(&eval(l, scope)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval(r, scope)?)))
        }
        Node::Binary(op, l, r) => {
            let left = eval(l, scope)?;
            let right = eval(r, scope)?;
            binary(op, &left, &right)
        }
    }
}

fn as_number(v: &Value, op: &str) -> Result<f64> {
    v.as_f64().ok_or_else(|| {
        WeftError::Expression(format!("operator '{}' needs a number, got {}", op, v))
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            other => Ok(s.contains(&other.to_string())),
        },
        Value::Array(items) => Ok(items.iter().any(|i| values_equal(i, needle))),
        Value::Object(map) => match needle {
            Value::String(k) => Ok(map.contains_key(k)),
            _ => Ok(false),
        },
        Value::Null => Ok(false),
        other => Err(WeftError::Expression(format!(
            "cannot search inside {}",
            other
        ))),
    }
}

fn binary(op: &str, left: &Value, right: &Value) -> Result<Value> {
    match op {
        "==" => Ok(Value::Bool(values_equal(left, right))),
        "!=" => Ok(Value::Bool(!values_equal(left, right))),
        "<" | "<=" | ">" | ">=" => {
            let ord = match (left, right) {
                (Value::Number(_), Value::Number(_)) => {
                    let (a, b) = (as_number(left, op)?, as_number(right, op)?);
                    a.partial_cmp(&b)
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| {
                WeftError::Expression(format!("cannot compare {} {} {}", left, op, right))
            })?;
            Ok(Value::Bool(match op {
                "<" => ord.is_lt(),
                "<=" => ord.is_le(),
                ">" => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        "contains" => contains(left, right).map(Value::Bool),
        "in" => contains(right, left).map(Value::Bool),
        "+" => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => Ok(number(as_number(left, op)? + as_number(right, op)?)),
        },
        "-" => Ok(number(as_number(left, op)? - as_number(right, op)?)),
        "*" => Ok(number(as_number(left, op)? * as_number(right, op)?)),
        "/" | "%" => {
            let (a, b) = (as_number(left, op)?, as_number(right, op)?);
            if b == 0.0 {
                return Err(WeftError::Expression("division by zero".into()));
            }
            Ok(number(if op == "/" { a / b } else { a % b }))
        }
        other => Err(WeftError::Expression(format!("unknown operator '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(v: Value) -> Context {
        match v {
            Value::Object(map) => map,
            _ => Context::new(),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        let s = Context::new();
        assert_eq!(evaluate("2 + 3 * 4", &s).unwrap(), json!(14));
        assert_eq!(evaluate("(2 + 3) * 4", &s).unwrap(), json!(20));
        assert_eq!(evaluate("10 / 4", &s).unwrap(), json!(2.5));
        assert_eq!(evaluate("-3 + 1", &s).unwrap(), json!(-2));
        assert_eq!(evaluate("7 % 3", &s).unwrap(), json!(1));
    }

    #[test]
    fn paths_resolve_into_scope() {
        let s = scope(json!({
            "inputs": {"threshold": 5},
            "results": {"score": {"value": 8, "tags": ["a", "b"]}, "my-task": {"ok": true}}
        }));
        assert!(evaluate_bool("results.score.value > inputs.threshold", &s).unwrap());
        assert_eq!(evaluate("results.score.tags.1", &s).unwrap(), json!("b"));
        assert_eq!(evaluate("results['my-task'].ok", &s).unwrap(), json!(true));
        assert_eq!(evaluate("results.missing.value", &s).unwrap(), Value::Null);
    }

    #[test]
    fn boolean_operators_short_circuit() {
        let s = scope(json!({"a": 1}));
        assert!(evaluate_bool("a == 1 and not false", &s).unwrap());
        assert!(evaluate_bool("a == 2 || a >= 1", &s).unwrap());
        // Right side would fail to compare, but is never evaluated.
        assert!(!evaluate_bool("false && (a < 'x')", &s).unwrap());
        assert!(evaluate_bool("!missing", &s).unwrap());
    }

    #[test]
    fn contains_and_in() {
        let s = scope(json!({"text": "hello world", "list": [1, 2, 3], "obj": {"k": 1}}));
        assert!(evaluate_bool("text contains 'world'", &s).unwrap());
        assert!(evaluate_bool("2 in list", &s).unwrap());
        assert!(evaluate_bool("obj contains \"k\"", &s).unwrap());
        assert!(!evaluate_bool("5 in list", &s).unwrap());
    }

    #[test]
    fn numeric_equality_ignores_representation() {
        let s = scope(json!({"x": 5.0}));
        assert!(evaluate_bool("x == 5", &s).unwrap());
    }

    #[test]
    fn rejects_code_like_input() {
        let s = Context::new();
        assert!(Expr::parse("__import__('os').system('ls')").is_err());
        assert!(Expr::parse("a; b").is_err());
        assert!(Expr::parse("open('x')").is_err());
        assert!(Expr::parse("").is_err());
        assert!(evaluate("1 / 0", &s).is_err());
        assert!(evaluate("'a' < 1", &s).is_err());
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let src = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(Expr::parse(&src).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!({"a": 1})));
        assert!(is_truthy(&json!("no")));
    }
}
