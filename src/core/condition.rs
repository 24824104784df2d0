//! Conditions over matrix bindings
//!
//! Supports exactly what pipeline documents use in `if:` fields:
//! `matrix.<axis> == 'literal'`, `!=`, `&&`, `||` and parentheses,
//! optionally wrapped in `${{ ... }}`. `&&` binds tighter than `||`.

use crate::core::context::Bindings;
use std::fmt;

/// Parsed condition expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Equals { variable: String, value: String },
    NotEquals { variable: String, value: String },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Parse a condition string
    pub fn parse(source: &str) -> Result<Self, String> {
        let trimmed = strip_expression_wrapper(source.trim());
        if trimmed.is_empty() {
            return Err("empty condition".to_string());
        }

        let tokens = tokenize(trimmed)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let condition = parser.parse_or()?;

        if let Some(token) = parser.peek() {
            return Err(format!("unexpected token '{}'", token));
        }
        Ok(condition)
    }

    /// Evaluate against an instance's bindings.
    ///
    /// Pure and total: an unbound variable compares unequal to every literal.
    pub fn evaluate(&self, bindings: &Bindings) -> bool {
        match self {
            Condition::Equals { variable, value } => {
                bindings.get(variable).is_some_and(|bound| bound == value)
            }
            Condition::NotEquals { variable, value } => {
                bindings.get(variable).map_or(true, |bound| bound != value)
            }
            Condition::And(left, right) => left.evaluate(bindings) && right.evaluate(bindings),
            Condition::Or(left, right) => left.evaluate(bindings) || right.evaluate(bindings),
        }
    }

    /// All matrix axes referenced by this condition, in source order
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Equals { variable, .. } | Condition::NotEquals { variable, .. } => {
                out.push(variable)
            }
            Condition::And(left, right) | Condition::Or(left, right) => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
        }
    }

    /// Returns the first referenced axis that is not in `axes`
    pub fn first_unbound<'a>(&'a self, axes: &[String]) -> Option<&'a str> {
        self.variables()
            .into_iter()
            .find(|var| !axes.iter().any(|axis| axis == var))
    }
}

/// Evaluate a condition against bindings
pub fn evaluate(condition: &Condition, bindings: &Bindings) -> bool {
    condition.evaluate(bindings)
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Equals { variable, value } => write!(f, "matrix.{} == '{}'", variable, value),
            Condition::NotEquals { variable, value } => {
                write!(f, "matrix.{} != '{}'", variable, value)
            }
            Condition::And(left, right) => write!(f, "({} && {})", left, right),
            Condition::Or(left, right) => write!(f, "({} || {})", left, right),
        }
    }
}

fn strip_expression_wrapper(source: &str) -> &str {
    source
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(source)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Eq,
    Ne,
    And,
    Or,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "{}", w),
            Token::Quoted(s) => write!(f, "'{}'", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let token = match (c, next) {
                    ('=', Some('=')) => Token::Eq,
                    ('!', Some('=')) => Token::Ne,
                    ('&', Some('&')) => Token::And,
                    ('|', Some('|')) => Token::Or,
                    _ => return Err(format!("unsupported operator at position {}", i)),
                };
                tokens.push(token);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == quote)
                    .map(|offset| start + offset)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Quoted(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

enum Operand {
    Variable(String),
    Literal(String),
}

/// Deepest parenthesis nesting accepted in a condition
const MAX_NESTING: usize = 32;

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
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Condition, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, String> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_primary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Condition, String> {
        if self.peek() == Some(&Token::LParen) {
            if self.depth == MAX_NESTING {
                return Err(format!(
                    "parentheses nested deeper than {} levels",
                    MAX_NESTING
                ));
            }
            self.pos += 1;
            self.depth += 1;
            let inner = self.parse_or()?;
            self.depth -= 1;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("missing closing parenthesis".to_string()),
            };
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Condition, String> {
        let left = self.parse_operand()?;
        let negated = match self.next() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            Some(other) => return Err(format!("expected '==' or '!=', found '{}'", other)),
            None => return Err("expected '==' or '!=' after operand".to_string()),
        };
        let right = self.parse_operand()?;

        let (variable, value) = match (left, right) {
            (Operand::Variable(var), Operand::Literal(lit))
            | (Operand::Literal(lit), Operand::Variable(var)) => (var, lit),
            (Operand::Variable(_), Operand::Variable(_)) => {
                return Err("comparisons between two matrix variables are not supported".to_string())
            }
            (Operand::Literal(_), Operand::Literal(_)) => {
                return Err("comparison must reference a matrix variable".to_string())
            }
        };

        Ok(if negated {
            Condition::NotEquals { variable, value }
        } else {
            Condition::Equals { variable, value }
        })
    }

    fn parse_operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Quoted(s)) => Ok(Operand::Literal(s)),
            Some(Token::Word(w)) => match w.strip_prefix("matrix.") {
                Some("") => Err("missing axis name after 'matrix.'".to_string()),
                Some(axis) => Ok(Operand::Variable(axis.to_string())),
                None => Ok(Operand::Literal(w)),
            },
            Some(other) => Err(format!("expected operand, found '{}'", other)),
            None => Err("unexpected end of condition".to_string()),
        }
    }
}
