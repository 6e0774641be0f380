//! Tag expressions for selecting test cases.
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | primary
//! primary := "(" expr ")" | TAG
//! ```
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeSet;
//! use shardline::registry::TagExpr;
//!
//! let expr: TagExpr = "@smoke and not (@slow or @flaky)".parse().unwrap();
//! let tags: BTreeSet<String> = ["@smoke".to_string()].into_iter().collect();
//! assert!(expr.matches(&tags));
//! ```

use std::collections::BTreeSet;
use std::str::FromStr;

use super::DiscoveryError;

/// A parsed tag expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagExpr {
    Tag(String),
    Not(Box<TagExpr>),
    And(Box<TagExpr>, Box<TagExpr>),
    Or(Box<TagExpr>, Box<TagExpr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Not,
    Tag(String),
}

impl TagExpr {
    /// Parses a tag expression.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidTagExpression`] on empty input,
    /// unbalanced parentheses, or misplaced operators.
    pub fn parse(input: &str) -> Result<Self, DiscoveryError> {
        let tokens = tokenize(input);
        let mut parser = Parser {
            input,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(parser.error(format!("unexpected token {:?}", token)));
        }
        Ok(expr)
    }

    /// Evaluates the expression against a set of tags.
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            TagExpr::Tag(tag) => tags.contains(tag),
            TagExpr::Not(inner) => !inner.matches(tags),
            TagExpr::And(lhs, rhs) => lhs.matches(tags) && rhs.matches(tags),
            TagExpr::Or(lhs, rhs) => lhs.matches(tags) || rhs.matches(tags),
        }
    }
}

impl FromStr for TagExpr {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagExpr::parse(s)
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if word.is_empty() {
            return;
        }
        let token = match word.to_ascii_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            _ => Token::Tag(word.clone()),
        };
        tokens.push(token);
        word.clear();
    };

    for c in input.chars() {
        match c {
            '(' | ')' => {
                flush(&mut word, &mut tokens);
                tokens.push(if c == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut tokens);
    tokens
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> DiscoveryError {
        DiscoveryError::InvalidTagExpression {
            expression: self.input.to_string(),
            reason: reason.into(),
        }
    }

    fn parse_or(&mut self) -> Result<TagExpr, DiscoveryError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = TagExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<TagExpr, DiscoveryError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = TagExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<TagExpr, DiscoveryError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(TagExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<TagExpr, DiscoveryError> {
        match self.next() {
            Some(Token::Tag(tag)) => Ok(TagExpr::Tag(tag)),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(self.error("missing closing parenthesis")),
                }
            }
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}
