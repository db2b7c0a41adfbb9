//!
//! This module defines the SQL-like filter expressions that routing operators
//! evaluate against message properties, e.g.
//! `TAGS is not null and TAGS in ('TagA', 'TagB')`.
//!
//! Expressions are compiled once, when an operator is registered, so malformed
//! input is rejected before any message is routed.
//!
use crate::error::{BrokerError, Result};
use crate::message::Message;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Literal {
    fn matches(&self, value: &str) -> bool {
        match self {
            Literal::Str(s) => s == value,
            Literal::Num(n) => value.parse::<f64>().map(|v| v == *n).unwrap_or(false),
            Literal::Bool(b) => value.eq_ignore_ascii_case(if *b { "true" } else { "false" }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Const(bool),
    IsNull { property: String, negated: bool },
    Compare { property: String, op: CompareOp, literal: Literal },
    In { property: String, values: Vec<Literal>, negated: bool },
    Between { property: String, low: f64, high: f64, negated: bool },
    Not(Box<Expr>),
    /// Operands of a chain of `AND`s, kept flat so long chains do not nest.
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn evaluate(&self, message: &Message) -> bool {
        match self {
            Expr::Const(b) => *b,
            Expr::IsNull { property, negated } => message.property(property).is_none() != *negated,
            Expr::Compare {
                property,
                op,
                literal,
            } => match message.property(property) {
                Some(value) => compare(value, *op, literal),
                None => false,
            },
            Expr::In {
                property,
                values,
                negated,
            } => match message.property(property) {
                Some(value) => values.iter().any(|v| v.matches(value)) != *negated,
                None => false,
            },
            Expr::Between {
                property,
                low,
                high,
                negated,
            } => match message.property(property).map(str::parse::<f64>) {
                Some(Ok(v)) => (*low <= v && v <= *high) != *negated,
                _ => false,
            },
            Expr::Not(inner) => !inner.evaluate(message),
            Expr::And(operands) => operands.iter().all(|e| e.evaluate(message)),
            Expr::Or(operands) => operands.iter().any(|e| e.evaluate(message)),
        }
    }
}

fn compare(value: &str, op: CompareOp, literal: &Literal) -> bool {
    match (op, literal) {
        (CompareOp::Eq, literal) => literal.matches(value),
        (CompareOp::Ne, literal) => !literal.matches(value),
        (op, Literal::Num(n)) => match value.parse::<f64>() {
            Ok(v) => match op {
                CompareOp::Lt => v < *n,
                CompareOp::Le => v <= *n,
                CompareOp::Gt => v > *n,
                CompareOp::Ge => v >= *n,
                CompareOp::Eq | CompareOp::Ne => false,
            },
            Err(_) => false,
        },
        (op, Literal::Str(s)) => {
            let ordering = value.cmp(s.as_str());
            match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Ge => ordering.is_ge(),
                CompareOp::Eq | CompareOp::Ne => false,
            }
        }
        (_, Literal::Bool(_)) => false,
    }
}

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    source: String,
    expr: Expr,
}

impl Filter {
    /// Compile `source` into a filter.
    ///
    /// # Examples
    ///
    /// ```
    /// use rocketmq_broker_core::filter::Filter;
    /// use rocketmq_broker_core::message::Message;
    ///
    /// let filter = Filter::compile("TAGS is not null and TAGS in ('TagA', 'TagB')").unwrap();
    /// assert!(filter.evaluate(&Message::new("body").with_tag("TagA")));
    /// assert!(!filter.evaluate(&Message::new("body").with_tag("TagC")));
    /// ```
    ///
    /// # Errors
    /// Raise BrokerError::FilterSyntax carrying the byte offset of the offending token.
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser {
            tokens,
            position: 0,
            end: source.len(),
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(syntax_error(token.offset, "unexpected trailing input"));
        }
        Ok(Filter {
            source: source.to_owned(),
            expr,
        })
    }

    pub fn evaluate(&self, message: &Message) -> bool {
        self.expr.evaluate(message)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn syntax_error(position: usize, reason: &str) -> BrokerError {
    BrokerError::FilterSyntax {
        position,
        reason: reason.to_owned(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Comma,
    Cmp(CompareOp),
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src,
            bytes: src.as_bytes(),
            position: 0,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        while self.position < self.bytes.len() && self.bytes[self.position].is_ascii_whitespace() {
            self.position += 1;
        }
        let offset = self.position;
        let c = match self.bytes.get(offset) {
            Some(c) => *c,
            None => return Ok(None),
        };

        let kind = match c {
            b'(' => {
                self.position += 1;
                TokenKind::LParen
            }
            b')' => {
                self.position += 1;
                TokenKind::RParen
            }
            b',' => {
                self.position += 1;
                TokenKind::Comma
            }
            b'=' => {
                self.position += 1;
                TokenKind::Cmp(CompareOp::Eq)
            }
            b'!' => {
                if self.bytes.get(offset + 1) != Some(&b'=') {
                    return Err(syntax_error(offset, "expected `=` after `!`"));
                }
                self.position += 2;
                TokenKind::Cmp(CompareOp::Ne)
            }
            b'<' => match self.bytes.get(offset + 1) {
                Some(b'=') => {
                    self.position += 2;
                    TokenKind::Cmp(CompareOp::Le)
                }
                Some(b'>') => {
                    self.position += 2;
                    TokenKind::Cmp(CompareOp::Ne)
                }
                _ => {
                    self.position += 1;
                    TokenKind::Cmp(CompareOp::Lt)
                }
            },
            b'>' => {
                if self.bytes.get(offset + 1) == Some(&b'=') {
                    self.position += 2;
                    TokenKind::Cmp(CompareOp::Ge)
                } else {
                    self.position += 1;
                    TokenKind::Cmp(CompareOp::Gt)
                }
            }
            b'\'' => TokenKind::Str(self.string_literal()?),
            b'-' | b'0'..=b'9' => TokenKind::Num(self.number_literal()?),
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while self.position < self.bytes.len()
                    && (self.bytes[self.position].is_ascii_alphanumeric()
                        || matches!(self.bytes[self.position], b'_' | b'.'))
                {
                    self.position += 1;
                }
                TokenKind::Ident(self.src[offset..self.position].to_owned())
            }
            _ => return Err(syntax_error(offset, "unexpected character")),
        };
        Ok(Some(Token { kind, offset }))
    }

    fn string_literal(&mut self) -> Result<String> {
        let start = self.position;
        self.position += 1;
        let mut value = String::new();
        loop {
            let rest = &self.src[self.position..];
            match rest.find('\'') {
                None => return Err(syntax_error(start, "unterminated string literal")),
                Some(i) => {
                    value.push_str(&rest[..i]);
                    self.position += i + 1;
                    // '' is an escaped quote
                    if self.bytes.get(self.position) == Some(&b'\'') {
                        value.push('\'');
                        self.position += 1;
                    } else {
                        return Ok(value);
                    }
                }
            }
        }
    }

    fn number_literal(&mut self) -> Result<f64> {
        let start = self.position;
        if self.bytes[self.position] == b'-' {
            self.position += 1;
        }
        while self.position < self.bytes.len()
            && (self.bytes[self.position].is_ascii_digit() || self.bytes[self.position] == b'.')
        {
            self.position += 1;
        }
        self.src[start..self.position]
            .parse::<f64>()
            .map_err(|_e| syntax_error(start, "invalid number literal"))
    }
}

/// Deepest allowed nesting of parentheses and `NOT`s.
const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn offset(&self) -> usize {
        self.peek().map(|t| t.offset).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Ident(s), .. }) if s.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(syntax_error(self.offset(), &format!("expected {}", keyword)))
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        match self.peek() {
            Some(token) if token.kind == kind => {
                self.position += 1;
                Ok(())
            }
            _ => Err(syntax_error(self.offset(), &format!("expected {}", what))),
        }
    }

    /// Enter one level of `(` or `NOT` nesting.
    fn descend(&mut self, offset: usize) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(syntax_error(offset, "expression nested too deeply"));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_and()?];
        while self.eat_keyword("OR") {
            operands.push(self.parse_and()?);
        }
        Ok(match operands.len() {
            1 => operands.remove(0),
            _ => Expr::Or(operands),
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_not()?];
        while self.eat_keyword("AND") {
            operands.push(self.parse_not()?);
        }
        Ok(match operands.len() {
            1 => operands.remove(0),
            _ => Expr::And(operands),
        })
    }

    fn parse_not(&mut self) -> Result<Expr> {
        let offset = self.offset();
        if self.eat_keyword("NOT") {
            self.descend(offset)?;
            let inner = self.parse_not()?;
            self.ascend();
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let offset = self.offset();
        match self.advance() {
            Some(Token {
                kind: TokenKind::LParen,
                ..
            }) => {
                self.descend(offset)?;
                let expr = self.parse_or()?;
                self.expect(TokenKind::RParen, "`)`")?;
                self.ascend();
                Ok(expr)
            }
            Some(Token {
                kind: TokenKind::Ident(ident),
                ..
            }) => {
                if ident.eq_ignore_ascii_case("TRUE") {
                    return Ok(Expr::Const(true));
                }
                if ident.eq_ignore_ascii_case("FALSE") {
                    return Ok(Expr::Const(false));
                }
                if is_reserved(&ident) {
                    return Err(syntax_error(offset, "expected property name"));
                }
                self.parse_predicate(ident)
            }
            Some(_) => Err(syntax_error(offset, "expected property name or `(`")),
            None => Err(syntax_error(offset, "unexpected end of expression")),
        }
    }

    fn parse_predicate(&mut self, property: String) -> Result<Expr> {
        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull { property, negated });
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("IN") {
            self.expect(TokenKind::LParen, "`(`")?;
            let mut values = vec![self.parse_literal()?];
            while self.peek().map(|t| &t.kind) == Some(&TokenKind::Comma) {
                self.position += 1;
                values.push(self.parse_literal()?);
            }
            self.expect(TokenKind::RParen, "`)`")?;
            return Ok(Expr::In {
                property,
                values,
                negated,
            });
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.parse_number()?;
            self.expect_keyword("AND")?;
            let high = self.parse_number()?;
            return Ok(Expr::Between {
                property,
                low,
                high,
                negated,
            });
        }
        if negated {
            return Err(syntax_error(self.offset(), "expected IN or BETWEEN after NOT"));
        }

        let offset = self.offset();
        match self.advance() {
            Some(Token {
                kind: TokenKind::Cmp(op),
                ..
            }) => {
                let literal = self.parse_literal()?;
                Ok(Expr::Compare {
                    property,
                    op,
                    literal,
                })
            }
            _ => Err(syntax_error(offset, "expected IS, IN, BETWEEN or a comparison")),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        let offset = self.offset();
        match self.advance().map(|t| t.kind) {
            Some(TokenKind::Str(s)) => Ok(Literal::Str(s)),
            Some(TokenKind::Num(n)) => Ok(Literal::Num(n)),
            Some(TokenKind::Ident(s)) if s.eq_ignore_ascii_case("TRUE") => Ok(Literal::Bool(true)),
            Some(TokenKind::Ident(s)) if s.eq_ignore_ascii_case("FALSE") => Ok(Literal::Bool(false)),
            _ => Err(syntax_error(offset, "expected literal")),
        }
    }

    fn parse_number(&mut self) -> Result<f64> {
        let offset = self.offset();
        match self.advance().map(|t| t.kind) {
            Some(TokenKind::Num(n)) => Ok(n),
            _ => Err(syntax_error(offset, "expected number")),
        }
    }
}

fn is_reserved(ident: &str) -> bool {
    ["AND", "OR", "NOT", "IS", "NULL", "IN", "BETWEEN"]
        .iter()
        .any(|k| ident.eq_ignore_ascii_case(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tag: &str) -> Message {
        Message::new("Test Body").with_tag(tag)
    }

    #[test]
    fn test_tags_in_set() -> Result<()> {
        let filter = Filter::compile("TAGS is not null and TAGS in ('TagA', 'TagB')")?;
        assert!(filter.evaluate(&tagged("TagA")));
        assert!(filter.evaluate(&tagged("TagB")));
        assert!(!filter.evaluate(&tagged("TagC")));
        assert!(!filter.evaluate(&Message::new("untagged")));
        Ok(())
    }

    #[test]
    fn test_keywords_are_case_insensitive() -> Result<()> {
        let filter = Filter::compile("TAGS IS NOT NULL AND NOT TAGS = 'TagC'")?;
        assert!(filter.evaluate(&tagged("TagA")));
        assert!(!filter.evaluate(&tagged("TagC")));
        Ok(())
    }

    #[test]
    fn test_is_null() -> Result<()> {
        let filter = Filter::compile("region is null")?;
        assert!(filter.evaluate(&Message::new("a")));
        assert!(!filter.evaluate(&Message::new("a").with_property("region", "EU")));
        Ok(())
    }

    #[test]
    fn test_or_and_precedence() -> Result<()> {
        // AND binds tighter than OR
        let filter = Filter::compile("a = '1' or b = '2' and c = '3'")?;
        assert!(filter.evaluate(&Message::new("x").with_property("a", "1")));
        assert!(!filter.evaluate(&Message::new("x").with_property("b", "2")));

        let filter = Filter::compile("(a = '1' or b = '2') and c = '3'")?;
        assert!(!filter.evaluate(&Message::new("x").with_property("a", "1")));
        assert!(filter.evaluate(
            &Message::new("x")
                .with_property("b", "2")
                .with_property("c", "3")
        ));
        Ok(())
    }

    #[test]
    fn test_numeric_comparisons() -> Result<()> {
        let filter = Filter::compile("age >= 18 and age < 65.5 and age <> 30")?;
        assert!(filter.evaluate(&Message::new("x").with_property("age", "18")));
        assert!(!filter.evaluate(&Message::new("x").with_property("age", "30")));
        assert!(!filter.evaluate(&Message::new("x").with_property("age", "70")));
        assert!(!filter.evaluate(&Message::new("x").with_property("age", "unknown")));

        let filter = Filter::compile("age between 1 and 3")?;
        assert!(filter.evaluate(&Message::new("x").with_property("age", "2")));
        assert!(!filter.evaluate(&Message::new("x").with_property("age", "4")));

        let filter = Filter::compile("age not between 1 and 3")?;
        assert!(filter.evaluate(&Message::new("x").with_property("age", "4")));
        Ok(())
    }

    #[test]
    fn test_not_in() -> Result<()> {
        let filter = Filter::compile("TAGS not in ('TagA')")?;
        assert!(filter.evaluate(&tagged("TagB")));
        assert!(!filter.evaluate(&tagged("TagA")));
        // Absent property is unknown, never a match
        assert!(!filter.evaluate(&Message::new("untagged")));
        Ok(())
    }

    #[test]
    fn test_escaped_quote() -> Result<()> {
        let filter = Filter::compile("name = 'O''Brien'")?;
        assert!(filter.evaluate(&Message::new("x").with_property("name", "O'Brien")));
        Ok(())
    }

    #[test]
    fn test_syntax_errors() {
        let cases = [
            ("", 0),
            ("TAGS is not", 11),
            ("TAGS in ('TagA'", 15),
            ("TAGS = 'TagA", 7),
            ("TAGS == 'TagA'", 6),
            ("TAGS in ('TagA') TAGS", 17),
            ("and TAGS is null", 0),
            ("TAGS # 1", 5),
            ("TAGS not = 'x'", 9),
        ];
        for (source, expected) in cases {
            match Filter::compile(source) {
                Err(BrokerError::FilterSyntax { position, .. }) => {
                    assert_eq!(position, expected, "offset for `{}`", source)
                }
                other => panic!("`{}` should not compile: {:?}", source, other),
            }
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected() -> Result<()> {
        let nested = |depth: usize| {
            format!("{}TAGS = 'TagA'{}", "(".repeat(depth), ")".repeat(depth))
        };
        assert!(Filter::compile(&nested(MAX_NESTING))?.evaluate(&tagged("TagA")));

        let source = nested(100_000);
        match Filter::compile(&source) {
            Err(BrokerError::FilterSyntax { position, reason }) => {
                assert_eq!(position, MAX_NESTING);
                assert_eq!(reason, "expression nested too deeply");
            }
            other => panic!("deep nesting should not compile: {:?}", other.map(|f| f.to_string())),
        }

        let negations = format!("{}TAGS is null", "not ".repeat(10_000));
        assert!(matches!(
            Filter::compile(&negations),
            Err(BrokerError::FilterSyntax { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_long_chains_stay_flat() -> Result<()> {
        let source = vec!["TAGS = 'TagA'"; 100_000].join(" and ");
        let filter = Filter::compile(&source)?;
        assert!(filter.evaluate(&tagged("TagA")));
        assert!(!filter.evaluate(&tagged("TagB")));

        let source = vec!["TAGS = 'TagB'"; 100_000].join(" or ");
        assert!(Filter::compile(&source)?.evaluate(&tagged("TagB")));
        Ok(())
    }

    #[test]
    fn test_display_keeps_source() -> Result<()> {
        let source = "TAGS is not null";
        assert_eq!(Filter::compile(source)?.to_string(), source);
        Ok(())
    }
}
