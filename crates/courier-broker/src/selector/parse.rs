//! SQL-92-style selector parser.
//!
//! Grammar (case-insensitive keywords):
//!
//! ```text
//! or       := and (OR and)*
//! and      := not (AND not)*
//! not      := NOT not | predicate
//! predicate:= sum ( cmp-op sum
//!                 | IS [NOT] NULL
//!                 | [NOT] BETWEEN sum AND sum
//!                 | [NOT] IN '(' string (',' string)* ')'
//!                 | [NOT] LIKE string [ESCAPE string] )?
//! sum      := product (('+'|'-') product)*
//! product  := unary (('*'|'/') unary)*
//! unary    := '-' unary | primary
//! primary  := '(' or ')' | literal | identifier
//! ```

use thiserror::Error;

use super::expr::{ArithOp, CmpOp, Expr, Literal};

/// Selector compilation failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("unexpected character '{0}' in selector")]
    UnexpectedChar(char),

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("malformed number '{0}'")]
    BadNumber(String),

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("unexpected end of selector")]
    UnexpectedEnd,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    // punctuation and operators
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(input: &str) -> Result<Vec<Token>, SelectorError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('>') => {
                        chars.next();
                        tokens.push(Token::Ne);
                    }
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Le);
                    }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            // doubled quote is an escaped quote
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                s.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => s.push(ch),
                        None => return Err(SelectorError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        text.push(d);
                        chars.next();
                    } else if d == '.' && !is_float {
                        is_float = true;
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let f: f64 = text
                        .parse()
                        .map_err(|_| SelectorError::BadNumber(text.clone()))?;
                    tokens.push(Token::Float(f));
                } else {
                    let i: i64 = text
                        .parse()
                        .map_err(|_| SelectorError::BadNumber(text.clone()))?;
                    tokens.push(Token::Int(i));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '$' || d == '.' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(SelectorError::UnexpectedChar(other)),
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

    fn next(&mut self) -> Result<Token, SelectorError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(SelectorError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    /// Consume the next token if it is the given keyword.
    fn eat_keyword(&mut self, kw: &str) -> bool {
        if let Some(Token::Ident(word)) = self.peek() {
            if word.eq_ignore_ascii_case(kw) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), SelectorError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            match self.peek() {
                Some(tok) => Err(SelectorError::UnexpectedToken(format!("{tok:?}"))),
                None => Err(SelectorError::UnexpectedEnd),
            }
        }
    }

    fn expect(&mut self, tok: Token) -> Result<(), SelectorError> {
        let found = self.next()?;
        if found == tok {
            Ok(())
        } else {
            Err(SelectorError::UnexpectedToken(format!("{found:?}")))
        }
    }

    fn expect_string(&mut self) -> Result<String, SelectorError> {
        match self.next()? {
            Token::Str(s) => Ok(s),
            other => Err(SelectorError::UnexpectedToken(format!("{other:?}"))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("OR") {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_not()?;
        while self.eat_keyword("AND") {
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, SelectorError> {
        if self.eat_keyword("NOT") {
            let inner = self.parse_not()?;
            Ok(Expr::Not(Box::new(inner)))
        } else {
            self.parse_predicate()
        }
    }

    fn parse_predicate(&mut self) -> Result<Expr, SelectorError> {
        let lhs = self.parse_sum()?;

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull {
                expr: Box::new(lhs),
                negated,
            });
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("BETWEEN") {
            let low = self.parse_sum()?;
            self.expect_keyword("AND")?;
            let high = self.parse_sum()?;
            return Ok(Expr::Between {
                expr: Box::new(lhs),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            });
        }
        if self.eat_keyword("IN") {
            self.expect(Token::LParen)?;
            let mut list = vec![self.expect_string()?];
            while self.peek() == Some(&Token::Comma) {
                self.pos += 1;
                list.push(self.expect_string()?);
            }
            self.expect(Token::RParen)?;
            return Ok(Expr::In {
                expr: Box::new(lhs),
                list,
                negated,
            });
        }
        if self.eat_keyword("LIKE") {
            let pattern = self.expect_string()?;
            let escape = if self.eat_keyword("ESCAPE") {
                let esc = self.expect_string()?;
                esc.chars().next()
            } else {
                None
            };
            return Ok(Expr::Like {
                expr: Box::new(lhs),
                pattern,
                escape,
                negated,
            });
        }
        if negated {
            // NOT not followed by BETWEEN / IN / LIKE
            return match self.peek() {
                Some(tok) => Err(SelectorError::UnexpectedToken(format!("{tok:?}"))),
                None => Err(SelectorError::UnexpectedEnd),
            };
        }

        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.parse_sum()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }

        Ok(lhs)
    }

    fn parse_sum(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_product()?;
            lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_product(&mut self) -> Result<Expr, SelectorError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, SelectorError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, SelectorError> {
        match self.next()? {
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Int(i) => Ok(Expr::Lit(Literal::Exact(i))),
            Token::Float(f) => Ok(Expr::Lit(Literal::Inexact(f))),
            Token::Str(s) => Ok(Expr::Lit(Literal::Str(s))),
            Token::Ident(word) if word.eq_ignore_ascii_case("TRUE") => {
                Ok(Expr::Lit(Literal::Bool(true)))
            }
            Token::Ident(word) if word.eq_ignore_ascii_case("FALSE") => {
                Ok(Expr::Lit(Literal::Bool(false)))
            }
            Token::Ident(name) => Ok(Expr::Prop(name)),
            other => Err(SelectorError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

/// Compile a selector string into an expression tree.
pub fn parse(input: &str) -> Result<Expr, SelectorError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(SelectorError::UnexpectedToken(format!(
            "{:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Properties, PropertyValue};

    fn props(entries: &[(&str, PropertyValue)]) -> Properties {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parse_comparison() {
        let expr = parse("price > 10").unwrap();
        assert!(expr.matches(&props(&[("price", PropertyValue::Int(11))])));
        assert!(!expr.matches(&props(&[("price", PropertyValue::Int(10))])));
        assert!(!expr.matches(&Properties::new()));
    }

    #[test]
    fn test_parse_logical_precedence() {
        // AND binds tighter than OR
        let expr = parse("a = 1 OR b = 2 AND c = 3").unwrap();
        assert!(expr.matches(&props(&[("a", PropertyValue::Int(1))])));
        assert!(!expr.matches(&props(&[("b", PropertyValue::Int(2))])));
        assert!(expr.matches(&props(&[
            ("b", PropertyValue::Int(2)),
            ("c", PropertyValue::Int(3)),
        ])));
    }

    #[test]
    fn test_parse_arithmetic_precedence() {
        let expr = parse("total = 2 + 3 * 4").unwrap();
        assert!(expr.matches(&props(&[("total", PropertyValue::Int(14))])));
    }

    #[test]
    fn test_parse_between_not_between() {
        let expr = parse("size BETWEEN 1 AND 5").unwrap();
        assert!(expr.matches(&props(&[("size", PropertyValue::Int(3))])));
        let expr = parse("size NOT BETWEEN 1 AND 5").unwrap();
        assert!(expr.matches(&props(&[("size", PropertyValue::Int(9))])));
        assert!(!expr.matches(&Properties::new()));
    }

    #[test]
    fn test_parse_in_and_like() {
        let expr = parse("region IN ('eu', 'us')").unwrap();
        assert!(expr.matches(&props(&[("region", PropertyValue::Text("us".into()))])));

        let expr = parse("name LIKE 'ord_r%'").unwrap();
        assert!(expr.matches(&props(&[("name", PropertyValue::Text("order-17".into()))])));
        assert!(!expr.matches(&props(&[("name", PropertyValue::Text("invoice".into()))])));

        let expr = parse("pct LIKE '100!%' ESCAPE '!'").unwrap();
        assert!(expr.matches(&props(&[("pct", PropertyValue::Text("100%".into()))])));
    }

    #[test]
    fn test_parse_is_null_and_strings() {
        let expr = parse("color IS NULL").unwrap();
        assert!(expr.matches(&Properties::new()));
        let expr = parse("color IS NOT NULL AND color = 'it''s'").unwrap();
        assert!(expr.matches(&props(&[("color", PropertyValue::Text("it's".into()))])));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("price >").is_err());
        assert!(parse("price > 10 extra junk").is_err());
        assert!(parse("name = 'unterminated").is_err());
        assert!(parse("a ~ b").is_err());
    }
}
