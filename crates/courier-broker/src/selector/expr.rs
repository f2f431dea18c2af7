//! Selector expression tree and evaluator.

use crate::message::Properties;

use super::value::{BoolOrNone, Value};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A literal operand, owned by the compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Exact(i64),
    Inexact(f64),
    Str(String),
}

impl Literal {
    fn as_value(&self) -> Value<'_> {
        match self {
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Exact(i) => Value::Exact(*i),
            Literal::Inexact(f) => Value::Inexact(*f),
            Literal::Str(s) => Value::Str(s),
        }
    }
}

/// Compiled selector expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Lit(Literal),
    Prop(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<String>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: String,
        escape: Option<char>,
        negated: bool,
    },
}

impl Expr {
    /// Evaluate against a property map. The returned value borrows from
    /// both the expression's literals and the property map.
    pub fn eval<'a>(&'a self, props: &'a Properties) -> Value<'a> {
        match self {
            Expr::Lit(lit) => lit.as_value(),
            Expr::Prop(name) => props.get(name).map(|p| p.as_value()).unwrap_or(Value::Unknown),
            Expr::Not(inner) => bool_value(inner.eval(props).as_bool().not()),
            Expr::And(lhs, rhs) => {
                bool_value(lhs.eval(props).as_bool().and(rhs.eval(props).as_bool()))
            }
            Expr::Or(lhs, rhs) => {
                bool_value(lhs.eval(props).as_bool().or(rhs.eval(props).as_bool()))
            }
            Expr::Cmp(op, lhs, rhs) => {
                let l = lhs.eval(props);
                let r = rhs.eval(props);
                let result = match op {
                    CmpOp::Eq => l.compare_eq(&r),
                    CmpOp::Ne => l.compare_ne(&r),
                    CmpOp::Lt => l.compare_lt(&r),
                    CmpOp::Le => l.compare_le(&r),
                    CmpOp::Gt => l.compare_gt(&r),
                    CmpOp::Ge => l.compare_ge(&r),
                };
                bool_value(result)
            }
            Expr::Arith(op, lhs, rhs) => {
                let l = lhs.eval(props);
                let r = rhs.eval(props);
                match op {
                    ArithOp::Add => l.add(&r),
                    ArithOp::Sub => l.sub(&r),
                    ArithOp::Mul => l.mul(&r),
                    ArithOp::Div => l.div(&r),
                }
            }
            Expr::Neg(inner) => inner.eval(props).neg(),
            Expr::IsNull { expr, negated } => {
                let is_null = expr.eval(props).is_unknown();
                Value::Bool(is_null != *negated)
            }
            Expr::In {
                expr,
                list,
                negated,
            } => match expr.eval(props) {
                Value::Unknown => Value::Unknown,
                Value::Str(s) => {
                    let found = list.iter().any(|item| item == s);
                    Value::Bool(found != *negated)
                }
                _ => Value::Unknown,
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let v = expr.eval(props);
                let inside = v
                    .compare_ge(&low.eval(props))
                    .and(v.compare_le(&high.eval(props)));
                bool_value(if *negated { inside.not() } else { inside })
            }
            Expr::Like {
                expr,
                pattern,
                escape,
                negated,
            } => match expr.eval(props) {
                Value::Unknown => Value::Unknown,
                Value::Str(s) => {
                    let matched = like_match(s, pattern, *escape);
                    Value::Bool(matched != *negated)
                }
                _ => Value::Unknown,
            },
        }
    }

    /// True only when the expression definitely matches; UNKNOWN and
    /// non-boolean results are non-matches.
    pub fn matches(&self, props: &Properties) -> bool {
        self.eval(props).as_bool().is_true()
    }
}

fn bool_value(b: BoolOrNone) -> Value<'static> {
    match b {
        BoolOrNone::True => Value::Bool(true),
        BoolOrNone::False => Value::Bool(false),
        BoolOrNone::Unknown => Value::Unknown,
    }
}

/// SQL LIKE matcher with `_` / `%` wildcards and an optional escape
/// character.
pub fn like_match(text: &str, pattern: &str, escape: Option<char>) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_match_at(&text, 0, &pattern, 0, escape)
}

fn like_match_at(
    text: &[char],
    ti: usize,
    pattern: &[char],
    pi: usize,
    escape: Option<char>,
) -> bool {
    if pi == pattern.len() {
        return ti == text.len();
    }
    let c = pattern[pi];
    if Some(c) == escape {
        // escaped wildcard matches itself literally
        match pattern.get(pi + 1) {
            Some(&lit) => {
                ti < text.len() && text[ti] == lit && like_match_at(text, ti + 1, pattern, pi + 2, escape)
            }
            None => false,
        }
    } else if c == '%' {
        (ti..=text.len()).any(|next| like_match_at(text, next, pattern, pi + 1, escape))
    } else if c == '_' {
        ti < text.len() && like_match_at(text, ti + 1, pattern, pi + 1, escape)
    } else {
        ti < text.len() && text[ti] == c && like_match_at(text, ti + 1, pattern, pi + 1, escape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PropertyValue;

    fn props(entries: &[(&str, PropertyValue)]) -> Properties {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_missing_property_is_unknown() {
        let expr = Expr::Cmp(
            CmpOp::Gt,
            Box::new(Expr::Prop("price".into())),
            Box::new(Expr::Lit(Literal::Exact(10))),
        );
        assert!(!expr.matches(&Properties::new()));
        assert!(expr.matches(&props(&[("price", PropertyValue::Int(11))])));
    }

    #[test]
    fn test_is_null() {
        let expr = Expr::IsNull {
            expr: Box::new(Expr::Prop("color".into())),
            negated: false,
        };
        assert!(expr.matches(&Properties::new()));
        assert!(!expr.matches(&props(&[("color", PropertyValue::Text("red".into()))])));
    }

    #[test]
    fn test_between_with_arithmetic() {
        // weight BETWEEN 2 * 2 AND 10
        let expr = Expr::Between {
            expr: Box::new(Expr::Prop("weight".into())),
            low: Box::new(Expr::Arith(
                ArithOp::Mul,
                Box::new(Expr::Lit(Literal::Exact(2))),
                Box::new(Expr::Lit(Literal::Exact(2))),
            )),
            high: Box::new(Expr::Lit(Literal::Exact(10))),
            negated: false,
        };
        assert!(expr.matches(&props(&[("weight", PropertyValue::Int(4))])));
        assert!(!expr.matches(&props(&[("weight", PropertyValue::Int(3))])));
        assert!(!expr.matches(&props(&[("weight", PropertyValue::Int(11))])));
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like_match("quick brown fox", "%brown%", None));
        assert!(like_match("ab", "a_", None));
        assert!(!like_match("abc", "a_", None));
        assert!(like_match("100%", "100\\%", Some('\\')));
        assert!(!like_match("100x", "100\\%", Some('\\')));
        assert!(like_match("", "%", None));
    }

    #[test]
    fn test_in_list() {
        let expr = Expr::In {
            expr: Box::new(Expr::Prop("region".into())),
            list: vec!["eu".into(), "us".into()],
            negated: false,
        };
        assert!(expr.matches(&props(&[("region", PropertyValue::Text("eu".into()))])));
        assert!(!expr.matches(&props(&[("region", PropertyValue::Text("apac".into()))])));
        // missing property: UNKNOWN, not a match even when negated
        let negated = Expr::In {
            expr: Box::new(Expr::Prop("region".into())),
            list: vec!["eu".into()],
            negated: true,
        };
        assert!(!negated.matches(&Properties::new()));
    }
}
