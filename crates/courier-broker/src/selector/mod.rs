//! Message selectors: SQL-92-style predicates over message properties
//! with three-valued logic. UNKNOWN never matches.

pub mod expr;
pub mod parse;
pub mod value;

pub use expr::{ArithOp, CmpOp, Expr, Literal};
pub use parse::SelectorError;
pub use value::{BoolOrNone, Value};

use crate::message::Properties;

/// A compiled subscription selector.
#[derive(Debug, Clone)]
pub struct Selector {
    text: String,
    root: Expr,
}

impl Selector {
    /// Compile a selector string.
    pub fn parse(text: &str) -> Result<Self, SelectorError> {
        let root = parse::parse(text)?;
        Ok(Self {
            text: text.to_string(),
            root,
        })
    }

    /// The original selector text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Apply the predicate to a message's properties.
    pub fn matches(&self, props: &Properties) -> bool {
        self.root.matches(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PropertyValue;

    #[test]
    fn test_selector_round_trip_text() {
        let sel = Selector::parse("price > 10 AND region = 'eu'").unwrap();
        assert_eq!(sel.text(), "price > 10 AND region = 'eu'");

        let mut props = Properties::new();
        props.insert("price".to_string(), PropertyValue::Int(20));
        props.insert("region".to_string(), PropertyValue::Text("eu".into()));
        assert!(sel.matches(&props));

        props.remove("price");
        assert!(!sel.matches(&props));
    }
}
