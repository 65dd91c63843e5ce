use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Comparison operator of a validation equation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "==" => Comparator::Eq,
            "!=" => Comparator::Ne,
            "<" => Comparator::Lt,
            "<=" => Comparator::Le,
            ">" => Comparator::Gt,
            ">=" => Comparator::Ge,
            _ => return None,
        })
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Comparator::Eq => ordering == Ordering::Equal,
            Comparator::Ne => ordering != Ordering::Equal,
            Comparator::Lt => ordering == Ordering::Less,
            Comparator::Le => ordering != Ordering::Greater,
            Comparator::Gt => ordering == Ordering::Greater,
            Comparator::Ge => ordering != Ordering::Less,
        }
    }
}

/// One side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// The extracted value
    Value,
    /// The value inherited from the listing page
    ParentValue,
    Literal(String),
}

impl Operand {
    fn resolve<'a>(&'a self, value: &'a str, parent_value: &'a str) -> &'a str {
        match self {
            Operand::Value => value,
            Operand::ParentValue => parent_value,
            Operand::Literal(text) => text,
        }
    }
}

/// A parsed `<operand> <op> <operand>` comparison
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    pub left: Operand,
    pub comparator: Comparator,
    pub right: Operand,
}

fn token_regex() -> &'static Regex {
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    TOKENS.get_or_init(|| {
        Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|==|!=|<=|>=|<|>|[^\s"'=!<>]+"#)
            .unwrap_or_else(|e| unreachable!("static token pattern: {}", e))
    })
}

impl Equation {
    /// Parse an equation, returning a human readable message on failure
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut tokens = Vec::new();
        let mut cursor = 0;

        for found in token_regex().find_iter(source) {
            if !source[cursor..found.start()].trim().is_empty() {
                return Err(format!("unexpected input at offset {}", cursor));
            }
            tokens.push(found.as_str());
            cursor = found.end();
        }
        if !source[cursor..].trim().is_empty() {
            return Err(format!("unexpected input at offset {}", cursor));
        }

        let [left, comparator, right] = tokens.as_slice() else {
            return Err(format!(
                "expected '<operand> <op> <operand>', found {} tokens",
                tokens.len()
            ));
        };

        let comparator = Comparator::from_token(comparator)
            .ok_or_else(|| format!("unknown comparison operator '{}'", comparator))?;

        Ok(Self {
            left: parse_operand(left)?,
            comparator,
            right: parse_operand(right)?,
        })
    }

    /// Evaluate against an extracted value and its parent value
    pub fn evaluate(&self, value: &str, parent_value: &str) -> bool {
        let left = self.left.resolve(value, parent_value);
        let right = self.right.resolve(value, parent_value);

        let ordering = match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
            (Ok(l), Ok(r)) => match l.partial_cmp(&r) {
                Some(ordering) => ordering,
                None => return false,
            },
            _ => left.cmp(right),
        };

        self.comparator.holds(ordering)
    }
}

fn parse_operand(token: &str) -> Result<Operand, String> {
    if let Some(quote) = token.chars().next().filter(|c| *c == '"' || *c == '\'') {
        if token.len() < 2 || !token.ends_with(quote) {
            return Err(format!("unterminated string literal {}", token));
        }
        let content = unescape(&token[1..token.len() - 1]);
        return Ok(match content.as_str() {
            "value" => Operand::Value,
            "parentValue" => Operand::ParentValue,
            _ => Operand::Literal(content),
        });
    }

    match token {
        "value" => Ok(Operand::Value),
        "parentValue" => Ok(Operand::ParentValue),
        number if number.parse::<f64>().is_ok() => Ok(Operand::Literal(number.to_string())),
        other => Err(format!("unknown operand '{}'", other)),
    }
}

fn unescape(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    let mut chars = content.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                result.push(escaped);
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_references_and_literals() {
        let equation = Equation::parse(r#""value" == "parentValue""#).unwrap();
        assert_eq!(equation.left, Operand::Value);
        assert_eq!(equation.right, Operand::ParentValue);

        let equation = Equation::parse("value >= 10").unwrap();
        assert_eq!(equation.comparator, Comparator::Ge);
        assert_eq!(equation.right, Operand::Literal("10".into()));

        let equation = Equation::parse(r#"value!='out of stock'"#).unwrap();
        assert_eq!(equation.comparator, Comparator::Ne);
        assert_eq!(equation.right, Operand::Literal("out of stock".into()));
    }

    #[test]
    fn test_numeric_and_string_comparison() {
        let greater = Equation::parse("value > 9").unwrap();
        assert!(greater.evaluate("10", ""));
        assert!(!greater.evaluate("8.5", ""));

        // Non-numeric operands fall back to lexical order
        let lexical = Equation::parse(r#"value < "b""#).unwrap();
        assert!(lexical.evaluate("a", ""));
        assert!(!lexical.evaluate("c", ""));

        let same = Equation::parse("value == parentValue").unwrap();
        assert!(same.evaluate("Blue", "Blue"));
        assert!(!same.evaluate("Blue", "Red"));
    }

    #[test]
    fn test_rejects_malformed_equations() {
        assert!(Equation::parse("").is_err());
        assert!(Equation::parse("value ==").is_err());
        assert!(Equation::parse("value = 3").is_err());
        assert!(Equation::parse("price == 3").is_err());
        assert!(Equation::parse(r#"value == "open"#).is_err());
        assert!(Equation::parse("value == 3 == 4").is_err());
    }
}
