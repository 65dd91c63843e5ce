use scraper::Selector;
use serde_json::{Map, Value};
use thiserror::Error;

use super::validation::Equation;

/// Errors raised while loading an extraction pattern
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("Invalid pattern JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    #[error("Invalid validation equation '{equation}': {message}")]
    Equation { equation: String, message: String },

    #[error("Invalid pattern node at '{path}': {message}")]
    Shape { path: String, message: String },
}

/// Where an extracted value is read from
#[derive(Debug, Clone, PartialEq)]
pub enum ValueSpec {
    /// Trimmed text content of the first matched element
    Text,
    /// Trimmed value of the named attribute of the first matched element
    Attr(String),
}

/// A post-processing step applied to an extracted value
#[derive(Debug, Clone, PartialEq)]
pub enum PostProcess {
    /// Split on `separator` and keep the token at `index`
    Split { separator: String, index: usize },
    /// Literal replace-all
    Replace { from: String, to: String },
}

impl PostProcess {
    pub fn apply(&self, value: String) -> String {
        match self {
            PostProcess::Split { separator, index } => value
                .split(separator.as_str())
                .nth(*index)
                .map(str::to_string)
                .unwrap_or(value),
            PostProcess::Replace { from, to } if !from.is_empty() => value.replace(from.as_str(), to),
            PostProcess::Replace { .. } => value,
        }
    }
}

/// What a passing validation does to the value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationTarget {
    /// Keep the extracted value
    Value,
    /// Replace the extracted value with the parent value
    ParentValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub equation: Equation,
    pub target: ValidationTarget,
}

/// A node that selects elements and optionally extracts from them
#[derive(Debug, Clone)]
pub struct SelectorNode {
    /// Compiled CSS selector
    pub selector: Selector,

    /// Selector source text, kept for logging
    pub source: String,

    pub value: Option<ValueSpec>,

    /// Ordered post-processing steps
    pub postprocess: Vec<PostProcess>,

    pub validation: Option<Validation>,

    /// Evaluated once per matched element
    pub children: Option<Box<PatternNode>>,
}

/// Typed extraction pattern tree
#[derive(Debug, Clone)]
pub enum PatternNode {
    Selector(SelectorNode),
    /// Named sub-nodes evaluated against the same scope, in document order
    Group(Vec<(String, PatternNode)>),
}

impl PatternNode {
    /// Parse a serialized pattern tree
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let value: Value = serde_json::from_str(source)?;
        Self::from_value(&value, "$")
    }

    fn from_value(value: &Value, path: &str) -> Result<Self, PatternError> {
        let object = value.as_object().ok_or_else(|| shape(path, "expected an object"))?;

        if object.contains_key("pattern") {
            return parse_selector_node(object, path).map(PatternNode::Selector);
        }

        let mut members = Vec::with_capacity(object.len());
        for (key, child) in object {
            let child_path = format!("{}.{}", path, key);
            members.push((key.clone(), Self::from_value(child, &child_path)?));
        }

        Ok(PatternNode::Group(members))
    }
}

fn shape(path: &str, message: &str) -> PatternError {
    PatternError::Shape {
        path: path.to_string(),
        message: message.to_string(),
    }
}

/// Compile a CSS selector, reporting the offending source on failure
pub fn compile_selector(source: &str) -> Result<Selector, PatternError> {
    Selector::parse(source).map_err(|e| PatternError::Selector {
        selector: source.to_string(),
        message: format!("{:?}", e),
    })
}

fn parse_selector_node(object: &Map<String, Value>, path: &str) -> Result<SelectorNode, PatternError> {
    let source = object
        .get("pattern")
        .and_then(Value::as_str)
        .ok_or_else(|| shape(path, "'pattern' must be a string"))?
        .to_string();
    let selector = compile_selector(&source)?;

    let value = match object.get("value").and_then(Value::as_str).map(str::trim) {
        None | Some("") => None,
        Some("text") => Some(ValueSpec::Text),
        Some(spec) => match spec.split_once(':') {
            Some(("attr", name)) if !name.is_empty() => Some(ValueSpec::Attr(name.to_string())),
            _ => return Err(shape(path, &format!("unsupported value spec '{}'", spec))),
        },
    };

    let postprocess = match object.get("postprocess") {
        Some(Value::Object(steps)) => parse_postprocess(steps),
        Some(_) => return Err(shape(path, "'postprocess' must be an object")),
        None => Vec::new(),
    };

    let validation = match object.get("validation") {
        Some(Value::Object(validation)) => parse_validation(validation, path)?,
        Some(_) => return Err(shape(path, "'validation' must be an object")),
        None => None,
    };

    let children = match object.get("children") {
        Some(children) => {
            let child_path = format!("{}.children", path);
            Some(Box::new(PatternNode::from_value(children, &child_path)?))
        }
        None => None,
    };

    Ok(SelectorNode {
        selector,
        source,
        value,
        postprocess,
        validation,
        children,
    })
}

/// Malformed or unknown steps are skipped, matching the permissive rule format
fn parse_postprocess(steps: &Map<String, Value>) -> Vec<PostProcess> {
    steps
        .iter()
        .filter_map(|(name, parameters)| {
            let parameters = parameters.as_str()?;
            match name.to_lowercase().as_str() {
                "split" => {
                    let (separator, index) = parameters.rsplit_once(',')?;
                    let index = index.trim().parse().ok()?;
                    Some(PostProcess::Split {
                        separator: separator.to_string(),
                        index,
                    })
                }
                "replace" => {
                    let mut parts = parameters.split(',');
                    let from = parts.next()?.to_string();
                    let to = parts.next()?.to_string();
                    Some(PostProcess::Replace { from, to })
                }
                _ => None,
            }
        })
        .collect()
}

fn parse_validation(object: &Map<String, Value>, path: &str) -> Result<Option<Validation>, PatternError> {
    let (Some(equation), Some(target)) = (
        object.get("equation").and_then(Value::as_str),
        object.get("targetValue").and_then(Value::as_str),
    ) else {
        return Err(shape(path, "validation needs 'equation' and 'targetValue' strings"));
    };

    let parsed = Equation::parse(equation).map_err(|message| PatternError::Equation {
        equation: equation.to_string(),
        message,
    })?;

    let target = if target == "parentValue" {
        ValidationTarget::ParentValue
    } else {
        ValidationTarget::Value
    };

    Ok(Some(Validation {
        equation: parsed,
        target,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_group_of_selector_nodes() {
        let node = PatternNode::parse(
            r#"{
                "title": {"pattern": "h1", "value": "text"},
                "image": {"pattern": "img.main", "value": "attr:src"}
            }"#,
        )
        .unwrap();

        let PatternNode::Group(members) = node else {
            panic!("expected a group node");
        };
        let keys: Vec<&str> = members.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["title", "image"]);

        let PatternNode::Selector(image) = &members[1].1 else {
            panic!("expected a selector node");
        };
        assert_eq!(image.value, Some(ValueSpec::Attr("src".into())));
    }

    #[test]
    fn test_postprocess_keeps_document_order() {
        let node = PatternNode::parse(
            r#"{"pattern": "span", "value": "text",
                "postprocess": {"replace": "£,", "split": ".,0", "unknown": "x"}}"#,
        )
        .unwrap();

        let PatternNode::Selector(selector) = node else {
            panic!("expected a selector node");
        };
        assert_eq!(
            selector.postprocess,
            vec![
                PostProcess::Replace { from: "£".into(), to: "".into() },
                PostProcess::Split { separator: ".".into(), index: 0 },
            ]
        );
    }

    #[test]
    fn test_split_out_of_range_is_noop() {
        let split = PostProcess::Split { separator: "-".into(), index: 5 };
        assert_eq!(split.apply("a-b".into()), "a-b");
    }

    #[test]
    fn test_rejects_bad_selector_and_equation() {
        assert!(matches!(
            PatternNode::parse(r#"{"pattern": "div[", "value": "text"}"#),
            Err(PatternError::Selector { .. })
        ));
        assert!(matches!(
            PatternNode::parse(
                r#"{"pattern": "div", "value": "text",
                    "validation": {"equation": "value ~ 3", "targetValue": "value"}}"#
            ),
            Err(PatternError::Equation { .. })
        ));
        assert!(matches!(
            PatternNode::parse(r#"{"pattern": "div", "value": "html"}"#),
            Err(PatternError::Shape { .. })
        ));
    }
}
