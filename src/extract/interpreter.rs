use scraper::ElementRef;
use serde_json::{Map, Value};
use tracing::trace;

use super::pattern::{PatternNode, SelectorNode, ValidationTarget, ValueSpec};

/// Structured output of one pattern evaluation
pub type Record = Map<String, Value>;

/// Outcome of evaluating a pattern node against a DOM scope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Extracted fields, empty when invalid
    pub record: Record,

    /// A required element was missing, the page is not what the rule expects
    pub wrong_page: bool,

    /// The page has the expected layout but the content is unusable
    pub invalid: bool,
}

impl Evaluation {
    fn wrong_page() -> Self {
        Self {
            wrong_page: true,
            ..Self::default()
        }
    }

    fn invalid() -> Self {
        Self {
            invalid: true,
            ..Self::default()
        }
    }

    /// Valid evaluations with at least one field
    pub fn is_valid(&self) -> bool {
        !self.wrong_page && !self.invalid
    }

    fn finish(record: Record) -> Self {
        let invalid = record.is_empty();
        Self {
            record,
            wrong_page: false,
            invalid,
        }
    }
}

/// Evaluate a pattern node against `scope`.
///
/// Selector nodes match descendants of `scope`. A wrong page anywhere in
/// the tree short-circuits evaluation and wins over invalid content.
pub fn evaluate(scope: ElementRef<'_>, node: &PatternNode, parent_value: &str) -> Evaluation {
    match node {
        PatternNode::Selector(selector) => evaluate_selector(scope, selector, parent_value),
        PatternNode::Group(members) => {
            let mut record = Record::new();
            for (key, child) in members {
                let outcome = evaluate(scope, child, parent_value);
                if outcome.wrong_page {
                    return Evaluation::wrong_page();
                }
                if outcome.invalid {
                    return Evaluation::invalid();
                }
                record.insert(key.clone(), Value::Object(outcome.record));
            }
            Evaluation::finish(record)
        }
    }
}

fn evaluate_selector(scope: ElementRef<'_>, node: &SelectorNode, parent_value: &str) -> Evaluation {
    let matches: Vec<ElementRef<'_>> = scope.select(&node.selector).collect();
    let Some(first) = matches.first() else {
        trace!("No element matches '{}'", node.source);
        return Evaluation::wrong_page();
    };

    let mut record = Record::new();

    if let Some(spec) = &node.value {
        match extract_value(*first, spec, node, parent_value) {
            Some(value) => {
                record.insert("value".to_string(), Value::String(value));
            }
            None => return Evaluation::invalid(),
        }
    }

    if let Some(children) = &node.children {
        for (index, element) in matches.iter().enumerate() {
            let outcome = evaluate(*element, children, parent_value);
            if outcome.wrong_page {
                return Evaluation::wrong_page();
            }
            if outcome.invalid {
                return Evaluation::invalid();
            }
            record.insert(index.to_string(), Value::Object(outcome.record));
        }
    }

    Evaluation::finish(record)
}

/// Read, post-process and validate the value; `None` means invalid
fn extract_value(element: ElementRef<'_>, spec: &ValueSpec, node: &SelectorNode, parent_value: &str) -> Option<String> {
    let raw = match spec {
        ValueSpec::Text => element.text().collect::<String>(),
        ValueSpec::Attr(name) => element.value().attr(name).unwrap_or_default().to_string(),
    };

    let value = node
        .postprocess
        .iter()
        .fold(raw.trim().to_string(), |value, step| step.apply(value));

    if value.is_empty() {
        return None;
    }

    match &node.validation {
        None => Some(value),
        Some(validation) if !validation.equation.evaluate(&value, parent_value) => None,
        Some(validation) => match validation.target {
            ValidationTarget::ParentValue => Some(parent_value.to_string()),
            ValidationTarget::Value => Some(value),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;
    use serde_json::json;

    fn run(html: &str, pattern: &str, parent_value: &str) -> Evaluation {
        let document = Html::parse_document(html);
        let node = PatternNode::parse(pattern).unwrap();
        evaluate(document.root_element(), &node, parent_value)
    }

    #[test]
    fn test_missing_element_is_wrong_page() {
        let outcome = run(
            "<html><body><p>blocked</p></body></html>",
            r#"{"pattern": "div.item", "value": "text"}"#,
            "",
        );

        assert!(outcome.wrong_page);
        assert!(outcome.record.is_empty());
    }

    #[test]
    fn test_empty_text_is_invalid() {
        let outcome = run(
            "<html><body><div class='item'>   </div></body></html>",
            r#"{"pattern": "div.item", "value": "text"}"#,
            "",
        );

        assert!(!outcome.wrong_page);
        assert!(outcome.invalid);
    }

    #[test]
    fn test_split_postprocess() {
        let outcome = run(
            "<html><body><span>42</span></body></html>",
            r#"{"price": {"pattern": "span", "value": "text", "postprocess": {"split": "4,1"}}}"#,
            "",
        );

        assert!(outcome.is_valid());
        assert_eq!(Value::Object(outcome.record), json!({"price": {"value": "2"}}));
    }

    #[test]
    fn test_children_keyed_by_index() {
        let outcome = run(
            r#"<html><body><ul>
                <li><b>one</b><a href=" /1 ">x</a></li>
                <li><b>two</b><a href="/2">y</a></li>
            </ul></body></html>"#,
            r#"{"items": {"pattern": "ul li", "children": {
                "name": {"pattern": "b", "value": "text"},
                "href": {"pattern": "a", "value": "attr:href"}
            }}}"#,
            "",
        );

        assert!(outcome.is_valid());
        assert_eq!(
            Value::Object(outcome.record),
            json!({"items": {
                "0": {"name": {"value": "one"}, "href": {"value": "/1"}},
                "1": {"name": {"value": "two"}, "href": {"value": "/2"}}
            }})
        );
    }

    #[test]
    fn test_wrong_page_child_propagates() {
        let outcome = run(
            "<html><body><ul><li><b>one</b></li><li>no bold</li></ul></body></html>",
            r#"{"items": {"pattern": "ul li", "children": {"name": {"pattern": "b", "value": "text"}}}}"#,
            "",
        );

        assert!(outcome.wrong_page);
    }

    #[test]
    fn test_invalid_child_discards_record() {
        let outcome = run(
            "<html><body><h1>Title</h1><ul><li><b> </b></li></ul></body></html>",
            r#"{
                "title": {"pattern": "h1", "value": "text"},
                "items": {"pattern": "ul li", "children": {"name": {"pattern": "b", "value": "text"}}}
            }"#,
            "",
        );

        assert!(!outcome.wrong_page);
        assert!(outcome.invalid);
        assert!(outcome.record.is_empty());
    }

    #[test]
    fn test_validation_replaces_with_parent_value() {
        let pattern = r#"{"colour": {"pattern": "span.colour", "value": "text",
            "validation": {"equation": "\"value\" == \"parentValue\"", "targetValue": "parentValue"}}}"#;

        let matching = run("<html><body><span class='colour'>Blue</span></body></html>", pattern, "Blue");
        assert_eq!(Value::Object(matching.record), json!({"colour": {"value": "Blue"}}));

        let mismatched = run("<html><body><span class='colour'>Red</span></body></html>", pattern, "Blue");
        assert!(mismatched.invalid);
    }

    #[test]
    fn test_selector_without_value_or_children_is_invalid() {
        let outcome = run("<html><body><div></div></body></html>", r#"{"pattern": "div"}"#, "");
        assert!(outcome.invalid);
    }
}
