//! Trigger filter expressions.
//!
//! Filters are stored as JSON and parsed into a tagged tree:
//!
//! ```json
//! {"all": [
//!   {"ticket.priority": ["high", "urgent"]},
//!   {"not": {"ticket.subject": "%test%"}}
//! ]}
//! ```
//!
//! A plain object is a leaf: every dotted path must match its expected value.
//! String values containing an unescaped `%` are LIKE patterns; lists match
//! when any alternative matches.

use serde::{Deserialize, Serialize};

use super::value::Value;

/// Parsed filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum FilterExpr {
    Leaf(Vec<Condition>),
    Any(Vec<FilterExpr>),
    All(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    /// Explicit `{"match": {...}}` leaf.
    Match(Vec<Condition>),
}

/// One `path → expected` entry of a leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub path: String,
    pub expected: Expected,
}

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    Equals(serde_json::Value),
    Like(LikePattern),
    OneOf(Vec<Expected>),
}

/// Case-sensitive SQL-style LIKE pattern supporting only `%`.
#[derive(Debug, Clone, PartialEq)]
pub struct LikePattern {
    source: String,
    parts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid filter: {0}")]
pub struct FilterError(pub String);

impl FilterExpr {
    /// A leaf with no conditions; matches everything.
    pub fn match_all() -> Self {
        FilterExpr::Leaf(Vec::new())
    }

    /// Parse a stored JSON filter. `null` parses as [`FilterExpr::match_all`].
    pub fn parse(value: &serde_json::Value) -> Result<Self, FilterError> {
        match value {
            serde_json::Value::Null => Ok(Self::match_all()),
            serde_json::Value::Array(items) => {
                Ok(FilterExpr::All(items.iter().map(Self::parse).collect::<Result<_, _>>()?))
            }
            serde_json::Value::Object(map) => {
                let mut operators = Vec::new();
                let mut conditions = Vec::new();

                for (key, entry) in map {
                    match key.as_str() {
                        "any" => operators.push(FilterExpr::Any(parse_list(key, entry)?)),
                        "all" => operators.push(FilterExpr::All(parse_list(key, entry)?)),
                        "not" => operators.push(FilterExpr::Not(Box::new(Self::parse(entry)?))),
                        "match" => match entry {
                            serde_json::Value::Object(inner) => operators.push(FilterExpr::Match(
                                inner
                                    .iter()
                                    .map(|(path, expected)| Condition::new(path, expected))
                                    .collect(),
                            )),
                            _ => return Err(FilterError("'match' expects an object".into())),
                        },
                        path => conditions.push(Condition::new(path, entry)),
                    }
                }

                Ok(match (operators.len(), conditions.is_empty()) {
                    (0, _) => FilterExpr::Leaf(conditions),
                    (1, true) => operators.remove(0),
                    _ => {
                        if !conditions.is_empty() {
                            operators.push(FilterExpr::Leaf(conditions));
                        }
                        FilterExpr::All(operators)
                    }
                })
            }
            other => Err(FilterError(format!(
                "expected an object or list, found {other}"
            ))),
        }
    }

    /// Evaluate against a context.
    pub fn matches(&self, context: &Value) -> bool {
        match self {
            FilterExpr::Leaf(conditions) | FilterExpr::Match(conditions) => {
                conditions.iter().all(|c| c.matches(context))
            }
            FilterExpr::Any(items) => items.iter().any(|f| f.matches(context)),
            FilterExpr::All(items) => items.iter().all(|f| f.matches(context)),
            FilterExpr::Not(inner) => !inner.matches(context),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        fn leaf(conditions: &[Condition]) -> serde_json::Value {
            serde_json::Value::Object(
                conditions
                    .iter()
                    .map(|c| (c.path.clone(), c.expected.to_json()))
                    .collect(),
            )
        }

        match self {
            FilterExpr::Leaf(conditions) => leaf(conditions),
            FilterExpr::Match(conditions) => serde_json::json!({ "match": leaf(conditions) }),
            FilterExpr::Any(items) => {
                serde_json::json!({ "any": items.iter().map(FilterExpr::to_json).collect::<Vec<_>>() })
            }
            FilterExpr::All(items) => {
                serde_json::json!({ "all": items.iter().map(FilterExpr::to_json).collect::<Vec<_>>() })
            }
            FilterExpr::Not(inner) => serde_json::json!({ "not": inner.to_json() }),
        }
    }
}

/// Evaluate an optional filter; absent filters match.
pub fn matches_filter(filter: Option<&FilterExpr>, context: &Value) -> bool {
    filter.is_none_or(|f| f.matches(context))
}

fn parse_list(key: &str, value: &serde_json::Value) -> Result<Vec<FilterExpr>, FilterError> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(FilterExpr::parse).collect(),
        _ => Err(FilterError(format!("'{key}' expects a list"))),
    }
}

impl TryFrom<serde_json::Value> for FilterExpr {
    type Error = FilterError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        FilterExpr::parse(&value)
    }
}

impl From<FilterExpr> for serde_json::Value {
    fn from(filter: FilterExpr) -> Self {
        filter.to_json()
    }
}

impl Condition {
    fn new(path: &str, expected: &serde_json::Value) -> Self {
        Self {
            path: path.to_string(),
            expected: Expected::parse(expected),
        }
    }

    fn matches(&self, context: &Value) -> bool {
        let actual = context.get_path(&self.path).unwrap_or(&Value::Null);
        self.expected.matches(actual)
    }
}

impl Expected {
    fn parse(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Array(items) => {
                Expected::OneOf(items.iter().map(Expected::parse).collect())
            }
            serde_json::Value::String(s) => match LikePattern::parse(s) {
                Some(pattern) => Expected::Like(pattern),
                None => Expected::Equals(value.clone()),
            },
            other => Expected::Equals(other.clone()),
        }
    }

    fn matches(&self, actual: &Value) -> bool {
        match self {
            Expected::Equals(expected) => actual.loosely_equals(&Value::from(expected)),
            Expected::Like(pattern) => actual.as_str().is_some_and(|s| pattern.matches(s)),
            Expected::OneOf(options) => options.iter().any(|o| o.matches(actual)),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Expected::Equals(v) => v.clone(),
            Expected::Like(p) => serde_json::Value::String(p.source.clone()),
            Expected::OneOf(options) => {
                serde_json::Value::Array(options.iter().map(Expected::to_json).collect())
            }
        }
    }
}

impl LikePattern {
    /// Returns `None` when the string has no unescaped `%`; such strings
    /// compare by plain equality.
    pub fn parse(source: &str) -> Option<Self> {
        let mut parts = vec![String::new()];
        let mut wildcard = false;
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'%') => {
                    chars.next();
                    parts.last_mut()?.push('%');
                }
                '%' => {
                    wildcard = true;
                    parts.push(String::new());
                }
                other => parts.last_mut()?.push(other),
            }
        }

        wildcard.then(|| Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        // parts = [prefix, middle..., suffix]; a wildcard sits between each.
        let Some((first, rest)) = self.parts.split_first() else {
            return true;
        };
        let Some((last, middle)) = rest.split_last() else {
            return text == first;
        };

        let Some(mut remaining) = text.strip_prefix(first.as_str()) else {
            return false;
        };
        for part in middle {
            match remaining.find(part.as_str()) {
                Some(idx) => remaining = &remaining[idx + part.len()..],
                None => return false,
            }
        }
        remaining.len() >= last.len() && remaining.ends_with(last.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        Value::from(json!({
            "ticket": {
                "id": 42,
                "priority": "high",
                "subject": "Printer offline at HQ",
                "labels": ["hardware", "onsite"],
                "company": {"id": 3}
            }
        }))
    }

    fn check(filter: serde_json::Value) -> bool {
        FilterExpr::parse(&filter).unwrap().matches(&ctx())
    }

    #[test]
    fn test_empty_and_absent_filters_match() {
        assert!(check(json!({})));
        assert!(check(json!(null)));
        assert!(matches_filter(None, &ctx()));
    }

    #[test]
    fn test_leaf_equality_and_alternatives() {
        assert!(check(json!({"ticket.priority": "high"})));
        assert!(check(json!({"ticket.priority": ["low", "high"]})));
        assert!(!check(json!({"ticket.priority": ["low", "normal"]})));
        assert!(check(json!({"ticket.company.id": 3.0})));
        assert!(!check(json!({"ticket.missing": "x"})));
        assert!(check(json!({"ticket.missing": null})));
    }

    #[test]
    fn test_sequence_index_paths() {
        assert!(check(json!({"ticket.labels.0": "hardware"})));
        assert!(!check(json!({"ticket.labels.1": "hardware"})));
    }

    #[test]
    fn test_like_patterns() {
        assert!(check(json!({"ticket.subject": "Printer%"})));
        assert!(check(json!({"ticket.subject": "%offline%"})));
        assert!(check(json!({"ticket.subject": "%HQ"})));
        assert!(!check(json!({"ticket.subject": "%hq"})));
        // Non-string actuals never match a pattern.
        assert!(!check(json!({"ticket.id": "4%"})));
    }

    #[test]
    fn test_subject_prefix_rejects_numeric_subject() {
        let filter = FilterExpr::parse(&json!({"match": {"ticket.subject": "My computer%"}})).unwrap();
        let boot = Value::from(json!({"ticket": {"subject": "My computer will not boot"}}));
        let numeric = Value::from(json!({"ticket": {"subject": 404}}));
        assert!(filter.matches(&boot));
        assert!(!filter.matches(&numeric));
    }

    #[test]
    fn test_escaped_percent_is_literal() {
        let pattern = LikePattern::parse(r"100\% done%").unwrap();
        assert!(pattern.matches("100% done today"));
        assert!(!pattern.matches("100 done"));
        assert!(LikePattern::parse(r"50\%").is_none());
    }

    #[test]
    fn test_like_overlapping_segments() {
        let pattern = LikePattern::parse("ab%ba").unwrap();
        assert!(pattern.matches("aba_ba"));
        assert!(pattern.matches("abba"));
        assert!(!pattern.matches("aba"));
    }

    #[test]
    fn test_composites() {
        assert!(check(json!({"any": [{"ticket.priority": "low"}, {"ticket.id": 42}]})));
        assert!(!check(json!({"all": [{"ticket.priority": "low"}, {"ticket.id": 42}]})));
        assert!(check(json!({"not": {"ticket.priority": "low"}})));
        assert!(check(json!({"match": {"ticket.priority": "high"}})));
        assert!(!check(json!({"any": []})));
    }

    #[test]
    fn test_operator_mixed_with_paths() {
        let filter = json!({"not": {"ticket.priority": "low"}, "ticket.id": 42});
        assert!(check(filter));
        let filter = json!({"not": {"ticket.priority": "low"}, "ticket.id": 7});
        assert!(!check(filter));
    }

    #[test]
    fn test_invalid_shapes_are_rejected() {
        assert!(FilterExpr::parse(&json!("x")).is_err());
        assert!(FilterExpr::parse(&json!({"any": {}})).is_err());
        assert!(FilterExpr::parse(&json!({"match": 1})).is_err());
    }

    #[test]
    fn test_serde_shape_is_preserved() {
        let raw = json!({"any": [{"ticket.subject": "%VPN%"}, {"not": {"ticket.id": [1, 2]}}]});
        let filter: FilterExpr = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&filter).unwrap(), raw);
    }
}
