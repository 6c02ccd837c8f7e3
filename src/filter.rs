//! Record filters for network scans
//!
//! A filter is a list of [`Predicate`]s combined with a [`FilterMode`]. Each
//! predicate names a dot-path into the record (`country.iso_code`), an
//! [`Operator`] and a JSON value to compare against.
//!
//! Evaluation never fails. A missing field, a type mismatch, a value that
//! cannot be coerced to a number or a regex that does not compile all make
//! the predicate a non-match. Shape problems are caught up front by
//! [`validate`].
//!
//! ```rust
//! use mmdb_mcp::filter::{FilterEngine, FilterMode, Predicate, Operator};
//! use mmdb_mcp::DataValue;
//! use serde_json::json;
//!
//! let record = DataValue::from_json(&json!({"country": {"iso_code": "US"}}))?;
//! let engine = FilterEngine::new(
//!     vec![Predicate::new("country.iso_code", Operator::Equals, json!("US"))],
//!     FilterMode::All,
//! );
//! assert!(engine.matches(&record));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::data_section::DataValue;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Comparison applied by a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    /// Deep structural equality
    Equals,
    /// Negation of `Equals`
    NotEquals,
    /// Field equals one element of an array
    In,
    /// Negation of `In`
    NotIn,
    /// String field contains a substring
    Contains,
    /// String field matches a regular expression
    Regex,
    /// Numeric `>`
    GreaterThan,
    /// Numeric `>=`
    GreaterThanOrEqual,
    /// Numeric `<`
    LessThan,
    /// Numeric `<=`
    LessThanOrEqual,
    /// Field presence equals the boolean value
    Exists,
}

impl Operator {
    /// Every supported operator
    pub const ALL: [Operator; 11] = [
        Operator::Equals,
        Operator::NotEquals,
        Operator::In,
        Operator::NotIn,
        Operator::Contains,
        Operator::Regex,
        Operator::GreaterThan,
        Operator::GreaterThanOrEqual,
        Operator::LessThan,
        Operator::LessThanOrEqual,
        Operator::Exists,
    ];

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::Regex => "regex",
            Operator::GreaterThan => "greater_than",
            Operator::GreaterThanOrEqual => "greater_than_or_equal",
            Operator::LessThan => "less_than",
            Operator::LessThanOrEqual => "less_than_or_equal",
            Operator::Exists => "exists",
        }
    }
}

impl FromStr for Operator {
    type Err = FilterError;

    /// Parses canonical names and the short aliases (`eq`, `ne`, `gt`,
    /// `gte`, `lt`, `lte`), ignoring case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_ascii_lowercase().as_str() {
            "equals" | "eq" => Operator::Equals,
            "not_equals" | "ne" => Operator::NotEquals,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "contains" => Operator::Contains,
            "regex" => Operator::Regex,
            "greater_than" | "gt" => Operator::GreaterThan,
            "greater_than_or_equal" | "gte" => Operator::GreaterThanOrEqual,
            "less_than" | "lt" => Operator::LessThan,
            "less_than_or_equal" | "lte" => Operator::LessThanOrEqual,
            "exists" => Operator::Exists,
            _ => return Err(FilterError::UnknownOperator(s.to_string())),
        };
        Ok(op)
    }
}

impl TryFrom<String> for Operator {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How predicates combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FilterMode {
    /// Every predicate must match (AND)
    #[default]
    All,
    /// At least one predicate must match (OR)
    Any,
}

impl FilterMode {
    /// Lenient parse: `or`/`any` select [`FilterMode::Any`], everything
    /// else (including the empty string) selects [`FilterMode::All`]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "or" | "any" => FilterMode::Any,
            _ => FilterMode::All,
        }
    }

    /// Wire name, `"and"` or `"or"`
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::All => "and",
            FilterMode::Any => "or",
        }
    }
}

impl From<String> for FilterMode {
    fn from(s: String) -> Self {
        FilterMode::parse(&s)
    }
}

impl From<FilterMode> for String {
    fn from(mode: FilterMode) -> Self {
        mode.as_str().to_string()
    }
}

/// One field test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Dot-separated path into the record
    pub field: String,
    /// Comparison to apply
    pub operator: Operator,
    /// Operand; shape depends on the operator
    #[serde(default)]
    pub value: Value,
}

impl Predicate {
    /// Create a predicate
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Parse one predicate from its JSON object form
    ///
    /// Anything other than an object is rejected with a message showing
    /// the expected shape.
    pub fn from_json(item: &Value, index: usize) -> Result<Self, FilterError> {
        let obj = match item {
            Value::Object(obj) => obj,
            Value::String(s) => {
                let hint = string_filter_hint(s);
                return Err(FilterError::Malformed {
                    index,
                    reason: format!("expected an object, got string {:?}{}", s, hint),
                });
            }
            other => {
                return Err(FilterError::Malformed {
                    index,
                    reason: format!("expected an object, got {}", json_type_name(other)),
                })
            }
        };

        let field = match obj.get("field") {
            Some(Value::String(f)) => f.clone(),
            Some(_) => {
                return Err(FilterError::Malformed {
                    index,
                    reason: "'field' must be a string".to_string(),
                })
            }
            None => return Err(FilterError::EmptyField { index }),
        };

        let operator = match obj.get("operator") {
            Some(Value::String(op)) => op.parse()?,
            Some(_) => {
                return Err(FilterError::Malformed {
                    index,
                    reason: "'operator' must be a string".to_string(),
                })
            }
            None => {
                return Err(FilterError::Malformed {
                    index,
                    reason: "missing 'operator'".to_string(),
                })
            }
        };

        Ok(Self {
            field,
            operator,
            value: obj.get("value").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Parse a JSON array of predicates
pub fn parse_predicates(value: &Value) -> Result<Vec<Predicate>, FilterError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| Predicate::from_json(item, i))
            .collect(),
        other => Err(FilterError::Malformed {
            index: 0,
            reason: format!("filters must be an array, got {}", json_type_name(other)),
        }),
    }
}

fn string_filter_hint(s: &str) -> String {
    let (field, op, value) = if let Some((f, v)) = s.split_once("!=") {
        (f, "not_equals", v)
    } else if let Some((f, v)) = s.split_once('=') {
        (f, "equals", v)
    } else {
        return String::new();
    };
    format!(
        "; use {{\"field\": \"{}\", \"operator\": \"{}\", \"value\": \"{}\"}}",
        field.trim(),
        op,
        value.trim()
    )
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Filter validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Predicate without a field path
    #[error("filter {index}: field must not be empty")]
    EmptyField {
        /// Position in the predicate list
        index: usize,
    },
    /// Operator name not recognized
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    /// Operand has the wrong shape for the operator
    #[error("filter on '{field}': operator '{operator}' requires {expected}")]
    InvalidValue {
        /// Field path of the offending predicate
        field: String,
        /// Operator name
        operator: Operator,
        /// Expected operand shape
        expected: &'static str,
    },
    /// Regex operand does not compile
    #[error("filter on '{field}': invalid regex: {message}")]
    InvalidRegex {
        /// Field path of the offending predicate
        field: String,
        /// Compiler message
        message: String,
    },
    /// Predicate is not an object of the expected shape
    #[error("filter {index}: {reason}")]
    Malformed {
        /// Position in the predicate list
        index: usize,
        /// What is wrong
        reason: String,
    },
}

impl FilterError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        "invalid_filter"
    }
}

/// Check predicate shapes before any record is evaluated
pub fn validate(predicates: &[Predicate]) -> Result<(), FilterError> {
    for (index, p) in predicates.iter().enumerate() {
        if p.field.trim().is_empty() {
            return Err(FilterError::EmptyField { index });
        }

        let expected = match p.operator {
            Operator::In | Operator::NotIn if !p.value.is_array() => Some("an array value"),
            Operator::Exists if !p.value.is_boolean() => Some("a boolean value"),
            Operator::Regex => match p.value.as_str() {
                Some(pattern) => {
                    if let Err(e) = Regex::new(pattern) {
                        return Err(FilterError::InvalidRegex {
                            field: p.field.clone(),
                            message: e.to_string(),
                        });
                    }
                    None
                }
                None => Some("a string pattern"),
            },
            _ => None,
        };

        if let Some(expected) = expected {
            return Err(FilterError::InvalidValue {
                field: p.field.clone(),
                operator: p.operator,
                expected,
            });
        }
    }
    Ok(())
}

/// Compiled predicate set
#[derive(Debug, Clone)]
pub struct FilterEngine {
    predicates: Vec<Predicate>,
    /// Compiled patterns, parallel to `predicates`; `None` for non-regex
    /// operators and for patterns that failed to compile
    patterns: Vec<Option<Regex>>,
    mode: FilterMode,
}

impl FilterEngine {
    /// Build an engine. Never fails; call [`validate`] first to reject bad
    /// predicates.
    pub fn new(predicates: Vec<Predicate>, mode: FilterMode) -> Self {
        let patterns = predicates
            .iter()
            .map(|p| match (p.operator, p.value.as_str()) {
                (Operator::Regex, Some(pattern)) => Regex::new(pattern).ok(),
                _ => None,
            })
            .collect();
        Self {
            predicates,
            patterns,
            mode,
        }
    }

    /// Predicates in evaluation order
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Combination mode
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Evaluate the predicate set against a record
    ///
    /// An empty set matches in either mode.
    pub fn matches(&self, record: &DataValue) -> bool {
        if self.predicates.is_empty() {
            return true;
        }

        let mut results = self
            .predicates
            .iter()
            .zip(&self.patterns)
            .map(|(p, re)| evaluate(p, re.as_ref(), record.get_path(&p.field)));

        match self.mode {
            FilterMode::All => results.all(|m| m),
            FilterMode::Any => results.any(|m| m),
        }
    }
}

fn evaluate(p: &Predicate, pattern: Option<&Regex>, field: Option<&DataValue>) -> bool {
    match p.operator {
        Operator::Exists => match p.value.as_bool() {
            Some(want) => field.is_some() == want,
            None => false,
        },
        Operator::Equals => field.is_some_and(|f| deep_equals(f, &p.value)),
        Operator::NotEquals => !field.is_some_and(|f| deep_equals(f, &p.value)),
        Operator::In => field.is_some_and(|f| is_in(f, &p.value)),
        Operator::NotIn => !field.is_some_and(|f| is_in(f, &p.value)),
        Operator::Contains => match (field.and_then(DataValue::as_str), p.value.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        Operator::Regex => match (field.and_then(DataValue::as_str), pattern) {
            (Some(text), Some(re)) => re.is_match(text),
            _ => false,
        },
        Operator::GreaterThan
        | Operator::GreaterThanOrEqual
        | Operator::LessThan
        | Operator::LessThanOrEqual => {
            let (Some(lhs), Some(rhs)) = (field.and_then(data_as_f64), json_as_f64(&p.value))
            else {
                return false;
            };
            match p.operator {
                Operator::GreaterThan => lhs > rhs,
                Operator::GreaterThanOrEqual => lhs >= rhs,
                Operator::LessThan => lhs < rhs,
                _ => lhs <= rhs,
            }
        }
    }
}

fn is_in(field: &DataValue, candidates: &Value) -> bool {
    candidates
        .as_array()
        .is_some_and(|items| items.iter().any(|c| deep_equals(field, c)))
}

/// Structural equality between a record value and a JSON value
///
/// Integers compare exactly when both sides are integral, otherwise both
/// sides compare as `f64`. JSON `null` never equals a present value.
pub fn deep_equals(field: &DataValue, value: &Value) -> bool {
    match (field, value) {
        (DataValue::String(a), Value::String(b)) => a == b,
        (DataValue::Bool(a), Value::Bool(b)) => a == b,
        (DataValue::Array(items), Value::Array(others)) => {
            items.len() == others.len()
                && items.iter().zip(others).all(|(a, b)| deep_equals(a, b))
        }
        (DataValue::Bytes(bytes), Value::Array(others)) => {
            bytes.len() == others.len()
                && bytes
                    .iter()
                    .zip(others)
                    .all(|(a, b)| b.as_u64() == Some(*a as u64))
        }
        (DataValue::Map(map), Value::Object(obj)) => {
            map.len() == obj.len()
                && obj
                    .iter()
                    .all(|(k, v)| map.get(k).is_some_and(|f| deep_equals(f, v)))
        }
        (_, Value::Number(n)) => {
            let json_int = n
                .as_i64()
                .map(i128::from)
                .or_else(|| n.as_u64().map(i128::from));
            match (field.as_i128(), json_int) {
                (Some(a), Some(b)) => a == b,
                _ => match (data_as_number(field), n.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                },
            }
        }
        _ => false,
    }
}

/// Numeric types only; strings are not numbers for equality
fn data_as_number(value: &DataValue) -> Option<f64> {
    match value {
        DataValue::Double(d) => Some(*d),
        DataValue::Float(f) => Some(*f as f64),
        other => other.as_i128().map(|i| i as f64),
    }
}

/// Numeric coercion for ordering comparisons
fn data_as_f64(value: &DataValue) -> Option<f64> {
    match value {
        DataValue::String(s) => s.parse().ok(),
        other => data_as_number(other),
    }
}

fn json_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> DataValue {
        DataValue::from_json(&json!({
            "country": {"iso_code": "US", "names": {"en": "United States"}},
            "location": {"accuracy_radius": 100, "latitude": 37.75},
            "asn": "15169",
            "tags": ["anycast", "dns"],
        }))
        .unwrap()
    }

    fn check(field: &str, op: Operator, value: Value) -> bool {
        FilterEngine::new(vec![Predicate::new(field, op, value)], FilterMode::All)
            .matches(&record())
    }

    #[test]
    fn test_operator_aliases() {
        assert_eq!("EQ".parse::<Operator>().unwrap(), Operator::Equals);
        assert_eq!("ne".parse::<Operator>().unwrap(), Operator::NotEquals);
        assert_eq!("Gte".parse::<Operator>().unwrap(), Operator::GreaterThanOrEqual);
        assert_eq!("lte".parse::<Operator>().unwrap(), Operator::LessThanOrEqual);
        assert_eq!(
            "like".parse::<Operator>(),
            Err(FilterError::UnknownOperator("like".to_string()))
        );
        for op in Operator::ALL {
            assert_eq!(op.as_str().parse::<Operator>().unwrap(), op);
        }
    }

    #[test]
    fn test_filter_mode_parse() {
        assert_eq!(FilterMode::parse("or"), FilterMode::Any);
        assert_eq!(FilterMode::parse("ANY"), FilterMode::Any);
        assert_eq!(FilterMode::parse("and"), FilterMode::All);
        assert_eq!(FilterMode::parse(""), FilterMode::All);
        assert_eq!(FilterMode::parse("xor"), FilterMode::All);
        assert_eq!(serde_json::to_value(FilterMode::Any).unwrap(), json!("or"));
    }

    #[test]
    fn test_equals_nested() {
        assert!(check("country.iso_code", Operator::Equals, json!("US")));
        assert!(!check("country.iso_code", Operator::Equals, json!("CA")));
        assert!(check(
            "country.names",
            Operator::Equals,
            json!({"en": "United States"})
        ));
        assert!(check("tags", Operator::Equals, json!(["anycast", "dns"])));
    }

    #[test]
    fn test_equals_numbers() {
        assert!(check("location.accuracy_radius", Operator::Equals, json!(100)));
        assert!(check("location.accuracy_radius", Operator::Equals, json!(100.0)));
        assert!(check("location.latitude", Operator::Equals, json!(37.75)));
        // Strings are not numbers for equality
        assert!(!check("asn", Operator::Equals, json!(15169)));
    }

    #[test]
    fn test_absent_fields() {
        assert!(!check("city.name", Operator::Equals, json!("x")));
        assert!(check("city.name", Operator::NotEquals, json!("x")));
        assert!(!check("city.name", Operator::In, json!(["x"])));
        assert!(check("city.name", Operator::NotIn, json!(["x"])));
        assert!(!check("city.name", Operator::Contains, json!("x")));
        assert!(!check("city.name", Operator::GreaterThan, json!(0)));
        assert!(!check("city.name", Operator::Equals, Value::Null));
        // Descending through a scalar is absent too
        assert!(check("asn.value", Operator::Exists, json!(false)));
    }

    #[test]
    fn test_exists() {
        assert!(check("country", Operator::Exists, json!(true)));
        assert!(!check("country", Operator::Exists, json!(false)));
        assert!(check("postal", Operator::Exists, json!(false)));
        assert!(!check("country", Operator::Exists, json!("yes")));
    }

    #[test]
    fn test_in_and_contains() {
        assert!(check("country.iso_code", Operator::In, json!(["CA", "US"])));
        assert!(!check("country.iso_code", Operator::In, json!(["CA", "MX"])));
        assert!(check("country.iso_code", Operator::NotIn, json!(["CA", "MX"])));
        assert!(check("country.names.en", Operator::Contains, json!("United")));
        assert!(!check("country.names.en", Operator::Contains, json!("Kingdom")));
        assert!(!check("location.accuracy_radius", Operator::Contains, json!("1")));
    }

    #[test]
    fn test_regex() {
        assert!(check("country.names.en", Operator::Regex, json!("^United")));
        assert!(!check("country.names.en", Operator::Regex, json!("^Canada$")));
        // Unvalidated bad pattern never matches
        assert!(!check("country.names.en", Operator::Regex, json!("[unclosed")));
    }

    #[test]
    fn test_numeric_coercion() {
        let rec = DataValue::from_json(&json!({"n": 7, "m": 8, "s": "8", "x": "abc"})).unwrap();
        let gt = |field: &str, value: Value| {
            FilterEngine::new(
                vec![Predicate::new(field, Operator::GreaterThan, value)],
                FilterMode::All,
            )
            .matches(&rec)
        };
        assert!(!gt("n", json!(7.0)));
        assert!(gt("m", json!(7)));
        assert!(gt("s", json!(7)));
        assert!(gt("m", json!("7.5")));
        assert!(!gt("x", json!(1)));
        assert!(!gt("m", json!(true)));
        assert!(check("location.latitude", Operator::LessThanOrEqual, json!(37.75)));
        assert!(check("location.accuracy_radius", Operator::GreaterThanOrEqual, json!(100)));
        assert!(check("location.accuracy_radius", Operator::LessThan, json!(101)));
    }

    #[test]
    fn test_modes() {
        let us = Predicate::new("country.iso_code", Operator::Equals, json!("US"));
        let ca = Predicate::new("country.iso_code", Operator::Equals, json!("CA"));
        let rec = record();

        let all = FilterEngine::new(vec![us.clone(), ca.clone()], FilterMode::All);
        let any = FilterEngine::new(vec![us, ca.clone()], FilterMode::Any);
        let none = FilterEngine::new(vec![ca], FilterMode::Any);
        assert!(!all.matches(&rec));
        assert!(any.matches(&rec));
        assert!(!none.matches(&rec));
    }

    #[test]
    fn test_empty_set_matches_in_both_modes() {
        let rec = record();
        assert!(FilterEngine::new(vec![], FilterMode::All).matches(&rec));
        assert!(FilterEngine::new(vec![], FilterMode::Any).matches(&rec));
    }

    #[test]
    fn test_validate() {
        let ok = vec![
            Predicate::new("a", Operator::In, json!([1, 2])),
            Predicate::new("b", Operator::Exists, json!(true)),
            Predicate::new("c", Operator::Regex, json!("^x+$")),
            Predicate::new("d", Operator::GreaterThan, json!("not a number")),
        ];
        assert!(validate(&ok).is_ok());

        let cases = [
            (Predicate::new("", Operator::Equals, json!(1)), "must not be empty"),
            (Predicate::new("a", Operator::In, json!("x")), "an array"),
            (Predicate::new("a", Operator::NotIn, json!(1)), "an array"),
            (Predicate::new("a", Operator::Exists, json!(1)), "a boolean"),
            (Predicate::new("a", Operator::Regex, json!(3)), "a string pattern"),
            (Predicate::new("a", Operator::Regex, json!("[unclosed")), "invalid regex"),
        ];
        for (p, needle) in cases {
            let err = validate(&[p]).unwrap_err();
            assert!(err.to_string().contains(needle), "{}", err);
            assert_eq!(err.code(), "invalid_filter");
        }
    }

    #[test]
    fn test_parse_predicates() {
        let parsed = parse_predicates(&json!([
            {"field": "country.iso_code", "operator": "eq", "value": "US"},
            {"field": "postal", "operator": "exists", "value": false},
        ]))
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].operator, Operator::Equals);
        assert!(parse_predicates(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_bare_strings() {
        let err = parse_predicates(&json!(["country.iso_code=US"])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("expected an object"), "{}", msg);
        assert!(msg.contains("\"operator\": \"equals\""), "{}", msg);

        let err = parse_predicates(&json!(["asn!=15169"])).unwrap_err();
        assert!(err.to_string().contains("not_equals"));

        assert!(matches!(
            parse_predicates(&json!([{"field": "a", "operator": "like"}])),
            Err(FilterError::UnknownOperator(_))
        ));
        assert!(parse_predicates(&json!({"field": "a"})).is_err());
    }

    #[test]
    fn test_predicate_serde() {
        let p: Predicate =
            serde_json::from_value(json!({"field": "a", "operator": "GT", "value": 3})).unwrap();
        assert_eq!(p.operator, Operator::GreaterThan);
        let back = serde_json::to_value(&p).unwrap();
        assert_eq!(back["operator"], json!("greater_than"));
    }
}
