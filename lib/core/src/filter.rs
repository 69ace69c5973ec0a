// Metadata and document predicates.
//
// Structured filters use the `{"field": {"$op": value}}` JSON shape; document
// filters use `{"$contains": "text"}`. Both parse into closed enums that are
// evaluated by structural recursion.

use crate::error::{Error, Result};
use crate::record::RecordMeta;
use serde_json::{Map, Value};

pub trait Filter {
    fn matches(&self, record: &RecordMeta) -> bool;
}

/// Predicate tree over record metadata
#[derive(Debug, Clone, PartialEq)]
pub enum Where {
    Eq { key: String, value: Value },
    Ne { key: String, value: Value },
    Gt { key: String, value: f64 },
    Gte { key: String, value: f64 },
    Lt { key: String, value: f64 },
    Lte { key: String, value: f64 },
    In { key: String, values: Vec<Value> },
    Nin { key: String, values: Vec<Value> },
    And(Vec<Where>),
    Or(Vec<Where>),
    Not(Box<Where>),
}

/// Predicate tree over document text
#[derive(Debug, Clone, PartialEq)]
pub enum WhereDocument {
    Contains(String),
    NotContains(String),
    And(Vec<WhereDocument>),
    Or(Vec<WhereDocument>),
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Validation(format!("invalid filter: {}", msg.into()))
}

fn single_entry<'a>(obj: &'a Map<String, Value>, what: &str) -> Result<(&'a String, &'a Value)> {
    let mut iter = obj.iter();
    match (iter.next(), iter.next()) {
        (Some(entry), None) => Ok(entry),
        (None, _) => Err(invalid(format!("{} must not be empty", what))),
        _ => Err(invalid(format!(
            "{} must have exactly one key, got {}; combine clauses with $and/$or",
            what,
            obj.len()
        ))),
    }
}

fn is_scalar(v: &Value) -> bool {
    matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn scalar(op: &str, v: &Value) -> Result<Value> {
    if is_scalar(v) {
        Ok(v.clone())
    } else {
        Err(invalid(format!("{} expects a string, number or boolean, got {}", op, v)))
    }
}

fn number(op: &str, v: &Value) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| invalid(format!("{} expects a number, got {}", op, v)))
}

fn scalar_list(op: &str, v: &Value) -> Result<Vec<Value>> {
    let items = v
        .as_array()
        .ok_or_else(|| invalid(format!("{} expects a list, got {}", op, v)))?;
    if items.is_empty() {
        return Err(invalid(format!("{} expects a non-empty list", op)));
    }
    items.iter().map(|item| scalar(op, item)).collect()
}

fn clause_list<'a>(op: &str, v: &'a Value) -> Result<&'a Vec<Value>> {
    match v.as_array() {
        Some(items) if !items.is_empty() => Ok(items),
        Some(_) => Err(invalid(format!("{} expects a non-empty list", op))),
        None => Err(invalid(format!("{} expects a list, got {}", op, v))),
    }
}

/// Numbers compare by value regardless of integer/float representation
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

impl Where {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        Self::parse(&value)
    }

    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| invalid(format!("expected an object, got {}", value)))?;
        let (key, operand) = single_entry(obj, "where clause")?;

        match key.as_str() {
            "$and" => Ok(Where::And(
                clause_list("$and", operand)?.iter().map(Where::parse).collect::<Result<_>>()?,
            )),
            "$or" => Ok(Where::Or(
                clause_list("$or", operand)?.iter().map(Where::parse).collect::<Result<_>>()?,
            )),
            "$not" => Ok(Where::Not(Box::new(Where::parse(operand)?))),
            k if k.starts_with('$') => Err(invalid(format!("unknown logical operator '{}'", k))),
            field => Self::parse_field(field, operand),
        }
    }

    fn parse_field(field: &str, operand: &Value) -> Result<Self> {
        let key = field.to_string();
        let obj = match operand {
            Value::Object(obj) => obj,
            shorthand => {
                return Ok(Where::Eq {
                    key,
                    value: scalar("$eq", shorthand)?,
                })
            }
        };
        let (op, arg) = single_entry(obj, "field operator")?;
        Ok(match op.as_str() {
            "$eq" => Where::Eq { key, value: scalar(op, arg)? },
            "$ne" => Where::Ne { key, value: scalar(op, arg)? },
            "$gt" => Where::Gt { key, value: number(op, arg)? },
            "$gte" => Where::Gte { key, value: number(op, arg)? },
            "$lt" => Where::Lt { key, value: number(op, arg)? },
            "$lte" => Where::Lte { key, value: number(op, arg)? },
            "$in" => Where::In { key, values: scalar_list(op, arg)? },
            "$nin" => Where::Nin { key, values: scalar_list(op, arg)? },
            other => return Err(invalid(format!("unknown operator '{}' on field '{}'", other, field))),
        })
    }

    fn eval(&self, record: &RecordMeta) -> bool {
        let field = |key: &str| record.metadata.as_ref().and_then(|m| m.get(key));
        let numeric = |key: &str| field(key).and_then(Value::as_f64);

        match self {
            Where::Eq { key, value } => field(key).map(|v| values_equal(v, value)).unwrap_or(false),
            Where::Ne { key, value } => field(key).map(|v| !values_equal(v, value)).unwrap_or(false),
            Where::Gt { key, value } => numeric(key).map(|v| v > *value).unwrap_or(false),
            Where::Gte { key, value } => numeric(key).map(|v| v >= *value).unwrap_or(false),
            Where::Lt { key, value } => numeric(key).map(|v| v < *value).unwrap_or(false),
            Where::Lte { key, value } => numeric(key).map(|v| v <= *value).unwrap_or(false),
            Where::In { key, values } => field(key)
                .map(|v| values.iter().any(|candidate| values_equal(v, candidate)))
                .unwrap_or(false),
            Where::Nin { key, values } => field(key)
                .map(|v| !values.iter().any(|candidate| values_equal(v, candidate)))
                .unwrap_or(false),
            Where::And(clauses) => clauses.iter().all(|c| c.eval(record)),
            Where::Or(clauses) => clauses.iter().any(|c| c.eval(record)),
            Where::Not(clause) => !clause.eval(record),
        }
    }
}

impl Filter for Where {
    fn matches(&self, record: &RecordMeta) -> bool {
        self.eval(record)
    }
}

impl WhereDocument {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        Self::parse(&value)
    }

    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| invalid(format!("expected an object, got {}", value)))?;
        let (op, operand) = single_entry(obj, "where_document clause")?;

        let text = |op: &str| -> Result<String> {
            match operand.as_str() {
                Some(s) if !s.is_empty() => Ok(s.to_string()),
                _ => Err(invalid(format!("{} expects a non-empty string", op))),
            }
        };

        match op.as_str() {
            "$contains" => Ok(WhereDocument::Contains(text(op)?)),
            "$not_contains" => Ok(WhereDocument::NotContains(text(op)?)),
            "$and" => Ok(WhereDocument::And(
                clause_list(op, operand)?
                    .iter()
                    .map(WhereDocument::parse)
                    .collect::<Result<_>>()?,
            )),
            "$or" => Ok(WhereDocument::Or(
                clause_list(op, operand)?
                    .iter()
                    .map(WhereDocument::parse)
                    .collect::<Result<_>>()?,
            )),
            other => Err(invalid(format!("unknown document operator '{}'", other))),
        }
    }

    fn eval(&self, document: Option<&str>) -> bool {
        match self {
            WhereDocument::Contains(needle) => document.map(|d| d.contains(needle.as_str())).unwrap_or(false),
            WhereDocument::NotContains(needle) => {
                document.map(|d| !d.contains(needle.as_str())).unwrap_or(false)
            }
            WhereDocument::And(clauses) => clauses.iter().all(|c| c.eval(document)),
            WhereDocument::Or(clauses) => clauses.iter().any(|c| c.eval(document)),
        }
    }
}

impl Filter for WhereDocument {
    fn matches(&self, record: &RecordMeta) -> bool {
        self.eval(record.document.as_deref())
    }
}

/// Conjunction of an optional metadata filter and an optional document filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub where_metadata: Option<Where>,
    pub where_document: Option<WhereDocument>,
}

impl RecordFilter {
    /// Parse both filter strings. Absent, blank and `{}` inputs mean "no
    /// filter"; `Ok(None)` is returned when neither side constrains anything.
    pub fn parse(where_json: Option<&str>, where_document_json: Option<&str>) -> Result<Option<Self>> {
        fn present(s: Option<&str>) -> Result<Option<Value>> {
            let Some(s) = s.map(str::trim).filter(|s| !s.is_empty()) else {
                return Ok(None);
            };
            let value: Value = serde_json::from_str(s).map_err(|e| invalid(e.to_string()))?;
            match &value {
                Value::Object(obj) if obj.is_empty() => Ok(None),
                _ => Ok(Some(value)),
            }
        }

        let where_metadata = present(where_json)?.map(|v| Where::parse(&v)).transpose()?;
        let where_document = present(where_document_json)?
            .map(|v| WhereDocument::parse(&v))
            .transpose()?;

        if where_metadata.is_none() && where_document.is_none() {
            Ok(None)
        } else {
            Ok(Some(Self {
                where_metadata,
                where_document,
            }))
        }
    }
}

impl Filter for RecordFilter {
    fn matches(&self, record: &RecordMeta) -> bool {
        self.where_metadata.as_ref().map(|w| w.matches(record)).unwrap_or(true)
            && self.where_document.as_ref().map(|w| w.matches(record)).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(metadata: Value, document: Option<&str>) -> RecordMeta {
        RecordMeta {
            metadata: metadata.as_object().cloned(),
            document: document.map(str::to_string),
        }
    }

    fn w(v: Value) -> Where {
        Where::parse(&v).unwrap()
    }

    #[test]
    fn test_equality_and_shorthand() {
        let r = record(json!({"category": "A", "score": 3}), None);
        assert!(w(json!({"category": "A"})).matches(&r));
        assert!(w(json!({"category": {"$eq": "A"}})).matches(&r));
        assert!(!w(json!({"category": {"$ne": "A"}})).matches(&r));
        assert!(w(json!({"score": 3.0})).matches(&r));
    }

    #[test]
    fn test_comparisons() {
        let r = record(json!({"score": 10}), None);
        assert!(w(json!({"score": {"$gt": 5}})).matches(&r));
        assert!(w(json!({"score": {"$gte": 10}})).matches(&r));
        assert!(!w(json!({"score": {"$lt": 10}})).matches(&r));
        assert!(w(json!({"score": {"$lte": 10.0}})).matches(&r));
    }

    #[test]
    fn test_membership() {
        let r = record(json!({"tag": "b"}), None);
        assert!(w(json!({"tag": {"$in": ["a", "b"]}})).matches(&r));
        assert!(!w(json!({"tag": {"$nin": ["a", "b"]}})).matches(&r));
        assert!(w(json!({"tag": {"$nin": ["x"]}})).matches(&r));
    }

    #[test]
    fn test_missing_field_is_false() {
        let r = record(json!({"other": 1}), None);
        assert!(!w(json!({"tag": "a"})).matches(&r));
        assert!(!w(json!({"tag": {"$ne": "a"}})).matches(&r));
        assert!(!w(json!({"tag": {"$nin": ["a"]}})).matches(&r));
        assert!(!w(json!({"tag": {"$gt": 1}})).matches(&r));
        assert!(w(json!({"$not": {"tag": "a"}})).matches(&r));

        let empty = RecordMeta::default();
        assert!(!w(json!({"tag": "a"})).matches(&empty));
    }

    #[test]
    fn test_logical_composition() {
        let r = record(json!({"a": 1, "b": "x"}), None);
        assert!(w(json!({"$and": [{"a": 1}, {"b": "x"}]})).matches(&r));
        assert!(!w(json!({"$and": [{"a": 1}, {"b": "y"}]})).matches(&r));
        assert!(w(json!({"$or": [{"a": 2}, {"b": "x"}]})).matches(&r));
        assert!(w(json!({"$not": {"$or": [{"a": 2}, {"b": "y"}]}})).matches(&r));
    }

    #[test]
    fn test_malformed_filters() {
        for bad in [
            json!([1, 2]),
            json!({}),
            json!({"a": 1, "b": 2}),
            json!({"$and": []}),
            json!({"$and": {"a": 1}}),
            json!({"$xor": [{"a": 1}]}),
            json!({"a": {"$gt": "high"}}),
            json!({"a": {"$in": []}}),
            json!({"a": {"$in": [[1]]}}),
            json!({"a": {"$like": "x"}}),
            json!({"a": {"b": 1}}),
            json!({"a": [1, 2]}),
        ] {
            assert!(matches!(Where::parse(&bad), Err(Error::Validation(_))), "accepted {}", bad);
        }
        assert!(Where::from_json_str("{broken").is_err());
    }

    #[test]
    fn test_document_filter() {
        let r = record(json!({}), Some("the quick brown fox"));
        let parse = |v: Value| WhereDocument::parse(&v).unwrap();
        assert!(parse(json!({"$contains": "quick"})).matches(&r));
        assert!(!parse(json!({"$contains": "Quick"})).matches(&r));
        assert!(parse(json!({"$not_contains": "slow"})).matches(&r));
        assert!(parse(json!({"$and": [{"$contains": "fox"}, {"$contains": "brown"}]})).matches(&r));
        assert!(parse(json!({"$or": [{"$contains": "cat"}, {"$contains": "fox"}]})).matches(&r));

        let no_doc = RecordMeta::default();
        assert!(!parse(json!({"$contains": "fox"})).matches(&no_doc));
        assert!(!parse(json!({"$not_contains": "fox"})).matches(&no_doc));

        assert!(WhereDocument::parse(&json!({"$contains": ""})).is_err());
        assert!(WhereDocument::parse(&json!({"$regex": "f.x"})).is_err());
    }

    #[test]
    fn test_record_filter_parse() {
        assert_eq!(RecordFilter::parse(None, None).unwrap(), None);
        assert_eq!(RecordFilter::parse(Some("{}"), Some("  ")).unwrap(), None);

        let f = RecordFilter::parse(Some(r#"{"a": 1}"#), Some(r#"{"$contains": "x"}"#))
            .unwrap()
            .unwrap();
        assert!(f.matches(&record(json!({"a": 1}), Some("xyz"))));
        assert!(!f.matches(&record(json!({"a": 1}), Some("abc"))));
        assert!(!f.matches(&record(json!({"a": 2}), Some("xyz"))));

        assert!(RecordFilter::parse(Some(r#"{"a": {"$bad": 1}}"#), None).is_err());
    }
}
