//! The `key<op>value` match grammar: [`Match`], [`MatchSet`] (AND), and
//! [`MatchSetGroup`] (OR of ANDs), plus lowering to Mongo and SQL filter
//! dialects.

use crate::record::WalkableDict;
use regex::RegexBuilder;
use serde_json::{Map, Value};

/// Operators recognized by the match grammar, ordered longest-first so that
/// `==` is never mis-split as `=` followed by `=`.
const OPERATORS: &[&str] = &["==", ">=", "=>", "<=", "=<", "!=", ">", "<", "="];

/// A parsed `key<op>value` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub key: String,
    pub operator: String,
    pub value: Value,
}

impl Match {
    /// Parses a syntax string into a `Match`, splitting on the longest
    /// matching operator.
    ///
    /// # Errors
    ///
    /// Returns an error string if no valid operator appears in `syntax`.
    pub fn parse(syntax: &str) -> Result<Self, String> {
        let operator = OPERATORS
            .iter()
            .find(|op| syntax.contains(*op))
            .ok_or_else(|| {
                format!(
                    "no valid operator found in `{}`; valid operators are: {}",
                    syntax,
                    OPERATORS.join(", ")
                )
            })?;

        let mut parts = syntax.splitn(2, operator);
        let key = parts.next().unwrap_or_default().trim().to_owned();
        let raw_value = parts.next().unwrap_or_default().trim();
        let value = fuzzy_cast(raw_value);

        Ok(Self {
            key,
            operator: (*operator).to_owned(),
            value,
        })
    }

    /// Evaluates this match against a record.
    pub fn matches(&self, record: &WalkableDict) -> bool {
        let record_value = record.walk(&self.key).cloned().unwrap_or(Value::Null);
        let matching_value = self.value.clone();

        let (lhs, rhs) = coerce_common_type(&record_value, &matching_value);

        if self.operator == "=" || self.operator == "!=" {
            let pattern = match &rhs {
                Value::String(s) => s.clone(),
                other => display_value(other),
            };
            let haystack = display_value(&lhs);
            let is_match = RegexBuilder::new(&regex::escape(&pattern))
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(&haystack))
                .unwrap_or(false);
            return if self.operator == "=" {
                is_match
            } else {
                !is_match
            };
        }

        compare(&lhs, &rhs, &self.operator)
    }

    /// Lowers this match to a Mongo aggregation match expression.
    pub fn as_mongo_match(&self) -> Value {
        let key = format!("${}", self.key);

        match self.operator.as_str() {
            "=" => serde_json::json!({
                "$regexMatch": { "input": { "$toString": key }, "regex": display_value(&self.value), "options": "i" }
            }),
            "!=" => serde_json::json!({
                "$not": {
                    "$regexMatch": { "input": { "$toString": key }, "regex": display_value(&self.value), "options": "i" }
                }
            }),
            "<=" | "=<" => serde_json::json!({ self.key.clone(): { "$lte": self.value } }),
            ">=" | "=>" => serde_json::json!({ self.key.clone(): { "$gte": self.value } }),
            "==" => serde_json::json!({ self.key.clone(): self.value }),
            "<" => serde_json::json!({ self.key.clone(): { "$lt": self.value } }),
            ">" => serde_json::json!({ self.key.clone(): { "$gt": self.value } }),
            _ => Value::Null,
        }
    }

    /// Lowers this match to a parameterized SQL fragment, returning the
    /// fragment and the bind value. Bind names are freshly generated so
    /// callers never interpolate user-controlled text directly into SQL.
    pub fn as_sql_match(&self, bind_name: &str) -> (String, Value) {
        match self.operator.as_str() {
            "=" => (
                format!("{} ILIKE :{}", self.key, bind_name),
                Value::String(format!("%{}%", display_value(&self.value))),
            ),
            "!=" => (
                format!("{} NOT ILIKE :{}", self.key, bind_name),
                Value::String(format!("%{}%", display_value(&self.value))),
            ),
            "<=" | "=<" => (format!("{} <= :{}", self.key, bind_name), self.value.clone()),
            ">=" | "=>" => (format!("{} >= :{}", self.key, bind_name), self.value.clone()),
            "==" => (format!("{} = :{}", self.key, bind_name), self.value.clone()),
            "<" => (format!("{} < :{}", self.key, bind_name), self.value.clone()),
            ">" => (format!("{} > :{}", self.key, bind_name), self.value.clone()),
            _ => (String::new(), Value::Null),
        }
    }
}

/// A conjunction (AND) of [`Match`] instances.
#[derive(Debug, Clone, Default)]
pub struct MatchSet(pub Vec<Match>);

impl MatchSet {
    /// Parses a list of syntax strings into a `MatchSet`.
    ///
    /// # Errors
    ///
    /// Returns an error if any syntax string fails to parse.
    pub fn parse(syntaxes: &[String]) -> Result<Self, String> {
        syntaxes
            .iter()
            .map(|s| Match::parse(s))
            .collect::<Result<Vec<_>, _>>()
            .map(MatchSet)
    }

    /// True iff every constituent match is true.
    pub fn matches(&self, record: &WalkableDict) -> bool {
        self.0.iter().all(|m| m.matches(record))
    }

    /// Lowers to a single merged Mongo match document, with aggregation
    /// expressions (`=`/`!=`) collected under `$expr.$and` and plain field
    /// matches merged directly.
    pub fn as_mongo_match(&self) -> Value {
        let mut non_expr = Map::new();
        let mut expr_and = Vec::new();

        for m in &self.0 {
            let lowered = m.as_mongo_match();
            if let Value::Object(obj) = &lowered {
                if obj.keys().next().map_or(false, |k| k.starts_with('$')) {
                    expr_and.push(lowered);
                } else {
                    non_expr.extend(obj.clone());
                }
            }
        }

        let mut result = Map::new();
        if !expr_and.is_empty() {
            result.insert(
                "$expr".to_owned(),
                serde_json::json!({ "$and": expr_and }),
            );
        }
        result.extend(non_expr);
        Value::Object(result)
    }
}

/// A disjunction (OR) of [`MatchSet`]s.
#[derive(Debug, Clone, Default)]
pub struct MatchSetGroup(pub Vec<MatchSet>);

impl MatchSetGroup {
    /// True iff at least one constituent set matches (or the group is
    /// empty, in which case every record matches).
    pub fn matches(&self, record: &WalkableDict) -> bool {
        self.0.is_empty() || self.0.iter().any(|set| set.matches(record))
    }

    /// Lowers to `{ $or: [...] }`, or a single document if there is only
    /// one constituent set.
    pub fn as_mongo_match(&self) -> Value {
        match self.0.as_slice() {
            [] => Value::Object(Map::new()),
            [only] => only.as_mongo_match(),
            many => {
                let or: Vec<Value> = many.iter().map(MatchSet::as_mongo_match).collect();
                serde_json::json!({ "$or": or })
            }
        }
    }
}

/// Fuzzy-casts a raw string into the value type it most resembles: bool,
/// null, number, or (falling through) string.
pub fn fuzzy_cast(raw: &str) -> Value {
    if is_bool(raw) {
        return Value::Bool(raw.eq_ignore_ascii_case("true"));
    }
    if is_null(raw) {
        return Value::Null;
    }
    if is_number(raw) {
        if raw.contains('.') {
            if let Ok(f) = raw.parse::<f64>() {
                return serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::String(raw.to_owned()));
            }
        } else if let Ok(i) = raw.parse::<i64>() {
            return Value::Number(i.into());
        }
    }
    Value::String(raw.to_owned())
}

fn is_bool(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("false")
}

fn is_null(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("null") || raw.eq_ignore_ascii_case("none")
}

fn is_number(raw: &str) -> bool {
    !raw.is_empty() && raw.parse::<f64>().is_ok()
}

/// Converts both operands to a common type, per the match algorithm: bool,
/// then null, then number, then string.
fn coerce_common_type(lhs: &Value, rhs: &Value) -> (Value, Value) {
    if std::mem::discriminant(lhs) == std::mem::discriminant(rhs) {
        return (lhs.clone(), rhs.clone());
    }

    let as_str = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => display_value(other),
    };

    let rhs_str = as_str(rhs);
    if is_bool(&rhs_str) {
        return (
            Value::Bool(truthy(lhs)),
            Value::Bool(rhs_str.eq_ignore_ascii_case("true")),
        );
    }
    if is_null(&rhs_str) {
        return (Value::Null, Value::Null);
    }
    if is_number(&rhs_str) {
        let lhs_f = as_str(lhs).parse::<f64>().unwrap_or(f64::NAN);
        let rhs_f = rhs_str.parse::<f64>().unwrap_or(f64::NAN);
        return (
            serde_json::Number::from_f64(lhs_f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            serde_json::Number::from_f64(rhs_f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
    }
    (Value::String(as_str(lhs)), Value::String(rhs_str))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare(lhs: &Value, rhs: &Value, operator: &str) -> bool {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };

    let ordering = match ordering {
        Some(o) => o,
        None => return operator == "!=",
    };

    match operator {
        "==" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        ">=" | "=>" => ordering != Ordering::Less,
        "<=" | "=<" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        "<" => ordering == Ordering::Less,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> WalkableDict {
        let mut d = WalkableDict::new();
        for (k, v) in pairs {
            d.assign(k, v.clone());
        }
        d
    }

    #[test]
    fn longest_operator_is_matched_first() {
        let m = Match::parse("age==30").unwrap();
        assert_eq!(m.operator, "==");
        assert_eq!(m.key, "age");
        assert_eq!(m.value, json!(30));
    }

    #[test]
    fn equals_sign_is_substring_match() {
        let m = Match::parse("name=Ada").unwrap();
        let r = record(&[("name", json!("Ada Okafor"))]);
        assert!(m.matches(&r));
    }

    #[test]
    fn not_equals_is_negation_of_substring_match() {
        let m = Match::parse("name!=Ada").unwrap();
        let r = record(&[("name", json!("Grace Hopper"))]);
        assert!(m.matches(&r));
    }

    #[test]
    fn numeric_comparison_after_fuzzy_cast() {
        let m = Match::parse("count>=10").unwrap();
        let r = record(&[("count", json!(12))]);
        assert!(m.matches(&r));
    }

    #[test]
    fn match_set_is_conjunction() {
        let set = MatchSet::parse(&["a==1".to_owned(), "b==2".to_owned()]).unwrap();
        let r = record(&[("a", json!(1)), ("b", json!(3))]);
        assert!(!set.matches(&r));
    }

    #[test]
    fn match_set_group_is_disjunction_of_conjunctions() {
        let group = MatchSetGroup(vec![
            MatchSet::parse(&["a==1".to_owned()]).unwrap(),
            MatchSet::parse(&["a==2".to_owned()]).unwrap(),
        ]);
        let r = record(&[("a", json!(2))]);
        assert!(group.matches(&r));
    }
}
