//! `DataSet`: an ordered sequence of [`WalkableDict`] records with secondary
//! indexes, a maths scratch mapping, and the record-shaping operations
//! filterable tasks compose.

use crate::matching::MatchSetGroup;
use crate::record::WalkableDict;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A secondary index: the key paths it was built from, and a mapping from
/// the serialized tuple of those paths' values to the record indices that
/// produced it.
#[derive(Debug, Clone)]
struct Index {
    keys: Vec<String>,
    buckets: HashMap<String, Vec<usize>>,
}

/// An ordered sequence of [`WalkableDict`] records.
///
/// Every record in a `DataSet` is a `WalkableDict`; adding a plain mapping
/// implicitly wraps it. A `DataSet` owns its records exclusively.
///
/// Operations here are total functions: nonsensical inputs (missing keys,
/// wrong types) resolve to no-op or default-substituted behavior, never
/// panics or errors, so pipelines stay robust to partially-typed data.
#[derive(Debug, Clone, Default)]
pub struct DataSet {
    records: Vec<WalkableDict>,
    maths_results: Map<String, Value>,
    indexes: HashMap<String, Index>,
}

impl DataSet {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the records as a slice.
    pub fn records(&self) -> &[WalkableDict] {
        &self.records
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if this dataset has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Accepts a single mapping, a `DataSet`, or any mix thereof and adds
    /// every record found, unwrapping recursively. Invalidates indexes.
    pub fn add_records(&mut self, records: impl IntoIterator<Item = WalkableDict>) -> &mut Self {
        self.records.extend(records);
        self.indexes.clear();
        self
    }

    /// Converts `src`'s value using the fuzzy-cast table, optionally writing
    /// the result to `dst` instead of overwriting `src`.
    pub fn cast_key(&mut self, src: &str, cast_as: CastAs, dst: Option<&str>) -> &mut Self {
        let dst = dst.unwrap_or(src).to_owned();
        for record in &mut self.records {
            if let Some(value) = record.walk(src).cloned() {
                let cast = cast_value(&value, cast_as);
                record.assign(&dst, cast);
            }
        }
        self
    }

    /// Flattens every record's nested keys into `a.b.c`-style dotted paths
    /// joined by `sep`. When `preserve_lists` is true, array values are
    /// kept as-is rather than being flattened into indexed keys.
    ///
    /// `flatten(sep).unflatten(sep)` is equal, as a multiset of records, to
    /// the original when no key contains `sep`.
    pub fn flatten(&mut self, preserve_lists: bool, sep: &str) -> &mut Self {
        for record in &mut self.records {
            let mut flat = Map::new();
            flatten_into(&mut flat, "", &Value::Object(record.as_map().clone()), sep, preserve_lists);
            *record.as_map_mut() = flat;
        }
        self.indexes.clear();
        self
    }

    /// Inverse of [`DataSet::flatten`].
    pub fn unflatten(&mut self, sep: &str) -> &mut Self {
        for record in &mut self.records {
            let mut nested = WalkableDict::new();
            for (k, v) in record.as_map().clone() {
                let path = k.replace(sep, ".");
                nested.assign(&path, v);
            }
            *record = nested;
        }
        self.indexes.clear();
        self
    }

    /// Retains only the records matched by `expr` (or, if `invert`, those
    /// *not* matched).
    pub fn match_and_remove(&mut self, expr: &MatchSetGroup, invert: bool) -> &mut Self {
        self.records.retain(|r| expr.matches(r) != invert);
        self.indexes.clear();
        self
    }

    /// Stable multi-key sort. Each key may be suffixed `:desc`; ascending by
    /// default. Nested key paths are supported via `walk`.
    pub fn sort_records(&mut self, keys: &[String]) -> &mut Self {
        let parsed: Vec<(String, bool)> = keys
            .iter()
            .map(|k| match k.strip_suffix(":desc") {
                Some(stripped) => (stripped.to_owned(), true),
                None => (k.clone(), false),
            })
            .collect();

        self.records.sort_by(|a, b| {
            for (key, desc) in &parsed {
                let av = a.walk(key);
                let bv = b.walk(key);
                let ordering = compare_values(av, bv);
                let ordering = if *desc { ordering.reverse() } else { ordering };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
        self
    }

    /// Builds a secondary index named `name` over `keys`.
    pub fn create_index(&mut self, name: &str, keys: &[String]) -> &mut Self {
        let index = self.build_index(keys);
        self.indexes.insert(name.to_owned(), index);
        self
    }

    /// Removes a secondary index.
    pub fn drop_index(&mut self, name: &str) -> &mut Self {
        self.indexes.remove(name);
        self
    }

    /// Rebuilds an existing index from the current records.
    pub fn refresh_index(&mut self, name: &str) -> &mut Self {
        if let Some(existing) = self.indexes.get(name).cloned() {
            let rebuilt = self.build_index(&existing.keys);
            self.indexes.insert(name.to_owned(), rebuilt);
        }
        self
    }

    /// Looks up records matching `values` for the index built over exactly
    /// `keys`, returning `None` if no such index exists.
    pub fn find_index(&self, keys: &[String], values: &[Value]) -> Option<Vec<&WalkableDict>> {
        let index = self.indexes.values().find(|idx| idx.keys == keys)?;
        let bucket_key = serde_json::to_string(values).ok()?;
        let indices = index.buckets.get(&bucket_key)?;
        Some(indices.iter().filter_map(|&i| self.records.get(i)).collect())
    }

    fn build_index(&self, keys: &[String]) -> Index {
        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, record) in self.records.iter().enumerate() {
            let values: Vec<Value> = keys
                .iter()
                .map(|k| record.walk(k).cloned().unwrap_or(Value::Null))
                .collect();
            if let Ok(key) = serde_json::to_string(&values) {
                buckets.entry(key).or_default().push(i);
            }
        }
        Index {
            keys: keys.to_vec(),
            buckets,
        }
    }

    /// Hash-join against `right` on `left_keys`/`right_keys`. For every
    /// match, merges the right record's keys (not already present on the
    /// left) into a copy of the left record. `inner` drops unmatched left
    /// rows; otherwise unmatched left rows pass through unchanged.
    pub fn join(
        &mut self,
        right: &DataSet,
        left_keys: &[String],
        right_keys: &[String],
        inner: bool,
    ) -> &mut Self {
        let right_index = right.build_index(right_keys);

        let mut joined = Vec::with_capacity(self.records.len());
        for record in &self.records {
            let values: Vec<Value> = left_keys
                .iter()
                .map(|k| record.walk(k).cloned().unwrap_or(Value::Null))
                .collect();
            let bucket_key = serde_json::to_string(&values).unwrap_or_default();

            match right_index.buckets.get(&bucket_key) {
                Some(indices) if !indices.is_empty() => {
                    for &i in indices {
                        let mut merged = record.clone();
                        if let Some(right_record) = right.records.get(i) {
                            for (k, v) in right_record.as_map() {
                                if !merged.as_map().contains_key(k) {
                                    merged.as_map_mut().insert(k.clone(), v.clone());
                                }
                            }
                        }
                        joined.push(merged);
                    }
                }
                _ => {
                    if !inner {
                        joined.push(record.clone());
                    }
                }
            }
        }

        self.records = joined;
        self.indexes.clear();
        self
    }

    /// For each record whose `key` is a sequence, emits one record per
    /// element with `key` rebound to that element. Records without a
    /// sequence at `key` pass through unchanged, unless `preserve_empty` is
    /// false and the sequence is empty, in which case the record is
    /// dropped.
    pub fn unwind(&mut self, key: &str, preserve_empty: bool) -> &mut Self {
        let mut unwound = Vec::with_capacity(self.records.len());
        for record in &self.records {
            match record.walk(key).cloned() {
                Some(Value::Array(items)) => {
                    if items.is_empty() {
                        if preserve_empty {
                            unwound.push(record.clone());
                        }
                    } else {
                        for item in items {
                            let mut copy = record.clone();
                            copy.assign(key, item);
                            unwound.push(copy);
                        }
                    }
                }
                _ => unwound.push(record.clone()),
            }
        }
        self.records = unwound;
        self.indexes.clear();
        self
    }

    /// Inverse of [`DataSet::unwind`]: groups records by the projection of
    /// every key but `key`, collecting `key`'s values back into a sequence.
    pub fn wind(&mut self, key: &str) -> &mut Self {
        let mut groups: Vec<(Map<String, Value>, Vec<Value>)> = Vec::new();

        for record in &self.records {
            let mut rest = record.as_map().clone();
            let value = rest.remove(key).unwrap_or(Value::Null);

            if let Some((_, values)) = groups.iter_mut().find(|(g, _)| *g == rest) {
                values.push(value);
            } else {
                groups.push((rest, vec![value]));
            }
        }

        self.records = groups
            .into_iter()
            .map(|(mut rest, values)| {
                rest.insert(key.to_owned(), Value::Array(values));
                WalkableDict::from(rest)
            })
            .collect();
        self.indexes.clear();
        self
    }

    /// Applies `op` across the values at `keys` within a single record,
    /// writing the result into `self.maths_results[dst]`.
    pub fn maths_keys(&mut self, keys: &[String], op: MathOp, dst: &str) -> &mut Self {
        let values: Vec<f64> = self
            .records
            .iter()
            .flat_map(|r| keys.iter().filter_map(move |k| r.walk(k)))
            .filter_map(Value::as_f64)
            .collect();
        self.maths_results
            .insert(dst.to_owned(), Value::from(op.apply(&values)));
        self
    }

    /// Applies `op` over every record's value at `key` (a column),
    /// writing the result into `self.maths_results[dst]`.
    pub fn maths_records(&mut self, key: &str, op: MathOp, dst: &str) -> &mut Self {
        let values: Vec<f64> = self
            .records
            .iter()
            .filter_map(|r| r.walk(key).and_then(Value::as_f64))
            .collect();
        self.maths_results
            .insert(dst.to_owned(), Value::from(op.apply(&values)));
        self
    }

    /// Returns the maths scratch mapping accumulated by `maths_keys`/`maths_records`.
    pub fn maths_results(&self) -> &Map<String, Value> {
        &self.maths_results
    }

    /// Ensures every record has `key`, writing `default` where it is
    /// missing.
    pub fn add_keys(&mut self, key: &str, default: Value) -> &mut Self {
        for record in &mut self.records {
            if record.walk(key).is_none() {
                record.assign(key, default.clone());
            }
        }
        self
    }

    /// Copies `src`'s value to `dst` on every record that has `src`.
    pub fn copy_key(&mut self, src: &str, dst: &str) -> &mut Self {
        for record in &mut self.records {
            if let Some(value) = record.walk(src).cloned() {
                record.assign(dst, value);
            }
        }
        self
    }

    /// Drops every key in `keys` from every record.
    pub fn drop_keys(&mut self, keys: &[String]) -> &mut Self {
        for record in &mut self.records {
            for key in keys {
                record.drop(key);
            }
        }
        self
    }

    /// Renames keys per the `(src, dst)` pairs given.
    pub fn rename_keys(&mut self, pairs: &[(String, String)]) -> &mut Self {
        for record in &mut self.records {
            for (src, dst) in pairs {
                if let Some(value) = record.drop(src) {
                    record.assign(dst, value);
                }
            }
        }
        self
    }
}

/// Casting targets for [`DataSet::cast_key`], mirroring the fuzzy-cast
/// table used by the match grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastAs {
    Bool,
    Number,
    String,
    Null,
}

fn cast_value(value: &Value, cast_as: CastAs) -> Value {
    match cast_as {
        CastAs::Bool => Value::Bool(match value {
            Value::Bool(b) => *b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
            _ => false,
        }),
        CastAs::Number => match value {
            Value::Number(_) => value.clone(),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Value::Bool(b) => Value::from(if *b { 1 } else { 0 }),
            _ => Value::Null,
        },
        CastAs::String => Value::String(match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }),
        CastAs::Null => Value::Null,
    }
}

/// Arithmetic operations supported by `maths_keys`/`maths_records`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Average,
    Minimum,
    Maximum,
}

impl MathOp {
    fn apply(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            MathOp::Add => values.iter().sum(),
            MathOp::Subtract => values[1..].iter().fold(values[0], |acc, v| acc - v),
            MathOp::Multiply => values.iter().product(),
            MathOp::Divide => values[1..].iter().fold(values[0], |acc, v| acc / v),
            MathOp::Average => values.iter().sum::<f64>() / values.len() as f64,
            MathOp::Minimum => values.iter().cloned().fold(f64::INFINITY, f64::min),
            MathOp::Maximum => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

fn flatten_into(out: &mut Map<String, Value>, prefix: &str, value: &Value, sep: &str, preserve_lists: bool) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}{}{}", prefix, sep, k)
                };
                flatten_into(out, &key, v, sep, preserve_lists);
            }
        }
        Value::Array(arr) if !preserve_lists => {
            for (i, v) in arr.iter().enumerate() {
                let key = format!("{}{}{}", prefix, sep, i);
                flatten_into(out, &key, v, sep, preserve_lists);
            }
        }
        other => {
            out.insert(prefix.to_owned(), other.clone());
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dict(value: Value) -> WalkableDict {
        match value {
            Value::Object(map) => WalkableDict::from(map),
            _ => WalkableDict::new(),
        }
    }

    #[test]
    fn sort_and_limit() {
        let mut ds = DataSet::new();
        ds.add_records(vec![
            dict(json!({"n": "B", "a": 2})),
            dict(json!({"n": "A", "a": 1})),
            dict(json!({"n": "C", "a": 3})),
        ]);
        ds.sort_records(&["n".to_owned()]);
        ds.records = ds.records.into_iter().take(2).collect();

        assert_eq!(ds.records()[0].walk("n"), Some(&json!("A")));
        assert_eq!(ds.records()[1].walk("n"), Some(&json!("B")));
    }

    #[test]
    fn flatten_then_unflatten_round_trips() {
        let mut ds = DataSet::new();
        ds.add_records(vec![dict(json!({"a": {"b": 1, "c": 2}}))]);
        ds.flatten(true, ".");
        assert_eq!(ds.records()[0].walk("a.b"), Some(&json!(1)));
        ds.unflatten(".");
        assert_eq!(ds.records()[0].walk("a.b"), Some(&json!(1)));
    }

    #[test]
    fn unwind_then_wind_round_trips_grouping() {
        let mut ds = DataSet::new();
        ds.add_records(vec![dict(json!({"id": 1, "tags": ["a", "b"]}))]);
        ds.unwind("tags", false);
        assert_eq!(ds.len(), 2);
        ds.wind("tags");
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn join_merges_non_overlapping_keys() {
        let mut left = DataSet::new();
        left.add_records(vec![dict(json!({"id": 1, "name": "a"}))]);
        let mut right = DataSet::new();
        right.add_records(vec![dict(json!({"id": 1, "score": 9}))]);

        left.join(&right, &["id".to_owned()], &["id".to_owned()], false);
        assert_eq!(left.records()[0].walk("score"), Some(&json!(9)));
    }

    #[test]
    fn maths_records_averages_a_column() {
        let mut ds = DataSet::new();
        ds.add_records(vec![
            dict(json!({"n": 2})),
            dict(json!({"n": 4})),
        ]);
        ds.maths_records("n", MathOp::Average, "avg");
        assert_eq!(ds.maths_results().get("avg"), Some(&json!(3.0)));
    }
}
