//! The common, user-facing filter model applied by filterable tasks:
//! `add_keys` / `exclude_keys` / `headers` / `matches` / `sort` / `limit` /
//! `count`.

use crate::dataset::DataSet;
use crate::matching::MatchSetGroup;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// A filter request, as authored in a task's template configuration.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub add_keys: Vec<(String, Value)>,
    pub exclude_keys: Vec<String>,
    pub headers: Option<Vec<String>>,
    pub matches: MatchSetGroup,
    pub sort: Vec<String>,
    pub limit: Option<usize>,
    pub count: bool,
}

/// Which of a filter's named stages a filterable task honors, expressed as
/// a regex tested against each stage's name.
#[derive(Debug, Clone)]
pub struct Accepted(Regex);

impl Accepted {
    /// Accepts every stage.
    pub fn all() -> Self {
        Self(Regex::new(".*").expect("valid regex"))
    }

    /// Builds an acceptance filter from a user-supplied regex.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` does not compile.
    pub fn new(pattern: &str) -> Result<Self, String> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|err| err.to_string())
    }

    fn allows(&self, stage: &str) -> bool {
        self.0.is_match(stage)
    }
}

static STAGE_ORDER: Lazy<[&str; 7]> = Lazy::new(|| {
    [
        "add_keys",
        "matches",
        "sort",
        "limit",
        "exclude_keys",
        "headers",
        "count",
    ]
});

/// The result of applying a [`Filter`] to a [`DataSet`]: the (possibly
/// trimmed/projected) dataset, plus an optional record count.
#[derive(Debug, Clone)]
pub struct FilterResult {
    pub data: DataSet,
    pub count: Option<usize>,
}

impl Filter {
    /// Applies this filter to `data` in the fixed in-memory order:
    /// `add_keys → matches → sort → limit → exclude_keys → headers → count`.
    /// Stages not present in `accepted` are treated as no-ops.
    pub fn apply(&self, mut data: DataSet, accepted: &Accepted) -> FilterResult {
        for stage in STAGE_ORDER.iter() {
            if !accepted.allows(stage) {
                continue;
            }
            match *stage {
                "add_keys" => {
                    for (key, default) in &self.add_keys {
                        data.add_keys(key, default.clone());
                    }
                }
                "matches" => {
                    data.match_and_remove(&self.matches, false);
                }
                "sort" => {
                    if !self.sort.is_empty() {
                        data.sort_records(&self.sort);
                    }
                }
                "limit" => {
                    if let Some(limit) = self.limit {
                        let records = data.records().iter().take(limit).cloned().collect::<Vec<_>>();
                        data = DataSet::new();
                        data.add_records(records);
                    }
                }
                "exclude_keys" => {
                    if !self.exclude_keys.is_empty() {
                        data.drop_keys(&self.exclude_keys);
                    }
                }
                "headers" => {
                    if let Some(headers) = &self.headers {
                        let kept: Vec<String> = data
                            .records()
                            .first()
                            .map(|r| r.as_map().keys().cloned().collect())
                            .unwrap_or_default();
                        let to_drop: Vec<String> = kept
                            .into_iter()
                            .filter(|k| !headers.contains(k))
                            .collect();
                        if !to_drop.is_empty() {
                            data.drop_keys(&to_drop);
                        }
                    }
                }
                _ => {}
            }
        }

        let count = if accepted.allows("count") && self.count {
            Some(data.len())
        } else {
            None
        };

        FilterResult { data, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WalkableDict;
    use serde_json::json;

    fn dict(value: Value) -> WalkableDict {
        match value {
            Value::Object(map) => WalkableDict::from(map),
            _ => WalkableDict::new(),
        }
    }

    #[test]
    fn sort_and_limit_matches_end_to_end_scenario() {
        let mut data = DataSet::new();
        data.add_records(vec![
            dict(json!({"n": "B", "a": 2})),
            dict(json!({"n": "A", "a": 1})),
            dict(json!({"n": "C", "a": 3})),
        ]);

        let filter = Filter {
            sort: vec!["n".to_owned()],
            limit: Some(2),
            ..Filter::default()
        };

        let result = filter.apply(data, &Accepted::all());
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.data.records()[0].walk("n"), Some(&json!("A")));
        assert_eq!(result.data.records()[1].walk("n"), Some(&json!("B")));
    }

    #[test]
    fn applying_filter_twice_is_idempotent() {
        let mut data = DataSet::new();
        data.add_records(vec![dict(json!({"n": "B"})), dict(json!({"n": "A"}))]);

        let filter = Filter {
            sort: vec!["n".to_owned()],
            ..Filter::default()
        };

        let once = filter.apply(data, &Accepted::all());
        let twice = filter.apply(once.data.clone(), &Accepted::all());

        let once_names: Vec<_> = once.data.records().iter().map(|r| r.walk("n").cloned()).collect();
        let twice_names: Vec<_> = twice.data.records().iter().map(|r| r.walk("n").cloned()).collect();
        assert_eq!(once_names, twice_names);
    }

    #[test]
    fn unaccepted_stage_is_a_noop() {
        let mut data = DataSet::new();
        data.add_records(vec![dict(json!({"n": "B"})), dict(json!({"n": "A"}))]);

        let filter = Filter {
            sort: vec!["n".to_owned()],
            ..Filter::default()
        };

        let accepted = Accepted::new("limit|matches").unwrap();
        let result = filter.apply(data, &accepted);
        // sort was not accepted, so original submission order is kept.
        assert_eq!(result.data.records()[0].walk("n"), Some(&json!("B")));
    }
}
