//! The path-addressed nested map record type, `WalkableDict`.

use serde_json::{Map, Value};

/// One segment of a parsed record path: either a mapping key or a sequence
/// index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Splits a path like `a.b[0].c` into its segments, over `.` and `[n]`
/// separators.
fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut buf = String::new();
    let mut chars = path.chars().peekable();

    fn flush(buf: &mut String, segments: &mut Vec<Segment>) {
        if !buf.is_empty() {
            segments.push(Segment::Key(std::mem::take(buf)));
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '.' => flush(&mut buf, &mut segments),
            '[' => {
                flush(&mut buf, &mut segments);
                let mut idx = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    idx.push(c);
                }
                if let Ok(n) = idx.parse::<usize>() {
                    segments.push(Segment::Index(n));
                }
            }
            c => buf.push(c),
        }
    }
    flush(&mut buf, &mut segments);

    segments
}

/// A mapping from string keys to arbitrary JSON-like values, conceptually
/// identical to a JSON object, with path-addressed access over `.` and
/// `[n]` separators.
///
/// `walk(p, _) == v` holds immediately after `assign(p, v)` for any path `p`
/// consisting solely of mapping segments.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct WalkableDict(Map<String, Value>);

impl WalkableDict {
    /// Creates an empty `WalkableDict`.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Returns the underlying key/value map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the underlying key/value map, mutably.
    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// Traverses nested mappings and numerically-indexed sequences,
    /// returning `None` on any missing segment or type mismatch.
    pub fn walk(&self, path: &str) -> Option<&Value> {
        let segments = parse_path(path);
        let mut current = self.0.get(match segments.first()? {
            Segment::Key(k) => k.as_str(),
            Segment::Index(_) => return None,
        })?;

        for segment in &segments[1..] {
            current = match (segment, current) {
                (Segment::Key(k), Value::Object(map)) => map.get(k)?,
                (Segment::Index(i), Value::Array(arr)) => arr.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Like [`WalkableDict::walk`], but returns `default` on any miss.
    pub fn walk_or<'a>(&'a self, path: &str, default: &'a Value) -> &'a Value {
        self.walk(path).unwrap_or(default)
    }

    /// Creates intermediate mappings as needed and writes `value` at `path`.
    ///
    /// On a sequence, only in-bounds integer indices are written; any other
    /// mismatch (writing a key into an array, an out-of-bounds index, a
    /// non-integer segment into an array) is a no-op.
    pub fn assign(&mut self, path: &str, value: Value) {
        let segments = parse_path(path);
        let (head, rest) = match segments.split_first() {
            Some(pair) => pair,
            None => return,
        };

        let key = match head {
            Segment::Key(k) => k.clone(),
            Segment::Index(_) => return,
        };

        if rest.is_empty() {
            self.0.insert(key, value);
            return;
        }

        let entry = self
            .0
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
        assign_into(entry, rest, value);
    }

    /// Removes the leaf (or sequence element) at `path` and returns its
    /// prior value, if any.
    pub fn drop(&mut self, path: &str) -> Option<Value> {
        let segments = parse_path(path);
        let (last, init) = segments.split_last()?;

        let (head, middle) = init.split_first().map_or((None, init), |(h, m)| (Some(h), m));

        let cursor: &mut Value = match head {
            None => {
                // Single-segment path: leaf lives directly on this map.
                return match last {
                    Segment::Key(k) => self.0.remove(k),
                    Segment::Index(_) => None,
                };
            }
            Some(Segment::Key(k)) => self.0.get_mut(k)?,
            Some(Segment::Index(_)) => return None,
        };

        let mut cursor = cursor;
        for segment in middle {
            cursor = match (segment, cursor) {
                (Segment::Key(k), Value::Object(map)) => map.get_mut(k)?,
                (Segment::Index(i), Value::Array(arr)) => arr.get_mut(*i)?,
                _ => return None,
            };
        }

        match (last, cursor) {
            (Segment::Key(k), Value::Object(map)) => map.remove(k),
            (Segment::Index(i), Value::Array(arr)) if *i < arr.len() => Some(arr.remove(*i)),
            _ => None,
        }
    }
}

/// Recursively assigns `value` at `segments` within `current`, creating
/// intermediate mappings as needed. A no-op on any sequence-shape mismatch.
fn assign_into(current: &mut Value, segments: &[Segment], value: Value) {
    let (head, rest) = match segments.split_first() {
        Some(pair) => pair,
        None => return,
    };

    match head {
        Segment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let map = current.as_object_mut().expect("just coerced to object");
            if rest.is_empty() {
                map.insert(key.clone(), value);
            } else {
                let entry = map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                assign_into(entry, rest, value);
            }
        }
        Segment::Index(idx) => {
            let arr = match current.as_array_mut() {
                Some(arr) => arr,
                None => return,
            };
            if rest.is_empty() {
                if *idx < arr.len() {
                    arr[*idx] = value;
                }
            } else if let Some(entry) = arr.get_mut(*idx) {
                assign_into(entry, rest, value);
            }
        }
    }
}

impl From<Map<String, Value>> for WalkableDict {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<WalkableDict> for Value {
    fn from(dict: WalkableDict) -> Self {
        Value::Object(dict.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assign_then_walk_round_trips_for_mapping_paths() {
        let mut d = WalkableDict::new();
        d.assign("a.b.c", json!(42));
        assert_eq!(d.walk("a.b.c"), Some(&json!(42)));
    }

    #[test]
    fn walk_into_array_index() {
        let mut d = WalkableDict::new();
        d.assign("items", json!([1, 2, 3]));
        assert_eq!(d.walk("items[1]"), Some(&json!(2)));
    }

    #[test]
    fn assign_out_of_bounds_index_is_noop() {
        let mut d = WalkableDict::new();
        d.assign("items", json!([1, 2]));
        d.assign("items[5]", json!(9));
        assert_eq!(d.walk("items"), Some(&json!([1, 2])));
    }

    #[test]
    fn walk_missing_segment_returns_none() {
        let d = WalkableDict::new();
        assert_eq!(d.walk("a.b"), None);
    }

    #[test]
    fn drop_removes_leaf_and_returns_prior_value() {
        let mut d = WalkableDict::new();
        d.assign("a.b", json!("x"));
        assert_eq!(d.drop("a.b"), Some(json!("x")));
        assert_eq!(d.walk("a.b"), None);
    }
}
