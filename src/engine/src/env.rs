//! The process-wide `Environment` singleton: a keyed store loaded from YAML
//! or JSON files, addressable via `env.*` references in templates.

use crate::record::WalkableDict;
use serde_json::Value;
use std::path::Path;

/// A loaded-configuration store, accessed via `env.<path>` references.
///
/// The source carries this as a module-global singleton. Per the design
/// note on preferring explicit construction over global lookup, this is a
/// plain value type: callers own one and pass it to a [`crate::chain::Chain`]
/// explicitly, rather than reaching for a process-wide global.
#[derive(Debug, Clone, Default)]
pub struct Environment(WalkableDict);

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Self(WalkableDict::new())
    }

    /// Adds a value at `path`, creating intermediate mappings as needed.
    pub fn add(&mut self, path: &str, value: Value) {
        self.0.assign(path, value);
    }

    /// Looks up `path`.
    pub fn walk(&self, path: &str) -> Option<&Value> {
        self.0.walk(path)
    }

    /// Removes the value at `path`, returning its prior value if any.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        self.0.drop(path)
    }

    /// Clears every loaded value.
    pub fn purge(&mut self) {
        self.0 = WalkableDict::new();
    }

    /// Loads a YAML or JSON file into this environment, merging its
    /// top-level keys in.
    ///
    /// # Errors
    ///
    /// Returns an error if the extension is not `.yaml`/`.yml`/`.json`, if
    /// the file cannot be read, or if it cannot be parsed. Mirroring the
    /// source's load behavior, parse/read failures are reported to the
    /// caller rather than silently swallowed, so startup configuration
    /// errors surface immediately instead of as a later, confusing `env.*`
    /// miss.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), String> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| format!("could not read {}: {}", path.display(), err))?;

        let value: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| format!("could not parse {} as JSON: {}", path.display(), err))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .map_err(|err| format!("could not parse {} as YAML: {}", path.display(), err))?,
            _ => {
                return Err(format!(
                    "unsupported file type {}; supported types are .json, .yaml, and .yml",
                    path.display()
                ))
            }
        };

        if let Value::Object(map) = value {
            for (k, v) in map {
                self.0.assign(&k, v);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_then_walk_round_trips() {
        let mut env = Environment::new();
        env.add("region", json!("us-east-1"));
        assert_eq!(env.walk("region"), Some(&json!("us-east-1")));
    }

    #[test]
    fn load_rejects_unsupported_extension() {
        let mut env = Environment::new();
        assert!(env.load("config.toml").is_err());
    }
}
