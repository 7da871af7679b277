//! Task base and lifecycle: materialization from a templated config,
//! the retry/`when`/`on:` state machine, and result publication.

use crate::env::Environment;
use crate::interpolate::{self, Scope};
use crate::record::WalkableDict;
use crate::registry::{Registry, TaskBody};
use crate::status::Status;
use chain_core::Context;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// A task's retry policy. `max_attempts` defaults to 1, meaning no retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delay_seconds: f64,
    pub max_attempts: u32,
    pub when_error_like: Option<Regex>,
    pub when_error_not_like: Option<Regex>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay_seconds: 1.0,
            max_attempts: 1,
            when_error_like: None,
            when_error_not_like: None,
        }
    }
}

/// How a task's result is published into the chain's shared variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    Overwrite,
    Append,
    Extend,
    Merge,
}

/// A task's `result_as` directive: the variable name and publication mode.
#[derive(Debug, Clone)]
pub struct ResultAs {
    pub name: String,
    pub mode: ResultMode,
}

/// Lifecycle-event-queued task configurations (`on: { start|complete|error|skipped: [...] }`).
#[derive(Debug, Clone, Default)]
pub struct OnDirectives {
    pub start: Vec<Value>,
    pub complete: Vec<Value>,
    pub error: Vec<Value>,
    pub skipped: Vec<Value>,
}

/// Diagnostics accumulated over a task's run.
#[derive(Debug, Clone, Default)]
pub struct TaskMeta {
    pub errors: Vec<String>,
    pub attempts: u32,
    pub count: Option<usize>,
    pub duration_ms: Option<i64>,
    pub info: Option<String>,
}

/// One unit of work: a typed kind, a lifecycle, and a result.
#[derive(Debug)]
pub struct Task {
    pub name: String,
    pub description: Option<String>,
    pub blocking: bool,
    pub status: Status,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub retry: RetryPolicy,
    pub iterate: Option<Value>,
    pub on: OnDirectives,
    pub when: Option<String>,
    pub result: Value,
    pub result_as: Option<ResultAs>,
    pub meta: TaskMeta,
    pub kind: String,
    pub original_config: Value,
    body: Box<dyn TaskBody>,
    fired_directives: Vec<Value>,
}

impl Task {
    /// Materializes a `Task` from one entry of a chain's `task_templates`
    /// list: `{"<kind>": {task-config}}`. Renders every string leaf of the
    /// inner config against `scope`, then constructs the registered task
    /// body from the rendered config.
    ///
    /// # Errors
    ///
    /// Returns an error if `raw` is not a single-key mapping, a required
    /// lifecycle field is missing or malformed, or the task kind is not
    /// registered.
    pub fn from_template(raw: &Value, registry: &Registry, scope: &Scope<'_>) -> Result<Self, String> {
        let obj = raw
            .as_object()
            .ok_or_else(|| "task template must be a single-key mapping".to_owned())?;
        if obj.len() != 1 {
            return Err("task template must have exactly one outer key naming its kind".to_owned());
        }
        let (kind, inner) = obj.iter().next().expect("checked len == 1");

        let rendered = interpolate::walk_and_replace(inner, scope)?;
        let rendered_obj = rendered.as_object().cloned().unwrap_or_default();

        let name = rendered_obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("task of kind `{}` is missing required field `name`", kind))?
            .to_owned();
        let description = rendered_obj
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let blocking = rendered_obj.get("blocking").and_then(Value::as_bool).unwrap_or(true);
        let when = rendered_obj.get("when").and_then(Value::as_str).map(str::to_owned);
        let iterate = rendered_obj.get("iterate").cloned().filter(|v| !v.is_null());
        let retry = parse_retry(rendered_obj.get("retry"))?;
        let on = parse_on(rendered_obj.get("on"));
        let result_as = parse_result_as(rendered_obj.get("result_as"))?;

        let body = registry.build(kind, rendered.clone())?;

        Ok(Self {
            name,
            description,
            blocking,
            status: Status::Initialized,
            start: None,
            end: None,
            retry,
            iterate,
            on,
            when,
            result: Value::Null,
            result_as,
            meta: TaskMeta::default(),
            kind: kind.clone(),
            original_config: raw.clone(),
            body,
            fired_directives: Vec::new(),
        })
    }

    /// Runs this task to completion per the lifecycle contract: `on_start`,
    /// an attempt loop bounded by `retry.max_attempts`, result publication,
    /// and terminal directive collection.
    pub fn run(
        &mut self,
        context: &Context,
        variables: &Mutex<WalkableDict>,
        item: Option<&Value>,
        chain_state: &WalkableDict,
        environment: &Environment,
    ) {
        self.status = Status::Running;
        self.start = Some(Utc::now());
        self.fired_directives.extend(self.on.start.iter().cloned());
        debug!("task `{}` ({}) starting", self.name, self.kind);

        loop {
            if context.is_cancelled() {
                self.status = Status::Terminating;
                break;
            }

            self.meta.attempts += 1;

            if !self.evaluate_when(variables, item, chain_state, environment) {
                self.status = Status::Skipped;
                break;
            }

            match self.body.run(context) {
                Ok(value) => {
                    self.result = value;
                    self.status = Status::Complete;
                    break;
                }
                Err(err) => {
                    warn!(
                        "task `{}` attempt {} failed: {}",
                        self.name, self.meta.attempts, err
                    );
                    self.meta.errors.push(err.clone());

                    let matches_include = self
                        .retry
                        .when_error_like
                        .as_ref()
                        .map_or(true, |re| re.is_match(&err));
                    let matches_exclude = self
                        .retry
                        .when_error_not_like
                        .as_ref()
                        .map_or(false, |re| re.is_match(&err));
                    let attempts_left = self.meta.attempts < self.retry.max_attempts;

                    if matches_include && !matches_exclude && attempts_left {
                        thread::sleep(Duration::from_secs_f64(self.retry.delay_seconds.max(0.0)));
                        continue;
                    }

                    self.status = Status::Error;
                    break;
                }
            }
        }

        if self.status == Status::Complete {
            if let Some(result_as) = self.result_as.clone() {
                let mut vars = variables.lock().expect("variables lock poisoned");
                publish_result(&mut vars, &result_as, &self.result);
            }
        }

        match self.status {
            Status::Complete => self.fired_directives.extend(self.on.complete.iter().cloned()),
            Status::Error => self.fired_directives.extend(self.on.error.iter().cloned()),
            Status::Skipped => self.fired_directives.extend(self.on.skipped.iter().cloned()),
            Status::Terminating | Status::Initialized | Status::Running => {}
        }

        self.end = Some(Utc::now());
        self.meta.duration_ms = self.start.zip(self.end).map(|(s, e)| (e - s).num_milliseconds());
        self.meta.count = result_len(&self.result);

        info!("task `{}` finished with status {:?}", self.name, self.status);
    }

    fn evaluate_when(
        &self,
        variables: &Mutex<WalkableDict>,
        item: Option<&Value>,
        chain_state: &WalkableDict,
        environment: &Environment,
    ) -> bool {
        let expr = match &self.when {
            None => return true,
            Some(expr) => expr,
        };

        let snapshot = variables.lock().expect("variables lock poisoned").clone();
        let scope = Scope {
            variables: &snapshot,
            item,
            chain_state: Some(chain_state),
            environment,
            fail_on_unassigned: false,
        };

        interpolate::replace_references(expr, &scope)
            .map(|v| value_is_true(&v))
            .unwrap_or(false)
    }

    /// Drains and returns the directive configs queued by this run, in the
    /// order `on.start` then the terminal event's directives.
    pub fn take_fired_directives(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.fired_directives)
    }
}

/// Pre-initializes `result_as.name` in `variables` to the empty value its
/// mode accumulates into, before an iterated task's siblings are inserted.
pub fn pre_init_variable(variables: &mut WalkableDict, result_as: &ResultAs) {
    let initial = match result_as.mode {
        ResultMode::Append | ResultMode::Extend => Value::Array(Vec::new()),
        ResultMode::Merge => Value::Object(Map::new()),
        ResultMode::Overwrite => Value::Null,
    };
    variables.assign(&result_as.name, initial);
}

fn publish_result(variables: &mut WalkableDict, result_as: &ResultAs, result: &Value) {
    match result_as.mode {
        ResultMode::Overwrite => variables.assign(&result_as.name, result.clone()),
        ResultMode::Append => {
            let mut arr = match variables.walk(&result_as.name).cloned() {
                Some(Value::Array(a)) => a,
                _ => Vec::new(),
            };
            arr.push(result.clone());
            variables.assign(&result_as.name, Value::Array(arr));
        }
        ResultMode::Extend => {
            let mut arr = match variables.walk(&result_as.name).cloned() {
                Some(Value::Array(a)) => a,
                _ => Vec::new(),
            };
            match result {
                Value::Array(items) => arr.extend(items.clone()),
                other => arr.push(other.clone()),
            }
            variables.assign(&result_as.name, Value::Array(arr));
        }
        ResultMode::Merge => {
            let mut map = match variables.walk(&result_as.name).cloned() {
                Some(Value::Object(m)) => m,
                _ => Map::new(),
            };
            if let Value::Object(m) = result {
                map.extend(m.clone());
            }
            variables.assign(&result_as.name, Value::Object(map));
        }
    }
}

fn value_is_true(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn result_len(value: &Value) -> Option<usize> {
    match value {
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        Value::String(s) => Some(s.chars().count()),
        _ => None,
    }
}

fn parse_retry(value: Option<&Value>) -> Result<RetryPolicy, String> {
    let mut policy = RetryPolicy::default();
    if let Some(obj) = value.and_then(Value::as_object) {
        if let Some(d) = obj.get("delay_seconds").and_then(Value::as_f64) {
            policy.delay_seconds = d;
        }
        if let Some(m) = obj.get("max_attempts").and_then(Value::as_u64) {
            policy.max_attempts = m as u32;
        }
        if let Some(s) = obj.get("when_error_like").and_then(Value::as_str) {
            policy.when_error_like =
                Some(Regex::new(s).map_err(|err| format!("invalid when_error_like regex: {}", err))?);
        }
        if let Some(s) = obj.get("when_error_not_like").and_then(Value::as_str) {
            policy.when_error_not_like = Some(
                Regex::new(s).map_err(|err| format!("invalid when_error_not_like regex: {}", err))?,
            );
        }
    }
    Ok(policy)
}

fn parse_on(value: Option<&Value>) -> OnDirectives {
    let mut on = OnDirectives::default();
    if let Some(obj) = value.and_then(Value::as_object) {
        if let Some(arr) = obj.get("start").and_then(Value::as_array) {
            on.start = arr.clone();
        }
        if let Some(arr) = obj.get("complete").and_then(Value::as_array) {
            on.complete = arr.clone();
        }
        if let Some(arr) = obj.get("error").and_then(Value::as_array) {
            on.error = arr.clone();
        }
        if let Some(arr) = obj.get("skipped").and_then(Value::as_array) {
            on.skipped = arr.clone();
        }
    }
    on
}

/// `result_as` names a chain variable, and is conventionally written the
/// same way a template reference reads it back (`var.out`). References are
/// resolved by stripping the `var.` prefix and walking the tail against
/// `variables` directly (see `interpolate::replace_references`), so the
/// name stored here must be that bare tail or the two would disagree on
/// where the result lives.
fn strip_var_prefix(name: &str) -> String {
    name.strip_prefix("var.").unwrap_or(name).to_owned()
}

fn parse_result_as(value: Option<&Value>) -> Result<Option<ResultAs>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(ResultAs {
            name: strip_var_prefix(s),
            mode: ResultMode::Overwrite,
        })),
        Some(Value::Object(obj)) => {
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| "result_as.name is required".to_owned())?;
            let name = strip_var_prefix(name);
            let mode = match obj.get("mode").and_then(Value::as_str) {
                None | Some("overwrite") => ResultMode::Overwrite,
                Some("append") => ResultMode::Append,
                Some("extend") => ResultMode::Extend,
                Some("merge") => ResultMode::Merge,
                Some(other) => return Err(format!("unknown result_as mode `{}`", other)),
            };
            Ok(Some(ResultAs { name, mode }))
        }
        Some(_) => Err("result_as must be a string or a mapping".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use serde_json::json;

    #[derive(Debug)]
    struct Dummy {
        output: Value,
    }

    impl TaskBody for Dummy {
        fn run(&mut self, _context: &Context) -> Result<Value, String> {
            Ok(self.output.clone())
        }
    }

    #[derive(Debug)]
    struct AlwaysFails;

    impl TaskBody for AlwaysFails {
        fn run(&mut self, _context: &Context) -> Result<Value, String> {
            Err("Transient connection timeout".to_owned())
        }
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.register("dummy", |config| {
            let output = config.get("output").cloned().unwrap_or(Value::Null);
            Ok(Box::new(Dummy { output }) as Box<dyn TaskBody>)
        });
        registry.register("always_fails", |_config| Ok(Box::new(AlwaysFails) as Box<dyn TaskBody>));
        registry
    }

    fn scope<'a>(vars: &'a WalkableDict, env: &'a Environment) -> Scope<'a> {
        Scope {
            variables: vars,
            item: None,
            chain_state: None,
            environment: env,
            fail_on_unassigned: false,
        }
    }

    #[test]
    fn materializes_required_fields() {
        let registry = registry();
        let vars = WalkableDict::new();
        let env = Environment::new();
        let raw = json!({ "dummy": { "name": "t", "output": "hi" } });

        let task = Task::from_template(&raw, &registry, &scope(&vars, &env)).unwrap();
        assert_eq!(task.name, "t");
        assert!(task.blocking);
    }

    #[test]
    fn attempts_is_one_without_retry_policy() {
        let registry = registry();
        let vars = WalkableDict::new();
        let env = Environment::new();
        let raw = json!({ "always_fails": { "name": "t" } });

        let mut task = Task::from_template(&raw, &registry, &scope(&vars, &env)).unwrap();
        let context = Context::new().unwrap();
        let variables = Mutex::new(WalkableDict::new());
        let chain_state = WalkableDict::new();

        task.run(&context, &variables, None, &chain_state, &env);

        assert_eq!(task.status, Status::Error);
        assert_eq!(task.meta.attempts, 1);
    }

    #[test]
    fn retries_until_max_attempts_then_errors() {
        let registry = registry();
        let vars = WalkableDict::new();
        let env = Environment::new();
        let raw = json!({
            "always_fails": {
                "name": "t",
                "retry": { "max_attempts": 3, "delay_seconds": 0.0, "when_error_like": "Transient" }
            }
        });

        let mut task = Task::from_template(&raw, &registry, &scope(&vars, &env)).unwrap();
        let context = Context::new().unwrap();
        let variables = Mutex::new(WalkableDict::new());
        let chain_state = WalkableDict::new();

        task.run(&context, &variables, None, &chain_state, &env);

        assert_eq!(task.status, Status::Error);
        assert_eq!(task.meta.attempts, 3);
        assert_eq!(task.meta.errors.len(), 3);
    }

    #[test]
    fn when_false_skips_the_task() {
        let registry = registry();
        let vars = WalkableDict::new();
        let env = Environment::new();
        let raw = json!({ "dummy": { "name": "t", "output": "hi", "when": "False" } });

        let mut task = Task::from_template(&raw, &registry, &scope(&vars, &env)).unwrap();
        let context = Context::new().unwrap();
        let variables = Mutex::new(WalkableDict::new());
        let chain_state = WalkableDict::new();

        task.run(&context, &variables, None, &chain_state, &env);

        assert_eq!(task.status, Status::Skipped);
        assert_eq!(task.meta.info, None);
    }

    #[test]
    fn result_as_append_accumulates_into_an_array() {
        let registry = registry();
        let vars = WalkableDict::new();
        let env = Environment::new();
        let raw = json!({
            "dummy": { "name": "t", "output": "x", "result_as": { "name": "var.out", "mode": "append" } }
        });

        let mut task = Task::from_template(&raw, &registry, &scope(&vars, &env)).unwrap();
        let context = Context::new().unwrap();
        let variables = Mutex::new(WalkableDict::new());
        let chain_state = WalkableDict::new();

        task.run(&context, &variables, None, &chain_state, &env);
        task.status = Status::Initialized; // allow a second run on the same task for the test
        let mut task2 = Task::from_template(&raw, &registry, &scope(&vars, &env)).unwrap();
        task2.run(&context, &variables, None, &chain_state, &env);

        let result = variables.lock().unwrap();
        assert_eq!(result.walk("out"), Some(&json!(["x", "x"])));
    }
}
