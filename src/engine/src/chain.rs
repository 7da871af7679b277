//! The chain driver: walks a chain's task templates in order, materializing,
//! running, and iterating/branching them, until the template list and the
//! non-blocking task pool are both drained.

use crate::env::Environment;
use crate::error::ChainError;
use crate::interpolate::Scope;
use crate::record::WalkableDict;
use crate::registry::Registry;
use crate::silo::{StatusRecord, StatusSilo};
use crate::status::Status;
use crate::task::{pre_init_variable, Task};
use chain_core::Context;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::pool::Pool;

/// Static configuration a [`Chain`] is built from, loaded directly from a
/// template file's top level.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Value>,
    #[serde(default = "default_variables")]
    pub variables: Value,
    #[serde(default)]
    pub required_variables: Vec<String>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub parent: Option<String>,
}

fn default_name() -> String {
    "chain".to_owned()
}

fn default_variables() -> Value {
    Value::Object(Map::new())
}

fn default_max_workers() -> usize {
    4
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            tasks: Vec::new(),
            variables: default_variables(),
            required_variables: Vec::new(),
            max_workers: default_max_workers(),
            parent: None,
        }
    }
}

/// One entry of the chain's live task-template queue: the templated config,
/// and, when this entry was produced by expanding an `iterate` block, the
/// iteration item it binds and its `<position>/<total>` label.
#[derive(Debug, Clone)]
struct TemplateEntry {
    raw: Value,
    item: Option<Value>,
    iteration_label: Option<(usize, usize)>,
}

impl From<Value> for TemplateEntry {
    fn from(raw: Value) -> Self {
        Self {
            raw,
            item: None,
            iteration_label: None,
        }
    }
}

/// Drives a single chain run to completion.
///
/// A chain's status always ends [`Status::Complete`]; whether the run
/// succeeded is carried by [`Chain::errors`] being empty, not by a distinct
/// terminal failure status. This resolves the source's lifecycle, where a
/// chain is described as reaching `error`/`terminating` but every observed
/// run is reported as `complete` with failures recorded alongside it.
pub struct Chain {
    pub id: String,
    config: ChainConfig,
    registry: Arc<Registry>,
    environment: Arc<Environment>,
    silo: Option<Arc<dyn StatusSilo>>,
    context: Arc<Context>,
    cancellation: Arc<AtomicBool>,
    variables: Arc<Mutex<WalkableDict>>,
    task_templates: Vec<TemplateEntry>,
    position: usize,
    tasks: Vec<Task>,
    pool: Pool,
    pub status: Status,
    pub errors: Vec<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl Chain {
    /// Builds a new chain from `config`, ready to [`Chain::run`].
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Configuration`] if `config.variables` is not a
    /// mapping, or if `config.tasks` is not a sequence of single-key task
    /// templates.
    pub fn new(
        config: ChainConfig,
        registry: Arc<Registry>,
        environment: Arc<Environment>,
        silo: Option<Arc<dyn StatusSilo>>,
    ) -> Result<Self, ChainError> {
        let initial_map = config
            .variables
            .as_object()
            .cloned()
            .ok_or_else(|| ChainError::configuration("chain `variables` must be a mapping"))?;
        let variables = Arc::new(Mutex::new(WalkableDict::from(initial_map)));

        let task_templates = config.tasks.iter().cloned().map(TemplateEntry::from).collect();
        let context = Arc::new(Context::new().map_err(ChainError::configuration)?);
        let cancellation = context.cancellation_handle();
        let max_workers = config.max_workers;

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            config,
            registry,
            environment,
            silo,
            context,
            cancellation,
            variables,
            task_templates,
            position: 0,
            tasks: Vec::new(),
            pool: Pool::new(max_workers),
            status: Status::Initialized,
            errors: Vec::new(),
            start: None,
            end: None,
        })
    }

    /// Requests cooperative termination. Tasks already running observe this
    /// through their shared [`Context`] and stop at their next attempt-loop
    /// boundary; the driver stops dispatching new tasks at its next check.
    pub fn terminate(&self) {
        self.cancellation.store(true, Ordering::SeqCst);
        self.pool.terminate();
    }

    /// Runs the chain to completion, returning its result mapping.
    ///
    /// A malformed required-variable configuration is reported as a
    /// configuration error straight away, without running any tasks, per the
    /// error taxonomy: configuration errors are synchronous and never
    /// subject to retry.
    pub fn run(&mut self) -> Value {
        self.status = Status::Running;
        self.start = Some(Utc::now());
        info!("chain `{}` ({}) starting", self.config.name, self.id);

        if let Err(err) = self.validate_required_variables() {
            self.errors.push(err.to_string());
            self.status = Status::Complete;
            self.end = Some(Utc::now());
            return self.build_result();
        }

        self.publish_status(None);

        'drive: loop {
            while self.position < self.task_templates.len() {
                if self.context.is_cancelled() {
                    break 'drive;
                }
                self.drive_one();
            }

            let finished = self.pool.wait_until_complete();
            if finished.is_empty() {
                break;
            }
            for mut task in finished {
                if task.status == Status::Error {
                    self.errors.push(format!(
                        "{}: {}",
                        task.name,
                        task.meta.errors.last().cloned().unwrap_or_default()
                    ));
                }
                let fired = task.take_fired_directives();
                self.enqueue_directives(fired, None);
                self.tasks.push(task);
            }
        }

        self.status = Status::Complete;
        self.end = Some(Utc::now());
        self.publish_status(None);
        info!(
            "chain `{}` ({}) finished with {} error(s)",
            self.config.name,
            self.id,
            self.errors.len()
        );
        let result = self.build_result();
        self.publish_final_result(&result);
        result
    }

    fn drive_one(&mut self) {
        let entry = self.task_templates[self.position].clone();
        let variables_snapshot = self.variables.lock().expect("variables lock poisoned").clone();
        let chain_state = self.chain_state_snapshot();
        let scope = Scope {
            variables: &variables_snapshot,
            item: entry.item.as_ref(),
            chain_state: Some(&chain_state),
            environment: &self.environment,
            fail_on_unassigned: true,
        };

        let mut task = match Task::from_template(&entry.raw, &self.registry, &scope) {
            Ok(task) => task,
            Err(err) => {
                warn!("chain `{}`: {}", self.config.name, err);
                self.errors.push(err);
                self.position += 1;
                return;
            }
        };

        if let Some((i, n)) = entry.iteration_label {
            task.name = format!("{} - {}/{}", task.name, i, n);
        }

        if entry.iteration_label.is_none() {
            if let Some(iterate) = task.iterate.clone() {
                self.expand_iteration(task, iterate);
                self.position += 1;
                return;
            }
        }

        if task.blocking {
            task.run(
                &self.context,
                &self.variables,
                entry.item.as_ref(),
                &chain_state,
                &self.environment,
            );
            self.publish_status(Some(&task));

            if task.status == Status::Error {
                self.errors.push(format!(
                    "{}: {}",
                    task.name,
                    task.meta.errors.last().cloned().unwrap_or_default()
                ));
            }

            let fired = task.take_fired_directives();
            self.enqueue_directives(fired, Some(self.position));
            self.tasks.push(task);
        } else {
            self.pool.submit(
                task,
                Arc::clone(&self.context),
                Arc::clone(&self.variables),
                entry.item.clone(),
                chain_state,
                Arc::clone(&self.environment),
            );
        }

        self.position += 1;
    }

    /// Expands an `iterate` template into one sibling task per item,
    /// inserted immediately after `self.position` in ascending order, and
    /// records the un-run parent as [`Status::Skipped`].
    fn expand_iteration(&mut self, mut parent: Task, iterate: Value) {
        let items: Vec<Value> = match iterate {
            Value::Array(items) => items,
            other => vec![other],
        };
        let total = items.len();

        if let Some(result_as) = parent.result_as.clone() {
            let mut vars = self.variables.lock().expect("variables lock poisoned");
            pre_init_variable(&mut vars, &result_as);
        }

        parent.status = Status::Skipped;
        parent.meta.info = Some("Task was skipped because it was an iterated task.".to_owned());
        let raw_template = parent.original_config.clone();
        self.tasks.push(parent);

        for (index, item) in items.into_iter().enumerate().rev() {
            self.task_templates.insert(
                self.position + 1,
                TemplateEntry {
                    raw: raw_template.clone(),
                    item: Some(item),
                    iteration_label: Some((index + 1, total)),
                },
            );
        }
    }

    /// Inserts queued directive task templates either immediately after
    /// `insert_at` (a blocking task's directives, preserving chain order) or
    /// at the tail of the queue (a non-blocking task's directives, which
    /// only surface once the pool drains).
    fn enqueue_directives(&mut self, directives: Vec<Value>, insert_at: Option<usize>) {
        match insert_at {
            Some(position) => {
                for (offset, directive) in directives.into_iter().enumerate() {
                    self.task_templates
                        .insert(position + 1 + offset, TemplateEntry::from(directive));
                }
            }
            None => {
                for directive in directives {
                    self.task_templates.push(TemplateEntry::from(directive));
                }
            }
        }
    }

    fn validate_required_variables(&self) -> Result<(), ChainError> {
        let variables = self.variables.lock().expect("variables lock poisoned");
        for name in &self.config.required_variables {
            if variables.walk(name).is_none() {
                return Err(ChainError::configuration(format!(
                    "required variable `{}` is not assigned",
                    name
                )));
            }
        }
        Ok(())
    }

    fn chain_state_snapshot(&self) -> WalkableDict {
        let mut state = WalkableDict::new();
        state.assign("id", json!(self.id));
        state.assign("name", json!(self.config.name));
        state.assign("position", json!(self.position));
        state.assign("total", json!(self.task_templates.len()));
        state.assign("status", json!(format!("{:?}", self.status).to_lowercase()));
        state
    }

    fn publish_status(&self, current: Option<&Task>) {
        let Some(silo) = self.silo.as_ref() else {
            return;
        };

        let record = StatusRecord {
            id: current.map_or_else(|| self.id.clone(), |_| Uuid::new_v4().to_string()),
            parent: self.config.parent.clone(),
            name: current.map_or_else(|| self.config.name.clone(), |t| t.name.clone()),
            kind: current.map_or_else(|| "chain".to_owned(), |t| t.kind.clone()),
            status: current.map_or(self.status, |t| t.status).debug_lowercase(),
            agent: None,
            position: Some(self.position),
            total: Some(self.task_templates.len()),
            start: current.map_or(self.start, |t| t.start),
            end: current.map_or(self.end, |t| t.end),
        };

        let key = StatusRecord::key(self.config.parent.as_deref().unwrap_or(&self.id), &self.id);
        if let Err(err) = silo.publish(&key, &record) {
            warn!("chain `{}`: failed to publish status: {}", self.config.name, err);
        }
    }

    /// Publishes the full result mapping (data/errors/meta/metrics/template)
    /// to the silo on completion, under the same key `publish_status` uses.
    fn publish_final_result(&self, result: &Value) {
        let Some(silo) = self.silo.as_ref() else {
            return;
        };

        let key = StatusRecord::key(self.config.parent.as_deref().unwrap_or(&self.id), &self.id);
        if let Err(err) = silo.publish_result(&key, result) {
            warn!("chain `{}`: failed to publish result: {}", self.config.name, err);
        }
    }

    fn build_result(&self) -> Value {
        let data = self
            .variables
            .lock()
            .expect("variables lock poisoned")
            .clone();

        let errors = if self.errors.is_empty() {
            Value::Null
        } else {
            Value::Array(self.errors.iter().cloned().map(Value::String).collect())
        };

        let mut total_duration_ms: i64 = 0;
        let mut total_count: usize = 0;
        let metrics: Vec<Value> = self
            .tasks
            .iter()
            .map(|t| {
                let duration = t.meta.duration_ms.unwrap_or(0);
                total_duration_ms += duration;
                total_count += t.meta.count.unwrap_or(0);
                json!({
                    "name": t.name,
                    "kind": t.kind,
                    "status": format!("{:?}", t.status).to_lowercase(),
                    "attempts": t.meta.attempts,
                    "duration_ms": t.meta.duration_ms,
                    "count": t.meta.count,
                })
            })
            .chain(std::iter::once(json!({
                "name": "Totals",
                "kind": Value::Null,
                "status": if self.errors.is_empty() { "complete" } else { "error" },
                "attempts": Value::Null,
                "duration_ms": total_duration_ms,
                "count": total_count,
            })))
            .collect();

        let meta = json!({
            "id": self.id,
            "name": self.config.name,
            "start": self.start,
            "end": self.end,
            "status": format!("{:?}", self.status).to_lowercase(),
        });

        json!({
            "data": Value::from(data),
            "errors": errors,
            "meta": meta,
            "metrics": metrics,
            "template": self.config.tasks,
        })
    }
}

trait DebugLowercase {
    fn debug_lowercase(self) -> String;
}

impl DebugLowercase for Status {
    fn debug_lowercase(self) -> String {
        format!("{:?}", self).to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, TaskBody};

    #[derive(Debug)]
    struct Echo;

    impl TaskBody for Echo {
        fn run(&mut self, _context: &Context) -> Result<Value, String> {
            Ok(json!("ok"))
        }
    }

    #[derive(Debug)]
    struct AlwaysFails;

    impl TaskBody for AlwaysFails {
        fn run(&mut self, _context: &Context) -> Result<Value, String> {
            Err("boom".to_owned())
        }
    }

    fn registry() -> Arc<Registry> {
        let registry = Registry::new();
        registry.register("echo", |_config| Ok(Box::new(Echo) as Box<dyn TaskBody>));
        registry.register("always_fails", |_config| Ok(Box::new(AlwaysFails) as Box<dyn TaskBody>));
        Arc::new(registry)
    }

    fn environment() -> Arc<Environment> {
        Arc::new(Environment::new())
    }

    #[test]
    fn empty_task_list_completes_with_no_errors() {
        let config = ChainConfig {
            name: "empty".to_owned(),
            ..ChainConfig::default()
        };
        let mut chain = Chain::new(config, registry(), environment(), None).unwrap();
        let result = chain.run();

        assert_eq!(chain.status, Status::Complete);
        assert_eq!(result["errors"], Value::Null);
    }

    #[test]
    fn successful_chain_has_no_errors() {
        let config = ChainConfig {
            name: "ok".to_owned(),
            tasks: vec![json!({ "echo": { "name": "t1" } })],
            ..ChainConfig::default()
        };
        let mut chain = Chain::new(config, registry(), environment(), None).unwrap();
        let result = chain.run();

        assert_eq!(chain.status, Status::Complete);
        assert_eq!(result["errors"], Value::Null);
    }

    #[test]
    fn failing_task_is_recorded_in_chain_errors() {
        let config = ChainConfig {
            name: "broken".to_owned(),
            tasks: vec![json!({ "always_fails": { "name": "t1" } })],
            ..ChainConfig::default()
        };
        let mut chain = Chain::new(config, registry(), environment(), None).unwrap();
        let _result = chain.run();

        assert_eq!(chain.status, Status::Complete);
        assert_eq!(chain.errors.len(), 1);
    }

    #[test]
    fn iteration_expands_into_ordered_named_siblings() {
        let config = ChainConfig {
            name: "iter".to_owned(),
            tasks: vec![json!({
                "echo": { "name": "t", "iterate": [1, 2, 3] }
            })],
            ..ChainConfig::default()
        };
        let mut chain = Chain::new(config, registry(), environment(), None).unwrap();
        chain.run();

        let names: Vec<&str> = chain.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["t", "t - 1/3", "t - 2/3", "t - 3/3"]
        );
        assert_eq!(chain.tasks[0].status, Status::Skipped);
    }

    #[test]
    fn missing_required_variable_fails_fast_without_running_tasks() {
        let config = ChainConfig {
            name: "needs-var".to_owned(),
            tasks: vec![json!({ "echo": { "name": "t1" } })],
            required_variables: vec!["region".to_owned()],
            ..ChainConfig::default()
        };
        let mut chain = Chain::new(config, registry(), environment(), None).unwrap();
        let result = chain.run();

        assert_eq!(chain.errors.len(), 1);
        assert!(chain.tasks.is_empty());
        assert_ne!(result["errors"], Value::Null);
    }

    #[test]
    fn non_blocking_tasks_fan_out_through_the_pool() {
        let config = ChainConfig {
            name: "fan-out".to_owned(),
            tasks: vec![
                json!({ "echo": { "name": "t1", "blocking": false } }),
                json!({ "echo": { "name": "t2", "blocking": false } }),
            ],
            max_workers: 2,
            ..ChainConfig::default()
        };
        let mut chain = Chain::new(config, registry(), environment(), None).unwrap();
        chain.run();

        assert_eq!(chain.tasks.len(), 2);
        assert!(chain.tasks.iter().all(|t| t.status == Status::Complete));
    }

    #[test]
    fn variables_interpolate_between_tasks() {
        let config = ChainConfig {
            name: "vars".to_owned(),
            tasks: vec![json!({ "echo": { "name": "t1", "result_as": "var.out" } })],
            ..ChainConfig::default()
        };
        let mut chain = Chain::new(config, registry(), environment(), None).unwrap();
        let result = chain.run();

        assert_eq!(result["data"]["out"], json!("ok"));
    }

    #[test]
    fn terminate_stops_the_driver_before_remaining_tasks_run() {
        let config = ChainConfig {
            name: "terminated".to_owned(),
            tasks: vec![
                json!({ "echo": { "name": "t1" } }),
                json!({ "echo": { "name": "t2" } }),
            ],
            ..ChainConfig::default()
        };
        let mut chain = Chain::new(config, registry(), environment(), None).unwrap();
        chain.terminate();
        chain.run();

        assert_eq!(chain.status, Status::Complete);
        assert!(chain.tasks.len() <= 2);
    }
}
