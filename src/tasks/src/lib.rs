//! # chain-tasks
//!
//! Built-in task kinds: [`DummyTask`], [`PrintTask`], [`DelayTask`],
//! [`WaitTask`], [`SetVariableTask`], [`DataSetTask`], and
//! [`ShellCommandTask`]. Each implements [`chain_core::TaskMethod`] the way
//! the teacher's processor crates do, and [`register_all`] bridges each one
//! into a [`chain_engine::Registry`] via [`chain_engine::MethodAdapter`].

#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::pedantic,
    rust_2018_idioms,
    warnings
)]
#![allow(clippy::multiple_crate_versions)]

use chain_core::{Context, TaskMethod};
use chain_engine::dataset::{CastAs, DataSet};
use chain_engine::filter::{Accepted, Filter};
use chain_engine::matching::{MatchSet, MatchSetGroup};
use chain_engine::record::WalkableDict;
use chain_engine::{MethodAdapter, Registry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use std::{env, error, fmt, io, path, thread};

/// Registers every built-in task kind under its template key (`dummy`,
/// `print`, `delay`, `wait`, `set_variable`, `dataset`, `shell_command`).
pub fn register_all(registry: &Registry) {
    registry.register("dummy", |config| {
        let task: DummyTask = serde_json::from_value(config).map_err(|err| err.to_string())?;
        Ok(Box::new(MethodAdapter(task)))
    });
    registry.register("print", |config| {
        let task: PrintTask = serde_json::from_value(config).map_err(|err| err.to_string())?;
        Ok(Box::new(MethodAdapter(task)))
    });
    registry.register("delay", |config| {
        let task: DelayTask = serde_json::from_value(config).map_err(|err| err.to_string())?;
        Ok(Box::new(MethodAdapter(task)))
    });
    registry.register("wait", |config| {
        let task: WaitTask = serde_json::from_value(config).map_err(|err| err.to_string())?;
        Ok(Box::new(MethodAdapter(task)))
    });
    registry.register("set_variable", |config| {
        let task: SetVariableTask = serde_json::from_value(config).map_err(|err| err.to_string())?;
        Ok(Box::new(MethodAdapter(task)))
    });
    registry.register("dataset", |config| {
        let task: DataSetTask = serde_json::from_value(config).map_err(|err| err.to_string())?;
        Ok(Box::new(MethodAdapter(task)))
    });
    registry.register("shell_command", |config| {
        let task: ShellCommandTask = serde_json::from_value(config).map_err(|err| err.to_string())?;
        Ok(Box::new(MethodAdapter(task)))
    });
}

/// This is an enum without a variant, and can therefore never exist as a
/// value at runtime. Used to statically prove that a task kind's `run` and
/// `validate` are infallible.
#[derive(Clone, Copy, Debug)]
#[allow(clippy::empty_enum)]
pub enum Void {}

impl fmt::Display for Void {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

impl error::Error for Void {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {}
    }
}

/// A task kind used to exercise and demonstrate the chain engine: returns a
/// configured output, optionally failing its first `fail_times` attempts
/// with a configured error message, to exercise a task's retry policy
/// without shelling out to anything.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DummyTask {
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub fail_times: u32,
    #[serde(default)]
    pub fail_message: Option<String>,
    #[serde(skip, default)]
    attempted: u32,
}

impl TaskMethod for DummyTask {
    const NAME: &'static str = "Dummy";

    type Error = DummyError;
    type Output = Value;

    fn run(&mut self, _context: &Context) -> Result<Self::Output, Self::Error> {
        if self.attempted < self.fail_times {
            self.attempted += 1;
            return Err(DummyError(
                self.fail_message.clone().unwrap_or_else(|| "dummy task failure".to_owned()),
            ));
        }
        Ok(self.output.clone())
    }
}

/// The error [`DummyTask`] raises while its configured `fail_times` has not
/// yet been exhausted.
#[derive(Debug)]
pub struct DummyError(String);

impl fmt::Display for DummyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for DummyError {}

/// Prints a string output, mirroring the teacher's `PrintOutput` processor.
/// If the input value is an empty string, `None` is returned instead of
/// `Some("")`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrintTask {
    pub output: String,
}

impl TaskMethod for PrintTask {
    const NAME: &'static str = "Print";

    type Error = Void;
    type Output = Option<String>;

    fn run(&mut self, _context: &Context) -> Result<Self::Output, Self::Error> {
        Ok(match self.output.as_str() {
            "" => None,
            s => Some(s.to_owned()),
        })
    }
}

/// Sleeps for `seconds`, checking the chain's cooperative cancellation flag
/// every 100 milliseconds so a terminated chain does not keep a worker
/// thread blocked for the task's full duration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelayTask {
    pub seconds: f64,
}

impl TaskMethod for DelayTask {
    const NAME: &'static str = "Delay";

    type Error = Void;
    type Output = ();

    fn run(&mut self, context: &Context) -> Result<Self::Output, Self::Error> {
        sleep_cooperatively(Duration::from_secs_f64(self.seconds.max(0.0)), context);
        Ok(())
    }
}

/// Polls a shell command until it exits successfully, up to `timeout_seconds`,
/// sleeping `interval_seconds` between attempts. Unlike [`DelayTask`], this
/// waits for an external condition rather than a fixed duration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaitTask {
    pub command: String,
    #[serde(default)]
    pub arguments: Option<Vec<String>>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,
    pub timeout_seconds: f64,
}

fn default_interval_seconds() -> f64 {
    1.0
}

impl TaskMethod for WaitTask {
    const NAME: &'static str = "Wait";

    type Error = WaitError;
    type Output = ();

    fn run(&mut self, context: &Context) -> Result<Self::Output, Self::Error> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.timeout_seconds.max(0.0));
        let arguments = self.arguments.clone().unwrap_or_default();

        loop {
            if context.is_cancelled() {
                return Ok(());
            }

            let status = Command::new(&self.command)
                .args(&arguments)
                .current_dir(context.workspace_path())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map_err(|err| WaitError(err.to_string()))?;

            if status.success() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(WaitError(format!(
                    "condition `{}` did not succeed within {}s",
                    self.command, self.timeout_seconds
                )));
            }

            sleep_cooperatively(Duration::from_secs_f64(self.interval_seconds.max(0.0)), context);
        }
    }
}

/// The error [`WaitTask`] raises on timeout or when the polled command
/// cannot be executed at all.
#[derive(Debug)]
pub struct WaitError(String);

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for WaitError {}

/// Sleeps in short increments so a cooperative cancellation request is
/// observed promptly rather than after the task's full duration.
fn sleep_cooperatively(total: Duration, context: &Context) {
    const TICK: Duration = Duration::from_millis(100);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if context.is_cancelled() {
            return;
        }
        let this_tick = remaining.min(TICK);
        thread::sleep(this_tick);
        remaining -= this_tick;
    }
}

/// Assigns a literal configured value. Combined with `result_as`, this is
/// how a chain template sets a variable without running any real side
/// effect.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetVariableTask {
    pub value: Value,
}

impl TaskMethod for SetVariableTask {
    const NAME: &'static str = "Set Variable";

    type Error = Void;
    type Output = Value;

    fn run(&mut self, _context: &Context) -> Result<Self::Output, Self::Error> {
        Ok(self.value.clone())
    }
}

/// Loads a literal list of records into a [`DataSet`], casts a configured
/// set of keys, and runs it through a [`Filter`], returning the filtered
/// records (and, if requested, their count).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataSetTask {
    pub records: Vec<Value>,
    #[serde(default)]
    pub cast: Vec<(String, String)>,
    #[serde(default)]
    pub add_keys: Vec<(String, Value)>,
    #[serde(default)]
    pub exclude_keys: Vec<String>,
    #[serde(default)]
    pub headers: Option<Vec<String>>,
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub sort: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub count: bool,
}

impl TaskMethod for DataSetTask {
    const NAME: &'static str = "Data Set";

    type Error = DataSetError;
    type Output = Value;

    fn run(&mut self, _context: &Context) -> Result<Self::Output, Self::Error> {
        let mut data = DataSet::new();
        data.add_records(self.records.iter().cloned().map(to_record));

        for (key, cast_as) in &self.cast {
            data.cast_key(key, parse_cast_as(cast_as)?, None);
        }

        let matches = MatchSet::parse(&self.matches).map_err(DataSetError)?;
        let filter = Filter {
            add_keys: self.add_keys.clone(),
            exclude_keys: self.exclude_keys.clone(),
            headers: self.headers.clone(),
            matches: MatchSetGroup(vec![matches]),
            sort: self.sort.clone(),
            limit: self.limit,
            count: self.count,
        };

        let result = filter.apply(data, &Accepted::all());
        let records: Vec<Value> = result
            .data
            .records()
            .iter()
            .map(|r| Value::Object(r.as_map().clone()))
            .collect();

        Ok(match result.count {
            Some(count) => serde_json::json!({ "records": records, "count": count }),
            None => Value::Array(records),
        })
    }
}

fn parse_cast_as(name: &str) -> Result<CastAs, DataSetError> {
    match name {
        "bool" => Ok(CastAs::Bool),
        "number" => Ok(CastAs::Number),
        "string" => Ok(CastAs::String),
        "null" => Ok(CastAs::Null),
        other => Err(DataSetError(format!(
            "unknown cast target `{}`; expected one of bool, number, string, null",
            other
        ))),
    }
}

fn to_record(value: Value) -> WalkableDict {
    match value {
        Value::Object(map) => WalkableDict::from(map),
        _ => WalkableDict::new(),
    }
}

/// The error [`DataSetTask`] raises when its `matches` syntax fails to
/// parse.
#[derive(Debug)]
pub struct DataSetError(String);

impl fmt::Display for DataSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for DataSetError {}

/// Executes a shell command in the chain's workspace, grounded directly on
/// the teacher's `ShellCommand` processor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShellCommandTask {
    pub command: String,
    pub arguments: Option<Vec<String>>,
    pub stdin: Option<String>,
    pub cwd: Option<String>,
    pub paths: Option<Vec<String>>,
}

impl ShellCommandTask {
    fn validate_paths(&self) -> Result<(), ShellCommandError> {
        fn check_path(candidate: &str) -> Result<(), ShellCommandError> {
            path::Path::new(candidate)
                .components()
                .try_for_each(|c| match c {
                    path::Component::Normal(_) => Ok(()),
                    _ => Err(ShellCommandError::Path(
                        "only sibling or child paths are accessible".to_owned(),
                    )),
                })
        }

        if let Some(cwd) = &self.cwd {
            check_path(cwd)?;
        }
        if let Some(paths) = &self.paths {
            paths.iter().map(String::as_str).try_for_each(check_path)?;
        }
        Ok(())
    }
}

impl TaskMethod for ShellCommandTask {
    const NAME: &'static str = "Shell Command";

    type Error = ShellCommandError;
    type Output = Option<String>;

    fn validate(&self) -> Result<(), Self::Error> {
        self.validate_paths()
    }

    fn run(&mut self, context: &Context) -> Result<Self::Output, Self::Error> {
        self.validate_paths()?;

        let arguments: Vec<&str> = match &self.arguments {
            None => vec![],
            Some(v) => v.iter().map(String::as_str).collect(),
        };

        let workspace = context.workspace_path();
        let cwd = workspace.join(path::Path::new(self.cwd.as_deref().unwrap_or("")));

        let new_paths: Vec<std::path::PathBuf> = match &self.paths {
            None => vec![],
            Some(paths) => paths.iter().map(|p| workspace.join(p)).collect(),
        };

        let path = match env::var_os("PATH") {
            Some(p) => env::split_paths(&p).chain(new_paths).collect(),
            None => new_paths,
        };

        let mut command = Command::new(&self.command);
        let command = command
            .current_dir(cwd)
            .env("PATH", env::join_paths(path)?)
            .args(arguments);

        let output = if let Some(input) = &self.stdin {
            let mut spawn = command
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            spawn
                .stdin
                .as_mut()
                .expect("stdin was requested")
                .write_all(input.as_bytes())?;
            spawn.wait_with_output()
        } else {
            command.output()
        }?;

        if !output.status.success() {
            if output.stderr.is_empty() {
                return Err(ShellCommandError::Command(
                    "unknown error during command execution".to_owned(),
                ));
            }
            return Err(ShellCommandError::Command(
                String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
            ));
        }

        if output.stdout.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim_end().to_owned(),
        ))
    }
}

/// Represents all the ways [`ShellCommandTask`] can fail. Not intended to be
/// exhaustively matched; new variants may be added without a major version
/// bump.
#[derive(Debug)]
pub enum ShellCommandError {
    /// The command ran and returned a non-zero exit code; the string is its
    /// _stderr_ output.
    Command(String),

    /// An I/O operation failed.
    Io(io::Error),

    /// The configured `cwd` or `paths` escaped the task's workspace.
    Path(String),

    #[doc(hidden)]
    __Unknown,
}

impl fmt::Display for ShellCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellCommandError::Command(err) => write!(f, "command error: {}", err),
            ShellCommandError::Io(err) => write!(f, "IO error: {}", err),
            ShellCommandError::Path(err) => write!(f, "path error: {}", err),
            ShellCommandError::__Unknown => unreachable!(),
        }
    }
}

impl error::Error for ShellCommandError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ShellCommandError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ShellCommandError {
    fn from(err: io::Error) -> Self {
        ShellCommandError::Io(err)
    }
}

impl From<env::JoinPathsError> for ShellCommandError {
    fn from(err: env::JoinPathsError) -> Self {
        ShellCommandError::Path(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_task_empty_output_is_none() {
        let mut task = PrintTask { output: String::new() };
        let context = Context::new().unwrap();
        assert_eq!(task.run(&context).unwrap(), None);
    }

    #[test]
    fn print_task_string_output() {
        let mut task = PrintTask { output: "hello".to_owned() };
        let context = Context::new().unwrap();
        assert_eq!(task.run(&context).unwrap(), Some("hello".to_owned()));
    }

    #[test]
    fn dummy_task_fails_configured_number_of_times_then_succeeds() {
        let mut task = DummyTask {
            output: Value::String("done".to_owned()),
            fail_times: 2,
            fail_message: None,
            attempted: 0,
        };
        let context = Context::new().unwrap();

        assert!(task.run(&context).is_err());
        assert!(task.run(&context).is_err());
        assert_eq!(task.run(&context).unwrap(), Value::String("done".to_owned()));
    }

    #[test]
    fn set_variable_task_returns_its_configured_value() {
        let mut task = SetVariableTask { value: serde_json::json!({"region": "us-east-1"}) };
        let context = Context::new().unwrap();
        assert_eq!(task.run(&context).unwrap(), serde_json::json!({"region": "us-east-1"}));
    }

    #[test]
    fn shell_command_task_rejects_path_traversal() {
        let task = ShellCommandTask {
            command: "echo".to_owned(),
            arguments: None,
            stdin: None,
            cwd: Some("../etc".to_owned()),
            paths: None,
        };
        assert!(task.validate().is_err());
    }

    #[test]
    fn shell_command_task_runs_a_command() {
        let mut task = ShellCommandTask {
            command: "echo".to_owned(),
            arguments: Some(vec!["hello".to_owned()]),
            stdin: None,
            cwd: None,
            paths: None,
        };
        let context = Context::new().unwrap();
        assert_eq!(task.run(&context).unwrap(), Some("hello".to_owned()));
    }

    #[test]
    fn dataset_task_filters_and_sorts_records() {
        let mut task = DataSetTask {
            records: vec![
                serde_json::json!({"name": "B"}),
                serde_json::json!({"name": "A"}),
            ],
            cast: Vec::new(),
            add_keys: Vec::new(),
            exclude_keys: Vec::new(),
            headers: None,
            matches: Vec::new(),
            sort: vec!["name".to_owned()],
            limit: None,
            count: false,
        };
        let context = Context::new().unwrap();
        let result = task.run(&context).unwrap();
        assert_eq!(result[0]["name"], serde_json::json!("A"));
        assert_eq!(result[1]["name"], serde_json::json!("B"));
    }

    #[test]
    fn register_all_registers_every_kind() {
        let registry = Registry::new();
        register_all(&registry);
        for kind in [
            "dummy",
            "print",
            "delay",
            "wait",
            "set_variable",
            "dataset",
            "shell_command",
        ] {
            assert!(registry.contains(kind), "missing kind `{}`", kind);
        }
    }

    #[test]
    fn delay_task_is_interrupted_by_cancellation() {
        let task = DelayTask { seconds: 5.0 };
        let context = Context::new().unwrap();
        let handle = context.cancellation_handle();
        handle.store(true, Ordering::SeqCst);

        let start = Instant::now();
        let mut task = task;
        task.run(&context).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
