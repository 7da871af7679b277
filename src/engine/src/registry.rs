//! The task registry and factory: maps a template's task-kind key to a
//! constructor, and builds a [`TaskBody`] from a templated configuration.
//!
//! The teacher's `impl_processors!` macro generates a closed, compile-time
//! enum of task kinds. Because plugin discovery (dynamically loading task
//! kinds) is out of scope for this engine, but a fixed, workspace-wide macro
//! edit for every new kind is not in the spirit of a registry, this is
//! generalized into an open, runtime map: any crate that links against
//! `chain-engine` can call [`Registry::register`] at startup.

use chain_core::{Context, TaskMethod};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// The object-safe seam every task kind implements.
///
/// This mirrors [`chain_core::TaskMethod`] but erases its associated types
/// to a JSON `Value` and a `String` error, so that task kinds can be stored
/// behind a single trait object in the registry and on a [`crate::task::Task`].
pub trait TaskBody: fmt::Debug + Send {
    /// Runs the task body, returning its result as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns a message describing why the task could not complete.
    fn run(&mut self, context: &Context) -> Result<Value, String>;

    /// Validates the task body's configuration. The default always
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns a message describing why the configuration is invalid.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// A constructor that builds a boxed [`TaskBody`] from its templated
/// configuration object.
type Constructor = Box<dyn Fn(Value) -> Result<Box<dyn TaskBody>, String> + Send + Sync>;

/// Maps registered task-kind names to their constructors.
///
/// Construct one explicitly and pass it to a [`crate::chain::Chain`], rather
/// than reaching for a process-wide global, per the design note on
/// preferring explicit construction over global lookup (this keeps tests
/// free to substitute a registry with only the kinds they need).
#[derive(Default)]
pub struct Registry {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .constructors
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("Registry").field("kinds", &names).finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task kind under `name`.
    pub fn register(
        &self,
        name: impl Into<String>,
        constructor: impl Fn(Value) -> Result<Box<dyn TaskBody>, String> + Send + Sync + 'static,
    ) {
        self.constructors
            .write()
            .expect("registry lock poisoned")
            .insert(name.into(), Box::new(constructor));
    }

    /// Builds a task body for `name` from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is not a registered task kind, or if the
    /// constructor itself rejects `config`.
    pub fn build(&self, name: &str, config: Value) -> Result<Box<dyn TaskBody>, String> {
        let constructors = self.constructors.read().expect("registry lock poisoned");
        let constructor = constructors
            .get(name)
            .ok_or_else(|| format!("no task kind registered for `{}`", name))?;
        constructor(config)
    }

    /// True if `name` has a registered constructor.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors
            .read()
            .map(|c| c.contains_key(name))
            .unwrap_or(false)
    }
}

/// Bridges a strongly-typed [`chain_core::TaskMethod`] into the
/// object-erased [`TaskBody`] seam the registry and [`crate::task::Task`]
/// actually hold, so task kinds can be written the same way the teacher's
/// processors were: a plain struct with its own `Error`/`Output` types.
#[derive(Debug)]
pub struct MethodAdapter<T>(pub T);

impl<T> TaskBody for MethodAdapter<T>
where
    T: TaskMethod + fmt::Debug + Send,
{
    fn run(&mut self, context: &Context) -> Result<Value, String> {
        let output = self.0.run(context).map_err(|err| err.to_string())?;
        serde_json::to_value(output).map_err(|err| err.to_string())
    }

    fn validate(&self) -> Result<(), String> {
        self.0.validate().map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dummy;

    impl TaskBody for Dummy {
        fn run(&mut self, _context: &Context) -> Result<Value, String> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn build_unknown_kind_errors() {
        let registry = Registry::new();
        assert!(registry.build("missing", Value::Null).is_err());
    }

    #[test]
    fn register_then_build_succeeds() {
        let registry = Registry::new();
        registry.register("dummy", |_config| Ok(Box::new(Dummy)));
        assert!(registry.contains("dummy"));
        assert!(registry.build("dummy", Value::Null).is_ok());
    }

    #[derive(Debug)]
    struct Method;

    impl std::error::Error for MethodError {}
    impl fmt::Display for MethodError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "method failed")
        }
    }

    #[derive(Debug)]
    struct MethodError;

    impl chain_core::TaskMethod for Method {
        const NAME: &'static str = "method";
        type Error = MethodError;
        type Output = String;

        fn run(&mut self, _context: &Context) -> Result<Self::Output, Self::Error> {
            Ok("hi".to_owned())
        }
    }

    #[test]
    fn method_adapter_bridges_task_method_into_task_body() {
        let mut adapter = MethodAdapter(Method);
        let context = Context::new().unwrap();
        assert_eq!(adapter.run(&context).unwrap(), Value::String("hi".to_owned()));
    }
}
