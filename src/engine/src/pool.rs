//! The non-blocking task pool: dispatches queued tasks onto worker threads,
//! bounded by `max_workers`, and collects their results for the chain driver
//! to drain on its next pass.
//!
//! Grounded on the teacher's `Worker::run_to_completion` supervisor loop
//! (poll, dispatch, sleep-on-idle), generalized from one job at a time to a
//! bounded-concurrency pool of chain tasks.

use crate::env::Environment;
use crate::record::WalkableDict;
use crate::task::Task;
use chain_core::Context;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A task queued for dispatch, together with everything its thread needs to
/// run independently of the chain that submitted it.
struct PendingTask {
    task: Task,
    context: Arc<Context>,
    variables: Arc<Mutex<WalkableDict>>,
    item: Option<Value>,
    chain_state: WalkableDict,
    environment: Arc<Environment>,
}

/// A bounded-concurrency pool of non-blocking tasks.
///
/// Tasks are submitted with [`Pool::submit`] and run on their own thread once
/// a worker slot is free. Rather than polling `JoinHandle::is_finished`, each
/// worker thread decrements the shared active count and pushes its finished
/// [`Task`] onto a shared completed queue itself, right before it exits.
pub struct Pool {
    max_workers: usize,
    active: Arc<AtomicUsize>,
    pending: Mutex<VecDeque<PendingTask>>,
    complete: Arc<Mutex<Vec<Task>>>,
    terminating: Arc<AtomicBool>,
}

impl Pool {
    /// Creates a pool that runs at most `max_workers` tasks concurrently.
    /// `0` is treated as `1`, so a misconfigured pool still makes progress.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            active: Arc::new(AtomicUsize::new(0)),
            pending: Mutex::new(VecDeque::new()),
            complete: Arc::new(Mutex::new(Vec::new())),
            terminating: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queues `task` for dispatch, and immediately dispatches it if a worker
    /// slot is free.
    pub fn submit(
        &self,
        task: Task,
        context: Arc<Context>,
        variables: Arc<Mutex<WalkableDict>>,
        item: Option<Value>,
        chain_state: WalkableDict,
        environment: Arc<Environment>,
    ) {
        self.pending.lock().expect("pool lock poisoned").push_back(PendingTask {
            task,
            context,
            variables,
            item,
            chain_state,
            environment,
        });
        self.dispatch();
    }

    /// Spawns queued tasks onto worker threads until either the queue is
    /// empty or every worker slot is occupied.
    pub fn dispatch(&self) {
        loop {
            if self.active.load(Ordering::SeqCst) >= self.max_workers {
                break;
            }
            let next = self.pending.lock().expect("pool lock poisoned").pop_front();
            match next {
                Some(pending) => self.spawn(pending),
                None => break,
            }
        }
    }

    fn spawn(&self, pending: PendingTask) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        let complete = Arc::clone(&self.complete);

        thread::spawn(move || {
            let PendingTask {
                mut task,
                context,
                variables,
                item,
                chain_state,
                environment,
            } = pending;

            task.run(&context, &variables, item.as_ref(), &chain_state, &environment);

            complete.lock().expect("pool lock poisoned").push(task);
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// The number of tasks currently running on a worker thread.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// True while any task is running or still queued.
    pub fn has_outstanding(&self) -> bool {
        self.active_count() > 0 || !self.pending.lock().expect("pool lock poisoned").is_empty()
    }

    /// Drains and returns every task that has finished since the last call.
    pub fn take_completed(&self) -> Vec<Task> {
        std::mem::take(&mut *self.complete.lock().expect("pool lock poisoned"))
    }

    /// Blocks the calling thread, dispatching and draining, until every
    /// submitted task has finished. Returns every task that finished during
    /// the wait.
    pub fn wait_until_complete(&self) -> Vec<Task> {
        let mut finished = Vec::new();
        loop {
            self.dispatch();
            finished.extend(self.take_completed());
            if !self.has_outstanding() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        finished
    }

    /// Marks the pool as terminating. Already-spawned tasks observe
    /// cancellation through their shared [`Context`]; this only stops new
    /// dispatch from treating the pool as healthy.
    pub fn terminate(&self) {
        self.terminating.store(true, Ordering::SeqCst);
    }

    /// True once [`Pool::terminate`] has been called.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, TaskBody};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[derive(Debug)]
    struct Sleepy {
        millis: u64,
        concurrent: Arc<StdAtomicUsize>,
        max_observed: Arc<StdAtomicUsize>,
    }

    impl TaskBody for Sleepy {
        fn run(&mut self, _context: &Context) -> Result<Value, String> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(self.millis));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    fn make_task(name: &str, registry: &Registry) -> Task {
        use crate::env::Environment;
        use crate::interpolate::Scope;

        let vars = WalkableDict::new();
        let env = Environment::new();
        let scope = Scope {
            variables: &vars,
            item: None,
            chain_state: None,
            environment: &env,
            fail_on_unassigned: false,
        };
        let raw = json!({ "sleepy": { "name": name } });
        Task::from_template(&raw, registry, &scope).unwrap()
    }

    #[test]
    fn respects_max_workers_concurrency_bound() {
        let concurrent = Arc::new(StdAtomicUsize::new(0));
        let max_observed = Arc::new(StdAtomicUsize::new(0));

        let registry = Registry::new();
        {
            let concurrent = Arc::clone(&concurrent);
            let max_observed = Arc::clone(&max_observed);
            registry.register("sleepy", move |_config| {
                Ok(Box::new(Sleepy {
                    millis: 30,
                    concurrent: Arc::clone(&concurrent),
                    max_observed: Arc::clone(&max_observed),
                }) as Box<dyn TaskBody>)
            });
        }

        let pool = Pool::new(2);
        let context = Arc::new(Context::new().unwrap());
        let variables = Arc::new(Mutex::new(WalkableDict::new()));
        let environment = Arc::new(Environment::new());

        for i in 0..4 {
            let task = make_task(&format!("t{}", i), &registry);
            pool.submit(
                task,
                Arc::clone(&context),
                Arc::clone(&variables),
                None,
                WalkableDict::new(),
                Arc::clone(&environment),
            );
        }

        let finished = pool.wait_until_complete();
        assert_eq!(finished.len(), 4);
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn has_outstanding_is_false_once_drained() {
        let registry = Registry::new();
        registry.register("sleepy", |_config| {
            Ok(Box::new(Sleepy {
                millis: 0,
                concurrent: Arc::new(StdAtomicUsize::new(0)),
                max_observed: Arc::new(StdAtomicUsize::new(0)),
            }) as Box<dyn TaskBody>)
        });

        let pool = Pool::new(1);
        let context = Arc::new(Context::new().unwrap());
        let variables = Arc::new(Mutex::new(WalkableDict::new()));
        let environment = Arc::new(Environment::new());

        let task = make_task("only", &registry);
        pool.submit(
            task,
            context,
            variables,
            None,
            WalkableDict::new(),
            environment,
        );

        pool.wait_until_complete();
        assert!(!pool.has_outstanding());
    }
}
