//! Isolated execution of user-defined rule bodies
//!
//! Rule bodies are CEL expressions. They see two variables, `value` and
//! `args`, and nothing of the host. Every compile and evaluation runs on a
//! dedicated worker thread and the caller waits at most the configured
//! budget. A worker that overruns is abandoned and a fresh one is started on
//! the next request; scripts recompile lazily on the new worker.

use cel_interpreter::objects::Value as CelValue;
use cel_interpreter::{Context, Program};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::convert::{args_to_cel, json_to_cel};
use crate::config::SandboxConfig;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("evaluation error: {0}")]
    Evaluate(String),

    #[error("rule did not produce a boolean")]
    NonBoolean,

    #[error("exceeded time budget of {0:?}")]
    Timeout(Duration),

    #[error("sandbox worker stopped unexpectedly")]
    WorkerGone,

    #[error("failed to start sandbox worker: {0}")]
    Spawn(String),
}

/// Compiled rule body, valid for the executor that produced it
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    id: u64,
    source: Arc<str>,
}

impl ScriptHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// An interpreter living on the sandbox worker thread
///
/// `id` identifies a script across calls; `source` is always passed along so
/// an interpreter that never saw the id can compile it on demand.
pub trait ScriptSandbox {
    fn compile(&mut self, id: u64, source: &str) -> Result<(), SandboxError>;

    fn evaluate(
        &mut self,
        id: u64,
        source: &str,
        value: &Value,
        args: &[Value],
    ) -> Result<bool, SandboxError>;
}

/// CEL interpreter
#[derive(Default)]
pub struct CelSandbox {
    programs: HashMap<u64, Program>,
}

impl CelSandbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScriptSandbox for CelSandbox {
    fn compile(&mut self, id: u64, source: &str) -> Result<(), SandboxError> {
        let program =
            Program::compile(source).map_err(|e| SandboxError::Compile(format!("{:?}", e)))?;
        self.programs.insert(id, program);
        Ok(())
    }

    fn evaluate(
        &mut self,
        id: u64,
        source: &str,
        value: &Value,
        args: &[Value],
    ) -> Result<bool, SandboxError> {
        if !self.programs.contains_key(&id) {
            self.compile(id, source)?;
        }
        let program = self
            .programs
            .get(&id)
            .ok_or_else(|| SandboxError::Compile(format!("script {id} is not compiled")))?;

        let mut context = Context::default();
        context.add_variable_from_value("value", json_to_cel(value));
        context.add_variable_from_value("args", args_to_cel(args));

        match program.execute(&context) {
            Ok(CelValue::Bool(holds)) => Ok(holds),
            Ok(_) => Err(SandboxError::NonBoolean),
            Err(e) => Err(SandboxError::Evaluate(format!("{:?}", e))),
        }
    }
}

type Factory = Arc<dyn Fn() -> Box<dyn ScriptSandbox> + Send + Sync>;

enum Job {
    Compile {
        id: u64,
        source: Arc<str>,
        reply: mpsc::Sender<Result<(), SandboxError>>,
    },
    Evaluate {
        id: u64,
        source: Arc<str>,
        value: Value,
        args: Vec<Value>,
        reply: mpsc::Sender<Result<bool, SandboxError>>,
    },
}

struct Worker {
    jobs: mpsc::Sender<Job>,
    serial: u64,
}

/// Runs scripts on a worker thread under time budgets
pub struct SandboxExecutor {
    factory: Factory,
    worker: Mutex<Option<Worker>>,
    config: SandboxConfig,
    next_script: AtomicU64,
    next_worker: AtomicU64,
}

impl SandboxExecutor {
    /// Executor backed by [`CelSandbox`]
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_factory(config, || Box::new(CelSandbox::new()))
    }

    /// Executor backed by any interpreter; `factory` runs on the worker thread
    pub fn with_factory<F>(config: SandboxConfig, factory: F) -> Self
    where
        F: Fn() -> Box<dyn ScriptSandbox> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            worker: Mutex::new(None),
            config,
            next_script: AtomicU64::new(1),
            next_worker: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compile a rule body within the compile budget
    pub fn compile(&self, source: &str) -> Result<ScriptHandle, SandboxError> {
        let handle = ScriptHandle {
            id: self.next_script.fetch_add(1, Ordering::Relaxed),
            source: Arc::from(source),
        };

        let (reply, result) = mpsc::channel();
        self.run(
            Job::Compile {
                id: handle.id,
                source: Arc::clone(&handle.source),
                reply,
            },
            result,
            self.config.compile_budget(),
        )?;

        Ok(handle)
    }

    /// Evaluate a compiled rule body within the evaluation budget
    pub fn evaluate(
        &self,
        handle: &ScriptHandle,
        value: &Value,
        args: &[Value],
    ) -> Result<bool, SandboxError> {
        let (reply, result) = mpsc::channel();
        self.run(
            Job::Evaluate {
                id: handle.id,
                source: Arc::clone(&handle.source),
                value: value.clone(),
                args: args.to_vec(),
                reply,
            },
            result,
            self.config.eval_budget(),
        )
    }

    fn run<T>(
        &self,
        job: Job,
        result: mpsc::Receiver<Result<T, SandboxError>>,
        budget: Duration,
    ) -> Result<T, SandboxError> {
        let serial = self.dispatch(job)?;

        match result.recv_timeout(budget) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Sandbox worker {} exceeded {:?}, abandoning it", serial, budget);
                self.abandon(serial);
                Err(SandboxError::Timeout(budget))
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Sandbox worker {} stopped", serial);
                self.abandon(serial);
                Err(SandboxError::WorkerGone)
            }
        }
    }

    /// Queue a job, starting a worker if there is none
    fn dispatch(&self, job: Job) -> Result<u64, SandboxError> {
        let mut slot = self.worker.lock();

        let job = match slot.as_ref() {
            Some(worker) => match worker.jobs.send(job) {
                Ok(()) => return Ok(worker.serial),
                Err(mpsc::SendError(job)) => job,
            },
            None => job,
        };

        let worker = self.spawn()?;
        let serial = worker.serial;
        worker
            .jobs
            .send(job)
            .map_err(|_| SandboxError::WorkerGone)?;
        *slot = Some(worker);

        Ok(serial)
    }

    fn spawn(&self) -> Result<Worker, SandboxError> {
        let serial = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let (jobs, queue) = mpsc::channel::<Job>();
        let factory = Arc::clone(&self.factory);

        thread::Builder::new()
            .name(format!("rule-sandbox-{serial}"))
            .spawn(move || {
                let mut sandbox = factory();
                while let Ok(job) = queue.recv() {
                    match job {
                        Job::Compile { id, source, reply } => {
                            let _ = reply.send(sandbox.compile(id, &source));
                        }
                        Job::Evaluate {
                            id,
                            source,
                            value,
                            args,
                            reply,
                        } => {
                            let _ = reply.send(sandbox.evaluate(id, &source, &value, &args));
                        }
                    }
                }
            })
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        debug!("Started sandbox worker {}", serial);
        Ok(Worker { jobs, serial })
    }

    fn abandon(&self, serial: u64) {
        let mut slot = self.worker.lock();
        if slot.as_ref().map(|worker| worker.serial) == Some(serial) {
            *slot = None;
        }
    }
}

impl fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("config", &self.config)
            .field("worker", &self.worker.lock().as_ref().map(|w| w.serial))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(SandboxConfig::default())
    }

    #[test]
    fn test_cel_rule() {
        let sandbox = executor();
        let handle = sandbox.compile("value >= 10").unwrap();

        assert!(sandbox.evaluate(&handle, &json!(11), &[]).unwrap());
        assert!(!sandbox.evaluate(&handle, &json!(9), &[]).unwrap());
    }

    #[test]
    fn test_rule_sees_args() {
        let sandbox = executor();
        let handle = sandbox.compile("value < args[0]").unwrap();

        assert!(sandbox.evaluate(&handle, &json!(3), &[json!(5)]).unwrap());
        assert!(!sandbox.evaluate(&handle, &json!(7), &[json!(5)]).unwrap());
    }

    #[test]
    fn test_compile_error() {
        let sandbox = executor();
        assert!(matches!(
            sandbox.compile("value >=").unwrap_err(),
            SandboxError::Compile(_)
        ));
    }

    #[test]
    fn test_non_boolean_result() {
        let sandbox = executor();
        let handle = sandbox.compile("value + 1").unwrap();
        assert_eq!(
            sandbox.evaluate(&handle, &json!(1), &[]).unwrap_err(),
            SandboxError::NonBoolean
        );
    }

    struct Stalling {
        delay: Duration,
    }

    impl ScriptSandbox for Stalling {
        fn compile(&mut self, _id: u64, source: &str) -> Result<(), SandboxError> {
            if source == "stall" {
                thread::sleep(self.delay);
            }
            Ok(())
        }

        fn evaluate(
            &mut self,
            _id: u64,
            source: &str,
            _value: &Value,
            _args: &[Value],
        ) -> Result<bool, SandboxError> {
            if source == "stall" {
                thread::sleep(self.delay);
            }
            Ok(true)
        }
    }

    #[test]
    fn test_timeout_abandons_worker() {
        let config = SandboxConfig {
            compile_budget_ms: 20,
            eval_budget_ms: 20,
        };
        let sandbox = SandboxExecutor::with_factory(config, || {
            Box::new(Stalling {
                delay: Duration::from_millis(500),
            })
        });

        let err = sandbox.compile("stall").unwrap_err();
        assert_eq!(err, SandboxError::Timeout(Duration::from_millis(20)));

        // A fresh worker serves the next request
        let handle = sandbox.compile("quick").unwrap();
        assert!(sandbox.evaluate(&handle, &json!(1), &[]).unwrap());
    }
}
