//! Compiler behind a message boundary
//!
//! A [`CompilerService`] answers [`Envelope`]s; a [`CompilerClient`] sends
//! them and matches replies to callers by node id and generation. The two
//! sides talk over tokio channels, either in process
//! ([`spawn_local_service`]) or through the `permit-compiler-worker` binary,
//! which speaks the same envelopes as JSON lines.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{CompileJob, Compiler};
use crate::error::{EngineError, Result};
use crate::node::Node;
use crate::registry::Registry;

/// Message kinds exchanged with a compiler worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompilerEvent {
    /// Compile a job (client to service)
    Process,
    /// Compiled value (service to client)
    Compiled,
    /// Evict cached values (client to service)
    Invalidate,
    /// Dependencies were missing (service to client)
    CompilationFailed,
    /// Drop the whole cache (client to service)
    ClearCache,
    /// Eviction acknowledged (service to client)
    DeleteCached,
}

/// Wire message: `{"event": "...", "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: CompilerEvent,

    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: CompilerEvent, data: Value) -> Self {
        Self { event, data }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CompiledData {
    id: String,
    generation: u64,
    value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FailedData {
    id: String,
    generation: u64,
    missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InvalidateData {
    ids: Vec<String>,
}

/// Work a registry queues for an out-of-process compiler
#[derive(Debug, Clone, PartialEq)]
pub enum CompilerCommand {
    Compile(CompileJob),
    Evict(Vec<String>),
    Clear,
}

impl CompilerCommand {
    pub fn is_compile_of(&self, id: &str) -> bool {
        matches!(self, Self::Compile(job) if job.id == id)
    }

    pub fn into_envelope(self) -> Result<Envelope> {
        let envelope = match self {
            Self::Compile(job) => Envelope::new(CompilerEvent::Process, serde_json::to_value(job)?),
            Self::Evict(ids) => Envelope::new(
                CompilerEvent::Invalidate,
                serde_json::to_value(InvalidateData { ids })?,
            ),
            Self::Clear => Envelope::new(CompilerEvent::ClearCache, Value::Null),
        };
        Ok(envelope)
    }
}

/// Result of a remote compile
#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutcome {
    Compiled { generation: u64, value: Arc<Value> },
    Failed { generation: u64, missing: Vec<String> },
}

impl CompileOutcome {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Compiled { generation, .. } | Self::Failed { generation, .. } => *generation,
        }
    }
}

/// Service side: a compiler answering envelopes
#[derive(Debug, Default)]
pub struct CompilerService {
    compiler: Arc<Compiler>,
}

impl CompilerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compiler(compiler: Arc<Compiler>) -> Self {
        Self { compiler }
    }

    pub fn compiler(&self) -> &Arc<Compiler> {
        &self.compiler
    }

    /// Handle one request; some requests have no reply
    pub fn handle(&self, envelope: Envelope) -> Result<Option<Envelope>> {
        match envelope.event {
            CompilerEvent::Process => {
                let job: CompileJob = serde_json::from_value(envelope.data)?;
                let reply = match self.compiler.compile(&job) {
                    Ok(value) => Envelope::new(
                        CompilerEvent::Compiled,
                        json!({ "id": job.id, "generation": job.generation, "value": value.as_ref() }),
                    ),
                    Err(EngineError::MissingDependency { missing, .. }) => Envelope::new(
                        CompilerEvent::CompilationFailed,
                        serde_json::to_value(FailedData {
                            id: job.id,
                            generation: job.generation,
                            missing,
                        })?,
                    ),
                    Err(err) => return Err(err),
                };
                Ok(Some(reply))
            }
            CompilerEvent::Invalidate => {
                let data: InvalidateData = serde_json::from_value(envelope.data)?;
                self.compiler.evict(data.ids.as_slice());
                Ok(Some(Envelope::new(
                    CompilerEvent::DeleteCached,
                    serde_json::to_value(data)?,
                )))
            }
            CompilerEvent::ClearCache => {
                self.compiler.clear();
                Ok(None)
            }
            other => Err(EngineError::InvalidDefinition(format!(
                "compiler service does not accept {:?}",
                other
            ))),
        }
    }
}

type Waiters = Vec<oneshot::Sender<CompileOutcome>>;

/// Client side of a compiler worker
///
/// Concurrent requests for the same node and generation share one round
/// trip: the first caller sends, later callers wait for the same reply.
#[derive(Debug, Clone)]
pub struct CompilerClient {
    requests: mpsc::UnboundedSender<Envelope>,
    pending: Arc<DashMap<(String, u64), Waiters>>,
}

impl CompilerClient {
    /// Wire a client to a request sink and a reply source
    ///
    /// Spawns the reply reader on the current tokio runtime.
    pub fn connect(
        requests: mpsc::UnboundedSender<Envelope>,
        mut replies: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let pending: Arc<DashMap<(String, u64), Waiters>> = Arc::new(DashMap::new());

        let reader = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(envelope) = replies.recv().await {
                if let Err(err) = resolve(&reader, envelope) {
                    warn!("Discarding malformed compiler reply: {}", err);
                }
            }
            debug!("Compiler reply stream closed, {} requests abandoned", reader.len());
            reader.clear();
        });

        Self { requests, pending }
    }

    /// Compile a job remotely
    ///
    /// # Errors
    ///
    /// [`EngineError::Internal`] if the worker went away before replying.
    pub async fn compile(&self, job: CompileJob) -> Result<CompileOutcome> {
        let key = (job.id.clone(), job.generation);
        let (tx, rx) = oneshot::channel();

        let first = match self.pending.entry(key.clone()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };

        if first {
            if let Err(err) = self.send(CompilerCommand::Compile(job)) {
                self.pending.remove(&key);
                return Err(err);
            }
        } else {
            debug!("Joining in-flight compile of {} (generation {})", key.0, key.1);
        }

        rx.await
            .map_err(|_| EngineError::Internal("compiler worker disconnected".to_string()))
    }

    /// Send a command without waiting for a reply
    pub fn send(&self, command: CompilerCommand) -> Result<()> {
        let envelope = command.into_envelope()?;
        self.requests
            .send(envelope)
            .map_err(|_| EngineError::Internal("compiler worker disconnected".to_string()))
    }

    /// Requests waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

fn resolve(pending: &DashMap<(String, u64), Waiters>, envelope: Envelope) -> Result<()> {
    let (key, outcome) = match envelope.event {
        CompilerEvent::Compiled => {
            let data: CompiledData = serde_json::from_value(envelope.data)?;
            let outcome = CompileOutcome::Compiled {
                generation: data.generation,
                value: Arc::new(data.value),
            };
            ((data.id, data.generation), outcome)
        }
        CompilerEvent::CompilationFailed => {
            let data: FailedData = serde_json::from_value(envelope.data)?;
            let outcome = CompileOutcome::Failed {
                generation: data.generation,
                missing: data.missing,
            };
            ((data.id, data.generation), outcome)
        }
        CompilerEvent::DeleteCached => return Ok(()),
        other => {
            return Err(EngineError::InvalidDefinition(format!(
                "unexpected compiler reply {:?}",
                other
            )))
        }
    };

    if let Some((_, waiters)) = pending.remove(&key) {
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
    Ok(())
}

/// Run a compiler service on the current runtime and connect a client to it
pub fn spawn_local_service(service: CompilerService) -> CompilerClient {
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Envelope>();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        while let Some(envelope) = request_rx.recv().await {
            match service.handle(envelope) {
                Ok(Some(reply)) => {
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => warn!("Compiler service rejected request: {}", err),
            }
        }
    });

    CompilerClient::connect(request_tx, reply_rx)
}

/// Pump a deferred-mode registry until it has nothing left to compile
///
/// Each round forwards queued evictions, then compiles every queued job
/// concurrently and feeds the results back, which may queue more work.
/// Returns how many compile results were applied.
pub async fn drive<N: Node>(registry: &mut Registry<N>, client: &CompilerClient) -> Result<usize> {
    let mut applied = 0;

    loop {
        let commands = registry.take_outbox();
        if commands.is_empty() {
            return Ok(applied);
        }

        let mut jobs = Vec::new();
        for command in commands {
            match command {
                CompilerCommand::Compile(job) => jobs.push(job),
                other => client.send(other)?,
            }
        }

        let outcomes = join_all(jobs.into_iter().map(|job| async move {
            let id = job.id.clone();
            (id, client.compile(job).await)
        }))
        .await;

        for (id, outcome) in outcomes {
            registry.apply_compile_outcome(&id, outcome?);
            applied += 1;
        }
    }
}
