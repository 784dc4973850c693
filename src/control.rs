//! Engine facade (§6): the operations an external control surface (HTTP,
//! CLI, ...) would call. Out of scope here is the transport that exposes
//! these over the network; the method signatures are exactly the table's
//! operations so wiring a façade on top is mechanical.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::Config;
use crate::connection::ManagedConnection;
use crate::context::ProtocolContext;
use crate::error::{EngineError, EngineResult};
use crate::heartbeat::HeartbeatScheduler;
use crate::model::Plugin;
use crate::orchestrator::{Finding, FindingsLog, Orchestrator};
use crate::plugin_loader;
use crate::session::{FuzzingStrategy, StateSession};
use crate::stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub plugin_id: String,
    pub endpoint: String,
    pub status: SessionStatus,
    pub iteration: u64,
    pub current_state: Option<String>,
    pub coverage_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateGraph {
    pub states: Vec<String>,
    pub transitions: Vec<(String, String)>,
    pub covered: Vec<(String, String)>,
}

struct SessionRecord {
    plugin: Plugin,
    endpoint: String,
    status: SessionStatus,
    iteration: u64,
    rng_seed: u64,
    strategy: FuzzingStrategy,
    target_state: Option<String>,
    current_state: Option<String>,
    coverage_ratio: Option<f64>,
    covered_transitions: Vec<(String, String)>,
}

/// What gets written to the checkpoint store on the configured cadence, on
/// every status change, and once more when a campaign loop exits.
#[derive(Debug, Serialize, Deserialize)]
struct SessionCheckpoint {
    iteration: u64,
    status: SessionStatus,
    current_state: Option<String>,
    coverage_ratio: Option<f64>,
    rng_seed: u64,
}

struct SessionHandle {
    record: Arc<RwLock<SessionRecord>>,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

/// In-process facade over everything a fuzzing session can do. Session
/// state lives behind `Arc<RwLock<HashMap<..>>>`, the same shape as a
/// connection table shared across request-handling tasks.
pub struct Engine {
    config: Config,
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl Engine {
    pub fn new(config: Config) -> EngineResult<Self> {
        let checkpoints = Arc::new(FileCheckpointStore::new(
            crate::checkpoint::default_checkpoint_dir(&config.checkpoint_dir),
        )?);
        Ok(Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            checkpoints,
        })
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    async fn running_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|h| matches!(h.task, Some(_)))
            .count()
    }

    /// Loads and validates the plugin, then registers a new session in the
    /// `Created` state. Does not start the campaign loop.
    pub async fn create_session(
        &self,
        plugin_id: &str,
        endpoint: String,
        strategy: FuzzingStrategy,
        target_state: Option<String>,
    ) -> EngineResult<String> {
        let plugin = plugin_loader::load_plugin_by_id(&self.config, plugin_id)?;

        if self.running_count().await >= self.config.max_concurrent_sessions {
            let running: Vec<String> = self
                .sessions
                .read()
                .await
                .iter()
                .filter(|(_, h)| h.task.is_some())
                .map(|(id, _)| id.clone())
                .collect();
            return Err(EngineError::ConcurrencyLimit {
                limit: self.config.max_concurrent_sessions,
                running,
            });
        }

        let rng_seed: u64 = rand::thread_rng().gen();
        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord {
            current_state: plugin.state_model.as_ref().map(|sm| sm.initial_state.clone()),
            plugin,
            endpoint,
            status: SessionStatus::Created,
            iteration: 0,
            rng_seed,
            strategy,
            target_state,
            coverage_ratio: None,
            covered_transitions: Vec::new(),
        };
        let (shutdown, _) = broadcast::channel(4);
        let handle = SessionHandle {
            record: Arc::new(RwLock::new(record)),
            shutdown,
            task: None,
        };
        self.sessions.write().await.insert(session_id.clone(), handle);
        info!(session_id = %session_id, plugin_id, "session created");
        Ok(session_id)
    }

    /// Spawns the campaign loop for a previously created session.
    pub async fn start_session(&self, session_id: &str) -> EngineResult<()> {
        let mut sessions = self.sessions.write().await;
        let handle = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        let record = handle.record.clone();
        let shutdown_tx = handle.shutdown.clone();
        let findings_path = self
            .config
            .checkpoint_dir
            .join("findings")
            .join(format!("{session_id}.jsonl"));
        let finding_max_bytes = self.config.finding_max_bytes;
        let rate_limit = self.config.rate_limit_per_second;
        let session_id_owned = session_id.to_string();
        let checkpoints = self.checkpoints.clone();
        let checkpoint_interval = self.config.checkpoint_interval.max(1);

        let (endpoint, plugin, rng_seed, strategy, target_state) = {
            let r = record.read().await;
            (
                r.endpoint.clone(),
                r.plugin.clone(),
                r.rng_seed,
                r.strategy,
                r.target_state.clone(),
            )
        };

        {
            let mut r = record.write().await;
            r.status = SessionStatus::Running;
        }

        let task = tokio::spawn(run_campaign(
            plugin,
            endpoint,
            session_id_owned,
            rng_seed,
            strategy,
            target_state,
            findings_path,
            finding_max_bytes,
            rate_limit,
            record.clone(),
            checkpoints,
            checkpoint_interval,
            shutdown_tx,
        ));
        handle.task = Some(task);
        Ok(())
    }

    pub async fn stop_session(&self, session_id: &str) -> EngineResult<()> {
        let mut sessions = self.sessions.write().await;
        let handle = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let _ = handle.shutdown.send(());
        {
            let mut r = handle.record.write().await;
            r.status = SessionStatus::Stopped;
        }
        if let Some(task) = handle.task.take() {
            task.abort();
        }
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> EngineResult<SessionSummary> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let r = handle.record.read().await;
        Ok(SessionSummary {
            id: session_id.to_string(),
            plugin_id: r.plugin.id.clone(),
            endpoint: r.endpoint.clone(),
            status: r.status,
            iteration: r.iteration,
            current_state: r.current_state.clone(),
            coverage_ratio: r.coverage_ratio,
        })
    }

    pub async fn get_state_graph(&self, session_id: &str) -> EngineResult<Option<StateGraph>> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let r = handle.record.read().await;
        let Some(sm) = &r.plugin.state_model else {
            return Ok(None);
        };
        Ok(Some(StateGraph {
            states: sm.states.clone(),
            transitions: sm.transitions.iter().map(|t| (t.from.clone(), t.to.clone())).collect(),
            covered: r.covered_transitions.clone(),
        }))
    }

    pub async fn list_findings(&self, session_id: &str) -> EngineResult<Vec<Finding>> {
        let path = self
            .config
            .checkpoint_dir
            .join("findings")
            .join(format!("{session_id}.jsonl"));
        FindingsLog::new(path).list()
    }

    pub async fn get_finding(&self, session_id: &str, finding_id: &str) -> EngineResult<Finding> {
        self.list_findings(session_id)
            .await?
            .into_iter()
            .find(|f| f.id == finding_id)
            .ok_or_else(|| EngineError::FindingNotFound(finding_id.to_string()))
    }

    /// Send a single payload to a plugin's target and return whatever comes
    /// back, bypassing session bookkeeping entirely.
    pub async fn execute_one_off(
        &self,
        plugin_id: &str,
        endpoint: SocketAddr,
        payload: Vec<u8>,
    ) -> EngineResult<Vec<u8>> {
        let plugin = plugin_loader::load_plugin_by_id(&self.config, plugin_id)?;
        let mut conn = ManagedConnection::new(plugin.connection.clone(), endpoint);
        conn.send(&payload).await?;
        let mut buf = vec![0u8; 65536];
        let n = conn
            .recv(&mut buf, Duration::from_secs(self.config.default_timeout_secs))
            .await?;
        Ok(buf[..n].to_vec())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_campaign(
    plugin: Plugin,
    endpoint: String,
    session_id: String,
    rng_seed: u64,
    strategy: FuzzingStrategy,
    target_state: Option<String>,
    findings_path: std::path::PathBuf,
    finding_max_bytes: usize,
    rate_limit: Option<f64>,
    record: Arc<RwLock<SessionRecord>>,
    checkpoints: Arc<dyn CheckpointStore>,
    checkpoint_interval: u64,
    shutdown_tx: broadcast::Sender<()>,
) {
    let Ok(addr): Result<SocketAddr, _> = endpoint.parse() else {
        warn!(endpoint, "invalid endpoint, aborting session");
        record.write().await.status = SessionStatus::Failed;
        return;
    };
    let connection = Arc::new(Mutex::new(ManagedConnection::new(plugin.connection.clone(), addr)));
    let mut state_session = plugin
        .state_model
        .clone()
        .map(|sm| StateSession::new(sm, strategy, None, target_state.clone()));

    if let Some(stack) = &plugin.protocol_stack {
        let mut ctx = ProtocolContext::new();
        let mut conn = connection.lock().await;
        if let Err(e) = stage::run_stack(stack, &mut ctx, &mut conn).await {
            warn!(session_id = %session_id, error = %e, "bootstrap stage failed, continuing anyway");
        }
    }

    let heartbeat_task = plugin.heartbeat.clone().map(|spec| {
        let scheduler = HeartbeatScheduler::new(spec, connection.clone());
        let heartbeat_shutdown = shutdown_tx.subscribe();
        tokio::spawn(scheduler.run(heartbeat_shutdown))
    });

    let orchestrator = Orchestrator::new(
        plugin,
        endpoint,
        session_id.clone(),
        connection.clone(),
        rng_seed,
        FindingsLog::new(findings_path),
        Duration::from_secs(5),
        finding_max_bytes,
        rate_limit,
    );
    let mut orchestrator = match orchestrator {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "failed to start orchestrator");
            record.write().await.status = SessionStatus::Failed;
            if let Some(task) = heartbeat_task {
                task.abort();
            }
            return;
        }
    };

    let mut shutdown = shutdown_tx.subscribe();
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }
        match orchestrator.run_iteration().await {
            Ok(outcome) => {
                if let Some(session) = state_session.as_mut() {
                    let mut rng = rand::rngs::StdRng::seed_from_u64(rng_seed ^ orchestrator.iteration());
                    if outcome == crate::orchestrator::Outcome::Normal {
                        if let Some(transition) = session.choose_next(&mut rng) {
                            session.advance(&transition);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "iteration failed unexpectedly");
            }
        }
        let iteration = orchestrator.iteration();
        {
            let mut r = record.write().await;
            r.iteration = iteration;
            if let Some(session) = &state_session {
                r.current_state = Some(session.current_state().to_string());
                r.coverage_ratio = Some(session.coverage_ratio());
                r.covered_transitions = session.covered_transitions();
            }
        }
        if iteration % checkpoint_interval == 0 {
            write_checkpoint(&checkpoints, &session_id, &record).await;
        }
    }

    if let Some(task) = heartbeat_task {
        task.abort();
    }

    record.write().await.status = SessionStatus::Stopped;
    write_checkpoint(&checkpoints, &session_id, &record).await;
}

async fn write_checkpoint(checkpoints: &Arc<dyn CheckpointStore>, session_id: &str, record: &Arc<RwLock<SessionRecord>>) {
    let r = record.read().await;
    let checkpoint = SessionCheckpoint {
        iteration: r.iteration,
        status: r.status,
        current_state: r.current_state.clone(),
        coverage_ratio: r.coverage_ratio,
        rng_seed: r.rng_seed,
    };
    drop(r);
    let Ok(bytes) = serde_json::to_vec(&checkpoint) else {
        warn!(session_id, "failed to serialize checkpoint");
        return;
    };
    if let Err(e) = checkpoints.put(session_id, &bytes) {
        warn!(session_id, error = %e, "failed to write checkpoint");
    }
}
