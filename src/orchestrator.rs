//! Fuzz orchestrator (§4.11): the campaign loop. Each iteration mutates a
//! seed, sends it, classifies what came back, and persists anything other
//! than a normal exchange as a finding. Per-test errors never escape the
//! loop as a `Result` — they're caught and folded into an `Outcome`.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::behavior::BehaviorState;
use crate::connection::ManagedConnection;
use crate::error::{EngineError, EngineResult, TransportError};
use crate::model::Plugin;
use crate::mutate::MutationEngine;
use crate::parser;
use crate::rng::SessionRng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Normal,
    Hang,
    Crash,
    LogicalFailure,
    Anomaly,
    ParseError,
}

impl Outcome {
    pub fn is_finding(self) -> bool {
        !matches!(self, Outcome::Normal)
    }
}

#[derive(Debug, Default)]
struct ClassifyInput {
    timed_out: bool,
    transport_crashed: bool,
    parse_failed: bool,
    validator_failed: bool,
    anomaly: bool,
}

/// Priority order mirrors severity: a hang or crash is worth reporting
/// before a milder parse/logical mismatch even if both are true for the
/// same exchange.
fn classify(input: ClassifyInput) -> Outcome {
    if input.timed_out {
        Outcome::Hang
    } else if input.transport_crashed {
        Outcome::Crash
    } else if input.parse_failed {
        Outcome::ParseError
    } else if input.validator_failed {
        Outcome::LogicalFailure
    } else if input.anomaly {
        Outcome::Anomaly
    } else {
        Outcome::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub session_id: String,
    pub plugin_id: String,
    pub endpoint: String,
    pub outcome: Outcome,
    pub iteration: u64,
    pub reproducer: Vec<u8>,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only JSONL findings log, one object per line.
pub struct FindingsLog {
    path: PathBuf,
}

impl FindingsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, finding: &Finding) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(EngineError::Io)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(EngineError::Io)?;
        let line = serde_json::to_string(finding)
            .map_err(|e| EngineError::Checkpoint(e.to_string()))?;
        writeln!(file, "{line}").map_err(EngineError::Io)?;
        Ok(())
    }

    pub fn list(&self) -> EngineResult<Vec<Finding>> {
        let Ok(file) = std::fs::File::open(&self.path) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(EngineError::Io)?;
            if line.trim().is_empty() {
                continue;
            }
            let finding: Finding = serde_json::from_str(&line)
                .map_err(|e| EngineError::Checkpoint(e.to_string()))?;
            out.push(finding);
        }
        Ok(out)
    }
}

pub struct Orchestrator {
    plugin: Plugin,
    endpoint: String,
    session_id: String,
    connection: Arc<Mutex<ManagedConnection>>,
    mutation: MutationEngine,
    behavior: BehaviorState,
    rng: SessionRng,
    findings: FindingsLog,
    hang_threshold: Duration,
    finding_max_bytes: usize,
    rate_limit_per_second: Option<f64>,
    iteration: u64,
    mutated_fields: HashSet<String>,
}

impl Orchestrator {
    pub fn new(
        plugin: Plugin,
        endpoint: String,
        session_id: String,
        connection: Arc<Mutex<ManagedConnection>>,
        rng_seed: u64,
        findings: FindingsLog,
        hang_threshold: Duration,
        finding_max_bytes: usize,
        rate_limit_per_second: Option<f64>,
    ) -> EngineResult<Self> {
        let seeds = plugin.data_model.seeds.clone();
        let mode = plugin.mutation.mode;
        let weight = plugin.mutation.structure_aware_weight;
        let mutation = MutationEngine::new(seeds, mode, weight)?;
        Ok(Self {
            plugin,
            endpoint,
            session_id,
            connection,
            mutation,
            behavior: BehaviorState::new(),
            rng: SessionRng::new(rng_seed),
            findings,
            hang_threshold,
            finding_max_bytes,
            rate_limit_per_second,
            iteration: 0,
            mutated_fields: HashSet::new(),
        })
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Field names the structure-aware mutator has touched so far this
    /// session, for coverage reporting.
    pub fn mutated_fields(&self) -> &HashSet<String> {
        &self.mutated_fields
    }

    fn choose_seed(&mut self) -> Vec<u8> {
        let seeds = &self.plugin.data_model.seeds;
        if seeds.is_empty() {
            return Vec::new();
        }
        let idx = self.rng.gen_range(0..seeds.len());
        seeds[idx].clone()
    }

    /// Run one send/receive/classify cycle and persist a finding if the
    /// outcome isn't `Normal`.
    pub async fn run_iteration(&mut self) -> EngineResult<Outcome> {
        self.throttle().await;

        let seed = self.choose_seed();
        let base_fields = parser::parse(&self.plugin.data_model, &seed).unwrap_or_default();
        let (mut mutated, mutated_field) =
            self.mutation
                .mutate(&mut self.rng, &self.plugin.data_model, &base_fields);
        if let Some(field) = mutated_field {
            self.mutated_fields.insert(field);
        }
        self.behavior.apply(&self.plugin.data_model, &mut mutated);
        let bytes = match parser::serialize(&self.plugin.data_model, &mutated) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "mutated fields failed to serialize, skipping iteration");
                return Ok(Outcome::Normal);
            }
        };

        let mut input = ClassifyInput::default();
        let mut conn = self.connection.lock().await;
        let send_result = conn.send(&bytes).await;
        classify_transport_error(send_result.as_ref().err(), &mut input);

        let mut response: Option<Vec<u8>> = None;
        if send_result.is_ok() {
            let recv_result = match &self.plugin.data_model.response_model {
                Some(response_model) => {
                    let probe = crate::connection::model_frame_probe(response_model);
                    conn.recv_framed(probe, self.hang_threshold).await
                }
                None => {
                    let mut buf = vec![0u8; 65536];
                    conn.recv(&mut buf, self.hang_threshold).await.map(|n| buf[..n].to_vec())
                }
            };
            match recv_result {
                Ok(bytes) => response = Some(bytes),
                Err(e) => classify_transport_error(Some(&e), &mut input),
            }
        }
        drop(conn);

        if let (Some(resp), Some(response_model)) =
            (&response, &self.plugin.data_model.response_model)
        {
            if parser::parse(response_model, resp).is_err() {
                input.parse_failed = true;
            }
        }

        let outcome = classify(input);
        self.iteration += 1;

        if outcome.is_finding() {
            self.persist_finding(outcome, &bytes)?;
        }
        Ok(outcome)
    }

    async fn throttle(&self) {
        if let Some(rate) = self.rate_limit_per_second {
            if rate > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(1.0 / rate)).await;
            }
        }
    }

    fn persist_finding(&self, outcome: Outcome, reproducer: &[u8]) -> EngineResult<()> {
        let mut bytes = reproducer.to_vec();
        bytes.truncate(self.finding_max_bytes);
        let finding = Finding {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            plugin_id: self.plugin.id.clone(),
            endpoint: self.endpoint.clone(),
            outcome,
            iteration: self.iteration,
            reproducer: bytes,
            detail: format!("{outcome:?}"),
            recorded_at: Utc::now(),
        };
        info!(session_id = %self.session_id, outcome = ?outcome, "persisting finding");
        self.findings.append(&finding)
    }
}

fn classify_transport_error(err: Option<&TransportError>, input: &mut ClassifyInput) {
    match err {
        Some(TransportError::Timeout(_)) => input.timed_out = true,
        Some(TransportError::Closed) | Some(TransportError::Io(_)) => input.transport_crashed = true,
        Some(TransportError::ConnectFailure { .. }) => input.transport_crashed = true,
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hang_outranks_every_other_signal() {
        let outcome = classify(ClassifyInput {
            timed_out: true,
            transport_crashed: true,
            parse_failed: true,
            validator_failed: true,
            anomaly: true,
        });
        assert_eq!(outcome, Outcome::Hang);
    }

    #[test]
    fn no_signals_is_normal() {
        assert_eq!(classify(ClassifyInput::default()), Outcome::Normal);
    }

    #[test]
    fn findings_log_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("fuzzcore-findings-{}.jsonl", std::process::id()));
        let log = FindingsLog::new(&path);
        let finding = Finding {
            id: "f1".into(),
            session_id: "s1".into(),
            plugin_id: "echo".into(),
            endpoint: "127.0.0.1:9".into(),
            outcome: Outcome::Crash,
            iteration: 3,
            reproducer: vec![1, 2, 3],
            detail: "Crash".into(),
            recorded_at: Utc::now(),
        };
        log.append(&finding).unwrap();
        let all = log.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "f1");
        let _ = std::fs::remove_file(&path);
    }
}
