//! Heartbeat scheduler (§4.9): a sibling task that keeps a connection warm
//! between fuzzing sends, via a shared-state watchdog task pattern for
//! periodic liveness checks.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::connection::ManagedConnection;
use crate::model::{HeartbeatAction, HeartbeatSpec};
use crate::parser::{self, FieldMap};

pub struct HeartbeatScheduler {
    spec: HeartbeatSpec,
    connection: Arc<Mutex<ManagedConnection>>,
}

impl HeartbeatScheduler {
    pub fn new(spec: HeartbeatSpec, connection: Arc<Mutex<ManagedConnection>>) -> Self {
        Self { spec, connection }
    }

    /// Runs until `shutdown` fires or the failure threshold triggers a
    /// `stop` action. Each tick acquires the connection lock only for the
    /// duration of the send/recv, so it never blocks the fuzz loop for
    /// longer than one round trip.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut failures: u32 = 0;
        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("heartbeat scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let Ok(payload) = parser::serialize(&self.spec.message, &FieldMap::new()) else {
                error!("heartbeat message failed to serialize, skipping tick");
                continue;
            };

            let mut conn = self.connection.lock().await;
            let outcome = conn.send(&payload).await;
            let ok = match outcome {
                Ok(()) if self.spec.expect_response => {
                    let mut buf = vec![0u8; 4096];
                    conn.recv(&mut buf, Duration::from_secs(5)).await.is_ok()
                }
                Ok(()) => true,
                Err(_) => false,
            };
            drop(conn);

            if ok {
                failures = 0;
                continue;
            }

            failures += 1;
            warn!(failures, threshold = self.spec.on_failure.threshold, "heartbeat failed");
            if failures >= self.spec.on_failure.threshold {
                match self.spec.on_failure.action {
                    HeartbeatAction::Reconnect => {
                        let mut conn = self.connection.lock().await;
                        if conn.reconnect().await.is_ok() {
                            failures = 0;
                        }
                    }
                    HeartbeatAction::Stop => {
                        warn!("heartbeat failure threshold reached, stopping scheduler");
                        return;
                    }
                }
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let base = self.spec.interval.max(0.0);
        let jitter = self.spec.jitter.max(0.0);
        let offset = if jitter > 0.0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}
