//! Health monitor.
//!
//! A periodic sweep over every registered session: OS-level stats for live
//! subprocesses (RSS, CPU%) against two-tier thresholds, plus inactivity
//! timeouts. Critical sessions are killed and garbage-collected after the
//! sweep, each with a `session_unhealthy` event. The on-demand
//! [`HealthMonitor::health_check`] aggregate feeds an external status
//! endpoint and plays no part in the sweep itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;

use tether_protocol::events::{EventPayload, SessionEvent};

use crate::emitter::ResponseEmitter;
use crate::runner::AgentRunner;
use crate::session::manager::SessionManager;
use crate::settings::HealthConfig;

/// Point-in-time stats for one subprocess.
#[derive(Debug, Clone, Copy)]
pub struct ProcessStats {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Two-tier classification against the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTier {
    Healthy,
    Warning,
    Critical,
}

/// Classify process stats. Pure so the thresholds are testable.
pub fn classify_stats(stats: ProcessStats, config: &HealthConfig) -> HealthTier {
    if stats.memory_bytes >= config.memory_critical_bytes
        || stats.cpu_percent >= config.cpu_critical_percent
    {
        HealthTier::Critical
    } else if stats.memory_bytes >= config.memory_warning_bytes
        || stats.cpu_percent >= config.cpu_warning_percent
    {
        HealthTier::Warning
    } else {
        HealthTier::Healthy
    }
}

/// Aggregate for the external status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub agent_available: bool,
    pub active_session_count: usize,
    pub active_sessions: Vec<String>,
    pub service_memory_bytes: u64,
}

pub struct HealthMonitor {
    manager: Arc<SessionManager>,
    emitter: Arc<ResponseEmitter>,
    runner: Arc<AgentRunner>,
    events: broadcast::Sender<SessionEvent>,
    config: HealthConfig,
    session_timeout: Duration,
    agent_binary: PathBuf,
}

impl HealthMonitor {
    pub fn new(
        manager: Arc<SessionManager>,
        emitter: Arc<ResponseEmitter>,
        runner: Arc<AgentRunner>,
        events: broadcast::Sender<SessionEvent>,
        config: HealthConfig,
        session_timeout: Duration,
        agent_binary: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            emitter,
            runner,
            events,
            config,
            session_timeout,
            agent_binary,
        })
    }

    /// Run the sweep loop until shutdown. A no-op when monitoring is
    /// disabled (test configuration).
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            return;
        }
        let interval = self.config.interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    info!("Health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over all sessions: flag, then clean up after the pass.
    pub async fn sweep(&self) {
        let snapshots = self.manager.snapshots().await;
        if snapshots.is_empty() {
            return;
        }

        let pids: Vec<u32> = snapshots.iter().filter_map(|s| s.pid).collect();
        let stats = collect_process_stats(&pids).await;

        let now = Utc::now();
        let mut flagged: Vec<(String, String, Option<ProcessStats>)> = Vec::new();

        for snapshot in snapshots {
            if let Some(pid) = snapshot.pid {
                match stats.get(&pid) {
                    Some(process_stats) => match classify_stats(*process_stats, &self.config) {
                        HealthTier::Critical => {
                            flagged.push((
                                snapshot.id.clone(),
                                format!(
                                    "critical resource usage: {} bytes RSS, {:.1}% CPU",
                                    process_stats.memory_bytes, process_stats.cpu_percent
                                ),
                                Some(*process_stats),
                            ));
                            continue;
                        }
                        HealthTier::Warning => {
                            warn!(
                                "Session '{}' above warning thresholds ({} bytes RSS, {:.1}% CPU)",
                                snapshot.id,
                                process_stats.memory_bytes,
                                process_stats.cpu_percent
                            );
                        }
                        HealthTier::Healthy => {}
                    },
                    None => {
                        flagged.push((
                            snapshot.id.clone(),
                            format!("agent process {pid} no longer exists"),
                            None,
                        ));
                        continue;
                    }
                }
            }

            let idle = now.signed_duration_since(snapshot.last_activity);
            if !snapshot.in_flight
                && idle.num_seconds() >= 0
                && idle.num_seconds() as u64 > self.session_timeout.as_secs()
            {
                flagged.push((
                    snapshot.id.clone(),
                    format!("inactive for {}s", idle.num_seconds()),
                    None,
                ));
            }
        }

        for (session_id, reason, process_stats) in flagged {
            self.cleanup_unhealthy(&session_id, &reason, process_stats)
                .await;
        }
    }

    async fn cleanup_unhealthy(
        &self,
        session_id: &str,
        reason: &str,
        stats: Option<ProcessStats>,
    ) {
        warn!("Cleaning up unhealthy session '{}': {}", session_id, reason);
        self.runner.cancel(session_id);
        self.manager.cleanup_dead_session(session_id).await;
        self.emitter.clear_session(session_id).await;
        let _ = self.events.send(SessionEvent::new(
            session_id,
            EventPayload::SessionUnhealthy {
                reason: reason.to_string(),
                memory_bytes: stats.map(|s| s.memory_bytes),
                cpu_percent: stats.map(|s| s.cpu_percent),
            },
        ));
    }

    /// On-demand aggregate: agent availability, session census, and the
    /// service's own memory footprint.
    pub async fn health_check(&self) -> HealthReport {
        let snapshots = self.manager.snapshots().await;
        let active_sessions: Vec<String> = snapshots.iter().map(|s| s.id.clone()).collect();

        let self_pid = std::process::id();
        let service_memory_bytes = collect_process_stats(&[self_pid])
            .await
            .get(&self_pid)
            .map(|s| s.memory_bytes)
            .unwrap_or(0);

        HealthReport {
            agent_available: binary_available(&self.agent_binary),
            active_session_count: active_sessions.len(),
            active_sessions,
            service_memory_bytes,
        }
    }
}

/// Refresh stats for the given pids. Sysinfo does synchronous system calls,
/// so this runs on the blocking pool.
async fn collect_process_stats(pids: &[u32]) -> HashMap<u32, ProcessStats> {
    let pids = pids.to_vec();
    tokio::task::spawn_blocking(move || {
        let targets: Vec<Pid> = pids.iter().map(|p| Pid::from_u32(*p)).collect();
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&targets), true);

        let mut stats = HashMap::new();
        for pid in pids {
            if let Some(process) = sys.process(Pid::from_u32(pid)) {
                stats.insert(
                    pid,
                    ProcessStats {
                        memory_bytes: process.memory(),
                        cpu_percent: process.cpu_usage(),
                    },
                );
            }
        }
        stats
    })
    .await
    .unwrap_or_default()
}

/// Can the agent binary be found? Absolute paths are checked directly,
/// bare names are resolved against `PATH`.
pub fn binary_available(binary: &Path) -> bool {
    if binary.is_absolute() {
        return binary.exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(binary).exists())
}
