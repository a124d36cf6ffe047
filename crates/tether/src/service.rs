//! The service façade.
//!
//! [`TetherService`] composes the registry, runner, emitter, orchestrator,
//! health monitor, and event hub behind one API: transports submit prompts
//! and permission replies, subscribe to the event stream, and drive
//! lifecycle (startup cleanup, graceful shutdown). Events flow through a
//! single broadcast channel; background tasks forward them to the hub and
//! keep pid bookkeeping current.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::broadcast;

use tether_protocol::commands::{PermissionReply, PromptCommand, TurnOutcome};
use tether_protocol::events::{EventPayload, SessionEvent};

use crate::attachments;
use crate::emitter::{PermissionDisposition, ResponseEmitter};
use crate::error::Result;
use crate::health::{HealthMonitor, HealthReport};
use crate::hub::EventHub;
use crate::runner::AgentRunner;
use crate::session::manager::SessionManager;
use crate::session::ops::SessionOps;
use crate::settings::Settings;

/// Capacity of the service-wide event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

pub struct TetherService {
    settings: Arc<Settings>,
    manager: Arc<SessionManager>,
    emitter: Arc<ResponseEmitter>,
    runner: Arc<AgentRunner>,
    ops: SessionOps,
    hub: Arc<EventHub>,
    health: Arc<HealthMonitor>,
    events: broadcast::Sender<SessionEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TetherService {
    pub fn new(settings: Settings) -> Arc<Self> {
        let settings = Arc::new(settings);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (shutdown_tx, _) = broadcast::channel(1);

        let manager = Arc::new(SessionManager::new());
        let emitter = Arc::new(ResponseEmitter::new());
        let runner = Arc::new(AgentRunner::new(settings.agent.clone(), events.clone()));
        let ops = SessionOps::new(
            Arc::clone(&manager),
            Arc::clone(&emitter),
            Arc::clone(&runner) as _,
            events.clone(),
            Arc::clone(&settings),
        );
        let health = HealthMonitor::new(
            Arc::clone(&manager),
            Arc::clone(&emitter),
            Arc::clone(&runner),
            events.clone(),
            settings.health.clone(),
            settings.sessions.timeout(),
            settings.agent.binary.clone(),
        );

        Arc::new(Self {
            settings,
            manager,
            emitter,
            runner,
            ops,
            hub: Arc::new(EventHub::new()),
            health,
            events,
            shutdown_tx,
        })
    }

    /// Spawn the background loops: health sweep, hub forwarding, and pid
    /// bookkeeping. Idempotent enough for one call at boot.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(
            Arc::clone(&self.health).run(self.shutdown_tx.subscribe()),
        );

        // Forward every event to the hub and mirror process lifecycle into
        // the registry so the health sweep sees live pids.
        let hub = Arc::clone(&self.hub);
        let manager = Arc::clone(&self.manager);
        let mut events_rx = self.events.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events_rx.recv() => {
                        match event {
                            Ok(event) => {
                                match &event.payload {
                                    EventPayload::ProcessStart { pid } => {
                                        manager.set_pid(&event.session_id, Some(*pid)).await;
                                    }
                                    EventPayload::ProcessExit { .. } => {
                                        manager.set_pid(&event.session_id, None).await;
                                    }
                                    _ => {}
                                }
                                hub.dispatch(&event);
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Event forwarder lagged by {} events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Subscribe to the raw event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(&self.hub)
    }

    /// Run one turn. Security violations additionally surface as events
    /// before the error returns.
    pub async fn process_prompt(&self, cmd: PromptCommand) -> Result<TurnOutcome> {
        let session_hint = cmd.session_id.clone().unwrap_or_default();
        match self.ops.process_prompt(cmd).await {
            Err(e) if e.is_security_violation() => {
                let _ = self.events.send(SessionEvent::new(
                    session_hint,
                    EventPayload::SecurityViolation {
                        detail: e.to_string(),
                    },
                ));
                Err(e)
            }
            other => other,
        }
    }

    /// Resolve a permission reply. Returns `false` when nothing was
    /// pending — the caller should reinterpret the text as a new prompt.
    pub async fn permission_reply(&self, reply: PermissionReply) -> bool {
        let key = self
            .manager
            .resolve_id(&reply.session_id)
            .await
            .unwrap_or_else(|| reply.session_id.clone());
        match self
            .emitter
            .handle_permission_reply(&key, &reply.response)
            .await
        {
            PermissionDisposition::Resolved(events) => {
                self.manager.touch(&key).await;
                for event in events {
                    let _ = self.events.send(event);
                }
                true
            }
            PermissionDisposition::NotAPermissionReply => false,
        }
    }

    /// Terminate a session immediately: kill any in-flight subprocess,
    /// drop registry and buffer state, emit `session_cancelled`.
    pub async fn kill_session(&self, session_id: &str, reason: &str) -> bool {
        let Some(key) = self.manager.resolve_id(session_id).await else {
            return false;
        };
        info!("Killing session '{}': {}", key, reason);
        self.runner.cancel(&key);
        self.manager.cleanup_dead_session(&key).await;
        self.emitter.clear_session(&key).await;
        let _ = self.events.send(SessionEvent::new(
            key,
            EventPayload::SessionCancelled {
                reason: reason.to_string(),
            },
        ));
        true
    }

    pub async fn mark_session_backgrounded(&self, session_id: &str) {
        self.manager.mark_backgrounded(session_id).await;
    }

    pub async fn mark_session_foregrounded(&self, session_id: &str) {
        self.manager.mark_foregrounded(session_id).await;
    }

    pub async fn health_check(&self) -> HealthReport {
        self.health.health_check().await
    }

    /// Clear all state left over from a previous run. Call once at boot.
    pub async fn startup_cleanup(&self) {
        let removed = self.manager.remove_all().await;
        self.emitter.clear_all().await;
        attachments::purge_staging_root(&self.settings.attachments.root).await;
        if removed > 0 {
            info!("Startup cleanup removed {} stale sessions", removed);
        }
    }

    /// Graceful shutdown: stop background loops, drain in-flight turns up
    /// to the configured timeout, then force-kill what remains.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + self.settings.shutdown_timeout();
        while self.runner.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.runner.active_count();
        if remaining > 0 {
            warn!("Force-killing {} in-flight turns at shutdown", remaining);
            self.runner.cancel_all();
            // Give the cancelled turns a moment to reap their children.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.manager.remove_all().await;
        self.emitter.clear_all().await;
    }
}
