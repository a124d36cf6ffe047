//! Per-turn control flow: resolve, execute with retry, recover.
//!
//! One [`SessionOps::process_prompt`] call is one client-visible turn. The
//! orchestrator resolves the incoming id to a session (continuation) or
//! creates one (fresh), pumps the runner's classified messages through the
//! response emitter, retries rate-limited attempts with bounded exponential
//! backoff, and — when a resumed session turns out to be expired on the
//! agent side — cleans up, restarts fresh exactly once, and remaps both the
//! stale and the new id onto the replacement session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};

use tether_protocol::classify::ClassifiedMessage;
use tether_protocol::commands::{PromptCommand, TurnOutcome};
use tether_protocol::events::SessionEvent;
use tether_protocol::records::FinalResult;

use crate::attachments;
use crate::emitter::ResponseEmitter;
use crate::error::{Result, TetherError};
use crate::runner::{ExecutionOutcome, SessionView, TurnExecutor};
use crate::session::manager::SessionManager;
use crate::settings::Settings;
use crate::validation::{validate_prompt, validate_session_id, validate_working_directory};

/// Backoff before retry `attempt + 1`: doubling from one second, capped at
/// five.
fn backoff_delay(attempt: u32) -> Duration {
    let millis = 1000u64.saturating_mul(1 << (attempt - 1).min(16));
    Duration::from_millis(millis.min(5000))
}

pub struct SessionOps {
    manager: Arc<SessionManager>,
    emitter: Arc<ResponseEmitter>,
    executor: Arc<dyn TurnExecutor>,
    events: broadcast::Sender<SessionEvent>,
    settings: Arc<Settings>,
}

impl SessionOps {
    pub fn new(
        manager: Arc<SessionManager>,
        emitter: Arc<ResponseEmitter>,
        executor: Arc<dyn TurnExecutor>,
        events: broadcast::Sender<SessionEvent>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            manager,
            emitter,
            executor,
            events,
            settings,
        }
    }

    /// Run one turn end to end.
    ///
    /// Validation failures return `Err` before any subprocess is spawned;
    /// execution failures come back as `Ok(TurnOutcome { success: false })`
    /// after the terminal event has been emitted.
    pub async fn process_prompt(&self, cmd: PromptCommand) -> Result<TurnOutcome> {
        let prompt = validate_prompt(&cmd.prompt)?.to_string();
        if let Some(ref id) = cmd.session_id {
            validate_session_id(id)?;
        }
        let working_dir = validate_working_directory(
            &cmd.working_directory,
            &self.settings.sessions.workspace_root,
        )?;

        let staged = attachments::stage(&cmd.attachments, &self.settings.attachments).await?;
        let prompt = attachments::prompt_with_manifest(&prompt, &staged);

        let result = self
            .run_resolved_turn(&cmd, prompt, working_dir)
            .await;
        // Unconditional: staged files never outlive the turn, success or not.
        staged.cleanup().await;
        result
    }

    async fn run_resolved_turn(
        &self,
        cmd: &PromptCommand,
        prompt: String,
        working_dir: PathBuf,
    ) -> Result<TurnOutcome> {
        let (key, external_id, continuation) = match cmd.session_id.as_deref() {
            Some(requested) => match self.manager.get_session(requested).await {
                Some(session) => (session.id.clone(), session.external_id.clone(), true),
                None => {
                    // Unknown id from the client: assume it names an agent
                    // conversation from a previous server life and try to
                    // resume it. Expiry recovery handles the other case.
                    let session = self
                        .manager
                        .create_session(Some(requested), working_dir.clone())
                        .await;
                    self.manager
                        .map_external_session(&session.id, requested)
                        .await?;
                    (session.id, Some(requested.to_string()), true)
                }
            },
            None => {
                let session = self.manager.create_session(None, working_dir.clone()).await;
                (session.id, None, false)
            }
        };

        if self.emitter.has_unresolved_permission(&key).await {
            return Err(TetherError::SessionBusy(key));
        }
        self.manager.begin_turn(&key).await?;
        self.emitter.begin_turn(&key).await;

        let view = SessionView {
            internal_id: key.clone(),
            external_id,
            working_dir: working_dir.clone(),
        };
        let outcome = self.run_attempts(&key, &view, &prompt, cmd.skip_permissions).await;
        self.manager.end_turn(&key).await;

        match outcome {
            ExecutionOutcome::SessionExpired { message } if continuation => {
                info!(
                    "Session '{}' expired on the agent side, restarting fresh: {}",
                    key,
                    message.lines().next().unwrap_or_default()
                );
                self.recover_expired(cmd, &prompt, working_dir, &key).await
            }
            other => self.finalize(&key, other, None).await,
        }
    }

    /// Expired-session recovery: clean up the dead record, rerun the whole
    /// turn as fresh (its own attempt budget), then alias the stale id to
    /// the replacement so the client's next message still routes.
    async fn recover_expired(
        &self,
        cmd: &PromptCommand,
        prompt: &str,
        working_dir: PathBuf,
        stale_key: &str,
    ) -> Result<TurnOutcome> {
        self.manager.cleanup_dead_session(stale_key).await;
        self.emitter.clear_session(stale_key).await;

        let fresh = self.manager.create_session(None, working_dir.clone()).await;
        self.manager.begin_turn(&fresh.id).await?;
        self.emitter.begin_turn(&fresh.id).await;

        let view = SessionView {
            internal_id: fresh.id.clone(),
            external_id: None,
            working_dir,
        };
        let outcome = self
            .run_attempts(&fresh.id, &view, prompt, cmd.skip_permissions)
            .await;
        self.manager.end_turn(&fresh.id).await;

        let stale = cmd.session_id.as_deref().filter(|id| *id != fresh.id);
        self.finalize(&fresh.id, outcome, stale).await
    }

    /// Execute with the bounded retry loop, pumping classified messages
    /// into the emitter as they stream. Rate limiting retries in place;
    /// every other outcome is returned to the caller. Errors from the
    /// executor itself (spawn failure, exhausted retries) fold into
    /// `Failed` so the turn still terminates with exactly one event.
    async fn run_attempts(
        &self,
        key: &str,
        view: &SessionView,
        prompt: &str,
        skip_permissions: bool,
    ) -> ExecutionOutcome {
        let (chunk_tx, chunk_rx) = mpsc::channel::<ClassifiedMessage>(64);
        let pump = self.spawn_pump(key.to_string(), chunk_rx);

        let max_attempts = self.settings.agent.max_retries;
        let mut attempt = 1u32;
        let outcome = loop {
            let result = self
                .executor
                .execute(view, prompt, chunk_tx.clone(), skip_permissions)
                .await;
            match result {
                Ok(ExecutionOutcome::RateLimited { message }) => {
                    if attempt >= max_attempts {
                        break ExecutionOutcome::Failed {
                            code: None,
                            stderr: TetherError::RetriesExhausted {
                                attempts: attempt,
                                last_error: message,
                            }
                            .to_string(),
                        };
                    }
                    let delay = backoff_delay(attempt);
                    warn!(
                        "Rate limited on attempt {}/{} for session '{}', retrying in {:?}",
                        attempt, max_attempts, key, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(other) => break other,
                Err(e) => {
                    break ExecutionOutcome::Failed {
                        code: None,
                        stderr: e.to_string(),
                    };
                }
            }
        };

        // Close the stream and let the pump drain before the terminal
        // outcome is acted on, preserving per-session event order.
        drop(chunk_tx);
        if let Err(e) = pump.await {
            warn!("Chunk pump for session '{}' panicked: {}", key, e);
        }
        outcome
    }

    /// Drain classified messages for one turn: reconcile agent-assigned ids,
    /// track activity, and forward the emitter's events to subscribers.
    fn spawn_pump(
        &self,
        key: String,
        mut chunk_rx: mpsc::Receiver<ClassifiedMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let emitter = Arc::clone(&self.emitter);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(message) = chunk_rx.recv().await {
                if let ClassifiedMessage::SystemInit(ref init) = message {
                    if let Err(e) = manager
                        .map_external_session(&key, &init.session_id)
                        .await
                    {
                        debug!(
                            "Could not map external id '{}' for session '{}': {}",
                            init.session_id, key, e
                        );
                    }
                }
                manager.touch(&key).await;
                for event in emitter.handle_message(&key, message).await {
                    let _ = events.send(event);
                }
            }
        })
    }

    /// Turn an execution outcome into the client-facing summary, performing
    /// id bookkeeping and dead-session garbage collection.
    async fn finalize(
        &self,
        key: &str,
        outcome: ExecutionOutcome,
        stale_id: Option<&str>,
    ) -> Result<TurnOutcome> {
        match outcome {
            ExecutionOutcome::Completed(result) => {
                self.record_result_ids(key, &result, stale_id).await;
                Ok(self.outcome_from_result(key, result).await)
            }
            ExecutionOutcome::AutoSessionCreated {
                external_session_id,
                result,
            } => {
                info!(
                    "Agent auto-created session '{}' for '{}'",
                    external_session_id, key
                );
                let _ = self
                    .manager
                    .map_external_session(key, &external_session_id)
                    .await;
                if let Some(stale) = stale_id {
                    let _ = self.manager.alias_session(stale, key).await;
                }
                Ok(self.outcome_from_result(key, result).await)
            }
            ExecutionOutcome::Cancelled => {
                Ok(TurnOutcome::failed(key, "turn cancelled"))
            }
            ExecutionOutcome::SessionExpired { message } => {
                // Either recovery already ran once, or a fresh turn claimed
                // expiry — both end the turn here.
                self.fail_turn(key, format!("session expired: {message}")).await
            }
            ExecutionOutcome::RateLimited { message } => {
                // Unreachable from run_attempts, but terminal if it happens.
                self.fail_turn(key, format!("rate limited: {message}")).await
            }
            ExecutionOutcome::Failed { code, stderr } => {
                let detail = if stderr.trim().is_empty() {
                    format!("agent process failed (exit code {code:?})")
                } else {
                    stderr
                };
                self.fail_turn(key, detail).await
            }
        }
    }

    async fn record_result_ids(&self, key: &str, result: &FinalResult, stale_id: Option<&str>) {
        if let Some(ref external) = result.session_id {
            let _ = self.manager.map_external_session(key, external).await;
        }
        if let Some(stale) = stale_id {
            let _ = self.manager.alias_session(stale, key).await;
        }
    }

    async fn outcome_from_result(&self, key: &str, result: FinalResult) -> TurnOutcome {
        let session_id = self
            .manager
            .get_session(key)
            .await
            .and_then(|s| s.external_id)
            .unwrap_or_else(|| key.to_string());
        if result.success() {
            TurnOutcome::ok(session_id, result.result.unwrap_or_default())
        } else {
            TurnOutcome::failed(
                session_id,
                result
                    .result
                    .unwrap_or_else(|| "agent reported an error".to_string()),
            )
        }
    }

    /// Terminal failure path: emit the failure as the turn's single
    /// `conversation_result`, then garbage-collect the session — the
    /// process is dead and the agent side owns nothing we can resume.
    async fn fail_turn(&self, key: &str, detail: String) -> Result<TurnOutcome> {
        let failure = FinalResult {
            is_error: true,
            result: Some(detail.clone()),
            session_id: None,
            duration_ms: None,
            num_turns: None,
            total_cost_usd: None,
            usage: None,
        };
        for event in self
            .emitter
            .handle_message(key, ClassifiedMessage::FinalResult(failure))
            .await
        {
            let _ = self.events.send(event);
        }
        self.manager.cleanup_dead_session(key).await;
        self.emitter.clear_session(key).await;
        Ok(TurnOutcome::failed(key, detail))
    }
}
