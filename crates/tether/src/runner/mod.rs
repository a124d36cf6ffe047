//! Agent subprocess runner.
//!
//! One [`AgentRunner::execute`] call is one turn: build the argument list,
//! spawn the agent CLI in the session's working directory, stream stdout
//! records to the caller as they arrive, and fold the exit into an
//! [`ExecutionOutcome`]. The runner never buffers classified messages —
//! gating and ordering belong to the response emitter — but it does own the
//! process-level observability events (`process_start`, `process_stderr`,
//! `process_exit`) and the cancellation path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use tether_protocol::classify::{ClassifiedMessage, classify};
use tether_protocol::events::{EventPayload, SessionEvent};
use tether_protocol::records::FinalResult;

use crate::error::{Result, TetherError};
use crate::settings::AgentConfig;

/// The slice of session state the runner needs for one turn.
#[derive(Debug, Clone)]
pub struct SessionView {
    /// Routing key for events (ours, not the agent's).
    pub internal_id: String,
    /// Agent-assigned id from a prior turn; drives `--resume`.
    pub external_id: Option<String>,
    /// Validated working directory.
    pub working_dir: PathBuf,
}

/// How a turn's subprocess run ended.
///
/// An explicit sum type instead of error-shape sniffing: each variant maps
/// to one retry-orchestrator behavior.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The agent emitted a terminal result record (or a recognized benign
    /// exit with a continuation hint).
    Completed(FinalResult),
    /// The agent errored at the process level but announced a freshly
    /// created session on the way — a successful turn yielding a new
    /// external id, not a failure.
    AutoSessionCreated {
        external_session_id: String,
        result: FinalResult,
    },
    /// Transient: retry with backoff.
    RateLimited { message: String },
    /// The resumed session no longer exists on the agent side.
    SessionExpired { message: String },
    /// The turn was cancelled via [`AgentRunner::cancel`].
    Cancelled,
    /// Non-retryable process failure.
    Failed { code: Option<i32>, stderr: String },
}

/// Seam between the retry orchestrator and the real subprocess, so retry
/// semantics are testable against scripted outcomes.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    async fn execute(
        &self,
        session: &SessionView,
        prompt: &str,
        chunk_tx: mpsc::Sender<ClassifiedMessage>,
        skip_permissions: bool,
    ) -> Result<ExecutionOutcome>;
}

/// Spawns and supervises one agent subprocess per turn.
pub struct AgentRunner {
    config: AgentConfig,
    events: broadcast::Sender<SessionEvent>,
    active: dashmap::DashMap<String, CancellationToken>,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            config,
            events,
            active: dashmap::DashMap::new(),
        }
    }

    /// Cancel the in-flight turn for a session, if any. Returns whether a
    /// turn was actually running.
    pub fn cancel(&self, internal_id: &str) -> bool {
        if let Some(entry) = self.active.get(internal_id) {
            entry.value().cancel();
            true
        } else {
            false
        }
    }

    /// Cancel every in-flight turn (forced shutdown).
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    /// Number of turns currently executing.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn emit(&self, session_id: &str, payload: EventPayload) {
        let _ = self.events.send(SessionEvent::new(session_id, payload));
    }

    /// Build the agent CLI argument list for one turn.
    fn build_args(&self, session: &SessionView, prompt: &str, skip_permissions: bool) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--verbose".into(),
            "--output-format".into(),
            "stream-json".into(),
        ];

        if skip_permissions || self.config.skip_permissions {
            args.push("--dangerously-skip-permissions".into());
        } else {
            if let Some(ref mode) = self.config.permission_mode {
                args.push("--permission-mode".into());
                args.push(mode.clone());
            }
            if !self.config.allowed_tools.is_empty() {
                args.push("--allowedTools".into());
                args.push(self.config.allowed_tools.join(","));
            }
            if !self.config.disallowed_tools.is_empty() {
                args.push("--disallowedTools".into());
                args.push(self.config.disallowed_tools.join(","));
            }
        }

        if let Some(ref external_id) = session.external_id {
            args.push("--resume".into());
            args.push(external_id.clone());
        }

        // Prompt goes last, after the option terminator. The command is
        // exec'd directly (no shell), so the text is never interpreted.
        args.push("--".into());
        args.push(prompt.to_string());
        args
    }

    /// Environment allowlist for the subprocess.
    fn sanitized_env() -> HashMap<String, String> {
        const KEEP: &[&str] = &["PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "TMPDIR"];
        std::env::vars()
            .filter(|(key, _)| KEEP.contains(&key.as_str()))
            .collect()
    }

    async fn run_turn(
        &self,
        session: &SessionView,
        prompt: &str,
        chunk_tx: mpsc::Sender<ClassifiedMessage>,
        skip_permissions: bool,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let args = self.build_args(session, prompt, skip_permissions);
        debug!(
            "Spawning agent for session '{}' (resume={:?})",
            session.internal_id, session.external_id
        );

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .current_dir(&session.working_dir)
            .env_clear()
            .envs(Self::sanitized_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TetherError::ProcessSpawn)?;

        let Some(pid) = child.id() else {
            return Err(TetherError::ProcessSpawn(std::io::Error::other(
                "agent process exited before a pid was assigned",
            )));
        };
        info!(
            "Agent process started for session '{}' (pid={})",
            session.internal_id, pid
        );
        self.emit(&session.internal_id, EventPayload::ProcessStart { pid });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TetherError::ProcessSpawn(std::io::Error::other("no stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TetherError::ProcessSpawn(std::io::Error::other("no stderr pipe")))?;

        // Stderr drains in its own task so a chatty agent cannot deadlock
        // the stdout loop; lines are kept for failure classification.
        let stderr_lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = {
            let collected = Arc::clone(&stderr_lines);
            let events = self.events.clone();
            let session_id = session.internal_id.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = events.send(SessionEvent::new(
                        &session_id,
                        EventPayload::ProcessStderr { line: line.clone() },
                    ));
                    collected.lock().await.push(line);
                }
            })
        };

        let mut reader = BufReader::new(stdout).lines();
        let mut observed_init: Option<String> = None;
        let mut final_result: Option<FinalResult> = None;

        loop {
            tokio::select! {
                line = reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            let raw: serde_json::Value = match serde_json::from_str(trimmed) {
                                Ok(value) => value,
                                Err(e) => {
                                    debug!(
                                        "Agent[{}] non-JSON stdout line ({}): {}",
                                        session.internal_id, e, trimmed
                                    );
                                    continue;
                                }
                            };
                            let message = classify(raw);
                            match &message {
                                ClassifiedMessage::SystemInit(init) => {
                                    observed_init = Some(init.session_id.clone());
                                }
                                ClassifiedMessage::FinalResult(result) => {
                                    final_result = Some(result.clone());
                                }
                                _ => {}
                            }
                            // The receiver going away mid-turn is not fatal;
                            // the exit classification below still runs.
                            if chunk_tx.send(message).await.is_err() {
                                debug!(
                                    "Chunk receiver dropped for session '{}'",
                                    session.internal_id
                                );
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(
                                "Error reading agent stdout for session '{}': {}",
                                session.internal_id, e
                            );
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Killing agent process for session '{}'", session.internal_id);
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    stderr_task.abort();
                    self.emit(&session.internal_id, EventPayload::ProcessExit { code: None });
                    return Ok(ExecutionOutcome::Cancelled);
                }
            }
        }

        let status = child.wait().await?;
        let _ = stderr_task.await;
        let stderr_text = stderr_lines.lock().await.join("\n");
        self.emit(
            &session.internal_id,
            EventPayload::ProcessExit {
                code: status.code(),
            },
        );

        Ok(self.classify_exit(session, status.code(), observed_init, final_result, stderr_text))
    }

    /// Fold exit status + observed records into an outcome.
    fn classify_exit(
        &self,
        session: &SessionView,
        code: Option<i32>,
        observed_init: Option<String>,
        final_result: Option<FinalResult>,
        stderr: String,
    ) -> ExecutionOutcome {
        // A terminal result record is authoritative regardless of exit code.
        if let Some(result) = final_result {
            return ExecutionOutcome::Completed(result);
        }

        if code == Some(0) {
            // Stream ended cleanly without a result record. An init record
            // still makes the turn useful (the session exists); otherwise
            // the agent broke its own protocol.
            return match observed_init {
                Some(external_id) => {
                    ExecutionOutcome::Completed(continuation_result(external_id))
                }
                None => ExecutionOutcome::Failed {
                    code,
                    stderr: "agent exited without emitting a result record".into(),
                },
            };
        }

        if looks_rate_limited(&stderr) {
            return ExecutionOutcome::RateLimited { message: stderr };
        }
        if looks_expired(&stderr) {
            return ExecutionOutcome::SessionExpired { message: stderr };
        }

        // Error-path exit that nevertheless announced a fresh session: the
        // agent created a conversation before falling over, and the client
        // can continue it. Surface the new id as success.
        if let Some(external_id) = observed_init {
            if session.external_id.as_deref() != Some(external_id.as_str()) {
                return ExecutionOutcome::AutoSessionCreated {
                    external_session_id: external_id.clone(),
                    result: continuation_result(external_id),
                };
            }
            if code.is_some_and(|c| self.config.benign_exit_codes.contains(&c)) {
                return ExecutionOutcome::Completed(continuation_result(external_id));
            }
        }

        ExecutionOutcome::Failed { code, stderr }
    }
}

#[async_trait]
impl TurnExecutor for AgentRunner {
    async fn execute(
        &self,
        session: &SessionView,
        prompt: &str,
        chunk_tx: mpsc::Sender<ClassifiedMessage>,
        skip_permissions: bool,
    ) -> Result<ExecutionOutcome> {
        let cancel = CancellationToken::new();
        self.active
            .insert(session.internal_id.clone(), cancel.clone());
        let outcome = self
            .run_turn(session, prompt, chunk_tx, skip_permissions, cancel)
            .await;
        self.active.remove(&session.internal_id);
        outcome
    }
}

/// Synthesized success for turns that ended with a continuation hint instead
/// of a result record.
fn continuation_result(external_id: String) -> FinalResult {
    FinalResult {
        is_error: false,
        result: None,
        session_id: Some(external_id),
        duration_ms: None,
        num_turns: None,
        total_cost_usd: None,
        usage: None,
    }
}

fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("overloaded")
}

fn looks_expired(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("no conversation found")
        || lower.contains("session not found")
        || lower.contains("session expired")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_with(config: AgentConfig) -> AgentRunner {
        let (events, _) = broadcast::channel(16);
        AgentRunner::new(config, events)
    }

    fn base_config() -> AgentConfig {
        AgentConfig {
            binary: PathBuf::from("claude"),
            permission_mode: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            skip_permissions: false,
            benign_exit_codes: Vec::new(),
            max_retries: 3,
        }
    }

    fn view(external: Option<&str>) -> SessionView {
        SessionView {
            internal_id: "s1".into(),
            external_id: external.map(str::to_owned),
            working_dir: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn test_build_args_fresh_session() {
        let runner = runner_with(base_config());
        let args = runner.build_args(&view(None), "list files", false);
        assert_eq!(
            args,
            vec![
                "--print",
                "--verbose",
                "--output-format",
                "stream-json",
                "--",
                "list files"
            ]
        );
    }

    #[test]
    fn test_build_args_resume_and_permissions() {
        let mut config = base_config();
        config.permission_mode = Some("default".into());
        config.allowed_tools = vec!["Read".into(), "Grep".into()];
        config.disallowed_tools = vec!["Bash".into()];
        let runner = runner_with(config);

        let args = runner.build_args(&view(Some("ext-123")), "continue", false);
        assert!(args.windows(2).any(|w| w == ["--resume", "ext-123"]));
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "default"]));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Read,Grep"]));
        assert!(args.windows(2).any(|w| w == ["--disallowedTools", "Bash"]));
        assert_eq!(args.last().unwrap(), "continue");
    }

    #[test]
    fn test_build_args_skip_permissions_wins() {
        let mut config = base_config();
        config.permission_mode = Some("default".into());
        let runner = runner_with(config);

        let args = runner.build_args(&view(None), "go", true);
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!args.contains(&"--permission-mode".to_string()));
    }

    #[test]
    fn test_classify_exit_final_result_wins() {
        let runner = runner_with(base_config());
        let result = FinalResult {
            is_error: false,
            result: Some("done".into()),
            session_id: Some("ext-1".into()),
            duration_ms: Some(10),
            num_turns: None,
            total_cost_usd: None,
            usage: None,
        };
        // Even a non-zero exit defers to an explicit result record.
        let outcome =
            runner.classify_exit(&view(None), Some(1), None, Some(result), String::new());
        assert!(matches!(outcome, ExecutionOutcome::Completed(r) if r.success()));
    }

    #[test]
    fn test_classify_exit_rate_limited() {
        let runner = runner_with(base_config());
        let outcome = runner.classify_exit(
            &view(Some("ext-1")),
            Some(1),
            None,
            None,
            "API Error: 429 Too Many Requests".into(),
        );
        assert!(matches!(outcome, ExecutionOutcome::RateLimited { .. }));
    }

    #[test]
    fn test_classify_exit_expired() {
        let runner = runner_with(base_config());
        let outcome = runner.classify_exit(
            &view(Some("ext-1")),
            Some(1),
            None,
            None,
            "No conversation found with session ID ext-1".into(),
        );
        assert!(matches!(outcome, ExecutionOutcome::SessionExpired { .. }));
    }

    #[test]
    fn test_classify_exit_auto_created_session() {
        let runner = runner_with(base_config());
        let outcome = runner.classify_exit(
            &view(None),
            Some(1),
            Some("ext-new".into()),
            None,
            "something odd".into(),
        );
        match outcome {
            ExecutionOutcome::AutoSessionCreated {
                external_session_id,
                result,
            } => {
                assert_eq!(external_session_id, "ext-new");
                assert!(result.success());
            }
            other => panic!("expected AutoSessionCreated, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_exit_benign_code_is_continuation() {
        let mut config = base_config();
        config.benign_exit_codes = vec![143];
        let runner = runner_with(config);

        let outcome = runner.classify_exit(
            &view(Some("ext-1")),
            Some(143),
            Some("ext-1".into()),
            None,
            String::new(),
        );
        assert!(matches!(outcome, ExecutionOutcome::Completed(r) if r.success()));
    }

    #[test]
    fn test_classify_exit_plain_failure() {
        let runner = runner_with(base_config());
        let outcome = runner.classify_exit(
            &view(Some("ext-1")),
            Some(2),
            None,
            None,
            "boom".into(),
        );
        assert!(matches!(
            outcome,
            ExecutionOutcome::Failed { code: Some(2), .. }
        ));
    }

    #[test]
    fn test_clean_exit_without_result_needs_init() {
        let runner = runner_with(base_config());
        let ok = runner.classify_exit(&view(None), Some(0), Some("ext-9".into()), None, String::new());
        assert!(matches!(ok, ExecutionOutcome::Completed(_)));

        let bad = runner.classify_exit(&view(None), Some(0), None, None, String::new());
        assert!(matches!(bad, ExecutionOutcome::Failed { .. }));
    }
}
