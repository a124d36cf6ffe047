//! Response emitter: per-session turn buffering and the permission gate.
//!
//! Classified messages flow through here one at a time, in subprocess order.
//! Most are emitted immediately; a `final_result` that lands while a
//! permission request is outstanding is stashed until the human decides.
//! Exactly one terminal event (`conversation_result` or `permission_denied`)
//! leaves per turn, even when the agent repeats its result record.

use std::collections::HashMap;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::RwLock;

use tether_protocol::classify::{ClassifiedMessage, mentions_permission};
use tether_protocol::events::{EventPayload, SessionEvent};
use tether_protocol::records::FinalResult;

/// Transient state for one turn of one session.
#[derive(Debug, Default)]
struct SessionBuffer {
    /// Intermediate messages seen this turn, in arrival order.
    messages: Vec<ClassifiedMessage>,
    /// A permission request is outstanding.
    pending_permission: bool,
    /// Final result stashed behind the permission gate.
    pending_final: Option<FinalResult>,
    /// The turn already produced its terminal event.
    turn_complete: bool,
}

impl SessionBuffer {
    fn reset(&mut self) {
        self.messages.clear();
        self.pending_permission = false;
        self.pending_final = None;
        self.turn_complete = false;
    }
}

/// Outcome of feeding a permission reply to the emitter.
#[derive(Debug)]
pub enum PermissionDisposition {
    /// The reply resolved the gate; emit these events.
    Resolved(Vec<SessionEvent>),
    /// No pending state (or unrecognized wording) — the caller should treat
    /// the input as an ordinary new prompt.
    NotAPermissionReply,
}

/// Per-session buffering and gating state.
#[derive(Debug, Default)]
pub struct ResponseEmitter {
    buffers: RwLock<HashMap<String, SessionBuffer>>,
}

impl ResponseEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh turn for a session, clearing any stale buffer state.
    pub async fn begin_turn(&self, session_id: &str) {
        let mut buffers = self.buffers.write().await;
        buffers.entry(session_id.to_string()).or_default().reset();
    }

    /// Whether the session has a permission decision outstanding (including
    /// a stashed final result).
    pub async fn has_unresolved_permission(&self, session_id: &str) -> bool {
        let buffers = self.buffers.read().await;
        buffers
            .get(session_id)
            .is_some_and(|b| b.pending_permission || b.pending_final.is_some())
    }

    /// Drop all buffer state for a session (dead-session cleanup).
    pub async fn clear_session(&self, session_id: &str) {
        self.buffers.write().await.remove(session_id);
    }

    /// Drop every buffer (startup cleanup).
    pub async fn clear_all(&self) {
        self.buffers.write().await.clear();
    }

    /// Process one classified message, returning the events to emit, in
    /// order. The buffer is created on demand: the agent may self-assign a
    /// session id before the registry has seen it.
    pub async fn handle_message(
        &self,
        session_id: &str,
        message: ClassifiedMessage,
    ) -> Vec<SessionEvent> {
        let mut buffers = self.buffers.write().await;
        let buffer = buffers.entry(session_id.to_string()).or_default();

        let mut events = Vec::new();
        match message {
            ClassifiedMessage::SystemInit(ref init) => {
                events.push(SessionEvent::new(
                    session_id,
                    EventPayload::SystemInit {
                        external_session_id: init.session_id.clone(),
                        working_dir: init.cwd.clone(),
                        tools: init.tools.clone(),
                        model: init.model.clone(),
                    },
                ));
                buffer.messages.push(message);
            }
            ClassifiedMessage::AssistantResponse {
                ref content,
                ref model,
                ..
            } => {
                // Coarse textual signal only; a structured permission record
                // is handled below and is authoritative when present.
                if !buffer.pending_permission && mentions_permission(content) {
                    buffer.pending_permission = true;
                    events.push(SessionEvent::new(
                        session_id,
                        EventPayload::PermissionRequired {
                            tool_name: None,
                            message: content_text(content),
                        },
                    ));
                }
                events.push(SessionEvent::new(
                    session_id,
                    EventPayload::AssistantMessage {
                        content: content.clone(),
                        model: model.clone(),
                    },
                ));
                buffer.messages.push(message);
            }
            ClassifiedMessage::PermissionRequest(ref request) => {
                buffer.pending_permission = true;
                let text = request
                    .message
                    .clone()
                    .unwrap_or_else(|| "Permission required".to_string());
                events.push(SessionEvent::new(
                    session_id,
                    EventPayload::PermissionRequired {
                        tool_name: request.tool_name.clone(),
                        message: text.clone(),
                    },
                ));
                // Mirror as an assistant message so chat transcripts show
                // the request inline.
                events.push(SessionEvent::new(
                    session_id,
                    EventPayload::AssistantMessage {
                        content: Value::String(text),
                        model: None,
                    },
                ));
                buffer.messages.push(message);
            }
            ClassifiedMessage::ToolUse {
                ref id,
                ref name,
                ref input,
            } => {
                events.push(SessionEvent::new(
                    session_id,
                    EventPayload::ToolUse {
                        tool_call_id: id.clone(),
                        tool_name: name.clone(),
                        input: input.clone(),
                    },
                ));
                buffer.messages.push(message);
            }
            ClassifiedMessage::ToolResult {
                ref tool_use_id,
                ref content,
                is_error,
            } => {
                events.push(SessionEvent::new(
                    session_id,
                    EventPayload::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content.clone(),
                        is_error,
                    },
                ));
                buffer.messages.push(message);
            }
            ClassifiedMessage::FinalResult(result) => {
                if buffer.turn_complete {
                    warn!(
                        "Duplicate final result for session '{}' ignored",
                        session_id
                    );
                } else if buffer.pending_permission {
                    debug!(
                        "Buffering final result for session '{}' behind permission gate",
                        session_id
                    );
                    buffer.pending_final = Some(result);
                } else {
                    events.push(SessionEvent::new(
                        session_id,
                        conversation_result(&result),
                    ));
                    buffer.reset();
                    buffer.turn_complete = true;
                }
            }
            ClassifiedMessage::Unknown(record) => {
                events.push(SessionEvent::new(
                    session_id,
                    EventPayload::StreamChunk { record },
                ));
            }
        }

        events
    }

    /// Resolve (or reject) a permission reply.
    ///
    /// `approve`/`y`/`yes` approve, `deny` denies — trimmed,
    /// case-insensitive, exact match. Anything else, or a reply for a
    /// session with nothing pending, is `NotAPermissionReply`.
    pub async fn handle_permission_reply(
        &self,
        session_id: &str,
        response: &str,
    ) -> PermissionDisposition {
        let normalized = response.trim().to_lowercase();
        let approved = matches!(normalized.as_str(), "approve" | "y" | "yes");
        let denied = normalized == "deny";
        if !approved && !denied {
            return PermissionDisposition::NotAPermissionReply;
        }

        let mut buffers = self.buffers.write().await;
        let Some(buffer) = buffers.get_mut(session_id) else {
            return PermissionDisposition::NotAPermissionReply;
        };
        if !buffer.pending_permission && buffer.pending_final.is_none() {
            return PermissionDisposition::NotAPermissionReply;
        }

        if approved {
            buffer.pending_permission = false;
            match buffer.pending_final.take() {
                Some(result) => {
                    let event =
                        SessionEvent::new(session_id, conversation_result(&result));
                    buffer.reset();
                    buffer.turn_complete = true;
                    PermissionDisposition::Resolved(vec![event])
                }
                // Approved before the agent finished: the gate opens and the
                // final result will emit as soon as it arrives.
                None => PermissionDisposition::Resolved(Vec::new()),
            }
        } else {
            buffer.reset();
            buffer.turn_complete = true;
            PermissionDisposition::Resolved(vec![SessionEvent::new(
                session_id,
                EventPayload::PermissionDenied,
            )])
        }
    }
}

/// Map a terminal agent record onto the outbound event payload.
fn conversation_result(result: &FinalResult) -> EventPayload {
    EventPayload::ConversationResult {
        success: result.success(),
        result_text: result.result.clone(),
        external_session_id: result.session_id.clone(),
        duration_ms: result.duration_ms,
        total_cost_usd: result.total_cost_usd,
        usage: result.usage.clone(),
    }
}

/// Join the text blocks of assistant content for display.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_protocol::classify::classify;

    fn final_record(text: &str) -> ClassifiedMessage {
        classify(json!({
            "type": "result",
            "is_error": false,
            "result": text,
            "session_id": "ext-123",
            "duration_ms": 1500
        }))
    }

    fn permission_record() -> ClassifiedMessage {
        classify(json!({
            "type": "permission_request",
            "tool_name": "Bash",
            "message": "Allow running `rm -rf build`?"
        }))
    }

    fn payload_types(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| {
                serde_json::to_value(&e.payload).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_plain_turn_emits_result_immediately() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;

        let events = emitter.handle_message("s1", final_record("done")).await;
        assert_eq!(payload_types(&events), vec!["conversation_result"]);
    }

    #[tokio::test]
    async fn test_at_most_one_final_result() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;

        let first = emitter.handle_message("s1", final_record("done")).await;
        assert_eq!(first.len(), 1);
        let second = emitter.handle_message("s1", final_record("done")).await;
        assert!(second.is_empty(), "duplicate final result must not re-emit");
    }

    #[tokio::test]
    async fn test_permission_gates_final_result() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;

        let events = emitter.handle_message("s1", permission_record()).await;
        assert_eq!(
            payload_types(&events),
            vec!["permission_required", "assistant_message"]
        );

        // Final result arrives while the gate is closed: nothing emits.
        let events = emitter.handle_message("s1", final_record("gated")).await;
        assert!(events.is_empty());
        assert!(emitter.has_unresolved_permission("s1").await);

        // Approval releases the stashed payload bit-identically.
        match emitter.handle_permission_reply("s1", " APPROVE ").await {
            PermissionDisposition::Resolved(events) => {
                assert_eq!(payload_types(&events), vec!["conversation_result"]);
                let value = serde_json::to_value(&events[0].payload).unwrap();
                assert_eq!(value["result_text"], "gated");
                assert_eq!(value["external_session_id"], "ext-123");
                assert_eq!(value["duration_ms"], 1500);
            }
            other => panic!("expected Resolved, got {other:?}"),
        }
        assert!(!emitter.has_unresolved_permission("s1").await);
    }

    #[tokio::test]
    async fn test_denial_discards_buffered_result() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;
        emitter.handle_message("s1", permission_record()).await;
        emitter.handle_message("s1", final_record("secret")).await;

        match emitter.handle_permission_reply("s1", "deny").await {
            PermissionDisposition::Resolved(events) => {
                assert_eq!(payload_types(&events), vec!["permission_denied"]);
            }
            other => panic!("expected Resolved, got {other:?}"),
        }

        // The stashed result is gone for good; a late duplicate from the
        // agent must not resurrect it.
        let events = emitter.handle_message("s1", final_record("secret")).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_approval_before_final_opens_gate() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;
        emitter.handle_message("s1", permission_record()).await;

        match emitter.handle_permission_reply("s1", "yes").await {
            PermissionDisposition::Resolved(events) => assert!(events.is_empty()),
            other => panic!("expected Resolved, got {other:?}"),
        }

        let events = emitter.handle_message("s1", final_record("after")).await;
        assert_eq!(payload_types(&events), vec!["conversation_result"]);
    }

    #[tokio::test]
    async fn test_reply_without_pending_state_is_not_permission() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;

        assert!(matches!(
            emitter.handle_permission_reply("s1", "yes").await,
            PermissionDisposition::NotAPermissionReply
        ));
        assert!(matches!(
            emitter.handle_permission_reply("unknown-session", "deny").await,
            PermissionDisposition::NotAPermissionReply
        ));
    }

    #[tokio::test]
    async fn test_unrecognized_wording_is_not_permission() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;
        emitter.handle_message("s1", permission_record()).await;

        assert!(matches!(
            emitter.handle_permission_reply("s1", "sure thing").await,
            PermissionDisposition::NotAPermissionReply
        ));
        // Gate is still closed.
        assert!(emitter.has_unresolved_permission("s1").await);
    }

    #[tokio::test]
    async fn test_buffer_auto_creation_for_unseen_session() {
        let emitter = ResponseEmitter::new();
        // No begin_turn: the agent self-assigned this id mid-stream.
        let events = emitter
            .handle_message(
                "ext-fresh",
                classify(json!({
                    "type": "system", "subtype": "init", "session_id": "ext-fresh"
                })),
            )
            .await;
        assert_eq!(payload_types(&events), vec!["system_init"]);
    }

    #[tokio::test]
    async fn test_assistant_permission_heuristic() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;

        let msg = classify(json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "I need permission to use this tool"}]}
        }));
        let events = emitter.handle_message("s1", msg).await;
        assert_eq!(
            payload_types(&events),
            vec!["permission_required", "assistant_message"]
        );
        assert!(emitter.has_unresolved_permission("s1").await);
    }

    #[tokio::test]
    async fn test_tool_events_pass_through() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;

        let events = emitter
            .handle_message(
                "s1",
                classify(json!({"type": "tool_use", "id": "t1", "name": "Bash", "input": {}})),
            )
            .await;
        assert_eq!(payload_types(&events), vec!["tool_use"]);

        let events = emitter
            .handle_message(
                "s1",
                classify(json!({"type": "tool_result", "tool_use_id": "t1", "content": "ok"})),
            )
            .await;
        assert_eq!(payload_types(&events), vec!["tool_result"]);
    }

    #[tokio::test]
    async fn test_unknown_record_becomes_stream_chunk() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;

        let events = emitter
            .handle_message("s1", classify(json!({"type": "telemetry", "n": 1})))
            .await;
        assert_eq!(payload_types(&events), vec!["stream_chunk"]);
    }

    #[tokio::test]
    async fn test_begin_turn_resets_completed_state() {
        let emitter = ResponseEmitter::new();
        emitter.begin_turn("s1").await;
        emitter.handle_message("s1", final_record("one")).await;

        emitter.begin_turn("s1").await;
        let events = emitter.handle_message("s1", final_record("two")).await;
        assert_eq!(payload_types(&events), vec!["conversation_result"]);
    }
}
