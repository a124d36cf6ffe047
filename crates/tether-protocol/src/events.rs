//! Outbound session events.
//!
//! Every observable fact the core produces flows out as a [`SessionEvent`]:
//! an envelope of session id + timestamp around a tagged payload. Transports
//! (WebSocket push, notification dispatch) subscribe to the stream and pick
//! what they forward; the core never knows who is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::records::UsageTotals;

/// Envelope for one outbound event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Events emitted by the core, tagged for transports.
///
/// All variants are session-scoped via the [`SessionEvent`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// The agent announced (or confirmed) its session.
    SystemInit {
        external_session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Assistant content blocks (progress, not terminal).
    AssistantMessage {
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },

    /// Tool invocation in progress.
    ToolUse {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        tool_name: String,
        input: Value,
    },

    /// Tool invocation outcome.
    ToolResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        content: Value,
        is_error: bool,
    },

    /// A human decision is required before the turn can finish.
    PermissionRequired {
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        message: String,
    },

    /// The human denied the outstanding request; the turn's buffered result
    /// was discarded.
    PermissionDenied,

    /// Terminal result of a turn. Emitted exactly once per turn.
    ConversationResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result_text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        external_session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<UsageTotals>,
    },

    /// The session was cancelled mid-flight.
    SessionCancelled { reason: String },

    /// The health sweep flagged this session.
    SessionUnhealthy {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        memory_bytes: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cpu_percent: Option<f32>,
    },

    /// Agent subprocess spawned.
    ProcessStart { pid: u32 },

    /// Agent subprocess exited.
    ProcessExit {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },

    /// One line of agent stderr.
    ProcessStderr { line: String },

    /// A validation or policy check failed. Never silent.
    SecurityViolation { detail: String },

    /// Unrecognized agent record, passed through raw.
    StreamChunk { record: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_envelope_shape() {
        let event = SessionEvent::new(
            "ext-123",
            EventPayload::ConversationResult {
                success: true,
                result_text: Some("done".into()),
                external_session_id: Some("ext-123".into()),
                duration_ms: Some(1500),
                total_cost_usd: None,
                usage: None,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["session_id"], "ext-123");
        assert_eq!(json["type"], "conversation_result");
        assert_eq!(json["success"], true);
        assert!(json.get("total_cost_usd").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_stream_chunk_preserves_record() {
        let record = json!({"type": "telemetry", "n": 3});
        let event = SessionEvent::new("s1", EventPayload::StreamChunk { record: record.clone() });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stream_chunk");
        assert_eq!(json["record"], record);
    }

    #[test]
    fn test_permission_denied_tag() {
        let event = SessionEvent::new("s1", EventPayload::PermissionDenied);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"permission_denied\""));
    }
}
