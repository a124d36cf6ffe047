//! Inbound command types.
//!
//! These are the payloads the transport layer hands to the core: a prompt
//! for a (possibly new) session, and a reply to an outstanding permission
//! request. The core answers a prompt with a [`TurnOutcome`].

use serde::{Deserialize, Serialize};

/// A client-supplied file payload, carried inline as base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    /// Original filename as the client knows it.
    pub name: String,
    /// Base64-encoded file contents.
    pub data: String,
}

/// A prompt for one conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCommand {
    /// Session to continue, or `None` to start a new conversation.
    #[serde(default)]
    pub session_id: Option<String>,
    /// The user's prompt text.
    pub prompt: String,
    /// Working directory the agent runs in.
    pub working_directory: String,
    /// Files to stage for the agent before the turn starts.
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    /// Skip the permission gate entirely for this turn.
    #[serde(default)]
    pub skip_permissions: bool,
}

/// A reply to an outstanding permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionReply {
    pub session_id: String,
    /// `approve` / `y` / `yes` approve, `deny` denies (trimmed,
    /// case-insensitive). Anything else is not a permission reply.
    pub response: String,
    /// Client hint to remember this decision. Tracked, not acted on here.
    #[serde(default)]
    pub remember: bool,
}

/// Terminal outcome of one turn, returned to the caller that submitted the
/// prompt. Streaming detail goes out through session events; this is the
/// request/response summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub success: bool,
    /// The session id the client should use from now on. May differ from the
    /// requested id when the agent assigned a fresh one.
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnOutcome {
    pub fn ok(session_id: impl Into<String>, result_text: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: session_id.into(),
            result_text: Some(result_text.into()),
            error: None,
        }
    }

    pub fn failed(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: session_id.into(),
            result_text: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_command_minimal() {
        let json = r#"{"prompt":"list files","working_directory":"/tmp/proj"}"#;
        let cmd: PromptCommand = serde_json::from_str(json).unwrap();
        assert!(cmd.session_id.is_none());
        assert!(cmd.attachments.is_empty());
        assert!(!cmd.skip_permissions);
    }

    #[test]
    fn test_turn_outcome_serialization() {
        let outcome = TurnOutcome::ok("ext-123", "file1.txt\nfile2.txt");
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"session_id\":\"ext-123\""));
        assert!(!json.contains("error"));
    }
}
