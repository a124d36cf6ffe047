//! Raw stream-json records emitted by the agent CLI.
//!
//! The agent writes one JSON object per stdout line. These types cover the
//! record shapes the bridge understands; anything else is carried through
//! untouched as a raw [`serde_json::Value`] by the classifier. Field names
//! follow the CLI's wire format, so several structs mix snake_case payloads
//! with defaulted optional fields for forward compatibility.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `system`/`init` record: the CLI announces the session it allocated (or
/// resumed) plus its capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInit {
    pub session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Token totals reported on assistant and result records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Body of an `assistant` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantBody {
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageTotals>,
}

/// `result` record: the terminal record of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<UsageTotals>,
}

impl FinalResult {
    /// A turn succeeded unless the CLI flagged it as an error.
    pub fn success(&self) -> bool {
        !self.is_error
    }
}

/// Structured permission request, when the CLI surfaces one as its own
/// record rather than inside assistant text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_init_roundtrip() {
        let json = r#"{"session_id":"ext-123","cwd":"/tmp/proj","tools":["Bash","Read"],"model":"sonnet"}"#;
        let init: SystemInit = serde_json::from_str(json).unwrap();
        assert_eq!(init.session_id, "ext-123");
        assert_eq!(init.tools.len(), 2);
    }

    #[test]
    fn test_final_result_success_flag() {
        let ok: FinalResult =
            serde_json::from_str(r#"{"is_error":false,"result":"done"}"#).unwrap();
        assert!(ok.success());

        let err: FinalResult = serde_json::from_str(r#"{"is_error":true}"#).unwrap();
        assert!(!err.success());
    }

    #[test]
    fn test_final_result_defaults() {
        // A bare result record still parses; every field is optional but the
        // error flag, and that defaults to false.
        let r: FinalResult = serde_json::from_str("{}").unwrap();
        assert!(r.success());
        assert!(r.result.is_none());
        assert!(r.usage.is_none());
    }
}
