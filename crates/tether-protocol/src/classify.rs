//! Classifier for raw agent output records.
//!
//! A pure, stateless transform from one parsed stdout line to a
//! [`ClassifiedMessage`]. Dispatch is on the record's `type` discriminant;
//! unknown discriminants (and records that fail their shape) are preserved
//! as [`ClassifiedMessage::Unknown`] so nothing the agent says is dropped on
//! the floor — downstream decides what to do with them.

use serde_json::Value;

use crate::records::{AssistantBody, FinalResult, PermissionRequest, SystemInit, UsageTotals};

/// One normalized agent output record.
#[derive(Debug, Clone)]
pub enum ClassifiedMessage {
    /// `system`/`init`: session metadata, tool list, model.
    SystemInit(SystemInit),
    /// Assistant content blocks, possibly containing tool invocations.
    AssistantResponse {
        content: Value,
        model: Option<String>,
        usage: Option<UsageTotals>,
    },
    /// A tool invocation surfaced as its own record.
    ToolUse {
        id: Option<String>,
        name: String,
        input: Value,
    },
    /// The outcome of a tool invocation.
    ToolResult {
        tool_use_id: Option<String>,
        content: Value,
        is_error: bool,
    },
    /// Structured permission request.
    PermissionRequest(PermissionRequest),
    /// Terminal record of the turn.
    FinalResult(FinalResult),
    /// Anything the bridge does not recognize, carried through raw.
    Unknown(Value),
}

/// Classify one raw record.
///
/// Never fails: a record whose discriminant is unknown, or whose body does
/// not match the expected shape, comes back as `Unknown` with the original
/// value intact.
pub fn classify(raw: Value) -> ClassifiedMessage {
    let Some(kind) = raw.get("type").and_then(Value::as_str) else {
        return ClassifiedMessage::Unknown(raw);
    };

    match kind {
        "system" => classify_system(raw),
        "assistant" => classify_assistant(raw),
        "result" => match serde_json::from_value::<FinalResult>(raw.clone()) {
            Ok(result) => ClassifiedMessage::FinalResult(result),
            Err(_) => ClassifiedMessage::Unknown(raw),
        },
        "tool_use" => {
            let name = raw.get("name").and_then(Value::as_str).map(str::to_owned);
            match name {
                Some(name) => ClassifiedMessage::ToolUse {
                    id: raw.get("id").and_then(Value::as_str).map(str::to_owned),
                    name,
                    input: raw.get("input").cloned().unwrap_or(Value::Null),
                },
                None => ClassifiedMessage::Unknown(raw),
            }
        }
        "tool_result" => ClassifiedMessage::ToolResult {
            tool_use_id: raw
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            content: raw.get("content").cloned().unwrap_or(Value::Null),
            is_error: raw
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "permission_request" => match serde_json::from_value::<PermissionRequest>(raw.clone()) {
            Ok(request) => ClassifiedMessage::PermissionRequest(request),
            Err(_) => ClassifiedMessage::Unknown(raw),
        },
        _ => ClassifiedMessage::Unknown(raw),
    }
}

fn classify_system(raw: Value) -> ClassifiedMessage {
    let subtype = raw.get("subtype").and_then(Value::as_str);
    if subtype != Some("init") {
        return ClassifiedMessage::Unknown(raw);
    }
    match serde_json::from_value::<SystemInit>(raw.clone()) {
        Ok(init) => ClassifiedMessage::SystemInit(init),
        Err(_) => ClassifiedMessage::Unknown(raw),
    }
}

fn classify_assistant(raw: Value) -> ClassifiedMessage {
    let Some(message) = raw.get("message") else {
        return ClassifiedMessage::Unknown(raw);
    };
    // Only structured content arrays get the typed treatment; everything
    // else passes through raw.
    if !message.get("content").is_some_and(Value::is_array) {
        return ClassifiedMessage::Unknown(raw);
    }
    match serde_json::from_value::<AssistantBody>(message.clone()) {
        Ok(body) => ClassifiedMessage::AssistantResponse {
            content: body.content,
            model: body.model,
            usage: body.usage,
        },
        Err(_) => ClassifiedMessage::Unknown(raw),
    }
}

/// Coarse signal: does assistant content textually mention permissions?
///
/// Substring match, case-insensitive. False positives are tolerable — the
/// authoritative signal is a structured `permission_request` record when the
/// agent emits one.
pub fn mentions_permission(content: &Value) -> bool {
    content_text_matches(content, "permission")
}

/// Coarse signal: does assistant content textually mention a tool?
pub fn mentions_tool(content: &Value) -> bool {
    content_text_matches(content, "tool")
}

fn content_text_matches(content: &Value, needle: &str) -> bool {
    match content {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(blocks) => blocks.iter().any(|b| {
            b.get("text")
                .and_then(Value::as_str)
                .is_some_and(|t| t.to_lowercase().contains(needle))
        }),
        _ => false,
    }
}
