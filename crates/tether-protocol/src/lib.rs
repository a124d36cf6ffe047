//! Canonical protocol types for Tether.
//!
//! Everything the core and its transports exchange lives here: inbound
//! commands from clients, outbound session events, the raw stream-json
//! records emitted by the agent CLI, and the classifier that normalizes
//! those records. This crate is pure data — no I/O, no async.

pub mod classify;
pub mod commands;
pub mod events;
pub mod records;

pub use classify::{ClassifiedMessage, classify, mentions_permission, mentions_tool};
pub use commands::{PermissionReply, PromptCommand, TurnOutcome};
pub use events::{EventPayload, SessionEvent};
pub use records::{FinalResult, SystemInit, UsageTotals};
