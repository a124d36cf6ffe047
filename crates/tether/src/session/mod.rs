//! Session registry and per-turn orchestration.

pub mod manager;
pub mod ops;

pub use manager::{Lifecycle, Session, SessionManager, SessionSnapshot};
pub use ops::SessionOps;
