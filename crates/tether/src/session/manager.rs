//! Session registry.
//!
//! Owns the mapping from session ids to live conversation state: creation,
//! external-id reconciliation (the agent may assign its own id independent
//! of what the client sent), activity/timeout bookkeeping, background marks,
//! and dead-session cleanup. At most one turn may be in flight per session;
//! the registry enforces it with an explicit claim/release pair.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::{debug, info};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, TetherError};

/// Client-visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Backgrounded,
}

/// One logical conversation.
#[derive(Debug, Clone)]
pub struct Session {
    /// Our routing key.
    pub id: String,
    /// Agent-assigned id, once known; drives `--resume`.
    pub external_id: Option<String>,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub lifecycle: Lifecycle,
    /// The agent has confirmed the conversation (first init seen).
    pub conversation_started: bool,
    /// A turn is executing right now.
    pub in_flight: bool,
    /// PID of the live subprocess, while one exists.
    pub pid: Option<u32>,
}

/// Point-in-time snapshot for sweeps and status endpoints.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub external_id: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub in_flight: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    /// external/previous id -> registry key.
    aliases: RwLock<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session record. `requested_id` is honored when given (a
    /// continuation whose registry entry vanished); otherwise a fresh
    /// internal id is minted.
    pub async fn create_session(
        &self,
        requested_id: Option<&str>,
        working_dir: PathBuf,
    ) -> Session {
        let id = requested_id
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            external_id: None,
            working_dir,
            created_at: now,
            last_activity: now,
            lifecycle: Lifecycle::Active,
            conversation_started: false,
            in_flight: false,
            pid: None,
        };
        info!("Created session '{}'", id);
        self.sessions
            .write()
            .await
            .insert(id.clone(), session.clone());
        session
    }

    /// Resolve an id through the alias table to the registry key.
    pub async fn resolve_id(&self, id: &str) -> Option<String> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(id) {
                return Some(id.to_string());
            }
        }
        self.aliases.read().await.get(id).cloned()
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.resolve_id(id).await.is_some()
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        let key = self.resolve_id(id).await?;
        self.sessions.read().await.get(&key).cloned()
    }

    /// Record that a local session now corresponds to an agent-assigned
    /// external id, and alias the external id back to the registry key so
    /// client messages using either id route to the same record.
    pub async fn map_external_session(&self, id: &str, external_id: &str) -> Result<()> {
        let key = self
            .resolve_id(id)
            .await
            .ok_or_else(|| TetherError::SessionNotFound(id.to_string()))?;
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&key)
                .ok_or_else(|| TetherError::SessionNotFound(id.to_string()))?;
            session.external_id = Some(external_id.to_string());
            session.conversation_started = true;
            session.last_activity = Utc::now();
        }
        if external_id != key {
            debug!("Aliased external id '{}' -> session '{}'", external_id, key);
            self.aliases
                .write()
                .await
                .insert(external_id.to_string(), key);
        }
        Ok(())
    }

    /// Alias an arbitrary stale id to an existing session (expiry recovery:
    /// the client may keep using the id of the conversation that died).
    pub async fn alias_session(&self, stale_id: &str, id: &str) -> Result<()> {
        let key = self
            .resolve_id(id)
            .await
            .ok_or_else(|| TetherError::SessionNotFound(id.to_string()))?;
        if stale_id == key {
            return Ok(());
        }
        self.aliases
            .write()
            .await
            .insert(stale_id.to_string(), key);
        Ok(())
    }

    /// Claim the single-writer slot for a session. Fails with `SessionBusy`
    /// when a turn is already executing.
    pub async fn begin_turn(&self, id: &str) -> Result<()> {
        let key = self
            .resolve_id(id)
            .await
            .ok_or_else(|| TetherError::SessionNotFound(id.to_string()))?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&key)
            .ok_or_else(|| TetherError::SessionNotFound(id.to_string()))?;
        if session.in_flight {
            return Err(TetherError::SessionBusy(key));
        }
        session.in_flight = true;
        session.last_activity = Utc::now();
        Ok(())
    }

    /// Release the single-writer slot.
    pub async fn end_turn(&self, id: &str) {
        if let Some(key) = self.resolve_id(id).await {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&key) {
                session.in_flight = false;
                session.pid = None;
                session.last_activity = Utc::now();
            }
        }
    }

    pub async fn touch(&self, id: &str) {
        if let Some(key) = self.resolve_id(id).await {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&key) {
                session.last_activity = Utc::now();
            }
        }
    }

    pub async fn set_pid(&self, id: &str, pid: Option<u32>) {
        if let Some(key) = self.resolve_id(id).await {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&key) {
                session.pid = pid;
            }
        }
    }

    pub async fn mark_backgrounded(&self, id: &str) {
        self.set_lifecycle(id, Lifecycle::Backgrounded).await;
    }

    pub async fn mark_foregrounded(&self, id: &str) {
        self.set_lifecycle(id, Lifecycle::Active).await;
    }

    async fn set_lifecycle(&self, id: &str, lifecycle: Lifecycle) {
        if let Some(key) = self.resolve_id(id).await {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&key) {
                session.lifecycle = lifecycle;
            }
        }
    }

    /// Advisory timeout check; eviction itself happens in the health sweep.
    pub async fn check_session_timeout(&self, id: &str, timeout: std::time::Duration) -> bool {
        match self.get_session(id).await {
            Some(session) => {
                let idle = Utc::now().signed_duration_since(session.last_activity);
                idle.num_seconds() >= 0 && idle.num_seconds() as u64 > timeout.as_secs()
            }
            None => false,
        }
    }

    /// Remove a session (and every alias pointing at it) after its process
    /// is confirmed dead.
    pub async fn cleanup_dead_session(&self, id: &str) -> Option<Session> {
        let key = self.resolve_id(id).await?;
        let removed = self.sessions.write().await.remove(&key);
        if removed.is_some() {
            let mut aliases = self.aliases.write().await;
            aliases.retain(|_, value| value != &key);
            info!("Cleaned up session '{}'", key);
        }
        removed
    }

    pub async fn remove_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        self.aliases.write().await.clear();
        count
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Backdate a session's activity clock (test hook for timeout sweeps).
    #[cfg(test)]
    pub async fn set_last_activity(&self, id: &str, at: DateTime<Utc>) {
        if let Some(key) = self.resolve_id(id).await {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&key) {
                session.last_activity = at;
            }
        }
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| SessionSnapshot {
                id: s.id.clone(),
                external_id: s.external_id.clone(),
                last_activity: s.last_activity,
                in_flight: s.in_flight,
                pid: s.pid,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_and_resolve() {
        let manager = SessionManager::new();
        let session = manager.create_session(None, PathBuf::from("/tmp")).await;
        assert!(manager.has_session(&session.id).await);
        assert!(!manager.has_session("nope").await);
    }

    #[tokio::test]
    async fn test_external_mapping_routes_both_ids() {
        let manager = SessionManager::new();
        let session = manager.create_session(None, PathBuf::from("/tmp")).await;
        manager
            .map_external_session(&session.id, "ext-123")
            .await
            .unwrap();

        let by_external = manager.get_session("ext-123").await.unwrap();
        assert_eq!(by_external.id, session.id);
        assert_eq!(by_external.external_id.as_deref(), Some("ext-123"));
        assert!(by_external.conversation_started);
    }

    #[tokio::test]
    async fn test_alias_stale_id_after_expiry_recovery() {
        let manager = SessionManager::new();
        let fresh = manager.create_session(None, PathBuf::from("/tmp")).await;
        manager
            .map_external_session(&fresh.id, "ext-new")
            .await
            .unwrap();
        manager.alias_session("ext-stale", &fresh.id).await.unwrap();

        let via_stale = manager.get_session("ext-stale").await.unwrap();
        let via_new = manager.get_session("ext-new").await.unwrap();
        assert_eq!(via_stale.id, via_new.id);
    }

    #[tokio::test]
    async fn test_single_writer_per_session() {
        let manager = SessionManager::new();
        let session = manager.create_session(None, PathBuf::from("/tmp")).await;

        manager.begin_turn(&session.id).await.unwrap();
        assert!(matches!(
            manager.begin_turn(&session.id).await,
            Err(TetherError::SessionBusy(_))
        ));

        manager.end_turn(&session.id).await;
        manager.begin_turn(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_removes_aliases() {
        let manager = SessionManager::new();
        let session = manager.create_session(None, PathBuf::from("/tmp")).await;
        manager
            .map_external_session(&session.id, "ext-1")
            .await
            .unwrap();

        assert!(manager.cleanup_dead_session("ext-1").await.is_some());
        assert!(!manager.has_session(&session.id).await);
        assert!(!manager.has_session("ext-1").await);
    }

    #[tokio::test]
    async fn test_timeout_check_is_advisory() {
        let manager = SessionManager::new();
        let session = manager.create_session(None, PathBuf::from("/tmp")).await;

        assert!(
            !manager
                .check_session_timeout(&session.id, Duration::from_secs(3600))
                .await
        );
        // Zero-duration timeout: anything that has ever been touched is
        // technically past it only after a second has elapsed, so a fresh
        // session still reads as alive.
        assert!(
            !manager
                .check_session_timeout(&session.id, Duration::from_secs(0))
                .await
        );
        // Still registered either way.
        assert!(manager.has_session(&session.id).await);
    }

    #[tokio::test]
    async fn test_background_marks_do_not_destroy() {
        let manager = SessionManager::new();
        let session = manager.create_session(None, PathBuf::from("/tmp")).await;

        manager.mark_backgrounded(&session.id).await;
        let s = manager.get_session(&session.id).await.unwrap();
        assert_eq!(s.lifecycle, Lifecycle::Backgrounded);

        manager.mark_foregrounded(&session.id).await;
        let s = manager.get_session(&session.id).await.unwrap();
        assert_eq!(s.lifecycle, Lifecycle::Active);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let manager = SessionManager::new();
        manager.create_session(None, PathBuf::from("/tmp")).await;
        manager.create_session(None, PathBuf::from("/tmp")).await;
        assert_eq!(manager.remove_all().await, 2);
        assert_eq!(manager.session_count().await, 0);
    }
}
