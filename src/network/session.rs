//! Per-connection session tracking for the device server.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// One client connection as seen by the server.
#[derive(Debug, Clone)]
pub struct Session {
    /// Random id assigned on connect.
    pub id: String,
    /// Remote socket address.
    pub peer: String,
    /// Connect time, ms since the epoch.
    pub created_at: u64,
    /// Last request time, ms since the epoch.
    pub last_activity: u64,
    /// Requests received so far.
    pub requests: u64,
}

impl Session {
    /// Fresh session with no requests.
    pub fn new(id: String, peer: String) -> Self {
        let now = now_ms();
        Self {
            id,
            peer,
            created_at: now,
            last_activity: now,
            requests: 0,
        }
    }

    /// True when nothing arrived for at least `idle_timeout`.
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        let elapsed = now_ms().saturating_sub(self.last_activity);
        elapsed >= idle_timeout.as_millis() as u64
    }

    /// Record one request.
    pub fn touch(&mut self) {
        self.last_activity = now_ms();
        self.requests += 1;
    }
}

/// Sessions of one server, shared between its connection tasks.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionManager {
    /// No sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    pub async fn create_session(&self, session_id: String, peer: String) -> Session {
        let session = Session::new(session_id.clone(), peer);
        self.sessions.write().await.insert(session_id, session.clone());
        session
    }

    /// Copy of one session.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Record a request on the session. Returns false for unknown ids.
    pub async fn touch(&self, session_id: &str) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Forget a closed connection. Returns false for unknown ids.
    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// All sessions, oldest first.
    pub async fn all_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Sessions idle for at least `idle_timeout`.
    pub async fn idle_sessions(&self, idle_timeout: Duration) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.is_idle(idle_timeout))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_creation() {
        let manager = SessionManager::new();
        let session = manager
            .create_session("session-1".to_string(), "127.0.0.1:4000".to_string())
            .await;

        assert_eq!(session.id, "session-1");
        assert_eq!(session.peer, "127.0.0.1:4000");
        assert_eq!(session.requests, 0);
        assert!(!session.is_idle(Duration::from_secs(60)));
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_touch_counts_requests() {
        let manager = SessionManager::new();
        manager
            .create_session("session-1".to_string(), "peer".to_string())
            .await;

        assert!(manager.touch("session-1").await);
        assert!(manager.touch("session-1").await);
        assert!(!manager.touch("missing").await);
        assert_eq!(manager.get_session("session-1").await.unwrap().requests, 2);
    }

    #[tokio::test]
    async fn test_idle_detection() {
        let manager = SessionManager::new();
        manager
            .create_session("session-1".to_string(), "peer".to_string())
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.idle_sessions(Duration::from_millis(10)).await.len(), 1);
        manager.touch("session-1").await;
        assert!(manager.idle_sessions(Duration::from_secs(10)).await.is_empty());
    }

    #[tokio::test]
    async fn test_session_removal() {
        let manager = SessionManager::new();
        manager
            .create_session("session-1".to_string(), "peer".to_string())
            .await;

        assert!(manager.remove_session("session-1").await);
        assert!(manager.get_session("session-1").await.is_none());
        assert!(!manager.remove_session("session-1").await);
    }
}
