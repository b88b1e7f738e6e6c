//! Session registry implementation
//!
//! The central registry that owns every broadcast session, enforces the
//! concurrency limit and ties each session to its capture resource.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::RwLock;
use tokio::task::JoinSet;

use super::capture::{CaptureProvider, CaptureRequest};
use super::config::RegistryConfig;
use super::entry::{SessionEntry, SessionSummary};
use super::error::RegistryError;
use crate::encoder::StreamConfig;
use crate::error::Result;
use crate::session::{BroadcastSession, Subscription};

/// Central registry for all sessions
///
/// Create takes the write lock for its whole duration, so the duplicate and
/// capacity checks cannot race with another create.
pub struct SessionRegistry<P: CaptureProvider> {
    /// Map of session id to entry
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,

    /// Ids removed recently, oldest first
    tombstones: Mutex<VecDeque<String>>,

    provider: P,

    config: RegistryConfig,
}

impl<P: CaptureProvider> SessionRegistry<P> {
    /// Create a registry with default configuration
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, RegistryConfig::default())
    }

    /// Create a registry with custom configuration
    pub fn with_config(provider: P, config: RegistryConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            tombstones: Mutex::new(VecDeque::new()),
            provider,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Create and start a session
    ///
    /// Checks run in order: config, duplicate id, capacity, capture
    /// allocation, encoder spawn. Nothing is allocated unless capacity
    /// allows, and the capture resource is released again if the encoder
    /// cannot be spawned.
    pub async fn create(
        self: &Arc<Self>,
        id: impl Into<String>,
        stream: StreamConfig,
        request: CaptureRequest,
    ) -> std::result::Result<BroadcastSession, RegistryError> {
        let id = id.into();

        stream
            .validate()
            .map_err(|source| RegistryError::InvalidConfig {
                session: id.clone(),
                source,
            })?;

        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateSession(id));
        }

        if sessions.len() >= self.config.max_sessions {
            tracing::warn!(
                session = %id,
                limit = self.config.max_sessions,
                "Session limit reached"
            );
            return Err(RegistryError::CapacityExceeded {
                limit: self.config.max_sessions,
            });
        }

        let capture = self.provider.allocate(&request).await.map_err(|source| {
            RegistryError::ResourceUnavailable {
                session: id.clone(),
                source,
            }
        })?;

        let command = self.config.encoder.command(&stream, &capture);
        let session =
            match BroadcastSession::start(id.clone(), stream, &command, self.config.session.clone())
            {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(
                        session = %id,
                        capture = %capture,
                        error = %e,
                        "Encoder failed to start, releasing capture resource"
                    );
                    if let Err(release) = self.provider.release(capture).await {
                        tracing::warn!(session = %id, error = %release, "Release failed");
                    }
                    return Err(RegistryError::StartupFailure {
                        session: id,
                        reason: e.to_string(),
                    });
                }
            };

        let entry = Arc::new(SessionEntry::new(session.clone(), capture));
        sessions.insert(id.clone(), Arc::clone(&entry));
        let total = sessions.len();
        drop(sessions);

        self.forget_tombstone(&id);
        self.spawn_watcher(entry);

        tracing::info!(
            session = %id,
            sessions = total,
            "Session registered"
        );

        Ok(session)
    }

    /// Finalize the session once it stops on its own
    fn spawn_watcher(self: &Arc<Self>, entry: Arc<SessionEntry>) {
        let registry: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            entry.session.wait_stopped().await;
            if let Some(registry) = registry.upgrade() {
                registry.finalize(&entry).await;
            }
        });
    }

    /// Release the capture resource, then drop the entry from the map
    async fn finalize(&self, entry: &Arc<SessionEntry>) {
        entry.release(&self.provider).await;

        let id = entry.session.id();
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(id)
            .is_some_and(|existing| Arc::ptr_eq(existing, entry));
        if !current {
            return;
        }

        sessions.remove(id);
        let remaining = sessions.len();
        drop(sessions);

        self.remember_tombstone(id);
        tracing::info!(
            session = %id,
            cause = ?entry.session.stop_cause(),
            sessions = remaining,
            "Session removed"
        );
    }

    /// Stop a session and free its resources
    ///
    /// Stopping a session that was recently removed succeeds without doing
    /// anything.
    pub async fn stop(&self, id: &str) -> std::result::Result<(), RegistryError> {
        let entry = self.sessions.read().await.get(id).cloned();

        let Some(entry) = entry else {
            if self.is_tombstoned(id) {
                tracing::debug!(session = %id, "Session already stopped");
                return Ok(());
            }
            return Err(RegistryError::NotFound(id.to_string()));
        };

        entry.session.stop().await;
        self.finalize(&entry).await;
        Ok(())
    }

    /// Stop every session
    pub async fn stop_all(&self) {
        let entries: Vec<_> = self.sessions.read().await.values().cloned().collect();
        if entries.is_empty() {
            return;
        }

        tracing::info!(sessions = entries.len(), "Stopping all sessions");

        let mut stopping = JoinSet::new();
        for entry in &entries {
            let session = entry.session.clone();
            stopping.spawn(async move { session.stop().await });
        }
        while stopping.join_next().await.is_some() {}

        for entry in &entries {
            self.finalize(entry).await;
        }
    }

    /// Get a session by id
    pub async fn get(&self, id: &str) -> Option<BroadcastSession> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|entry| entry.session.clone())
    }

    /// Get a session summary by id
    pub async fn summary(&self, id: &str) -> Option<SessionSummary> {
        self.sessions.read().await.get(id).map(|entry| entry.summary())
    }

    /// Summaries of all sessions, oldest first
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|entry| entry.summary())
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    /// Subscribe to a session by id
    ///
    /// Errors carry a close code via [`crate::Error::close_code`].
    pub async fn subscribe(&self, id: &str) -> Result<Subscription> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(session.subscribe().await?)
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    fn remember_tombstone(&self, id: &str) {
        if self.config.tombstone_capacity == 0 {
            return;
        }
        let mut tombstones = self.tombstones.lock().unwrap_or_else(PoisonError::into_inner);
        tombstones.retain(|t| t != id);
        if tombstones.len() == self.config.tombstone_capacity {
            tombstones.pop_front();
        }
        tombstones.push_back(id.to_string());
    }

    fn forget_tombstone(&self, id: &str) {
        self.tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|t| t != id);
    }

    fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|t| t == id)
    }
}
