use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection '{0}' is not registered")]
    NotFound(String),
    #[error("connection registry unavailable: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub subscribed_lines: BTreeSet<String>,
    /// Registry entries past this instant are treated as absent.
    pub expires_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        connection_id: impl Into<String>,
        connected_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            connected_at,
            subscribed_lines: BTreeSet::new(),
            expires_at: connected_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Registry of live subscriber connections.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn put(&self, connection: Connection) -> Result<(), RegistryError>;

    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, RegistryError>;

    /// Deleting an unknown connection is not an error.
    async fn delete(&self, connection_id: &str) -> Result<(), RegistryError>;

    /// Replaces the subscription set of an existing connection.
    async fn update_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<(), RegistryError>;

    /// Adds `lines` to the stored set in a single write and returns the resulting set.
    async fn add_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError>;

    /// Removes `lines` from the stored set in a single write and returns the resulting set.
    async fn remove_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError>;

    /// Ids of unexpired connections subscribed to `line_id`.
    async fn scan_by_subscribed_line(&self, line_id: &str) -> Result<Vec<String>, RegistryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryConnectionRegistry {
    connections: Mutex<BTreeMap<String, Connection>>,
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Connection>>, RegistryError> {
        self.connections
            .lock()
            .map_err(|_| RegistryError::Backend("registry mutex poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies `change` to a live connection's lines under one lock.
    fn modify_lines(
        &self,
        connection_id: &str,
        change: impl FnOnce(&mut BTreeSet<String>),
    ) -> Result<BTreeSet<String>, RegistryError> {
        let mut guard = self.lock()?;
        evict_expired(&mut guard, Utc::now());
        let connection = guard
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))?;
        change(&mut connection.subscribed_lines);
        Ok(connection.subscribed_lines.clone())
    }
}

fn evict_expired(connections: &mut BTreeMap<String, Connection>, now: DateTime<Utc>) {
    connections.retain(|_, connection| !connection.is_expired(now));
}

#[async_trait]
impl ConnectionRegistry for InMemoryConnectionRegistry {
    async fn put(&self, connection: Connection) -> Result<(), RegistryError> {
        let mut guard = self.lock()?;
        evict_expired(&mut guard, Utc::now());
        guard.insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn get(&self, connection_id: &str) -> Result<Option<Connection>, RegistryError> {
        let now = Utc::now();
        Ok(self
            .lock()?
            .get(connection_id)
            .filter(|connection| !connection.is_expired(now))
            .cloned())
    }

    async fn delete(&self, connection_id: &str) -> Result<(), RegistryError> {
        self.lock()?.remove(connection_id);
        Ok(())
    }

    async fn update_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<(), RegistryError> {
        let mut guard = self.lock()?;
        let connection = guard
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::NotFound(connection_id.to_string()))?;
        connection.subscribed_lines = lines.clone();
        Ok(())
    }

    async fn add_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError> {
        self.modify_lines(connection_id, |subscribed| {
            subscribed.extend(lines.iter().cloned())
        })
    }

    async fn remove_subscriptions(
        &self,
        connection_id: &str,
        lines: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RegistryError> {
        self.modify_lines(connection_id, |subscribed| {
            subscribed.retain(|line| !lines.contains(line))
        })
    }

    async fn scan_by_subscribed_line(&self, line_id: &str) -> Result<Vec<String>, RegistryError> {
        let mut guard = self.lock()?;
        evict_expired(&mut guard, Utc::now());
        Ok(guard
            .values()
            .filter(|connection| connection.subscribed_lines.contains(line_id))
            .map(|connection| connection.connection_id.clone())
            .collect())
    }
}
