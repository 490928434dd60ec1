use crate::config::TransportConfig;
use crate::error::Result;
use crate::protocol::{AuthPayload, Event};
use crate::transport::{ConnectionInfo, EventListener, TeamConnection};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Doubling retry delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the delay (up to the ceiling) and returns it.
    pub fn on_failure(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Member side: one supervised connection per joined team.
pub struct ConnectionManager {
    config: TransportConfig,
    identity: RwLock<AuthPayload>,
    listener: Arc<dyn EventListener>,
    connections: RwLock<HashMap<String, Arc<TeamConnection>>>,
    root: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: TransportConfig,
        identity: AuthPayload,
        listener: Arc<dyn EventListener>,
        root: CancellationToken,
    ) -> Self {
        Self {
            config,
            identity: RwLock::new(identity),
            listener,
            connections: RwLock::new(HashMap::new()),
            root,
        }
    }

    fn identity(&self) -> AuthPayload {
        self.identity
            .read()
            .map(|i| i.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    fn get(&self, team_id: &str) -> Option<Arc<TeamConnection>> {
        self.connections
            .read()
            .ok()
            .and_then(|m| m.get(team_id).cloned())
    }

    pub fn connection(&self, team_id: &str) -> Option<Arc<TeamConnection>> {
        self.get(team_id)
    }

    /// Connects to the leader of `team_id`. The team stays supervised even
    /// when this first attempt fails.
    pub async fn connect(self: &Arc<Self>, team_id: &str, endpoint: &str) -> Result<()> {
        let conn = Arc::new(TeamConnection::new(
            team_id,
            endpoint,
            self.identity(),
            self.config.clone(),
            self.listener.clone(),
            self.root.clone(),
        ));

        let previous = self
            .connections
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(team_id.to_string(), conn.clone());
        if let Some(old) = previous {
            old.close();
        }

        let result = conn.connect().await;
        if let Err(e) = &result {
            tracing::warn!(team_id, endpoint, error = %e, "Initial connect failed, will retry");
        }

        let manager = self.clone();
        let team = team_id.to_string();
        tokio::spawn(async move {
            manager.supervise(team, conn).await;
        });

        result
    }

    async fn supervise(&self, team_id: String, conn: Arc<TeamConnection>) {
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.root.cancelled() => return,
                _ = tokio::time::sleep(self.config.supervisor_tick) => {}
            }

            match self.get(&team_id) {
                Some(current) if Arc::ptr_eq(&current, &conn) => {}
                _ => {
                    tracing::debug!(%team_id, "Supervisor exiting, connection removed");
                    return;
                }
            }

            if conn.is_connected() {
                backoff.reset();
                if failures > 0 {
                    failures = 0;
                    conn.set_retry_count(0);
                }
                continue;
            }

            match conn.connect().await {
                Ok(()) => {
                    tracing::info!(%team_id, after = failures, "Reconnected to team leader");
                    backoff.reset();
                    failures = 0;
                    conn.set_retry_count(0);
                }
                Err(e) => {
                    failures += 1;
                    conn.set_retry_count(failures);
                    let delay = backoff.on_failure();
                    tracing::debug!(%team_id, error = %e, retry_in = ?delay, "Reconnect failed");
                    tokio::select! {
                        _ = self.root.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// No-op when the team has no connection.
    pub fn send(&self, team_id: &str, event: &Event) -> Result<()> {
        match self.get(team_id) {
            Some(conn) => conn.send(event),
            None => Ok(()),
        }
    }

    pub fn disconnect(&self, team_id: &str) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(team_id);
        if let Some(conn) = removed {
            conn.close();
            tracing::info!(team_id, "Disconnected from team");
        }
    }

    pub fn close(&self) {
        self.root.cancel();
        let all: Vec<Arc<TeamConnection>> = self
            .connections
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in all {
            conn.close();
        }
    }

    pub fn is_connected(&self, team_id: &str) -> bool {
        self.get(team_id).map(|c| c.is_connected()).unwrap_or(false)
    }

    pub fn connection_info(&self, team_id: &str) -> Option<ConnectionInfo> {
        self.get(team_id).map(|c| c.info())
    }

    pub fn all_connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .map(|m| m.values().map(|c| c.info()).collect())
            .unwrap_or_default()
    }

    /// Applies to every connection from its next handshake on.
    pub fn update_identity(&self, member_id: &str, member_name: &str) {
        let updated = {
            let mut identity = self.identity.write().unwrap_or_else(|p| p.into_inner());
            identity.member_id = member_id.to_string();
            identity.member_name = member_name.to_string();
            identity.clone()
        };
        self.apply_identity(updated);
    }

    pub fn update_local_endpoint(&self, endpoint: &str) {
        let updated = {
            let mut identity = self.identity.write().unwrap_or_else(|p| p.into_inner());
            identity.endpoint = endpoint.to_string();
            identity.clone()
        };
        self.apply_identity(updated);
    }

    fn apply_identity(&self, identity: AuthPayload) {
        if let Ok(map) = self.connections.read() {
            for conn in map.values() {
                conn.set_identity(identity.clone());
            }
        }
    }
}
