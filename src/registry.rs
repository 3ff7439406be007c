//! Connection registry: which agents are alive and when we last heard from
//! them.
//!
//! One session per agent id, last-writer-wins. A freshly registered session
//! sits in a grace period during which it is neither pinged nor evicted, so a
//! reconnecting agent can finish its own startup handshake. All time-based
//! decisions take `now` as an argument so tests can drive the clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::connection::ConnectionHandle;
use crate::protocol::{now_ms, RosterEntry};

/// Minimum allowed heartbeat staleness while a session is in its grace
/// period, regardless of how short the configured timeout is.
pub const GRACE_MIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub timeout_multiplier: u32,
    pub grace_period: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            timeout_multiplier: 5,
            grace_period: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Staleness bound after which a session is considered dead. Sessions in
    /// grace get the more lenient of the configured bound and
    /// [`GRACE_MIN_TIMEOUT`].
    pub fn allowed_staleness(&self, in_grace: bool) -> Duration {
        let timeout = self.ping_interval * self.timeout_multiplier;
        if in_grace {
            timeout.max(GRACE_MIN_TIMEOUT)
        } else {
            timeout
        }
    }
}

/// One registered agent. The agent id is supplied by the agent and stable
/// across reconnects; the connection is whatever transport registered last.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub agent_id: String,
    pub workspace_path: Option<String>,
    pub connection: ConnectionHandle,
    /// Epoch ms, reported in rosters.
    pub connected_at: i64,
    registered_at: Instant,
    last_heartbeat: Instant,
}

impl AgentSession {
    pub fn in_grace_period(&self, now: Instant, grace: Duration) -> bool {
        now.duration_since(self.registered_at) < grace
    }

    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.duration_since(self.last_heartbeat)
    }
}

#[derive(Debug)]
pub struct AgentRegistry {
    cfg: HeartbeatConfig,
    sessions: HashMap<String, AgentSession>,
}

impl AgentRegistry {
    pub fn new(cfg: HeartbeatConfig) -> Self {
        Self {
            cfg,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.cfg
    }

    /// Insert or replace the session for `agent_id`, resetting heartbeat and
    /// grace state. Returns the connection of the session that was replaced,
    /// if any, so the caller can close it.
    pub fn register(
        &mut self,
        agent_id: impl Into<String>,
        workspace_path: Option<String>,
        connection: ConnectionHandle,
        now: Instant,
    ) -> Option<ConnectionHandle> {
        let agent_id = agent_id.into();
        let session = AgentSession {
            agent_id: agent_id.clone(),
            workspace_path,
            connection,
            connected_at: now_ms(),
            registered_at: now,
            last_heartbeat: now,
        };
        self.sessions
            .insert(agent_id, session)
            .map(|old| old.connection)
    }

    /// Record a heartbeat. Returns false for agents the registry does not
    /// know (e.g. a stale frame arriving after eviction); callers log it.
    pub fn touch(&mut self, agent_id: &str, now: Instant) -> bool {
        match self.sessions.get_mut(agent_id) {
            Some(session) => {
                session.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Delete the session immediately. Idempotent.
    pub fn remove(&mut self, agent_id: &str) -> Option<AgentSession> {
        self.sessions.remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentSession> {
        self.sessions.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.sessions.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Agent id owning the given connection, used for cleanup when a socket
    /// closes without an explicit unregister.
    pub fn agent_for_connection(&self, connection_id: uuid::Uuid) -> Option<String> {
        self.sessions
            .values()
            .find(|s| s.connection.id() == connection_id)
            .map(|s| s.agent_id.clone())
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .sessions
            .values()
            .map(|s| RosterEntry {
                id: s.agent_id.clone(),
                workspace_path: s.workspace_path.clone(),
                connected_at: s.connected_at,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Sessions due for an outbound ping: everyone past their grace period.
    pub fn pingable(&self, now: Instant) -> Vec<(String, ConnectionHandle)> {
        self.sessions
            .values()
            .filter(|s| !s.in_grace_period(now, self.cfg.grace_period))
            .map(|s| (s.agent_id.clone(), s.connection.clone()))
            .collect()
    }

    /// Sessions whose heartbeat staleness exceeds the allowed bound.
    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| {
                let in_grace = s.in_grace_period(now, self.cfg.grace_period);
                s.heartbeat_age(now) > self.cfg.allowed_staleness(in_grace)
            })
            .map(|s| s.agent_id.clone())
            .collect()
    }
}
