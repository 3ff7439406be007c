//! Message router and relay server.
//!
//! Owns the agent registry, the UI observer set, and the task relationship
//! table. Every inbound envelope is classified by its `source` tag and
//! handled synchronously; outbound delivery goes through the per-connection
//! queues, so handlers never await while holding a lock. Per-connection
//! ordering is preserved by the one read loop each socket gets; nothing is
//! promised across connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::connection::{ConnectionHandle, Outbound};
use crate::protocol::{
    Envelope, MessageKind, MessageSource, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL,
    HEARTBEAT_TIMEOUT_REASON,
};
use crate::registry::{AgentRegistry, HeartbeatConfig};
use crate::relationships::TaskRelationshipTable;

/// Shared relay state: one per server process, injected into every handler.
pub struct Relay {
    registry: Mutex<AgentRegistry>,
    observers: Mutex<HashMap<Uuid, ConnectionHandle>>,
    relationships: Mutex<TaskRelationshipTable>,
}

impl Relay {
    pub fn new(heartbeat: HeartbeatConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(AgentRegistry::new(heartbeat)),
            observers: Mutex::new(HashMap::new()),
            relationships: Mutex::new(TaskRelationshipTable::default()),
        })
    }

    pub fn agent_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Classify and handle one inbound envelope.
    pub fn handle_envelope(&self, conn: &ConnectionHandle, envelope: Envelope) {
        match envelope.source {
            MessageSource::Agent => self.handle_agent(conn, envelope),
            MessageSource::Ui => {
                self.ensure_observer(conn);
                self.handle_ui(conn, envelope);
            }
            MessageSource::Server => {
                tracing::warn!(
                    target = "session_relay::router",
                    kind = ?envelope.kind,
                    connection = %conn.id(),
                    "dropping server-sourced envelope from a client connection"
                );
            }
        }
    }

    /// Remove all state owned by a connection whose transport closed.
    pub fn connection_closed(&self, connection_id: Uuid) {
        let evicted = {
            let mut registry = self.registry.lock();
            registry
                .agent_for_connection(connection_id)
                .and_then(|agent_id| registry.remove(&agent_id))
        };
        if let Some(session) = evicted {
            tracing::info!(
                target = "session_relay::router",
                agent = %session.agent_id,
                "agent connection closed, session removed"
            );
            self.broadcast_agent_update(Some(&session.agent_id));
        }
        self.observers.lock().remove(&connection_id);
    }

    // ------------------------------------------------------------------
    // Agent-originated envelopes
    // ------------------------------------------------------------------

    fn handle_agent(&self, conn: &ConnectionHandle, mut envelope: Envelope) {
        match envelope.kind {
            MessageKind::Register => self.register_agent(conn, envelope),
            MessageKind::Ping | MessageKind::Pong => {
                let Some(agent_id) = envelope.agent_id() else {
                    tracing::warn!(
                        target = "session_relay::router",
                        "heartbeat without an agent descriptor"
                    );
                    return;
                };
                if !self.registry.lock().touch(agent_id, Instant::now()) {
                    tracing::warn!(
                        target = "session_relay::router",
                        agent = %agent_id,
                        "heartbeat from unknown agent (stale frame after eviction?)"
                    );
                }
            }
            MessageKind::Unregister => self.unregister_agent(conn, &envelope),
            kind if kind.is_agent_relay() => {
                let Some(agent_id) = envelope.agent_id().map(str::to_string) else {
                    tracing::warn!(
                        target = "session_relay::router",
                        kind = ?envelope.kind,
                        "agent relay envelope without an agent descriptor"
                    );
                    return;
                };
                if !self.registry.lock().contains(&agent_id) {
                    tracing::warn!(
                        target = "session_relay::router",
                        agent = %agent_id,
                        kind = ?envelope.kind,
                        "dropping envelope from evicted agent"
                    );
                    return;
                }
                envelope.restamp();
                if envelope.kind == MessageKind::AgentResponse {
                    if let Some(event) = envelope.event.as_mut() {
                        let mut relationships = self.relationships.lock();
                        // Delegation notices mutate the table and pass
                        // through verbatim; everything else gets the
                        // parent/child rewrite.
                        if !relationships.apply_lifecycle(event) {
                            relationships.annotate(event);
                        }
                    }
                }
                self.broadcast_to_observers(envelope);
            }
            kind => {
                tracing::warn!(
                    target = "session_relay::router",
                    kind = ?kind,
                    "unexpected agent-sourced envelope, dropping"
                );
            }
        }
    }

    fn register_agent(&self, conn: &ConnectionHandle, envelope: Envelope) {
        let Some(agent) = envelope.agent else {
            tracing::warn!(
                target = "session_relay::router",
                "register without an agent descriptor"
            );
            return;
        };

        let replaced = self.registry.lock().register(
            agent.id.clone(),
            agent.workspace_path.clone(),
            conn.clone(),
            Instant::now(),
        );
        if let Some(old) = replaced {
            if old.id() != conn.id() {
                old.close(CLOSE_NORMAL, "Replaced by new registration");
            }
        }
        tracing::info!(
            target = "session_relay::router",
            agent = %agent.id,
            workspace = ?agent.workspace_path,
            "agent registered"
        );

        let ack = Envelope::server(MessageKind::Registered).with_agent(agent.clone());
        if conn.send(ack).is_err() {
            tracing::warn!(
                target = "session_relay::router",
                agent = %agent.id,
                "registration ack failed, connection already gone"
            );
        }
        self.broadcast_agent_update(Some(&agent.id));
    }

    fn unregister_agent(&self, conn: &ConnectionHandle, envelope: &Envelope) {
        let Some(agent_id) = envelope.agent_id() else {
            tracing::warn!(
                target = "session_relay::router",
                "unregister without an agent descriptor"
            );
            return;
        };
        let removed = self.registry.lock().remove(agent_id);
        match removed {
            Some(session) => {
                let _ = conn.send(
                    Envelope::server(MessageKind::Unregistered)
                        .with_data(json!({"agentId": agent_id})),
                );
                self.broadcast_agent_update(Some(agent_id));
                session.connection.close(CLOSE_NORMAL, "Unregistered");
            }
            None => {
                // Second unregister for the same id: no error, no broadcast.
                tracing::debug!(
                    target = "session_relay::router",
                    agent = %agent_id,
                    "unregister for unknown agent ignored"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // UI-originated envelopes
    // ------------------------------------------------------------------

    fn handle_ui(&self, conn: &ConnectionHandle, envelope: Envelope) {
        match envelope.kind {
            MessageKind::Register => {
                let _ = conn.send(Envelope::server(MessageKind::Registered));
            }
            MessageKind::Unregister => {
                self.observers.lock().remove(&conn.id());
                conn.close(CLOSE_NORMAL, "Unregistered");
            }
            MessageKind::Ping => {
                // UI connections do not participate in heartbeat tracking.
                tracing::debug!(target = "session_relay::router", "ignoring ui ping");
            }
            MessageKind::GetAgents => {
                let roster = self.roster_value();
                let _ = conn.send(
                    Envelope::server(MessageKind::AgentList)
                        .with_data(json!({"agents": roster})),
                );
            }
            kind if kind.is_agent_command() => self.forward_command(envelope),
            kind => {
                tracing::warn!(
                    target = "session_relay::router",
                    kind = ?kind,
                    "unexpected ui-sourced envelope, dropping"
                );
            }
        }
    }

    fn forward_command(&self, envelope: Envelope) {
        let Some(target) = envelope.agent_id().map(str::to_string) else {
            tracing::warn!(
                target = "session_relay::router",
                kind = ?envelope.kind,
                "command without a target agent id, dropping"
            );
            return;
        };

        let connection = self
            .registry
            .lock()
            .get(&target)
            .map(|s| s.connection.clone());
        match connection {
            Some(connection) => {
                if connection.send(envelope).is_err() {
                    tracing::warn!(
                        target = "session_relay::router",
                        agent = %target,
                        "command forward failed, evicting session"
                    );
                    self.evict(&target);
                }
            }
            None => {
                tracing::warn!(
                    target = "session_relay::router",
                    agent = %target,
                    kind = ?envelope.kind,
                    "command for unregistered agent, dropping"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Heartbeats
    // ------------------------------------------------------------------

    /// Ping every session past its grace period; a failed send means the
    /// transport is gone and the session is evicted immediately.
    pub fn ping_pass(&self, now: Instant) {
        let pingable = self.registry.lock().pingable(now);
        for (agent_id, connection) in pingable {
            if connection.send(Envelope::server(MessageKind::Ping)).is_err() {
                tracing::warn!(
                    target = "session_relay::router",
                    agent = %agent_id,
                    "ping send failed, evicting session"
                );
                self.evict(&agent_id);
            }
        }
    }

    /// Evict every session whose heartbeat staleness exceeds its bound,
    /// closing the transport with the heartbeat-timeout code.
    pub fn health_pass(&self, now: Instant) {
        let expired = self.registry.lock().expired(now);
        for agent_id in expired {
            let removed = self.registry.lock().remove(&agent_id);
            if let Some(session) = removed {
                tracing::warn!(
                    target = "session_relay::router",
                    agent = %agent_id,
                    stale_for = ?session.heartbeat_age(now),
                    "heartbeat timeout, evicting session"
                );
                session
                    .connection
                    .close(CLOSE_HEARTBEAT_TIMEOUT, HEARTBEAT_TIMEOUT_REASON);
                self.broadcast_agent_update(Some(&agent_id));
            }
        }
    }

    /// Drive the ping and health passes on the configured interval until the
    /// relay is dropped.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let interval = self.registry.lock().config().ping_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            self.ping_pass(now);
            self.health_pass(now);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_observer(&self, conn: &ConnectionHandle) {
        self.observers
            .lock()
            .entry(conn.id())
            .or_insert_with(|| conn.clone());
    }

    fn evict(&self, agent_id: &str) {
        if self.registry.lock().remove(agent_id).is_some() {
            self.broadcast_agent_update(Some(agent_id));
        }
    }

    fn roster_value(&self) -> Value {
        serde_json::to_value(self.registry.lock().roster()).unwrap_or_else(|_| json!([]))
    }

    fn broadcast_agent_update(&self, agent_id: Option<&str>) {
        let mut data = json!({"agents": self.roster_value()});
        if let Some(id) = agent_id {
            data["agentId"] = json!(id);
        }
        self.broadcast_to_observers(Envelope::server(MessageKind::AgentUpdate).with_data(data));
    }

    /// Best-effort fan-out: observers whose transport is gone are pruned as
    /// they are discovered.
    fn broadcast_to_observers(&self, envelope: Envelope) {
        let mut observers = self.observers.lock();
        let mut dead: Vec<Uuid> = Vec::new();
        for (id, conn) in observers.iter() {
            if conn.send(envelope.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            observers.remove(&id);
            tracing::debug!(
                target = "session_relay::router",
                connection = %id,
                "pruned closed ui observer during broadcast"
            );
        }
    }
}

// ----------------------------------------------------------------------
// Axum wiring
// ----------------------------------------------------------------------

pub fn app(relay: Arc<Relay>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(relay)
}

async fn health(State(relay): State<Arc<Relay>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "agent-session-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "agentCount": relay.agent_count(),
        "uiObservers": relay.observer_count(),
    }))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (conn, mut outbound_rx) = ConnectionHandle::new();
    let connection_id = conn.id();
    tracing::debug!(
        target = "session_relay::router",
        connection = %connection_id,
        "ws connection opened"
    );

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(error) => {
                            tracing::warn!(
                                target = "session_relay::router",
                                error = %error,
                                "failed to encode outbound envelope"
                            );
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => relay.handle_envelope(&conn, envelope),
                Err(error) => {
                    // Protocol error: drop the frame, keep the connection.
                    tracing::warn!(
                        target = "session_relay::router",
                        connection = %connection_id,
                        error = %error,
                        "dropping malformed frame"
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(
                    target = "session_relay::router",
                    connection = %connection_id,
                    error = %error,
                    "ws read error"
                );
                break;
            }
        }
    }

    relay.connection_closed(connection_id);
    drop(conn);
    writer.abort();
    tracing::debug!(
        target = "session_relay::router",
        connection = %connection_id,
        "ws connection closed"
    );
}
