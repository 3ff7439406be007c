//! Wire protocol: JSON envelopes exchanged between agents, UIs, and the relay.
//!
//! Every frame on every connection is one [`Envelope`]. The kind enumeration
//! is closed — unknown kinds fail to decode and the offending frame is
//! dropped without closing the connection.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normal closure; the closing side does not expect a reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// Application close code used when the relay evicts a session for missed
/// heartbeats.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4001;
pub const HEARTBEAT_TIMEOUT_REASON: &str = "Heartbeat timeout";

/// Engine lifecycle event names the relay gives special treatment.
pub const EVENT_TASK_CREATED: &str = "taskCreated";
pub const EVENT_TASK_SPAWNED: &str = "taskSpawned";
pub const EVENT_TASK_UNPAUSED: &str = "taskUnpaused";
pub const EVENT_TASK_COMPLETED: &str = "taskCompleted";
pub const EVENT_TASK_ABORTED: &str = "taskAborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Agent,
    Ui,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    // System
    Register,
    Unregister,
    Ping,
    Pong,
    // Server -> anyone
    Registered,
    Unregistered,
    AgentList,
    AgentUpdate,
    // UI -> server/agent
    GetAgents,
    GetActiveTaskIds,
    GetProfiles,
    GetActiveProfile,
    GetConfiguration,
    SetConfiguration,
    CreateTask,
    SendMessageToTask,
    RooCodeCommand,
    CloneRepo,
    // Agent -> server/UI
    AgentResponse,
    ActiveTaskIdsResponse,
    ProfilesResponse,
    ActiveProfileResponse,
    TaskStartedResponse,
    RooCodeCommandResponse,
    RooCodeStatus,
    RooCodeConfiguration,
    RooCodeProfiles,
    RooCodeTaskHistory,
}

impl MessageKind {
    /// Agent-originated kinds the router relays verbatim to every UI observer.
    pub fn is_agent_relay(self) -> bool {
        matches!(
            self,
            MessageKind::AgentResponse
                | MessageKind::ActiveTaskIdsResponse
                | MessageKind::ProfilesResponse
                | MessageKind::ActiveProfileResponse
                | MessageKind::TaskStartedResponse
                | MessageKind::RooCodeCommandResponse
                | MessageKind::RooCodeStatus
                | MessageKind::RooCodeConfiguration
                | MessageKind::RooCodeProfiles
                | MessageKind::RooCodeTaskHistory
        )
    }

    /// UI-originated kinds that must name a target agent and are forwarded
    /// unchanged to that agent's connection.
    pub fn is_agent_command(self) -> bool {
        matches!(
            self,
            MessageKind::GetActiveTaskIds
                | MessageKind::GetProfiles
                | MessageKind::GetActiveProfile
                | MessageKind::GetConfiguration
                | MessageKind::SetConfiguration
                | MessageKind::CreateTask
                | MessageKind::SendMessageToTask
                | MessageKind::RooCodeCommand
                | MessageKind::CloneRepo
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, workspace_path: Option<String>) -> Self {
        Self {
            id: id.into(),
            workspace_path,
        }
    }
}

/// Task event relayed from an agent's engine, carried by `agentResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEventPayload {
    pub event_name: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_subtask: Option<bool>,
    #[serde(default)]
    pub message: Value,
}

/// One roster line in `agentList` / `agentUpdate` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    pub connected_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub source: MessageSource,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<TaskEventPayload>,
}

impl Envelope {
    pub fn new(kind: MessageKind, source: MessageSource) -> Self {
        Self {
            kind,
            source,
            timestamp: now_ms(),
            agent: None,
            data: None,
            event: None,
        }
    }

    pub fn server(kind: MessageKind) -> Self {
        Self::new(kind, MessageSource::Server)
    }

    pub fn agent(kind: MessageKind, agent: AgentDescriptor) -> Self {
        Self::new(kind, MessageSource::Agent).with_agent(agent)
    }

    pub fn ui(kind: MessageKind) -> Self {
        Self::new(kind, MessageSource::Ui)
    }

    pub fn with_agent(mut self, agent: AgentDescriptor) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_event(mut self, event: TaskEventPayload) -> Self {
        self.event = Some(event);
        self
    }

    /// Refresh the timestamp before a broadcast so observers see relay time.
    pub fn restamp(&mut self) {
        self.timestamp = now_ms();
    }

    /// Agent id named by the envelope, for registration and command targeting.
    pub fn agent_id(&self) -> Option<&str> {
        self.agent.as_ref().map(|a| a.id.as_str())
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
