//! Typed command surface of the wrapped coding-assistant engine.
//!
//! The engine runs its own event loop (inside the host editor); the bridge
//! talks to it through a closed request enum with one oneshot reply per
//! variant. `start_task` and `send_message` replies carry a single-consumer
//! event stream: lazy, non-restartable, never fanned out — the receiver is
//! handed to exactly one consumer.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Queue depth for engine request and event channels.
pub const ENGINE_CHANNEL_CAPACITY: usize = 64;

/// One event produced by an engine task stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub name: String,
    /// The engine's own task id, which may differ from any client-supplied
    /// correlation token.
    pub task_id: Option<String>,
    pub payload: Value,
}

impl EngineEvent {
    pub fn new(name: impl Into<String>, task_id: Option<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            task_id,
            payload,
        }
    }
}

/// Single-consumer stream of engine events. Consuming it is destructive;
/// there is no replay.
pub type EventStream = mpsc::Receiver<EngineEvent>;

pub type EngineReply<T> = oneshot::Sender<Result<T, String>>;

/// Closed set of bridged engine operations. Parameters are typed per
/// variant; results come back on the reply channel, failures as `Err(String)`.
#[derive(Debug)]
pub enum EngineRequest {
    /// Start a new task. The reply stream's first element is expected to be
    /// the `taskCreated` signal carrying the engine-assigned task id.
    StartTask {
        text: String,
        configuration: Option<Value>,
        reply: EngineReply<EventStream>,
    },
    /// Send a message to the engine's current task.
    SendMessage {
        text: String,
        reply: EngineReply<EventStream>,
    },
    /// Make the given task the engine's current task. The reply completes
    /// only once the task is active, so callers can sequence a dependent
    /// send without timed sleeps.
    ResumeTask {
        task_id: String,
        reply: EngineReply<Value>,
    },
    CancelTask {
        task_id: Option<String>,
        reply: EngineReply<Value>,
    },
    ClearTask {
        reply: EngineReply<Value>,
    },
    PressPrimaryButton {
        reply: EngineReply<Value>,
    },
    PressSecondaryButton {
        reply: EngineReply<Value>,
    },
    GetStatus {
        reply: EngineReply<Value>,
    },
    GetActiveTaskIds {
        reply: EngineReply<Value>,
    },
    GetTaskHistory {
        reply: EngineReply<Value>,
    },
    GetProfiles {
        reply: EngineReply<Value>,
    },
    GetActiveProfile {
        reply: EngineReply<Value>,
    },
    SetActiveProfile {
        name: String,
        reply: EngineReply<Value>,
    },
    CreateProfile {
        name: String,
        settings: Option<Value>,
        reply: EngineReply<Value>,
    },
    DeleteProfile {
        name: String,
        reply: EngineReply<Value>,
    },
    GetConfiguration {
        reply: EngineReply<Value>,
    },
    SetConfiguration {
        values: Value,
        reply: EngineReply<Value>,
    },
}

/// Cheap handle for issuing [`EngineRequest`]s.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<EngineRequest>) -> Self {
        Self { tx }
    }

    /// Create a handle plus the request receiver an engine adapter services.
    pub fn channel() -> (Self, mpsc::Receiver<EngineRequest>) {
        let (tx, rx) = mpsc::channel(ENGINE_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(EngineReply<T>) -> EngineRequest,
    ) -> Result<T, String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| "engine unavailable".to_string())?;
        reply_rx
            .await
            .map_err(|_| "engine dropped the reply".to_string())?
    }

    pub async fn start_task(
        &self,
        text: String,
        configuration: Option<Value>,
    ) -> Result<EventStream, String> {
        self.call(|reply| EngineRequest::StartTask {
            text,
            configuration,
            reply,
        })
        .await
    }

    pub async fn send_message(&self, text: String) -> Result<EventStream, String> {
        self.call(|reply| EngineRequest::SendMessage { text, reply }).await
    }

    pub async fn resume_task(&self, task_id: String) -> Result<Value, String> {
        self.call(|reply| EngineRequest::ResumeTask { task_id, reply })
            .await
    }

    pub async fn cancel_task(&self, task_id: Option<String>) -> Result<Value, String> {
        self.call(|reply| EngineRequest::CancelTask { task_id, reply })
            .await
    }

    pub async fn clear_task(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::ClearTask { reply }).await
    }

    pub async fn press_primary_button(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::PressPrimaryButton { reply })
            .await
    }

    pub async fn press_secondary_button(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::PressSecondaryButton { reply })
            .await
    }

    pub async fn get_status(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::GetStatus { reply }).await
    }

    pub async fn get_active_task_ids(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::GetActiveTaskIds { reply })
            .await
    }

    pub async fn get_task_history(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::GetTaskHistory { reply }).await
    }

    pub async fn get_profiles(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::GetProfiles { reply }).await
    }

    pub async fn get_active_profile(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::GetActiveProfile { reply })
            .await
    }

    pub async fn set_active_profile(&self, name: String) -> Result<Value, String> {
        self.call(|reply| EngineRequest::SetActiveProfile { name, reply })
            .await
    }

    pub async fn create_profile(
        &self,
        name: String,
        settings: Option<Value>,
    ) -> Result<Value, String> {
        self.call(|reply| EngineRequest::CreateProfile {
            name,
            settings,
            reply,
        })
        .await
    }

    pub async fn delete_profile(&self, name: String) -> Result<Value, String> {
        self.call(|reply| EngineRequest::DeleteProfile { name, reply })
            .await
    }

    pub async fn get_configuration(&self) -> Result<Value, String> {
        self.call(|reply| EngineRequest::GetConfiguration { reply })
            .await
    }

    pub async fn set_configuration(&self, values: Value) -> Result<Value, String> {
        self.call(|reply| EngineRequest::SetConfiguration { values, reply })
            .await
    }
}
