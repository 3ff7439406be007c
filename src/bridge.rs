//! Command/response correlator on the agent side.
//!
//! Adapts the engine's lazy event-stream surface into the discrete
//! request/response shapes the wire protocol needs. The one real piece of
//! correlation: `createTask` consumes exactly the first stream element to
//! recover the engine-assigned task id (the client correlation id is only a
//! token); everything after that is forwarded from a detached loop with no
//! further matching. Engine failures never unwind past this module — they
//! become `{success:false, error}` response envelopes.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::engine::{EngineEvent, EngineHandle, EventStream};
use crate::protocol::{
    AgentDescriptor, Envelope, MessageKind, TaskEventPayload, EVENT_TASK_ABORTED,
    EVENT_TASK_COMPLETED, EVENT_TASK_CREATED,
};

/// Commands carried by a `rooCodeCommand` envelope, decoded once at the
/// boundary instead of being dispatched on a raw command string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "camelCase")]
pub enum RooCommand {
    #[serde(rename_all = "camelCase")]
    ResumeTask { task_id: String },
    #[serde(rename_all = "camelCase")]
    CancelTask {
        #[serde(default)]
        task_id: Option<String>,
    },
    ClearTask,
    PressPrimaryButton,
    PressSecondaryButton,
    GetTaskHistory,
    GetStatus,
    SetActiveProfile {
        name: String,
    },
    CreateProfile {
        name: String,
        #[serde(default)]
        settings: Option<Value>,
    },
    DeleteProfile {
        name: String,
    },
}

/// Agent-side correlator: one per session, shared by detached command tasks.
#[derive(Debug, Clone)]
pub struct EngineBridge {
    engine: EngineHandle,
    outbound: mpsc::Sender<Envelope>,
    agent: AgentDescriptor,
}

impl EngineBridge {
    pub fn new(engine: EngineHandle, outbound: mpsc::Sender<Envelope>, agent: AgentDescriptor) -> Self {
        Self {
            engine,
            outbound,
            agent,
        }
    }

    /// Handle one command envelope addressed to this agent. Every path ends
    /// in either response envelopes, forwarded events, or a logged drop.
    pub async fn handle_command(&self, envelope: Envelope) {
        let correlation_id = envelope
            .data
            .as_ref()
            .and_then(|d| d.get("correlationId"))
            .cloned();

        match envelope.kind {
            MessageKind::CreateTask => self.create_task(envelope, correlation_id).await,
            MessageKind::SendMessageToTask => self.send_message(envelope, correlation_id).await,
            MessageKind::GetProfiles => {
                let result = self.engine.get_profiles().await;
                self.respond(MessageKind::ProfilesResponse, "profiles", result, correlation_id)
                    .await;
            }
            MessageKind::GetActiveProfile => {
                let result = self.engine.get_active_profile().await;
                self.respond(
                    MessageKind::ActiveProfileResponse,
                    "profile",
                    result,
                    correlation_id,
                )
                .await;
            }
            MessageKind::GetConfiguration => {
                let result = self.engine.get_configuration().await;
                self.respond(
                    MessageKind::RooCodeConfiguration,
                    "configuration",
                    result,
                    correlation_id,
                )
                .await;
            }
            MessageKind::SetConfiguration => {
                let values = envelope
                    .data
                    .as_ref()
                    .and_then(|d| d.get("values"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let result = self.engine.set_configuration(values).await;
                self.respond(
                    MessageKind::RooCodeCommandResponse,
                    "result",
                    result,
                    correlation_id,
                )
                .await;
            }
            MessageKind::GetActiveTaskIds => {
                let result = self.engine.get_active_task_ids().await;
                self.respond(
                    MessageKind::ActiveTaskIdsResponse,
                    "taskIds",
                    result,
                    correlation_id,
                )
                .await;
            }
            MessageKind::RooCodeCommand => self.roo_command(envelope, correlation_id).await,
            MessageKind::CloneRepo => {
                // Repository provisioning lives outside the engine surface.
                self.send_error(
                    MessageKind::RooCodeCommandResponse,
                    "cloneRepo is not handled by this agent",
                    correlation_id,
                )
                .await;
            }
            other => {
                tracing::warn!(
                    target = "session_relay::bridge",
                    kind = ?other,
                    "ignoring non-command envelope"
                );
            }
        }
    }

    async fn create_task(&self, envelope: Envelope, correlation_id: Option<Value>) {
        let data = envelope.data.unwrap_or(Value::Null);
        let text = data
            .get("message")
            .or_else(|| data.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let configuration = data.get("configuration").cloned();

        let mut stream = match self.engine.start_task(text, configuration).await {
            Ok(stream) => stream,
            Err(error) => {
                self.send_error(MessageKind::TaskStartedResponse, &error, correlation_id)
                    .await;
                return;
            }
        };

        // The first element is consumed here, synchronously, to recover the
        // engine's own task id. The stream cannot be replayed.
        let first = stream.recv().await;
        let task_id = match &first {
            Some(ev) if ev.name == EVENT_TASK_CREATED => ev.task_id.clone(),
            _ => None,
        };

        match &task_id {
            Some(id) => {
                self.respond(
                    MessageKind::TaskStartedResponse,
                    "taskId",
                    Ok(json!(id)),
                    correlation_id,
                )
                .await;
            }
            None => {
                self.send_error(
                    MessageKind::TaskStartedResponse,
                    "engine did not report a task id",
                    correlation_id,
                )
                .await;
            }
        }

        let fallback = task_id.unwrap_or_else(|| "unknown".to_string());
        // An unexpected first element is still real engine output.
        if let Some(ev) = first.filter(|ev| ev.name != EVENT_TASK_CREATED) {
            self.forward_event(&fallback, ev).await;
        }
        self.spawn_forwarder(fallback, stream);
    }

    async fn send_message(&self, envelope: Envelope, correlation_id: Option<Value>) {
        let text = envelope
            .data
            .as_ref()
            .and_then(|d| d.get("message").or_else(|| d.get("text")))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let task_id = envelope
            .data
            .as_ref()
            .and_then(|d| d.get("taskId"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        // Fire-and-forget: the events themselves are the response.
        match self.engine.send_message(text).await {
            Ok(stream) => self.spawn_forwarder(task_id, stream),
            Err(error) => {
                self.send_error(MessageKind::RooCodeCommandResponse, &error, correlation_id)
                    .await;
            }
        }
    }

    async fn roo_command(&self, envelope: Envelope, correlation_id: Option<Value>) {
        let data = envelope.data.unwrap_or(Value::Null);
        let command: RooCommand = match serde_json::from_value(data) {
            Ok(command) => command,
            Err(error) => {
                self.send_error(
                    MessageKind::RooCodeCommandResponse,
                    &format!("malformed command: {error}"),
                    correlation_id,
                )
                .await;
                return;
            }
        };

        let (kind, key, result) = match command {
            RooCommand::ResumeTask { task_id } => (
                MessageKind::RooCodeCommandResponse,
                "result",
                self.engine.resume_task(task_id).await,
            ),
            RooCommand::CancelTask { task_id } => (
                MessageKind::RooCodeCommandResponse,
                "result",
                self.engine.cancel_task(task_id).await,
            ),
            RooCommand::ClearTask => (
                MessageKind::RooCodeCommandResponse,
                "result",
                self.engine.clear_task().await,
            ),
            RooCommand::PressPrimaryButton => (
                MessageKind::RooCodeCommandResponse,
                "result",
                self.engine.press_primary_button().await,
            ),
            RooCommand::PressSecondaryButton => (
                MessageKind::RooCodeCommandResponse,
                "result",
                self.engine.press_secondary_button().await,
            ),
            RooCommand::GetTaskHistory => (
                MessageKind::RooCodeTaskHistory,
                "history",
                self.engine.get_task_history().await,
            ),
            RooCommand::GetStatus => (
                MessageKind::RooCodeStatus,
                "status",
                self.engine.get_status().await,
            ),
            RooCommand::SetActiveProfile { name } => (
                MessageKind::RooCodeProfiles,
                "profile",
                self.engine.set_active_profile(name).await,
            ),
            RooCommand::CreateProfile { name, settings } => (
                MessageKind::RooCodeProfiles,
                "profile",
                self.engine.create_profile(name, settings).await,
            ),
            RooCommand::DeleteProfile { name } => (
                MessageKind::RooCodeProfiles,
                "profile",
                self.engine.delete_profile(name).await,
            ),
        };

        self.respond(kind, key, result, correlation_id).await;
    }

    fn spawn_forwarder(&self, task_id: String, mut stream: EventStream) {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(ev) = stream.recv().await {
                bridge.forward_event(&task_id, ev).await;
            }
        });
    }

    async fn forward_event(&self, fallback_task_id: &str, ev: EngineEvent) {
        let event = TaskEventPayload {
            event_name: ev.name,
            task_id: ev.task_id.unwrap_or_else(|| fallback_task_id.to_string()),
            parent_task_id: None,
            is_subtask: None,
            message: ev.payload,
        };
        let envelope = Envelope::agent(MessageKind::AgentResponse, self.agent.clone())
            .with_event(event);
        if self.outbound.send(envelope).await.is_err() {
            tracing::warn!(
                target = "session_relay::bridge",
                "dropping engine event, session outbound closed"
            );
        }
    }

    async fn respond(
        &self,
        kind: MessageKind,
        key: &str,
        result: Result<Value, String>,
        correlation_id: Option<Value>,
    ) {
        match result {
            Ok(value) => {
                let mut data = json!({ "success": true });
                data[key] = value;
                if let Some(id) = correlation_id {
                    data["correlationId"] = id;
                }
                self.send_response(kind, data).await;
            }
            Err(error) => self.send_error(kind, &error, correlation_id).await,
        }
    }

    async fn send_error(&self, kind: MessageKind, error: &str, correlation_id: Option<Value>) {
        let mut data = json!({ "success": false, "error": error });
        if let Some(id) = correlation_id {
            data["correlationId"] = id;
        }
        self.send_response(kind, data).await;
    }

    async fn send_response(&self, kind: MessageKind, data: Value) {
        let envelope = Envelope::agent(kind, self.agent.clone()).with_data(data);
        if self.outbound.send(envelope).await.is_err() {
            tracing::warn!(
                target = "session_relay::bridge",
                kind = ?kind,
                "dropping response, session outbound closed"
            );
        }
    }
}

/// Drain a stream into a list for synchronous callers, stopping at the first
/// terminal event or once the wait bound elapses.
pub async fn drain_events(mut stream: EventStream, wait: Duration) -> Vec<EngineEvent> {
    let deadline = tokio::time::Instant::now() + wait;
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, stream.recv()).await {
            Ok(Some(ev)) => {
                let terminal =
                    matches!(ev.name.as_str(), EVENT_TASK_COMPLETED | EVENT_TASK_ABORTED);
                events.push(ev);
                if terminal {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use super::{drain_events, EngineBridge, RooCommand};
    use crate::engine::{EngineEvent, EngineHandle, EngineRequest};
    use crate::protocol::{AgentDescriptor, Envelope, MessageKind, MessageSource};

    fn bridge_with_engine() -> (
        EngineBridge,
        mpsc::Receiver<EngineRequest>,
        mpsc::Receiver<Envelope>,
    ) {
        let (engine, requests) = EngineHandle::channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let bridge = EngineBridge::new(
            engine,
            outbound_tx,
            AgentDescriptor::new("agent-1", Some("/tmp/ws".into())),
        );
        (bridge, requests, outbound_rx)
    }

    fn command(kind: MessageKind, data: Value) -> Envelope {
        Envelope::new(kind, MessageSource::Ui)
            .with_agent(AgentDescriptor::new("agent-1", None))
            .with_data(data)
    }

    #[tokio::test]
    async fn create_task_reports_engine_assigned_id() {
        let (bridge, mut requests, mut outbound) = bridge_with_engine();

        let engine = tokio::spawn(async move {
            match requests.recv().await {
                Some(EngineRequest::StartTask { text, reply, .. }) => {
                    assert_eq!(text, "do the thing");
                    let (tx, rx) = mpsc::channel(8);
                    tx.send(EngineEvent::new(
                        "taskCreated",
                        Some("engine-task-7".into()),
                        json!({}),
                    ))
                    .await
                    .unwrap();
                    tx.send(EngineEvent::new("message", None, json!({"text": "working"})))
                        .await
                        .unwrap();
                    let _ = reply.send(Ok(rx));
                }
                other => panic!("unexpected request: {:?}", other),
            }
        });

        bridge
            .handle_command(command(
                MessageKind::CreateTask,
                json!({"message": "do the thing", "correlationId": "corr-1"}),
            ))
            .await;

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.kind, MessageKind::TaskStartedResponse);
        let data = response.data.unwrap();
        assert_eq!(data["success"], true);
        assert_eq!(data["taskId"], "engine-task-7");
        assert_eq!(data["correlationId"], "corr-1");

        // The remainder of the stream is forwarded without correlation.
        let forwarded = outbound.recv().await.unwrap();
        assert_eq!(forwarded.kind, MessageKind::AgentResponse);
        let event = forwarded.event.unwrap();
        assert_eq!(event.event_name, "message");
        assert_eq!(event.task_id, "engine-task-7");

        engine.await.unwrap();
    }

    #[tokio::test]
    async fn create_task_with_unexpected_first_event_reports_error_and_still_forwards() {
        let (bridge, mut requests, mut outbound) = bridge_with_engine();

        let engine = tokio::spawn(async move {
            match requests.recv().await {
                Some(EngineRequest::StartTask { reply, .. }) => {
                    let (tx, rx) = mpsc::channel(8);
                    tx.send(EngineEvent::new("message", None, json!({"text": "odd"})))
                        .await
                        .unwrap();
                    let _ = reply.send(Ok(rx));
                }
                other => panic!("unexpected request: {:?}", other),
            }
        });

        bridge
            .handle_command(command(
                MessageKind::CreateTask,
                json!({"message": "go"}),
            ))
            .await;

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.kind, MessageKind::TaskStartedResponse);
        assert_eq!(response.data.as_ref().unwrap()["success"], false);

        let forwarded = outbound.recv().await.unwrap();
        assert_eq!(forwarded.kind, MessageKind::AgentResponse);
        assert_eq!(forwarded.event.unwrap().task_id, "unknown");

        engine.await.unwrap();
    }

    #[tokio::test]
    async fn engine_failure_becomes_error_response() {
        let (bridge, mut requests, mut outbound) = bridge_with_engine();

        tokio::spawn(async move {
            if let Some(EngineRequest::GetProfiles { reply }) = requests.recv().await {
                let _ = reply.send(Err("profiles store unavailable".into()));
            }
        });

        bridge
            .handle_command(command(MessageKind::GetProfiles, json!({})))
            .await;

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.kind, MessageKind::ProfilesResponse);
        let data = response.data.unwrap();
        assert_eq!(data["success"], false);
        assert_eq!(data["error"], "profiles store unavailable");
    }

    #[tokio::test]
    async fn malformed_roo_command_is_rejected_at_the_boundary() {
        let (bridge, _requests, mut outbound) = bridge_with_engine();

        bridge
            .handle_command(command(
                MessageKind::RooCodeCommand,
                json!({"command": "selfDestruct"}),
            ))
            .await;

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.kind, MessageKind::RooCodeCommandResponse);
        let data = response.data.unwrap();
        assert_eq!(data["success"], false);
        assert!(data["error"].as_str().unwrap().contains("malformed command"));
    }

    #[tokio::test]
    async fn clone_repo_is_answered_unsupported() {
        let (bridge, _requests, mut outbound) = bridge_with_engine();

        bridge
            .handle_command(command(MessageKind::CloneRepo, json!({"url": "x"})))
            .await;

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.data.unwrap()["success"], false);
    }

    #[tokio::test]
    async fn resume_then_send_sequences_on_the_resume_reply() {
        let (bridge, mut requests, mut outbound) = bridge_with_engine();

        let engine = tokio::spawn(async move {
            match requests.recv().await {
                Some(EngineRequest::ResumeTask { task_id, reply }) => {
                    assert_eq!(task_id, "task-3");
                    // Reply only once the task is active; the bridge's
                    // response cannot precede this.
                    let _ = reply.send(Ok(json!({"active": true})));
                }
                other => panic!("unexpected request: {:?}", other),
            }
        });

        bridge
            .handle_command(command(
                MessageKind::RooCodeCommand,
                json!({"command": "resumeTask", "params": {"taskId": "task-3"}}),
            ))
            .await;

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.kind, MessageKind::RooCodeCommandResponse);
        assert_eq!(response.data.unwrap()["success"], true);
        engine.await.unwrap();
    }

    #[tokio::test]
    async fn drain_stops_at_terminal_event() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(EngineEvent::new("message", None, json!({}))).await.unwrap();
        tx.send(EngineEvent::new("taskCompleted", None, json!({})))
            .await
            .unwrap();
        tx.send(EngineEvent::new("late", None, json!({}))).await.unwrap();

        let events = drain_events(rx, Duration::from_secs(1)).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events.last().unwrap().name, "taskCompleted");
    }

    #[tokio::test]
    async fn drain_respects_the_wait_bound() {
        let (tx, rx) = mpsc::channel::<EngineEvent>(8);
        let events = drain_events(rx, Duration::from_millis(20)).await;
        assert!(events.is_empty());
        drop(tx);
    }

    #[test]
    fn roo_command_decodes_typed_params() {
        let decoded: RooCommand = serde_json::from_value(json!({
            "command": "resumeTask",
            "params": {"taskId": "t1"}
        }))
        .unwrap();
        assert_eq!(
            decoded,
            RooCommand::ResumeTask {
                task_id: "t1".into()
            }
        );

        let unit: RooCommand =
            serde_json::from_value(json!({"command": "clearTask"})).unwrap();
        assert_eq!(unit, RooCommand::ClearTask);
    }
}
