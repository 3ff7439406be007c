//! Agent-side session controller.
//!
//! Owns the WebSocket connection to the relay and the reconnect state
//! machine around it: connect, register, answer pings, hand commands to the
//! engine bridge, and back off exponentially when the transport drops. A
//! normal close (1000) ends the session for good; anything else schedules a
//! reconnect until the attempt ceiling is hit.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::bridge::EngineBridge;
use crate::engine::EngineHandle;
use crate::error::{RelayError, Result};
use crate::protocol::{AgentDescriptor, Envelope, MessageKind, CLOSE_NORMAL};

const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 30_000;

/// Default ceiling on consecutive failed connection attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Backoff before reconnect attempt number `attempts` (zero-based):
/// 1s, 2s, 4s, 8s, 16s, then capped at 30s. No jitter; a single agent
/// reconnecting to its own relay has no thundering-herd problem.
pub fn reconnect_delay(attempts: u32) -> Duration {
    let backoff = RECONNECT_BASE_MS.saturating_mul(1u64 << attempts.min(15));
    Duration::from_millis(backoff.min(RECONNECT_MAX_MS))
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay endpoint, e.g. `ws://127.0.0.1:7465/ws`.
    pub url: String,
    pub agent: AgentDescriptor,
    pub ping_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, agent: AgentDescriptor) -> Self {
        Self {
            url: url.into(),
            agent,
            ping_interval: Duration::from_secs(10),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// How one connected session ended.
enum SessionEnd {
    /// Peer closed with 1000; do not reconnect.
    Normal,
    /// Transport dropped or closed abnormally; reconnect.
    Dropped,
}

pub struct SessionController {
    config: SessionConfig,
    engine: EngineHandle,
}

impl SessionController {
    pub fn new(config: SessionConfig, engine: EngineHandle) -> Self {
        Self { config, engine }
    }

    /// Run the session until the relay closes it normally or the reconnect
    /// ceiling is exhausted.
    pub async fn run(&self) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            match connect_async(self.config.url.as_str()).await {
                Ok((stream, _response)) => {
                    tracing::info!(
                        target = "session_relay::session",
                        url = %self.config.url,
                        agent = %self.config.agent.id,
                        "connected to relay"
                    );
                    attempts = 0;
                    match self.drive(stream).await {
                        Ok(SessionEnd::Normal) => {
                            tracing::info!(
                                target = "session_relay::session",
                                "relay closed the session normally"
                            );
                            return Ok(());
                        }
                        Ok(SessionEnd::Dropped) => {
                            tracing::warn!(
                                target = "session_relay::session",
                                "connection dropped, scheduling reconnect"
                            );
                        }
                        Err(error) => {
                            tracing::warn!(
                                target = "session_relay::session",
                                error = %error,
                                "session error, scheduling reconnect"
                            );
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target = "session_relay::session",
                        url = %self.config.url,
                        error = %error,
                        "connection attempt failed"
                    );
                }
            }

            if attempts >= self.config.max_reconnect_attempts {
                return Err(RelayError::ReconnectExhausted { attempts });
            }
            let delay = reconnect_delay(attempts);
            attempts += 1;
            tracing::info!(
                target = "session_relay::session",
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "backing off before reconnect"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Service one connected transport until it ends.
    async fn drive(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<SessionEnd> {
        let (mut sink, mut source) = stream.split();

        // Commands run detached so a slow engine call never stalls the read
        // loop; responses funnel back through this channel.
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(64);
        let bridge = EngineBridge::new(
            self.engine.clone(),
            outbound_tx,
            self.config.agent.clone(),
        );

        let register =
            Envelope::agent(MessageKind::Register, self.config.agent.clone());
        sink.send(Message::Text(serde_json::to_string(&register)?))
            .await?;

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ping.tick().await; // the first tick fires immediately; skip it

        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    // The bridge half-channel never closes while we hold it.
                    if let Some(envelope) = outbound {
                        sink.send(Message::Text(serde_json::to_string(&envelope)?))
                            .await?;
                    }
                }
                _ = ping.tick() => {
                    let heartbeat =
                        Envelope::agent(MessageKind::Ping, self.config.agent.clone());
                    sink.send(Message::Text(serde_json::to_string(&heartbeat)?))
                        .await?;
                }
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => {
                                    if let Some(reply) =
                                        self.handle_frame(&bridge, envelope)
                                    {
                                        sink.send(Message::Text(
                                            serde_json::to_string(&reply)?,
                                        ))
                                        .await?;
                                    }
                                }
                                Err(error) => {
                                    tracing::warn!(
                                        target = "session_relay::session",
                                        error = %error,
                                        "dropping malformed frame from relay"
                                    );
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code =
                                frame.as_ref().map(|f| u16::from(f.code));
                            return Ok(if code == Some(CLOSE_NORMAL) {
                                SessionEnd::Normal
                            } else {
                                tracing::warn!(
                                    target = "session_relay::session",
                                    code = ?code,
                                    reason = %frame
                                        .map(|f| f.reason.into_owned())
                                        .unwrap_or_default(),
                                    "relay closed the connection"
                                );
                                SessionEnd::Dropped
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::warn!(
                                target = "session_relay::session",
                                error = %error,
                                "ws read error"
                            );
                            return Ok(SessionEnd::Dropped);
                        }
                        None => return Ok(SessionEnd::Dropped),
                    }
                }
            }
        }
    }

    /// Handle one inbound envelope. Returns an immediate reply to write, if
    /// any; command work is spawned onto the runtime instead.
    fn handle_frame(&self, bridge: &EngineBridge, envelope: Envelope) -> Option<Envelope> {
        match envelope.kind {
            MessageKind::Ping => Some(Envelope::agent(
                MessageKind::Pong,
                self.config.agent.clone(),
            )),
            MessageKind::Registered => {
                tracing::debug!(
                    target = "session_relay::session",
                    "registration acknowledged"
                );
                None
            }
            kind if kind.is_agent_command() => {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    bridge.handle_command(envelope).await;
                });
                None
            }
            kind => {
                tracing::debug!(
                    target = "session_relay::session",
                    kind = ?kind,
                    "ignoring envelope"
                );
                None
            }
        }
    }
}
