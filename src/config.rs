//! Command-line and environment configuration.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::registry::HeartbeatConfig;

pub const DEFAULT_PORT: u16 = 7465;

#[derive(Debug, Parser)]
#[command(name = "agent-session-relay", version, about = "WebSocket relay between coding agents and UI consumers")]
pub struct Cli {
    /// Log filter when RUST_LOG is not set (e.g. `info`, `session_relay=debug`).
    #[arg(long, global = true, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Connect to a relay as a UI observer and print broadcast traffic.
    Observe(ObserveArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, default_value_t = DEFAULT_PORT, env = "RELAY_PORT")]
    pub port: u16,

    #[arg(long, default_value = "127.0.0.1", env = "RELAY_BIND")]
    pub bind: String,

    /// Interval between server-initiated heartbeat pings.
    #[arg(long, default_value_t = 10_000, env = "RELAY_PING_INTERVAL_MS")]
    pub ping_interval_ms: u64,

    /// A session is evicted after `ping interval x multiplier` of silence.
    #[arg(long, default_value_t = 5, env = "RELAY_TIMEOUT_MULTIPLIER")]
    pub timeout_multiplier: u32,

    /// Window after registration during which a session is never pinged.
    #[arg(long, default_value_t = 30_000, env = "RELAY_GRACE_PERIOD_MS")]
    pub grace_period_ms: u64,
}

impl ServeArgs {
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            timeout_multiplier: self.timeout_multiplier,
            grace_period: Duration::from_millis(self.grace_period_ms),
        }
    }
}

#[derive(Debug, Args)]
pub struct ObserveArgs {
    /// Relay WebSocket endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:7465/ws", env = "RELAY_URL")]
    pub url: String,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn serve_defaults_match_the_heartbeat_contract() {
        let cli = Cli::parse_from(["agent-session-relay", "serve"]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.port, 7465);
        let hb = args.heartbeat();
        assert_eq!(hb.ping_interval, Duration::from_secs(10));
        assert_eq!(hb.timeout_multiplier, 5);
        assert_eq!(hb.grace_period, Duration::from_secs(30));
    }

    #[test]
    fn observe_takes_a_url() {
        let cli = Cli::parse_from([
            "agent-session-relay",
            "observe",
            "--url",
            "ws://10.0.0.2:7465/ws",
        ]);
        let Command::Observe(args) = cli.command else {
            panic!("expected observe");
        };
        assert_eq!(args.url, "ws://10.0.0.2:7465/ws");
    }
}
