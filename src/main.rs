use anyhow::Context;
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing_subscriber::EnvFilter;

use session_relay::config::{Cli, Command, ObserveArgs, ServeArgs};
use session_relay::protocol::{Envelope, MessageKind};
use session_relay::router::{self, Relay};

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Observe(args) => observe(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let relay = Relay::new(args.heartbeat());
    tokio::spawn(relay.clone().run_heartbeat());

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        target = "session_relay::main",
        addr = %addr,
        "relay listening"
    );
    axum::serve(listener, router::app(relay))
        .await
        .context("relay server exited with an error")
}

async fn observe(args: ObserveArgs) -> anyhow::Result<()> {
    let (stream, _response) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (mut sink, mut source) = stream.split();

    sink.send(Message::Text(serde_json::to_string(&Envelope::ui(
        MessageKind::Register,
    ))?))
    .await?;
    sink.send(Message::Text(serde_json::to_string(&Envelope::ui(
        MessageKind::GetAgents,
    ))?))
    .await?;

    while let Some(frame) = source.next().await {
        match frame? {
            Message::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{text}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
