//! Headless Softphone - steuert einen Anruf über stdin

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use pulse_call::{format_duration, init_tracing, CallConfig, CallEvent, CallSessionManager};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Parser)]
#[command(name = "pulse-call")]
#[command(about = "Headless one-to-one voice call client")]
struct Cli {
    /// Eigene Teilnehmer-ID
    user: String,

    /// Raum, in dem angerufen wird
    room: String,

    /// Relay URL (überschreibt config.json)
    #[arg(long, env = "SIGNALING_URL")]
    relay: Option<String>,

    /// Konfigurationsdatei statt der Standard-Datei
    #[arg(long)]
    config: Option<PathBuf>,
}

const HELP: &str = "commands: call <user-id> | answer | reject | hangup | mute | unmute | state | quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CallConfig::from_file(path)?,
        None => CallConfig::load()?,
    };
    if let Some(relay) = cli.relay {
        config.signaling_url = relay;
    }

    let manager = CallSessionManager::with_defaults(config);
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event printer lagged, skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                CallEvent::StateChanged(state) => println!("* state: {}", state),
                CallEvent::RemoteStream(info) => {
                    println!("* remote audio: {} ({})", info.track_id, info.codec)
                }
                CallEvent::DurationTick(secs) => {
                    if secs % 10 == 0 {
                        println!("* {}", format_duration(secs));
                    }
                }
                CallEvent::Error(err) => println!("! {}", err),
                CallEvent::RelayError { code, message } => {
                    println!("! relay error {}: {}", code, message)
                }
            }
        }
    });

    manager
        .initialize(&cli.user, &cli.room)
        .await
        .context("failed to initialize call engine")?;
    println!("ready as {} in {}", cli.user, cli.room);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let result = match (words.next(), words.next()) {
            (Some("call"), Some(target)) => manager.start_call(target, &cli.room).await,
            (Some("answer"), _) => manager.answer_call().await,
            (Some("reject"), _) => manager.reject_call().await,
            (Some("hangup"), _) => manager.end_call().await,
            (Some("mute"), _) => manager.set_muted(true).await,
            (Some("unmute"), _) => manager.set_muted(false).await,
            (Some("state"), _) => {
                let status = manager.get_call_state();
                println!(
                    "{} {} local={} remote={}",
                    status.state,
                    format_duration(status.duration),
                    status.has_local_stream,
                    status.has_remote_stream
                );
                Ok(())
            }
            (Some("quit"), _) => break,
            (None, _) => Ok(()),
            _ => {
                println!("{}", HELP);
                Ok(())
            }
        };
        // Fehler kommen auch als Event an
        if let Err(err) = result {
            tracing::debug!("Command failed: {}", err);
        }
    }

    manager.disconnect().await;
    Ok(())
}
