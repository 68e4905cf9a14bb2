use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use outpost_session::api::outposts::HttpOutpostDirectory;
use outpost_session::auth::identity::LocalIdentity;
use outpost_session::config::ClientConfig;
use outpost_session::engine::events::{FeedbackOrigin, ReactionKind};
use outpost_session::engine::session::{SessionController, SessionPhase};
use outpost_session::notify::LogNotifier;
use outpost_session::transport::websocket::WebSocketTransport;

#[derive(Parser)]
#[command(name = "outpost-session", about = "Join an outpost and follow its live session")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "outpost.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join an outpost and stay until Ctrl+C
    Join {
        outpost_id: String,

        /// Send one reaction after joining, as `kind:address` (e.g. `like:0xabc`)
        #[arg(long, value_parser = parse_reaction)]
        react: Option<ReactArg>,
    },
}

#[derive(Clone, Debug)]
struct ReactArg {
    kind: ReactionKind,
    target: String,
}

fn parse_reaction(s: &str) -> Result<ReactArg, String> {
    let (kind, address) = s
        .split_once(':')
        .ok_or_else(|| format!("expected kind:address, got {s}"))?;
    let kind = ReactionKind::parse(kind)
        .ok_or_else(|| format!("unknown reaction kind {kind}, expected like, dislike, cheer or boo"))?;
    if address.is_empty() {
        return Err("missing target address".into());
    }
    Ok(ReactArg {
        kind,
        target: address.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration (TOML file + env overrides)
    let config = ClientConfig::load(&cli.config)?;

    let controller = SessionController::new(
        config.session_options(),
        Arc::new(WebSocketTransport),
        Arc::new(LocalIdentity::new(config.identity())),
        Arc::new(HttpOutpostDirectory::new(config.server.api_url.clone())),
        Arc::new(LogNotifier),
    );

    match cli.command {
        Command::Join { outpost_id, react } => {
            run_join(controller, &outpost_id, react).await?;
        }
    }

    Ok(())
}

async fn run_join(
    controller: Arc<SessionController>,
    outpost_id: &str,
    react: Option<ReactArg>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    spawn_event_log(&controller, cancel.clone());

    let session_id = controller
        .join(outpost_id)
        .await
        .with_context(|| format!("failed to join outpost {outpost_id}"))?;
    info!(%session_id, %outpost_id, "session started, press Ctrl+C to leave");

    if let Some(ReactArg { kind, target }) = react {
        match controller.react(kind, &target).await {
            Ok(accepted) => info!(
                kind = accepted.kind.as_str(),
                target = %accepted.target_address,
                cooldown_secs = accepted.cooldown.as_secs(),
                "reaction accepted"
            ),
            Err(e) => warn!(error = %e, "reaction rejected"),
        }
    }

    let mut phase = controller.subscribe_phase();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            info!("Shutdown signal received, leaving outpost...");
            if let Err(e) = controller.leave() {
                warn!(error = %e, "leave failed");
            }
        }
        // The session can also end on its own (host ended it, link lost).
        _ = phase.wait_for(|p| *p == SessionPhase::NotJoined) => {
            info!("session ended");
        }
    }

    cancel.cancel();
    info!("Outpost session stopped");
    Ok(())
}

/// Log feedback, presence and connection changes until cancelled.
fn spawn_event_log(controller: &Arc<SessionController>, cancel: CancellationToken) {
    let mut feedback = controller.subscribe_feedback();
    let mut presence = controller.subscribe_presence();
    let mut connection = controller.subscribe_connection();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = feedback.recv() => match event {
                    Ok(f) => info!(
                        kind = f.kind.as_str(),
                        from = %f.source_address,
                        to = %f.target_address,
                        local = f.origin == FeedbackOrigin::Local,
                        "reaction"
                    ),
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "feedback lagged"),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                update = presence.recv() => match update {
                    Ok(p) => info!(outpost_id = %p.outpost_id, online = p.online_count, live = p.live, "presence"),
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "presence lagged"),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connection.borrow_and_update();
                    info!(state = state.as_str(), "connection");
                }
            }
        }
    });
}
