//! CLI front-ends: answer inbound calls, place a test call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Context;
use crate::media::host::{silence_payload, ConsoleChannel, FRAME_INTERVAL_MS};
use crate::media::{CallControl, ConsoleHost, SessionManager};
use crate::signaling;

/// Start the signaling client for `host`.
fn start_signaling(
    ctx: &Arc<Context>,
    host: Arc<dyn CallControl>,
) -> (Arc<SessionManager>, JoinHandle<Result<()>>) {
    let (tx, rx) = signaling::channel();
    let manager = Arc::new(SessionManager::new(ctx.clone(), host, Some(tx)));
    let task = tokio::spawn(signaling::run(ctx.clone(), manager.clone(), rx));
    (manager, task)
}

async fn stop(ctx: &Context, manager: &SessionManager, task: JoinHandle<Result<()>>) -> Result<()> {
    manager.shutdown().await;
    ctx.shutdown();
    task.await.context("Signaling task panicked")?
}

/// Re-read the config file on SIGHUP until shutdown.
#[cfg(unix)]
fn reload_on_sighup(ctx: &Arc<Context>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if let Err(e) = ctx.reload() {
                        tracing::warn!("Reload failed, keeping previous settings: {:#}", e);
                    }
                }
                _ = ctx.shutdown_token().cancelled() => break,
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn reload_on_sighup(_ctx: &Arc<Context>) -> Result<()> {
    Ok(())
}

/// Register with signaling and auto-answer inbound calls until Ctrl-C.
pub async fn run_serve(ctx: Arc<Context>, echo: bool) -> Result<()> {
    let settings = ctx.settings();
    println!();
    println!("=== MoQ bridge ===");
    println!("Signaling: {}", settings.signaling_url());
    println!("User:      {}", settings.user_id.as_deref().unwrap_or("(none)"));
    println!("Context:   {}", settings.context);
    println!("Echo:      {}", if echo { "enabled" } else { "disabled" });
    println!();

    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
    let host = Arc::new(ConsoleHost::new(echo, Some(incoming_tx)));
    let (manager, task) = start_signaling(&ctx, host);
    reload_on_sighup(&ctx)?;

    println!("Waiting for calls... (Ctrl-C to stop)");
    loop {
        tokio::select! {
            Some(session_id) = incoming_rx.recv() => {
                if let Err(e) = manager.answer(&session_id) {
                    tracing::warn!("Failed to answer {}: {}", session_id, e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    stop(&ctx, &manager, task).await
}

/// Call `dest`, stream silence for `duration_secs`, then hang up.
pub async fn run_call(ctx: Arc<Context>, dest: &str, duration_secs: u64) -> Result<()> {
    let (manager, task) = start_signaling(&ctx, Arc::new(ConsoleHost::new(false, None)));

    let session = manager
        .request(dest, None)
        .await
        .with_context(|| format!("Failed to create session for {}", dest))?;
    let channel = Arc::new(ConsoleChannel::new(&session, false));
    session.fixup(channel.clone());
    session.call().context("Failed to place call")?;

    println!("call_placed=true");
    println!("session_id={}", session.id());
    println!("track_id={:08x}", session.track_id());

    let silence = silence_payload();
    let mut interval = tokio::time::interval(Duration::from_millis(FRAME_INTERVAL_MS));
    let deadline = tokio::time::sleep(Duration::from_secs(duration_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if session.state().is_terminal() {
                    println!("remote_hangup=true");
                    break;
                }
                session.write(&silence, None);
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                break;
            }
        }
    }

    println!("final_state={}", session.state());
    manager.hangup(session.id()).await;

    let stats = session.stats();
    println!("packets_sent={}", stats.packets_sent);
    println!("bytes_sent={}", stats.bytes_sent);
    println!("packets_received={}", stats.packets_received);
    println!("frames_delivered={}", channel.frames_received());
    println!("packets_lost={}", stats.packets_lost);
    println!("discarded={}", stats.discarded);

    stop(&ctx, &manager, task).await
}

/// Run the router server until Ctrl-C.
pub async fn run_signaling_server(port: u16) -> Result<()> {
    let listener = signaling::server::bind(port).await?;
    let shutdown = tokio_util::sync::CancellationToken::new();
    let server = tokio::spawn(signaling::server::serve(listener, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("Server stopped by user");
    shutdown.cancel();
    server.await.context("Signaling server panicked")?
}
