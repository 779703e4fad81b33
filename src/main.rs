use anyhow::{Context, bail};
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use peerline::media::LoopbackMedia;
use peerline::store::{InMemorySignalStore, SignalStore};
use peerline::types::events::PhaseChanged;
use peerline::{CallConfig, CallPhase, Identity, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// Two signed-in identities sharing one in-memory store: a chat message, then
// a call from the caller that the callee picks up, held for a while and hung
// up by the caller.
//
// Usage:
//   cargo run
//   cargo run -- --caller ana@example.com --callee ben@example.com
//   RUST_LOG=debug cargo run -- --hold-secs 1

#[derive(Parser, Debug)]
#[command(name = "peerline", about = "Pairwise chat and call signaling demo")]
struct Args {
    /// Identity that places the call.
    #[arg(long, default_value = "alice@example.com")]
    caller: String,

    /// Identity that receives and accepts the call.
    #[arg(long, default_value = "bob@example.com")]
    callee: String,

    /// Chat message sent before the call.
    #[arg(long, default_value = "calling you now")]
    message: String,

    /// Seconds to stay connected before hanging up.
    #[arg(long, default_value_t = 3)]
    hold_secs: u64,
}

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    if let Err(e) = rt.block_on(run(args)) {
        error!("Demo failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store: Arc<dyn SignalStore> = Arc::new(InMemorySignalStore::new());
    let caller = Session::sign_in(
        Identity::new(args.caller),
        store.clone(),
        LoopbackMedia::new("caller"),
        CallConfig::default(),
    )
    .await
    .context("caller sign-in")?;
    let callee = Session::sign_in(
        Identity::new(args.callee),
        store.clone(),
        LoopbackMedia::new("callee"),
        CallConfig::default(),
    )
    .await
    .context("callee sign-in")?;

    let chat = caller.chat_with(callee.identity().clone())?;
    let mut inbox = callee.chat_with(caller.identity().clone())?.subscribe().await?;
    chat.send(&args.message).await?;
    if let Some(message) = inbox.next().await {
        info!("{} got a message from {}: {}", message.receiver, message.sender, message.message);
    }
    inbox.close().await;

    let mut incoming = callee.calls().events().incoming_call.subscribe();
    let mut caller_phases = caller.calls().events().phase_changed.subscribe();
    let mut notices = callee.calls().events().notice.subscribe();

    caller
        .calls()
        .start_call(callee.identity().clone())
        .await
        .context("start call")?;

    let ring = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .context("no incoming call")??;
    info!("{} is ringing: call from {}", callee.identity(), ring.from);
    callee.calls().accept_incoming().await.context("accept call")?;

    wait_for_phase(&mut caller_phases, CallPhase::Connected).await?;
    info!("Call established; holding for {}s", args.hold_secs);
    if let Some(enabled) = caller.calls().toggle_local_video().await {
        info!("Caller video enabled: {enabled}");
    }
    tokio::time::sleep(Duration::from_secs(args.hold_secs)).await;

    caller.calls().end_call().await;
    match tokio::time::timeout(Duration::from_secs(5), notices.recv()).await {
        Ok(Ok(notice)) => info!("Callee notice: {notice}"),
        Ok(Err(e)) => warn!("Notice channel closed: {e}"),
        Err(_) => warn!("Callee saw no notice"),
    }
    callee.calls().end_call().await;

    caller.sign_out().await;
    callee.sign_out().await;
    Ok(())
}

async fn wait_for_phase(
    phases: &mut broadcast::Receiver<Arc<PhaseChanged>>,
    target: CallPhase,
) -> anyhow::Result<()> {
    let wait = async {
        loop {
            let change = phases.recv().await?;
            if change.phase == target {
                return anyhow::Ok(());
            }
            if change.phase == CallPhase::Idle {
                bail!("call ended before reaching {target}");
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .with_context(|| format!("timed out waiting for {target}"))?
}
