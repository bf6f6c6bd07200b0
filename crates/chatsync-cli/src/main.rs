use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chatsync_core::memory::{AckMode, InMemoryBackend, InMemoryChangeFeed};
use chatsync_core::models::Message;
use chatsync_core::subscription::SubscriptionState;
use chatsync_core::tracing_setup::init_tracing;
use chatsync_core::windows::DockLayout;
use chatsync_core::{ChatSync, CoreConfig};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "chatsync-cli")]
#[command(about = "Run conversation sync scenarios against in-memory collaborators")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Path to JSON config file (defaults to the platform config dir)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    ShowConfig,

    /// Open conversations, exchange messages, drop the transport and report
    /// the reconciled state
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of conversations to open
    #[arg(long, short = 'n', default_value_t = 5)]
    conversations: usize,

    /// Remote messages per conversation
    #[arg(long, short = 'm', default_value_t = 4)]
    messages: usize,

    /// Override windows.maxOpenWindows
    #[arg(long)]
    max_open_windows: Option<usize>,

    /// Drop every feed connection halfway through the exchange
    #[arg(long)]
    drop_transport: bool,

    /// Use a feed that cannot resume from a cursor
    #[arg(long)]
    no_resume: bool,

    /// Reject local sends
    #[arg(long)]
    reject_sends: bool,

    /// Give up if the scenario does not settle within this many seconds
    #[arg(long, default_value_t = 30)]
    settle_secs: u64,

    /// Id of the local user
    #[arg(long, default_value = "me")]
    self_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let config = load_config(cli.config.as_deref())?;
    let output = match cli.command {
        Commands::ShowConfig => serde_json::to_value(&config)?,
        Commands::Simulate(args) => simulate(config, args).await?,
    };

    if cli.pretty {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", serde_json::to_string(&output)?);
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CoreConfig> {
    match path {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => match CoreConfig::default_path() {
            Some(path) => Ok(CoreConfig::load_or_default(path)?),
            None => Ok(CoreConfig::default()),
        },
    }
}

async fn simulate(mut config: CoreConfig, args: SimulateArgs) -> Result<Value> {
    if let Some(max_open) = args.max_open_windows {
        config.windows.max_open_windows = max_open;
    }
    let limit = Duration::from_secs(args.settle_secs);

    let feed = if args.no_resume {
        InMemoryChangeFeed::without_resume()
    } else {
        InMemoryChangeFeed::new()
    };
    let backend = InMemoryBackend::with_feed(&args.self_id, feed, AckMode::EchoOnly);
    let mut sync = ChatSync::new(config, backend.collaborators())?;

    for i in 1..=args.conversations {
        let transition = sync.open(&format!("conv-{i}"));
        if !transition.is_empty() {
            tracing::info!(
                demoted = ?transition.demoted,
                evicted = ?transition.evicted,
                "window capacity reached"
            );
        }
    }
    wait_until(&mut sync, limit, all_live).await?;

    let open: Vec<String> = sync
        .subscriptions()
        .into_iter()
        .map(|s| s.conversation_id)
        .collect();
    let first_half = args.messages / 2;

    for (index, conversation_id) in open.iter().enumerate() {
        let peer = format!("peer-{}", index + 1);
        sync.heartbeat(&peer);
        for n in 0..first_half {
            backend
                .store
                .insert_remote(conversation_id, &peer, &format!("{peer} message {}", n + 1));
        }
    }

    if args.reject_sends {
        backend
            .store
            .set_reject(Some(chatsync_core::StoreError::Rejected("sends disabled".into())));
    }
    let focused = sync.maximized().into_iter().next();
    if let Some(conversation_id) = &focused {
        sync.send(conversation_id, "hello from the simulator")?;
    }
    wait_until(&mut sync, limit, |s| {
        open.iter()
            .all(|id| settled(s.messages(id)) && remote_count(s, id) == first_half)
    })
    .await?;

    if args.drop_transport {
        tracing::info!("dropping every feed connection");
        backend.feed.disconnect_all();
    }
    for (index, conversation_id) in open.iter().enumerate() {
        let peer = format!("peer-{}", index + 1);
        for n in first_half..args.messages {
            backend
                .store
                .insert_remote(conversation_id, &peer, &format!("{peer} message {}", n + 1));
        }
    }
    wait_until(&mut sync, limit, |s| {
        all_live(s) && open.iter().all(|id| remote_count(s, id) == args.messages)
    })
    .await?;

    if let Some(conversation_id) = &focused {
        sync.mark_read(conversation_id)?;
    }
    let report = report(&mut sync);
    sync.shutdown();
    Ok(report)
}

async fn wait_until(
    sync: &mut ChatSync,
    limit: Duration,
    done: impl Fn(&ChatSync) -> bool,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + limit;
    while !done(&*sync) {
        match tokio::time::timeout_at(deadline, sync.next_update()).await {
            Ok(Some(update)) => tracing::debug!(?update, "sync update"),
            Ok(None) => bail!("event queue closed"),
            Err(_) => bail!("scenario did not settle within {limit:?}"),
        }
    }
    Ok(())
}

fn all_live(sync: &ChatSync) -> bool {
    sync.subscriptions()
        .iter()
        .all(|s| s.state == SubscriptionState::Live)
}

/// No message is still waiting for confirmation.
fn settled(messages: &[Message]) -> bool {
    messages.iter().all(|m| !m.is_pending())
}

fn remote_count(sync: &ChatSync, conversation_id: &str) -> usize {
    sync.messages(conversation_id)
        .iter()
        .filter(|m| m.sender_id != sync.self_id())
        .count()
}

fn format_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn report(sync: &mut ChatSync) -> Value {
    let conversations: Vec<Value> = sync
        .conversations()
        .into_iter()
        .map(|summary| {
            let id = summary.conversation.id;
            let messages: Vec<Value> = sync
                .messages(&id)
                .iter()
                .map(|m| {
                    json!({
                        "at": format_ms(m.created_at),
                        "serverId": m.server_id.as_ref().map(|s| s.to_string()),
                        "sender": m.sender_id,
                        "content": m.content,
                        "state": m.delivery_state,
                        "failure": m.failure.as_ref().map(|f| f.code()),
                    })
                })
                .collect();
            json!({
                "id": id,
                "window": sync.window_mode(&id),
                "connectivity": sync.connectivity(&id),
                "unread": summary.unread,
                "lastMessageAt": format_ms(summary.conversation.last_message_at),
                "participants": summary.conversation.participants,
                "messages": messages,
            })
        })
        .collect();

    let dock: Vec<Value> = sync
        .rearrange_all(DockLayout::default())
        .into_iter()
        .map(|slot| json!({"id": slot.conversation_id, "offset": slot.offset}))
        .collect();

    let presence: Vec<Value> = sync
        .presence_tracker()
        .snapshot()
        .into_iter()
        .map(|(id, presence)| json!({"id": id, "presence": presence}))
        .collect();

    json!({
        "selfId": sync.self_id(),
        "windows": {
            "maximized": sync.maximized(),
            "minimized": sync.minimized(),
            "dock": dock,
        },
        "conversations": conversations,
        "presence": presence,
    })
}
