//! Durcit sync CLI - headless notification and session sync client.
//!
//! This is the main binary entry point. See the `durcit_sync` library
//! for the core functionality.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use durcit_sync::api::{HttpPushApi, PushApi, SharedPushApi};
use durcit_sync::env::Environment;
use durcit_sync::hub::{self, SyncEvent, SyncHub};
use durcit_sync::notifications::NotificationStateStore;
use durcit_sync::push::{ConnectionState, PushConnectionManager, StompTransport};
use durcit_sync::session::storage::{ACCESS_TOKEN_KEY, MEMBER_ID_KEY, REFRESH_TOKEN_KEY};
use durcit_sync::session::{CredentialStore, FileCredentialStore, Identity, SessionStateTracker};
use durcit_sync::Config;
use mimalloc::MiMalloc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Time given to the push session to flush SEND and DISCONNECT before exit.
const FLUSH_GRACE: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "durcit-sync")]
#[command(version, about = "Durcit notification and session sync client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the session and stream notifications until Ctrl-C
    Watch,
    /// Fetch and list notifications for the logged-in member
    Notifications,
    /// Mark a notification as read
    Ack {
        /// Notification id
        id: i64,
    },
    /// React to a post over the push connection
    Emoji {
        /// Post id
        post_id: i64,
        /// Emoji to add
        emoji: String,
    },
    /// Log out on the server and clear local credentials
    Logout,
    /// Inspect or edit the shared credential store
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print the current identity
    Show,
    /// Store credentials (as a login page would)
    Set {
        /// Member id
        #[arg(long)]
        member_id: String,
        /// Access token
        #[arg(long)]
        access_token: String,
        /// Refresh token
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Remove all credentials
    Clear,
}

fn main() -> Result<()> {
    let environment = Environment::current();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(environment.default_log_filter()),
    )
    .format_timestamp_secs()
    .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let credentials = FileCredentialStore::new(config.credentials_file()?);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Commands::Watch => runtime.block_on(run_watch(&config, credentials)),
        Commands::Notifications => runtime.block_on(list_notifications(&config, &credentials)),
        Commands::Ack { id } => runtime.block_on(acknowledge(&config, &credentials, id)),
        Commands::Emoji { post_id, emoji } => {
            runtime.block_on(send_emoji(&config, credentials, post_id, &emoji))
        }
        Commands::Logout => runtime.block_on(logout(&config, &credentials)),
        Commands::Session { action } => session_command(&config, &credentials, action),
    }
}

fn require_identity(store: &dyn CredentialStore) -> Result<Identity> {
    Identity::from_store(store).context("Not logged in (run `durcit-sync session set`)")
}

/// Build a hub wired to the real transport and REST client.
fn build_hub(
    config: &Config,
    store: Box<dyn CredentialStore>,
    events: hub::SyncEventSender,
    transport_tx: mpsc::UnboundedSender<durcit_sync::push::TransportEvent>,
) -> Result<SyncHub<StompTransport>> {
    let api: SharedPushApi = Arc::new(HttpPushApi::new(&config.api_url)?);
    let transport = StompTransport::new(&config.ws_url, transport_tx);
    let mut manager = PushConnectionManager::new(
        transport,
        config.channel_prefix.clone(),
        config.subscribe_timeout(),
    );
    if let Some(topic) = config.emoji_topic() {
        manager = manager.with_emoji_topic(topic);
    }
    let tracker = SessionStateTracker::new(store);
    Ok(SyncHub::new(tracker, manager, api, events))
}

async fn run_watch(config: &Config, mut credentials: FileCredentialStore) -> Result<()> {
    let (events_tx, events_rx) = hub::events::channel();
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();

    let storage_tx = events_tx.clone();
    credentials.watch(Arc::new(move || {
        let _ = storage_tx.send(SyncEvent::StorageChanged);
    }))?;

    let mut sync_hub = build_hub(config, Box::new(credentials), events_tx, transport_tx)?;
    sync_hub.on_alert(|count| println!("🔔 {count} unread notification(s)"));
    sync_hub.on_identity_change(|_, new| match new {
        Some(identity) => println!("Logged in as member {}", identity.subject_id),
        None => println!("Logged out"),
    });
    sync_hub.manager_mut().on_message(|payload| log::debug!("[Watch] {payload}"));
    sync_hub.on_emoji_update(|update| println!("Emoji update: {update}"));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    sync_hub.run(events_rx, transport_rx, shutdown).await?;
    tokio::time::sleep(FLUSH_GRACE).await;
    Ok(())
}

async fn list_notifications(config: &Config, credentials: &FileCredentialStore) -> Result<()> {
    let identity = require_identity(credentials)?;
    let api = HttpPushApi::new(&config.api_url)?;

    let mut store = NotificationStateStore::new();
    store.replace_all(api.fetch_notifications(&identity).await?);

    for n in store.snapshot() {
        println!(
            "{} {:>6} {:<10} {}{}",
            if n.confirmed { " " } else { "*" },
            n.id,
            n.kind,
            n.message.as_deref().unwrap_or(""),
            n.target_route().map(|r| format!("  ({r})")).unwrap_or_default()
        );
    }
    println!("{} unread", store.unconfirmed_count());
    Ok(())
}

async fn acknowledge(config: &Config, credentials: &FileCredentialStore, id: i64) -> Result<()> {
    let identity = require_identity(credentials)?;
    let api = HttpPushApi::new(&config.api_url)?;
    api.confirm(&identity, id).await?;
    println!("Notification {id} marked as read");
    Ok(())
}

async fn send_emoji(
    config: &Config,
    credentials: FileCredentialStore,
    post_id: i64,
    emoji: &str,
) -> Result<()> {
    require_identity(&credentials)?;

    let (events_tx, mut events_rx) = hub::events::channel();
    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
    let mut sync_hub = build_hub(config, Box::new(credentials), events_tx, transport_tx)?;
    sync_hub.start();

    let deadline = tokio::time::sleep(config.subscribe_timeout());
    tokio::pin!(deadline);

    while sync_hub.connection_state() != ConnectionState::Subscribed {
        tokio::select! {
            () = &mut deadline => anyhow::bail!("Push connection not established in time"),
            Some(event) = transport_rx.recv() => sync_hub.handle_event(SyncEvent::Transport(event)),
            Some(event) = events_rx.recv() => sync_hub.handle_event(event),
        }
    }

    let sent = sync_hub.add_emoji(post_id, emoji);
    sync_hub.manager_mut().shutdown();
    tokio::time::sleep(FLUSH_GRACE).await;

    if sent {
        println!("Sent {emoji} to post {post_id}");
        Ok(())
    } else {
        anyhow::bail!("Push connection dropped before sending")
    }
}

async fn logout(config: &Config, credentials: &FileCredentialStore) -> Result<()> {
    if let Some(identity) = Identity::from_store(credentials) {
        let api = HttpPushApi::new(&config.api_url)?;
        if let Err(e) = api.logout(&identity).await {
            log::warn!("Server logout failed: {e:#}; clearing local session anyway");
        }
    }
    credentials.clear()?;
    println!("Logged out");
    Ok(())
}

fn session_command(
    config: &Config,
    credentials: &FileCredentialStore,
    action: SessionAction,
) -> Result<()> {
    match action {
        SessionAction::Show => match Identity::from_store(credentials) {
            Some(identity) => {
                println!("Member:  {}", identity.subject_id);
                println!("Channel: {}", config.channel_for(&identity.subject_id));
                println!("Store:   {}", credentials.path().display());
            }
            None => println!("Anonymous ({})", credentials.path().display()),
        },
        SessionAction::Set {
            member_id,
            access_token,
            refresh_token,
        } => {
            // One write: watchers never see B's token next to A's member id.
            credentials.write_batch(&[
                (ACCESS_TOKEN_KEY, Some(access_token.as_str())),
                (REFRESH_TOKEN_KEY, refresh_token.as_deref()),
                (MEMBER_ID_KEY, Some(member_id.as_str())),
            ])?;
            println!("Session stored for member {member_id}");
        }
        SessionAction::Clear => {
            credentials.clear()?;
            println!("Session cleared");
        }
    }
    Ok(())
}
