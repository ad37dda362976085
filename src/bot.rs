//! Core bot wiring: shared state, gateway bridge and the async event loop.
//!
//! This module owns the "engine" of the bot. It opens the member log,
//! connects to Discord's gateway and spawns one task per incoming event, so a
//! slow outbound call never holds up the next message.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use secrecy::SecretString;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::dispatcher::{Dispatcher, Outcome};
use crate::events::BotEvent;
use crate::gateway::{self, GatewayConfig, GatewayError};
use crate::handlers;
use crate::http::DiscordPlatform;
use crate::platform::Platform;
use crate::registry::RegistryError;
use crate::storage::{MemberLog, StorageError, DEFAULT_DB_PATH};
use crate::types::{BuildInfo, UserId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why the bot could not start.
#[derive(Debug)]
pub enum BotError {
    Gateway(GatewayError),
    Registry(RegistryError),
    Storage(StorageError),
}

impl fmt::Display for BotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotError::Gateway(e) => write!(f, "{}", e),
            BotError::Registry(e) => write!(f, "command registration failed: {}", e),
            BotError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BotError {}

impl From<GatewayError> for BotError {
    fn from(e: GatewayError) -> Self {
        BotError::Gateway(e)
    }
}

impl From<RegistryError> for BotError {
    fn from(e: RegistryError) -> Self {
        BotError::Registry(e)
    }
}

impl From<StorageError> for BotError {
    fn from(e: StorageError) -> Self {
        BotError::Storage(e)
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Everything an event task needs, shared behind an `Arc`.
pub struct BotState {
    dispatcher: Dispatcher,
    members: MemberLog,
    /// When the bot started.
    pub start_time: Instant,
}

impl BotState {
    pub fn new(dispatcher: Dispatcher, members: MemberLog) -> Self {
        Self {
            dispatcher,
            members,
            start_time: Instant::now(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn members(&self) -> &MemberLog {
        &self.members
    }

    fn platform(&self) -> &dyn Platform {
        self.dispatcher.platform().as_ref()
    }

    /// Handle a single event to completion.
    pub async fn handle_event(&self, event: BotEvent) {
        debug!(event = event.name(), "handling event");
        match event {
            BotEvent::Ready { user, tag, guilds } => {
                self.platform().session_ready(user);
                info!(user = %tag, guilds, "bot is ready!");
            }

            BotEvent::MessageCreated(invocation) => {
                if invocation.author_bot {
                    return;
                }
                if let Outcome::Failed { command, .. } = self.dispatcher.dispatch(&invocation).await
                {
                    warn!(command = %command, channel_id = %invocation.channel, "command failed");
                }
            }

            BotEvent::MemberJoined { guild, user, tag } => {
                info!(user = %tag, guild = %guild, "member joined");
                if let Err(e) = self.members.record_join(guild, user).await {
                    error!(error = %e, "failed to record member join");
                }
                let config = self.dispatcher.config();
                if let Err(e) = handlers::greet_member(self.platform(), config, guild, user).await {
                    warn!(error = %e, "failed to send welcome message");
                }
            }

            BotEvent::MemberLeft { guild, user, tag } => {
                info!(user = %tag, guild = %guild, "member left");
                if let Err(e) = self.members.record_leave(guild, user).await {
                    error!(error = %e, "failed to record member leave");
                }
                let config = self.dispatcher.config();
                if let Err(e) = handlers::farewell_member(self.platform(), config, &tag).await {
                    warn!(error = %e, "failed to send farewell message");
                }
            }

            BotEvent::ReactionAdded {
                channel,
                message,
                user,
                emoji,
                ..
            } => {
                debug!(
                    channel_id = %channel,
                    message_id = %message,
                    user = ?user.map(UserId::get),
                    emoji = %emoji,
                    "reaction added"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Handle events until the queue closes, one task per event. Returns only
/// after every in-flight task has finished.
pub async fn run_events(state: Arc<BotState>, events: async_channel::Receiver<BotEvent>) {
    let mut tasks = JoinSet::new();

    while let Ok(event) = events.recv().await {
        while let Some(done) = tasks.try_join_next() {
            log_task_end(done);
        }
        let state = state.clone();
        tasks.spawn(async move {
            state.handle_event(event).await;
        });
    }

    debug!(in_flight = tasks.len(), "event stream ended, draining tasks");
    while let Some(done) = tasks.join_next().await {
        log_task_end(done);
    }
}

fn log_task_end(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "event task did not complete");
    }
}

// ---------------------------------------------------------------------------
// Bot entry point
// ---------------------------------------------------------------------------

/// Connect to Discord and run the event loop until the session shuts down
/// (owner `quit`, Ctrl-C, or a fatal gateway error).
pub async fn start(
    config: ConfigStore,
    token: SecretString,
    build: BuildInfo,
) -> Result<(), BotError> {
    let config = Arc::new(config);

    let db_path = config
        .get_str("Database", "path")
        .await
        .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let members = MemberLog::open(&db_path).await?;

    let gw = gateway::connect(GatewayConfig::new(token)).await.map_err(|e| {
        error!(error = %e, "failed to start gateway");
        e
    })?;

    let owner_override = config.get_u64("Bot", "owner_id").await.ok().map(UserId::new);
    let platform: Arc<dyn Platform> = Arc::new(DiscordPlatform::new(
        gw.http.clone(),
        gw.cache.clone(),
        gw.shard_manager.clone(),
        owner_override,
    ));

    let registry = handlers::builtin_registry()?;
    info!(commands = registry.len(), "commands registered");
    let dispatcher = Dispatcher::new(registry, platform, config, build)
        .configured()
        .await;

    let state = Arc::new(BotState::new(dispatcher, members));

    let shard_manager = gw.shard_manager.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shard_manager.shutdown_all().await;
            }
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C"),
        }
    });

    info!("gateway connecting, entering event loop");

    run_events(state.clone(), gw.events).await;

    warn!("event stream ended, bot shutting down");
    if let Err(e) = gw.driver_handle.await {
        warn!(error = %e, "gateway task did not finish cleanly");
    }
    state.members().close().await;
    info!(uptime_secs = state.start_time.elapsed().as_secs(), "bot stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Action;
    use crate::storage::MemberEventKind;
    use crate::testing::{invocation, test_config, FakePlatform};
    use crate::types::{ChannelId, GuildId};
    use static_assertions::assert_impl_all;

    assert_impl_all!(BotState: Send, Sync);

    async fn state() -> (Arc<FakePlatform>, BotState, tempfile::NamedTempFile) {
        let platform = Arc::new(FakePlatform::new());
        let (file, config) = test_config();
        let dispatcher = Dispatcher::new(
            handlers::builtin_registry().expect("registry"),
            platform.clone(),
            Arc::new(config),
            BuildInfo::new(None),
        );
        let members = MemberLog::in_memory().await.expect("db");
        (platform, BotState::new(dispatcher, members), file)
    }

    // -- messages ----------------------------------------------------------

    #[tokio::test]
    async fn messages_are_dispatched() {
        let (platform, state, _file) = state().await;
        state
            .handle_event(BotEvent::MessageCreated(invocation(1, "!quit")))
            .await;
        // not the owner: refused with a reply, nothing shut down
        assert_eq!(platform.performed().len(), 1);
        assert!(!platform.performed().contains(&Action::Shutdown));
    }

    #[tokio::test]
    async fn bot_messages_are_skipped() {
        let (platform, state, _file) = state().await;
        let mut msg = invocation(1, "!ping");
        msg.author_bot = true;
        state.handle_event(BotEvent::MessageCreated(msg)).await;
        assert!(platform.performed().is_empty());
    }

    // -- members -----------------------------------------------------------

    #[tokio::test]
    async fn joins_are_logged_and_greeted() {
        let (platform, state, _file) = state().await;
        state
            .handle_event(BotEvent::MemberJoined {
                guild: FakePlatform::GUILD,
                user: UserId::new(8),
                tag: "carol".to_string(),
            })
            .await;
        state
            .handle_event(BotEvent::MemberLeft {
                guild: FakePlatform::GUILD,
                user: UserId::new(8),
                tag: "carol".to_string(),
            })
            .await;

        let members = state.members();
        assert_eq!(
            members
                .count(FakePlatform::GUILD, MemberEventKind::Joined)
                .await
                .expect("joins"),
            1
        );
        assert_eq!(
            members
                .count(FakePlatform::GUILD, MemberEventKind::Left)
                .await
                .expect("leaves"),
            1
        );
        let sent = platform.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, ChannelId::new(5678));
        assert_eq!(sent[1].1, "**carol** has left the server.");
    }

    #[tokio::test]
    async fn unknown_guild_still_records_the_join() {
        let (platform, state, _file) = state().await;
        state
            .handle_event(BotEvent::MemberJoined {
                guild: GuildId::new(4),
                user: UserId::new(8),
                tag: "carol".to_string(),
            })
            .await;
        // the greeting needs the server name, which the platform can't find
        assert!(platform.sent().is_empty());
        assert_eq!(
            state
                .members()
                .count(GuildId::new(4), MemberEventKind::Joined)
                .await
                .expect("joins"),
            1
        );
    }

    // -- run_events() ------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn in_flight_events_finish_before_run_events_returns() {
        let (_platform, state, _file) = state().await;
        let state = Arc::new(state);
        let (tx, rx) = async_channel::bounded(64);
        for id in 1..=20 {
            tx.send(BotEvent::MemberJoined {
                guild: FakePlatform::GUILD,
                user: UserId::new(id),
                tag: format!("user{}", id),
            })
            .await
            .expect("queue");
        }
        drop(tx);

        run_events(state.clone(), rx).await;

        assert_eq!(
            state
                .members()
                .count(FakePlatform::GUILD, MemberEventKind::Joined)
                .await
                .expect("joins"),
            20
        );
    }

    // -- other events ------------------------------------------------------

    #[tokio::test]
    async fn ready_and_reactions_send_nothing() {
        let (platform, state, _file) = state().await;
        state
            .handle_event(BotEvent::Ready {
                user: FakePlatform::BOT,
                tag: "malcolm".to_string(),
                guilds: 1,
            })
            .await;
        state
            .handle_event(BotEvent::ReactionAdded {
                guild: Some(FakePlatform::GUILD),
                channel: FakePlatform::CHANNEL,
                message: crate::types::MessageId::new(1),
                user: Some(UserId::new(1)),
                emoji: "1\u{fe0f}\u{20e3}".to_string(),
            })
            .await;
        assert!(platform.performed().is_empty());
        assert!(platform.sent().is_empty());
    }
}
