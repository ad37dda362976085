//! Gateway bridge.
//!
//! serenity owns the WebSocket session (identify, heartbeat, resume,
//! sharding). This module builds the serenity [`Client`], converts the
//! callbacks we care about into [`BotEvent`]s and pushes them onto a bounded
//! queue. The rest of the bot consumes that queue without ever seeing a
//! serenity `Context`.

use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serenity::all::{
    Cache, Client, Context, EventHandler, GatewayIntents, GuildId, Http, Member, Message, Reaction,
    Ready, ShardManager, User,
};
use tracing::{debug, error, info, warn};

use crate::events::BotEvent;

/// Events buffered between serenity and the bot loop.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Intents for every event the bot handles: guild messages (with content),
/// DMs, member joins/leaves and reactions.
pub fn default_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MODERATION
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
}

/// Options for connecting to the Discord gateway.
pub struct GatewayConfig {
    pub token: SecretString,
    pub intents: GatewayIntents,
}

impl GatewayConfig {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            intents: default_intents(),
        }
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"[redacted]")
            .field("intents", &self.intents)
            .finish()
    }
}

#[derive(Debug)]
pub enum GatewayError {
    /// The client could not be built (bad token format, HTTP setup).
    Client(serenity::Error),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Client(e) => write!(f, "failed to build Discord client: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Client(e) => Some(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Event bridge
// ---------------------------------------------------------------------------

struct Bridge {
    events: async_channel::Sender<BotEvent>,
}

impl Bridge {
    async fn forward(&self, event: BotEvent) {
        let name = event.name();
        if self.events.send(event).await.is_err() {
            warn!(event = name, "event queue closed, dropping event");
        }
    }
}

#[serenity::async_trait]
impl EventHandler for Bridge {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(user = %ready.user.tag(), guilds = ready.guilds.len(), "gateway session ready");
        self.forward(BotEvent::from(&ready)).await;
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        debug!(message_id = %msg.id, channel_id = %msg.channel_id, "message received");
        self.forward(BotEvent::from(&msg)).await;
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        self.forward(BotEvent::from(&member)).await;
    }

    async fn guild_member_removal(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        user: User,
        _member: Option<Member>,
    ) {
        self.forward(BotEvent::MemberLeft {
            guild: crate::types::GuildId::new(guild_id.get()),
            user: crate::types::UserId::new(user.id.get()),
            tag: user.tag(),
        })
        .await;
    }

    async fn reaction_add(&self, _ctx: Context, reaction: Reaction) {
        self.forward(BotEvent::from(&reaction)).await;
    }
}

// ---------------------------------------------------------------------------
// Public handle returned to the bot
// ---------------------------------------------------------------------------

pub struct GatewayHandle {
    /// Typed events, in arrival order.
    pub events: async_channel::Receiver<BotEvent>,
    pub http: Arc<Http>,
    pub cache: Arc<Cache>,
    /// Used to shut the session down.
    pub shard_manager: Arc<ShardManager>,
    /// The task running the serenity client. Finishes when every shard has
    /// shut down.
    pub driver_handle: tokio::task::JoinHandle<()>,
}

/// Build the serenity client and start it on a background task.
pub async fn connect(config: GatewayConfig) -> Result<GatewayHandle, GatewayError> {
    let (event_tx, event_rx) = async_channel::bounded(EVENT_QUEUE_CAPACITY);

    let mut client = Client::builder(config.token.expose_secret(), config.intents)
        .event_handler(Bridge { events: event_tx })
        .await
        .map_err(GatewayError::Client)?;

    let http = client.http.clone();
    let cache = client.cache.clone();
    let shard_manager = client.shard_manager.clone();

    let driver_handle = tokio::spawn(async move {
        if let Err(e) = client.start().await {
            error!(error = %e, "gateway client stopped with an error");
        }
        info!("gateway client stopped");
    });

    Ok(GatewayHandle {
        events: event_rx,
        http,
        cache,
        shard_manager,
        driver_handle,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    // -- default_intents() -------------------------------------------------

    #[test]
    fn intents_cover_handled_events() {
        let intents = default_intents();
        assert!(intents.contains(GatewayIntents::GUILD_MESSAGES));
        assert!(intents.contains(GatewayIntents::MESSAGE_CONTENT));
        assert!(intents.contains(GatewayIntents::GUILD_MEMBERS));
        assert!(intents.contains(GatewayIntents::GUILD_MESSAGE_REACTIONS));
        assert!(!intents.contains(GatewayIntents::GUILD_PRESENCES));
    }

    // -- GatewayConfig -----------------------------------------------------

    #[test]
    fn debug_output_hides_the_token() {
        let config = GatewayConfig::new(SecretString::new("very-secret".to_string()));
        let shown = format!("{:?}", config);
        assert!(!shown.contains("very-secret"));
        assert!(shown.contains("[redacted]"));
    }

    // -- Bridge ------------------------------------------------------------

    #[tokio::test]
    async fn bridge_forwards_in_order() {
        let (tx, rx) = async_channel::bounded(EVENT_QUEUE_CAPACITY);
        let bridge = Bridge { events: tx };
        for id in 1..=3 {
            bridge
                .forward(BotEvent::MemberLeft {
                    guild: crate::types::GuildId::new(1),
                    user: UserId::new(id),
                    tag: format!("user{}", id),
                })
                .await;
        }
        for id in 1..=3 {
            match rx.recv().await.expect("event") {
                BotEvent::MemberLeft { user, .. } => assert_eq!(user, UserId::new(id)),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn bridge_survives_a_closed_queue() {
        let (tx, rx) = async_channel::bounded(1);
        drop(rx);
        let bridge = Bridge { events: tx };
        bridge
            .forward(BotEvent::Ready {
                user: UserId::new(1),
                tag: "malcolm".to_string(),
                guilds: 0,
            })
            .await;
    }
}
