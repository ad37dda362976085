//! The seam between the command core and the chat platform.
//!
//! Handlers describe side effects as [`Action`] values; the dispatcher hands
//! them to a [`Platform`], which in production is the serenity-backed
//! [`DiscordPlatform`](crate::http::DiscordPlatform).

use std::fmt;

use async_trait::async_trait;

use crate::capability::CapabilityResolver;
use crate::types::{
    BotProfile, ChannelId, GuildId, InvocationContext, MemberProfile, RichCard, ServerProfile,
    UserId,
};

/// Keycap glyphs used to vote on poll answers, in answer order.
pub const POLL_REACTIONS: [&str; 9] = [
    "1\u{fe0f}\u{20e3}",
    "2\u{fe0f}\u{20e3}",
    "3\u{fe0f}\u{20e3}",
    "4\u{fe0f}\u{20e3}",
    "5\u{fe0f}\u{20e3}",
    "6\u{fe0f}\u{20e3}",
    "7\u{fe0f}\u{20e3}",
    "8\u{fe0f}\u{20e3}",
    "9\u{fe0f}\u{20e3}",
];

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A side effect requested by a handler, carried out relative to the
/// invoking message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Plain-text reply in the originating channel.
    Say(String),
    /// Rich card reply in the originating channel.
    Card(RichCard),
    /// Send `card`, then react to it with the first `choices` poll glyphs.
    Poll { card: RichCard, choices: usize },
    /// React to the invoking message.
    React(String),
    /// Ban `user`, also deleting the last `delete_days` days of their
    /// messages.
    Ban {
        user: UserId,
        reason: String,
        delete_days: u8,
    },
    Kick { user: UserId, reason: String },
    /// Delete the most recent `count` messages in the originating channel.
    Purge { count: u8 },
    /// Give `user` the guild role named `role`.
    AddRole { user: UserId, role: String },
    /// Stop the event loop.
    Shutdown,
}

impl Action {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Say(_) => "say",
            Action::Card(_) => "card",
            Action::Poll { .. } => "poll",
            Action::React(_) => "react",
            Action::Ban { .. } => "ban",
            Action::Kick { .. } => "kick",
            Action::Purge { .. } => "purge",
            Action::AddRole { .. } => "add-role",
            Action::Shutdown => "shutdown",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The requested object does not exist (or is not visible to the bot).
    NotFound(String),
    /// The platform rejected the request.
    Api(String),
    /// The request never got an answer.
    Transport(String),
    /// The action needs context the invocation does not have (e.g. a guild).
    Unsupported(&'static str),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::NotFound(what) => write!(f, "not found: {}", what),
            PlatformError::Api(e) => write!(f, "Discord API error: {}", e),
            PlatformError::Transport(e) => write!(f, "transport error: {}", e),
            PlatformError::Unsupported(why) => write!(f, "unsupported: {}", why),
        }
    }
}

impl std::error::Error for PlatformError {}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Queries and outbound actions supplied by the platform client.
#[async_trait]
pub trait Platform: CapabilityResolver {
    /// The bot's own user ID, once known.
    async fn bot_user(&self) -> Option<UserId>;

    async fn bot_profile(&self) -> BotProfile;

    /// Look up a guild member. `Ok(None)` when the user is not a member.
    async fn member(&self, guild: GuildId, user: UserId)
        -> Result<Option<MemberProfile>, PlatformError>;

    async fn server(&self, guild: GuildId) -> Result<ServerProfile, PlatformError>;

    /// Carry out `action` on behalf of the invocation `ctx`.
    async fn perform(&self, ctx: &InvocationContext, action: &Action)
        -> Result<(), PlatformError>;

    /// Post a plain message to an arbitrary channel.
    async fn send(&self, channel: ChannelId, text: &str) -> Result<(), PlatformError>;

    /// Called when the gateway session is established, with the bot's own ID.
    fn session_ready(&self, _bot: UserId) {}
}
