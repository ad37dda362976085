//! Typed bot events.
//!
//! The gateway bridge converts serenity's callback arguments into this enum
//! so the bot loop can pattern-match on small owned values instead of holding
//! serenity contexts.

use crate::types::{ChannelId, GuildId, InvocationContext, MessageId, UserId};

// ---------------------------------------------------------------------------
// The top-level event enum
// ---------------------------------------------------------------------------

/// One event coming off the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent {
    /// The session is established.
    Ready {
        user: UserId,
        tag: String,
        guilds: usize,
    },

    /// A message was posted in a channel the bot can see.
    MessageCreated(InvocationContext),

    MemberJoined {
        guild: GuildId,
        user: UserId,
        tag: String,
    },

    MemberLeft {
        guild: GuildId,
        user: UserId,
        tag: String,
    },

    ReactionAdded {
        guild: Option<GuildId>,
        channel: ChannelId,
        message: MessageId,
        user: Option<UserId>,
        emoji: String,
    },
}

impl BotEvent {
    /// Event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            BotEvent::Ready { .. } => "ready",
            BotEvent::MessageCreated(_) => "message-created",
            BotEvent::MemberJoined { .. } => "member-joined",
            BotEvent::MemberLeft { .. } => "member-left",
            BotEvent::ReactionAdded { .. } => "reaction-added",
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions from serenity
// ---------------------------------------------------------------------------

#[cfg(feature = "io")]
mod from_serenity {
    use serenity::model::channel::{Message, Reaction};
    use serenity::model::gateway::Ready;
    use serenity::model::guild::Member;

    use super::BotEvent;
    use crate::types::{ChannelId, GuildId, InvocationContext, MessageId, UserId};

    impl From<&Message> for InvocationContext {
        fn from(msg: &Message) -> Self {
            InvocationContext {
                author: UserId::new(msg.author.id.get()),
                author_tag: msg.author.tag(),
                author_avatar: msg.author.avatar_url(),
                author_bot: msg.author.bot,
                guild: msg.guild_id.map(|g| GuildId::new(g.get())),
                channel: ChannelId::new(msg.channel_id.get()),
                message: MessageId::new(msg.id.get()),
                content: msg.content.clone(),
                mentions: msg.mentions.iter().map(|u| UserId::new(u.id.get())).collect(),
            }
        }
    }

    impl From<&Ready> for BotEvent {
        fn from(ready: &Ready) -> Self {
            BotEvent::Ready {
                user: UserId::new(ready.user.id.get()),
                tag: ready.user.tag(),
                guilds: ready.guilds.len(),
            }
        }
    }

    impl From<&Message> for BotEvent {
        fn from(msg: &Message) -> Self {
            BotEvent::MessageCreated(msg.into())
        }
    }

    impl From<&Member> for BotEvent {
        fn from(member: &Member) -> Self {
            BotEvent::MemberJoined {
                guild: GuildId::new(member.guild_id.get()),
                user: UserId::new(member.user.id.get()),
                tag: member.user.tag(),
            }
        }
    }

    impl From<&Reaction> for BotEvent {
        fn from(reaction: &Reaction) -> Self {
            BotEvent::ReactionAdded {
                guild: reaction.guild_id.map(|g| GuildId::new(g.get())),
                channel: ChannelId::new(reaction.channel_id.get()),
                message: MessageId::new(reaction.message_id.get()),
                user: reaction.user_id.map(|u| UserId::new(u.get())),
                emoji: reaction.emoji.to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
