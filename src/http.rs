//! Discord REST adapter.
//!
//! [`DiscordPlatform`] implements [`Platform`] over serenity's `Http` client
//! and cache, so every outbound call and every lookup goes through one place.
//! serenity handles rate-limit buckets and retries; this module only maps
//! our [`Action`]s onto serenity calls and serenity errors onto
//! [`PlatformError`].

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all as sn;
use serenity::builder::{
    CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter, CreateMessage, GetMessages,
};
use tracing::{debug, warn};

use crate::capability::{Capability, CapabilityResolver, Permissions};
use crate::platform::{Action, Platform, PlatformError, POLL_REACTIONS};
use crate::types::{
    BotProfile, ChannelId, GuildId, InvocationContext, MemberProfile, RichCard, ServerProfile,
    UserId,
};

// ---------------------------------------------------------------------------
// ID and value conversions
// ---------------------------------------------------------------------------

fn sn_guild(id: GuildId) -> sn::GuildId {
    sn::GuildId::new(id.get())
}

fn sn_user(id: UserId) -> sn::UserId {
    sn::UserId::new(id.get())
}

fn sn_channel(id: ChannelId) -> sn::ChannelId {
    sn::ChannelId::new(id.get())
}

fn to_chrono(ts: sn::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.unix_timestamp(), 0)
}

fn permissions_from(perms: sn::Permissions) -> Permissions {
    Permissions::from_bits_truncate(perms.bits())
}

fn is_not_found(e: &serenity::Error) -> bool {
    match e {
        serenity::Error::Http(http) => http.status_code().map(|s| s.as_u16()) == Some(404),
        _ => false,
    }
}

impl From<serenity::Error> for PlatformError {
    fn from(e: serenity::Error) -> Self {
        if is_not_found(&e) {
            return PlatformError::NotFound(e.to_string());
        }
        match e {
            serenity::Error::Http(http) => match http.status_code() {
                Some(_) => PlatformError::Api(http.to_string()),
                None => PlatformError::Transport(http.to_string()),
            },
            other => PlatformError::Transport(other.to_string()),
        }
    }
}

fn embed(card: &RichCard) -> CreateEmbed {
    let mut embed = CreateEmbed::new();
    if let Some(title) = &card.title {
        embed = embed.title(title);
    }
    if let Some(url) = &card.url {
        embed = embed.url(url);
    }
    if let Some(description) = &card.description {
        embed = embed.description(description);
    }
    for field in &card.fields {
        embed = embed.field(&field.name, &field.value, field.inline);
    }
    if let Some(thumbnail) = &card.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }
    if let Some(author) = &card.author {
        embed = embed.author(CreateEmbedAuthor::new(author));
    }
    if let Some(footer) = &card.footer {
        embed = embed.footer(CreateEmbedFooter::new(footer));
    }
    embed
}

// ---------------------------------------------------------------------------
// DiscordPlatform
// ---------------------------------------------------------------------------

/// The production [`Platform`].
///
/// Permissions and members are fetched on every call, never cached here.
pub struct DiscordPlatform {
    http: Arc<sn::Http>,
    cache: Arc<sn::Cache>,
    shard_manager: Arc<sn::ShardManager>,
    /// `Bot.owner_id` from settings; wins over the application owner.
    owner_override: Option<UserId>,
    bot_user: OnceLock<UserId>,
}

impl DiscordPlatform {
    pub fn new(
        http: Arc<sn::Http>,
        cache: Arc<sn::Cache>,
        shard_manager: Arc<sn::ShardManager>,
        owner_override: Option<UserId>,
    ) -> Self {
        Self {
            http,
            cache,
            shard_manager,
            owner_override,
            bot_user: OnceLock::new(),
        }
    }

    /// Record the bot's own ID (from the ready event).
    pub fn set_bot_user(&self, user: UserId) {
        if self.bot_user.set(user).is_err() {
            debug!("bot user already known");
        }
    }

    async fn owner(&self) -> Option<UserId> {
        if self.owner_override.is_some() {
            return self.owner_override;
        }
        match self.http.get_current_application_info().await {
            Ok(info) => info.owner.map(|u| UserId::new(u.id.get())),
            Err(e) => {
                warn!(error = %e, "failed to fetch application owner");
                None
            }
        }
    }

    async fn guild_permissions(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<Permissions, PlatformError> {
        let member = sn_guild(guild).member(&self.http, sn_user(user)).await?;

        let cached = self
            .cache
            .guild(sn_guild(guild))
            .map(|g| g.member_permissions(&member));
        let perms = match cached {
            Some(perms) => perms,
            None => {
                let partial = sn_guild(guild).to_partial_guild(&self.http).await?;
                partial.member_permissions(&member)
            }
        };
        Ok(permissions_from(perms))
    }

    async fn role_names(&self, member: &sn::Member) -> Vec<String> {
        match member.guild_id.roles(&self.http).await {
            Ok(roles) => member
                .roles
                .iter()
                .filter_map(|id| roles.get(id))
                .map(|role| role.name.clone())
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to fetch guild roles");
                Vec::new()
            }
        }
    }

    fn require_guild(ctx: &InvocationContext) -> Result<sn::GuildId, PlatformError> {
        ctx.guild
            .map(sn_guild)
            .ok_or(PlatformError::Unsupported("action needs a guild"))
    }

    async fn add_role(
        &self,
        guild: sn::GuildId,
        user: UserId,
        role: &str,
    ) -> Result<(), PlatformError> {
        let roles = guild.roles(&self.http).await?;
        let role_id = roles
            .values()
            .find(|r| r.name == role)
            .map(|r| r.id)
            .ok_or_else(|| PlatformError::NotFound(format!("role `{}`", role)))?;
        self.http
            .add_member_role(guild, sn_user(user), role_id, Some("Role added via command"))
            .await?;
        Ok(())
    }

    async fn purge(&self, channel: sn::ChannelId, count: u8) -> Result<(), PlatformError> {
        let messages = channel
            .messages(&self.http, GetMessages::new().limit(count))
            .await?;
        debug!(channel_id = %channel, found = messages.len(), "deleting messages");
        for message in messages {
            channel.delete_message(&self.http, message.id).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for DiscordPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordPlatform")
            .field("owner_override", &self.owner_override)
            .field("bot_user", &self.bot_user.get())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CapabilityResolver for DiscordPlatform {
    async fn has_capability(
        &self,
        user: UserId,
        guild: Option<GuildId>,
        capability: Capability,
    ) -> bool {
        if capability == Capability::BotOwner {
            return self.owner().await == Some(user);
        }
        let Some(guild) = guild else {
            return false;
        };
        match self.guild_permissions(guild, user).await {
            Ok(perms) => capability.is_granted(perms, false),
            Err(e) => {
                warn!(user = %user, guild = %guild, error = %e, "permission lookup failed");
                false
            }
        }
    }
}

#[async_trait]
impl Platform for DiscordPlatform {
    async fn bot_user(&self) -> Option<UserId> {
        self.bot_user.get().copied()
    }

    async fn bot_profile(&self) -> BotProfile {
        BotProfile {
            server_count: self.cache.guild_count(),
            owner: self.owner().await,
        }
    }

    async fn member(
        &self,
        guild: GuildId,
        user: UserId,
    ) -> Result<Option<MemberProfile>, PlatformError> {
        let member = match sn_guild(guild).member(&self.http, sn_user(user)).await {
            Ok(member) => member,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let roles = self.role_names(&member).await;
        Ok(Some(MemberProfile {
            id: user,
            tag: member.user.tag(),
            avatar_url: Some(member.face()),
            joined_at: member.joined_at.and_then(to_chrono),
            roles,
        }))
    }

    async fn server(&self, guild: GuildId) -> Result<ServerProfile, PlatformError> {
        let partial = sn_guild(guild)
            .to_partial_guild_with_counts(&self.http)
            .await?;
        Ok(ServerProfile {
            id: guild,
            name: partial.name.clone(),
            description: partial.description.clone(),
            member_count: partial.approximate_member_count,
            owner: UserId::new(partial.owner_id.get()),
            icon_url: partial.icon_url(),
        })
    }

    async fn perform(
        &self,
        ctx: &InvocationContext,
        action: &Action,
    ) -> Result<(), PlatformError> {
        let channel = sn_channel(ctx.channel);
        debug!(action = action.kind(), channel_id = %channel, "performing action");

        match action {
            Action::Say(text) => {
                channel.say(&self.http, text).await?;
            }
            Action::Card(card) => {
                channel
                    .send_message(&self.http, CreateMessage::new().embed(embed(card)))
                    .await?;
            }
            Action::Poll { card, choices } => {
                let message = channel
                    .send_message(&self.http, CreateMessage::new().embed(embed(card)))
                    .await?;
                for glyph in POLL_REACTIONS.iter().take(*choices) {
                    message
                        .react(&self.http, sn::ReactionType::Unicode(glyph.to_string()))
                        .await?;
                }
            }
            Action::React(emoji) => {
                channel
                    .create_reaction(
                        &self.http,
                        sn::MessageId::new(ctx.message.get()),
                        sn::ReactionType::Unicode(emoji.clone()),
                    )
                    .await?;
            }
            Action::Ban {
                user,
                reason,
                delete_days,
            } => {
                let guild = Self::require_guild(ctx)?;
                guild
                    .ban_with_reason(&self.http, sn_user(*user), *delete_days, reason)
                    .await?;
            }
            Action::Kick { user, reason } => {
                let guild = Self::require_guild(ctx)?;
                guild
                    .kick_with_reason(&self.http, sn_user(*user), reason)
                    .await?;
            }
            Action::Purge { count } => {
                self.purge(channel, *count).await?;
            }
            Action::AddRole { user, role } => {
                let guild = Self::require_guild(ctx)?;
                self.add_role(guild, *user, role).await?;
            }
            Action::Shutdown => {
                self.shard_manager.shutdown_all().await;
            }
        }
        Ok(())
    }

    async fn send(&self, channel: ChannelId, text: &str) -> Result<(), PlatformError> {
        sn_channel(channel).say(&self.http, text).await?;
        Ok(())
    }

    fn session_ready(&self, bot: UserId) {
        self.set_bot_user(bot);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(DiscordPlatform: Send, Sync);

    #[test]
    fn serenity_permissions_truncate_to_ours() {
        let perms = sn::Permissions::BAN_MEMBERS
            | sn::Permissions::SEND_MESSAGES
            | sn::Permissions::MANAGE_MESSAGES;
        assert_eq!(
            permissions_from(perms),
            Permissions::BAN_MEMBERS | Permissions::MANAGE_MESSAGES
        );
        assert_eq!(
            permissions_from(sn::Permissions::ADMINISTRATOR),
            Permissions::ADMINISTRATOR
        );
    }

    #[test]
    fn timestamps_convert_to_chrono() {
        let ts = sn::Timestamp::from_unix_timestamp(1_462_015_105).expect("timestamp");
        let at = to_chrono(ts).expect("in range");
        assert_eq!(at.timestamp(), 1_462_015_105);
    }

    #[test]
    fn ids_keep_their_value() {
        assert_eq!(sn_guild(GuildId::new(81384788765712384)).get(), 81384788765712384);
        assert_eq!(sn_user(UserId::new(42)).get(), 42);
        assert_eq!(sn_channel(ChannelId::new(7)).get(), 7);
    }

    #[test]
    fn non_http_errors_are_transport_errors() {
        let e = serenity::Error::Other("socket closed");
        assert!(!is_not_found(&e));
        assert!(matches!(PlatformError::from(e), PlatformError::Transport(_)));
    }
}
