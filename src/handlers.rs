//! The built-in commands and the member join/leave greeter.
//!
//! Handlers only read: they look things up through the [`Platform`] and the
//! [`ConfigStore`] and return the [`Action`]s the dispatcher should carry
//! out. Formatting lives in small helpers at the bottom so it can be tested
//! without a platform.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::capability::Capability;
use crate::config::{ConfigError, ConfigStore};
use crate::parser::{Arg, ParseError, ParsedArgs};
use crate::platform::{Action, Platform, PlatformError};
use crate::registry::{
    Command, CommandContext, CommandError, CommandHandler, CommandRegistry, HandlerResult,
    RegistryError,
};
use crate::types::{ChannelId, GuildId, MemberProfile, RichCard, ServerProfile, UserId};

pub const REPO_URL: &str = "https://github.com/TheOtherUnknown/Malcolm-next";

/// Most messages `nuke` may delete at once.
pub const MAX_PURGE: u8 = 100;

pub const DEFAULT_VERIFY_ROLE: &str = "Verified";
pub const DEFAULT_VERIFY_MIN_AGE_HOURS: u64 = 24;
/// Discord keeps at most a week of a banned user's messages for deletion.
pub const MAX_BAN_DELETE_DAYS: u8 = 7;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Every built-in command, in help order.
pub fn builtin_registry() -> Result<CommandRegistry, RegistryError> {
    let mut registry = CommandRegistry::new();

    registry.register(Command::new("info", Info).brief("Information about the bot instance"))?;
    registry.register(
        Command::new("verify", Verify)
            .brief("Add yourself to the verified user role in the server, if you qualify")
            .guild_only(),
    )?;
    registry.register(
        Command::new("ping", Ping).brief("Displays latency between client and bot"),
    )?;
    registry.register(
        Command::new("serverinfo", ServerInfo)
            .brief("Displays information about the server")
            .guild_only(),
    )?;
    registry.register(
        Command::new("userinfo", UserInfo)
            .brief("Displays information about users")
            .usage("[@user or id]")
            .args(0, Some(1))
            .guild_only(),
    )?;
    registry.register(
        Command::new("poll", Poll)
            .brief("Create polls using embeds and reactions")
            .usage("\"question\" \"answers 1-9\"")
            .args(1, Some(POLL_MAX_ANSWERS)),
    )?;
    registry.register(
        Command::new("kb", Moderate::BAN)
            .brief("Bans a user from the server")
            .usage("@someone [--days=0-7]")
            .requires(Capability::BanMembers)
            .args(1, Some(0))
            .flags(&["days"])
            .guild_only(),
    )?;
    registry.register(
        Command::new("kick", Moderate::KICK)
            .brief("Kicks a mentioned user from the server")
            .usage("@someone")
            .requires(Capability::KickMembers)
            .args(1, Some(0))
            .guild_only(),
    )?;
    registry.register(
        Command::new("nuke", Nuke)
            .brief("Mass-deletes messages in the current channel")
            .usage("<NUMBER>")
            .requires(Capability::ManageMessages)
            .args(1, Some(0))
            .guild_only(),
    )?;
    registry.register(
        Command::new("config", Config)
            .brief("Read or change a setting")
            .usage("section key [value]")
            .requires(Capability::BotOwner)
            .args(2, Some(1))
            .hidden(),
    )?;
    registry.register(
        Command::new("help", Help)
            .brief("Shows this message")
            .usage("[command]")
            .args(0, Some(1)),
    )?;
    registry.register(
        Command::new("quit", Quit)
            .requires(Capability::BotOwner)
            .hidden(),
    )?;

    Ok(registry)
}

/// The first user the platform reports as mentioned in the message, not
/// counting the bot (which may have been mentioned as the prefix).
async fn mentioned_user(ctx: &CommandContext<'_>) -> Option<UserId> {
    let bot = ctx.platform.bot_user().await;
    ctx.invocation
        .mentions
        .iter()
        .copied()
        .find(|user| Some(*user) != bot)
}

fn require_guild(ctx: &CommandContext<'_>) -> Result<GuildId, CommandError> {
    ctx.invocation.guild.ok_or(CommandError::GuildOnly)
}

// ---------------------------------------------------------------------------
// General commands
// ---------------------------------------------------------------------------

pub struct Info;

#[async_trait]
impl CommandHandler for Info {
    async fn call(&self, ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
        let profile = ctx.platform.bot_profile().await;
        let owner = profile
            .owner
            .map(UserId::mention)
            .unwrap_or_else(|| "unknown".to_string());
        let card = RichCard::new()
            .title("Malcolm-Next")
            .url(REPO_URL)
            .field("Running version", ctx.build.describe(), false)
            .field("Server count", profile.server_count.to_string(), false)
            .field("Owner", owner, false);
        Ok(vec![Action::Card(card)])
    }
}

pub struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    async fn call(&self, ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
        let latency = Utc::now()
            .signed_duration_since(ctx.invocation.sent_at())
            .num_milliseconds()
            .max(0);
        Ok(vec![Action::Say(format!("Pong! {} ms", latency))])
    }
}

pub struct Verify;

#[async_trait]
impl CommandHandler for Verify {
    async fn call(&self, ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
        let guild = require_guild(ctx)?;
        let author = ctx.invocation.author;

        let role = match ctx.config.get_str("Verify", "role").await {
            Err(ConfigError::NotFound { .. }) => DEFAULT_VERIFY_ROLE.to_string(),
            other => other?,
        };
        let min_age_hours = match ctx.config.get_u64("Verify", "min_age_hours").await {
            Err(ConfigError::NotFound { .. }) => DEFAULT_VERIFY_MIN_AGE_HOURS,
            other => other?,
        };

        let member = ctx
            .platform
            .member(guild, author)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("member {}", author)))?;

        if qualifies(&member, min_age_hours, Utc::now()) {
            info!(user = %member.tag, role = %role, "member verified");
            Ok(vec![
                Action::AddRole { user: author, role },
                Action::React("\u{2705}".to_string()),
            ])
        } else {
            Ok(vec![Action::Say(format!(
                "You don't qualify to be verified yet! Check back {} hours after you join.",
                min_age_hours
            ))])
        }
    }
}

/// Whether `member` joined more than `min_age_hours` before `now`. An age
/// too large to represent is never reached.
fn qualifies(member: &MemberProfile, min_age_hours: u64, now: DateTime<Utc>) -> bool {
    let Some(joined) = member.joined_at else {
        return false;
    };
    let Some(min_age) = i64::try_from(min_age_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
    else {
        return false;
    };
    now.signed_duration_since(joined) > min_age
}

pub struct ServerInfo;

#[async_trait]
impl CommandHandler for ServerInfo {
    async fn call(&self, ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
        let guild = require_guild(ctx)?;
        let server = ctx.platform.server(guild).await?;
        Ok(vec![Action::Card(server_card(&server, Utc::now()))])
    }
}

pub struct UserInfo;

#[async_trait]
impl CommandHandler for UserInfo {
    async fn call(&self, ctx: &CommandContext<'_>, args: ParsedArgs) -> HandlerResult {
        let guild = require_guild(ctx)?;
        let target = match (mentioned_user(ctx).await, args.get(0)) {
            (Some(user), _) => user,
            (None, Some(arg)) => arg.as_user_id()?,
            (None, None) => ctx.invocation.author,
        };

        let member = ctx
            .platform
            .member(guild, target)
            .await?
            .ok_or_else(|| CommandError::NotFound("Cannot find user with that ID!".to_string()))?;
        Ok(vec![Action::Card(user_card(&member, Utc::now()))])
    }
}

/// Only nine single-digit keycap reactions exist.
pub const POLL_MAX_ANSWERS: usize = 9;

pub struct Poll;

#[async_trait]
impl CommandHandler for Poll {
    async fn call(&self, ctx: &CommandContext<'_>, args: ParsedArgs) -> HandlerResult {
        let mut positional = args.positional.iter();
        let question = positional
            .next()
            .ok_or(ParseError::MissingArguments { expected: 1 })?;
        let answers: Vec<&Arg> = positional.collect();
        if answers.len() > POLL_MAX_ANSWERS {
            return Err(ParseError::TooManyArguments {
                limit: POLL_MAX_ANSWERS,
            }
            .into());
        }

        let mut card = RichCard::new()
            .title(format!("**__{}__**", question))
            .thumbnail(ctx.invocation.author_avatar.clone())
            .author(ctx.invocation.author_tag.clone());
        for (i, answer) in answers.iter().enumerate() {
            card = card.field((i + 1).to_string(), answer.to_string(), true);
        }

        Ok(vec![Action::Poll {
            card,
            choices: answers.len(),
        }])
    }
}

// ---------------------------------------------------------------------------
// Moderation
// ---------------------------------------------------------------------------

/// `kb` and `kick`: act on the first mentioned member.
pub struct Moderate {
    verb: &'static str,
    past: &'static str,
    ban: bool,
}

impl Moderate {
    pub const BAN: Moderate = Moderate {
        verb: "ban",
        past: "Banned",
        ban: true,
    };
    pub const KICK: Moderate = Moderate {
        verb: "kick",
        past: "Kicked",
        ban: false,
    };
}

#[async_trait]
impl CommandHandler for Moderate {
    async fn call(&self, ctx: &CommandContext<'_>, args: ParsedArgs) -> HandlerResult {
        let user = match args.mentions().next() {
            Some(user) => user,
            None => mentioned_user(ctx)
                .await
                .ok_or_else(|| CommandError::Usage("You need to mention someone.".to_string()))?,
        };

        if user == ctx.invocation.author {
            return Err(CommandError::Invalid(format!(
                "You can't {} yourself.",
                self.verb
            )));
        }
        if Some(user) == ctx.platform.bot_user().await {
            return Err(CommandError::Invalid(format!(
                "I'm not going to {} myself.",
                self.verb
            )));
        }

        let reason = format!("{} via command by {}", self.past, ctx.invocation.author_tag);
        let action = if self.ban {
            Action::Ban {
                user,
                reason,
                delete_days: delete_days(&args)?,
            }
        } else {
            Action::Kick { user, reason }
        };
        Ok(vec![action, Action::Say(format!("{} {}.", self.past, user.mention()))])
    }
}

/// `--days=N` on `kb`; no flag deletes nothing.
fn delete_days(args: &ParsedArgs) -> Result<u8, CommandError> {
    let Some(raw) = args.flag("days") else {
        return Ok(0);
    };
    let days: u8 = raw
        .parse()
        .map_err(|_| CommandError::Usage(format!("`{}` is not a number of days.", raw)))?;
    if days > MAX_BAN_DELETE_DAYS {
        return Err(CommandError::Invalid(format!(
            "Pick between 0 and {} days of messages to delete.",
            MAX_BAN_DELETE_DAYS
        )));
    }
    Ok(days)
}

pub struct Nuke;

#[async_trait]
impl CommandHandler for Nuke {
    async fn call(&self, _ctx: &CommandContext<'_>, args: ParsedArgs) -> HandlerResult {
        let raw = args.get(0).map(Arg::to_string).unwrap_or_default();
        let count: u64 = raw
            .parse()
            .map_err(|_| CommandError::Usage(format!("`{}` is not a number.", raw)))?;
        if count == 0 || count > u64::from(MAX_PURGE) {
            return Err(CommandError::Invalid(format!(
                "Pick a number between 1 and {}.",
                MAX_PURGE
            )));
        }
        debug!(count, "purging messages");
        Ok(vec![Action::Purge { count: count as u8 }])
    }
}

// ---------------------------------------------------------------------------
// Owner commands
// ---------------------------------------------------------------------------

/// `config section key [value]`: read or change a setting at runtime.
pub struct Config;

#[async_trait]
impl CommandHandler for Config {
    async fn call(&self, ctx: &CommandContext<'_>, args: ParsedArgs) -> HandlerResult {
        let (Some(section), Some(key)) = (args.get(0), args.get(1)) else {
            return Err(CommandError::Usage("Name a section and a key.".to_string()));
        };
        let (section, key) = (section.to_string(), key.to_string());

        match args.get(2) {
            None => {
                let value = ctx.config.get(&section, &key).await?;
                Ok(vec![Action::Say(format!(
                    "`{}.{}` = `{}`",
                    section,
                    key,
                    render_value(&value)
                ))])
            }
            Some(raw) => {
                let value = parse_value(&raw.to_string());
                let shown = render_value(&value);
                ctx.config.set(&section, &key, value).await?;
                info!(section = %section, key = %key, "setting changed by owner");
                Ok(vec![Action::Say(format!(
                    "Set `{}.{}` to `{}`.",
                    section, key, shown
                ))])
            }
        }
    }
}

/// YAML scalar typing for values typed in chat: `24` is a number, `true` a
/// bool, anything else text.
fn parse_value(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::String(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| format!("{:?}", other)),
    }
}

pub struct Help;

#[async_trait]
impl CommandHandler for Help {
    async fn call(&self, ctx: &CommandContext<'_>, args: ParsedArgs) -> HandlerResult {
        let text = match args.get(0) {
            None => help_text(ctx.registry, ctx.prefix),
            Some(name) => {
                let name = name.to_string();
                let command = ctx
                    .registry
                    .lookup(&name)
                    .ok()
                    .filter(|c| !c.is_hidden())
                    .ok_or_else(|| {
                        CommandError::NotFound(RegistryError::NotFound(name.clone()).to_string())
                    })?;
                command_help(command, ctx.prefix)
            }
        };
        Ok(vec![Action::Say(text)])
    }
}

pub struct Quit;

#[async_trait]
impl CommandHandler for Quit {
    async fn call(&self, ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
        info!(by = %ctx.invocation.author_tag, "shutdown requested");
        Ok(vec![
            Action::Say("Malcolm is going down NOW!".to_string()),
            Action::Shutdown,
        ])
    }
}

// ---------------------------------------------------------------------------
// Join / leave
// ---------------------------------------------------------------------------

/// The configured welcome/farewell channel, if any.
pub async fn greet_channel(config: &ConfigStore) -> Option<ChannelId> {
    config
        .get_u64("JoinLeave", "channel")
        .await
        .ok()
        .map(ChannelId::new)
}

/// Post the welcome message. Returns whether anything was sent.
pub async fn greet_member(
    platform: &dyn Platform,
    config: &ConfigStore,
    guild: GuildId,
    user: UserId,
) -> Result<bool, PlatformError> {
    let Some(channel) = greet_channel(config).await else {
        return Ok(false);
    };
    let server = platform.server(guild).await?;
    platform
        .send(channel, &welcome_message(&server.name, user))
        .await?;
    Ok(true)
}

/// Post the farewell message. Returns whether anything was sent.
pub async fn farewell_member(
    platform: &dyn Platform,
    config: &ConfigStore,
    tag: &str,
) -> Result<bool, PlatformError> {
    let Some(channel) = greet_channel(config).await else {
        return Ok(false);
    };
    platform.send(channel, &farewell_message(tag)).await?;
    Ok(true)
}

pub fn welcome_message(server: &str, user: UserId) -> String {
    format!("Welcome to **{}**, {}!", server, user.mention())
}

pub fn farewell_message(tag: &str) -> String {
    format!("**{}** has left the server.", tag)
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// `Sat Apr 30 11:18:25 2016, 42 days ago`
fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let days = now.signed_duration_since(at).num_days().max(0);
    format!("{}, {} days ago", at.format("%a %b %e %H:%M:%S %Y"), days)
}

fn server_card(server: &ServerProfile, now: DateTime<Utc>) -> RichCard {
    let mut card = RichCard::new().title(server.name.clone());
    if let Some(description) = &server.description {
        card = card.description(description.clone());
    }
    let members = server
        .member_count
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    card.field("Members", members, true)
        .field("Owner", server.owner.mention(), true)
        .field("Creation date", format_age(server.created_at(), now), false)
        .thumbnail(server.icon_url.clone())
        .footer(format!("ID: {}", server.id))
}

fn user_card(member: &MemberProfile, now: DateTime<Utc>) -> RichCard {
    let joined = member
        .joined_at
        .map(|at| format_age(at, now))
        .unwrap_or_else(|| "unknown".to_string());
    RichCard::new()
        .title(member.tag.clone())
        .thumbnail(member.avatar_url.clone())
        .field("Account created", format_age(member.created_at(), now), false)
        .field("Join date", joined, false)
        .field("Roles", member.role_list(), false)
        .footer(format!("ID: {}", member.id))
}

fn help_text(registry: &CommandRegistry, prefix: &str) -> String {
    let mut text = String::from("**Commands**\n");
    for command in registry.iter().filter(|c| !c.is_hidden()) {
        text.push_str(&format!("`{}`", command.signature(prefix)));
        if !command.brief_text().is_empty() {
            text.push_str(&format!(" - {}", command.brief_text()));
        }
        text.push('\n');
    }
    text.push_str(&format!(
        "\nType `{}help command` for more info on a command.",
        prefix
    ));
    text
}

fn command_help(command: &Command, prefix: &str) -> String {
    let mut text = format!("`{}`", command.signature(prefix));
    if !command.brief_text().is_empty() {
        text.push_str(&format!("\n{}", command.brief_text()));
    }
    if let Some(capability) = command.capability() {
        text.push_str(&format!("\nRequires `{}`.", capability));
    }
    if command.is_guild_only() {
        text.push_str("\nOnly works in a server.");
    }
    text
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
