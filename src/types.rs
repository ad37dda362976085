//! Platform-independent views of Discord objects.
//!
//! serenity owns the real object model. Handlers only ever see these small,
//! owned snapshots so they can be built in tests without a live client.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Snowflakes
// ---------------------------------------------------------------------------

/// Discord snowflake epoch (2015-01-01T00:00:00.000Z) in Unix milliseconds.
pub const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Creation time encoded in the upper bits of a snowflake.
pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22).saturating_add(DISCORD_EPOCH_MS);
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_default()
}

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            pub fn created_at(self) -> DateTime<Utc> {
                snowflake_time(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

snowflake_id!(
    /// A user (or member) ID.
    UserId
);
snowflake_id!(
    /// A guild (server) ID.
    GuildId
);
snowflake_id!(
    /// A channel ID.
    ChannelId
);
snowflake_id!(
    /// A message ID.
    MessageId
);

impl UserId {
    /// The `<@id>` mention markup for this user.
    pub fn mention(self) -> String {
        format!("<@{}>", self.0)
    }
}

// ---------------------------------------------------------------------------
// Rich card (embed)
// ---------------------------------------------------------------------------

/// A single name/value field on a [`RichCard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// A structured multi-field reply. Rendered as a Discord embed by the
/// platform adapter.
///
/// ```
/// use malcolm::types::RichCard;
///
/// let card = RichCard::new()
///     .title("Server count")
///     .field("Guilds", "3", false)
///     .footer("ID: 42");
/// assert_eq!(card.fields.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichCard {
    pub title: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<CardField>,
    pub thumbnail: Option<String>,
    pub author: Option<String>,
    pub footer: Option<String>,
}

impl RichCard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(CardField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    /// Set the thumbnail URL. `None` leaves the card without one.
    pub fn thumbnail(mut self, url: Option<impl Into<String>>) -> Self {
        self.thumbnail = url.map(Into::into);
        self
    }

    pub fn author(mut self, name: impl Into<String>) -> Self {
        self.author = Some(name.into());
        self
    }

    pub fn footer(mut self, text: impl Into<String>) -> Self {
        self.footer = Some(text.into());
        self
    }

    /// Look up a field value by name.
    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// Snapshot of a guild member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberProfile {
    pub id: UserId,
    /// `Username#Discriminator` or just `Username` for the new username system.
    pub tag: String,
    pub avatar_url: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    /// Role names, excluding `@everyone`.
    pub roles: Vec<String>,
}

impl MemberProfile {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.id.created_at()
    }

    /// Comma separated role names, or `@everyone` when the member has no
    /// other role.
    pub fn role_list(&self) -> String {
        if self.roles.is_empty() {
            "@everyone".to_string()
        } else {
            self.roles.join(", ")
        }
    }
}

/// Snapshot of a guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProfile {
    pub id: GuildId,
    pub name: String,
    pub description: Option<String>,
    pub member_count: Option<u64>,
    pub owner: UserId,
    pub icon_url: Option<String>,
}

impl ServerProfile {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.id.created_at()
    }
}

/// Facts about the running bot instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotProfile {
    pub server_count: usize,
    pub owner: Option<UserId>,
}

/// What build is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
    /// Short git commit hash, when the binary runs from a checkout.
    pub commit: Option<String>,
}

impl BuildInfo {
    pub fn new(commit: Option<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit,
        }
    }

    /// `0.1.0 (abc1234)` or just the version.
    pub fn describe(&self) -> String {
        match &self.commit {
            Some(commit) => format!("{} ({})", self.version, commit),
            None => self.version.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// One incoming message, as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub author: UserId,
    pub author_tag: String,
    pub author_avatar: Option<String>,
    pub author_bot: bool,
    /// `None` for direct messages.
    pub guild: Option<GuildId>,
    pub channel: ChannelId,
    pub message: MessageId,
    pub content: String,
    /// Users mentioned in the message, in the order the platform reports them.
    pub mentions: Vec<UserId>,
}

impl InvocationContext {
    /// When the message was sent, from its snowflake.
    pub fn sent_at(&self) -> DateTime<Utc> {
        self.message.created_at()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
