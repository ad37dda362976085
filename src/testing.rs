//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::capability::{Capability, CapabilityResolver, Permissions};
use crate::config::ConfigStore;
use crate::parser::{self, ParsedArgs};
use crate::platform::{Action, Platform, PlatformError};
use crate::registry::{CommandContext, CommandHandler, HandlerResult};
use crate::types::{
    BotProfile, ChannelId, GuildId, InvocationContext, MemberProfile, MessageId, ServerProfile,
    UserId, DISCORD_EPOCH_MS,
};

// ---------------------------------------------------------------------------
// FakePlatform
// ---------------------------------------------------------------------------

/// An in-memory [`Platform`] that records everything asked of it.
pub(crate) struct FakePlatform {
    grants: HashMap<UserId, Permissions>,
    owner: Option<UserId>,
    members: HashMap<UserId, MemberProfile>,
    fail_actions: bool,
    performed: Mutex<Vec<Action>>,
    sent: Mutex<Vec<(ChannelId, String)>>,
}

impl FakePlatform {
    pub const GUILD: GuildId = GuildId::new(1000);
    pub const CHANNEL: ChannelId = ChannelId::new(2000);
    pub const BOT: UserId = UserId::new(99);
    pub const SERVER_OWNER: UserId = UserId::new(500);

    pub fn new() -> Self {
        Self {
            grants: HashMap::new(),
            owner: None,
            members: HashMap::new(),
            fail_actions: false,
            performed: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn grant(mut self, user: UserId, perms: Permissions) -> Self {
        self.grants.insert(user, perms);
        self
    }

    pub fn owner(mut self, user: UserId) -> Self {
        self.owner = Some(user);
        self
    }

    pub fn with_member(mut self, member: MemberProfile) -> Self {
        self.members.insert(member.id, member);
        self
    }

    /// Make every `perform` call fail.
    pub fn failing_actions(mut self) -> Self {
        self.fail_actions = true;
        self
    }

    pub fn performed(&self) -> Vec<Action> {
        self.performed.lock().expect("performed lock").clone()
    }

    /// Text of every `Say` performed, in order.
    pub fn replies(&self) -> Vec<String> {
        self.performed()
            .into_iter()
            .filter_map(|a| match a {
                Action::Say(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl CapabilityResolver for FakePlatform {
    async fn has_capability(
        &self,
        user: UserId,
        guild: Option<GuildId>,
        capability: Capability,
    ) -> bool {
        let is_owner = self.owner == Some(user);
        let perms = match guild {
            Some(_) => self.grants.get(&user).copied().unwrap_or_default(),
            None => Permissions::empty(),
        };
        capability.is_granted(perms, is_owner)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn bot_user(&self) -> Option<UserId> {
        Some(Self::BOT)
    }

    async fn bot_profile(&self) -> BotProfile {
        BotProfile {
            server_count: 3,
            owner: self.owner,
        }
    }

    async fn member(
        &self,
        _guild: GuildId,
        user: UserId,
    ) -> Result<Option<MemberProfile>, PlatformError> {
        Ok(self.members.get(&user).cloned())
    }

    async fn server(&self, guild: GuildId) -> Result<ServerProfile, PlatformError> {
        if guild != Self::GUILD {
            return Err(PlatformError::NotFound(format!("guild {}", guild)));
        }
        Ok(ServerProfile {
            id: guild,
            name: "Test Server".to_string(),
            description: Some("A place for tests".to_string()),
            member_count: Some(42),
            owner: Self::SERVER_OWNER,
            icon_url: Some("https://cdn.example/icon.png".to_string()),
        })
    }

    async fn perform(
        &self,
        _ctx: &InvocationContext,
        action: &Action,
    ) -> Result<(), PlatformError> {
        if self.fail_actions {
            return Err(PlatformError::Api("Missing Permissions".to_string()));
        }
        self.performed
            .lock()
            .expect("performed lock")
            .push(action.clone());
        Ok(())
    }

    async fn send(&self, channel: ChannelId, text: &str) -> Result<(), PlatformError> {
        self.sent
            .lock()
            .expect("sent lock")
            .push((channel, text.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A snowflake minted at `at`.
pub(crate) fn snowflake_at(at: DateTime<Utc>) -> u64 {
    let ms = at.timestamp_millis() as u64 - DISCORD_EPOCH_MS;
    ms << 22
}

/// A guild message from user `author`, sent just now.
pub(crate) fn invocation(author: u64, content: &str) -> InvocationContext {
    InvocationContext {
        author: UserId::new(author),
        author_tag: format!("user{}", author),
        author_avatar: Some(format!("https://cdn.example/{}.png", author)),
        author_bot: false,
        guild: Some(FakePlatform::GUILD),
        channel: FakePlatform::CHANNEL,
        message: MessageId::new(snowflake_at(Utc::now())),
        content: content.to_string(),
        mentions: content
            .split_whitespace()
            .filter_map(parser::parse_mention)
            .collect(),
    }
}

/// A member who joined `joined_hours_ago` hours ago.
pub(crate) fn member(id: u64, tag: &str, joined_hours_ago: i64) -> MemberProfile {
    MemberProfile {
        id: UserId::new(id),
        tag: tag.to_string(),
        avatar_url: None,
        joined_at: Some(Utc::now() - Duration::hours(joined_hours_ago)),
        roles: Vec::new(),
    }
}

pub(crate) const TEST_SETTINGS: &str = "\
API:
  token: sekrit
Bot:
  prefix: '!'
JoinLeave:
  channel: 5678
Verify:
  role: Verified
  min_age_hours: 24
";

/// A store over a temp copy of [`TEST_SETTINGS`]. Keep the file alive for
/// as long as the store is written to.
pub(crate) fn test_config() -> (tempfile::NamedTempFile, ConfigStore) {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), TEST_SETTINGS).expect("write settings");
    let (store, _token) = ConfigStore::open(file.path()).expect("open settings");
    (file, store)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Counts its calls and replies `ok`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Counting {
    calls: Arc<AtomicUsize>,
}

impl Counting {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for Counting {
    async fn call(&self, _ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Action::Say("ok".to_string())])
    }
}
