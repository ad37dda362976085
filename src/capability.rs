//! Named permissions a member may hold within a guild.
//!
//! Commands declare at most one [`Capability`]. Whether a member holds it is
//! answered by a [`CapabilityResolver`], which in production asks the
//! platform client for the member's current permissions on every call.

use std::fmt;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::types::{GuildId, UserId};

// ---------------------------------------------------------------------------
// Permission bits
// ---------------------------------------------------------------------------

bitflags! {
    /// The subset of Discord permission bits the bot cares about. Bit
    /// positions match the Discord API so raw permission integers can be
    /// truncated into this set.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u64 {
        const KICK_MEMBERS = 1 << 1;
        const BAN_MEMBERS = 1 << 2;
        const ADMINISTRATOR = 1 << 3;
        const MANAGE_MESSAGES = 1 << 13;
        const MANAGE_ROLES = 1 << 28;
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A permission a command can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    BanMembers,
    KickMembers,
    ManageMessages,
    ManageRoles,
    Administrator,
    /// The bot application's owner. Not a guild permission.
    #[serde(rename = "is-owner")]
    BotOwner,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::BanMembers,
        Capability::KickMembers,
        Capability::ManageMessages,
        Capability::ManageRoles,
        Capability::Administrator,
        Capability::BotOwner,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Capability::BanMembers => "ban-members",
            Capability::KickMembers => "kick-members",
            Capability::ManageMessages => "manage-messages",
            Capability::ManageRoles => "manage-roles",
            Capability::Administrator => "administrator",
            Capability::BotOwner => "is-owner",
        }
    }

    /// Look a capability up by its kebab-case name. Unknown names yield
    /// `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    /// The permission bit backing this capability, if it is a guild
    /// permission.
    pub fn permission(self) -> Option<Permissions> {
        match self {
            Capability::BanMembers => Some(Permissions::BAN_MEMBERS),
            Capability::KickMembers => Some(Permissions::KICK_MEMBERS),
            Capability::ManageMessages => Some(Permissions::MANAGE_MESSAGES),
            Capability::ManageRoles => Some(Permissions::MANAGE_ROLES),
            Capability::Administrator => Some(Permissions::ADMINISTRATOR),
            Capability::BotOwner => None,
        }
    }

    /// Whether a member with `perms` (and bot ownership `is_owner`) holds
    /// this capability. `ADMINISTRATOR` implies every guild permission.
    pub fn is_granted(self, perms: Permissions, is_owner: bool) -> bool {
        match self.permission() {
            Some(bit) => perms.contains(Permissions::ADMINISTRATOR) || perms.contains(bit),
            None => is_owner,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Answers whether a member holds a capability in a guild.
///
/// Implementations never fail: any lookup error resolves to `false`.
#[async_trait]
pub trait CapabilityResolver: Send + Sync {
    async fn has_capability(&self, user: UserId, guild: Option<GuildId>, capability: Capability)
        -> bool;
}

/// Resolve a capability by name. Unknown names resolve to `false`.
pub async fn resolve_named(
    resolver: &(impl CapabilityResolver + ?Sized),
    user: UserId,
    guild: Option<GuildId>,
    name: &str,
) -> bool {
    match Capability::from_name(name) {
        Some(capability) => resolver.has_capability(user, guild, capability).await,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
