//! Command metadata and the name → command table.
//!
//! The registry is filled once at startup and then handed to the
//! [`Dispatcher`](crate::dispatcher::Dispatcher) by value, which only ever
//! reads it. A [`Command`]'s fields are private so its required capability
//! cannot change after registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::capability::Capability;
use crate::config::{ConfigError, ConfigStore};
use crate::parser::{ParseError, ParsedArgs};
use crate::platform::{Action, Platform, PlatformError};
use crate::types::{BuildInfo, InvocationContext};

// ---------------------------------------------------------------------------
// Handler errors
// ---------------------------------------------------------------------------

/// Why a command did not complete.
///
/// Every variant except [`CommandError::Platform`] and [`CommandError::Fault`]
/// is a user-facing rejection; those two are faults that the dispatcher logs
/// and answers with a generic message.
#[derive(Debug)]
pub enum CommandError {
    Parse(ParseError),
    Authorization(Capability),
    NotFound(String),
    AccessDenied(String),
    /// Wrong invocation; the dispatcher appends the command's usage hint.
    Usage(String),
    Invalid(String),
    GuildOnly,
    Platform(PlatformError),
    Fault(String),
}

impl CommandError {
    /// Whether this error is an unexpected failure rather than a rejection.
    pub fn is_fault(&self) -> bool {
        matches!(self, CommandError::Platform(_) | CommandError::Fault(_))
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Parse(e) => write!(f, "{}", e),
            CommandError::Authorization(Capability::BotOwner) => {
                write!(f, "Only the bot owner can use this command.")
            }
            CommandError::Authorization(cap) => {
                write!(f, "You need the `{}` permission to use this command.", cap)
            }
            CommandError::NotFound(msg)
            | CommandError::AccessDenied(msg)
            | CommandError::Usage(msg)
            | CommandError::Invalid(msg) => f.write_str(msg),
            CommandError::GuildOnly => write!(f, "This command only works in a server."),
            CommandError::Platform(e) => write!(f, "{}", e),
            CommandError::Fault(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<ParseError> for CommandError {
    fn from(e: ParseError) -> Self {
        CommandError::Parse(e)
    }
}

impl From<PlatformError> for CommandError {
    fn from(e: PlatformError) -> Self {
        CommandError::Platform(e)
    }
}

impl From<ConfigError> for CommandError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::AccessDenied { .. } => CommandError::AccessDenied(e.to_string()),
            ConfigError::NotFound { .. } => CommandError::NotFound(e.to_string()),
            other => CommandError::Fault(other.to_string()),
        }
    }
}

pub type HandlerResult = Result<Vec<Action>, CommandError>;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Everything a handler may read while it runs. Handlers never act on the
/// platform directly: they return [`Action`]s for the dispatcher to carry
/// out.
pub struct CommandContext<'a> {
    pub invocation: &'a InvocationContext,
    pub platform: &'a dyn Platform,
    pub config: &'a ConfigStore,
    pub registry: &'a CommandRegistry,
    pub build: &'a BuildInfo,
    pub prefix: &'a str,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, ctx: &CommandContext<'_>, args: ParsedArgs) -> HandlerResult;
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A registered text command.
#[derive(Clone)]
pub struct Command {
    name: &'static str,
    brief: &'static str,
    usage: &'static str,
    capability: Option<Capability>,
    hidden: bool,
    guild_only: bool,
    required_args: usize,
    max_args: Option<usize>,
    flags: &'static [&'static str],
    handler: Arc<dyn CommandHandler>,
}

impl Command {
    pub fn new(name: &'static str, handler: impl CommandHandler + 'static) -> Self {
        Self {
            name,
            brief: "",
            usage: "",
            capability: None,
            hidden: false,
            guild_only: false,
            required_args: 0,
            max_args: None,
            flags: &[],
            handler: Arc::new(handler),
        }
    }

    pub fn brief(mut self, brief: &'static str) -> Self {
        self.brief = brief;
        self
    }

    pub fn usage(mut self, usage: &'static str) -> Self {
        self.usage = usage;
        self
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Leave the command out of help listings.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn guild_only(mut self) -> Self {
        self.guild_only = true;
        self
    }

    /// At least `required` positional arguments, and at most `max` after
    /// those.
    pub fn args(mut self, required: usize, max: Option<usize>) -> Self {
        self.required_args = required;
        self.max_args = max;
        self
    }

    /// `--name[=value]` flags this command understands. Other `--` tokens
    /// are passed through as positional arguments.
    pub fn flags(mut self, flags: &'static [&'static str]) -> Self {
        self.flags = flags;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn brief_text(&self) -> &'static str {
        self.brief
    }

    pub fn usage_text(&self) -> &'static str {
        self.usage
    }

    pub fn capability(&self) -> Option<Capability> {
        self.capability
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn is_guild_only(&self) -> bool {
        self.guild_only
    }

    pub fn required_args(&self) -> usize {
        self.required_args
    }

    pub fn max_args(&self) -> Option<usize> {
        self.max_args
    }

    pub fn accepted_flags(&self) -> &'static [&'static str] {
        self.flags
    }

    pub fn handler(&self) -> &dyn CommandHandler {
        self.handler.as_ref()
    }

    /// `!name usage` as shown to users.
    pub fn signature(&self, prefix: &str) -> String {
        if self.usage.is_empty() {
            format!("{}{}", prefix, self.name)
        } else {
            format!("{}{} {}", prefix, self.name, self.usage)
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .field("hidden", &self.hidden)
            .field("guild_only", &self.guild_only)
            .field("required_args", &self.required_args)
            .field("max_args", &self.max_args)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateCommand(String),
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateCommand(name) => {
                write!(f, "command `{}` is already registered", name)
            }
            RegistryError::NotFound(name) => write!(f, "Command \"{}\" is not found", name),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Commands in registration order, indexed by name.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: Vec<Command>,
    by_name: HashMap<&'static str, usize>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command: Command) -> Result<(), RegistryError> {
        if self.by_name.contains_key(command.name) {
            return Err(RegistryError::DuplicateCommand(command.name.to_string()));
        }
        self.by_name.insert(command.name, self.commands.len());
        self.commands.push(command);
        Ok(())
    }

    /// Case-sensitive lookup.
    pub fn lookup(&self, name: &str) -> Result<&Command, RegistryError> {
        self.by_name
            .get(name)
            .map(|&i| &self.commands[i])
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
