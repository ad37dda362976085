//! Per-message command dispatch.
//!
//! Each message walks the state machine
//! `Received → Parsed → AuthorizationChecked → Executing → {Completed |
//! Rejected | Failed}`. Whatever the outcome, a single message can never
//! take the dispatcher down: handler panics, faults and timeouts are caught
//! here, logged, and answered with a generic reply.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_lite::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::parser::{self, ParsedArgs};
use crate::platform::{Action, Platform, PlatformError};
use crate::registry::{Command, CommandContext, CommandError, CommandRegistry};
use crate::types::{BuildInfo, InvocationContext};

pub const DEFAULT_PREFIX: &str = "!";
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Received,
    Parsed,
    AuthorizationChecked,
    Executing,
    Completed,
    Rejected,
    Failed,
}

/// An unexpected handler failure. Logged in full; the user only sees a
/// generic reply.
#[derive(Debug)]
pub enum HandlerFault {
    Panicked(String),
    TimedOut(Duration),
    /// The handler returned a fault-class [`CommandError`].
    Error(CommandError),
    /// Carrying out one of the handler's actions failed.
    Action { action: String, error: PlatformError },
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerFault::Panicked(msg) => write!(f, "handler panicked: {}", msg),
            HandlerFault::TimedOut(after) => write!(f, "handler timed out after {:?}", after),
            HandlerFault::Error(e) => write!(f, "handler error: {}", e),
            HandlerFault::Action { action, error } => write!(f, "{} failed: {}", action, error),
        }
    }
}

impl std::error::Error for HandlerFault {}

/// The result of dispatching one message.
#[derive(Debug)]
pub enum Outcome {
    /// The message was not addressed to the bot.
    Ignored,
    Completed {
        command: String,
        actions: Vec<Action>,
    },
    /// Refused before or by the handler; `reply` was sent to the author.
    Rejected {
        command: String,
        error: CommandError,
        reply: String,
    },
    /// The handler (or one of its actions) failed unexpectedly.
    Failed {
        command: String,
        fault: HandlerFault,
        reply: String,
    },
}

impl Outcome {
    /// The terminal state, or `None` for ignored messages.
    pub fn state(&self) -> Option<DispatchState> {
        match self {
            Outcome::Ignored => None,
            Outcome::Completed { .. } => Some(DispatchState::Completed),
            Outcome::Rejected { .. } => Some(DispatchState::Rejected),
            Outcome::Failed { .. } => Some(DispatchState::Failed),
        }
    }

    pub fn reply(&self) -> Option<&str> {
        match self {
            Outcome::Rejected { reply, .. } | Outcome::Failed { reply, .. } => Some(reply),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    registry: CommandRegistry,
    platform: Arc<dyn Platform>,
    config: Arc<ConfigStore>,
    build: BuildInfo,
    prefix: String,
    handler_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: CommandRegistry,
        platform: Arc<dyn Platform>,
        config: Arc<ConfigStore>,
        build: BuildInfo,
    ) -> Self {
        Self {
            registry,
            platform,
            config,
            build,
            prefix: DEFAULT_PREFIX.to_string(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Apply `Bot.prefix` and `Bot.handler_timeout_secs` from settings, when
    /// present.
    pub async fn configured(mut self) -> Self {
        if let Ok(prefix) = self.config.get_str("Bot", "prefix").await {
            if !prefix.trim().is_empty() {
                self.prefix = prefix;
            }
        }
        if let Ok(secs) = self.config.get_u64("Bot", "handler_timeout_secs").await {
            self.handler_timeout = Duration::from_secs(secs.max(1));
        }
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Handle one incoming message and deliver the result to its channel.
    pub async fn dispatch(&self, invocation: &InvocationContext) -> Outcome {
        if invocation.author_bot {
            return Outcome::Ignored;
        }
        let bot = self.platform.bot_user().await;
        let Some(line) = parser::strip_prefix(&invocation.content, &self.prefix, bot) else {
            return Outcome::Ignored;
        };

        debug!(state = ?DispatchState::Received, message_id = %invocation.message, "dispatch");
        let outcome = self.run(invocation, line).await;
        let outcome = self.deliver(invocation, outcome).await;

        match &outcome {
            Outcome::Completed { command, .. } => {
                info!(command = %command, author = %invocation.author_tag, "command completed")
            }
            Outcome::Rejected { command, error, .. } => {
                info!(command = %command, author = %invocation.author_tag, reason = %error, "command rejected")
            }
            Outcome::Failed { command, fault, .. } => {
                error!(command = %command, author = %invocation.author_tag, fault = %fault, "command failed")
            }
            Outcome::Ignored => {}
        }
        outcome
    }

    /// Parse, authorize and execute; no replies are sent here.
    async fn run(&self, invocation: &InvocationContext, line: &str) -> Outcome {
        let first_word = line.split_whitespace().next().unwrap_or_default();

        let args = match parser::parse(line) {
            Ok(args) => args,
            Err(e) => {
                let command = self.registry.lookup(first_word).ok();
                return self.reject(command, first_word, e.into());
            }
        };
        debug!(state = ?DispatchState::Parsed, command = %args.command, "dispatch");

        let command = match self.registry.lookup(&args.command) {
            Ok(command) => command,
            Err(e) => {
                return self.reject(None, &args.command, CommandError::NotFound(e.to_string()))
            }
        };

        let args = if command.accepted_flags().is_empty() {
            args
        } else {
            match parser::parse_with_flags(line, command.accepted_flags()) {
                Ok(args) => args,
                Err(e) => return self.reject(Some(command), command.name(), e.into()),
            }
        };

        if let Err(e) = args.check_bounds(command.required_args(), command.max_args()) {
            return self.reject(Some(command), command.name(), e.into());
        }
        if command.is_guild_only() && invocation.guild.is_none() {
            return self.reject(Some(command), command.name(), CommandError::GuildOnly);
        }

        if let Some(capability) = command.capability() {
            let granted = self
                .platform
                .has_capability(invocation.author, invocation.guild, capability)
                .await;
            if !granted {
                return self.reject(
                    Some(command),
                    command.name(),
                    CommandError::Authorization(capability),
                );
            }
        }
        debug!(state = ?DispatchState::AuthorizationChecked, command = command.name(), "dispatch");

        self.execute(invocation, command, args).await
    }

    async fn execute(
        &self,
        invocation: &InvocationContext,
        command: &Command,
        args: ParsedArgs,
    ) -> Outcome {
        debug!(state = ?DispatchState::Executing, command = command.name(), "dispatch");
        let ctx = CommandContext {
            invocation,
            platform: self.platform.as_ref(),
            config: &self.config,
            registry: &self.registry,
            build: &self.build,
            prefix: &self.prefix,
        };

        let call = AssertUnwindSafe(command.handler().call(&ctx, args)).catch_unwind();
        let name = command.name();

        match tokio::time::timeout(self.handler_timeout, call).await {
            Err(_) => self.fail(name, HandlerFault::TimedOut(self.handler_timeout)),
            Ok(Err(panic)) => self.fail(name, HandlerFault::Panicked(panic_message(&*panic))),
            Ok(Ok(Err(e))) if e.is_fault() => self.fail(name, HandlerFault::Error(e)),
            Ok(Ok(Err(e))) => self.reject(Some(command), name, e),
            Ok(Ok(Ok(actions))) => Outcome::Completed {
                command: name.to_string(),
                actions,
            },
        }
    }

    /// Send the reply (or perform the actions) an outcome calls for.
    async fn deliver(&self, invocation: &InvocationContext, outcome: Outcome) -> Outcome {
        match outcome {
            Outcome::Completed { command, actions } => {
                for action in &actions {
                    if let Err(e) = self.platform.perform(invocation, action).await {
                        let fault = HandlerFault::Action {
                            action: action.kind().to_string(),
                            error: e,
                        };
                        let failed = self.fail(&command, fault);
                        self.say(invocation, failed.reply().unwrap_or_default()).await;
                        return failed;
                    }
                }
                Outcome::Completed { command, actions }
            }
            Outcome::Rejected { ref reply, .. } | Outcome::Failed { ref reply, .. } => {
                self.say(invocation, reply).await;
                outcome
            }
            Outcome::Ignored => Outcome::Ignored,
        }
    }

    async fn say(&self, invocation: &InvocationContext, text: &str) {
        let reply = Action::Say(text.to_string());
        if let Err(e) = self.platform.perform(invocation, &reply).await {
            warn!(error = %e, "failed to send reply");
        }
    }

    fn reject(&self, command: Option<&Command>, name: &str, error: CommandError) -> Outcome {
        let mut reply = error.to_string();
        if let (Some(command), CommandError::Parse(_) | CommandError::Usage(_)) = (command, &error) {
            reply.push_str(&format!("\nUsage: `{}`", command.signature(&self.prefix)));
        }
        Outcome::Rejected {
            command: name.to_string(),
            error,
            reply,
        }
    }

    fn fail(&self, name: &str, fault: HandlerFault) -> Outcome {
        Outcome::Failed {
            command: name.to_string(),
            fault,
            reply: format!("Something went wrong running `{}{}`.", self.prefix, name),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Capability, Permissions};
    use crate::parser::ParseError;
    use crate::registry::{CommandHandler, HandlerResult};
    use crate::testing::{invocation, test_config, Counting, FakePlatform};
    use crate::types::UserId;
    use async_trait::async_trait;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Dispatcher: Send, Sync);

    struct Panics;

    #[async_trait]
    impl CommandHandler for Panics {
        async fn call(&self, _ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
            panic!("boom");
        }
    }

    struct Hangs;

    #[async_trait]
    impl CommandHandler for Hangs {
        async fn call(&self, _ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    struct Faults;

    #[async_trait]
    impl CommandHandler for Faults {
        async fn call(&self, _ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
            Err(CommandError::Fault("database on fire".to_string()))
        }
    }

    struct Refuses;

    #[async_trait]
    impl CommandHandler for Refuses {
        async fn call(&self, _ctx: &CommandContext<'_>, _args: ParsedArgs) -> HandlerResult {
            Err(CommandError::Usage("You need to mention someone.".to_string()))
        }
    }

    /// Replies with its positional arguments and flags.
    struct ShowsArgs;

    #[async_trait]
    impl CommandHandler for ShowsArgs {
        async fn call(&self, _ctx: &CommandContext<'_>, args: ParsedArgs) -> HandlerResult {
            let positional: Vec<String> = args.positional.iter().map(|a| a.to_string()).collect();
            let flags: Vec<String> = args
                .flags
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect();
            Ok(vec![Action::Say(format!(
                "{} | {}",
                positional.join(" "),
                flags.join(" ")
            ))])
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        platform: Arc<FakePlatform>,
        counter: Counting,
        _file: tempfile::NamedTempFile,
    }

    fn fixture(platform: FakePlatform) -> Fixture {
        let counter = Counting::default();
        let mut registry = CommandRegistry::new();
        registry
            .register(Command::new("echo", counter.clone()).usage("[words...]"))
            .expect("echo");
        registry
            .register(
                Command::new("ban", counter.clone())
                    .usage("@someone")
                    .requires(Capability::BanMembers)
                    .guild_only(),
            )
            .expect("ban");
        registry
            .register(Command::new("nine", counter.clone()).args(0, Some(9)))
            .expect("nine");
        registry
            .register(Command::new("owner", counter.clone()).requires(Capability::BotOwner))
            .expect("owner");
        registry.register(Command::new("panic", Panics)).expect("panic");
        registry.register(Command::new("hang", Hangs)).expect("hang");
        registry.register(Command::new("fault", Faults)).expect("fault");
        registry
            .register(Command::new("refuse", Refuses).usage("@someone"))
            .expect("refuse");
        registry
            .register(Command::new("flagged", ShowsArgs).flags(&["days"]))
            .expect("flagged");
        registry
            .register(Command::new("plain", ShowsArgs))
            .expect("plain");

        let platform = Arc::new(platform);
        let (file, config) = test_config();
        let dispatcher = Dispatcher::new(
            registry,
            platform.clone(),
            Arc::new(config),
            BuildInfo::new(None),
        )
        .with_handler_timeout(Duration::from_millis(50));

        Fixture {
            dispatcher,
            platform,
            counter,
            _file: file,
        }
    }

    // -- happy path --------------------------------------------------------

    #[tokio::test]
    async fn completed_command_delivers_actions() {
        let f = fixture(FakePlatform::new());
        let outcome = f.dispatcher.dispatch(&invocation(1, "!echo hi")).await;
        assert_eq!(outcome.state(), Some(DispatchState::Completed));
        assert_eq!(f.counter.calls(), 1);
        assert_eq!(f.platform.replies(), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn plain_chatter_is_ignored() {
        let f = fixture(FakePlatform::new());
        let outcome = f.dispatcher.dispatch(&invocation(1, "hello everyone")).await;
        assert!(matches!(outcome, Outcome::Ignored));
        assert!(f.platform.performed().is_empty());
    }

    #[tokio::test]
    async fn bot_authors_are_ignored() {
        let f = fixture(FakePlatform::new());
        let mut msg = invocation(1, "!echo hi");
        msg.author_bot = true;
        assert!(matches!(f.dispatcher.dispatch(&msg).await, Outcome::Ignored));
        assert_eq!(f.counter.calls(), 0);
    }

    #[tokio::test]
    async fn bot_mention_works_as_prefix() {
        let f = fixture(FakePlatform::new());
        let content = format!("<@{}> echo hi", FakePlatform::BOT);
        let outcome = f.dispatcher.dispatch(&invocation(1, &content)).await;
        assert_eq!(outcome.state(), Some(DispatchState::Completed));
    }

    #[tokio::test]
    async fn only_declared_flags_are_extracted() {
        let f = fixture(FakePlatform::new());
        f.dispatcher
            .dispatch(&invocation(1, "!flagged a --days=2 --verbose"))
            .await;
        f.dispatcher
            .dispatch(&invocation(1, "!plain a --days=2 --verbose"))
            .await;
        assert_eq!(
            f.platform.replies(),
            vec![
                "a --verbose | days=2".to_string(),
                "a --days=2 --verbose | ".to_string(),
            ]
        );
    }

    // -- rejections --------------------------------------------------------

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let f = fixture(FakePlatform::new());
        let outcome = f.dispatcher.dispatch(&invocation(1, "!dance")).await;
        match outcome {
            Outcome::Rejected { error, reply, .. } => {
                assert!(matches!(error, CommandError::NotFound(_)));
                assert!(reply.contains("dance"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn parse_errors_are_rejected_with_usage() {
        let f = fixture(FakePlatform::new());
        let outcome = f.dispatcher.dispatch(&invocation(1, "!echo \"open")).await;
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                error: CommandError::Parse(ParseError::UnterminatedQuote),
                ..
            }
        ));
        assert_eq!(f.counter.calls(), 0);
        assert_eq!(f.platform.replies().len(), 1);
    }

    #[tokio::test]
    async fn tenth_argument_is_rejected() {
        let f = fixture(FakePlatform::new());
        let outcome = f
            .dispatcher
            .dispatch(&invocation(1, "!nine a b c d e f g h i j"))
            .await;
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                error: CommandError::Parse(ParseError::TooManyArguments { limit: 9 }),
                ..
            }
        ));
        assert_eq!(f.counter.calls(), 0);
    }

    #[tokio::test]
    async fn missing_capability_never_runs_the_handler() {
        let platform = FakePlatform::new()
            .grant(UserId::new(1), Permissions::KICK_MEMBERS | Permissions::MANAGE_MESSAGES);
        let f = fixture(platform);

        for author in [1, 2, 3] {
            let outcome = f.dispatcher.dispatch(&invocation(author, "!ban <@5>")).await;
            assert!(matches!(
                outcome,
                Outcome::Rejected {
                    error: CommandError::Authorization(Capability::BanMembers),
                    ..
                }
            ));
        }
        let outcome = f.dispatcher.dispatch(&invocation(1, "!owner")).await;
        assert_eq!(outcome.state(), Some(DispatchState::Rejected));
        assert_eq!(f.counter.calls(), 0);
    }

    #[tokio::test]
    async fn granted_capability_runs_the_handler() {
        let platform = FakePlatform::new()
            .grant(UserId::new(1), Permissions::ADMINISTRATOR)
            .owner(UserId::new(7));
        let f = fixture(platform);
        let outcome = f.dispatcher.dispatch(&invocation(1, "!ban <@5>")).await;
        assert_eq!(outcome.state(), Some(DispatchState::Completed));
        let outcome = f.dispatcher.dispatch(&invocation(7, "!owner")).await;
        assert_eq!(outcome.state(), Some(DispatchState::Completed));
        assert_eq!(f.counter.calls(), 2);
    }

    #[tokio::test]
    async fn guild_only_commands_refuse_direct_messages() {
        let platform = FakePlatform::new().grant(UserId::new(1), Permissions::all());
        let f = fixture(platform);
        let mut msg = invocation(1, "!ban <@5>");
        msg.guild = None;
        let outcome = f.dispatcher.dispatch(&msg).await;
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                error: CommandError::GuildOnly,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn handler_rejection_appends_usage() {
        let f = fixture(FakePlatform::new());
        let outcome = f.dispatcher.dispatch(&invocation(1, "!refuse")).await;
        assert_eq!(outcome.state(), Some(DispatchState::Rejected));
        let reply = outcome.reply().expect("reply");
        assert!(reply.contains("mention someone"));
        assert!(reply.contains("Usage: `!refuse @someone`"));
    }

    // -- failures ----------------------------------------------------------

    #[tokio::test]
    async fn panicking_handler_fails_and_dispatcher_survives() {
        let f = fixture(FakePlatform::new());
        let outcome = f.dispatcher.dispatch(&invocation(1, "!panic")).await;
        match &outcome {
            Outcome::Failed { fault, reply, .. } => {
                assert!(matches!(fault, HandlerFault::Panicked(msg) if msg.contains("boom")));
                assert_eq!(reply, "Something went wrong running `!panic`.");
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let next = f.dispatcher.dispatch(&invocation(1, "!echo again")).await;
        assert_eq!(next.state(), Some(DispatchState::Completed));
    }

    #[tokio::test]
    async fn hung_handler_times_out() {
        let f = fixture(FakePlatform::new());
        let outcome = f.dispatcher.dispatch(&invocation(1, "!hang")).await;
        assert!(matches!(
            outcome,
            Outcome::Failed {
                fault: HandlerFault::TimedOut(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn handler_fault_is_failed_not_rejected() {
        let f = fixture(FakePlatform::new());
        let outcome = f.dispatcher.dispatch(&invocation(1, "!fault")).await;
        assert_eq!(outcome.state(), Some(DispatchState::Failed));
        // the fault text stays in the logs, not in the channel
        assert!(f
            .platform
            .replies()
            .iter()
            .all(|r| !r.contains("database on fire")));
    }

    #[tokio::test]
    async fn failing_action_marks_the_outcome_failed() {
        let f = fixture(FakePlatform::new().failing_actions());
        let outcome = f.dispatcher.dispatch(&invocation(1, "!echo hi")).await;
        assert!(matches!(
            outcome,
            Outcome::Failed {
                fault: HandlerFault::Action { .. },
                ..
            }
        ));
    }

    // -- configuration -----------------------------------------------------

    #[tokio::test]
    async fn configured_prefix_is_applied() {
        let f = fixture(FakePlatform::new());
        f.dispatcher
            .config
            .set("Bot", "prefix", "?")
            .await
            .expect("set prefix");
        let Fixture {
            dispatcher,
            _file,
            ..
        } = f;
        let dispatcher = dispatcher.configured().await;
        assert_eq!(dispatcher.prefix(), "?");
        assert!(matches!(
            dispatcher.dispatch(&invocation(1, "!echo")).await,
            Outcome::Ignored
        ));
        assert_eq!(
            dispatcher.dispatch(&invocation(1, "?echo")).await.state(),
            Some(DispatchState::Completed)
        );
    }
}
