//! A prefix-command Discord bot.
//!
//! The command core (parsing, registry, capabilities, dispatch, settings)
//! compiles without any network stack and is driven through the
//! [`platform::Platform`] trait. The `io` feature adds the serenity gateway
//! bridge, the Discord adapter, the SQLite member log and the event loop in
//! [`bot::start`].

pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod handlers;
pub mod parser;
pub mod platform;
pub mod registry;
pub mod types;

#[cfg(feature = "io")]
pub mod bot;
#[cfg(feature = "io")]
pub mod gateway;
#[cfg(feature = "io")]
pub mod http;
#[cfg(feature = "io")]
pub mod storage;

#[cfg(test)]
mod testing;
