//! # Lichess Orchestrator
//!
//! Plays many lichess games at once with a local UCI engine.
//!
//! It provides:
//! - Session orchestration (`SessionManager`): the registry of running games, the
//!   concurrency cap and every reaction to account events
//! - A per-game state machine driven by its own thread ([`game`])
//! - Accept/decline decisions for incoming challenges ([`challenge`])
//! - Outgoing challenges to online bots with per-opponent cooldowns ([`matchmaking`])
//! - Tournament memberships holding a reserved slot ([`tournament`])
//! - Opening book selection over Polyglot books ([`book`])
//! - One engine process per game, configured by variant, speed and color ([`engine`])
//!
//! Each game runs in its own thread and owns its engine process. Games report to the
//! session manager over a channel when they end; the manager is the only one adding or
//! removing games, so the number of running games never exceeds the configured cap, slots
//! reserved for tournaments included.
//!
//! # Documentation Overview
//!
//! - For the coordination of games, challenges and tournaments, see the [`session_manager`]
//!   module.
//! - For configuring the bot, see [`Configuration`](crate::configuration::Configuration) and
//!   [`constraints`].
//! - Book and engine settings are looked up by scope keys such as `bullet_white`, see
//!   [`scope`].
//! - The network is reached through the [`RemoteService`](crate::remote::RemoteService)
//!   trait, implemented for lichess.org by [`LichessClient`](crate::lichess::LichessClient).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lichess_orchestrator::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env().with_concurrency(4);
//!
//!     let client = LichessClient::new(config.url(), config.token()?)?;
//!     let account = client.account()?;
//!
//!     let manager =
//!         SessionManager::from_configuration(&config, Arc::new(client), &account.id, UciEngineFactory)?;
//!
//!     // Operator commands can be sent from another thread
//!     let commands = manager.sender();
//!     std::thread::spawn(move || {
//!         let _ = commands.send(Event::Command(Command::Matchmaking));
//!     });
//!
//!     // Returns after `quit`, once every game is over
//!     manager.run()
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;
pub mod book;
pub mod challenge;
pub mod commands;
pub mod configuration;
pub mod constraints;
pub mod engine;
pub mod game;
pub mod lichess;
pub mod logger;
pub mod matchmaking;
pub mod position;
pub mod remote;
pub mod scope;
pub mod session_manager;
pub mod tournament;
pub mod types;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use lichess_orchestrator::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration)
/// - [`ResourcesBuilder`](crate::constraints::ResourcesBuilder)
/// - [`SessionManager`](crate::session_manager::SessionManager) and its [`Event`](crate::session_manager::Event)s
/// - the lichess client and the [`RemoteService`](crate::remote::RemoteService) trait
pub mod prelude {
    pub use crate::commands::Command;
    pub use crate::configuration::Configuration;
    pub use crate::constraints::ResourcesBuilder;
    pub use crate::engine::UciEngineFactory;
    pub use crate::lichess::LichessClient;
    pub use crate::remote::RemoteService;
    pub use crate::session_manager::{Event, SessionManager, SessionSettings};
}
