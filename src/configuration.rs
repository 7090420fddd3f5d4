//! Config for the bot behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`]. Structured sections (challenge
//! rules, books, engines, matchmaking) derive `serde::Deserialize` and are handed over with
//! the `with_*` setters by whatever loads the configuration file.
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive, set them to `"true"` to enable them.
//!
//! - `BOT_VERBOSE`: Print challenge decisions and game banners (default: `true`)
//! - `BOT_LOG`: Enable logging to a file (default: `false`)
//! - `BOT_CONCURRENCY`: Number of games played at once (default: `1`)
//! - `BOT_URL`: Service address (default: `https://lichess.org`)
//! - `LICHESS_BOT_TOKEN`: API token of the bot account
//! - `BOT_ENGINE_PATH`: Executable of the `standard` engine
//! - `BOT_MATCHMAKING_DELAY`: Seconds between two matchmaking challenges (default: `10`)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};

use crate::book::BookSettings;
use crate::challenge::ChallengeRules;
use crate::constraints::ResourcesBuilder;
use crate::engine::{EngineSettings, TimeoutPolicy};
use crate::matchmaking::MatchmakingSettings;

/// Default service address.
pub const LICHESS_URL: &str = "https://lichess.org";

/// Configuration for bot behaviors.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) concurrency: usize,
    pub(crate) url: String,
    pub(crate) token: Option<String>,
    pub(crate) engines: BTreeMap<String, EngineSettings>,
    pub(crate) resources: ResourcesBuilder,
    pub(crate) books: BookSettings,
    pub(crate) rules: ChallengeRules,
    pub(crate) matchmaking: MatchmakingSettings,
    pub(crate) timeout_policy: TimeoutPolicy,
    pub(crate) records_dir: Option<PathBuf>,
    pub(crate) abort_after_bot: Duration,
    pub(crate) abort_after_human: Duration,
    pub(crate) pending_timeout: Duration,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Challenge decisions and game results are printed to stdout.
    /// - Logging to file is disabled.
    /// - One game at a time, on lichess.org.
    /// - No engine, no book, no matchmaking type.
    /// - An engine that doesn't answer in time gets a forced move.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            concurrency: 1,
            url: LICHESS_URL.to_string(),
            token: None,
            engines: BTreeMap::new(),
            resources: ResourcesBuilder::new(),
            books: BookSettings::default(),
            rules: ChallengeRules::default(),
            matchmaking: MatchmakingSettings::default(),
            timeout_policy: TimeoutPolicy::default(),
            records_dir: None,
            abort_after_bot: Duration::from_secs(30),
            abort_after_human: Duration::from_secs(60),
            pending_timeout: Duration::from_secs(60),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the recognized variables. Unset or unparsable values
    /// keep their default. Engine resources are read with [`ResourcesBuilder::from_env`].
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok()?.trim().parse().ok()
        }

        let defaults = Self::new();
        let mut engines = BTreeMap::new();
        if let Ok(path) = std::env::var("BOT_ENGINE_PATH") {
            engines.insert(
                "standard".to_string(),
                EngineSettings {
                    path: PathBuf::from(path),
                    ..EngineSettings::default()
                },
            );
        }
        let mut matchmaking = defaults.matchmaking.clone();
        if let Some(delay) = get_env_parsed("BOT_MATCHMAKING_DELAY") {
            matchmaking.delay = delay;
        }

        Self {
            verbose: get_env_flag("BOT_VERBOSE", true),
            log: get_env_flag("BOT_LOG", false),
            concurrency: get_env_parsed("BOT_CONCURRENCY").unwrap_or(defaults.concurrency),
            url: std::env::var("BOT_URL").unwrap_or(defaults.url.clone()),
            token: std::env::var("LICHESS_BOT_TOKEN").ok(),
            engines,
            resources: ResourcesBuilder::from_env(),
            matchmaking,
            ..defaults
        }
    }

    /// Enable or disable console output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Number of games played at once, tournament reservations included.
    pub fn with_concurrency(mut self, value: usize) -> Self {
        self.concurrency = value;
        self
    }

    /// Service address.
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    /// API token of the bot account.
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Adds an engine for a scope key (`standard`, `atomic`, `bullet_white`...).
    pub fn with_engine(mut self, key: &str, settings: EngineSettings) -> Self {
        self.engines.insert(key.to_string(), settings);
        self
    }

    /// Resources split between engines.
    pub fn with_resources(mut self, resources: ResourcesBuilder) -> Self {
        self.resources = resources;
        self
    }

    /// Opening books.
    pub fn with_books(mut self, books: BookSettings) -> Self {
        self.books = books;
        self
    }

    /// Rules deciding which challenges are accepted.
    pub fn with_rules(mut self, rules: ChallengeRules) -> Self {
        self.rules = rules;
        self
    }

    /// Matchmaking types and cooldown coefficients.
    pub fn with_matchmaking(mut self, matchmaking: MatchmakingSettings) -> Self {
        self.matchmaking = matchmaking;
        self
    }

    /// What to do when an engine doesn't answer in time.
    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Directory where matchmaking records are saved. Without it, they only live in memory.
    pub fn with_records_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.records_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Delays before aborting a game whose opponent never moved, for bots and humans.
    pub fn with_abort_delays(mut self, bot: Duration, human: Duration) -> Self {
        self.abort_after_bot = bot;
        self.abort_after_human = human;
        self
    }

    /// Delay after which an accepted challenge whose game never started frees its slot.
    pub fn with_pending_timeout(mut self, value: Duration) -> Self {
        self.pending_timeout = value;
        self
    }

    /// Debug level logging.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Log to a file as well.
    pub fn log(&self) -> bool {
        self.log
    }

    /// Base url of the service.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The token, or an error telling how to set it.
    pub fn token(&self) -> anyhow::Result<&str> {
        self.token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .context("no API token, set LICHESS_BOT_TOKEN")
    }

    /// Checks everything that would otherwise fail in the middle of a game.
    ///
    /// Book files and engines are not touched here; they are loaded and smoke-tested when
    /// the session is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if !self.engines.contains_key("standard") {
            bail!("no 'standard' engine configured (set BOT_ENGINE_PATH)");
        }
        for (key, engine) in &self.engines {
            if engine.path.as_os_str().is_empty() {
                bail!("engine '{key}' has no path");
            }
        }
        if self.books.enabled {
            for (key, scope) in &self.books.scopes {
                if let Some(name) = scope.names.iter().find(|n| !self.books.books.contains_key(*n)) {
                    bail!("book scope '{key}' references unknown book '{name}'");
                }
            }
        }
        self.rules.validate().context("invalid challenge rules")?;
        self.matchmaking
            .validate()
            .context("invalid matchmaking settings")?;
        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::BookScope;
    use crate::matchmaking::MatchmakingType;

    fn valid() -> Configuration {
        Configuration::new().with_engine(
            "standard",
            EngineSettings {
                path: PathBuf::from("/usr/bin/stockfish"),
                ..EngineSettings::default()
            },
        )
    }

    #[test]
    fn defaults_need_an_engine() {
        assert!(Configuration::new().validate().is_err());
        assert!(valid().validate().is_ok());
        assert!(valid().with_concurrency(0).validate().is_err());
    }

    #[test]
    fn book_scopes_must_name_declared_books() {
        let mut books = BookSettings {
            enabled: true,
            ..BookSettings::default()
        };
        books.scopes.insert(
            "standard".to_string(),
            BookScope {
                names: vec!["Goi".to_string()],
                ..BookScope::default()
            },
        );
        assert!(valid().with_books(books.clone()).validate().is_err());

        books.enabled = false;
        assert!(valid().with_books(books).validate().is_ok());
    }

    #[test]
    fn matchmaking_types_must_parse() {
        let matchmaking = MatchmakingSettings {
            types: vec![MatchmakingType {
                name: "broken".to_string(),
                tc: "three minutes".to_string(),
                rated: true,
                variant: crate::types::Variant::Standard,
                min_rating_diff: None,
                max_rating_diff: None,
            }],
            ..MatchmakingSettings::default()
        };
        assert!(valid().with_matchmaking(matchmaking).validate().is_err());
    }

    #[test]
    fn missing_token_is_an_error() {
        assert!(Configuration::new().token().is_err());
        assert!(Configuration::new().with_token("  ").token().is_err());
        assert_eq!(Configuration::new().with_token("abc").token().unwrap(), "abc");
    }
}
