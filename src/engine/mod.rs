//! Engine processes and the pool handing them out to games.
//!
//! Each game acquires its own [`EngineHandle`] when it starts and gives it back with
//! [`EnginePool::release`] when it ends: a process is never shared between two games.
//! The settings used to launch it are resolved from the game's [`ScopeKey`], with the same
//! most-specific-first order as opening books.
//!
//! A crashed process is not respawned behind the caller's back: [`EnginePool::evaluate`]
//! surfaces [`EngineError::Crashed`] and the game decides whether to call
//! [`EnginePool::restart`].

mod uci;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use uci::{UciEngine, UciEngineFactory};

use crate::constraints::Resources;
use crate::position::GamePosition;
use crate::scope::{ScopeKey, ScopeKind};
use crate::types::{Color, Variant};

/// Failures of an engine, as seen by a game.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No engine could be started for the game.
    #[error("no engine available: {0}")]
    Unavailable(String),
    /// The process died or stopped answering the protocol.
    #[error("engine crashed: {0}")]
    Crashed(String),
    /// No `bestmove` even after `stop` and the grace period.
    #[error("engine did not answer in time")]
    Timeout,
    /// `bestmove (none)` or `bestmove 0000`.
    #[error("engine has no legal move")]
    NoLegalMove,
}

/// Optional search limits added to every `go` command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchLimits {
    /// Fixed time per move in milliseconds. Also caps the opening moves budget.
    pub movetime_ms: Option<u64>,
    /// Maximum search depth.
    pub depth: Option<u32>,
    /// Maximum number of nodes.
    pub nodes: Option<u64>,
}

/// How to launch and drive one engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Executable.
    pub path: PathBuf,
    #[serde(default)]
    /// Command line arguments.
    pub args: Vec<String>,
    /// `setoption` values, applied when the engine advertises them.
    #[serde(default)]
    pub uci_options: BTreeMap<String, String>,
    #[serde(default)]
    /// Search limits.
    pub limits: SearchLimits,
    /// Removed from our clock before each search to absorb network lag.
    #[serde(default = "default_move_overhead")]
    pub move_overhead_ms: u64,
    /// Let the engine write on our stderr.
    #[serde(default)]
    pub debug_stderr: bool,
}

fn default_move_overhead() -> u64 {
    1000
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            path: PathBuf::new(),
            args: vec![],
            uci_options: BTreeMap::new(),
            limits: SearchLimits::default(),
            move_overhead_ms: default_move_overhead(),
            debug_stderr: false,
        }
    }
}

/// What a game does when its engine doesn't answer at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Play any legal move and restart the engine.
    #[default]
    ForcedMove,
    /// Resign the game.
    Resign,
}

/// Remaining time of both players as sent by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GameClock {
    /// White's remaining time.
    pub wtime: Duration,
    /// Black's remaining time.
    pub btime: Duration,
    /// White's increment.
    pub winc: Duration,
    /// Black's increment.
    pub binc: Duration,
}

impl GameClock {
    /// Remaining time of `color`.
    pub fn remaining(&self, color: Color) -> Duration {
        match color {
            Color::White => self.wtime,
            Color::Black => self.btime,
        }
    }

    fn remaining_mut(&mut self, color: Color) -> &mut Duration {
        match color {
            Color::White => &mut self.wtime,
            Color::Black => &mut self.btime,
        }
    }
}

const FIRST_MOVES_VS_BOT: Duration = Duration::from_secs(10);
const FIRST_MOVES_VS_HUMAN: Duration = Duration::from_secs(5);
const CORRESPONDENCE_MOVE_TIME: Duration = Duration::from_secs(30);

/// Time an engine may spend on one move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeBudget {
    /// `go movetime`.
    MoveTime(Duration),
    /// `go wtime .. btime ..`, our side already reduced by the move overhead.
    Clock {
        /// Remaining times.
        clock: GameClock,
        /// Side we play.
        color: Color,
    },
}

impl TimeBudget {
    /// Budget for our next move.
    ///
    /// The first two plies get a fixed budget since the clock does not run yet.
    /// Afterwards the clock is passed on minus the move overhead, or halved when the
    /// overhead is larger than what is left.
    pub fn for_move(
        clock: Option<&GameClock>,
        color: Color,
        ply: u32,
        opponent_is_bot: bool,
        settings: &EngineSettings,
    ) -> TimeBudget {
        let movetime = settings.limits.movetime_ms.map(Duration::from_millis);
        let Some(clock) = clock else {
            return TimeBudget::MoveTime(movetime.unwrap_or(CORRESPONDENCE_MOVE_TIME));
        };
        if ply < 2 {
            let base = if opponent_is_bot {
                FIRST_MOVES_VS_BOT
            } else {
                FIRST_MOVES_VS_HUMAN
            };
            return TimeBudget::MoveTime(movetime.map_or(base, |m| m.min(base)));
        }
        let overhead = Duration::from_millis(settings.move_overhead_ms);
        let mut clock = *clock;
        let own = clock.remaining_mut(color);
        *own = if *own > overhead {
            *own - overhead
        } else {
            *own / 2
        };
        TimeBudget::Clock { clock, color }
    }

    /// Soft deadline after which the engine is told to stop.
    pub fn deadline(&self, limits: &SearchLimits) -> Duration {
        let movetime = limits.movetime_ms.map(Duration::from_millis);
        match self {
            TimeBudget::MoveTime(t) => *t,
            TimeBudget::Clock { clock, color } => {
                let own = clock.remaining(*color);
                movetime.map_or(own, |m| m.min(own))
            }
        }
    }

    /// `go ...` line for this budget plus the configured limits.
    pub fn go_command(&self, limits: &SearchLimits) -> String {
        let mut go = match self {
            TimeBudget::MoveTime(t) => format!("go movetime {}", t.as_millis()),
            TimeBudget::Clock { clock, .. } => {
                let mut go = format!(
                    "go wtime {} btime {} winc {} binc {}",
                    clock.wtime.as_millis(),
                    clock.btime.as_millis(),
                    clock.winc.as_millis(),
                    clock.binc.as_millis()
                );
                if let Some(ms) = limits.movetime_ms {
                    go.push_str(&format!(" movetime {ms}"));
                }
                go
            }
        };
        if let Some(depth) = limits.depth {
            go.push_str(&format!(" depth {depth}"));
        }
        if let Some(nodes) = limits.nodes {
            go.push_str(&format!(" nodes {nodes}"));
        }
        go
    }
}

/// One search as sent to an engine.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// `position ...` line.
    pub position: String,
    /// `go ...` line.
    pub go: String,
    /// When to send `stop`.
    pub deadline: Duration,
    /// How long to wait for `bestmove` after `stop`.
    pub grace: Duration,
}

/// Raw answer of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Move exactly as written after `bestmove`.
    pub bestmove: String,
    /// The move only came after `stop`.
    pub forced: bool,
}

/// A running engine.
pub trait Engine: Send {
    /// Name reported by the engine, or its scope key.
    fn name(&self) -> &str;
    /// Prepares the engine for a new game.
    fn new_game(&mut self) -> Result<(), EngineError>;
    /// Searches until `bestmove`, sending `stop` at the deadline.
    fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome, EngineError>;
    /// Asks the engine to exit, killing it if needed. Idempotent.
    fn quit(&mut self);
}

/// Starts engines. The seam used to swap real processes for scripted ones.
pub trait EngineFactory: Send + Sync {
    /// Launches the engine configured under `key` with the final option set.
    fn launch(
        &self,
        key: &str,
        settings: &EngineSettings,
        options: &BTreeMap<String, String>,
    ) -> anyhow::Result<Box<dyn Engine>>;
}

/// Engine move checked against the position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMove {
    /// Legal move in the notation of the game.
    pub uci: String,
    /// Came after `stop`.
    pub forced: bool,
}

/// Engine owned by exactly one game.
pub struct EngineHandle {
    id: u64,
    key: String,
    options: BTreeMap<String, String>,
    engine: Box<dyn Engine>,
    busy: bool,
}

impl EngineHandle {
    /// Scope key whose settings launched the engine.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Option set applied at start.
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// A search is running.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Name reported by the engine.
    pub fn name(&self) -> &str {
        self.engine.name()
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("engine", &self.engine.name())
            .field("busy", &self.busy)
            .finish()
    }
}

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Hands out engine processes, one per game.
pub struct EnginePool {
    factory: Arc<dyn EngineFactory>,
    engines: BTreeMap<String, EngineSettings>,
    resources: Option<Resources>,
    grace: Duration,
    next_id: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl EnginePool {
    /// Pool launching engines through `factory`, configured by scope key.
    pub fn new(
        factory: impl EngineFactory + 'static,
        engines: BTreeMap<String, EngineSettings>,
    ) -> Self {
        EnginePool {
            factory: Arc::new(factory),
            engines,
            resources: None,
            grace: DEFAULT_STOP_GRACE,
            next_id: AtomicU64::new(0),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// `Threads` and `Hash` given to engines that don't set them.
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Time left to an engine to answer after `stop`.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// At least a `standard` engine must exist so every game resolves to one.
    pub fn check(&self) -> anyhow::Result<()> {
        if !self.engines.contains_key("standard") {
            bail!("no 'standard' engine configured");
        }
        for (key, settings) in &self.engines {
            if settings.path.as_os_str().is_empty() {
                bail!("engine '{key}' has no path");
            }
        }
        Ok(())
    }

    /// Launches every configured engine once and asks it for a move from the start position.
    #[instrument(skip_all)]
    pub fn self_test(&self) -> anyhow::Result<()> {
        for (key, settings) in &self.engines {
            let variant = key
                .split('_')
                .next()
                .and_then(|v| v.parse::<Variant>().ok())
                .unwrap_or(Variant::Standard);
            let position = GamePosition::new(variant, None)?;
            let mut handle = self
                .launch(key, settings, variant)
                .with_context(|| format!("engine '{key}' failed to start"))?;
            let budget = TimeBudget::MoveTime(Duration::from_millis(100));
            let result = self.evaluate(&mut handle, &position, &budget);
            self.release(handle);
            let m = result.with_context(|| format!("engine '{key}' failed to search"))?;
            info!("engine '{key}' ok ({})", m.uci);
        }
        Ok(())
    }

    /// Settings that apply to a game, with their key.
    pub fn resolve(&self, scope: &ScopeKey) -> Option<(String, &EngineSettings)> {
        scope.resolve(ScopeKind::Engine, &self.engines)
    }

    /// Launches an engine for a game.
    #[instrument(skip_all, fields(variant = %scope.variant, color = %scope.color))]
    pub fn acquire(&self, scope: &ScopeKey) -> Result<EngineHandle, EngineError> {
        let (key, settings) = self
            .resolve(scope)
            .ok_or_else(|| EngineError::Unavailable("no engine configured".to_string()))?;
        let mut handle = self
            .launch(&key, settings, scope.variant)
            .map_err(|e| EngineError::Unavailable(format!("{e:#}")))?;
        if let Err(e) = handle.engine.new_game() {
            self.release(handle);
            return Err(e);
        }
        debug!(key = %handle.key, engine = handle.name(), "engine acquired");
        Ok(handle)
    }

    /// Asks the engine of `handle` for a move in `position`.
    pub fn evaluate(
        &self,
        handle: &mut EngineHandle,
        position: &GamePosition,
        budget: &TimeBudget,
    ) -> Result<EngineMove, EngineError> {
        let limits = self
            .engines
            .get(&handle.key)
            .map(|s| s.limits.clone())
            .unwrap_or_default();
        let request = SearchRequest {
            position: position.uci_command(),
            go: budget.go_command(&limits),
            deadline: budget.deadline(&limits),
            grace: self.grace,
        };
        handle.busy = true;
        let outcome = handle.engine.search(&request);
        handle.busy = false;
        let outcome = outcome?;

        if outcome.bestmove == "(none)" || outcome.bestmove == "0000" {
            return Err(EngineError::NoLegalMove);
        }
        let uci = position.normalize(&outcome.bestmove).map_err(|e| {
            EngineError::Crashed(format!("illegal move {}: {e}", outcome.bestmove))
        })?;
        Ok(EngineMove {
            uci,
            forced: outcome.forced,
        })
    }

    /// Replaces the process of `handle` with a fresh one using the same settings.
    pub fn restart(&self, handle: &mut EngineHandle) -> Result<(), EngineError> {
        warn!(key = %handle.key, "restarting engine");
        handle.engine.quit();
        let settings = self
            .engines
            .get(&handle.key)
            .ok_or_else(|| EngineError::Unavailable(format!("engine '{}' vanished", handle.key)))?;
        let mut engine = self
            .factory
            .launch(&handle.key, settings, &handle.options)
            .map_err(|e| EngineError::Unavailable(format!("{e:#}")))?;
        engine.new_game()?;
        handle.engine = engine;
        handle.busy = false;
        Ok(())
    }

    /// Terminates the engine of a finished game.
    pub fn release(&self, mut handle: EngineHandle) {
        handle.engine.quit();
        self.live.lock().expect("poisoned").remove(&handle.id);
        debug!(key = %handle.key, "engine released");
    }

    /// Number of handles currently out.
    pub fn live_handles(&self) -> usize {
        self.live.lock().expect("poisoned").len()
    }

    fn launch(
        &self,
        key: &str,
        settings: &EngineSettings,
        variant: Variant,
    ) -> anyhow::Result<EngineHandle> {
        let mut options = settings.uci_options.clone();
        if let Some(resources) = &self.resources {
            resources.apply(&mut options);
        }
        if let Some(name) = variant.uci_name() {
            options.insert("UCI_Variant".to_string(), name.to_string());
        }
        if variant == Variant::Chess960 {
            options.insert("UCI_Chess960".to_string(), "true".to_string());
        }
        let engine = self.factory.launch(key, settings, &options)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().expect("poisoned").insert(id);
        Ok(EngineHandle {
            id,
            key: key.to_string(),
            options,
            engine,
            busy: false,
        })
    }
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .field("resources", &self.resources)
            .field("live", &self.live_handles())
            .finish()
    }
}
