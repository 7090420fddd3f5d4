//! The thread of one game.
//!
//! A runner owns its [`GameSession`] and its engine. Game stream events reach it through a
//! bounded channel fed by a reader thread; the session manager may push into the same
//! channel, so events of one game are always handled in order. Stream failures trigger a
//! reconnection: the full game received first replays only the moves not applied yet.

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use tracing::{debug, error, info, instrument, warn};

use super::{GameSession, GameState, Outcome, Update};
use crate::book::{book_rng, OpeningBooks};
use crate::engine::{EngineError, EnginePool, TimeBudget, TimeoutPolicy};
use crate::remote::{GameEvent, RemoteError, RemoteService};
use crate::types::Color;

const MAX_RECONNECTS: u32 = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Messages handled by a game runner.
#[derive(Debug)]
pub enum GameInput {
    /// Event read from the game stream opened as `generation`.
    Event {
        /// Stream the event came from.
        generation: u64,
        /// The event.
        event: GameEvent,
    },
    /// Event handed over by the session manager.
    Routed(GameEvent),
    /// The stream `generation` failed or ended.
    Disconnected {
        /// Stream that failed.
        generation: u64,
        /// Why it failed.
        error: RemoteError,
    },
}

/// Everything games share.
pub struct GameContext {
    /// Client of the service.
    pub remote: Arc<dyn RemoteService>,
    /// Shared engines.
    pub engines: Arc<EnginePool>,
    /// Opening books.
    pub books: Arc<OpeningBooks>,
    /// Seed mixed with the game id for book choices.
    pub book_seed: Option<u64>,
    /// Our account id.
    pub user_id: String,
    /// What to do when the engine stalls.
    pub timeout_policy: TimeoutPolicy,
    /// Abort when a bot opponent does not make its first move in time.
    pub abort_after_bot: Duration,
    /// Abort when a human opponent does not make their first move in time.
    pub abort_after_human: Duration,
    /// First delay before reopening a broken game stream.
    pub reconnect_delay: Duration,
    /// Print game banners on stdout.
    pub verbose: bool,
}

/// Sent to the session manager when a game ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameReport {
    /// Game id.
    pub id: String,
    /// Display name of the opponent.
    pub opponent: String,
    /// Lowercase id of the opponent, absent for the AI.
    pub opponent_id: Option<String>,
    /// Side we played, unknown when the game never started.
    pub color: Option<Color>,
    /// How the game ended.
    pub outcome: Outcome,
    /// Every state visited.
    pub trace: Vec<GameState>,
    /// Game came from a matchmaking challenge.
    pub matchmaking: bool,
    /// Tournament of the game.
    pub tournament_id: Option<String>,
}

/// Drives one game until it is over.
pub struct GameRunner {
    ctx: Arc<GameContext>,
    game: GameSession,
    inbox: Receiver<GameInput>,
    sender: SyncSender<GameInput>,
    generation: u64,
    rng: StdRng,
    last_progress: Instant,
    matchmaking: bool,
    tournament_id: Option<String>,
    resigned: bool,
}

impl GameRunner {
    /// Runner for game `id`. `sender` feeds `inbox` and is handed to stream readers.
    pub fn new(
        ctx: Arc<GameContext>,
        id: &str,
        inbox: Receiver<GameInput>,
        sender: SyncSender<GameInput>,
        matchmaking: bool,
        tournament_id: Option<String>,
    ) -> Self {
        let rng = book_rng(ctx.book_seed, id);
        GameRunner {
            ctx,
            game: GameSession::new(id),
            inbox,
            sender,
            generation: 0,
            rng,
            last_progress: Instant::now(),
            matchmaking,
            tournament_id,
            resigned: false,
        }
    }

    /// Plays the game and reports how it ended.
    #[instrument(skip_all, fields(game = %self.game.id()))]
    pub fn run(mut self) -> GameReport {
        if let Err(e) = self.connect() {
            error!("could not open the game stream: {e}");
            self.game.finish(Outcome::Error);
        }
        while !self.game.is_over() {
            let input = match self.abort_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match self.inbox.recv_timeout(timeout) {
                        Ok(input) => input,
                        Err(RecvTimeoutError::Timeout) => {
                            self.abort();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.inbox.recv_timeout(IDLE_WAIT) {
                    Ok(input) => input,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            };
            self.handle(input);
        }
        // releases the engine whatever ended the loop
        self.end(Outcome::Error);
        self.report()
    }

    fn handle(&mut self, input: GameInput) {
        match input {
            GameInput::Event { generation, .. } | GameInput::Disconnected { generation, .. }
                if generation != self.generation =>
            {
                debug!("dropping input of stale stream {generation}");
            }
            GameInput::Event { event, .. } | GameInput::Routed(event) => {
                if let Err(e) = self.on_event(event) {
                    error!("{e:#}");
                    self.resign(Outcome::Error);
                }
            }
            GameInput::Disconnected { error, .. } => self.reconnect(error),
        }
    }

    fn on_event(&mut self, event: GameEvent) -> anyhow::Result<()> {
        let update = match event {
            GameEvent::GameFull(full) if self.game.state() == GameState::Created => {
                let update = self.game.initialize(&full, &self.ctx.user_id)?;
                self.start()?;
                update
            }
            GameEvent::GameFull(full) => self.game.apply_state(&full.state)?,
            GameEvent::GameState(state) => self.game.apply_state(&state)?,
            GameEvent::OpponentGone { gone, claim_win_in_seconds } => {
                info!(gone, ?claim_win_in_seconds, "opponent connection");
                return Ok(());
            }
            GameEvent::Other => return Ok(()),
        };
        match update {
            Update::Finished(outcome) => self.end(outcome),
            Update::Moves(_) => {
                self.last_progress = Instant::now();
                self.play_if_our_turn();
            }
            Update::Unchanged => self.play_if_our_turn(),
        }
        Ok(())
    }

    /// `Initializing -> AwaitingOpponent` once an engine is ready.
    fn start(&mut self) -> anyhow::Result<()> {
        let Some(setup) = self.game.setup() else {
            return Ok(());
        };
        let scope = setup.scope.clone();
        if self.ctx.verbose {
            println!(
                "Game {} started: {} as {} against {} ({})",
                self.game.id(),
                setup.variant,
                setup.color,
                setup.opponent.display_name(),
                setup.time_control
            );
        }
        info!(variant = %setup.variant, color = %setup.color, opponent = %setup.opponent.display_name(), "game started");
        match self.ctx.engines.acquire(&scope) {
            Ok(handle) => self.game.engine = Some(handle),
            Err(e) => {
                error!("{e}");
                self.resign(Outcome::Error);
                return Ok(());
            }
        }
        self.game.transition(GameState::AwaitingOpponent)?;
        self.last_progress = Instant::now();
        Ok(())
    }

    fn play_if_our_turn(&mut self) {
        if self.game.is_our_turn() {
            if let Err(e) = self.think() {
                error!("{e:#}");
                self.resign(Outcome::Error);
            }
        }
    }

    /// `AwaitingOpponent -> Thinking -> MoveSent`, books first, then the engine.
    fn think(&mut self) -> anyhow::Result<()> {
        self.game.transition(GameState::Thinking)?;
        let Some(setup) = self.game.setup() else {
            return Ok(());
        };
        let position = setup.position.clone();
        let scope = setup.scope.clone();
        let opponent_is_bot = setup.opponent.is_bot();

        if let Some(book_move) = self.ctx.books.select(&position, position.ply(), &scope, &mut self.rng) {
            return self.send(&book_move.uci);
        }

        let settings = self
            .ctx
            .engines
            .resolve(&scope)
            .map(|(_, s)| s.clone())
            .unwrap_or_default();
        let budget = TimeBudget::for_move(
            self.game.clock(),
            setup.color,
            position.ply(),
            opponent_is_bot,
            &settings,
        );
        let Some(handle) = self.game.engine.as_mut() else {
            self.resign(Outcome::Error);
            return Ok(());
        };
        let pool = Arc::clone(&self.ctx.engines);

        let result = match pool.evaluate(handle, &position, &budget) {
            Err(EngineError::Crashed(reason)) => {
                warn!("engine crashed: {reason}");
                match pool.restart(handle) {
                    Ok(()) => pool.evaluate(handle, &position, &budget),
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        match result {
            Ok(m) => {
                if m.forced {
                    debug!("move {} forced by stop", m.uci);
                }
                self.send(&m.uci)
            }
            Err(EngineError::Timeout) => self.on_timeout(&position),
            Err(EngineError::NoLegalMove) => {
                debug!("engine sees no legal move, waiting for the end of the game");
                self.game.transition(GameState::AwaitingOpponent)
            }
            Err(e) => {
                error!("engine failed twice: {e}");
                self.resign(Outcome::Error);
                Ok(())
            }
        }
    }

    fn on_timeout(&mut self, position: &crate::position::GamePosition) -> anyhow::Result<()> {
        warn!("engine did not answer in time");
        match self.ctx.timeout_policy {
            TimeoutPolicy::Resign => {
                self.resign(Outcome::TimedOut);
                Ok(())
            }
            TimeoutPolicy::ForcedMove => {
                let Some(uci) = position.any_legal_move() else {
                    return self.game.transition(GameState::AwaitingOpponent);
                };
                self.send(&uci)?;
                let pool = Arc::clone(&self.ctx.engines);
                if let Some(handle) = self.game.engine.as_mut() {
                    if let Err(e) = pool.restart(handle) {
                        error!("engine could not be restarted: {e}");
                        self.resign(Outcome::Error);
                    }
                }
                Ok(())
            }
        }
    }

    fn send(&mut self, uci: &str) -> anyhow::Result<()> {
        match self.ctx.remote.send_move(self.game.id(), uci) {
            Ok(()) => {
                debug!(uci, "move sent");
                self.game.move_sent()
            }
            Err(e) => {
                warn!("could not send {uci}: {e}");
                self.game.transition(GameState::AwaitingOpponent)
            }
        }
    }

    /// Resigns at most once and ends the game with `outcome`.
    fn resign(&mut self, outcome: Outcome) {
        if self.game.is_over() {
            return;
        }
        if !self.resigned {
            self.resigned = true;
            if let Err(e) = self.ctx.remote.resign_game(self.game.id()) {
                warn!("could not resign: {e}");
            }
        }
        self.end(outcome);
    }

    fn abort(&mut self) {
        info!("opponent did not move, aborting");
        if let Err(e) = self.ctx.remote.abort_game(self.game.id()) {
            warn!("could not abort: {e}");
        }
        self.end(Outcome::Aborted);
    }

    /// When the game should be aborted if the opponent still hasn't moved.
    fn abort_deadline(&self) -> Option<Instant> {
        let setup = self.game.setup()?;
        let waiting = matches!(
            self.game.state(),
            GameState::AwaitingOpponent | GameState::MoveSent
        );
        if !waiting || setup.position.ply() >= 2 || setup.position.turn() == setup.color {
            return None;
        }
        let limit = if setup.opponent.is_bot() {
            self.ctx.abort_after_bot
        } else {
            self.ctx.abort_after_human
        };
        Some(self.last_progress + limit)
    }

    fn end(&mut self, outcome: Outcome) {
        if let Some(handle) = self.game.engine.take() {
            self.ctx.engines.release(handle);
        }
        self.game.finish(outcome);
    }

    /// Opens a new game stream read by its own thread.
    fn connect(&mut self) -> Result<(), RemoteError> {
        let stream = self.ctx.remote.stream_game(self.game.id())?;
        self.generation += 1;
        let generation = self.generation;
        let sender = self.sender.clone();
        thread::Builder::new()
            .name(format!("stream-{}", self.game.id()))
            .spawn(move || {
                for item in stream {
                    let input = match item {
                        Ok(event) => GameInput::Event { generation, event },
                        Err(error) => GameInput::Disconnected { generation, error },
                    };
                    let stop = matches!(input, GameInput::Disconnected { .. });
                    if sender.send(input).is_err() || stop {
                        return;
                    }
                }
                let _ = sender.send(GameInput::Disconnected {
                    generation,
                    error: RemoteError::Closed,
                });
            })
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        Ok(())
    }

    fn reconnect(&mut self, cause: RemoteError) {
        warn!("game stream lost: {cause}");
        let mut delay = self.ctx.reconnect_delay;
        for attempt in 1..=MAX_RECONNECTS {
            thread::sleep(delay);
            match self.connect() {
                Ok(()) => {
                    info!("game stream reopened");
                    return;
                }
                Err(RemoteError::Rejected(e)) => {
                    error!("game stream refused: {e}");
                    break;
                }
                Err(e) => debug!("reconnection {attempt} failed: {e}"),
            }
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        self.end(Outcome::Error);
    }

    fn report(self) -> GameReport {
        let setup = self.game.setup();
        let outcome = self.game.outcome().unwrap_or(Outcome::Error);
        let opponent = setup.map_or_else(|| "?".to_string(), |s| s.opponent.display_name());
        if self.ctx.verbose {
            print_game_result(self.game.id(), &opponent, outcome);
        }
        info!(%outcome, "game over");
        GameReport {
            id: self.game.id().to_string(),
            opponent,
            opponent_id: setup.and_then(|s| s.opponent.id.clone()),
            color: setup.map(|s| s.color),
            outcome,
            trace: self.game.trace().to_vec(),
            matchmaking: self.matchmaking,
            tournament_id: self.tournament_id.clone(),
        }
    }
}

fn print_game_result(id: &str, opponent: &str, outcome: Outcome) {
    let color = match outcome {
        Outcome::Won => "\x1b[32m",
        Outcome::Lost | Outcome::TimedOut | Outcome::Error => "\x1b[31m",
        Outcome::Drawn | Outcome::Aborted => "\x1b[39m",
    };
    // clear line, green game, outcome color, default
    println!("\x1b[2K\x1b[32m{id}\x1b[39m against {opponent}: {color}{outcome}\x1b[39m");
}
