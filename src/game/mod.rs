//! Per-game state machine.
//!
//! ```text
//! Created -> Initializing -> AwaitingOpponent <-> Thinking -> MoveSent -> AwaitingOpponent ...
//!                                      any non-terminal state -> Over(outcome)
//! ```
//!
//! [`GameSession`] only holds the state and applies the events of the game stream; all I/O
//! is done by the [`runner`] driving it on the game's own thread.

pub mod runner;

use std::fmt::Display;

use anyhow::{bail, Context};
use tracing::{debug, trace};

use crate::engine::{EngineHandle, GameClock};
use crate::position::GamePosition;
use crate::remote::{GameFull, GamePlayer, GameStateEvent};
use crate::scope::ScopeKey;
use crate::types::{Color, Speed, TimeControl, Variant};

/// How a game ended for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// We won.
    Won,
    /// We lost.
    Lost,
    /// Draw.
    Drawn,
    /// Aborted before both sides moved.
    Aborted,
    /// We lost on time.
    TimedOut,
    /// The engine or the stream failed.
    Error,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Won => "won",
            Outcome::Lost => "lost",
            Outcome::Drawn => "drawn",
            Outcome::Aborted => "aborted",
            Outcome::TimedOut => "lost on time",
            Outcome::Error => "error",
        };
        f.write_str(s)
    }
}

/// States of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameState {
    /// Known by id only.
    Created,
    /// Waiting for the full game.
    Initializing,
    /// The opponent is to move.
    AwaitingOpponent,
    /// Our engine is searching.
    Thinking,
    /// Our move is on its way.
    MoveSent,
    /// Finished.
    Over(Outcome),
}

impl GameState {
    /// The game is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, GameState::Over(_))
    }

    /// Whether the machine allows going from `self` to `next`.
    pub fn can_become(self, next: GameState) -> bool {
        use GameState::*;
        match (self, next) {
            (Over(_), _) => false,
            (_, Over(_)) => true,
            (Created, Initializing)
            | (Initializing, AwaitingOpponent)
            | (AwaitingOpponent, Thinking)
            | (Thinking, AwaitingOpponent)
            | (Thinking, MoveSent)
            | (MoveSent, AwaitingOpponent) => true,
            _ => false,
        }
    }
}

/// Outcome of a finished game from the status sent by the service, `None` while it runs.
pub fn outcome_of(status: &str, winner: Option<Color>, us: Color) -> Option<Outcome> {
    let decided = |winner: Option<Color>| match winner {
        Some(w) if w == us => Outcome::Won,
        Some(_) => Outcome::Lost,
        None => Outcome::Drawn,
    };
    Some(match status {
        "created" | "started" => return None,
        "aborted" => Outcome::Aborted,
        "noStart" => match winner {
            None => Outcome::Aborted,
            w => decided(w),
        },
        "draw" | "stalemate" => Outcome::Drawn,
        "outoftime" => match decided(winner) {
            Outcome::Lost => Outcome::TimedOut,
            other => other,
        },
        // mate, resign, timeout, variantEnd, cheat, unknownFinish
        _ => decided(winner),
    })
}

/// What the game looks like once the full game was received.
#[derive(Debug, Clone)]
pub struct GameSetup {
    /// Side we play.
    pub color: Color,
    /// Who we play.
    pub opponent: GamePlayer,
    /// Rule set.
    pub variant: Variant,
    /// Clock of the game.
    pub time_control: TimeControl,
    /// Whether ratings change.
    pub rated: bool,
    /// Moves played so far.
    pub position: GamePosition,
    /// Key used to resolve books and engines.
    pub scope: ScopeKey,
}

impl GameSetup {
    /// Speed of the clock.
    pub fn speed(&self) -> Speed {
        self.time_control.speed()
    }
}

/// What a game stream update changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// `n` new moves were played.
    Moves(usize),
    /// Nothing new: a clock update or a duplicate.
    Unchanged,
    /// The game is over.
    Finished(Outcome),
}

/// One game, mutated only by its own runner.
#[derive(Debug)]
pub struct GameSession {
    id: String,
    state: GameState,
    trace: Vec<GameState>,
    setup: Option<GameSetup>,
    clock: Option<GameClock>,
    sent_at_ply: Option<u32>,
    /// Engine owned by the game until it ends.
    pub engine: Option<EngineHandle>,
}

impl GameSession {
    /// Game that just started, waiting for its full description.
    pub fn new(id: &str) -> Self {
        GameSession {
            id: id.to_string(),
            state: GameState::Created,
            trace: vec![GameState::Created],
            setup: None,
            clock: None,
            sent_at_ply: None,
            engine: None,
        }
    }

    /// Game id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> GameState {
        self.state
    }

    /// Every state visited, in order.
    pub fn trace(&self) -> &[GameState] {
        &self.trace
    }

    /// Set once the full game was read.
    pub fn setup(&self) -> Option<&GameSetup> {
        self.setup.as_ref()
    }

    /// Latest clock, `None` for games without one.
    pub fn clock(&self) -> Option<&GameClock> {
        self.clock.as_ref()
    }

    /// Reached a terminal state.
    pub fn is_over(&self) -> bool {
        self.state.is_terminal()
    }

    /// Outcome once over.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            GameState::Over(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Moves to `next`, refusing what the machine forbids.
    pub fn transition(&mut self, next: GameState) -> anyhow::Result<()> {
        if !self.state.can_become(next) {
            bail!("game {}: invalid transition {:?} -> {next:?}", self.id, self.state);
        }
        trace!(game = %self.id, from = ?self.state, to = ?next, "transition");
        self.state = next;
        self.trace.push(next);
        Ok(())
    }

    /// Ends the game if it is not already over.
    pub fn finish(&mut self, outcome: Outcome) {
        if !self.is_over() {
            self.state = GameState::Over(outcome);
            self.trace.push(self.state);
            debug!(game = %self.id, %outcome, "game over");
        }
    }

    /// Takes the full game description: `Created -> Initializing`.
    pub fn initialize(&mut self, full: &GameFull, user_id: &str) -> anyhow::Result<Update> {
        let color = full
            .color_of(user_id)
            .with_context(|| format!("{user_id} does not play game {}", full.id))?;
        let variant = full.variant.key;
        let time_control = full.time_control();
        let position = GamePosition::new(variant, full.initial_fen.as_deref())?;
        self.transition(GameState::Initializing)?;
        self.setup = Some(GameSetup {
            color,
            opponent: full.player(color.opposite()).clone(),
            variant,
            time_control,
            rated: full.rated,
            position,
            scope: ScopeKey::new(variant, time_control, color)
                .with_human(!full.player(color.opposite()).is_bot())
                .with_tournament(full.tournament_id.is_some()),
        });
        self.apply_state(&full.state)
    }

    /// Applies a state update. Moves already known are not played again.
    pub fn apply_state(&mut self, state: &GameStateEvent) -> anyhow::Result<Update> {
        let id = self.id.clone();
        let Some(setup) = self.setup.as_mut() else {
            bail!("game {id}: state received before the full game");
        };
        if matches!(setup.time_control, TimeControl::Clock { .. }) {
            self.clock = Some(state.clock());
        }
        let new = setup.position.apply_move_list(&state.move_list())?;
        if let Some(outcome) = outcome_of(&state.status, state.winner, setup.color) {
            return Ok(Update::Finished(outcome));
        }
        if new == 0 {
            return Ok(Update::Unchanged);
        }
        if self.state == GameState::MoveSent
            && self.sent_at_ply.is_some_and(|ply| setup.position.ply() > ply)
        {
            self.sent_at_ply = None;
            self.transition(GameState::AwaitingOpponent)?;
        }
        Ok(Update::Moves(new))
    }

    /// We have to move and nothing is in progress.
    pub fn is_our_turn(&self) -> bool {
        self.state == GameState::AwaitingOpponent
            && self
                .setup
                .as_ref()
                .is_some_and(|s| s.position.turn() == s.color)
    }

    /// Our move was posted at the current ply: `Thinking -> MoveSent`.
    pub fn move_sent(&mut self) -> anyhow::Result<()> {
        self.transition(GameState::MoveSent)?;
        self.sent_at_ply = self.setup.as_ref().map(|s| s.position.ply());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(moves: &str, status: &str) -> GameFull {
        let line = format!(
            r#"{{"type":"gameFull","id":"g1","rated":true,"variant":{{"key":"standard"}},
            "clock":{{"initial":180000,"increment":2000}},
            "white":{{"id":"me","name":"Me","title":"BOT"}},"black":{{"id":"you","name":"You"}},
            "initialFen":"startpos",
            "state":{{"moves":"{moves}","wtime":180000,"btime":180000,"winc":2000,"binc":2000,"status":"{status}"}}}}"#
        );
        match serde_json::from_str(&line).unwrap() {
            crate::remote::GameEvent::GameFull(full) => full,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn state(moves: &str, status: &str, winner: Option<Color>) -> GameStateEvent {
        GameStateEvent {
            moves: moves.to_string(),
            wtime: 170_000,
            btime: 175_000,
            winc: 2000,
            binc: 2000,
            status: status.to_string(),
            winner,
        }
    }

    fn started() -> GameSession {
        let mut game = GameSession::new("g1");
        game.initialize(&full("", "started"), "me").unwrap();
        game.transition(GameState::AwaitingOpponent).unwrap();
        game
    }

    #[test]
    fn nothing_leaves_a_terminal_state() {
        let all = [
            GameState::Created,
            GameState::Initializing,
            GameState::AwaitingOpponent,
            GameState::Thinking,
            GameState::MoveSent,
            GameState::Over(Outcome::Won),
            GameState::Over(Outcome::Error),
        ];
        for next in all {
            assert!(!GameState::Over(Outcome::Drawn).can_become(next));
            assert!(!next.can_become(GameState::Created));
        }
        assert!(GameState::Thinking.can_become(GameState::Over(Outcome::Error)));
        assert!(!GameState::AwaitingOpponent.can_become(GameState::MoveSent));
    }

    #[test]
    fn full_cycle() {
        let mut game = started();
        assert!(game.is_our_turn());
        game.transition(GameState::Thinking).unwrap();
        game.move_sent().unwrap();

        // echo of our own move
        assert_eq!(game.apply_state(&state("e2e4", "started", None)).unwrap(), Update::Moves(1));
        assert_eq!(game.state(), GameState::AwaitingOpponent);
        assert!(!game.is_our_turn());

        assert_eq!(
            game.apply_state(&state("e2e4 e7e5", "started", None)).unwrap(),
            Update::Moves(1)
        );
        assert!(game.is_our_turn());
        assert_eq!(game.clock().unwrap().btime.as_millis(), 175_000);

        assert_eq!(
            game.apply_state(&state("e2e4 e7e5", "resign", Some(Color::White))).unwrap(),
            Update::Finished(Outcome::Won)
        );
        game.finish(Outcome::Won);
        game.finish(Outcome::Error);
        assert_eq!(game.outcome(), Some(Outcome::Won));
        assert!(game.transition(GameState::AwaitingOpponent).is_err());
        assert_eq!(
            game.trace(),
            [
                GameState::Created,
                GameState::Initializing,
                GameState::AwaitingOpponent,
                GameState::Thinking,
                GameState::MoveSent,
                GameState::AwaitingOpponent,
                GameState::Over(Outcome::Won),
            ]
        );
    }

    #[test]
    fn duplicates_and_clock_updates_change_nothing() {
        let mut game = started();
        game.transition(GameState::Thinking).unwrap();
        game.move_sent().unwrap();
        assert_eq!(game.apply_state(&state("", "started", None)).unwrap(), Update::Unchanged);
        assert_eq!(game.state(), GameState::MoveSent);
        game.apply_state(&state("e2e4", "started", None)).unwrap();
        assert_eq!(game.apply_state(&state("e2e4", "started", None)).unwrap(), Update::Unchanged);
        assert_eq!(game.setup().unwrap().position.ply(), 1);
    }

    #[test]
    fn late_shorter_state_is_dropped() {
        let mut game = started();
        game.apply_state(&state("e2e4 e7e5", "started", None)).unwrap();
        game.transition(GameState::Thinking).unwrap();
        game.move_sent().unwrap();
        game.apply_state(&state("e2e4 e7e5 g1f3", "started", None)).unwrap();
        assert_eq!(game.state(), GameState::AwaitingOpponent);

        assert_eq!(game.apply_state(&state("e2e4", "started", None)).unwrap(), Update::Unchanged);
        assert_eq!(game.state(), GameState::AwaitingOpponent);
        assert_eq!(game.setup().unwrap().position.ply(), 3);
        assert!(game.apply_state(&state("d2d4", "started", None)).is_err());
    }

    #[test]
    fn reconnect_resumes_without_replaying() {
        let mut game = started();
        game.apply_state(&state("e2e4 e7e5", "started", None)).unwrap();
        assert_eq!(
            game.apply_state(&full("e2e4 e7e5 g1f3", "started").state).unwrap(),
            Update::Moves(1)
        );
        assert_eq!(game.setup().unwrap().position.ply(), 3);
    }

    #[test]
    fn initialization_reads_the_setup() {
        let mut game = GameSession::new("g1");
        assert!(game.apply_state(&state("", "started", None)).is_err());
        game.initialize(&full("e2e4", "started"), "you").unwrap();
        let setup = game.setup().unwrap();
        assert_eq!(setup.color, Color::Black);
        assert_eq!(setup.speed(), Speed::Blitz);
        assert_eq!(setup.opponent.name.as_deref(), Some("Me"));
        assert_eq!(setup.position.ply(), 1);
        assert!(!setup.scope.human && !setup.scope.tournament);
        assert!(started().setup().unwrap().scope.human);
        assert!(GameSession::new("g1").initialize(&full("", "started"), "nobody").is_err());
    }

    #[test]
    fn status_mapping() {
        let w = Some(Color::White);
        let b = Some(Color::Black);
        assert_eq!(outcome_of("started", None, Color::White), None);
        assert_eq!(outcome_of("mate", w, Color::White), Some(Outcome::Won));
        assert_eq!(outcome_of("resign", w, Color::Black), Some(Outcome::Lost));
        assert_eq!(outcome_of("outoftime", b, Color::White), Some(Outcome::TimedOut));
        assert_eq!(outcome_of("outoftime", b, Color::Black), Some(Outcome::Won));
        assert_eq!(outcome_of("outoftime", None, Color::Black), Some(Outcome::Drawn));
        assert_eq!(outcome_of("stalemate", None, Color::Black), Some(Outcome::Drawn));
        assert_eq!(outcome_of("aborted", None, Color::Black), Some(Outcome::Aborted));
        assert_eq!(outcome_of("noStart", None, Color::Black), Some(Outcome::Aborted));
        assert_eq!(outcome_of("noStart", w, Color::White), Some(Outcome::Won));
        assert_eq!(outcome_of("variantEnd", b, Color::White), Some(Outcome::Lost));
    }
}
