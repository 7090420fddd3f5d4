//! The remote game-hosting service as seen by the bot.
//!
//! [`RemoteService`] is the seam between the orchestration layer and the network: the
//! session manager and the games only talk to this trait, which is implemented over HTTPS by
//! [`LichessClient`](crate::lichess::LichessClient) and by scripted fakes in tests.
//!
//! Streams are plain blocking iterators. Each one is read by the thread owning it, so a slow
//! stream never blocks another game.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::challenge::{ChallengeOffer, Challenger, ColorRequest, DeclineReason};
use crate::matchmaking::OnlineBot;
use crate::types::{Color, TimeControl, Variant};

/// Failures of remote calls, by what the caller should do about them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network trouble or server error: retry later.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Too many requests.
    #[error("rate limited")]
    RateLimited,
    /// The service refused the request, retrying won't help.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The stream ended.
    #[error("stream closed")]
    Closed,
}

/// Account-wide events.
pub type EventStream = Box<dyn Iterator<Item = Result<IncomingEvent, RemoteError>> + Send>;
/// Events of one game.
pub type GameStream = Box<dyn Iterator<Item = Result<GameEvent, RemoteError>> + Send>;

/// Variant field of challenges and games.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariantInfo {
    /// Variant key such as `standard` or `atomic`.
    pub key: Variant,
}

/// Player as described in challenges.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChallengeUser {
    /// Lowercase user id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Rating in the challenge's perf.
    #[serde(default)]
    pub rating: Option<u32>,
    /// `BOT` for bots.
    #[serde(default)]
    pub title: Option<String>,
}

/// Time control of a challenge, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimeControlInfo {
    /// Real-time clock.
    Clock {
        /// Initial time.
        limit: u32,
        /// Increment per move.
        increment: u32,
    },
    /// Days per move.
    Correspondence {
        /// Days allowed for each move.
        #[serde(rename = "daysPerTurn")]
        days_per_turn: u32,
    },
    /// No clock at all.
    Unlimited,
}

impl From<&TimeControlInfo> for TimeControl {
    fn from(value: &TimeControlInfo) -> Self {
        match *value {
            TimeControlInfo::Clock { limit, increment } => TimeControl::Clock {
                initial: limit,
                increment,
            },
            TimeControlInfo::Correspondence { days_per_turn } => {
                TimeControl::Correspondence(days_per_turn)
            }
            TimeControlInfo::Unlimited => TimeControl::Unlimited,
        }
    }
}

/// Challenge as sent on the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeEvent {
    /// Challenge id, which becomes the game id once accepted.
    pub id: String,
    /// Who sent it.
    pub challenger: ChallengeUser,
    /// Who receives it.
    #[serde(default)]
    pub dest_user: Option<ChallengeUser>,
    /// Rules of the game.
    pub variant: VariantInfo,
    /// Whether ratings change.
    pub rated: bool,
    /// Clock of the game.
    pub time_control: TimeControlInfo,
    /// Side requested by the challenger.
    pub color: ColorRequest,
    /// Set for tournament pairings.
    #[serde(default)]
    pub tournament_id: Option<String>,
}

impl ChallengeEvent {
    /// Offer seen by the decision engine.
    pub fn to_offer(&self) -> ChallengeOffer {
        ChallengeOffer {
            id: self.id.clone(),
            challenger: Challenger {
                id: self.challenger.id.clone(),
                name: self.challenger.name.clone(),
                rating: self.challenger.rating,
                is_bot: self.challenger.title.as_deref() == Some("BOT"),
            },
            variant: self.variant.key,
            time_control: TimeControl::from(&self.time_control),
            color: self.color,
            rated: self.rated,
            tournament_id: self.tournament_id.clone(),
        }
    }
}

/// Challenge named by its id only.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChallengeRef {
    /// Challenge id.
    pub id: String,
}

/// Opponent in a game start notification. Computer opponents have no id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GameOpponent {
    /// Lowercase user id.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    pub username: String,
    /// Rating in the game's perf.
    #[serde(default)]
    pub rating: Option<u32>,
}

/// Game start or finish notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameInfo {
    /// Game id, also the id of the challenge it came from.
    pub game_id: String,
    /// Side we play.
    #[serde(default)]
    pub color: Option<Color>,
    /// Who we play.
    #[serde(default)]
    pub opponent: Option<GameOpponent>,
    /// Arena tournament of the game.
    #[serde(default)]
    pub tournament_id: Option<String>,
    /// Swiss tournament of the game.
    #[serde(default)]
    pub swiss_id: Option<String>,
}

impl GameInfo {
    /// Arena or swiss tournament of the game.
    pub fn tournament(&self) -> Option<&str> {
        self.tournament_id.as_deref().or(self.swiss_id.as_deref())
    }
}

/// Events of the account stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IncomingEvent {
    /// Someone challenges us, or our own challenge was created.
    Challenge {
        /// The offer.
        challenge: ChallengeEvent,
    },
    /// The challenger withdrew.
    ChallengeCanceled {
        /// Withdrawn challenge.
        challenge: ChallengeRef,
    },
    /// One of our challenges was declined.
    ChallengeDeclined {
        /// Declined challenge.
        challenge: ChallengeRef,
    },
    /// A game we play started.
    GameStart {
        /// Started game.
        game: GameInfo,
    },
    /// A game we play ended.
    GameFinish {
        /// Finished game.
        game: GameInfo,
    },
    /// Anything else.
    #[serde(other)]
    Unknown,
}

/// Player as described in a full game.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamePlayer {
    /// Lowercase user id, absent for the service's AI.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// `BOT` for bots.
    #[serde(default)]
    pub title: Option<String>,
    /// Rating in the game's perf.
    #[serde(default)]
    pub rating: Option<u32>,
    /// Level of the service's AI.
    #[serde(default)]
    pub ai_level: Option<u8>,
}

impl GamePlayer {
    /// Other bots and the service's own AI.
    pub fn is_bot(&self) -> bool {
        self.ai_level.is_some() || self.title.as_deref() == Some("BOT")
    }

    /// Name for logs.
    pub fn display_name(&self) -> String {
        match (self.ai_level, &self.name) {
            (Some(level), _) => format!("AI level {level}"),
            (None, Some(name)) => name.clone(),
            (None, None) => "?".to_string(),
        }
    }
}

/// Clock in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ClockInfo {
    /// Initial time.
    pub initial: u64,
    /// Increment per move.
    pub increment: u64,
}

/// Moves and clocks of a game. Times are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct GameStateEvent {
    /// Space separated UCI moves since the initial position.
    #[serde(default)]
    pub moves: String,
    /// White's remaining time.
    #[serde(default)]
    pub wtime: u64,
    /// Black's remaining time.
    #[serde(default)]
    pub btime: u64,
    /// White's increment.
    #[serde(default)]
    pub winc: u64,
    /// Black's increment.
    #[serde(default)]
    pub binc: u64,
    /// `started`, `mate`, `resign`...
    pub status: String,
    /// Set once the game is won.
    #[serde(default)]
    pub winner: Option<Color>,
}

impl GameStateEvent {
    /// Moves as a list.
    pub fn move_list(&self) -> Vec<&str> {
        self.moves.split_whitespace().collect()
    }

    /// `wtime`, `btime`, `winc` and `binc` as a clock.
    pub fn clock(&self) -> crate::engine::GameClock {
        crate::engine::GameClock {
            wtime: Duration::from_millis(self.wtime),
            btime: Duration::from_millis(self.btime),
            winc: Duration::from_millis(self.winc),
            binc: Duration::from_millis(self.binc),
        }
    }
}

/// First event of a game stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFull {
    /// Game id.
    pub id: String,
    /// Whether ratings change.
    #[serde(default)]
    pub rated: bool,
    /// Rules of the game.
    pub variant: VariantInfo,
    /// Absent for correspondence and unlimited games.
    #[serde(default)]
    pub clock: Option<ClockInfo>,
    /// White player.
    pub white: GamePlayer,
    /// Black player.
    pub black: GamePlayer,
    /// `startpos` or a FEN.
    #[serde(default)]
    pub initial_fen: Option<String>,
    /// Moves and clocks so far.
    pub state: GameStateEvent,
    /// Set for tournament games.
    #[serde(default)]
    pub tournament_id: Option<String>,
}

impl GameFull {
    /// Clock in seconds, unlimited without one.
    pub fn time_control(&self) -> TimeControl {
        match self.clock {
            Some(clock) => TimeControl::Clock {
                initial: (clock.initial / 1000) as u32,
                increment: (clock.increment / 1000) as u32,
            },
            None => TimeControl::Unlimited,
        }
    }

    /// Side played by `user_id`, `None` when it is not one of the players.
    pub fn color_of(&self, user_id: &str) -> Option<Color> {
        let is = |p: &GamePlayer| p.id.as_deref().is_some_and(|id| id.eq_ignore_ascii_case(user_id));
        if is(&self.white) {
            Some(Color::White)
        } else if is(&self.black) {
            Some(Color::Black)
        } else {
            None
        }
    }

    /// Player of `color`.
    pub fn player(&self, color: Color) -> &GamePlayer {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }
}

/// Events of a game stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    /// Whole game, sent first.
    GameFull(GameFull),
    /// Moves or clocks changed.
    GameState(GameStateEvent),
    /// The opponent left or came back.
    #[serde(rename_all = "camelCase")]
    OpponentGone {
        /// Whether the opponent is gone.
        gone: bool,
        /// When a win can be claimed.
        #[serde(default)]
        claim_win_in_seconds: Option<u64>,
    },
    /// Chat lines and anything else.
    #[serde(other)]
    Other,
}

/// Logged-in account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    /// Lowercase user id.
    pub id: String,
    /// Display name.
    pub username: String,
    /// `BOT` for bot accounts.
    #[serde(default)]
    pub title: Option<String>,
    /// Ratings by perf key.
    #[serde(default)]
    pub perfs: HashMap<String, Perf>,
}

/// Rating in one perf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Perf {
    /// Current rating.
    #[serde(default)]
    pub rating: Option<u32>,
    /// Provisional rating.
    #[serde(default)]
    pub prov: Option<bool>,
}

/// Ratings by perf key, ignoring missing ones.
pub fn ratings(perfs: &HashMap<String, Perf>) -> HashMap<String, u32> {
    perfs
        .iter()
        .filter_map(|(key, perf)| perf.rating.map(|r| (key.clone(), r)))
        .collect()
}

/// Public state of a tournament.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentInfo {
    /// No more pairings.
    #[serde(default)]
    pub is_finished: bool,
    /// Time left, for arenas.
    #[serde(default)]
    pub seconds_to_finish: Option<i64>,
}

/// Outgoing challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    /// Username to challenge.
    pub opponent: String,
    /// Initial time in seconds.
    pub initial: u32,
    /// Increment in seconds.
    pub increment: u32,
    /// Whether ratings change.
    pub rated: bool,
    /// Side we ask for.
    pub color: Color,
    /// Rules of the game.
    pub variant: Variant,
    /// How long to wait for an answer.
    pub timeout: Duration,
}

/// How an outgoing challenge was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeAnswer {
    /// The game will start with this id.
    Accepted {
        /// Challenge id.
        id: String,
    },
    /// Declined, possibly with the opponent's reason.
    Declined {
        /// Challenge id, when one was created.
        id: Option<String>,
        /// Reason given by the opponent.
        reason: Option<String>,
    },
    /// Nothing before the timeout. The challenge should be canceled.
    NoAnswer {
        /// Challenge to cancel.
        id: Option<String>,
    },
}

/// Everything the bot asks from the service.
pub trait RemoteService: Send + Sync {
    /// Logged-in account, with its ratings.
    fn account(&self) -> Result<Account, RemoteError>;
    /// Subscribes to account events.
    fn stream_events(&self) -> Result<EventStream, RemoteError>;
    /// Subscribes to the events of one game. The first one is always a full game.
    fn stream_game(&self, game_id: &str) -> Result<GameStream, RemoteError>;
    /// Accepts an incoming challenge.
    fn accept_challenge(&self, id: &str) -> Result<(), RemoteError>;
    /// Declines an incoming challenge with one of the service's reason codes.
    fn decline_challenge(&self, id: &str, reason: DeclineReason) -> Result<(), RemoteError>;
    /// Sends a challenge and waits for the answer.
    fn create_challenge(&self, request: &ChallengeRequest) -> Result<ChallengeAnswer, RemoteError>;
    /// Withdraws one of our challenges.
    fn cancel_challenge(&self, id: &str) -> Result<(), RemoteError>;
    /// Plays a move in UCI notation.
    fn send_move(&self, game_id: &str, uci: &str) -> Result<(), RemoteError>;
    /// Resigns a game in progress.
    fn resign_game(&self, game_id: &str) -> Result<(), RemoteError>;
    /// Aborts a game, only possible before both sides moved.
    fn abort_game(&self, game_id: &str) -> Result<(), RemoteError>;
    /// Joins an arena or swiss tournament.
    fn join_tournament(
        &self,
        id: &str,
        team: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), RemoteError>;
    /// Leaves a tournament.
    fn withdraw_tournament(&self, id: &str) -> Result<(), RemoteError>;
    /// Whether a tournament is over and how long it lasts.
    fn tournament_info(&self, id: &str) -> Result<TournamentInfo, RemoteError>;
    /// Bots currently online.
    fn online_bots(&self) -> Result<Vec<OnlineBot>, RemoteError>;
    /// Whether `username` is online.
    fn user_online(&self, username: &str) -> Result<bool, RemoteError>;
}
