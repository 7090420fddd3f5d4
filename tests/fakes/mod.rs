//! Scripted remote service and engines driving a real `SessionManager`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use lichess_orchestrator::book::OpeningBooks;
use lichess_orchestrator::challenge::DeclineReason;
use lichess_orchestrator::engine::{
    Engine, EngineError, EngineFactory, EnginePool, EngineSettings, SearchOutcome, SearchRequest,
    TimeoutPolicy,
};
use lichess_orchestrator::game::runner::GameContext;
use lichess_orchestrator::matchmaking::OnlineBot;
use lichess_orchestrator::remote::{
    Account, ChallengeAnswer, ChallengeRequest, EventStream, GameEvent, GameStream,
    IncomingEvent, RemoteError, RemoteService, TournamentInfo,
};

pub const USER: &str = "bot";
const WAIT: Duration = Duration::from_secs(10);

/// Everything the bot asked the service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Call {
    Accept(String),
    Decline(String, DeclineReason),
    Challenge(String),
    Cancel(String),
    Move(String, String),
    Resign(String),
    Abort(String),
    Join(String),
    Withdraw(String),
}

pub struct FakeRemote {
    events: Mutex<Option<Receiver<Result<IncomingEvent, RemoteError>>>>,
    games: Mutex<HashMap<String, Receiver<Result<GameEvent, RemoteError>>>>,
    calls: Mutex<Vec<Call>>,
    bots: Mutex<Vec<OnlineBot>>,
    answer: Mutex<ChallengeAnswer>,
}

#[allow(dead_code)]
impl FakeRemote {
    /// Service whose account events are pushed through the returned sender.
    pub fn new() -> (Arc<Self>, Sender<Result<IncomingEvent, RemoteError>>) {
        let (sender, receiver) = mpsc::channel();
        let remote = FakeRemote {
            events: Mutex::new(Some(receiver)),
            games: Mutex::new(HashMap::new()),
            calls: Mutex::new(vec![]),
            bots: Mutex::new(vec![]),
            answer: Mutex::new(ChallengeAnswer::Declined {
                id: None,
                reason: None,
            }),
        };
        (Arc::new(remote), sender)
    }

    /// Stream of game `id`, to be opened by its runner.
    pub fn game(&self, id: &str) -> Sender<Result<GameEvent, RemoteError>> {
        let (sender, receiver) = mpsc::channel();
        self.games.lock().unwrap().insert(id.to_string(), receiver);
        sender
    }

    pub fn with_bots(&self, bots: Vec<OnlineBot>) {
        *self.bots.lock().unwrap() = bots;
    }

    pub fn answer_challenges(&self, answer: ChallengeAnswer) {
        *self.answer.lock().unwrap() = answer;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, filter: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| filter(c)).count()
    }

    /// Waits until `call` was made.
    pub fn wait_for(&self, call: &Call) -> bool {
        wait_until(|| self.calls.lock().unwrap().contains(call))
    }

    fn log(&self, call: Call) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl RemoteService for FakeRemote {
    fn account(&self) -> Result<Account, RemoteError> {
        serde_json::from_value(json!({
            "id": USER,
            "username": "Bot",
            "title": "BOT",
            "perfs": { "blitz": { "rating": 2000, "prov": false } }
        }))
        .map_err(|e| RemoteError::Rejected(e.to_string()))
    }

    fn stream_events(&self) -> Result<EventStream, RemoteError> {
        match self.events.lock().unwrap().take() {
            Some(receiver) => Ok(Box::new(receiver.into_iter())),
            None => Err(RemoteError::Closed),
        }
    }

    fn stream_game(&self, game_id: &str) -> Result<GameStream, RemoteError> {
        match self.games.lock().unwrap().remove(game_id) {
            Some(receiver) => Ok(Box::new(receiver.into_iter())),
            None => Err(RemoteError::Rejected(format!("no game {game_id}"))),
        }
    }

    fn accept_challenge(&self, id: &str) -> Result<(), RemoteError> {
        self.log(Call::Accept(id.to_string()))
    }

    fn decline_challenge(&self, id: &str, reason: DeclineReason) -> Result<(), RemoteError> {
        self.log(Call::Decline(id.to_string(), reason))
    }

    fn create_challenge(&self, request: &ChallengeRequest) -> Result<ChallengeAnswer, RemoteError> {
        self.log(Call::Challenge(request.opponent.clone()))?;
        Ok(self.answer.lock().unwrap().clone())
    }

    fn cancel_challenge(&self, id: &str) -> Result<(), RemoteError> {
        self.log(Call::Cancel(id.to_string()))
    }

    fn send_move(&self, game_id: &str, uci: &str) -> Result<(), RemoteError> {
        self.log(Call::Move(game_id.to_string(), uci.to_string()))
    }

    fn resign_game(&self, game_id: &str) -> Result<(), RemoteError> {
        self.log(Call::Resign(game_id.to_string()))
    }

    fn abort_game(&self, game_id: &str) -> Result<(), RemoteError> {
        self.log(Call::Abort(game_id.to_string()))
    }

    fn join_tournament(
        &self,
        id: &str,
        _team: Option<&str>,
        _password: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.log(Call::Join(id.to_string()))
    }

    fn withdraw_tournament(&self, id: &str) -> Result<(), RemoteError> {
        self.log(Call::Withdraw(id.to_string()))
    }

    fn tournament_info(&self, _id: &str) -> Result<TournamentInfo, RemoteError> {
        Ok(TournamentInfo::default())
    }

    fn online_bots(&self) -> Result<Vec<OnlineBot>, RemoteError> {
        Ok(self.bots.lock().unwrap().clone())
    }

    fn user_online(&self, _username: &str) -> Result<bool, RemoteError> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Play,
    Crash,
    Stall,
}

/// Engine answering from a shared move list, or failing every search.
struct ScriptedEngine {
    moves: Arc<Mutex<VecDeque<String>>>,
    behavior: Behavior,
}

impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn new_game(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn search(&mut self, _request: &SearchRequest) -> Result<SearchOutcome, EngineError> {
        match self.behavior {
            Behavior::Crash => return Err(EngineError::Crashed("scripted crash".to_string())),
            Behavior::Stall => return Err(EngineError::Timeout),
            Behavior::Play => {}
        }
        let bestmove = self
            .moves
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "(none)".to_string());
        Ok(SearchOutcome {
            bestmove,
            forced: false,
        })
    }

    fn quit(&mut self) {}
}

#[derive(Clone)]
pub struct ScriptedFactory {
    moves: Arc<Mutex<VecDeque<String>>>,
    behavior: Behavior,
    pub launches: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl ScriptedFactory {
    pub fn playing(moves: &[&str]) -> Self {
        ScriptedFactory {
            moves: Arc::new(Mutex::new(moves.iter().map(|m| m.to_string()).collect())),
            behavior: Behavior::Play,
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn crashing() -> Self {
        ScriptedFactory {
            behavior: Behavior::Crash,
            ..Self::playing(&[])
        }
    }

    /// Never answers within the deadline.
    pub fn stalling() -> Self {
        ScriptedFactory {
            behavior: Behavior::Stall,
            ..Self::playing(&[])
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl EngineFactory for ScriptedFactory {
    fn launch(
        &self,
        _key: &str,
        _settings: &EngineSettings,
        _options: &BTreeMap<String, String>,
    ) -> anyhow::Result<Box<dyn Engine>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            moves: self.moves.clone(),
            behavior: self.behavior,
        }))
    }
}

/// Game context with a single `standard` engine and no book.
pub fn context(remote: &Arc<FakeRemote>, factory: ScriptedFactory) -> Arc<GameContext> {
    context_with_policy(remote, factory, TimeoutPolicy::Resign)
}

pub fn context_with_policy(
    remote: &Arc<FakeRemote>,
    factory: ScriptedFactory,
    timeout_policy: TimeoutPolicy,
) -> Arc<GameContext> {
    let mut engines = BTreeMap::new();
    engines.insert(
        "standard".to_string(),
        EngineSettings {
            path: PathBuf::from("scripted"),
            ..EngineSettings::default()
        },
    );
    Arc::new(GameContext {
        remote: remote.clone(),
        engines: Arc::new(EnginePool::new(factory, engines)),
        books: Arc::new(OpeningBooks::new()),
        book_seed: Some(1),
        user_id: USER.to_string(),
        timeout_policy,
        abort_after_bot: Duration::from_secs(60),
        abort_after_human: Duration::from_secs(60),
        reconnect_delay: Duration::from_millis(10),
        verbose: false,
    })
}

/// Polls `condition` for a few seconds.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Blitz challenge from a bot.
pub fn challenge(id: &str, challenger: &str, tournament: Option<&str>) -> IncomingEvent {
    serde_json::from_value(json!({
        "type": "challenge",
        "challenge": {
            "id": id,
            "challenger": { "id": challenger, "name": challenger, "rating": 1950, "title": "BOT" },
            "destUser": { "id": USER, "name": "Bot", "rating": 2000, "title": "BOT" },
            "variant": { "key": "standard" },
            "rated": true,
            "speed": "blitz",
            "timeControl": { "type": "clock", "limit": 180, "increment": 2 },
            "color": "random",
            "tournamentId": tournament
        }
    }))
    .unwrap()
}

pub fn game_start(id: &str, opponent: &str, tournament: Option<&str>) -> IncomingEvent {
    serde_json::from_value(json!({
        "type": "gameStart",
        "game": {
            "gameId": id,
            "opponent": { "id": opponent, "username": opponent, "rating": 1950 },
            "tournamentId": tournament
        }
    }))
    .unwrap()
}

/// First event of a blitz game stream.
pub fn full(id: &str, white: &str, black: &str, moves: &str, status: &str, winner: Option<&str>) -> GameEvent {
    serde_json::from_value(json!({
        "type": "gameFull",
        "id": id,
        "rated": true,
        "variant": { "key": "standard" },
        "clock": { "initial": 180000, "increment": 2000 },
        "white": { "id": white, "name": white, "title": "BOT", "rating": 2000 },
        "black": { "id": black, "name": black, "title": "BOT", "rating": 1950 },
        "initialFen": "startpos",
        "state": state_json(moves, status, winner)
    }))
    .unwrap()
}

pub fn state(moves: &str, status: &str, winner: Option<&str>) -> GameEvent {
    serde_json::from_value(state_json(moves, status, winner)).unwrap()
}

fn state_json(moves: &str, status: &str, winner: Option<&str>) -> serde_json::Value {
    json!({
        "type": "gameState",
        "moves": moves,
        "wtime": 180000,
        "btime": 180000,
        "winc": 2000,
        "binc": 2000,
        "status": status,
        "winner": winner
    })
}
