//! Top-level coordination of the bot.
//!
//! The [`SessionManager`] owns the registry of running games and is the only component that
//! creates or removes them. Everything reaches it as an [`Event`] on a single dispatch
//! channel: account events read by the event stream thread, reports of finished games,
//! answers to outgoing challenges and operator commands.
//!
//! Admission is a single step under the registry lock: the free slots are counted and the
//! slot is taken at once, so the concurrency cap can never be exceeded. A slot is held by
//!
//! - a running game,
//! - an accepted challenge whose game has not started yet,
//! - an outgoing matchmaking challenge waiting for its answer,
//! - an idle tournament reservation.
//!
//! Network calls are always made after the lock is released.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::book::OpeningBooks;
use crate::challenge::{self, ChallengeOffer, ChallengeRules, DeclineReason, Load, Verdict};
use crate::commands::{Command, HELP};
use crate::configuration::Configuration;
use crate::engine::{EngineFactory, EnginePool};
use crate::game::runner::{GameContext, GameInput, GameReport, GameRunner};
use crate::game::Outcome;
use crate::matchmaking::{
    Action, AttemptOutcome, ChallengeTarget, MatchmakingScheduler, MatchmakingSettings,
    RegistryView,
};
use crate::remote::{
    ratings, ChallengeAnswer, ChallengeRequest, GameEvent, GameInfo, IncomingEvent,
    RemoteError, RemoteService,
};
use crate::tournament::{Leave, TournamentTracker};
use crate::types::TimeControl;

const GAME_QUEUE: usize = 64;
const MAX_STREAM_BACKOFF: Duration = Duration::from_secs(60);
const IDLE_TICK: Duration = Duration::from_secs(5);

/// Whether the bot waits for challenges or challenges others itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Inbound challenges are evaluated.
    AcceptChallenges,
    /// Inbound challenges are declined, except tournament ones.
    Matchmaking,
}

/// Why a game could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Every slot is used or reserved.
    Capacity,
    /// No new game after a shutdown.
    ShuttingDown,
    /// The game is already running.
    Duplicate,
}

/// Answer of [`SessionManager::request_new_game`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was granted.
    Admitted,
    /// No slot, for this reason.
    Rejected(RejectReason),
}

/// What asks for a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Incoming challenge about to be accepted.
    Challenge {
        /// Challenge id.
        id: String,
        /// Set for tournament pairings.
        tournament_id: Option<String>,
    },
    /// Matchmaking challenge about to be sent.
    Outgoing(ChallengeTarget),
    /// A game started on the service.
    GameStart(GameInfo),
}

/// Everything the session manager reacts to.
#[derive(Debug)]
pub enum Event {
    /// Read from the account event stream.
    Remote(IncomingEvent),
    /// Game stream event to hand to a running game.
    Game {
        /// Game id.
        id: String,
        /// The event.
        event: GameEvent,
    },
    /// A game thread finished.
    GameOver(GameReport),
    /// An outgoing challenge was answered.
    ChallengeAnswered {
        /// Challenge that was sent.
        target: ChallengeTarget,
        /// Answer, or why it could not be sent.
        answer: Result<ChallengeAnswer, RemoteError>,
    },
    /// Console command.
    Command(Command),
}

/// Settings of the session manager.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Concurrency cap.
    pub concurrency: usize,
    /// Which challenges to accept.
    pub rules: ChallengeRules,
    /// Matchmaking configuration.
    pub matchmaking: MatchmakingSettings,
    /// Where matchmaking records are kept.
    pub records_dir: Option<PathBuf>,
    /// Accepted challenges whose game doesn't start within this delay are forgotten.
    pub pending_timeout: Duration,
    /// Start in matchmaking mode.
    pub start_matchmaking: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            concurrency: 1,
            rules: ChallengeRules::default(),
            matchmaking: MatchmakingSettings::default(),
            records_dir: None,
            pending_timeout: Duration::from_secs(60),
            start_matchmaking: false,
        }
    }
}

#[derive(Debug)]
enum PendingKind {
    Incoming,
    Outgoing(ChallengeTarget),
}

#[derive(Debug)]
struct Pending {
    kind: PendingKind,
    tournament_id: Option<String>,
    since: Instant,
}

#[derive(Debug)]
struct GameEntry {
    sender: SyncSender<GameInput>,
    opponent_id: Option<String>,
    tournament_id: Option<String>,
    matchmaking: Option<ChallengeTarget>,
}

#[derive(Debug)]
struct Registry {
    capacity: usize,
    games: HashMap<String, GameEntry>,
    pending: HashMap<String, Pending>,
    tournaments: TournamentTracker,
    scheduler: MatchmakingScheduler,
    mode: Mode,
    accepting: bool,
}

impl Registry {
    fn occupied(&self) -> usize {
        self.games.len() + self.pending.len() + self.tournaments.idle_reservations()
    }

    fn free(&self) -> usize {
        self.capacity.saturating_sub(self.occupied())
    }

    fn load(&self) -> Load {
        Load {
            active: self.games.len(),
            reserved: self.pending.len() + self.tournaments.idle_reservations(),
            capacity: self.capacity,
            matchmaking: self.mode == Mode::Matchmaking,
            reserved_tournaments: self.tournaments.reserved_ids(),
        }
    }

    /// Takes a slot for something that is not a game yet, or for a game started by itself.
    fn reserve(&mut self, tournament_id: Option<&str>) -> Admission {
        if !self.accepting {
            return Admission::Rejected(RejectReason::ShuttingDown);
        }
        if let Some(id) = tournament_id {
            if self.tournaments.reserved_ids().iter().any(|r| r == id) {
                self.tournaments.game_started(id);
                return Admission::Admitted;
            }
        }
        if self.free() == 0 {
            return Admission::Rejected(RejectReason::Capacity);
        }
        if let Some(id) = tournament_id {
            self.tournaments.game_started(id);
        }
        Admission::Admitted
    }

    /// Holds a slot for a challenge until its game starts.
    fn hold(&mut self, key: String, kind: PendingKind, tournament_id: Option<String>) -> Admission {
        if self.pending.contains_key(&key) || self.games.contains_key(&key) {
            return Admission::Rejected(RejectReason::Duplicate);
        }
        let admission = self.reserve(tournament_id.as_deref());
        if admission == Admission::Admitted {
            self.pending.insert(
                key,
                Pending {
                    kind,
                    tournament_id,
                    since: Instant::now(),
                },
            );
        }
        admission
    }

    fn release_pending(&mut self, key: &str, now: OffsetDateTime) -> Option<Pending> {
        let pending = self.pending.remove(key)?;
        if let Some(id) = &pending.tournament_id {
            self.tournaments.game_finished(id, now);
        }
        self.grant_free_slots();
        Some(pending)
    }

    /// Freed slots go to tournaments still waiting for a reservation.
    fn grant_free_slots(&mut self) {
        while self.free() > 0 {
            let Some(id) = self.tournaments.waiting_for_slot().map(str::to_string) else {
                return;
            };
            self.tournaments.grant(&id);
        }
    }

    fn view(&self) -> RegistryView {
        RegistryView {
            free_slots: self.free(),
            opponents: self
                .games
                .values()
                .filter_map(|g| g.opponent_id.clone())
                .collect(),
            challenge_pending: self
                .pending
                .values()
                .any(|p| matches!(p.kind, PendingKind::Outgoing(_))),
        }
    }
}

/// Coordinates games, challenges, matchmaking and tournaments.
pub struct SessionManager {
    ctx: Arc<GameContext>,
    rules: ChallengeRules,
    matchmaking_timeout: Duration,
    pending_timeout: Duration,
    registry: Mutex<Registry>,
    drained: Condvar,
    dispatch: Sender<Event>,
    inbox: Mutex<Option<Receiver<Event>>>,
    stopping: Arc<AtomicBool>,
}

impl SessionManager {
    /// Manager playing with `ctx`. Nothing runs before [`SessionManager::run`].
    pub fn new(ctx: Arc<GameContext>, settings: SessionSettings) -> Arc<Self> {
        let (dispatch, inbox) = mpsc::channel();
        let mut scheduler = MatchmakingScheduler::new(settings.matchmaking.clone(), &ctx.user_id);
        if let Some(dir) = &settings.records_dir {
            scheduler = scheduler.with_records_file(dir);
        }
        let mode = if settings.start_matchmaking {
            Mode::Matchmaking
        } else {
            Mode::AcceptChallenges
        };
        trace!(?settings);
        Arc::new(SessionManager {
            ctx,
            rules: settings.rules,
            matchmaking_timeout: Duration::from_secs(settings.matchmaking.timeout),
            pending_timeout: settings.pending_timeout,
            registry: Mutex::new(Registry {
                capacity: settings.concurrency,
                games: HashMap::new(),
                pending: HashMap::new(),
                tournaments: TournamentTracker::new(),
                scheduler,
                mode,
                accepting: true,
            }),
            drained: Condvar::new(),
            dispatch,
            inbox: Mutex::new(Some(inbox)),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Builds a manager from `config`: loads the books, then checks and smoke-tests engines.
    #[instrument(skip_all, fields(user = user_id))]
    pub fn from_configuration(
        config: &Configuration,
        remote: Arc<dyn RemoteService>,
        user_id: &str,
        factory: impl EngineFactory + 'static,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let resources = config.resources.clone().build(config.concurrency)?;
        let engines = EnginePool::new(factory, config.engines.clone()).with_resources(resources);
        engines.check()?;
        engines.self_test()?;
        let books = OpeningBooks::load(&config.books)?;

        let ctx = GameContext {
            remote,
            engines: Arc::new(engines),
            books: Arc::new(books),
            book_seed: config.books.seed,
            user_id: user_id.to_ascii_lowercase(),
            timeout_policy: config.timeout_policy,
            abort_after_bot: config.abort_after_bot,
            abort_after_human: config.abort_after_human,
            reconnect_delay: Duration::from_secs(1),
            verbose: config.verbose,
        };
        let settings = SessionSettings {
            concurrency: config.concurrency,
            rules: config.rules.clone(),
            matchmaking: config.matchmaking.clone(),
            records_dir: config.records_dir.clone(),
            pending_timeout: config.pending_timeout,
            start_matchmaking: false,
        };
        Ok(SessionManager::new(Arc::new(ctx), settings))
    }

    /// Channel feeding [`SessionManager::run`], e.g. for operator commands.
    pub fn sender(&self) -> Sender<Event> {
        self.dispatch.clone()
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.registry.lock().expect("poisoned").mode
    }

    /// Ids of the running games.
    pub fn active_games(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .registry
            .lock()
            .expect("poisoned")
            .games
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Current load, as seen by challenge decisions.
    pub fn load(&self) -> Load {
        self.registry.lock().expect("poisoned").load()
    }

    /// Ids of the joined tournaments.
    pub fn tournaments(&self) -> Vec<String> {
        self.registry.lock().expect("poisoned").tournaments.ids()
    }

    /// Reads the event stream and handles events until `quit` and the last game is over.
    #[instrument(skip_all)]
    pub fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let inbox = self
            .inbox
            .lock()
            .expect("poisoned")
            .take()
            .context("session manager already running")?;
        setup_panic_hook();
        self.spawn_event_stream()?;
        info!("session manager running");

        loop {
            let wait = self.tick();
            match inbox.recv_timeout(wait) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.is_finished() {
                break;
            }
        }
        self.stopping.store(true, Ordering::SeqCst);
        info!("session manager stopped");
        Ok(())
    }

    /// Routes one event.
    pub fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::Remote(event) => self.on_remote(event),
            Event::Game { id, event } => self.route(&id, event),
            Event::GameOver(report) => self.on_game_over(report),
            Event::ChallengeAnswered { target, answer } => self.on_answer(target, answer),
            Event::Command(command) => self.on_command(command),
        }
    }

    /// Takes a slot for `trigger`. A started game gets its runner thread.
    pub fn request_new_game(self: &Arc<Self>, trigger: Trigger) -> Admission {
        let mut registry = self.registry.lock().expect("poisoned");
        match trigger {
            Trigger::Challenge { id, tournament_id } => {
                registry.hold(id, PendingKind::Incoming, tournament_id)
            }
            Trigger::Outgoing(target) => {
                let key = outgoing_key(&target.opponent_id);
                registry.hold(key, PendingKind::Outgoing(target), None)
            }
            Trigger::GameStart(info) => {
                let id = info.game_id.clone();
                if registry.games.contains_key(&id) {
                    return Admission::Rejected(RejectReason::Duplicate);
                }
                let opponent_id = info.opponent.as_ref().and_then(|o| o.id.clone());
                // an outgoing challenge may still be keyed by opponent if its answer is late
                let key = if registry.pending.contains_key(&id) {
                    Some(id.clone())
                } else {
                    opponent_id
                        .as_deref()
                        .map(outgoing_key)
                        .filter(|key| {
                            info.tournament().is_none()
                                && registry
                                    .pending
                                    .get(key)
                                    .is_some_and(|p| matches!(p.kind, PendingKind::Outgoing(_)))
                        })
                };
                let pending = key.and_then(|key| registry.pending.remove(&key));
                let (tournament_id, matchmaking) = match pending {
                    Some(p) => {
                        let target = match p.kind {
                            PendingKind::Outgoing(target) => Some(target),
                            PendingKind::Incoming => None,
                        };
                        (p.tournament_id, target)
                    }
                    None => {
                        let tournament_id = info.tournament().map(str::to_string);
                        let admission = registry.reserve(tournament_id.as_deref());
                        if admission != Admission::Admitted {
                            return admission;
                        }
                        (tournament_id, None)
                    }
                };

                let (sender, inbox) = mpsc::sync_channel(GAME_QUEUE);
                let runner = GameRunner::new(
                    Arc::clone(&self.ctx),
                    &id,
                    inbox,
                    sender.clone(),
                    matchmaking.is_some(),
                    tournament_id.clone(),
                );
                registry.games.insert(
                    id.clone(),
                    GameEntry {
                        sender,
                        opponent_id,
                        tournament_id,
                        matchmaking,
                    },
                );
                info!(game = %id, active = registry.games.len(), "game admitted");
                drop(registry);
                self.spawn_game(&id, runner);
                Admission::Admitted
            }
        }
    }

    /// Stops admitting games and withdraws from tournaments. With `drain`, waits for the
    /// running games to end.
    ///
    /// Must not be called from the thread of [`SessionManager::run`] when draining, since
    /// game reports are handled there.
    #[instrument(skip(self))]
    pub fn shutdown(&self, drain: bool) {
        let tournaments = {
            let mut registry = self.registry.lock().expect("poisoned");
            registry.accepting = false;
            registry.mode = Mode::AcceptChallenges;
            let ids = registry.tournaments.ids();
            for id in &ids {
                registry.tournaments.leave(id);
            }
            ids
        };
        for id in tournaments {
            if let Err(e) = self.ctx.remote.withdraw_tournament(&id) {
                warn!(tournament = %id, "could not withdraw: {e}");
            }
        }
        if drain {
            let mut registry = self.registry.lock().expect("poisoned");
            while !registry.games.is_empty() {
                info!("waiting for {} game(s) to finish", registry.games.len());
                registry = self.drained.wait(registry).expect("poisoned");
            }
        }
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn is_finished(&self) -> bool {
        let registry = self.registry.lock().expect("poisoned");
        !registry.accepting && registry.games.is_empty()
    }

    fn spawn_game(self: &Arc<Self>, id: &str, runner: GameRunner) {
        let dispatch = self.dispatch.clone();
        let spawned = thread::Builder::new()
            .name(format!("game-{id}"))
            .spawn(move || {
                let report = runner.run();
                let _ = dispatch.send(Event::GameOver(report));
            });
        if let Err(e) = spawned {
            error!(game = %id, "could not start the game thread: {e}");
            self.remove_game(id);
        }
    }

    fn spawn_event_stream(&self) -> anyhow::Result<()> {
        let remote = Arc::clone(&self.ctx.remote);
        let dispatch = self.dispatch.clone();
        let stopping = Arc::clone(&self.stopping);
        let first_delay = self.ctx.reconnect_delay;
        thread::Builder::new()
            .name("event-stream".to_string())
            .spawn(move || {
                let mut delay = first_delay;
                while !stopping.load(Ordering::SeqCst) {
                    match remote.stream_events() {
                        Ok(stream) => {
                            for item in stream {
                                match item {
                                    Ok(event) => {
                                        delay = first_delay;
                                        if dispatch.send(Event::Remote(event)).is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        warn!("event stream: {e}");
                                        break;
                                    }
                                }
                            }
                        }
                        Err(RemoteError::RateLimited) => {
                            warn!("event stream rate limited");
                            delay = MAX_STREAM_BACKOFF;
                        }
                        Err(e) => warn!("could not open the event stream: {e}"),
                    }
                    if stopping.load(Ordering::SeqCst) {
                        return;
                    }
                    debug!("reconnecting in {delay:?}");
                    thread::sleep(delay);
                    delay = (delay * 2).min(MAX_STREAM_BACKOFF);
                }
            })
            .context("could not start the event stream thread")?;
        Ok(())
    }

    /// Periodic work. Returns how long the run loop may sleep.
    fn tick(self: &Arc<Self>) -> Duration {
        let now = OffsetDateTime::now_utc();
        {
            let mut registry = self.registry.lock().expect("poisoned");
            let expired: Vec<String> = registry
                .pending
                .iter()
                .filter(|(_, p)| {
                    let limit = match p.kind {
                        PendingKind::Incoming => self.pending_timeout,
                        PendingKind::Outgoing(_) => self.pending_timeout + self.matchmaking_timeout,
                    };
                    p.since.elapsed() > limit
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                warn!(challenge = %key, "no game started, slot released");
                registry.release_pending(&key, now);
            }
            for id in registry.tournaments.expire(now) {
                debug!(tournament = %id, "reservation released");
            }
            registry.grant_free_slots();
        }
        self.matchmaking_tick(now).unwrap_or(IDLE_TICK).min(IDLE_TICK)
    }

    fn matchmaking_tick(self: &Arc<Self>, now: OffsetDateTime) -> Option<Duration> {
        let needs_refresh = {
            let registry = self.registry.lock().expect("poisoned");
            if registry.mode != Mode::Matchmaking || !registry.accepting {
                return None;
            }
            registry.scheduler.needs_refresh(now)
        };
        if needs_refresh {
            let bots = self.ctx.remote.online_bots();
            let account = self.ctx.remote.account();
            match (bots, account) {
                (Ok(bots), Ok(account)) => self
                    .registry
                    .lock()
                    .expect("poisoned")
                    .scheduler
                    .update_online(now, bots, ratings(&account.perfs)),
                (Err(e), _) | (_, Err(e)) => warn!("could not refresh online bots: {e}"),
            }
        }

        let target = {
            let mut registry = self.registry.lock().expect("poisoned");
            let view = registry.view();
            match registry.scheduler.next_action(now, &view) {
                Action::Wait(until) => return Some(std_duration(until - now)),
                Action::Challenge(target) => target,
            }
        };
        if self.request_new_game(Trigger::Outgoing(target.clone())) != Admission::Admitted {
            return Some(IDLE_TICK);
        }
        self.spawn_challenge(target);
        None
    }

    fn spawn_challenge(&self, target: ChallengeTarget) {
        let remote = Arc::clone(&self.ctx.remote);
        let dispatch = self.dispatch.clone();
        let timeout = self.matchmaking_timeout;
        let spawned = thread::Builder::new()
            .name(format!("challenge-{}", target.opponent_id))
            .spawn(move || {
                let answer = match remote.user_online(&target.opponent) {
                    Ok(false) => Ok(ChallengeAnswer::NoAnswer { id: None }),
                    _ => {
                        let (initial, increment) = match target.time_control {
                            TimeControl::Clock { initial, increment } => (initial, increment),
                            _ => (0, 0),
                        };
                        remote.create_challenge(&ChallengeRequest {
                            opponent: target.opponent.clone(),
                            initial,
                            increment,
                            rated: target.rated,
                            color: target.color,
                            variant: target.variant,
                            timeout,
                        })
                    }
                };
                let _ = dispatch.send(Event::ChallengeAnswered { target, answer });
            });
        if let Err(e) = spawned {
            error!("could not start the challenge thread: {e}");
        }
    }

    #[instrument(skip_all)]
    fn on_remote(self: &Arc<Self>, event: IncomingEvent) {
        match event {
            IncomingEvent::Challenge { challenge } => {
                if challenge.challenger.id.eq_ignore_ascii_case(&self.ctx.user_id) {
                    trace!(challenge = %challenge.id, "own challenge");
                    return;
                }
                self.on_challenge(challenge.to_offer());
            }
            IncomingEvent::ChallengeCanceled { challenge } => {
                let released = self
                    .registry
                    .lock()
                    .expect("poisoned")
                    .release_pending(&challenge.id, OffsetDateTime::now_utc());
                if released.is_some() {
                    info!(challenge = %challenge.id, "challenge canceled, slot released");
                }
            }
            IncomingEvent::ChallengeDeclined { challenge } => {
                debug!(challenge = %challenge.id, "challenge declined");
            }
            IncomingEvent::GameStart { game } => {
                let id = game.game_id.clone();
                match self.request_new_game(Trigger::GameStart(game)) {
                    Admission::Admitted => {}
                    Admission::Rejected(RejectReason::Duplicate) => {
                        debug!(game = %id, "game already running");
                    }
                    Admission::Rejected(reason) => {
                        warn!(game = %id, ?reason, "game refused, aborting it");
                        if let Err(e) = self.ctx.remote.abort_game(&id) {
                            warn!(game = %id, "could not abort: {e}");
                        }
                    }
                }
            }
            IncomingEvent::GameFinish { game } => {
                debug!(game = %game.game_id, "game finished");
            }
            IncomingEvent::Unknown => {}
        }
    }

    /// Decides on a challenge and takes its slot in the same critical section.
    #[instrument(skip_all, fields(challenge = %offer.id))]
    fn on_challenge(self: &Arc<Self>, offer: ChallengeOffer) {
        let verdict = {
            let mut registry = self.registry.lock().expect("poisoned");
            match challenge::evaluate(&offer, &registry.load(), &self.rules) {
                Verdict::Accept => {
                    let tournament_id = offer.tournament_id.clone();
                    match registry.hold(offer.id.clone(), PendingKind::Incoming, tournament_id) {
                        Admission::Admitted => Verdict::Accept,
                        Admission::Rejected(RejectReason::Duplicate) => return,
                        Admission::Rejected(_) => Verdict::Decline(DeclineReason::Later),
                    }
                }
                decline => decline,
            }
        };

        if self.ctx.verbose {
            println!(
                "Challenge {} from {} ({}): {verdict:?}",
                offer.id,
                offer.challenger.name,
                offer.challenger.rating.map_or("?".to_string(), |r| r.to_string())
            );
        }
        match verdict {
            Verdict::Accept => {
                info!(challenger = %offer.challenger.name, "accepting");
                if let Err(e) = self.ctx.remote.accept_challenge(&offer.id) {
                    warn!("could not accept: {e}");
                    self.registry
                        .lock()
                        .expect("poisoned")
                        .release_pending(&offer.id, OffsetDateTime::now_utc());
                }
            }
            Verdict::Decline(reason) => {
                info!(challenger = %offer.challenger.name, %reason, "declining");
                if let Err(e) = self.ctx.remote.decline_challenge(&offer.id, reason) {
                    warn!("could not decline: {e}");
                }
            }
        }
    }

    fn route(&self, id: &str, event: GameEvent) {
        let registry = self.registry.lock().expect("poisoned");
        let Some(entry) = registry.games.get(id) else {
            warn!(game = %id, "event for an unknown game dropped");
            return;
        };
        match entry.sender.try_send(GameInput::Routed(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(game = %id, "game queue full, event dropped"),
            Err(TrySendError::Disconnected(_)) => debug!(game = %id, "game already over"),
        }
    }

    fn on_game_over(&self, report: GameReport) {
        let now = OffsetDateTime::now_utc();
        let Some(entry) = self.remove_game(&report.id) else {
            warn!(game = %report.id, "report of an unknown game");
            return;
        };
        if let Some(target) = entry.matchmaking {
            let outcome = match report.outcome {
                Outcome::Won => AttemptOutcome::Won,
                Outcome::Lost | Outcome::TimedOut => AttemptOutcome::Lost,
                Outcome::Drawn => AttemptOutcome::Drawn,
                Outcome::Aborted | Outcome::Error => AttemptOutcome::Aborted,
            };
            self.registry
                .lock()
                .expect("poisoned")
                .scheduler
                .on_result(now, &target, outcome, report.color);
        }
        info!(game = %report.id, opponent = %report.opponent, outcome = %report.outcome, "game removed");
    }

    /// Removes a game, exactly once.
    fn remove_game(&self, id: &str) -> Option<GameEntry> {
        let mut registry = self.registry.lock().expect("poisoned");
        let entry = registry.games.remove(id)?;
        if let Some(tournament) = &entry.tournament_id {
            registry.tournaments.game_finished(tournament, OffsetDateTime::now_utc());
        }
        registry.grant_free_slots();
        if registry.games.is_empty() {
            self.drained.notify_all();
        }
        Some(entry)
    }

    fn on_answer(&self, target: ChallengeTarget, answer: Result<ChallengeAnswer, RemoteError>) {
        let now = OffsetDateTime::now_utc();
        let key = outgoing_key(&target.opponent_id);
        let mut cancel = None;
        let mut registry = self.registry.lock().expect("poisoned");
        match answer {
            Ok(ChallengeAnswer::Accepted { id }) => {
                // the game may already have started and taken the slot
                if let Some(pending) = registry.pending.remove(&key) {
                    registry.pending.insert(id.clone(), pending);
                }
                info!(opponent = %target.opponent, game = %id, "challenge accepted");
                return;
            }
            Ok(ChallengeAnswer::Declined { reason, .. }) => {
                info!(opponent = %target.opponent, ?reason, "challenge declined");
                registry.scheduler.on_result(now, &target, AttemptOutcome::Declined, None);
            }
            Ok(ChallengeAnswer::NoAnswer { id }) => {
                info!(opponent = %target.opponent, "challenge not answered");
                registry.scheduler.on_result(now, &target, AttemptOutcome::NoAnswer, None);
                cancel = id;
            }
            Err(RemoteError::RateLimited) => registry.scheduler.on_rate_limited(now),
            Err(RemoteError::Rejected(e)) => {
                info!(opponent = %target.opponent, "challenge refused: {e}");
                registry.scheduler.on_result(now, &target, AttemptOutcome::Declined, None);
            }
            Err(e) => warn!(opponent = %target.opponent, "challenge failed: {e}"),
        }
        registry.release_pending(&key, now);
        drop(registry);

        if let Some(id) = cancel {
            if let Err(e) = self.ctx.remote.cancel_challenge(&id) {
                debug!("could not cancel {id}: {e}");
            }
        }
    }

    #[instrument(skip(self))]
    fn on_command(&self, command: Command) {
        match command {
            Command::Matchmaking => {
                let mut registry = self.registry.lock().expect("poisoned");
                if !registry.accepting {
                    warn!("shutting down, matchmaking not started");
                } else if registry.scheduler.settings().types.is_empty() {
                    warn!("no matchmaking type configured");
                } else {
                    registry.mode = Mode::Matchmaking;
                    info!("matchmaking mode");
                }
            }
            Command::Stop => {
                self.registry.lock().expect("poisoned").mode = Mode::AcceptChallenges;
                info!("accepting challenges");
            }
            Command::Tournament { id, team, password } => self.join_tournament(&id, team, password),
            Command::Leave(id) => {
                let leave = self.registry.lock().expect("poisoned").tournaments.leave(&id);
                match leave {
                    Leave::Unknown => warn!(tournament = %id, "not joined"),
                    Leave::Released | Leave::Deferred => {
                        if let Err(e) = self.ctx.remote.withdraw_tournament(&id) {
                            warn!(tournament = %id, "could not withdraw: {e}");
                        }
                        self.registry.lock().expect("poisoned").grant_free_slots();
                    }
                }
            }
            Command::Quit => {
                info!("quitting once running games are over");
                self.shutdown(false);
            }
            Command::Help => println!("{HELP}"),
        }
    }

    fn join_tournament(&self, id: &str, team: Option<String>, password: Option<String>) {
        if self.registry.lock().expect("poisoned").tournaments.get(id).is_some() {
            warn!(tournament = %id, "already joined");
            return;
        }
        if let Err(e) = self
            .ctx
            .remote
            .join_tournament(id, team.as_deref(), password.as_deref())
        {
            warn!(tournament = %id, "could not join: {e}");
            return;
        }
        let ends_at = match self.ctx.remote.tournament_info(id) {
            Ok(info) => info
                .seconds_to_finish
                .map(|s| OffsetDateTime::now_utc() + time::Duration::seconds(s)),
            Err(e) => {
                debug!(tournament = %id, "no tournament info: {e}");
                None
            }
        };
        let mut registry = self.registry.lock().expect("poisoned");
        let slot = registry.free() > 0;
        registry.tournaments.join(id, team, password, ends_at, slot);
        if !slot {
            warn!(tournament = %id, "every slot is busy, reservation taken at the next free one");
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("registry", &self.registry)
            .finish()
    }
}

fn outgoing_key(opponent_id: &str) -> String {
    format!("@{}", opponent_id.to_ascii_lowercase())
}

fn std_duration(duration: time::Duration) -> Duration {
    Duration::try_from(duration).unwrap_or(Duration::ZERO)
}

/// Exits on panic, otherwise the run loop would wait forever for the report of a dead game.
fn setup_panic_hook() {
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}
