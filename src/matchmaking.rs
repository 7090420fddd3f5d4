//! Outgoing challenges to other online bots.
//!
//! The scheduler cycles through the configured [`MatchmakingType`]s and, for each, challenges
//! the eligible online bot whose rating is closest to ours. An opponent stays ineligible for a
//! cooldown derived from the expected game length:
//!
//! ```text
//! estimated = max(initial, 3) * initial_coefficient + increment * increment_coefficient
//! cooldown  = (estimated + delay) * failure_multiplier
//! ```
//!
//! The multiplier doubles on each declined or unanswered challenge and resets after a game.
//! After a game as white the next challenge to the same opponent asks for black and skips the
//! cooldown, so pairs of games are played with both colors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::types::{Color, Speed, TimeControl, Variant};

const HISTORY_LEN: usize = 20;
const MAX_MULTIPLIER: u32 = 64;
const DEFAULT_RATING: u32 = 1500;

/// One kind of game the bot looks for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MatchmakingType {
    /// Shown in logs.
    pub name: String,
    /// `minutes+increment`.
    pub tc: String,
    #[serde(default = "default_true")]
    /// Rated or casual challenges.
    pub rated: bool,
    #[serde(default = "default_variant")]
    /// Rule set of the challenges.
    pub variant: Variant,
    /// Opponents must be at least this far from our rating.
    #[serde(default)]
    pub min_rating_diff: Option<u32>,
    /// Opponents must be at most this far from our rating.
    #[serde(default)]
    pub max_rating_diff: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_variant() -> Variant {
    Variant::Standard
}

/// Matchmaking section of the configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatchmakingSettings {
    /// Enabled types, one picked at each challenge.
    pub types: Vec<MatchmakingType>,
    /// Pause between two challenges, in seconds.
    pub delay: u64,
    /// How long an outgoing challenge may stay unanswered, in seconds.
    pub timeout: u64,
    /// Seconds of estimated game per second of initial time.
    pub initial_coefficient: f64,
    /// Seconds of estimated game per second of increment.
    pub increment_coefficient: f64,
    /// Wait when nobody can be challenged, in seconds.
    pub retry: u64,
    /// Interval between two refreshes of the online bots, in seconds.
    pub refresh: u64,
    /// Pause after the service answered with a rate limit, in seconds.
    pub rate_limit_pause: u64,
    /// Bots never challenged.
    pub blocklist: Vec<String>,
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        MatchmakingSettings {
            types: vec![],
            delay: 10,
            timeout: 30,
            initial_coefficient: 1.33,
            increment_coefficient: 94.48,
            retry: 60,
            refresh: 1800,
            rate_limit_pause: 3600,
            blocklist: vec![],
        }
    }
}

impl MatchmakingSettings {
    /// Every type must have a valid clock.
    pub fn validate(&self) -> anyhow::Result<()> {
        for t in &self.types {
            let tc = t
                .tc
                .parse::<TimeControl>()
                .with_context(|| format!("matchmaking type '{}'", t.name))?;
            if let (Some(min), Some(max)) = (t.min_rating_diff, t.max_rating_diff) {
                if min > max {
                    bail!("matchmaking type '{}': min_rating_diff > max_rating_diff", t.name);
                }
            }
            debug!(name = %t.name, %tc, "matchmaking type");
        }
        Ok(())
    }

    /// Estimated duration of a game with this clock, without the delay.
    pub fn estimated_duration(&self, initial: u32, increment: u32) -> Duration {
        let secs = initial.max(3) as f64 * self.initial_coefficient
            + increment as f64 * self.increment_coefficient;
        Duration::seconds_f64(secs)
    }

    /// Time an opponent stays ineligible after an attempt.
    pub fn cooldown(&self, initial: u32, increment: u32, multiplier: u32) -> Duration {
        (self.estimated_duration(initial, increment) + Duration::seconds(self.delay as i64))
            * multiplier as i32
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// We won.
    Won,
    /// We lost.
    Lost,
    /// Draw.
    Drawn,
    /// Aborted before both sides moved.
    Aborted,
    /// The opponent declined.
    Declined,
    /// No answer in time.
    NoAnswer,
}

impl AttemptOutcome {
    /// A game was actually played.
    pub fn is_game(self) -> bool {
        matches!(self, AttemptOutcome::Won | AttemptOutcome::Lost | AttemptOutcome::Drawn)
    }
}

/// What we know about one opponent for one perf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakingRecord {
    /// Username.
    pub opponent: String,
    /// Rating at the last attempt.
    pub rating: Option<u32>,
    #[serde(with = "time::serde::timestamp::option", default)]
    /// When the last challenge went out.
    pub last_challenged: Option<OffsetDateTime>,
    /// Not challenged again before this.
    #[serde(with = "time::serde::timestamp::option", default)]
    pub release_at: Option<OffsetDateTime>,
    /// Grows the cooldown after declines and no answers.
    pub multiplier: u32,
    /// Color asked at the next challenge.
    pub next_color: Color,
    /// Most recent last.
    pub history: Vec<AttemptOutcome>,
}

impl MatchmakingRecord {
    fn new(opponent: &str) -> Self {
        MatchmakingRecord {
            opponent: opponent.to_string(),
            rating: None,
            last_challenged: None,
            release_at: None,
            multiplier: 1,
            next_color: Color::White,
            history: vec![],
        }
    }

    fn is_released(&self, now: OffsetDateTime) -> bool {
        self.next_color == Color::Black || self.release_at.is_none_or(|at| at <= now)
    }
}

/// Bot currently online.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineBot {
    /// Lowercase id.
    pub id: String,
    /// Our username, never challenged.
    pub username: String,
    /// Ratings by perf key (`blitz`, `atomic`...).
    pub ratings: HashMap<String, u32>,
}

/// Perf key of a game: the variant, or the speed for regular chess.
pub fn perf_key(variant: Variant, speed: Speed) -> String {
    if variant.is_standard_rules() {
        match speed {
            Speed::UltraBullet => "ultraBullet".to_string(),
            other => other.as_str().to_string(),
        }
    } else {
        variant.api_key().to_string()
    }
}

/// Challenge to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeTarget {
    /// Username.
    pub opponent: String,
    /// Lowercase id, key of the records.
    pub opponent_id: String,
    /// Rating in `perf`.
    pub rating: u32,
    /// Name of the matchmaking type.
    pub type_name: String,
    /// Perf key of the challenge.
    pub perf: String,
    /// Clock of the challenge.
    pub time_control: TimeControl,
    /// Rated or casual.
    pub rated: bool,
    /// Rule set.
    pub variant: Variant,
    /// Color we ask for.
    pub color: Color,
}

/// Decision of [`MatchmakingScheduler::next_action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do before this time.
    Wait(OffsetDateTime),
    /// Send this challenge.
    Challenge(ChallengeTarget),
}

/// What the scheduler needs to know about the session registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryView {
    /// Slots neither used nor reserved.
    pub free_slots: usize,
    /// Ids of opponents currently playing us.
    pub opponents: HashSet<String>,
    /// An outgoing challenge is still unanswered.
    pub challenge_pending: bool,
}

#[derive(Debug, Clone)]
struct ParsedType {
    name: String,
    time_control: TimeControl,
    initial: u32,
    increment: u32,
    rated: bool,
    variant: Variant,
    perf: String,
    min_diff: Option<u32>,
    max_diff: Option<u32>,
}

type Records = BTreeMap<String, BTreeMap<String, MatchmakingRecord>>;

/// Chooses whom to challenge and when.
#[derive(Debug)]
pub struct MatchmakingScheduler {
    settings: MatchmakingSettings,
    username: String,
    types: Vec<ParsedType>,
    next_type: usize,
    suspended: HashSet<String>,
    own_ratings: HashMap<String, u32>,
    online: Vec<OnlineBot>,
    refreshed_at: Option<OffsetDateTime>,
    records: Records,
    next_allowed: OffsetDateTime,
    path: Option<PathBuf>,
}

impl MatchmakingScheduler {
    /// Scheduler for the account `username`. Types with an invalid clock are skipped.
    pub fn new(settings: MatchmakingSettings, username: &str) -> Self {
        let types = settings
            .types
            .iter()
            .filter_map(|t| {
                let tc = t.tc.parse::<TimeControl>().ok()?;
                let TimeControl::Clock { initial, increment } = tc else {
                    return None;
                };
                Some(ParsedType {
                    name: t.name.clone(),
                    time_control: tc,
                    initial,
                    increment,
                    rated: t.rated,
                    variant: t.variant,
                    perf: perf_key(t.variant, tc.speed()),
                    min_diff: t.min_rating_diff,
                    max_diff: t.max_rating_diff,
                })
            })
            .collect();
        MatchmakingScheduler {
            settings,
            username: username.to_ascii_lowercase(),
            types,
            next_type: 0,
            suspended: HashSet::new(),
            own_ratings: HashMap::new(),
            online: vec![],
            refreshed_at: None,
            records: Records::new(),
            next_allowed: OffsetDateTime::UNIX_EPOCH,
            path: None,
        }
    }

    /// Keeps records in `<dir>/<username>_matchmaking.json`, loading what is already there.
    pub fn with_records_file(mut self, dir: impl AsRef<Path>) -> Self {
        let path = dir
            .as_ref()
            .join(format!("{}_matchmaking.json", self.username));
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Records>(&content) {
                Ok(records) => {
                    info!("loaded {} matchmaking records", records.len());
                    self.records = records;
                }
                Err(e) => warn!("ignoring unreadable {}: {e}", path.display()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not read {}: {e}", path.display()),
        }
        self.path = Some(path);
        self
    }

    /// Settings in use.
    pub fn settings(&self) -> &MatchmakingSettings {
        &self.settings
    }

    /// The list of online bots is missing or older than the refresh interval.
    pub fn needs_refresh(&self, now: OffsetDateTime) -> bool {
        self.refreshed_at
            .is_none_or(|at| now - at >= Duration::seconds(self.settings.refresh as i64))
    }

    /// Replaces the online bots and our ratings. Suspended types get another chance.
    pub fn update_online(
        &mut self,
        now: OffsetDateTime,
        bots: Vec<OnlineBot>,
        own_ratings: HashMap<String, u32>,
    ) {
        debug!("{} bots online", bots.len());
        self.online = bots;
        self.own_ratings = own_ratings;
        self.refreshed_at = Some(now);
        self.suspended.clear();
    }

    /// Next thing to do. A returned challenge is recorded as an attempt.
    pub fn next_action(&mut self, now: OffsetDateTime, registry: &RegistryView) -> Action {
        let retry = now + Duration::seconds(self.settings.retry as i64);
        if now < self.next_allowed {
            return Action::Wait(self.next_allowed);
        }
        if registry.free_slots == 0 || registry.challenge_pending || self.types.is_empty() {
            return Action::Wait(retry);
        }

        for offset in 0..self.types.len() {
            let index = (self.next_type + offset) % self.types.len();
            let kind = self.types[index].clone();
            if self.suspended.contains(&kind.name) {
                continue;
            }
            let own = self.own_ratings.get(&kind.perf).copied().unwrap_or(DEFAULT_RATING);
            let in_range = self.candidates(&kind, own);
            if in_range.is_empty() {
                info!(r#type = %kind.name, "no bot fits this type, suspended until next refresh");
                self.suspended.insert(kind.name.clone());
                continue;
            }
            let best = in_range
                .into_iter()
                .filter(|(bot, _)| !registry.opponents.contains(&bot.id))
                .filter(|(bot, _)| {
                    self.record(&bot.id, &kind.perf)
                        .is_none_or(|r| r.is_released(now))
                })
                .min_by_key(|(bot, rating)| (rating.abs_diff(own), bot.id.clone()));
            let Some((bot, rating)) = best else {
                continue;
            };

            let (opponent_id, opponent) = (bot.id.clone(), bot.username.clone());
            let record = self
                .records
                .entry(opponent_id.clone())
                .or_default()
                .entry(kind.perf.clone())
                .or_insert_with(|| MatchmakingRecord::new(&opponent));
            record.rating = Some(rating);
            record.last_challenged = Some(now);
            let color = record.next_color;

            self.next_type = index + 1;
            self.next_allowed = now + Duration::seconds(self.settings.delay as i64);
            info!(%opponent, rating, r#type = %kind.name, %color, "matchmaking challenge");
            return Action::Challenge(ChallengeTarget {
                opponent,
                opponent_id,
                rating,
                type_name: kind.name,
                perf: kind.perf,
                time_control: kind.time_control,
                rated: kind.rated,
                variant: kind.variant,
                color,
            });
        }
        Action::Wait(retry)
    }

    /// Records how an attempt ended and computes the opponent's cooldown.
    pub fn on_result(
        &mut self,
        now: OffsetDateTime,
        target: &ChallengeTarget,
        outcome: AttemptOutcome,
        played_as: Option<Color>,
    ) {
        let Some((initial, increment)) = self
            .types
            .iter()
            .find(|t| t.name == target.type_name)
            .map(|t| (t.initial, t.increment))
        else {
            return;
        };
        let settings = &self.settings;
        let record = self
            .records
            .entry(target.opponent_id.clone())
            .or_default()
            .entry(target.perf.clone())
            .or_insert_with(|| MatchmakingRecord::new(&target.opponent));

        if outcome.is_game() {
            record.multiplier = 1;
            record.next_color = match played_as {
                Some(Color::White) => Color::Black,
                _ => Color::White,
            };
        } else {
            record.multiplier = (record.multiplier * 2).min(MAX_MULTIPLIER);
            record.next_color = Color::White;
        }
        record.release_at = Some(now + settings.cooldown(initial, increment, record.multiplier));
        record.history.push(outcome);
        if record.history.len() > HISTORY_LEN {
            record.history.remove(0);
        }
        debug!(opponent = %target.opponent, ?outcome, multiplier = record.multiplier, "matchmaking result");

        self.next_allowed = now + Duration::seconds(self.settings.delay as i64);
        self.save();
    }

    /// The service refused because of its rate limit.
    pub fn on_rate_limited(&mut self, now: OffsetDateTime) {
        warn!("rate limited, matchmaking paused");
        self.next_allowed = now + Duration::seconds(self.settings.rate_limit_pause as i64);
    }

    /// Record of an opponent in one perf.
    pub fn record(&self, opponent_id: &str, perf: &str) -> Option<&MatchmakingRecord> {
        self.records.get(opponent_id)?.get(perf)
    }

    /// Bots passing the static filters of `kind`, with their rating.
    fn candidates(&self, kind: &ParsedType, own: u32) -> Vec<(&OnlineBot, u32)> {
        self.online
            .iter()
            .filter(|bot| bot.id != self.username)
            .filter(|bot| {
                !self
                    .settings
                    .blocklist
                    .iter()
                    .any(|b| b.eq_ignore_ascii_case(&bot.id))
            })
            .filter_map(|bot| {
                let rating = bot.ratings.get(&kind.perf).copied().unwrap_or(DEFAULT_RATING);
                let diff = rating.abs_diff(own);
                let fits = kind.min_diff.is_none_or(|min| diff >= min)
                    && kind.max_diff.is_none_or(|max| diff <= max);
                fits.then_some((bot, rating))
            })
            .collect()
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_json::to_string_pretty(&self.records)
            .context("could not serialize records")
            .and_then(|json| {
                std::fs::write(path, json).with_context(|| format!("could not write {}", path.display()))
            });
        if let Err(e) = result {
            warn!("{e:#}");
        }
    }
}
