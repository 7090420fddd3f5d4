//! Accept/decline decisions for incoming challenges.
//!
//! [`evaluate`] is a pure function of the offer, a snapshot of the current load and the
//! configured rules. Checks run in a fixed order and the first failing one gives the decline
//! reason:
//!
//! 1. matchmaking mode is active (tournament offers are exempt)
//! 2. variant, time control and rated/casual allow-lists
//! 3. challenger rating range (optionally skipped for casual games)
//! 4. spare capacity, counting slots reserved for tournaments
//! 5. block-list
//!
//! Whitelisted challengers skip the rating and block-list checks only.

use serde::Deserialize;

use crate::types::{GameMode, Speed, TimeControl, Variant};

/// Player sending a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenger {
    /// Lowercase user id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Rating in the challenge's perf.
    pub rating: Option<u32>,
    /// Bots and the service's AI.
    pub is_bot: bool,
}

/// Color asked by the challenger for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRequest {
    /// White side.
    White,
    /// Black side.
    Black,
    /// Side drawn at random.
    Random,
}

/// Incoming challenge, consumed once by [`evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeOffer {
    /// Challenge id.
    pub id: String,
    /// Who sent it.
    pub challenger: Challenger,
    /// Rules of the game.
    pub variant: Variant,
    /// Clock of the game.
    pub time_control: TimeControl,
    /// Side asked for us.
    pub color: ColorRequest,
    /// Whether ratings change.
    pub rated: bool,
    /// Set for games paired by a tournament.
    pub tournament_id: Option<String>,
}

/// Decline reasons understood by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclineReason {
    /// No particular reason.
    Generic,
    /// Busy right now.
    Later,
    /// Clock too short.
    TooFast,
    /// Clock too long.
    TooSlow,
    /// Clock type not accepted.
    TimeControl,
    /// Rated games not accepted.
    Rated,
    /// Casual games not accepted.
    Casual,
    /// Only variants accepted.
    Standard,
    /// Variant not accepted.
    Variant,
    /// Bots not accepted.
    NoBot,
    /// Only bots accepted.
    OnlyBot,
}

impl DeclineReason {
    /// Code sent with the decline request.
    pub fn api_key(self) -> &'static str {
        match self {
            DeclineReason::Generic => "generic",
            DeclineReason::Later => "later",
            DeclineReason::TooFast => "tooFast",
            DeclineReason::TooSlow => "tooSlow",
            DeclineReason::TimeControl => "timeControl",
            DeclineReason::Rated => "rated",
            DeclineReason::Casual => "casual",
            DeclineReason::Standard => "standard",
            DeclineReason::Variant => "variant",
            DeclineReason::NoBot => "noBot",
            DeclineReason::OnlyBot => "onlyBot",
        }
    }
}

impl std::fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_key())
    }
}

/// Outcome of [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Accept the challenge.
    Accept,
    /// Decline with this reason.
    Decline(DeclineReason),
}

/// Snapshot of the session registry taken for one decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Load {
    /// Games being played.
    pub active: usize,
    /// Slots held by accepted challenges and idle tournament reservations.
    pub reserved: usize,
    /// Concurrency cap.
    pub capacity: usize,
    /// Matchmaking mode is on: inbound challenges are paused.
    pub matchmaking: bool,
    /// Tournaments holding an idle reservation.
    pub reserved_tournaments: Vec<String>,
}

impl Load {
    /// Slots neither used nor reserved.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.active + self.reserved)
    }
}

/// Configured acceptance rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChallengeRules {
    /// Accepted variants.
    pub variants: Vec<Variant>,
    /// Accepted speeds.
    pub speeds: Vec<Speed>,
    /// When non-empty, only these `minutes+increment` time controls are accepted.
    pub time_controls: Vec<String>,
    /// Seconds.
    pub min_initial: Option<u32>,
    /// Seconds.
    pub max_initial: Option<u32>,
    /// Seconds.
    pub min_increment: Option<u32>,
    /// Seconds.
    pub max_increment: Option<u32>,
    /// Modes accepted from bots. Empty declines every bot.
    pub bot_modes: Vec<GameMode>,
    /// Modes accepted from humans. Empty declines every human.
    pub human_modes: Vec<GameMode>,
    /// Decline bullet without increment from bots.
    pub bullet_with_increment_only: bool,
    /// Lowest accepted rating.
    pub min_rating: Option<u32>,
    /// Highest accepted rating.
    pub max_rating: Option<u32>,
    /// Casual challenges skip the rating range.
    pub rating_range_casual_exempt: bool,
    /// Declined user ids.
    pub blocklist: Vec<String>,
    /// User ids skipping the rating and block-list checks.
    pub whitelist: Vec<String>,
}

impl Default for ChallengeRules {
    fn default() -> Self {
        ChallengeRules {
            variants: vec![Variant::Standard, Variant::Chess960],
            speeds: vec![Speed::Bullet, Speed::Blitz, Speed::Rapid, Speed::Classical],
            time_controls: vec![],
            min_initial: None,
            max_initial: None,
            min_increment: None,
            max_increment: None,
            bot_modes: vec![GameMode::Rated, GameMode::Casual],
            human_modes: vec![GameMode::Rated, GameMode::Casual],
            bullet_with_increment_only: false,
            min_rating: None,
            max_rating: None,
            rating_range_casual_exempt: false,
            blocklist: vec![],
            whitelist: vec![],
        }
    }
}

impl ChallengeRules {
    /// Checks the time controls listed in the rules.
    pub fn validate(&self) -> anyhow::Result<()> {
        for tc in &self.time_controls {
            tc.parse::<TimeControl>()?;
        }
        Ok(())
    }

    fn is_listed(list: &[String], id: &str) -> bool {
        list.iter().any(|entry| entry.eq_ignore_ascii_case(id))
    }
}

/// Decides whether to accept `offer`.
pub fn evaluate(offer: &ChallengeOffer, load: &Load, rules: &ChallengeRules) -> Verdict {
    match first_failure(offer, load, rules) {
        Some(reason) => Verdict::Decline(reason),
        None => Verdict::Accept,
    }
}

fn first_failure(offer: &ChallengeOffer, load: &Load, rules: &ChallengeRules) -> Option<DeclineReason> {
    let from_tournament = offer.tournament_id.is_some();
    if load.matchmaking && !from_tournament {
        return Some(DeclineReason::Later);
    }

    if let Some(reason) = check_variant(offer.variant, rules)
        .or_else(|| check_time_control(offer, rules))
        .or_else(|| check_mode(offer, rules))
    {
        return Some(reason);
    }

    let whitelisted = ChallengeRules::is_listed(&rules.whitelist, &offer.challenger.id);
    let rating_exempt = whitelisted || (!offer.rated && rules.rating_range_casual_exempt);
    if !rating_exempt {
        if let Some(rating) = offer.challenger.rating {
            let too_low = rules.min_rating.is_some_and(|min| rating < min);
            let too_high = rules.max_rating.is_some_and(|max| rating > max);
            if too_low || too_high {
                return Some(DeclineReason::Generic);
            }
        }
    }

    let has_slot = load.free() > 0
        || offer
            .tournament_id
            .as_ref()
            .is_some_and(|id| load.reserved_tournaments.contains(id));
    if !has_slot {
        return Some(DeclineReason::Later);
    }

    if !whitelisted && ChallengeRules::is_listed(&rules.blocklist, &offer.challenger.id) {
        return Some(DeclineReason::Generic);
    }
    None
}

fn check_variant(variant: Variant, rules: &ChallengeRules) -> Option<DeclineReason> {
    if rules.variants.contains(&variant) {
        None
    } else if rules.variants == [Variant::Standard] {
        Some(DeclineReason::Standard)
    } else {
        Some(DeclineReason::Variant)
    }
}

fn check_time_control(offer: &ChallengeOffer, rules: &ChallengeRules) -> Option<DeclineReason> {
    let speed = offer.time_control.speed();
    let TimeControl::Clock { initial, increment } = offer.time_control else {
        return (!rules.speeds.contains(&Speed::Correspondence)).then_some(DeclineReason::TimeControl);
    };

    if !rules.time_controls.is_empty() {
        let listed = rules
            .time_controls
            .iter()
            .filter_map(|tc| tc.parse::<TimeControl>().ok())
            .any(|tc| tc == offer.time_control);
        if !listed {
            return Some(DeclineReason::TimeControl);
        }
    }

    if !rules.speeds.contains(&speed) {
        let fastest = rules.speeds.iter().min();
        let slowest = rules.speeds.iter().filter(|s| **s != Speed::Correspondence).max();
        return Some(match (fastest, slowest) {
            (Some(fastest), _) if speed < *fastest => DeclineReason::TooFast,
            (_, Some(slowest)) if speed > *slowest => DeclineReason::TooSlow,
            _ => DeclineReason::TimeControl,
        });
    }

    if rules.min_initial.is_some_and(|min| initial < min)
        || rules.min_increment.is_some_and(|min| increment < min)
    {
        return Some(DeclineReason::TooFast);
    }
    if rules.max_initial.is_some_and(|max| initial > max)
        || rules.max_increment.is_some_and(|max| increment > max)
    {
        return Some(DeclineReason::TooSlow);
    }
    if rules.bullet_with_increment_only
        && offer.challenger.is_bot
        && speed == Speed::Bullet
        && increment == 0
    {
        return Some(DeclineReason::TooFast);
    }
    None
}

fn check_mode(offer: &ChallengeOffer, rules: &ChallengeRules) -> Option<DeclineReason> {
    let modes = if offer.challenger.is_bot {
        if rules.bot_modes.is_empty() {
            return Some(DeclineReason::NoBot);
        }
        &rules.bot_modes
    } else {
        if rules.human_modes.is_empty() {
            return Some(DeclineReason::OnlyBot);
        }
        &rules.human_modes
    };
    match GameMode::from_rated(offer.rated) {
        mode if modes.contains(&mode) => None,
        GameMode::Rated => Some(DeclineReason::Casual),
        GameMode::Casual => Some(DeclineReason::Rated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> ChallengeOffer {
        ChallengeOffer {
            id: "abcd1234".into(),
            challenger: Challenger {
                id: "somebot".into(),
                name: "SomeBot".into(),
                rating: Some(2000),
                is_bot: true,
            },
            variant: Variant::Standard,
            time_control: TimeControl::Clock {
                initial: 180,
                increment: 2,
            },
            color: ColorRequest::Random,
            rated: true,
            tournament_id: None,
        }
    }

    fn load() -> Load {
        Load {
            active: 0,
            reserved: 0,
            capacity: 2,
            matchmaking: false,
            reserved_tournaments: vec![],
        }
    }

    #[test]
    fn accepts_by_default() {
        assert_eq!(evaluate(&offer(), &load(), &ChallengeRules::default()), Verdict::Accept);
    }

    #[test]
    fn same_inputs_same_verdict() {
        let rules = ChallengeRules {
            max_rating: Some(1500),
            ..ChallengeRules::default()
        };
        let first = evaluate(&offer(), &load(), &rules);
        for _ in 0..10 {
            assert_eq!(evaluate(&offer(), &load(), &rules), first);
        }
    }

    #[test]
    fn matchmaking_mode_declines_except_tournaments() {
        let load = Load {
            matchmaking: true,
            ..load()
        };
        let rules = ChallengeRules::default();
        assert_eq!(evaluate(&offer(), &load, &rules), Verdict::Decline(DeclineReason::Later));
        let tournament = ChallengeOffer {
            tournament_id: Some("t1".into()),
            ..offer()
        };
        assert_eq!(evaluate(&tournament, &load, &rules), Verdict::Accept);
    }

    #[test]
    fn allow_list_reasons() {
        let rules = ChallengeRules {
            variants: vec![Variant::Standard],
            speeds: vec![Speed::Blitz],
            ..ChallengeRules::default()
        };
        let atomic = ChallengeOffer {
            variant: Variant::Atomic,
            ..offer()
        };
        assert_eq!(evaluate(&atomic, &load(), &rules), Verdict::Decline(DeclineReason::Standard));

        let bullet = ChallengeOffer {
            time_control: TimeControl::Clock {
                initial: 60,
                increment: 0,
            },
            ..offer()
        };
        assert_eq!(evaluate(&bullet, &load(), &rules), Verdict::Decline(DeclineReason::TooFast));

        let rapid = ChallengeOffer {
            time_control: TimeControl::Clock {
                initial: 900,
                increment: 10,
            },
            ..offer()
        };
        assert_eq!(evaluate(&rapid, &load(), &rules), Verdict::Decline(DeclineReason::TooSlow));

        let corres = ChallengeOffer {
            time_control: TimeControl::Correspondence(3),
            ..offer()
        };
        assert_eq!(
            evaluate(&corres, &load(), &rules),
            Verdict::Decline(DeclineReason::TimeControl)
        );

        let listed = ChallengeRules {
            time_controls: vec!["3+0".into()],
            ..ChallengeRules::default()
        };
        assert_eq!(
            evaluate(&offer(), &load(), &listed),
            Verdict::Decline(DeclineReason::TimeControl)
        );
    }

    #[test]
    fn mode_reasons() {
        let rules = ChallengeRules {
            bot_modes: vec![GameMode::Casual],
            human_modes: vec![],
            ..ChallengeRules::default()
        };
        assert_eq!(evaluate(&offer(), &load(), &rules), Verdict::Decline(DeclineReason::Casual));
        let human = ChallengeOffer {
            challenger: Challenger {
                is_bot: false,
                ..offer().challenger
            },
            ..offer()
        };
        assert_eq!(evaluate(&human, &load(), &rules), Verdict::Decline(DeclineReason::OnlyBot));

        let no_bots = ChallengeRules {
            bot_modes: vec![],
            ..ChallengeRules::default()
        };
        assert_eq!(evaluate(&offer(), &load(), &no_bots), Verdict::Decline(DeclineReason::NoBot));
    }

    #[test]
    fn rating_range_and_exemptions() {
        let rules = ChallengeRules {
            max_rating: Some(1800),
            rating_range_casual_exempt: true,
            ..ChallengeRules::default()
        };
        assert_eq!(evaluate(&offer(), &load(), &rules), Verdict::Decline(DeclineReason::Generic));
        let casual = ChallengeOffer {
            rated: false,
            ..offer()
        };
        assert_eq!(evaluate(&casual, &load(), &rules), Verdict::Accept);

        let whitelisted = ChallengeRules {
            whitelist: vec!["SomeBot".into()],
            blocklist: vec!["somebot".into()],
            ..rules
        };
        assert_eq!(evaluate(&offer(), &load(), &whitelisted), Verdict::Accept);
    }

    #[test]
    fn capacity_counts_reservations() {
        let full = Load {
            active: 1,
            reserved: 1,
            reserved_tournaments: vec!["t1".into()],
            ..load()
        };
        let rules = ChallengeRules::default();
        assert_eq!(evaluate(&offer(), &full, &rules), Verdict::Decline(DeclineReason::Later));
        let tournament = ChallengeOffer {
            tournament_id: Some("t1".into()),
            ..offer()
        };
        assert_eq!(evaluate(&tournament, &full, &rules), Verdict::Accept);
    }

    #[test]
    fn capacity_is_checked_before_blocklist() {
        let rules = ChallengeRules {
            blocklist: vec!["somebot".into()],
            ..ChallengeRules::default()
        };
        assert_eq!(evaluate(&offer(), &load(), &rules), Verdict::Decline(DeclineReason::Generic));
        let full = Load {
            active: 2,
            ..load()
        };
        assert_eq!(evaluate(&offer(), &full, &rules), Verdict::Decline(DeclineReason::Later));
    }

    #[test]
    fn bullet_needs_increment_against_bots() {
        let rules = ChallengeRules {
            bullet_with_increment_only: true,
            ..ChallengeRules::default()
        };
        let bullet = ChallengeOffer {
            time_control: TimeControl::Clock {
                initial: 60,
                increment: 0,
            },
            ..offer()
        };
        assert_eq!(evaluate(&bullet, &load(), &rules), Verdict::Decline(DeclineReason::TooFast));
    }
}
