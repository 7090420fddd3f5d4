//! Vocabulary shared by every layer: colors, variants, speeds and time controls.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Side of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Moves first.
    White,
    /// Moves second.
    Black,
}

impl Color {
    /// The other side.
    pub fn opposite(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Lowercase name used in configuration keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Color::White => "white",
            Color::Black => "black",
        }
    }
}

impl Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<shakmaty::Color> for Color {
    fn from(value: shakmaty::Color) -> Self {
        match value {
            shakmaty::Color::White => Color::White,
            shakmaty::Color::Black => Color::Black,
        }
    }
}

/// Rule set of a game, using the remote service's variant keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Variant {
    /// Regular chess.
    Standard,
    /// Shuffled back rank.
    Chess960,
    /// Standard rules from a custom position.
    FromPosition,
    /// Captures are forced and losing every piece wins.
    Antichess,
    /// Captures explode the surrounding pieces.
    Atomic,
    /// Captured pieces can be dropped back.
    Crazyhouse,
    /// White has a horde of pawns and no king.
    Horde,
    /// Reaching the center with the king wins.
    KingOfTheHill,
    /// First king on the last rank wins.
    RacingKings,
    /// Three checks win.
    ThreeCheck,
}

impl Variant {
    /// Every variant the remote service knows about.
    pub const ALL: [Variant; 10] = [
        Variant::Standard,
        Variant::Chess960,
        Variant::FromPosition,
        Variant::Antichess,
        Variant::Atomic,
        Variant::Crazyhouse,
        Variant::Horde,
        Variant::KingOfTheHill,
        Variant::RacingKings,
        Variant::ThreeCheck,
    ];

    /// Key as sent by the remote service (`kingOfTheHill`, `threeCheck`...).
    pub fn api_key(self) -> &'static str {
        match self {
            Variant::Standard => "standard",
            Variant::Chess960 => "chess960",
            Variant::FromPosition => "fromPosition",
            Variant::Antichess => "antichess",
            Variant::Atomic => "atomic",
            Variant::Crazyhouse => "crazyhouse",
            Variant::Horde => "horde",
            Variant::KingOfTheHill => "kingOfTheHill",
            Variant::RacingKings => "racingKings",
            Variant::ThreeCheck => "threeCheck",
        }
    }

    /// Lowercase key used in book and engine scopes.
    pub fn scope_name(self) -> String {
        self.api_key().to_ascii_lowercase()
    }

    /// Variants played with the regular rules of chess.
    pub fn is_standard_rules(self) -> bool {
        matches!(self, Variant::Standard | Variant::FromPosition)
    }

    /// Name given to the engine through `UCI_Variant`, `None` for regular chess.
    pub fn uci_name(self) -> Option<&'static str> {
        match self {
            Variant::Standard | Variant::FromPosition | Variant::Chess960 => None,
            Variant::Antichess => Some("antichess"),
            Variant::Atomic => Some("atomic"),
            Variant::Crazyhouse => Some("crazyhouse"),
            Variant::Horde => Some("horde"),
            Variant::KingOfTheHill => Some("kingofthehill"),
            Variant::RacingKings => Some("racingkings"),
            Variant::ThreeCheck => Some("3check"),
        }
    }
}

impl Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_key())
    }
}

impl FromStr for Variant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Variant::ALL
            .into_iter()
            .find(|v| v.api_key().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown variant '{s}'"))
    }
}

/// Time control class, derived from the estimated game duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Speed {
    /// Under 30 seconds.
    UltraBullet,
    /// Under 3 minutes.
    Bullet,
    /// Under 8 minutes.
    Blitz,
    /// Under 25 minutes.
    Rapid,
    /// 25 minutes and more.
    Classical,
    /// Days per move.
    Correspondence,
}

impl Speed {
    /// Classifies a clock using `initial + 40 * increment` seconds.
    pub fn from_clock(initial_secs: u32, increment_secs: u32) -> Speed {
        let estimate = initial_secs + 40 * increment_secs;
        match estimate {
            0..=29 => Speed::UltraBullet,
            30..=179 => Speed::Bullet,
            180..=479 => Speed::Blitz,
            480..=1499 => Speed::Rapid,
            _ => Speed::Classical,
        }
    }

    /// Lowercase key used in book and engine scopes.
    pub fn as_str(self) -> &'static str {
        match self {
            Speed::UltraBullet => "ultrabullet",
            Speed::Bullet => "bullet",
            Speed::Blitz => "blitz",
            Speed::Rapid => "rapid",
            Speed::Classical => "classical",
            Speed::Correspondence => "correspondence",
        }
    }
}

impl Display for Speed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Speed {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "ultrabullet" => Speed::UltraBullet,
            "bullet" => Speed::Bullet,
            "blitz" => Speed::Blitz,
            "rapid" => Speed::Rapid,
            "classical" => Speed::Classical,
            "correspondence" => Speed::Correspondence,
            _ => bail!("unknown speed '{s}'"),
        })
    }
}

/// Clock of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeControl {
    /// Real-time clock, both values in seconds.
    Clock {
        /// Initial time in seconds.
        initial: u32,
        /// Increment in seconds.
        increment: u32,
    },
    /// Days per move.
    Correspondence(u32),
    /// No clock at all.
    Unlimited,
}

impl TimeControl {
    /// Speed class of this time control.
    pub fn speed(&self) -> Speed {
        match *self {
            TimeControl::Clock { initial, increment } => Speed::from_clock(initial, increment),
            TimeControl::Correspondence(_) | TimeControl::Unlimited => Speed::Correspondence,
        }
    }

    /// `minutes+increment`, e.g. `1+0`, `0.5+0` or `3+2`. `None` without a clock.
    pub fn key(&self) -> Option<String> {
        match *self {
            TimeControl::Clock { initial, increment } => {
                let minutes = if initial % 60 == 0 {
                    (initial / 60).to_string()
                } else {
                    format!("{}", initial as f32 / 60.0)
                };
                Some(format!("{minutes}+{increment}"))
            }
            _ => None,
        }
    }
}

impl Display for TimeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeControl::Clock { .. } => write!(f, "{}", self.key().unwrap_or_default()),
            TimeControl::Correspondence(days) => write!(f, "{days}d"),
            TimeControl::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl FromStr for TimeControl {
    type Err = anyhow::Error;

    /// Parses `minutes+increment` where minutes may be fractional (`0.25+0`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((minutes, increment)) = s.trim().split_once('+') else {
            bail!("time control '{s}' must look like 'minutes+increment'");
        };
        let minutes: f32 = minutes.parse()?;
        let increment: u32 = increment.parse()?;
        if minutes < 0.0 {
            bail!("negative initial time in '{s}'");
        }
        Ok(TimeControl::Clock {
            initial: (minutes * 60.0).round() as u32,
            increment,
        })
    }
}

/// Rated or casual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    /// Ratings change.
    Rated,
    /// Ratings stay.
    Casual,
}

impl GameMode {
    /// Mode of a game from its `rated` flag.
    pub fn from_rated(rated: bool) -> GameMode {
        if rated {
            GameMode::Rated
        } else {
            GameMode::Casual
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_boundaries() {
        assert_eq!(Speed::from_clock(15, 0), Speed::UltraBullet);
        assert_eq!(Speed::from_clock(60, 0), Speed::Bullet);
        assert_eq!(Speed::from_clock(120, 1), Speed::Bullet);
        assert_eq!(Speed::from_clock(180, 2), Speed::Blitz);
        assert_eq!(Speed::from_clock(180, 0), Speed::Blitz);
        assert_eq!(Speed::from_clock(600, 0), Speed::Rapid);
        assert_eq!(Speed::from_clock(1800, 0), Speed::Classical);
    }

    #[test]
    fn time_control_keys() {
        let tc: TimeControl = "0.5+0".parse().unwrap();
        assert_eq!(
            tc,
            TimeControl::Clock {
                initial: 30,
                increment: 0
            }
        );
        assert_eq!(tc.key().as_deref(), Some("0.5+0"));
        let tc: TimeControl = "3+2".parse().unwrap();
        assert_eq!(tc.key().as_deref(), Some("3+2"));
        assert!("3".parse::<TimeControl>().is_err());
        assert_eq!(TimeControl::Unlimited.key(), None);
    }

    #[test]
    fn variant_keys() {
        assert_eq!("kingOfTheHill".parse::<Variant>().unwrap(), Variant::KingOfTheHill);
        assert_eq!("threecheck".parse::<Variant>().unwrap(), Variant::ThreeCheck);
        assert_eq!(Variant::RacingKings.scope_name(), "racingkings");
        assert!(Variant::FromPosition.is_standard_rules());
        assert!(!Variant::Chess960.is_standard_rules());
    }
}
