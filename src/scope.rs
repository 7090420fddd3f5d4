//! Resolution of configuration scopes for books and engines.
//!
//! A scope key is the name of a configuration entry such as `bullet_black`, `atomic_white`
//! or `standard`. For a given game, candidates are tried from the most specific to the most
//! generic and the first one present in the configuration wins:
//!
//! | Regular chess       | Other variants `V`          |
//! |---------------------|-----------------------------|
//! | `{tc}_{color}`      | `V_{speed}_{color}`         |
//! | `{speed}_{color}`   | `V_{color}`                 |
//! | `{color}`           | `V_{speed}`                 |
//! | `{tc}`              | `V`                         |
//! | `{speed}`           | `variants_{color}`          |
//! | `standard`          | `variants`                  |
//!
//! Engines always end with the generic `{color}` and `standard` entries. Books for
//! non-standard variants only do so for Chess960, whose positions can occur in regular books.
//!
//! Games against humans and tournament games try each candidate with the `human` and
//! `tournament` tags first: `bullet_black_human`, then `bullet_black`, and so on.

use std::collections::BTreeMap;

use crate::types::{Color, Speed, TimeControl, Variant};

/// Everything needed to resolve a scope for one game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeKey {
    /// Rules of the game.
    pub variant: Variant,
    /// Speed class derived from the time control.
    pub speed: Speed,
    /// Side we play.
    pub color: Color,
    /// Clock of the game.
    pub time_control: TimeControl,
    /// The opponent is not a bot.
    pub human: bool,
    /// The game belongs to a tournament.
    pub tournament: bool,
}

/// Which kind of configuration is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Opening book scopes.
    Book,
    /// Engine settings.
    Engine,
}

impl ScopeKey {
    /// Key of a bot-vs-bot game outside tournaments.
    pub fn new(variant: Variant, time_control: TimeControl, color: Color) -> Self {
        ScopeKey {
            variant,
            speed: time_control.speed(),
            color,
            time_control,
            human: false,
            tournament: false,
        }
    }

    /// Marks a game against a human.
    #[must_use]
    pub fn with_human(self, human: bool) -> Self {
        Self { human, ..self }
    }

    /// Marks a tournament game.
    #[must_use]
    pub fn with_tournament(self, tournament: bool) -> Self {
        Self { tournament, ..self }
    }

    /// Ordered list of candidate entry names, most specific first.
    pub fn candidates(&self, kind: ScopeKind) -> Vec<String> {
        let mut tags = vec![];
        if self.human {
            tags.push("human");
        }
        if self.tournament {
            tags.push("tournament");
        }
        let suffixes = match tags.as_slice() {
            [a, b] => vec![format!("{a}_{b}"), format!("{b}_{a}"), a.to_string(), b.to_string()],
            _ => tags.iter().map(|t| t.to_string()).collect(),
        };
        self.untagged_candidates(kind)
            .into_iter()
            .flat_map(|name| {
                let mut names: Vec<String> = suffixes.iter().map(|s| format!("{name}_{s}")).collect();
                names.push(name);
                names
            })
            .collect()
    }

    fn untagged_candidates(&self, kind: ScopeKind) -> Vec<String> {
        let color = self.color.as_str();
        let speed = self.speed.as_str();
        let mut out = Vec::with_capacity(8);

        if self.variant.is_standard_rules() {
            if let Some(tc) = self.time_control.key() {
                out.push(format!("{tc}_{color}"));
            }
            out.push(format!("{speed}_{color}"));
            out.push(color.to_string());
            if let Some(tc) = self.time_control.key() {
                out.push(tc);
            }
            out.push(speed.to_string());
            out.push("standard".to_string());
            return out;
        }

        let variant = self.variant.scope_name();
        out.push(format!("{variant}_{speed}_{color}"));
        out.push(format!("{variant}_{color}"));
        out.push(format!("{variant}_{speed}"));
        out.push(variant);
        if self.variant != Variant::Chess960 {
            out.push(format!("variants_{color}"));
            out.push("variants".to_string());
        }
        if kind == ScopeKind::Engine || self.variant == Variant::Chess960 {
            out.push(color.to_string());
            out.push("standard".to_string());
        }
        out
    }

    /// First candidate present in `entries`, with its name.
    pub fn resolve<'a, T>(&self, kind: ScopeKind, entries: &'a BTreeMap<String, T>) -> Option<(String, &'a T)> {
        self.candidates(kind)
            .into_iter()
            .find_map(|name| entries.get(&name).map(|value| (name, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bullet() -> TimeControl {
        TimeControl::Clock {
            initial: 60,
            increment: 0,
        }
    }

    #[test]
    fn standard_order() {
        let key = ScopeKey::new(Variant::Standard, bullet(), Color::Black);
        assert_eq!(
            key.candidates(ScopeKind::Book),
            vec!["1+0_black", "bullet_black", "black", "1+0", "bullet", "standard"]
        );
    }

    #[test]
    fn specific_entry_wins() {
        let mut entries = BTreeMap::new();
        entries.insert("standard".to_string(), 1);
        entries.insert("bullet_black".to_string(), 2);
        let key = ScopeKey::new(Variant::Standard, bullet(), Color::Black);
        assert_eq!(key.resolve(ScopeKind::Book, &entries), Some(("bullet_black".to_string(), &2)));

        let key = ScopeKey::new(Variant::Standard, bullet(), Color::White);
        assert_eq!(key.resolve(ScopeKind::Book, &entries), Some(("standard".to_string(), &1)));
    }

    #[test]
    fn variants_do_not_use_regular_books() {
        let mut entries = BTreeMap::new();
        entries.insert("standard".to_string(), 1);
        let key = ScopeKey::new(Variant::Atomic, bullet(), Color::White);
        assert_eq!(key.resolve(ScopeKind::Book, &entries), None);
        assert_eq!(key.resolve(ScopeKind::Engine, &entries), Some(("standard".to_string(), &1)));

        entries.insert("variants".to_string(), 3);
        assert_eq!(key.resolve(ScopeKind::Book, &entries), Some(("variants".to_string(), &3)));

        let key = ScopeKey::new(Variant::Chess960, bullet(), Color::White);
        assert_eq!(key.resolve(ScopeKind::Book, &entries), Some(("standard".to_string(), &1)));
    }

    #[test]
    fn human_and_tournament_tags_come_first() {
        let key = ScopeKey::new(Variant::Standard, bullet(), Color::Black).with_human(true);
        assert_eq!(
            &key.candidates(ScopeKind::Book)[..4],
            ["1+0_black_human", "1+0_black", "bullet_black_human", "bullet_black"]
        );

        let key = key.with_tournament(true);
        let names = key.candidates(ScopeKind::Engine);
        assert_eq!(
            &names[..5],
            [
                "1+0_black_human_tournament",
                "1+0_black_tournament_human",
                "1+0_black_human",
                "1+0_black_tournament",
                "1+0_black"
            ]
        );
        assert_eq!(names.last().map(String::as_str), Some("standard"));

        let mut entries = BTreeMap::new();
        entries.insert("standard".to_string(), 1);
        entries.insert("standard_tournament".to_string(), 2);
        assert_eq!(key.resolve(ScopeKind::Engine, &entries), Some(("standard_tournament".to_string(), &2)));
        let bots = ScopeKey::new(Variant::Standard, bullet(), Color::Black);
        assert_eq!(bots.resolve(ScopeKind::Engine, &entries), Some(("standard".to_string(), &1)));
    }
}
