//! Opening books and the move selector built on top of them.
//!
//! Books are loaded once at startup and shared read-only by every game. For a given game the
//! applicable book list is found with [`ScopeKey`] resolution (see [`crate::scope`]); the
//! first scope with a non-empty list wins. Each book of that list is queried in order,
//! books whose `max_depth` is below the current ply are skipped, and one move is picked
//! among all candidates according to the scope's [`SelectionPolicy`].
//!
//! Randomness only comes from the generator passed by the caller. Games build it with
//! [`book_rng`], so a configured seed gives reproducible selections per game.

mod polyglot;

use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info};

pub use polyglot::PolyglotBook;

use crate::position::GamePosition;
use crate::scope::{ScopeKey, ScopeKind};

/// How one move is picked among the candidates of all books of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Every distinct move has the same chance.
    UniformRandom,
    /// Chance proportional to the move weight, summed over the books offering it.
    #[default]
    WeightedRandom,
    /// Highest weight, ties go to the earliest book of the list.
    BestMove,
}

/// One `(move, weight)` pair stored for a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEntry {
    /// Legal move in the notation of the game.
    pub uci: String,
    /// Polyglot weight.
    pub weight: u32,
}

/// Read-only keyed lookup from a position to its book moves.
pub trait BookStore: Send + Sync {
    /// Moves stored for `position`, legal and normalised. Empty when the position is unknown.
    fn lookup(&self, position: &GamePosition) -> Vec<BookEntry>;
}

/// Book built in memory, keyed by Polyglot hash.
#[derive(Debug, Clone, Default)]
pub struct MemoryBook {
    positions: HashMap<u64, Vec<BookEntry>>,
}

impl MemoryBook {
    /// No books at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `uci` with `weight` for `position`.
    pub fn with_move(mut self, position: &GamePosition, uci: &str, weight: u32) -> Self {
        self.positions
            .entry(position.polyglot_key())
            .or_default()
            .push(BookEntry {
                uci: uci.to_string(),
                weight,
            });
        self
    }
}

impl BookStore for MemoryBook {
    fn lookup(&self, position: &GamePosition) -> Vec<BookEntry> {
        let Some(entries) = self.positions.get(&position.polyglot_key()) else {
            return vec![];
        };
        entries
            .iter()
            .filter(|e| e.weight > 0)
            .filter_map(|e| {
                position.normalize(&e.uci).ok().map(|uci| BookEntry {
                    uci,
                    weight: e.weight,
                })
            })
            .collect()
    }
}

/// A book file declared in the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BookFile {
    /// Polyglot `.bin` file.
    pub path: PathBuf,
    /// Last ply at which the book is still consulted.
    #[serde(default)]
    pub max_depth: Option<u32>,
}

/// Books used for one scope key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookScope {
    /// Names of the books, in priority order.
    pub names: Vec<String>,
    #[serde(default)]
    /// How a move is picked among the books.
    pub selection: SelectionPolicy,
    /// Overrides the books' own depth when lower.
    #[serde(default)]
    pub max_depth: Option<u32>,
}

/// Book section of the configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BookSettings {
    /// Books are skipped when false.
    pub enabled: bool,
    /// Declared books by name.
    pub books: BTreeMap<String, BookFile>,
    /// Book lists by scope key (`standard`, `bullet_black`, `atomic`...).
    pub scopes: BTreeMap<String, BookScope>,
    /// Seed mixed with the game id for reproducible selections.
    pub seed: Option<u64>,
}

/// Move picked from the books.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookMove {
    /// Move in UCI notation.
    pub uci: String,
    /// First book of the list offering the move.
    pub book: String,
    /// Weight used for the decision (summed across books for weighted selection).
    pub weight: u32,
}

struct LoadedBook {
    store: Arc<dyn BookStore>,
    max_depth: Option<u32>,
}

/// All loaded books plus their scopes. Shared read-only between games.
#[derive(Default)]
pub struct OpeningBooks {
    books: HashMap<String, LoadedBook>,
    scopes: BTreeMap<String, BookScope>,
}

impl std::fmt::Debug for OpeningBooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningBooks")
            .field("books", &self.books.keys().collect::<Vec<_>>())
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl OpeningBooks {
    /// No books at all: every selection is a miss.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every book file and checks that scopes only reference known books.
    pub fn load(settings: &BookSettings) -> anyhow::Result<Self> {
        let mut books = OpeningBooks::new();
        if !settings.enabled {
            return Ok(books);
        }
        for (name, file) in &settings.books {
            let store = PolyglotBook::open(&file.path)
                .with_context(|| format!("could not load book '{name}'"))?;
            books = books.with_book(name, store, file.max_depth);
        }
        for (key, scope) in &settings.scopes {
            books = books.with_scope(key, scope.clone());
        }
        books.check()?;
        info!(books = books.books.len(), scopes = books.scopes.len(), "opening books ready");
        Ok(books)
    }

    /// Registers a book under `name`.
    pub fn with_book(
        mut self,
        name: &str,
        store: impl BookStore + 'static,
        max_depth: Option<u32>,
    ) -> Self {
        self.books.insert(
            name.to_string(),
            LoadedBook {
                store: Arc::new(store),
                max_depth,
            },
        );
        self
    }

    /// Registers the book list of a scope key. Empty lists are ignored.
    pub fn with_scope(mut self, key: &str, scope: BookScope) -> Self {
        if scope.names.is_empty() {
            debug!("scope {key} has no book, ignored");
        } else {
            self.scopes.insert(key.to_string(), scope);
        }
        self
    }

    /// Every scope must only name registered books.
    pub fn check(&self) -> anyhow::Result<()> {
        for (key, scope) in &self.scopes {
            for name in &scope.names {
                if !self.books.contains_key(name) {
                    bail!("book scope '{key}' references unknown book '{name}'");
                }
            }
        }
        Ok(())
    }

    /// Scope that applies to a game, with its key.
    pub fn resolve(&self, scope: &ScopeKey) -> Option<(String, &BookScope)> {
        scope.resolve(ScopeKind::Book, &self.scopes)
    }

    /// Picks a book move for `position`, or `None` to let the engine think.
    pub fn select<R: Rng + ?Sized>(
        &self,
        position: &GamePosition,
        ply: u32,
        scope: &ScopeKey,
        rng: &mut R,
    ) -> Option<BookMove> {
        let (key, book_scope) = self.resolve(scope)?;
        let mut candidates = vec![];
        for name in &book_scope.names {
            let Some(book) = self.books.get(name) else {
                continue;
            };
            let depth = match (book.max_depth, book_scope.max_depth) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if depth.is_some_and(|max| ply > max) {
                continue;
            }
            candidates.extend(book.store.lookup(position).into_iter().map(|entry| BookMove {
                uci: entry.uci,
                book: name.clone(),
                weight: entry.weight,
            }));
        }
        let picked = pick(candidates, book_scope.selection, rng);
        if let Some(m) = &picked {
            debug!(scope = %key, book = %m.book, uci = %m.uci, "book move");
        }
        picked
    }
}

/// Applies `policy` to candidates listed in book order.
pub(crate) fn pick<R: Rng + ?Sized>(
    candidates: Vec<BookMove>,
    policy: SelectionPolicy,
    rng: &mut R,
) -> Option<BookMove> {
    if candidates.is_empty() {
        return None;
    }
    match policy {
        SelectionPolicy::BestMove => {
            let mut best: Option<BookMove> = None;
            for c in candidates {
                if best.as_ref().is_none_or(|b| c.weight > b.weight) {
                    best = Some(c);
                }
            }
            best
        }
        SelectionPolicy::UniformRandom => {
            let mut distinct = merge(candidates);
            let index = rng.random_range(0..distinct.len());
            Some(distinct.swap_remove(index))
        }
        SelectionPolicy::WeightedRandom => {
            let mut merged = merge(candidates);
            let total: u64 = merged.iter().map(|m| m.weight as u64).sum();
            if total == 0 {
                return None;
            }
            let mut roll = rng.random_range(0..total);
            let index = merged
                .iter()
                .position(|m| {
                    if roll < m.weight as u64 {
                        true
                    } else {
                        roll -= m.weight as u64;
                        false
                    }
                })
                .unwrap_or(merged.len() - 1);
            Some(merged.swap_remove(index))
        }
    }
}

/// One entry per distinct move, keeping the first book offering it and summing weights.
fn merge(candidates: Vec<BookMove>) -> Vec<BookMove> {
    let mut merged: Vec<BookMove> = vec![];
    for c in candidates {
        match merged.iter_mut().find(|m| m.uci == c.uci) {
            Some(existing) => existing.weight += c.weight,
            None => merged.push(c),
        }
    }
    merged
}

/// Generator used for the book choices of one game.
pub fn book_rng(seed: Option<u64>, game_id: &str) -> StdRng {
    match seed {
        Some(seed) => {
            let mut hasher = DefaultHasher::new();
            game_id.hash(&mut hasher);
            StdRng::seed_from_u64(seed ^ hasher.finish())
        }
        None => StdRng::from_os_rng(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Color, TimeControl, Variant};

    fn start() -> GamePosition {
        GamePosition::new(Variant::Standard, None).unwrap()
    }

    fn bullet_black() -> ScopeKey {
        ScopeKey::new(
            Variant::Standard,
            TimeControl::Clock {
                initial: 60,
                increment: 0,
            },
            Color::Black,
        )
    }

    fn scope(names: &[&str], selection: SelectionPolicy) -> BookScope {
        BookScope {
            names: names.iter().map(|s| s.to_string()).collect(),
            selection,
            max_depth: None,
        }
    }

    fn candidate(uci: &str, book: &str, weight: u32) -> BookMove {
        BookMove {
            uci: uci.into(),
            book: book.into(),
            weight,
        }
    }

    #[test]
    fn best_move_is_deterministic_and_prefers_first_book() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = vec![
            candidate("e2e4", "a", 5),
            candidate("d2d4", "b", 9),
            candidate("c2c4", "c", 9),
        ];
        for _ in 0..10 {
            let m = pick(candidates.clone(), SelectionPolicy::BestMove, &mut rng).unwrap();
            assert_eq!(m.uci, "d2d4");
        }
    }

    #[test]
    fn uniform_is_roughly_uniform() {
        let mut rng = StdRng::seed_from_u64(7);
        let candidates = vec![
            candidate("e2e4", "a", 100),
            candidate("e2e4", "b", 100),
            candidate("d2d4", "a", 1),
            candidate("c2c4", "b", 1),
        ];
        let mut counts = HashMap::new();
        for _ in 0..3000 {
            let m = pick(candidates.clone(), SelectionPolicy::UniformRandom, &mut rng).unwrap();
            *counts.entry(m.uci).or_insert(0) += 1;
        }
        for uci in ["e2e4", "d2d4", "c2c4"] {
            let n = counts[uci];
            assert!((850..1150).contains(&n), "{uci}: {n}");
        }
    }

    #[test]
    fn weights_are_summed_across_books() {
        let mut rng = StdRng::seed_from_u64(3);
        let candidates = vec![
            candidate("e2e4", "a", 1),
            candidate("d2d4", "a", 2),
            candidate("e2e4", "b", 1),
        ];
        let mut e4 = 0;
        for _ in 0..4000 {
            let m = pick(candidates.clone(), SelectionPolicy::WeightedRandom, &mut rng).unwrap();
            if m.uci == "e2e4" {
                assert_eq!(m.book, "a");
                e4 += 1;
            }
        }
        assert!((1800..2200).contains(&e4), "{e4}");
    }

    #[test]
    fn most_specific_scope_wins() {
        let pos = start();
        let books = OpeningBooks::new()
            .with_book("general", MemoryBook::new().with_move(&pos, "e2e4", 1), None)
            .with_book("bullet", MemoryBook::new().with_move(&pos, "g1f3", 1), None)
            .with_scope("standard", scope(&["general"], SelectionPolicy::BestMove))
            .with_scope("bullet_black", scope(&["bullet"], SelectionPolicy::BestMove));
        books.check().unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let m = books.select(&pos, 0, &bullet_black(), &mut rng).unwrap();
        assert_eq!(m.uci, "g1f3");

        let white = ScopeKey::new(Variant::Standard, bullet_black().time_control, Color::White);
        let m = books.select(&pos, 0, &white, &mut rng).unwrap();
        assert_eq!(m.uci, "e2e4");
    }

    #[test]
    fn depth_limit_skips_book() {
        let pos = start();
        let books = OpeningBooks::new()
            .with_book("short", MemoryBook::new().with_move(&pos, "e2e4", 1), Some(0))
            .with_scope("standard", scope(&["short"], SelectionPolicy::BestMove));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(books.select(&pos, 0, &bullet_black(), &mut rng).is_some());
        assert!(books.select(&pos, 1, &bullet_black(), &mut rng).is_none());
    }

    #[test]
    fn unknown_book_is_a_configuration_error() {
        let books = OpeningBooks::new().with_scope("standard", scope(&["missing"], SelectionPolicy::BestMove));
        assert!(books.check().is_err());
    }

    #[test]
    fn seeded_rng_is_reproducible_per_game() {
        let a: u64 = book_rng(Some(42), "game1").random();
        let b: u64 = book_rng(Some(42), "game1").random();
        let c: u64 = book_rng(Some(42), "game2").random();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
