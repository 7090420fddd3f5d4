//! Board state of a running game.
//!
//! The remote service only sends the full list of moves played so far, so a [`GamePosition`]
//! keeps that list and replays the new suffix on each update. Positions are tracked with
//! `shakmaty`, which also provides the Polyglot hash used by opening books.

use anyhow::{anyhow, bail, Context};
use shakmaty::{
    fen::Fen,
    uci::UciMove,
    variant::{Variant as RuleSet, VariantPosition},
    zobrist::{Zobrist64, ZobristHash},
    CastlingMode, EnPassantMode, Move, Position,
};

use crate::types::{Color, Variant};

/// Current position of a game plus the moves that led to it.
#[derive(Debug, Clone)]
pub struct GamePosition {
    variant: Variant,
    initial_fen: Option<String>,
    castling_mode: CastlingMode,
    position: VariantPosition,
    moves: Vec<String>,
}

impl GamePosition {
    /// Start position of `variant`, or `initial_fen` when it is given and not `startpos`.
    pub fn new(variant: Variant, initial_fen: Option<&str>) -> anyhow::Result<Self> {
        let rules = rule_set(variant);
        let castling_mode = if variant == Variant::Chess960 {
            CastlingMode::Chess960
        } else {
            CastlingMode::Standard
        };
        let initial_fen = initial_fen
            .map(str::trim)
            .filter(|fen| !fen.is_empty() && *fen != "startpos")
            .map(str::to_string);

        let position = match &initial_fen {
            None => VariantPosition::new(rules),
            Some(fen) => {
                let fen: Fen = fen
                    .parse()
                    .map_err(|e| anyhow!("invalid FEN '{fen}': {e}"))?;
                VariantPosition::from_setup(rules, fen.into_setup(), castling_mode)
                    .map_err(|e| anyhow!("illegal initial position: {e}"))?
            }
        };

        Ok(GamePosition {
            variant,
            initial_fen,
            castling_mode,
            position,
            moves: vec![],
        })
    }

    /// Rule set of the game.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Number of half-moves played.
    pub fn ply(&self) -> u32 {
        self.moves.len() as u32
    }

    /// Side to move.
    pub fn turn(&self) -> Color {
        self.position.turn().into()
    }

    /// Moves played so far, as received.
    pub fn moves(&self) -> &[String] {
        &self.moves
    }

    /// Plays one move given in UCI notation.
    pub fn push_uci(&mut self, uci: &str) -> anyhow::Result<()> {
        let m = self.parse_move(uci)?;
        self.position.play_unchecked(&m);
        self.moves.push(uci.to_string());
        Ok(())
    }

    /// Brings the position up to date with the complete move list of the game.
    ///
    /// Only moves beyond the current ply are played. Returns how many were new, 0 for a
    /// list that is a prefix of the known moves (a late duplicate).
    /// Fails if the list disagrees with what was already played.
    pub fn apply_move_list<S: AsRef<str>>(&mut self, moves: &[S]) -> anyhow::Result<usize> {
        for (known, received) in self.moves.iter().zip(moves) {
            if known != received.as_ref() {
                bail!("move list diverged at '{}'", received.as_ref());
            }
        }
        if moves.len() <= self.moves.len() {
            return Ok(0);
        }
        let new = &moves[self.moves.len()..];
        for uci in new {
            self.push_uci(uci.as_ref())
                .with_context(|| format!("could not replay move {}", self.moves.len() + 1))?;
        }
        Ok(new.len())
    }

    /// Whether `uci` is a legal move in the current position.
    pub fn is_legal(&self, uci: &str) -> bool {
        self.parse_move(uci).is_ok()
    }

    /// Rewrites a legal move in the notation the remote service and engine expect for this game.
    ///
    /// Castling is king-to-destination in regular games and king-to-rook in Chess960.
    pub fn normalize(&self, uci: &str) -> anyhow::Result<String> {
        let m = self.parse_move(uci)?;
        Ok(self.to_uci(&m))
    }

    /// Polyglot hash of the current position.
    pub fn polyglot_key(&self) -> u64 {
        let hash: Zobrist64 = match &self.position {
            VariantPosition::Chess(pos) => pos.zobrist_hash(EnPassantMode::Legal),
            VariantPosition::Antichess(pos) => pos.zobrist_hash(EnPassantMode::Legal),
            VariantPosition::Atomic(pos) => pos.zobrist_hash(EnPassantMode::Legal),
            VariantPosition::Crazyhouse(pos) => pos.zobrist_hash(EnPassantMode::Legal),
            VariantPosition::Horde(pos) => pos.zobrist_hash(EnPassantMode::Legal),
            VariantPosition::KingOfTheHill(pos) => pos.zobrist_hash(EnPassantMode::Legal),
            VariantPosition::RacingKings(pos) => pos.zobrist_hash(EnPassantMode::Legal),
            VariantPosition::ThreeCheck(pos) => pos.zobrist_hash(EnPassantMode::Legal),
        };
        hash.0
    }

    /// `position ...` command describing this position to a UCI engine.
    pub fn uci_command(&self) -> String {
        let mut command = match &self.initial_fen {
            None => String::from("position startpos"),
            Some(fen) => format!("position fen {fen}"),
        };
        if !self.moves.is_empty() {
            command.push_str(" moves ");
            command.push_str(&self.moves.join(" "));
        }
        command
    }

    /// First legal move, for when the engine gives no answer.
    pub fn any_legal_move(&self) -> Option<String> {
        self.position.legal_moves().first().map(|m| self.to_uci(m))
    }

    fn to_uci(&self, m: &Move) -> String {
        UciMove::from_move(m, self.castling_mode).to_string()
    }

    fn parse_move(&self, uci: &str) -> anyhow::Result<Move> {
        let parsed: UciMove = uci
            .parse()
            .map_err(|e| anyhow!("invalid UCI move '{uci}': {e}"))?;
        parsed
            .to_move(&self.position)
            .map_err(|e| anyhow!("illegal move '{uci}': {e}"))
    }
}

fn rule_set(variant: Variant) -> RuleSet {
    match variant {
        Variant::Standard | Variant::Chess960 | Variant::FromPosition => RuleSet::Chess,
        Variant::Antichess => RuleSet::Antichess,
        Variant::Atomic => RuleSet::Atomic,
        Variant::Crazyhouse => RuleSet::Crazyhouse,
        Variant::Horde => RuleSet::Horde,
        Variant::KingOfTheHill => RuleSet::KingOfTheHill,
        Variant::RacingKings => RuleSet::RacingKings,
        Variant::ThreeCheck => RuleSet::ThreeCheck,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_polyglot_key() {
        let pos = GamePosition::new(Variant::Standard, None).unwrap();
        assert_eq!(pos.polyglot_key(), 0x463b96181691fc9c);
        assert_eq!(pos.turn(), Color::White);
        assert_eq!(pos.uci_command(), "position startpos");
    }

    #[test]
    fn known_polyglot_keys_after_moves() {
        let mut pos = GamePosition::new(Variant::Standard, Some("startpos")).unwrap();
        pos.push_uci("e2e4").unwrap();
        assert_eq!(pos.polyglot_key(), 0x823c9b50fd114196);
        pos.push_uci("d7d5").unwrap();
        assert_eq!(pos.polyglot_key(), 0x0756b94461c50fb0);
        assert_eq!(pos.ply(), 2);
        assert_eq!(pos.turn(), Color::White);
        assert_eq!(pos.uci_command(), "position startpos moves e2e4 d7d5");
    }

    #[test]
    fn sync_only_plays_new_moves() {
        let mut pos = GamePosition::new(Variant::Standard, None).unwrap();
        assert_eq!(pos.apply_move_list(&["e2e4"]).unwrap(), 1);
        assert_eq!(pos.apply_move_list(&["e2e4"]).unwrap(), 0);
        assert_eq!(pos.apply_move_list(&["e2e4", "e7e5", "g1f3"]).unwrap(), 2);
        assert!(pos.apply_move_list(&["d2d4"]).is_err());
        assert!(pos.apply_move_list(&["d2d4", "e7e5", "g1f3", "b8c6"]).is_err());
        assert_eq!(pos.ply(), 3);
    }

    #[test]
    fn shorter_known_prefix_is_ignored() {
        let mut pos = GamePosition::new(Variant::Standard, None).unwrap();
        pos.apply_move_list(&["e2e4", "e7e5", "g1f3"]).unwrap();
        assert_eq!(pos.apply_move_list(&["e2e4"]).unwrap(), 0);
        assert_eq!(pos.apply_move_list::<&str>(&[]).unwrap(), 0);
        assert_eq!(pos.ply(), 3);
        assert!(pos.apply_move_list(&["e2e4", "c7c5"]).is_err());
    }

    #[test]
    fn rejects_illegal_moves() {
        let mut pos = GamePosition::new(Variant::Standard, None).unwrap();
        assert!(pos.push_uci("e2e5").is_err());
        assert!(pos.push_uci("garbage").is_err());
        assert!(!pos.is_legal("e1g1"));
        assert!(pos.is_legal("g1f3"));
    }

    #[test]
    fn castling_notation_follows_the_variant() {
        let fen = "r3k2r/8/8/8/8/8/8/R3K2R w KQkq - 0 1";
        let pos = GamePosition::new(Variant::FromPosition, Some(fen)).unwrap();
        assert_eq!(pos.normalize("e1h1").unwrap(), "e1g1");
        assert_eq!(pos.uci_command(), format!("position fen {fen}"));
    }

    #[test]
    fn fallback_move_only_when_one_exists() {
        let pos = GamePosition::new(Variant::Standard, None).unwrap();
        assert!(pos.any_legal_move().is_some_and(|m| pos.is_legal(&m)));
        let mated = "rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3";
        let pos = GamePosition::new(Variant::FromPosition, Some(mated)).unwrap();
        assert_eq!(pos.any_legal_move(), None);
    }
}
