use std::path::Path;

use anyhow::{bail, Context};
use tracing::{debug, trace};

use super::{BookEntry, BookStore};
use crate::position::GamePosition;

const ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawEntry {
    key: u64,
    mv: u16,
    weight: u16,
}

/// Polyglot `.bin` book held in memory.
///
/// Entries are 16 bytes, big-endian: key `u64`, move `u16`, weight `u16`, learn `u32`.
#[derive(Debug, Clone)]
pub struct PolyglotBook {
    entries: Vec<RawEntry>,
}

impl PolyglotBook {
    /// Reads a whole book file.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("could not read book {}", path.display()))?;
        let book = Self::from_bytes(&bytes)
            .with_context(|| format!("invalid polyglot book {}", path.display()))?;
        debug!(path = %path.display(), entries = book.len(), "book loaded");
        Ok(book)
    }

    /// Parses raw book bytes. Entries don't need to be sorted.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() % ENTRY_SIZE != 0 {
            bail!("size {} is not a multiple of {ENTRY_SIZE}", bytes.len());
        }
        let mut entries = bytes
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| {
                let mut key = [0u8; 8];
                key.copy_from_slice(&chunk[0..8]);
                RawEntry {
                    key: u64::from_be_bytes(key),
                    mv: u16::from_be_bytes([chunk[8], chunk[9]]),
                    weight: u16::from_be_bytes([chunk[10], chunk[11]]),
                }
            })
            .collect::<Vec<_>>();
        // stable: keeps the file order of moves sharing a key
        entries.sort_by_key(|e| e.key);
        Ok(PolyglotBook { entries })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn raw(&self, key: u64) -> &[RawEntry] {
        let start = self.entries.partition_point(|e| e.key < key);
        let end = self.entries.partition_point(|e| e.key <= key);
        &self.entries[start..end]
    }
}

impl BookStore for PolyglotBook {
    fn lookup(&self, position: &GamePosition) -> Vec<BookEntry> {
        self.raw(position.polyglot_key())
            .iter()
            .filter(|raw| raw.weight > 0)
            .filter_map(|raw| {
                let uci = decode_move(raw.mv);
                match position.normalize(&uci) {
                    Ok(uci) => Some(BookEntry {
                        uci,
                        weight: raw.weight as u32,
                    }),
                    Err(e) => {
                        trace!("skipping book move {uci}: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Polyglot move bits: to file 0-2, to rank 3-5, from file 6-8, from rank 9-11,
/// promotion 12-14. Castling is stored as king takes rook.
fn decode_move(mv: u16) -> String {
    let square = |file: u16, rank: u16| {
        format!(
            "{}{}",
            (b'a' + file as u8) as char,
            (b'1' + rank as u8) as char
        )
    };
    let to = square(mv & 7, (mv >> 3) & 7);
    let from = square((mv >> 6) & 7, (mv >> 9) & 7);
    let promotion = match (mv >> 12) & 7 {
        1 => "n",
        2 => "b",
        3 => "r",
        4 => "q",
        _ => "",
    };
    format!("{from}{to}{promotion}")
}

#[cfg(test)]
pub(crate) fn encode_entry(key: u64, uci: &str, weight: u16) -> [u8; ENTRY_SIZE] {
    let bytes = uci.as_bytes();
    let file = |b: u8| (b - b'a') as u16;
    let rank = |b: u8| (b - b'1') as u16;
    let promotion = match bytes.get(4) {
        Some(b'n') => 1,
        Some(b'b') => 2,
        Some(b'r') => 3,
        Some(b'q') => 4,
        _ => 0,
    };
    let mv = file(bytes[2])
        | rank(bytes[3]) << 3
        | file(bytes[0]) << 6
        | rank(bytes[1]) << 9
        | promotion << 12;
    let mut out = [0u8; ENTRY_SIZE];
    out[0..8].copy_from_slice(&key.to_be_bytes());
    out[8..10].copy_from_slice(&mv.to_be_bytes());
    out[10..12].copy_from_slice(&weight.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Variant;

    const START: u64 = 0x463b96181691fc9c;

    #[test]
    fn decodes_moves() {
        assert_eq!(decode_move(0x031c), "e2e4");
        assert_eq!(decode_move(0b100_110_100_111_100), "e7e8q");
    }

    #[test]
    fn looks_up_start_position() {
        let mut bytes = vec![];
        bytes.extend(encode_entry(0x823c9b50fd114196, "d7d5", 7));
        bytes.extend(encode_entry(START, "e2e4", 10));
        bytes.extend(encode_entry(START, "d2d4", 5));
        bytes.extend(encode_entry(START, "g1f3", 0));
        let book = PolyglotBook::from_bytes(&bytes).unwrap();
        assert_eq!(book.len(), 4);

        let pos = GamePosition::new(Variant::Standard, None).unwrap();
        let entries = book.lookup(&pos);
        assert_eq!(
            entries,
            vec![
                BookEntry {
                    uci: "e2e4".into(),
                    weight: 10
                },
                BookEntry {
                    uci: "d2d4".into(),
                    weight: 5
                },
            ]
        );
    }

    #[test]
    fn castling_is_normalised() {
        let fen = "r3k2r/8/8/8/8/8/8/R3K2R w KQkq - 0 1";
        let pos = GamePosition::new(Variant::FromPosition, Some(fen)).unwrap();
        let bytes = encode_entry(pos.polyglot_key(), "e1h1", 1);
        let book = PolyglotBook::from_bytes(&bytes).unwrap();
        assert_eq!(book.lookup(&pos)[0].uci, "e1g1");
    }

    #[test]
    fn rejects_truncated_files() {
        assert!(PolyglotBook::from_bytes(&[0u8; 17]).is_err());
    }
}
