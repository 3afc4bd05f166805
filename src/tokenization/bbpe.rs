use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use regex::Regex;

use crate::error::{LmError, Result};
use crate::tokenization::vocab::Vocab;

/// GPT-2 style split pattern applied before merging. The GPT-2 pattern
/// uses a look-ahead for trailing whitespace; this is the standard
/// simplification without it, which matches on the texts we care about.
const SPLIT_PATTERN: &str = r"'(?:s|t|re|ve|m|ll|d)| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

/// Byte-level byte-pair encoder.
///
/// Text is segmented by `SPLIT_PATTERN`, each segment's UTF-8 bytes are
/// mapped into a printable unicode alphabet, and adjacent pairs are merged
/// best-rank-first until no pair remains in the merge table. The byte
/// alphabet is complete, so splitting never produces an unknown piece.
#[derive(Debug, Clone)]
pub struct ByteBpe {
    vocab: Vocab,
    merge_ranks: HashMap<(String, String), usize>,
    splitter: Regex,
    byte_to_char: [char; 256],
    char_to_byte: HashMap<char, u8>,
}

impl ByteBpe {
    pub fn new(vocab: Vocab, merges: Vec<(String, String)>) -> Result<Self> {
        let splitter = Regex::new(SPLIT_PATTERN)
            .map_err(|e| LmError::TokenizerData(format!("split pattern failed to compile: {e}")))?;
        let merge_ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();
        let byte_to_char = byte_to_char_table();
        let char_to_byte = byte_to_char
            .iter()
            .enumerate()
            .map(|(byte, &ch)| (ch, byte as u8))
            .collect();
        Ok(ByteBpe {
            vocab,
            merge_ranks,
            splitter,
            byte_to_char,
            char_to_byte,
        })
    }

    /// Read line-oriented vocabulary and merge files. Vocabulary line order
    /// defines id assignment; merge line order defines priority. Merge
    /// lines are `piece1 piece2`; comment lines (`#...`) are skipped.
    pub fn from_files(vocab_path: &Path, merges_path: &Path) -> Result<Self> {
        let vocab = Vocab::from_file(vocab_path)?;
        let merges = read_merges(merges_path)?;
        Self::new(vocab, merges)
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// Split a full text into `(piece, id)` pairs per pre-tokenized word.
    /// Each inner vector is the piece run for one word.
    pub fn split_text(&self, text: &str) -> Result<Vec<Vec<(String, u32)>>> {
        self.splitter
            .find_iter(text)
            .map(|word| self.split_word(word.as_str()))
            .collect()
    }

    /// Merge one pre-tokenized word into pieces.
    pub fn split_word(&self, word: &str) -> Result<Vec<(String, u32)>> {
        let mut symbols: Vec<String> = word
            .bytes()
            .map(|b| self.byte_to_char[b as usize].to_string())
            .collect();

        while symbols.len() > 1 {
            // Lowest-rank adjacent pair merges first.
            let best = symbols
                .windows(2)
                .enumerate()
                .filter_map(|(i, pair)| {
                    self.merge_ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, i))
                })
                .min();
            let Some((_, at)) = best else {
                break;
            };

            let left = symbols[at].clone();
            let right = symbols[at + 1].clone();
            let merged = format!("{left}{right}");
            let mut i = 0;
            while i + 1 < symbols.len() {
                if symbols[i] == left && symbols[i + 1] == right {
                    symbols[i] = merged.clone();
                    symbols.remove(i + 1);
                } else {
                    i += 1;
                }
            }
        }

        symbols
            .into_iter()
            .map(|piece| {
                let id = self.vocab.piece_id(&piece).ok_or_else(|| {
                    LmError::TokenizerData(format!(
                        "merged piece '{piece}' is missing from the vocabulary"
                    ))
                })?;
                Ok((piece, id))
            })
            .collect()
    }

    /// Inverse joining rule: concatenate pieces, then map the printable
    /// alphabet back to raw bytes.
    pub fn join_pieces<'a, I>(&self, pieces: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut bytes = Vec::new();
        for piece in pieces {
            for ch in piece.chars() {
                match self.char_to_byte.get(&ch) {
                    Some(&b) => bytes.push(b),
                    // Special pieces are not byte-mapped; pass them through.
                    None => bytes.extend_from_slice(ch.to_string().as_bytes()),
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn read_merges(path: &Path) -> Result<Vec<(String, String)>> {
    let reader = BufReader::new(File::open(path)?);
    let mut merges = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        merges.push(parse_merge(line)?);
    }
    Ok(merges)
}

/// Parse one `piece1 piece2` merge rule.
pub(crate) fn parse_merge(rule: &str) -> Result<(String, String)> {
    rule.split_once(' ')
        .map(|(left, right)| (left.to_string(), right.to_string()))
        .ok_or_else(|| LmError::TokenizerData(format!("malformed merge rule '{rule}'")))
}

/// GPT-2 byte-to-printable-unicode table: printable latin bytes map to
/// themselves, everything else to code points from U+0100 upward. A space
/// therefore becomes `Ġ` (U+0120).
fn byte_to_char_table() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut shifted = 0u32;
    for byte in 0..=255u32 {
        let printable = (0x21..=0x7E).contains(&byte)
            || (0xA1..=0xAC).contains(&byte)
            || (0xAE..=0xFF).contains(&byte);
        table[byte as usize] = if printable {
            char::from_u32(byte).expect("latin range")
        } else {
            let ch = char::from_u32(256 + shifted).expect("below surrogate range");
            shifted += 1;
            ch
        };
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_bpe() -> ByteBpe {
        // Byte pieces plus the merges needed for "hello world".
        let vocab = Vocab::from_pieces([
            "h", "e", "l", "o", "w", "r", "d", "Ġ", "he", "hel", "hell", "hello", "Ġw", "or",
            "orl", "orld", "Ġworld",
        ])
        .unwrap();
        let merges = vec![
            ("h".into(), "e".into()),
            ("he".into(), "l".into()),
            ("hel".into(), "l".into()),
            ("hell".into(), "o".into()),
            ("Ġ".into(), "w".into()),
            ("o".into(), "r".into()),
            ("or".into(), "l".into()),
            ("orl".into(), "d".into()),
            ("Ġw".into(), "orld".into()),
        ];
        ByteBpe::new(vocab, merges).unwrap()
    }

    #[test]
    fn space_maps_to_g_marker() {
        let table = byte_to_char_table();
        assert_eq!(table[b' ' as usize], '\u{120}');
        assert_eq!(table[b'a' as usize], 'a');
    }

    #[test]
    fn merges_apply_in_rank_order() {
        let bpe = toy_bpe();
        let words = bpe.split_text("hello world").unwrap();
        assert_eq!(words.len(), 2);
        let pieces: Vec<&str> = words
            .iter()
            .flatten()
            .map(|(piece, _)| piece.as_str())
            .collect();
        assert_eq!(pieces, ["hello", "Ġworld"]);
    }

    #[test]
    fn unmerged_bytes_stay_single_pieces() {
        let bpe = toy_bpe();
        let words = bpe.split_text("hold").unwrap();
        let pieces: Vec<&str> = words
            .iter()
            .flatten()
            .map(|(piece, _)| piece.as_str())
            .collect();
        // No merge rule covers this word fully; the split stops once no
        // adjacent pair is in the table.
        assert_eq!(pieces, ["h", "o", "l", "d"]);
    }

    #[test]
    fn join_reverses_split() {
        let bpe = toy_bpe();
        let words = bpe.split_text("hello world").unwrap();
        let pieces: Vec<String> = words
            .into_iter()
            .flatten()
            .map(|(piece, _)| piece)
            .collect();
        let joined = bpe.join_pieces(pieces.iter().map(String::as_str));
        assert_eq!(joined, "hello world");
    }
}
