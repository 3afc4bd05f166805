use crate::error::Result;
use crate::tokenization::vocab::Vocab;

/// Words longer than this become a single unknown piece rather than being
/// searched, matching the BERT tokenizer's guard.
const MAX_WORD_CHARS: usize = 100;

/// Greedy longest-prefix-match subword splitter.
///
/// Continuation pieces carry a `##` prefix. If at any point no prefix of the
/// remaining substring is in the vocabulary, the whole word becomes one
/// unknown piece; partial ids are never emitted.
#[derive(Debug, Clone)]
pub struct WordPiece {
    vocab: Vocab,
    unk_piece: String,
    unk_id: u32,
}

impl WordPiece {
    pub fn new(vocab: Vocab, unk_piece: &str) -> Result<Self> {
        let unk_id = vocab.special_piece_id(unk_piece)?;
        Ok(WordPiece {
            vocab,
            unk_piece: unk_piece.to_string(),
            unk_id,
        })
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn unk_id(&self) -> u32 {
        self.unk_id
    }

    /// Split one whitespace-free word into `(piece, id)` pairs.
    pub fn split_word(&self, word: &str) -> Vec<(String, u32)> {
        let chars: Vec<char> = word.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }
        if chars.len() > MAX_WORD_CHARS {
            return vec![(self.unk_piece.clone(), self.unk_id)];
        }

        let mut output = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let mut matched: Option<(String, u32)> = None;
            let mut end = chars.len();
            while end > start {
                let mut candidate: String = if start > 0 {
                    String::from("##")
                } else {
                    String::new()
                };
                candidate.extend(&chars[start..end]);
                if let Some(id) = self.vocab.piece_id(&candidate) {
                    matched = Some((candidate, id));
                    break;
                }
                end -= 1;
            }
            match matched {
                Some(piece) => {
                    output.push(piece);
                    start = end;
                }
                // No prefix matched: the whole word is unknown.
                None => return vec![(self.unk_piece.clone(), self.unk_id)],
            }
        }
        output
    }

    /// Inverse joining rule: strip `##` continuations, insert spaces
    /// between words, then re-attach punctuation and contractions the way
    /// the BERT decoder does.
    pub fn join_pieces<'a, I>(pieces: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = String::new();
        for piece in pieces {
            if let Some(continuation) = piece.strip_prefix("##") {
                out.push_str(continuation);
            } else {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(piece);
            }
        }
        cleanup_spaces(&out)
    }
}

/// Tokenization-space cleanup applied after joining: detach-marks inserted
/// by punctuation splitting are undone for the common English cases.
fn cleanup_spaces(text: &str) -> String {
    const REPLACEMENTS: [(&str, &str); 10] = [
        (" .", "."),
        (" ?", "?"),
        (" !", "!"),
        (" ,", ","),
        (" ' ", "'"),
        (" n't", "n't"),
        (" 'm", "'m"),
        (" 's", "'s"),
        (" 've", "'ve"),
        (" 're", "'re"),
    ];
    let mut out = text.to_string();
    for (from, to) in REPLACEMENTS {
        out = out.replace(from, to);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter() -> WordPiece {
        let vocab = Vocab::from_pieces([
            "[UNK]", "te", "##les", "##co", "##p", "##e", "girl", "voor", "##al",
        ])
        .unwrap();
        WordPiece::new(vocab, "[UNK]").unwrap()
    }

    #[test]
    fn greedy_longest_prefix_match() {
        let pieces = splitter().split_word("telescope");
        let names: Vec<&str> = pieces.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(names, ["te", "##les", "##co", "##p", "##e"]);
        assert_eq!(pieces[0].1, 1);
    }

    #[test]
    fn full_word_match_wins() {
        let pieces = splitter().split_word("girl");
        assert_eq!(pieces, vec![("girl".to_string(), 6)]);
    }

    #[test]
    fn oov_word_is_single_unknown() {
        // "vooraf" starts matching ("voor", "##a..") but cannot finish, so
        // the entire word collapses to one unknown piece.
        let pieces = splitter().split_word("vooraf");
        assert_eq!(pieces, vec![("[UNK]".to_string(), 0)]);
    }

    #[test]
    fn missing_unk_piece_fails_construction() {
        let vocab = Vocab::from_pieces(["a"]).unwrap();
        assert!(WordPiece::new(vocab, "[UNK]").is_err());
    }

    #[test]
    fn join_strips_continuations_and_reattaches_punctuation() {
        let joined = WordPiece::join_pieces(["I", "saw", "a", "g", "##ir", "##l", "."]);
        assert_eq!(joined, "I saw a girl.");

        let joined = WordPiece::join_pieces(["bo", "##w", "##l", ",", "lo", "##t", "##s"]);
        assert_eq!(joined, "bowl, lots");
    }
}
