use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Text normalization applied before WordPiece splitting.
///
/// Rule set, in order:
/// 1. optional lowercasing;
/// 2. optional accent stripping: NFD decomposition, then removal of
///    combining marks (`"Brötchen"` → `"Brotchen"`);
/// 3. every punctuation character becomes its own whitespace-separated
///    word (`"AWO-Mitarbeiter"` → `"AWO - Mitarbeiter"`).
///
/// A pure transformation: one output string per input string, and the empty
/// string maps to itself.
#[derive(Debug, Clone, Copy)]
pub struct BertPreEncoder {
    pub lowercase: bool,
    pub strip_accents: bool,
}

impl BertPreEncoder {
    pub fn new(lowercase: bool, strip_accents: bool) -> Self {
        BertPreEncoder {
            lowercase,
            strip_accents,
        }
    }

    pub fn pre_encode(&self, texts: &[&str]) -> Vec<String> {
        texts.iter().map(|text| self.pre_encode_one(text)).collect()
    }

    fn pre_encode_one(&self, text: &str) -> String {
        let text = if self.lowercase {
            text.to_lowercase()
        } else {
            text.to_string()
        };
        let text = if self.strip_accents {
            text.nfd().filter(|ch| !is_combining_mark(*ch)).collect()
        } else {
            text
        };

        let mut words: Vec<String> = Vec::new();
        for word in text.split_whitespace() {
            split_punctuation(word, &mut words);
        }
        words.join(" ")
    }
}

/// Append `word` to `out`, breaking every punctuation character into its
/// own entry.
fn split_punctuation(word: &str, out: &mut Vec<String>) {
    let mut current = String::new();
    for ch in word.chars() {
        if is_punctuation(ch) {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            out.push(ch.to_string());
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
}

/// ASCII punctuation ranges as the BERT tokenizer defines them, plus the
/// Unicode general-punctuation block.
fn is_punctuation(ch: char) -> bool {
    ch.is_ascii_punctuation() || ('\u{2000}'..='\u{206F}').contains(&ch)
}
