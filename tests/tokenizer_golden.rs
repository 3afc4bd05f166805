use std::io::Write;

use lmkit::tokenization::bert::{BertTokenizer, BertTokenizerConfig};
use lmkit::tokenization::tokenizer::Tokenizer;
use lmkit::tokenization::vocab::Vocab;

/// Toy WordPiece vocabulary; line order fixes the ids the golden
/// assertions below rely on.
const TOY_PIECES: &[&str] = &[
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "I", "saw", "a", "with", ".", "g", "##ir", "##l", "te",
    "##les", "##co", "##p", "##e", ",", "!", "To", "##d", "##ay", "we", "will", "e", "##at", "po",
    "##k", "bo", "##w", "lo", "##t", "##s", "of", "it",
];

fn toy_tokenizer() -> BertTokenizer {
    let vocab = Vocab::from_pieces(TOY_PIECES.iter().copied()).unwrap();
    BertTokenizer::new(
        vocab,
        BertTokenizerConfig {
            strip_accents: true,
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn toy_encoding_matches_golden_ids_and_pieces() {
    let tokenizer = toy_tokenizer();
    let encoding = tokenizer
        .encode(&[
            "I saw a girl with a telescope.",
            "Today we will eat poké bowl, lots of it!",
        ])
        .unwrap();

    assert_eq!(encoding.ids.len(), 2);
    assert_eq!(encoding.pieces.len(), 2);

    assert_eq!(
        encoding.lens,
        vec![
            vec![1, 1, 1, 1, 3, 1, 1, 5, 1, 1],
            vec![1, 3, 1, 1, 2, 3, 3, 1, 3, 1, 1, 1, 1],
        ]
    );
    assert_eq!(
        encoding.ids,
        vec![
            vec![2, 4, 5, 6, 9, 10, 11, 7, 6, 12, 13, 14, 15, 16, 8, 3],
            vec![2, 19, 20, 21, 22, 23, 24, 25, 26, 27, 16, 28, 29, 11, 17, 30, 31, 32, 33, 34, 18, 3],
        ]
    );
    assert_eq!(
        encoding.pieces[0],
        vec![
            "[CLS]", "I", "saw", "a", "g", "##ir", "##l", "with", "a", "te", "##les", "##co",
            "##p", "##e", ".", "[SEP]",
        ]
    );
    assert_eq!(
        encoding.pieces[1],
        vec![
            "[CLS]", "To", "##d", "##ay", "we", "will", "e", "##at", "po", "##k", "##e", "bo",
            "##w", "##l", ",", "lo", "##t", "##s", "of", "it", "!", "[SEP]",
        ]
    );

    for i in 0..encoding.ids.len() {
        assert_eq!(encoding.ids[i].len(), encoding.pieces[i].len());
        assert_eq!(encoding.ids[i].len(), encoding.lens[i].iter().sum::<usize>());
    }
}

#[test]
fn toy_padded_tensor_and_mask_match_golden_layout() {
    let tokenizer = toy_tokenizer();
    let encoding = tokenizer
        .encode(&[
            "I saw a girl with a telescope.",
            "Today we will eat poké bowl, lots of it!",
        ])
        .unwrap();

    let padded = encoding.padded_tensor(0);
    assert_eq!(padded.size(), &[2, 22]);
    // Row 0 holds its 16 real ids then the pad id.
    assert_eq!(padded.int64_value(&[0, 0]), 2);
    assert_eq!(padded.int64_value(&[0, 15]), 3);
    for position in 16..22 {
        assert_eq!(padded.int64_value(&[0, position]), 0);
    }
    assert_eq!(padded.int64_value(&[1, 21]), 3);

    let mask = encoding.attention_mask();
    let mask = mask.bool_mask();
    for position in 0..16 {
        assert_eq!(mask.int64_value(&[0, position]), 1);
    }
    for position in 16..22 {
        assert_eq!(mask.int64_value(&[0, position]), 0);
    }
    for position in 0..22 {
        assert_eq!(mask.int64_value(&[1, position]), 1);
    }
}

#[test]
fn toy_decoding_round_trips_up_to_normalization() {
    let tokenizer = toy_tokenizer();
    let encoding = tokenizer
        .encode(&[
            "I saw a girl with a telescope.",
            "Today we will eat poké bowl, lots of it!",
        ])
        .unwrap();

    let decoded = tokenizer.decode(&encoding.ids).unwrap();
    assert_eq!(
        decoded,
        vec![
            "I saw a girl with a telescope.",
            // Accent stripping is a documented lossy step.
            "Today we will eat poke bowl, lots of it!",
        ]
    );
}

#[test]
fn file_built_tokenizer_matches_in_memory_one() {
    let mut vocab_file = tempfile::NamedTempFile::new().unwrap();
    for piece in TOY_PIECES {
        writeln!(vocab_file, "{piece}").unwrap();
    }
    vocab_file.flush().unwrap();

    let from_file = BertTokenizer::from_files(
        vocab_file.path(),
        BertTokenizerConfig {
            strip_accents: true,
            ..Default::default()
        },
    )
    .unwrap();

    let texts = ["I saw a girl with a telescope.", "po it saw"];
    let a = toy_tokenizer().encode(&texts).unwrap();
    let b = from_file.encode(&texts).unwrap();
    assert_eq!(a, b);
}
