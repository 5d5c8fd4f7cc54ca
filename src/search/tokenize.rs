//! Text tokenization and optional stemming for search indexing.

use ahash::AHashSet;
use rust_stemmers::{Algorithm, Stemmer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Common English stop words to filter out from indexing.
/// These high-frequency words add little value to search relevance.
pub(crate) const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is", "it",
    "its", "of", "on", "that", "the", "to", "was", "will", "with",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenizerConfig {
    /// Tokens shorter than this many characters are dropped.
    pub min_token_length: usize,
    /// English stemming, applied identically to documents and queries.
    pub stemming: bool,
    pub extra_stop_words: Vec<String>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            min_token_length: 2,
            stemming: false,
            extra_stop_words: Vec::new(),
        }
    }
}

/// Turns raw text into normalized tokens.
///
/// Words are maximal runs of alphanumeric characters joined by `_` or `-`.
/// Compound words are emitted as their parts followed by the whole word:
/// - **camelCase**: "parseJson" → ["parse", "json", "parsejson"]
/// - **acronyms**: "HTTPServer" → ["http", "server", "httpserver"]
/// - **snake_case**: "parse_json" → ["parse", "json", "parse_json"]
/// - **hyphen-case**: "multi-line" → ["multi", "line", "multi-line"]
///
/// The output depends only on the input and the configuration.
pub struct Tokenizer {
    min_token_length: usize,
    stemmer: Option<Stemmer>,
    extra_stop_words: AHashSet<String>,
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokenizer")
            .field("min_token_length", &self.min_token_length)
            .field("stemming", &self.stemmer.is_some())
            .field("extra_stop_words", &self.extra_stop_words.len())
            .finish()
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(&TokenizerConfig::default())
    }
}

impl Tokenizer {
    pub fn new(config: &TokenizerConfig) -> Self {
        Self {
            min_token_length: config.min_token_length.max(1),
            stemmer: config
                .stemming
                .then(|| Stemmer::create(Algorithm::English)),
            extra_stop_words: config
                .extra_stop_words
                .iter()
                .map(|w| w.to_lowercase())
                .collect(),
        }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();

        // Byte offsets into `text` for the current word and sub-word.
        let mut word_start: Option<usize> = None;
        let mut subword_start = 0;
        let mut subwords: Vec<&str> = Vec::new();
        let mut prev: Option<char> = None;

        let mut chars = text.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c.is_alphanumeric() {
                if word_start.is_none() {
                    word_start = Some(i);
                    subword_start = i;
                    subwords.clear();
                } else if is_case_boundary(prev, c, chars.peek().map(|&(_, next)| next)) {
                    subwords.push(&text[subword_start..i]);
                    subword_start = i;
                }
            } else if (c == '_' || c == '-') && word_start.is_some() {
                subwords.push(&text[subword_start..i]);
                subword_start = i + c.len_utf8();
            } else if let Some(start) = word_start.take() {
                subwords.push(&text[subword_start..i]);
                self.emit_word(&text[start..i], &subwords, &mut tokens);
            }
            prev = Some(c);
        }

        if let Some(start) = word_start {
            subwords.push(&text[subword_start..]);
            self.emit_word(&text[start..], &subwords, &mut tokens);
        }

        tokens
    }

    /// Emits sub-words first, then the whole word if it differs from its only part.
    fn emit_word(&self, word: &str, subwords: &[&str], tokens: &mut Vec<String>) {
        let word = word.trim_end_matches(['_', '-']);
        let parts: Vec<&str> = subwords.iter().copied().filter(|s| !s.is_empty()).collect();

        if parts.len() > 1 {
            for part in &parts {
                self.index_token(part, tokens);
            }
        }
        self.index_token(word, tokens);
    }

    /// Lowercases, filters and stems a single token.
    fn index_token(&self, token: &str, tokens: &mut Vec<String>) {
        if token.chars().count() < self.min_token_length {
            return;
        }

        let lowercase = token.to_lowercase();
        if STOP_WORDS.contains(&lowercase.as_str()) || self.extra_stop_words.contains(&lowercase) {
            return;
        }

        match &self.stemmer {
            Some(stemmer) => tokens.push(stemmer.stem(&lowercase).into_owned()),
            None => tokens.push(lowercase),
        }
    }
}

/// lower/digit → Upper, and the last capital of an acronym followed by lowercase.
fn is_case_boundary(prev: Option<char>, current: char, next: Option<char>) -> bool {
    let Some(prev) = prev else {
        return false;
    };
    if !current.is_uppercase() {
        return false;
    }
    if prev.is_lowercase() || prev.is_numeric() {
        return true;
    }
    prev.is_uppercase() && next.is_some_and(char::is_lowercase)
}
