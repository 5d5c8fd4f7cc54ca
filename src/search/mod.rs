//! Lexical search: tokenization, the TF-IDF index, and ranking helpers.

pub mod index;
pub mod scoring;
pub mod tokenize;

pub use index::LexicalIndex;
pub use scoring::{Snippet, cosine_similarity, extract_snippet, hybrid_score};
pub use tokenize::{Tokenizer, TokenizerConfig};

pub(crate) use index::rank_order;
