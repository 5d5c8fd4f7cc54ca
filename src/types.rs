use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_CORPUS_NAME_LEN: usize = 64;

/// Name of an independently indexed collection, e.g. `codebase` or `knowledge`.
///
/// Corpus names end up in file names under the storage root, so they are
/// restricted to lowercase ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorpusName(String);

impl CorpusName {
    pub fn new(name: impl Into<String>) -> Result<Self, EngineError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name.len() > MAX_CORPUS_NAME_LEN {
            Some("name is longer than 64 characters")
        } else if !name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            Some("name must start with a lowercase letter or digit")
        } else if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            Some("only lowercase letters, digits, '-' and '_' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(EngineError::InvalidCorpusName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// Wraps a name without validation. Only for literals known to be valid.
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorpusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CorpusName {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CorpusName> for String {
    fn from(name: CorpusName) -> Self {
        name.0
    }
}

impl AsRef<str> for CorpusName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for CorpusName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// How a corpus snapshot ranks documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// TF-IDF only.
    LexicalOnly,
    /// TF-IDF blended with embedding similarity.
    Hybrid,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LexicalOnly => "lexical-only",
            Self::Hybrid => "hybrid",
        })
    }
}

/// Indexing pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scanning,
    Tokenizing,
    Scoring,
    Embedding,
    Persisting,
    Completed,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Tokenizing => "tokenizing",
            Self::Scoring => "scoring",
            Self::Embedding => "embedding",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milliseconds since the Unix epoch; pre-epoch times clamp to zero.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}
