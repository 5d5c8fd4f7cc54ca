//! Ranking helpers shared by lexical and hybrid search.

use super::tokenize::Tokenizer;
use ahash::AHashSet;
use serde::Serialize;

/// Upper bound on snippet length, in characters.
const MAX_SNIPPET_CHARS: usize = 600;

/// Standard cosine similarity. Mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// `alpha * lexical + (1 - alpha) * semantic`.
///
/// `lexical` is the cosine TF-IDF score, already within [0, 1].
pub fn hybrid_score(alpha: f32, lexical: f32, semantic: f32) -> f32 {
    let alpha = alpha.clamp(0.0, 1.0);
    alpha.mul_add(lexical, (1.0 - alpha) * semantic)
}

/// A window of lines around the best match in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snippet {
    pub text: String,
    /// 1-based line number of the best-matching line, if any line matched.
    pub line: Option<usize>,
}

/// Picks the line covering the most distinct query tokens (then the most
/// hits, then the earliest) and returns `window` lines centred on it.
/// Without any match, the first non-empty lines are returned.
pub fn extract_snippet(
    content: &str,
    query_tokens: &[String],
    tokenizer: &Tokenizer,
    window: usize,
) -> Snippet {
    let window = window.max(1);
    let wanted: AHashSet<&str> = query_tokens.iter().map(String::as_str).collect();
    let lines: Vec<&str> = content.lines().collect();

    let mut best: Option<(usize, usize, usize)> = None;
    if !wanted.is_empty() {
        for (idx, line) in lines.iter().enumerate() {
            let tokens = tokenizer.tokenize(line);
            let hits = tokens.iter().filter(|t| wanted.contains(t.as_str())).count();
            if hits == 0 {
                continue;
            }
            let distinct = tokens
                .iter()
                .filter(|t| wanted.contains(t.as_str()))
                .collect::<AHashSet<_>>()
                .len();
            let better = best.is_none_or(|(best_distinct, best_hits, _)| {
                distinct > best_distinct || (distinct == best_distinct && hits > best_hits)
            });
            if better {
                best = Some((distinct, hits, idx));
            }
        }
    }

    let (start, line) = match best {
        Some((_, _, idx)) => (idx.saturating_sub((window - 1) / 2), Some(idx + 1)),
        None => (
            lines.iter().position(|l| !l.trim().is_empty()).unwrap_or(0),
            None,
        ),
    };
    let end = (start + window).min(lines.len());
    let text = lines.get(start..end).map(|l| l.join("\n")).unwrap_or_default();

    Snippet {
        text: truncate_chars(text.trim_end(), MAX_SNIPPET_CHARS),
        line,
    }
}

/// Truncates on a character boundary, marking the cut with an ellipsis.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}…", &text[..byte_idx]),
        None => text.to_string(),
    }
}
