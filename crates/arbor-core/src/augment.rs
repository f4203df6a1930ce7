//! Punctuation-stripping augmentation.
//!
//! Treebanks end almost every sentence with punctuation, which teaches models
//! that sentence-final punctuation is guaranteed. Duplicating a fraction of
//! those sentences without the final token balances that out.

use oorandom::Rand64;
use tracing::debug;

use crate::conllu::{Sentence, Token};

/// Fraction of the corpus that should end without punctuation when no
/// explicit ratio is given.
pub const TARGET_NOPUNCT_RATIO: f64 = 0.1;

/// Upper bound for the automatically chosen ratio.
pub const MAX_AUTO_RATIO: f64 = 0.5;

const EXTRA_PUNCT: &[char] = &[
    '。', '、', '！', '？', '…', '«', '»', '“', '”', '‘', '’', '¿', '¡', '״', '׃', '،', '؛', '؟', '।',
];

/// Whether `token` is punctuation: UPOS `PUNCT`, or a punctuation-only form
/// when UPOS is missing.
pub fn is_punct(token: &Token) -> bool {
    match token.upos.as_deref() {
        Some(upos) => upos == "PUNCT",
        None => {
            !token.form.is_empty()
                && token
                    .form
                    .chars()
                    .all(|c| c.is_ascii_punctuation() || EXTRA_PUNCT.contains(&c))
        }
    }
}

/// A sentence qualifies when its final token is punctuation that nothing
/// else attaches to, and something remains after removing it.
pub fn can_augment(sentence: &Sentence) -> bool {
    let Some(last) = sentence.tokens.last() else {
        return false;
    };
    sentence.len() > 1
        && is_punct(last)
        && !sentence.tokens.iter().any(|t| t.head == Some(last.id))
}

/// The sentence already ends without punctuation.
pub fn lacks_final_punct(sentence: &Sentence) -> bool {
    sentence.tokens.last().is_some_and(|t| !is_punct(t))
}

/// Ratio used when none is configured: enough augmentable sentences to bring
/// the no-punctuation share up to [`TARGET_NOPUNCT_RATIO`].
pub fn auto_ratio(sentences: &[Sentence]) -> f64 {
    let n = sentences.len() as f64;
    let n_can = sentences.iter().filter(|s| can_augment(s)).count() as f64;
    let n_nopunct = sentences.iter().filter(|s| lacks_final_punct(s)).count() as f64;

    if n_can == 0.0 || n_nopunct >= TARGET_NOPUNCT_RATIO * n {
        return 0.0;
    }
    ((TARGET_NOPUNCT_RATIO * n - n_nopunct) / n_can).clamp(0.0, MAX_AUTO_RATIO)
}

/// Builds the augmented sentences; the caller appends them to the corpus.
///
/// Exactly `round(ratio * n_can)` augmentable sentences are copied, chosen by
/// `rng` and returned in corpus order.
pub fn augment_punct(sentences: &[Sentence], ratio: Option<f64>, rng: &mut Rand64) -> Vec<Sentence> {
    let ratio = ratio.unwrap_or_else(|| auto_ratio(sentences));
    let candidates: Vec<usize> = sentences
        .iter()
        .enumerate()
        .filter(|(_, s)| can_augment(s))
        .map(|(i, _)| i)
        .collect();

    let count = ((ratio * candidates.len() as f64).round() as usize).min(candidates.len());
    debug!(ratio, candidates = candidates.len(), count, "augmenting punctuation");
    if count == 0 {
        return Vec::new();
    }

    let mut chosen = candidates;
    shuffle(&mut chosen, rng);
    chosen.truncate(count);
    chosen.sort_unstable();

    chosen
        .into_iter()
        .map(|i| strip_final_punct(&sentences[i]))
        .collect()
}

fn strip_final_punct(sentence: &Sentence) -> Sentence {
    let mut copy = sentence.clone();
    let removed = copy.tokens.pop();
    copy.multiword.retain(|(before, _)| *before < copy.tokens.len());
    copy.comments.retain(|c| !c.starts_with("# text") && !c.starts_with("# sent_id"));

    // The new last word inherits the removed token's spacing.
    let no_space = removed
        .and_then(|t| t.misc)
        .is_some_and(|m| m.split('|').any(|f| f == "SpaceAfter=No"));
    if let Some(last) = copy.tokens.last_mut() {
        let mut fields: Vec<&str> = last
            .misc
            .as_deref()
            .map(|m| m.split('|').filter(|f| *f != "SpaceAfter=No").collect())
            .unwrap_or_default();
        if no_space {
            fields.push("SpaceAfter=No");
        }
        last.misc = (!fields.is_empty()).then(|| fields.join("|"));
    }
    copy
}

/// Fisher-Yates shuffle driven by the loader's seeded generator.
pub fn shuffle<T>(items: &mut [T], rng: &mut Rand64) {
    for i in (1..items.len()).rev() {
        let j = rng.rand_range(0..(i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}
