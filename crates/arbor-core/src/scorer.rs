//! # Scoring
//!
//! Compares a written prediction file with its gold counterpart. Both files
//! share the gold tokenization, so precision, recall and F1 coincide.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::DataLoader;
use crate::conllu::{Document, Token};
use crate::error::{ArborError, Result};

/// Which tag columns a tagger is judged on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalType {
    Upos,
    Xpos,
    UFeats,
    /// UPOS, XPOS and FEATS must all match.
    AllTags,
}

impl fmt::Display for EvalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalType::Upos => write!(f, "UPOS"),
            EvalType::Xpos => write!(f, "XPOS"),
            EvalType::UFeats => write!(f, "UFeats"),
            EvalType::AllTags => write!(f, "AllTags"),
        }
    }
}

/// Picks the evaluation type from the columns the dev set populates.
pub fn get_eval_type(dev: &DataLoader) -> EvalType {
    match (dev.has_upos, dev.has_xpos, dev.has_feats) {
        (false, true, false) => EvalType::Xpos,
        (true, false, false) => EvalType::Upos,
        _ => EvalType::AllTags,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Score {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl Score {
    /// Score for `correct` out of `total` aligned tokens.
    pub fn from_counts(correct: usize, total: usize) -> Self {
        let value = if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        };
        Self {
            precision: value,
            recall: value,
            f1: value,
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.f1 * 100.0)
    }
}

/// Task-specific evaluation of a prediction file.
pub trait Scorer {
    fn score(&self, system: &Path, gold: &Path, eval_type: EvalType) -> Result<Score>;
}

/// Tag accuracy for the POS tagger.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggerScorer;

impl Scorer for TaggerScorer {
    fn score(&self, system: &Path, gold: &Path, eval_type: EvalType) -> Result<Score> {
        let pairs = aligned_tokens(system, gold)?;
        let correct = pairs
            .iter()
            .filter(|(s, g)| match eval_type {
                EvalType::Upos => s.upos == g.upos,
                EvalType::Xpos => s.xpos == g.xpos,
                EvalType::UFeats => feats_match(s, g),
                EvalType::AllTags => s.upos == g.upos && s.xpos == g.xpos && feats_match(s, g),
            })
            .count();
        Ok(Score::from_counts(correct, pairs.len()))
    }
}

/// Labeled attachment score for the dependency parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParserScorer;

impl Scorer for ParserScorer {
    fn score(&self, system: &Path, gold: &Path, _eval_type: EvalType) -> Result<Score> {
        let pairs = aligned_tokens(system, gold)?;
        let correct = pairs.iter().filter(|(s, g)| attachment_correct(s, g)).count();
        Ok(Score::from_counts(correct, pairs.len()))
    }
}

/// LAS broken down by gold relation, logged one line per relation and
/// returned sorted by name.
pub fn score_named_dependencies(system: &Path, gold: &Path) -> Result<BTreeMap<String, Score>> {
    let pairs = aligned_tokens(system, gold)?;
    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (s, g) in &pairs {
        let entry = counts.entry(universal_deprel(g).to_string()).or_default();
        entry.1 += 1;
        if attachment_correct(s, g) {
            entry.0 += 1;
        }
    }

    let scores: BTreeMap<String, Score> = counts
        .into_iter()
        .map(|(rel, (correct, total))| (rel, Score::from_counts(correct, total)))
        .collect();
    for (rel, score) in &scores {
        info!(relation = %rel, las = %score, "per-relation score");
    }
    Ok(scores)
}

/// FEATS compare as sets of `Name=Value` pairs, so their order is irrelevant.
fn feats_match(system: &Token, gold: &Token) -> bool {
    fn features(token: &Token) -> Vec<&str> {
        let mut features: Vec<&str> = token
            .feats
            .as_deref()
            .filter(|f| *f != "_")
            .map(|f| f.split('|').filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        features.sort_unstable();
        features
    }
    features(system) == features(gold)
}

fn attachment_correct(system: &Token, gold: &Token) -> bool {
    system.head == gold.head && universal_deprel(system) == universal_deprel(gold)
}

/// The relation without its language-specific subtype (`nmod:poss` → `nmod`).
fn universal_deprel(token: &Token) -> &str {
    token
        .deprel
        .as_deref()
        .map_or("_", |rel| rel.split(':').next().unwrap_or(rel))
}

fn aligned_tokens(system: &Path, gold: &Path) -> Result<Vec<(Token, Token)>> {
    let system_doc = Document::from_conllu_file(system)?;
    let gold_doc = Document::from_conllu_file(gold)?;
    if system_doc.num_tokens() != gold_doc.num_tokens() {
        return Err(ArborError::format(
            system,
            0,
            format!(
                "{} system tokens but {} gold tokens in {}",
                system_doc.num_tokens(),
                gold_doc.num_tokens(),
                gold.display()
            ),
        ));
    }

    let tokens = |doc: Document| {
        doc.sentences
            .into_iter()
            .flat_map(|s| s.tokens)
            .collect::<Vec<_>>()
    };
    Ok(tokens(system_doc).into_iter().zip(tokens(gold_doc)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::LoaderOptions;
    use crate::conllu::Sentence;

    const GOLD: &str = "1\tThe\tthe\tDET\tDT\tDefinite=Def\t2\tdet\t_\t_\n\
2\tdog\tdog\tNOUN\tNN\tNumber=Sing\t3\tnsubj\t_\t_\n\
3\tbarks\tbark\tVERB\tVBZ\t_\t0\troot\t_\t_\n\
4\t.\t.\tPUNCT\t.\t_\t3\tpunct\t_\t_\n\n";

    fn write(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_tagger_eval_types() {
        let dir = tempfile::tempdir().unwrap();
        let gold = write(dir.path(), "gold.conllu", GOLD);
        // wrong XPOS on "dog", wrong FEATS on "The"
        let system = write(
            dir.path(),
            "pred.conllu",
            &GOLD.replace("NOUN\tNN", "NOUN\tNNS").replace("Definite=Def", "_"),
        );

        let score = |t| TaggerScorer.score(&system, &gold, t).unwrap().f1;
        assert_eq!(score(EvalType::Upos), 1.0);
        assert_eq!(score(EvalType::Xpos), 0.75);
        assert_eq!(score(EvalType::UFeats), 0.75);
        assert_eq!(score(EvalType::AllTags), 0.5);
    }

    #[test]
    fn test_feats_order_does_not_matter() {
        let dir = tempfile::tempdir().unwrap();
        let gold = write(
            dir.path(),
            "gold.conllu",
            "1\tdogs\tdog\tNOUN\tNNS\tNumber=Plur|Case=Nom\t0\troot\t_\t_\n\n",
        );
        let system = write(
            dir.path(),
            "pred.conllu",
            "1\tdogs\tdog\tNOUN\tNNS\tCase=Nom|Number=Plur\t0\troot\t_\t_\n\n",
        );
        assert_eq!(TaggerScorer.score(&system, &gold, EvalType::UFeats).unwrap().f1, 1.0);
        assert_eq!(TaggerScorer.score(&system, &gold, EvalType::AllTags).unwrap().f1, 1.0);

        let wrong = write(
            dir.path(),
            "wrong.conllu",
            "1\tdogs\tdog\tNOUN\tNNS\tCase=Acc|Number=Plur\t0\troot\t_\t_\n\n",
        );
        assert_eq!(TaggerScorer.score(&wrong, &gold, EvalType::UFeats).unwrap().f1, 0.0);
    }

    #[test]
    fn test_las_ignores_subtypes() {
        let dir = tempfile::tempdir().unwrap();
        let gold = write(dir.path(), "gold.conllu", GOLD);
        let system = write(
            dir.path(),
            "pred.conllu",
            &GOLD
                .replace("nsubj", "nsubj:pass")
                .replace("3\tpunct", "2\tpunct"),
        );
        let score = ParserScorer.score(&system, &gold, EvalType::AllTags).unwrap();
        assert_eq!(score.f1, 0.75);
        assert_eq!(score.precision, score.recall);

        let named = score_named_dependencies(&system, &gold).unwrap();
        assert_eq!(named["nsubj"].f1, 1.0);
        assert_eq!(named["punct"].f1, 0.0);
    }

    #[test]
    fn test_token_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let gold = write(dir.path(), "gold.conllu", GOLD);
        let system = write(
            dir.path(),
            "pred.conllu",
            "1\tThe\tthe\tDET\tDT\t_\t0\troot\t_\t_\n\n",
        );
        let err = TaggerScorer.score(&system, &gold, EvalType::Upos).unwrap_err();
        assert!(matches!(err, ArborError::Format { .. }));
    }

    #[test]
    fn test_xpos_only_dev_set() {
        let doc = Document::new(vec![Sentence::new(vec![Token::new(1, "a").with_xpos("NN")])]);
        let dev = DataLoader::new(doc, 10, &LoaderOptions::default(), None, None, true, true).unwrap();
        assert_eq!(get_eval_type(&dev), EvalType::Xpos);
    }
}
