//! # Batch Loader
//!
//! Turns a [`Document`] into token-budgeted mini-batches of encoded sentences.
//!
//! Training loaders shuffle, bucket by length in a random direction and
//! shuffle the batch order again on every [`DataLoader::reshuffle`].
//! Evaluation loaders optionally sort by length (longest first) and keep the
//! original position of every sentence so predictions can be put back in
//! corpus order with [`unsort`].

use std::sync::Arc;

use oorandom::Rand64;
use tracing::{debug, info};

use crate::augment::{augment_punct, shuffle};
use crate::conllu::{Document, Field, Sentence};
use crate::error::{ArborError, Result};
use crate::pretrain::Pretrain;
use crate::vocab::{DEFAULT_WORD_CUTOFF, PAD_ID, Vocab, VocabPolicy};

/// Settings shared by every loader of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderOptions {
    pub word_cutoff: usize,
    /// Fraction of the training corpus to keep; `1.0` keeps everything.
    pub sample_train: f64,
    /// Punctuation-stripping ratio; `None` picks one automatically.
    pub augment_nopunct: Option<f64>,
    pub seed: u64,
    /// Mixed into the seed so sibling loaders draw different streams.
    pub salt: u64,
    pub policy: VocabPolicy,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            word_cutoff: DEFAULT_WORD_CUTOFF,
            sample_train: 1.0,
            augment_nopunct: None,
            seed: 1234,
            salt: 0,
            policy: VocabPolicy::Union,
        }
    }
}

impl LoaderOptions {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    pub fn with_sample_train(mut self, sample_train: f64) -> Self {
        self.sample_train = sample_train;
        self
    }

    pub fn with_augment_nopunct(mut self, ratio: Option<f64>) -> Self {
        self.augment_nopunct = ratio;
        self
    }

    pub fn with_word_cutoff(mut self, word_cutoff: usize) -> Self {
        self.word_cutoff = word_cutoff;
        self
    }

    pub fn with_policy(mut self, policy: VocabPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn rng(&self) -> Rand64 {
        Rand64::new((u128::from(self.seed) << 64) | u128::from(self.salt))
    }
}

/// One sentence mapped to vocabulary ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSentence {
    /// Surface forms, kept for the character LM and transformer features.
    pub forms: Vec<String>,
    pub words: Vec<u32>,
    pub chars: Vec<Vec<u32>>,
    pub pretrained: Vec<u32>,
    pub upos: Vec<u32>,
    pub xpos: Vec<u32>,
    pub feats: Vec<u32>,
    /// Gold heads; `0` is the root.
    pub heads: Vec<u32>,
    pub deprels: Vec<u32>,
}

impl EncodedSentence {
    pub fn encode(sentence: &Sentence, vocab: &Vocab, pretrain: Option<&Pretrain>) -> Self {
        let tokens = &sentence.tokens;
        let tags = |field: Field| tokens.iter().map(|t| vocab.tag_id(t, field)).collect();

        Self {
            forms: tokens.iter().map(|t| t.form.clone()).collect(),
            words: tokens.iter().map(|t| vocab.word.unit2id(&t.form)).collect(),
            chars: tokens
                .iter()
                .map(|t| {
                    t.form
                        .chars()
                        .map(|c| vocab.char.unit2id(c.encode_utf8(&mut [0; 4])))
                        .collect()
                })
                .collect(),
            pretrained: tokens
                .iter()
                .map(|t| pretrain.map_or(PAD_ID, |p| p.word_id(&t.form)))
                .collect(),
            upos: tags(Field::Upos),
            xpos: tags(Field::Xpos),
            feats: tags(Field::Feats),
            heads: tokens
                .iter()
                .map(|t| t.head.map_or(0, |h| h as u32))
                .collect(),
            deprels: tags(Field::Deprel),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// A group of sentences processed in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub sentences: Vec<EncodedSentence>,
    /// Position of every member in the loader's unsorted sentence list.
    pub orig_idx: Vec<usize>,
    /// Fingerprint of the vocabulary the ids come from.
    pub vocab_fingerprint: u64,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn num_tokens(&self) -> usize {
        self.sentences.iter().map(EncodedSentence::len).sum()
    }

    /// Length of the longest member.
    pub fn max_len(&self) -> usize {
        self.sentences.iter().map(EncodedSentence::len).max().unwrap_or(0)
    }

    /// Fails unless the batch was encoded with `vocab`.
    pub fn check_vocab(&self, vocab: &Vocab) -> Result<()> {
        let expected = vocab.fingerprint();
        if expected != self.vocab_fingerprint {
            return Err(ArborError::VocabMismatch {
                expected,
                actual: self.vocab_fingerprint,
            });
        }
        Ok(())
    }
}

/// Produces the batches of one corpus.
#[derive(Debug)]
pub struct DataLoader {
    doc: Document,
    vocab: Arc<Vocab>,
    batch_size: usize,
    evaluation: bool,
    sort_during_eval: bool,
    num_examples: usize,
    batches: Vec<Batch>,
    rng: Rand64,
    pub has_upos: bool,
    pub has_xpos: bool,
    pub has_feats: bool,
}

impl DataLoader {
    /// Encodes `doc` and builds the initial batches.
    ///
    /// Without a `vocab` one is built from `doc`. Training loaders apply
    /// punctuation augmentation, then sampling; the document itself is
    /// left untouched.
    pub fn new(
        doc: Document,
        batch_size: usize,
        options: &LoaderOptions,
        pretrain: Option<&Pretrain>,
        vocab: Option<Arc<Vocab>>,
        evaluation: bool,
        sort_during_eval: bool,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ArborError::Configuration("batch_size must be positive".into()));
        }
        let mut rng = options.rng();

        let vocab = match vocab {
            Some(vocab) => vocab,
            None => Arc::new(Vocab::build(
                std::slice::from_ref(&doc),
                options.word_cutoff,
                options.policy,
            )?),
        };

        let mut sentences: Vec<Sentence> = doc.sentences.clone();
        if !evaluation {
            let extra = augment_punct(&sentences, options.augment_nopunct, &mut rng);
            if !extra.is_empty() {
                info!(count = extra.len(), "augmented data with sentences lacking final punctuation");
            }
            sentences.extend(extra);
            // sampling draws from the augmented corpus
            if options.sample_train < 1.0 {
                let keep = (sentences.len() as f64 * options.sample_train).floor() as usize;
                shuffle(&mut sentences, &mut rng);
                sentences.truncate(keep);
                info!(keep, "subsampled training data");
            }
        }

        let encoded: Vec<(usize, EncodedSentence)> = sentences
            .iter()
            .map(|s| EncodedSentence::encode(s, &vocab, pretrain))
            .enumerate()
            .collect();

        let mut loader = Self {
            has_upos: doc.has_field(Field::Upos),
            has_xpos: doc.has_field(Field::Xpos),
            has_feats: doc.has_field(Field::Feats),
            doc,
            vocab,
            batch_size,
            evaluation,
            sort_during_eval,
            num_examples: encoded.len(),
            batches: Vec::new(),
            rng,
        };
        loader.batches = loader.build_batches(encoded);
        debug!(
            sentences = loader.num_examples,
            batches = loader.batches.len(),
            batch_size,
            evaluation,
            "built batches"
        );
        Ok(loader)
    }

    fn build_batches(&mut self, mut encoded: Vec<(usize, EncodedSentence)>) -> Vec<Batch> {
        if self.evaluation {
            if self.sort_during_eval {
                // stable, so equal lengths keep corpus order
                encoded.sort_by(|(_, a), (_, b)| b.len().cmp(&a.len()));
            }
            return chunk(encoded, self.batch_size, self.vocab.fingerprint());
        }

        shuffle(&mut encoded, &mut self.rng);
        let descending = self.rng.rand_u64() & 1 == 1;
        if descending {
            encoded.sort_by(|(_, a), (_, b)| b.len().cmp(&a.len()));
        } else {
            encoded.sort_by_key(|(_, s)| s.len());
        }
        let mut batches = chunk(encoded, self.batch_size, self.vocab.fingerprint());
        shuffle(&mut batches, &mut self.rng);
        batches
    }

    /// Re-buckets the training batches for the next epoch.
    pub fn reshuffle(&mut self) {
        if self.evaluation {
            return;
        }
        let encoded = std::mem::take(&mut self.batches)
            .into_iter()
            .flat_map(|b| b.orig_idx.into_iter().zip(b.sentences))
            .collect();
        self.batches = self.build_batches(encoded);
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of encoded sentences, including augmented ones.
    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    /// `orig_idx` of every batch, concatenated in batch order.
    pub fn orig_idx(&self) -> Vec<usize> {
        self.batches.iter().flat_map(|b| b.orig_idx.iter().copied()).collect()
    }

    pub fn vocab(&self) -> &Arc<Vocab> {
        &self.vocab
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    /// The corpus, for writing predictions back with [`Document::set`].
    pub fn doc_mut(&mut self) -> &mut Document {
        &mut self.doc
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether the corpus populates `field`.
    pub fn has(&self, field: Field) -> bool {
        match field {
            Field::Upos => self.has_upos,
            Field::Xpos => self.has_xpos,
            Field::Feats => self.has_feats,
            Field::Head | Field::Deprel => self.doc.has_field(field),
        }
    }
}

/// Marks every column that no training loader populates as present on all of
/// them, so the model learns to emit `_` for it.
pub fn reconcile_columns(loaders: &mut [DataLoader]) {
    if !loaders.iter().any(|l| l.has_upos) {
        loaders.iter_mut().for_each(|l| l.has_upos = true);
    }
    if !loaders.iter().any(|l| l.has_xpos) {
        loaders.iter_mut().for_each(|l| l.has_xpos = true);
    }
    if !loaders.iter().any(|l| l.has_feats) {
        loaders.iter_mut().for_each(|l| l.has_feats = true);
    }
}

/// Restores corpus order: `items[k]` belongs at position `orig_idx[k]`.
pub fn unsort<T>(items: Vec<T>, orig_idx: &[usize]) -> Vec<T> {
    let mut paired: Vec<(usize, T)> = orig_idx.iter().copied().zip(items).collect();
    paired.sort_by_key(|(idx, _)| *idx);
    paired.into_iter().map(|(_, item)| item).collect()
}

/// Fills batches up to `batch_size` tokens. A sentence that would overflow a
/// non-empty batch starts the next one, so an over-long sentence is alone.
fn chunk(encoded: Vec<(usize, EncodedSentence)>, batch_size: usize, fingerprint: u64) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = Batch {
        sentences: Vec::new(),
        orig_idx: Vec::new(),
        vocab_fingerprint: fingerprint,
    };
    let mut current_len = 0;

    for (idx, sentence) in encoded {
        let len = sentence.len();
        if len + current_len > batch_size && current_len > 0 {
            batches.push(std::mem::replace(
                &mut current,
                Batch {
                    sentences: Vec::new(),
                    orig_idx: Vec::new(),
                    vocab_fingerprint: fingerprint,
                },
            ));
            current_len = 0;
        }
        current.sentences.push(sentence);
        current.orig_idx.push(idx);
        current_len += len;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conllu::Token;

    fn corpus(lengths: &[usize]) -> Document {
        Document::new(
            lengths
                .iter()
                .enumerate()
                .map(|(s, &n)| {
                    Sentence::new(
                        (1..=n)
                            .map(|i| {
                                Token::new(i, format!("w{s}_{i}"))
                                    .with_upos("NOUN")
                                    .with_arc(i - 1, "dep")
                            })
                            .collect(),
                    )
                })
                .collect(),
        )
    }

    fn eval_loader(lengths: &[usize], batch_size: usize) -> DataLoader {
        DataLoader::new(
            corpus(lengths),
            batch_size,
            &LoaderOptions::default(),
            None,
            None,
            true,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_unsort_roundtrip() {
        let lengths = [3, 7, 1, 4, 4, 9, 2, 5];
        let loader = eval_loader(&lengths, 8);

        // longest first, ties in corpus order
        assert_eq!(loader.batches()[0].orig_idx, vec![5]);
        assert_eq!(loader.batches()[3].orig_idx, vec![3, 4]);

        let flat: Vec<usize> = loader
            .batches()
            .iter()
            .flat_map(|b| b.sentences.iter().map(EncodedSentence::len))
            .collect();
        assert_eq!(unsort(flat, &loader.orig_idx()), lengths);
    }

    #[test]
    fn test_token_budget() {
        let loader = eval_loader(&[2, 2, 2, 2, 2], 5);
        assert!(loader.batches().iter().all(|b| b.num_tokens() <= 5));
        assert_eq!(loader.len(), 3);
    }

    #[test]
    fn test_overlong_sentence_is_alone() {
        let loader = eval_loader(&[20, 1, 1], 5);
        assert_eq!(loader.batches()[0].len(), 1);
        assert_eq!(loader.batches()[0].num_tokens(), 20);
        assert_eq!(loader.batches()[1].num_tokens(), 2);
    }

    #[test]
    fn test_empty_corpus_has_no_batches() {
        let loader = eval_loader(&[], 10);
        assert!(loader.is_empty());
        assert_eq!(loader.num_examples(), 0);
    }

    #[test]
    fn test_training_reshuffle_keeps_every_sentence() {
        let lengths: Vec<usize> = (1..=30).collect();
        let options = LoaderOptions::default().with_augment_nopunct(Some(0.0));
        let mut loader =
            DataLoader::new(corpus(&lengths), 40, &options, None, None, false, false).unwrap();

        for _ in 0..3 {
            let mut seen = loader.orig_idx();
            seen.sort_unstable();
            assert_eq!(seen, (0..30).collect::<Vec<_>>());
            assert!(loader.batches().iter().all(|b| b.num_tokens() <= 40 || b.len() == 1));
            loader.reshuffle();
        }
    }

    #[test]
    fn test_sample_train_keeps_floor() {
        let options = LoaderOptions::default()
            .with_sample_train(0.25)
            .with_augment_nopunct(Some(0.0));
        let loader = DataLoader::new(corpus(&[1; 10]), 100, &options, None, None, false, false)
            .unwrap();
        assert_eq!(loader.num_examples(), 2);
    }

    #[test]
    fn test_sample_train_draws_from_augmented_corpus() {
        let mut doc = corpus(&[2; 10]);
        for sentence in &mut doc.sentences {
            let last = sentence.tokens.last_mut().unwrap();
            last.form = ".".into();
            last.upos = Some("PUNCT".into());
        }
        let options = LoaderOptions::default()
            .with_sample_train(0.5)
            .with_augment_nopunct(Some(0.5));
        let mut loader = DataLoader::new(doc, 100, &options, None, None, false, false).unwrap();

        // 10 + 5 augmented, then half of 15
        assert_eq!(loader.num_examples(), 7);
        for _ in 0..3 {
            let in_batches: usize = loader.batches().iter().map(Batch::len).sum();
            assert_eq!(in_batches, 7);
            loader.reshuffle();
        }
    }

    #[test]
    fn test_same_seed_same_batches() {
        let lengths: Vec<usize> = (1..=12).collect();
        let build = || {
            DataLoader::new(corpus(&lengths), 10, &LoaderOptions::default(), None, None, false, false)
                .unwrap()
        };
        assert_eq!(build().batches(), build().batches());
    }

    #[test]
    fn test_column_flags_and_reconcile() {
        let mut loaders = vec![eval_loader(&[2], 10), eval_loader(&[3], 10)];
        assert!(loaders[0].has_upos);
        assert!(!loaders[0].has_xpos);

        reconcile_columns(&mut loaders);
        assert!(loaders.iter().all(|l| l.has_xpos && l.has_feats));
    }

    #[test]
    fn test_vocab_mismatch() {
        let loader = eval_loader(&[2], 10);
        let other = Vocab::build(&[corpus(&[5])], 1, VocabPolicy::Union).unwrap();
        let err = loader.batches()[0].check_vocab(&other).unwrap_err();
        assert!(matches!(err, ArborError::VocabMismatch { .. }));
        assert!(loader.batches()[0].check_vocab(loader.vocab()).is_ok());
    }
}
