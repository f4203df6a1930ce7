use std::sync::Arc;

use arbor_core::{DataLoader, Document, LoaderOptions, Sentence, Token, Vocab, VocabPolicy};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn corpus(sentences: usize) -> Document {
    Document::new(
        (0..sentences)
            .map(|s| {
                let len = 5 + s % 40;
                Sentence::new(
                    (1..=len)
                        .map(|i| {
                            Token::new(i, format!("word{}", (s * 7 + i) % 500))
                                .with_upos(if i % 3 == 0 { "VERB" } else { "NOUN" })
                                .with_arc(i - 1, "dep")
                        })
                        .collect(),
                )
            })
            .collect(),
    )
}

fn bench_batching(c: &mut Criterion) {
    let doc = corpus(2000);
    let vocab = Arc::new(Vocab::build(std::slice::from_ref(&doc), 2, VocabPolicy::Union).unwrap());
    let options = LoaderOptions::default().with_augment_nopunct(Some(0.0));

    c.bench_function("vocab_build_2000", |b| {
        b.iter(|| Vocab::build(black_box(std::slice::from_ref(&doc)), 2, VocabPolicy::Union).unwrap());
    });

    c.bench_function("eval_loader_2000", |b| {
        b.iter(|| {
            DataLoader::new(
                black_box(doc.clone()),
                5000,
                &options,
                None,
                Some(vocab.clone()),
                true,
                true,
            )
            .unwrap()
        });
    });

    let mut train =
        DataLoader::new(doc.clone(), 5000, &options, None, Some(vocab.clone()), false, false).unwrap();
    c.bench_function("reshuffle_2000", |b| {
        b.iter(|| train.reshuffle());
    });
}

criterion_group!(benches, bench_batching);
criterion_main!(benches);
