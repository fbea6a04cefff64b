use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tricrf::{Attribute, Document, Tagger, Token, TopicEvent, Trainer};

fn corpus(seed: u64, num_docs: usize, triangular: bool) -> Vec<Document> {
    let mut rng = StdRng::seed_from_u64(seed);
    let labels = ["O", "B-city", "I-city", "B-date", "B-class"];
    let topics = ["flight", "fare", "airline"];
    (0..num_docs)
        .map(|i| {
            let len = rng.gen_range(4..12);
            let tokens = (0..len)
                .map(|_| {
                    let y = rng.gen_range(0..labels.len());
                    let attrs = vec![
                        Attribute::new(format!("w={}", y * 10 + rng.gen_range(0..10)), 1.0),
                        Attribute::new(format!("n={}", rng.gen_range(0..50)), 0.5),
                    ];
                    Token::new(labels[y], attrs)
                })
                .collect();
            let doc = Document {
                topic: None,
                tokens,
            };
            if triangular {
                let z = i % topics.len();
                doc.with_topic(TopicEvent::new(
                    topics[z],
                    vec![Attribute::new(format!("t={}", z * 5 + rng.gen_range(0..5)), 1.0)],
                ))
            } else {
                doc
            }
        })
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("tag");

    group.bench_function("crf", |b| {
        let docs = corpus(1, 50, false);
        let mut trainer = Trainer::crf().with_max_iterations(20).unwrap();
        for doc in &docs {
            trainer.append_document(doc.clone()).unwrap();
        }
        let (model, _) = trainer.fit().unwrap();
        let mut tagger = Tagger::new(&model);
        b.iter(|| {
            for doc in &docs {
                let _res = tagger.tag(black_box(doc)).unwrap();
            }
        })
    });

    group.bench_function("tricrf1", |b| {
        let docs = corpus(2, 50, true);
        let mut trainer = Trainer::tricrf1().with_max_iterations(20).unwrap();
        for doc in &docs {
            trainer.append_document(doc.clone()).unwrap();
        }
        let (model, _) = trainer.fit().unwrap();
        let mut tagger = Tagger::new(&model);
        b.iter(|| {
            for doc in &docs {
                let _res = tagger.tag(black_box(doc)).unwrap();
            }
        })
    });

    group.bench_function("tricrf2", |b| {
        let docs = corpus(3, 50, true);
        let mut trainer = Trainer::tricrf2().with_max_iterations(20).unwrap();
        for doc in &docs {
            trainer.append_document(doc.clone()).unwrap();
        }
        let (model, _) = trainer.fit().unwrap();
        let mut tagger = Tagger::new(&model);
        b.iter(|| {
            for doc in &docs {
                let _res = tagger.tag(black_box(doc)).unwrap();
            }
        })
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
