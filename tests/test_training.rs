use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tricrf::{
    Attribute, Crf, DataReader, Document, SequenceModel, Tagger, Token, TrainReport, Trainer,
    TriCrf1,
};

/// Labels follow a keyword; every token also carries random noise features
fn noisy_corpus(seed: u64, num_docs: usize) -> Vec<Document> {
    let mut rng = StdRng::seed_from_u64(seed);
    let labels = ["O", "B-city", "B-date"];
    let keywords = ["w=the", "w=city", "w=date"];
    (0..num_docs)
        .map(|_| {
            let len = rng.gen_range(2..6);
            let tokens = (0..len)
                .map(|_| {
                    let y = rng.gen_range(0..labels.len());
                    let attrs = vec![
                        Attribute::from(keywords[y]),
                        Attribute::new(format!("noise={}", rng.gen_range(0..20)), 1.0),
                    ];
                    Token::new(labels[y], attrs)
                })
                .collect();
            Document {
                topic: None,
                tokens,
            }
        })
        .collect()
}

fn accuracy(model: &Crf, docs: &[Document]) -> f64 {
    let mut tagger = Tagger::new(model);
    let (mut correct, mut total) = (0, 0);
    for doc in docs {
        let prediction = tagger.tag(doc).unwrap();
        for (p, g) in prediction.labels.iter().zip(doc.labels()) {
            correct += (p == g) as usize;
            total += 1;
        }
    }
    correct as f64 / total as f64
}

fn trainer_with(docs: &[Document], trainer: Trainer<Crf>) -> Trainer<Crf> {
    let mut trainer = trainer;
    for doc in docs {
        trainer.append_document(doc.clone()).unwrap();
    }
    trainer
}

#[test]
fn test_l2_training() {
    let docs = noisy_corpus(1, 30);
    let trainer = trainer_with(&docs, Trainer::crf().with_l2_prior(10.0).unwrap());
    let (model, report) = trainer.fit().unwrap();
    assert!(report.objective.is_finite());
    assert!(accuracy(&model, &docs) > 0.95);
}

#[test]
fn test_l1_training_is_sparse() {
    let docs = noisy_corpus(2, 30);
    let trainer = trainer_with(&docs, Trainer::crf().with_l1_prior(1.0).unwrap());
    let (model, _) = trainer.fit().unwrap();
    let zeros = model.weights().iter().filter(|w| **w == 0.0).count();
    assert!(zeros > 0, "OWL-QN left no exact zeros");
    assert!(accuracy(&model, &docs) > 0.9);
}

#[test]
fn test_pretrain_then_train() {
    let docs = noisy_corpus(3, 20);
    let mut trainer = trainer_with(&docs, Trainer::crf().with_pretraining(5).unwrap());
    trainer.prepare().unwrap();
    let pretrain = trainer.pretrain().unwrap();
    assert!(pretrain.iterations <= 5);
    assert!(pretrain.objective.is_finite());
    let after_pretraining = trainer.model().unwrap().weights().to_vec();
    assert!(after_pretraining.iter().any(|w| *w != 0.0));

    let train = trainer.train().unwrap();
    assert!(train.objective.is_finite());
    let model = trainer.finish().unwrap();
    assert!(accuracy(&model, &docs) > 0.95);
}

#[test]
fn test_tied_transitions() {
    let docs = noisy_corpus(4, 30);
    let trainer = trainer_with(
        &docs,
        Trainer::crf()
            .with_l2_prior(10.0)
            .unwrap()
            .with_tied_min_count(3.0)
            .unwrap(),
    );
    let (model, _) = trainer.fit().unwrap();
    assert!(accuracy(&model, &docs) > 0.95);

    // The saved model decodes exactly like the trained one
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    model.save(temp_file.path()).unwrap();
    let loaded = Crf::open(temp_file.path()).unwrap();
    let mut a = Tagger::new(&model);
    let mut b = Tagger::new(&loaded);
    for doc in &docs {
        let pa = a.tag(doc).unwrap();
        let pb = b.tag(doc).unwrap();
        assert_eq!(pa.labels, pb.labels);
        assert!((pa.probability - pb.probability).abs() < 1e-9);
    }
}

#[test]
fn test_active_threshold() {
    let docs = noisy_corpus(5, 30);
    let mut trainer = trainer_with(&docs, Trainer::crf().with_l2_prior(10.0).unwrap());
    trainer.set("active_threshold", "0.01").unwrap();
    let (model, _) = trainer.fit().unwrap();
    assert!(accuracy(&model, &docs) > 0.95);
}

#[test]
fn test_train_without_data() {
    let mut trainer = Trainer::<Crf>::new();
    assert!(trainer.train().is_err());
    assert!(Trainer::<Crf>::new().fit().is_err());
}

#[test]
fn test_append_clears_prepared_model() {
    let docs = noisy_corpus(6, 4);
    let mut trainer = trainer_with(&docs, Trainer::crf());
    trainer.prepare().unwrap();
    assert!(trainer.model().is_some());
    trainer.append_document(docs[0].clone()).unwrap();
    assert!(trainer.model().is_none());
    assert_eq!(trainer.num_documents(), 5);
}

fn assert_strictly_decreasing(report: &TrainReport) {
    assert!(report.history.len() >= 2);
    assert_eq!(report.history.len(), report.iterations);
    for pair in report.history.windows(2) {
        assert!(pair[1] < pair[0], "objective went from {} to {}", pair[0], pair[1]);
    }
    assert_eq!(report.history.last().copied(), Some(report.objective));
}

#[test]
fn test_crf_objective_decreases_every_iteration() {
    let docs = noisy_corpus(7, 20);
    let mut trainer = trainer_with(
        &docs,
        Trainer::crf()
            .with_l2_prior(10.0)
            .unwrap()
            .with_max_iterations(30)
            .unwrap(),
    );
    let report = trainer.train().unwrap();
    assert_strictly_decreasing(&report);
}

#[test]
fn test_tricrf1_objective_decreases_every_iteration() {
    let data = "\
flight w=show w=flights
O w=show
O w=flights
B-city w=boston

fare w=cost w=first
O w=cost
B-class w=first
B-city w=denver

flight w=flights w=to
O w=flights
O w=to
B-city w=denver
";
    let docs = DataReader::triangular().read(data.as_bytes()).unwrap();
    let mut trainer = Trainer::<TriCrf1>::new()
        .with_l2_prior(10.0)
        .unwrap()
        .with_max_iterations(30)
        .unwrap();
    for doc in docs {
        trainer.append_document(doc).unwrap();
    }
    let report = trainer.train().unwrap();
    assert_strictly_decreasing(&report);
}
